use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DspError, Result};
use crate::ring::LiveTag;
use crate::stream::StreamId;

macro_rules! parse_env {
    ($key:literal) => {
        env!($key)
            .parse()
            .map_err(|_| concat!("Failed to parse ", $key))?
    };
}

/// Register triplet describing one device-side ring buffer.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct RingRegisters {
    pub base: u32,
    pub limit: u32,
    pub write_ptr: u32,
}

/// Register map of one coprocessor hardware revision.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DspLayout {
    pub hotword_flag: u32,
    pub musdet_flag: u32,
    pub voice: RingRegisters,
    pub music: RingRegisters,
    pub adc: RingRegisters,
    pub watchdog_status: u32,
    pub dsp_func: u32,
    pub wov_type: u32,
    /// Command/ack register; the DSP clears it once a command is taken.
    pub dsp_cmd: u32,
    pub dsp_run: u32,
    pub dsp_run_value: u32,
    pub debug_ring: u32,
    pub debug_ring_len: u32,
    pub live_tag: LiveTag,
}

impl DspLayout {
    pub fn ring(&self, stream: StreamId) -> RingRegisters {
        match stream {
            StreamId::Hotword => self.voice,
            StreamId::Musdet => self.music,
            StreamId::RawAdc => self.adc,
        }
    }

    /// Flag register for the trigger-driven streams.
    pub fn flag(&self, stream: StreamId) -> Option<u32> {
        match stream {
            StreamId::Hotword => Some(self.hotword_flag),
            StreamId::Musdet => Some(self.musdet_flag),
            StreamId::RawAdc => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusConfig {
    pub spi_device: String,
    pub speed_hz: u32,
    /// Largest single burst chunk, must be a multiple of 8.
    pub mtu: usize,
}

/// Skip window of a trigger-driven stream.
///
/// Bytes-per-ms is explicit per stream: the two detectors do not share a
/// sample geometry on every board, so it has to be validated per deployment.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct SkipWindow {
    pub ignore_ms: u32,
    pub bytes_per_ms: u32,
}

impl SkipWindow {
    pub fn bytes(&self) -> u32 {
        self.ignore_ms.saturating_mul(self.bytes_per_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    pub hotword_skip: SkipWindow,
    pub musdet_skip: SkipWindow,
    pub buffer_bytes: usize,
    pub period_bytes: usize,
    pub fast_interval_ms: u64,
    pub fallback_interval_ms: u64,
    pub geometry_retries: u32,
    pub geometry_retry_delay_ms: u64,
    pub watchdog_read_failures: u32,
    pub command_ack_polls: u32,
}

impl CaptureConfig {
    pub fn skip_bytes(&self, stream: StreamId) -> u32 {
        match stream {
            StreamId::Hotword => self.hotword_skip.bytes(),
            StreamId::Musdet => self.musdet_skip.bytes(),
            StreamId::RawAdc => 0,
        }
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn geometry_retry_delay(&self) -> Duration {
        Duration::from_millis(self.geometry_retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
}

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 总线
    pub bus: BusConfig,

    // DSP 寄存器布局
    pub layout: DspLayout,

    // GPIO（空字符串表示未连接）
    pub reset_gpio: Option<String>,
    pub wake_gpio: Option<String>,

    // 采集
    pub capture: CaptureConfig,

    // PCM 转发
    pub bridge: BridgeConfig,
}

fn optional_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> std::result::Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            bus: BusConfig {
                spi_device: env!("BUS_SPI_DEVICE").to_string(),
                speed_hz: parse_env!("BUS_SPEED_HZ"),
                mtu: parse_env!("BUS_MTU"),
            },

            layout: DspLayout {
                hotword_flag: parse_env!("DSP_HOTWORD_FLAG"),
                musdet_flag: parse_env!("DSP_MUSDET_FLAG"),
                voice: RingRegisters {
                    base: parse_env!("DSP_VOICE_BASE"),
                    limit: parse_env!("DSP_VOICE_LIMIT"),
                    write_ptr: parse_env!("DSP_VOICE_WP"),
                },
                music: RingRegisters {
                    base: parse_env!("DSP_MUSIC_BASE"),
                    limit: parse_env!("DSP_MUSIC_LIMIT"),
                    write_ptr: parse_env!("DSP_MUSIC_WP"),
                },
                adc: RingRegisters {
                    base: parse_env!("DSP_ADC_BASE"),
                    limit: parse_env!("DSP_ADC_LIMIT"),
                    write_ptr: parse_env!("DSP_ADC_WP"),
                },
                watchdog_status: parse_env!("DSP_WATCHDOG_STATUS"),
                dsp_func: parse_env!("DSP_FUNC"),
                wov_type: parse_env!("DSP_WOV_TYPE"),
                dsp_cmd: parse_env!("DSP_CMD"),
                dsp_run: parse_env!("DSP_RUN"),
                dsp_run_value: parse_env!("DSP_RUN_VALUE"),
                debug_ring: parse_env!("DSP_DEBUG_RING"),
                debug_ring_len: parse_env!("DSP_DEBUG_RING_LEN"),
                live_tag: LiveTag {
                    mask: parse_env!("DSP_LIVE_TAG_MASK"),
                    pattern: parse_env!("DSP_LIVE_TAG"),
                },
            },

            reset_gpio: optional_path(env!("DSP_RESET_GPIO")),
            wake_gpio: optional_path(env!("DSP_WAKE_GPIO")),

            capture: CaptureConfig {
                hotword_skip: SkipWindow {
                    ignore_ms: parse_env!("CAPTURE_HOTWORD_IGNORE_MS"),
                    bytes_per_ms: parse_env!("CAPTURE_HOTWORD_BYTES_PER_MS"),
                },
                musdet_skip: SkipWindow {
                    ignore_ms: parse_env!("CAPTURE_MUSDET_IGNORE_MS"),
                    bytes_per_ms: parse_env!("CAPTURE_MUSDET_BYTES_PER_MS"),
                },
                buffer_bytes: parse_env!("CAPTURE_BUFFER_BYTES"),
                period_bytes: parse_env!("CAPTURE_PERIOD_BYTES"),
                fast_interval_ms: parse_env!("CAPTURE_FAST_INTERVAL_MS"),
                fallback_interval_ms: parse_env!("CAPTURE_FALLBACK_INTERVAL_MS"),
                geometry_retries: parse_env!("CAPTURE_GEOMETRY_RETRIES"),
                geometry_retry_delay_ms: parse_env!("CAPTURE_GEOMETRY_RETRY_DELAY_MS"),
                watchdog_read_failures: parse_env!("CAPTURE_WATCHDOG_READ_FAILURES"),
                command_ack_polls: parse_env!("CAPTURE_COMMAND_ACK_POLLS"),
            },

            bridge: BridgeConfig {
                local_port: parse_env!("BRIDGE_LOCAL_PORT"),
                remote_ip: env!("BRIDGE_REMOTE_IP").to_string(),
                remote_port: parse_env!("BRIDGE_REMOTE_PORT"),
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.mtu == 0 || self.bus.mtu % 8 != 0 {
            return Err(DspError::Config(format!(
                "bus mtu {} must be a non-zero multiple of 8",
                self.bus.mtu
            )));
        }
        if self.layout.debug_ring_len % 8 != 0 {
            return Err(DspError::Config(format!(
                "debug ring length {} must be a multiple of 8",
                self.layout.debug_ring_len
            )));
        }
        if self.capture.geometry_retries == 0 {
            return Err(DspError::Config("geometry_retries must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
