use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    bus: Bus,
    dsp: Dsp,
    capture: Capture,
    bridge: Bridge,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Bus {
    spi_device: String,
    speed_hz: u32,
    mtu: usize,
}

#[derive(Deserialize)]
struct Dsp {
    hotword_flag: u32,
    musdet_flag: u32,
    voice_base: u32,
    voice_limit: u32,
    voice_wp: u32,
    music_base: u32,
    music_limit: u32,
    music_wp: u32,
    adc_base: u32,
    adc_limit: u32,
    adc_wp: u32,
    watchdog_status: u32,
    dsp_func: u32,
    wov_type: u32,
    dsp_cmd: u32,
    dsp_run: u32,
    dsp_run_value: u32,
    debug_ring: u32,
    debug_ring_len: u32,
    live_tag_mask: u32,
    live_tag: u32,
    reset_gpio: String,
    wake_gpio: String,
}

#[derive(Deserialize)]
struct Capture {
    hotword_ignore_ms: u32,
    hotword_bytes_per_ms: u32,
    musdet_ignore_ms: u32,
    musdet_bytes_per_ms: u32,
    buffer_bytes: usize,
    period_bytes: usize,
    fast_interval_ms: u64,
    fallback_interval_ms: u64,
    geometry_retries: u32,
    geometry_retry_delay_ms: u64,
    watchdog_read_failures: u32,
    command_ack_polls: u32,
}

#[derive(Deserialize)]
struct Bridge {
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
}

fn env(key: &str, value: impl std::fmt::Display) {
    println!("cargo:rustc-env={}={}", key, value);
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    env("APP_NAME", &config.application.name);
    env("APP_VERSION", &config.application.version);

    // 总线配置
    env("BUS_SPI_DEVICE", &config.bus.spi_device);
    env("BUS_SPEED_HZ", config.bus.speed_hz);
    env("BUS_MTU", config.bus.mtu);

    // DSP 寄存器地址
    let d = &config.dsp;
    env("DSP_HOTWORD_FLAG", d.hotword_flag);
    env("DSP_MUSDET_FLAG", d.musdet_flag);
    env("DSP_VOICE_BASE", d.voice_base);
    env("DSP_VOICE_LIMIT", d.voice_limit);
    env("DSP_VOICE_WP", d.voice_wp);
    env("DSP_MUSIC_BASE", d.music_base);
    env("DSP_MUSIC_LIMIT", d.music_limit);
    env("DSP_MUSIC_WP", d.music_wp);
    env("DSP_ADC_BASE", d.adc_base);
    env("DSP_ADC_LIMIT", d.adc_limit);
    env("DSP_ADC_WP", d.adc_wp);
    env("DSP_WATCHDOG_STATUS", d.watchdog_status);
    env("DSP_FUNC", d.dsp_func);
    env("DSP_WOV_TYPE", d.wov_type);
    env("DSP_CMD", d.dsp_cmd);
    env("DSP_RUN", d.dsp_run);
    env("DSP_RUN_VALUE", d.dsp_run_value);
    env("DSP_DEBUG_RING", d.debug_ring);
    env("DSP_DEBUG_RING_LEN", d.debug_ring_len);
    env("DSP_LIVE_TAG_MASK", d.live_tag_mask);
    env("DSP_LIVE_TAG", d.live_tag);
    env("DSP_RESET_GPIO", &d.reset_gpio);
    env("DSP_WAKE_GPIO", &d.wake_gpio);

    // 采集配置
    let c = &config.capture;
    env("CAPTURE_HOTWORD_IGNORE_MS", c.hotword_ignore_ms);
    env("CAPTURE_HOTWORD_BYTES_PER_MS", c.hotword_bytes_per_ms);
    env("CAPTURE_MUSDET_IGNORE_MS", c.musdet_ignore_ms);
    env("CAPTURE_MUSDET_BYTES_PER_MS", c.musdet_bytes_per_ms);
    env("CAPTURE_BUFFER_BYTES", c.buffer_bytes);
    env("CAPTURE_PERIOD_BYTES", c.period_bytes);
    env("CAPTURE_FAST_INTERVAL_MS", c.fast_interval_ms);
    env("CAPTURE_FALLBACK_INTERVAL_MS", c.fallback_interval_ms);
    env("CAPTURE_GEOMETRY_RETRIES", c.geometry_retries);
    env("CAPTURE_GEOMETRY_RETRY_DELAY_MS", c.geometry_retry_delay_ms);
    env("CAPTURE_WATCHDOG_READ_FAILURES", c.watchdog_read_failures);
    env("CAPTURE_COMMAND_ACK_POLLS", c.command_ack_polls);

    // PCM 转发
    env("BRIDGE_LOCAL_PORT", config.bridge.local_port);
    env("BRIDGE_REMOTE_IP", &config.bridge.remote_ip);
    env("BRIDGE_REMOTE_PORT", config.bridge.remote_port);
}
