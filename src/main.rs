mod pcm_bridge;

use std::sync::Arc;
use std::time::Duration;

use dsp_stream_rs::bus::{SpiTransport, SpidevTransport};
use dsp_stream_rs::config::{Config, DspLayout};
use dsp_stream_rs::gpio::{SysfsResetLine, WakeWatcher};
use dsp_stream_rs::sim::SimDsp;
use dsp_stream_rs::{CapturedPeriod, DspDevice, PeriodListener, ResetLine, StreamId};
use pcm_bridge::PcmBridge;
use tokio::signal;
use tokio::sync::mpsc;

// 模拟模式下的设备环形缓冲区
const SIM_VOICE_BASE: u32 = 0x4fe0_0000;
const SIM_VOICE_LIMIT: u32 = 0x4fe1_0000;
const SIM_MUSIC_BASE: u32 = 0x4fe2_0000;
const SIM_MUSIC_LIMIT: u32 = 0x4fe3_0000;
// 16kHz 16bit 单声道，10ms
const SIM_CHUNK_BYTES: usize = 320;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    config.validate()?;
    log::info!("{} {} starting", config.app_name, config.app_version);

    // 打开总线，"sim" 使用内置模拟器
    let sim = (config.bus.spi_device == "sim").then(|| SimDsp::new(&config.layout));
    let transport: Box<dyn SpiTransport> = match &sim {
        Some(sim) => sim.transport(),
        None => Box::new(SpidevTransport::open(
            &config.bus.spi_device,
            config.bus.speed_hz,
        )?),
    };
    let reset_line = config
        .reset_gpio
        .as_deref()
        .map(|path| Box::new(SysfsResetLine::new(path)) as Box<dyn ResetLine>);

    let device = DspDevice::with_reset_line(config.clone(), transport, reset_line)?;
    let dispatcher = device.spawn_dispatcher();

    // 采集数据通道
    let (tx_period, rx_period) = mpsc::channel::<CapturedPeriod>(64);
    let listener: Arc<dyn PeriodListener> = Arc::new(tx_period);

    for stream in [StreamId::Hotword, StreamId::Musdet] {
        device.attach(stream, config.capture.buffer_bytes, listener.clone())?;
        device.set_period_bytes(stream, config.capture.period_bytes)?;
    }

    // 启动PCM桥
    let bridge = PcmBridge::new(&config).await?;
    let mut bridge_task = tokio::spawn(async move { bridge.run(rx_period).await });

    // 唤醒源：模拟器、GPIO 或者轮询
    let mut watcher = None;
    match (&sim, config.wake_gpio.as_deref()) {
        (Some(sim), _) => {
            tokio::spawn(simulate_firmware(
                sim.clone(),
                device.clone(),
                config.layout.clone(),
            ));
        }
        (None, Some(path)) => watcher = Some(WakeWatcher::spawn(path, device.clone())?),
        (None, None) => {
            log::warn!("No wake GPIO configured, polling for triggers");
            let device = device.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(100));
                loop {
                    ticker.tick().await;
                    device.wake();
                }
            });
        }
    }

    // 进入语音唤醒模式
    if let Err(e) = device.start(StreamId::Hotword).await {
        log::warn!("Failed to enter voice-trigger mode: {}", e);
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        res = &mut bridge_task => {
            match res {
                Ok(Err(e)) => log::error!("PcmBridge error: {}", e),
                Err(e) => log::error!("PcmBridge task failed: {}", e),
                Ok(Ok(())) => log::info!("PcmBridge finished"),
            }
        }
    }

    if let Some(mut watcher) = watcher {
        watcher.stop();
    }
    for stream in StreamId::ALL {
        device.stop(stream).await;
        device.detach(stream).await;
    }
    dispatcher.abort();
    Ok(())
}

/// 模拟固件：持续写入语音数据，一秒后触发一次唤醒词
async fn simulate_firmware(sim: SimDsp, device: DspDevice, layout: DspLayout) {
    sim.map_ring(layout.voice, SIM_VOICE_BASE, SIM_VOICE_LIMIT, SIM_VOICE_BASE);
    sim.map_ring(layout.music, SIM_MUSIC_BASE, SIM_MUSIC_LIMIT, SIM_MUSIC_BASE);

    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    let mut chunk = vec![0u8; SIM_CHUNK_BYTES];
    let mut phase: u16 = 0;
    for n in 0u64.. {
        ticker.tick().await;
        // 锯齿波
        for sample in chunk.chunks_exact_mut(2) {
            sample.copy_from_slice(&phase.to_le_bytes());
            phase = phase.wrapping_add(512);
        }
        sim.produce(layout.voice, &chunk);

        if n == 100 {
            log::info!("Simulated hotword trigger");
            sim.set_reg(layout.hotword_flag, 1);
            device.wake();
        }
    }
}
