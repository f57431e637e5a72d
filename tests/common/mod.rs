#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dsp_stream_rs::config::{Config, DspLayout};
use dsp_stream_rs::sim::SimDsp;
use dsp_stream_rs::{CapturedPeriod, DspDevice, PeriodListener, ResetLine, StreamId};
use tokio::sync::mpsc;

pub const BASE: u32 = 0x4fe0_0000;
pub const LIMIT: u32 = 0x4fe1_0000;
pub const PERIOD: usize = 4096;
pub const HOST_BUFFER: usize = 4 * PERIOD;

pub fn config() -> Config {
    let mut config = Config::default();
    config.reset_gpio = None;
    config.wake_gpio = None;
    config.capture.hotword_skip.ignore_ms = 0;
    config.capture.musdet_skip.ignore_ms = 0;
    config.capture.fast_interval_ms = 10;
    config.capture.fallback_interval_ms = 50;
    config.capture.geometry_retries = 3;
    config.capture.geometry_retry_delay_ms = 5;
    config.capture.watchdog_read_failures = 3;
    config.capture.command_ack_polls = 10;
    config
}

pub struct Rig {
    pub sim: SimDsp,
    pub device: DspDevice,
    pub layout: DspLayout,
    pub rx: mpsc::UnboundedReceiver<CapturedPeriod>,
    pub listener: Arc<dyn PeriodListener>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(config(), None)
    }

    pub fn with(config: Config, reset_line: Option<Box<dyn ResetLine>>) -> Self {
        let layout = config.layout.clone();
        let sim = SimDsp::new(&layout);
        let device = DspDevice::with_reset_line(config, sim.transport(), reset_line).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sim,
            device,
            layout,
            rx,
            listener: Arc::new(tx),
        }
    }

    pub fn attach(&self, stream: StreamId) {
        self.device
            .attach(stream, HOST_BUFFER, self.listener.clone())
            .unwrap();
        self.device.set_period_bytes(stream, PERIOD).unwrap();
    }

    pub fn map(&self, stream: StreamId, base: u32, limit: u32, write_ptr: u32) {
        self.sim
            .map_ring(self.layout.ring(stream), base, limit, write_ptr);
    }

    pub fn raise(&self, stream: StreamId) {
        let flag = self.layout.flag(stream).unwrap();
        self.sim.set_reg(flag, 1);
    }

    pub fn drain(&mut self) -> Vec<CapturedPeriod> {
        let mut out = Vec::new();
        while let Ok(p) = self.rx.try_recv() {
            out.push(p);
        }
        out
    }
}

/// Deterministic non-trivial memory content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
