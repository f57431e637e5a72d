//! Watchdog / Health Monitor and DSP function control.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceContext;
use crate::error::{DspError, Result};
use crate::stream::StreamId;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    Running = 0,
    Suspect = 1,
    ResetInProgress = 2,
}

impl HealthState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthState::Running,
            1 => HealthState::Suspect,
            _ => HealthState::ResetInProgress,
        }
    }
}

const FUNC_WAKE_ON_VOICE: u32 = 0;
const FUNC_SUSPEND: u32 = 4;
const FUNC_I2S_PASSTHROUGH: u32 = 5;
const DSP_CMD_RUN: u32 = 1;

const ACK_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RESET_PULSE: Duration = Duration::from_millis(2);
const RUN_SETTLE: Duration = Duration::from_millis(10);
const RECOVERY_ATTEMPTS: u32 = 2;

/// Brings the DSP core back up when no reset line is wired.
const RESET_PATCH: [(u32, u32); 13] = [
    (0xfafa_fafa, 0x0000_0001),
    (0x1800_2000, 0x0000_10ec),
    (0x1800_2004, 0x0080_8f81),
    (0x1800_2008, 0x0077_0000),
    (0x1800_2f08, 0x0000_0006),
    (0x1800_2f10, 0x0000_0000),
    (0x1800_2f10, 0x0000_0001),
    (0xfafa_fafa, 0x0000_0000),
    (0x1800_1104, 0x0000_0007),
    (0x1800_1108, 0x0000_0000),
    (0x1800_110c, 0x0000_0000),
    (0x1800_1100, 0x0000_031f),
    (0x1800_2000, 0x0000_10ec),
];

// Dumped on fault.
const CLOCK_TABLE: [u32; 6] = [
    0x1800_2000,
    0x1800_2004,
    0x1800_2008,
    0x1800_2f00,
    0x1800_2f08,
    0x1800_2f10,
];
const CONTROL_TABLE: [u32; 8] = [
    0x1800_1014,
    0x1800_1018,
    0x1800_101c,
    0x1800_1030,
    0x1800_1100,
    0x1800_1104,
    0x1800_1108,
    0x1800_110c,
];

/// Function the DSP firmware runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DspMode {
    VoiceTrigger,
    SecondaryDetector,
    RawPassthrough,
    Suspend,
}

impl DspMode {
    pub fn func(self) -> u32 {
        match self {
            DspMode::VoiceTrigger | DspMode::SecondaryDetector => FUNC_WAKE_ON_VOICE,
            DspMode::RawPassthrough => FUNC_I2S_PASSTHROUGH,
            DspMode::Suspend => FUNC_SUSPEND,
        }
    }

    /// Detector enable mask written alongside the function.
    pub fn detectors(self) -> u32 {
        match self {
            DspMode::VoiceTrigger => 0x1,
            DspMode::SecondaryDetector => 0x2,
            DspMode::RawPassthrough | DspMode::Suspend => 0,
        }
    }
}

/// Hardware reset line of the coprocessor, active low.
pub trait ResetLine: Send + Sync {
    fn set_level(&self, high: bool) -> io::Result<()>;
}

#[derive(Debug, Serialize)]
pub struct RegisterValue {
    pub addr: u32,
    /// `None` when the read failed.
    pub value: Option<u32>,
}

/// Post-mortem snapshot of a faulted device.
#[derive(Debug, Serialize)]
pub struct DiagnosticDump {
    pub status: Option<u32>,
    pub debug_ring: Vec<u32>,
    pub clock: Vec<RegisterValue>,
    pub control: Vec<RegisterValue>,
}

fn read_table(ctx: &DeviceContext, table: &[u32]) -> Vec<RegisterValue> {
    table
        .iter()
        .map(|&addr| RegisterValue {
            addr,
            value: ctx.bus.read_reg(addr).ok(),
        })
        .collect()
}

pub(crate) fn collect_dump(ctx: &DeviceContext, status: Option<u32>) -> DiagnosticDump {
    let layout = &ctx.config.layout;
    let debug_ring = match ctx
        .bus
        .burst_read_vec(layout.debug_ring, layout.debug_ring_len as usize)
    {
        Ok(raw) => raw
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect(),
        Err(e) => {
            log::warn!("debug ring unreadable: {}", e);
            Vec::new()
        }
    };
    DiagnosticDump {
        status,
        debug_ring,
        clock: read_table(ctx, &CLOCK_TABLE),
        control: read_table(ctx, &CONTROL_TABLE),
    }
}

/// Runs on every wake before dispatch. Returns true when a fault was found
/// and handled, in which case dispatch is skipped for this wake.
pub(crate) async fn check(ctx: &Arc<DeviceContext>) -> bool {
    let threshold = ctx.config.capture.watchdog_read_failures.max(1);
    let status = match ctx
        .run_blocking(|ctx| ctx.bus.read_reg(ctx.config.layout.watchdog_status))
        .await
    {
        Ok(status) => {
            ctx.status_failures.store(0, Ordering::Relaxed);
            if status == 0 {
                return false;
            }
            Some(status)
        }
        Err(e) => {
            let failures = ctx.status_failures.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("watchdog status read failed ({}/{}): {}", failures, threshold, e);
            if failures < threshold {
                return false;
            }
            ctx.status_failures.store(0, Ordering::Relaxed);
            None
        }
    };

    match status {
        Some(status) => log::error!("{}, recovering", DspError::DeviceFault(status)),
        None => log::error!("health check hung, recovering"),
    }
    ctx.set_health(HealthState::Suspect);

    match ctx
        .run_blocking(move |ctx| Ok(collect_dump(ctx, status)))
        .await
    {
        Ok(dump) => match serde_json::to_string(&dump) {
            Ok(json) => log::error!("dsp dump: {}", json),
            Err(e) => log::warn!("dsp dump not serialisable: {}", e),
        },
        Err(e) => log::warn!("dsp dump not collected: {}", e),
    }

    if let Err(e) = recover(ctx).await {
        log::error!("recovery incomplete: {}", e);
    }
    true
}

async fn wait_command_ack(ctx: &Arc<DeviceContext>) -> Result<()> {
    let polls = ctx.config.capture.command_ack_polls.max(1);
    let mut value = 0;
    for _ in 0..polls {
        value = ctx
            .run_blocking(|ctx| ctx.bus.read_reg(ctx.config.layout.dsp_cmd))
            .await?;
        if value == 0 {
            return Ok(());
        }
        tokio::time::sleep(ACK_POLL_INTERVAL).await;
    }
    Err(DspError::DeviceFault(value))
}

/// Switches the DSP firmware function and waits for the acknowledgement.
pub(crate) async fn apply_mode(ctx: &Arc<DeviceContext>, mode: DspMode) -> Result<()> {
    ctx.run_blocking(move |ctx| {
        let layout = &ctx.config.layout;
        ctx.bus.write_regs(&[
            (layout.wov_type, mode.detectors()),
            (layout.dsp_func, mode.func()),
            (layout.dsp_cmd, DSP_CMD_RUN),
        ])
    })
    .await?;
    wait_command_ack(ctx).await?;
    log::debug!("dsp mode {:?} applied", mode);
    Ok(())
}

fn set_reset_level(ctx: &DeviceContext, high: bool) -> Result<()> {
    if let Some(line) = &ctx.reset_line {
        line.set_level(high)?;
    }
    Ok(())
}

async fn reset_device(ctx: &Arc<DeviceContext>) -> Result<()> {
    if ctx.reset_line.is_some() {
        ctx.run_blocking(|ctx| set_reset_level(ctx, false)).await?;
        tokio::time::sleep(RESET_PULSE).await;
        ctx.run_blocking(|ctx| set_reset_level(ctx, true)).await?;
    } else {
        ctx.run_blocking(|ctx| ctx.bus.write_regs(&RESET_PATCH)).await?;
    }
    ctx.register_cache_dirty.store(true, Ordering::Release);

    ctx.run_blocking(|ctx| {
        let layout = &ctx.config.layout;
        ctx.bus.write_reg(layout.dsp_run, layout.dsp_run_value)
    })
    .await?;
    tokio::time::sleep(RUN_SETTLE).await;
    Ok(())
}

async fn restart(ctx: &Arc<DeviceContext>, mode: DspMode) -> Result<()> {
    reset_device(ctx).await?;
    apply_mode(ctx, mode).await
}

/// Resets the device and puts back whatever mode was last requested.
pub(crate) async fn recover(ctx: &Arc<DeviceContext>) -> Result<()> {
    ctx.set_health(HealthState::ResetInProgress);

    for stream in StreamId::ALL {
        ctx.copy_work(stream).cancel_sync().await;
    }
    let (mode, raw_bound) = {
        let mut state = ctx.lock_state();
        for stream in StreamId::ALL {
            state.slot_mut(stream).deactivate();
        }
        (
            state.last_mode,
            state.slot(StreamId::RawAdc).binding.is_some(),
        )
    };

    let mut result: Result<()> = Ok(());
    for attempt in 1..=RECOVERY_ATTEMPTS {
        result = restart(ctx, mode.unwrap_or(DspMode::Suspend)).await;
        match &result {
            Ok(()) => break,
            Err(e) => log::warn!("recovery attempt {}/{} failed: {}", attempt, RECOVERY_ATTEMPTS, e),
        }
    }

    ctx.set_health(HealthState::Running);
    if raw_bound {
        ctx.copy_work(StreamId::RawAdc).schedule(Duration::ZERO);
    }
    match mode {
        Some(mode) => log::info!("device reset, {:?} re-applied", mode),
        None => log::info!("device reset, no mode to restore"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_starts_and_ends_on_vendor_id() {
        assert_eq!(RESET_PATCH[1], (0x1800_2000, 0x10ec));
        assert_eq!(RESET_PATCH[12], (0x1800_2000, 0x10ec));
    }

    #[test]
    fn mode_codes() {
        assert_eq!(DspMode::VoiceTrigger.func(), 0);
        assert_eq!(DspMode::SecondaryDetector.detectors(), 2);
        assert_eq!(DspMode::RawPassthrough.func(), 5);
        assert_eq!(DspMode::Suspend.func(), 4);
    }

    #[test]
    fn health_round_trips_through_u8() {
        for h in [
            HealthState::Running,
            HealthState::Suspect,
            HealthState::ResetInProgress,
        ] {
            assert_eq!(HealthState::from_u8(h as u8), h);
        }
    }
}
