//! Stream Copy Engine: moves one period per tick from a device ring into
//! the host buffer and tells the consumer about it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::arbiter;
use crate::device::DeviceContext;
use crate::ring::RingBuffer;
use crate::watchdog::{DspMode, HealthState};
use crate::work::Next;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamId {
    /// Voice-trigger audio, started by the hotword flag.
    Hotword,
    /// Secondary detector audio, started by the music-detect flag.
    Musdet,
    /// Raw ADC passthrough, armed by attaching a host binding.
    RawAdc,
}

impl StreamId {
    pub const ALL: [StreamId; 3] = [StreamId::Hotword, StreamId::Musdet, StreamId::RawAdc];

    pub fn index(self) -> usize {
        match self {
            StreamId::Hotword => 0,
            StreamId::Musdet => 1,
            StreamId::RawAdc => 2,
        }
    }

    pub fn is_triggered(self) -> bool {
        !matches!(self, StreamId::RawAdc)
    }

    /// DSP function the device runs while this stream is wanted.
    pub fn mode(self) -> DspMode {
        match self {
            StreamId::Hotword => DspMode::VoiceTrigger,
            StreamId::Musdet => DspMode::SecondaryDetector,
            StreamId::RawAdc => DspMode::RawPassthrough,
        }
    }

    /// Wire tag used by the PCM bridge.
    pub fn tag(self) -> u8 {
        self.index() as u8
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamId::Hotword => "hotword",
            StreamId::Musdet => "musdet",
            StreamId::RawAdc => "raw-adc",
        })
    }
}

/// A period that just landed in the host buffer.
#[derive(Debug, Clone)]
pub struct CapturedPeriod {
    pub stream: StreamId,
    /// Host buffer offset the period was written at.
    pub offset: usize,
    pub data: Bytes,
}

/// Consumer side of a host binding, told once per completed period.
pub trait PeriodListener: Send + Sync {
    fn period_elapsed(&self, period: CapturedPeriod);
}

impl PeriodListener for mpsc::UnboundedSender<CapturedPeriod> {
    fn period_elapsed(&self, period: CapturedPeriod) {
        if self.send(period).is_err() {
            log::debug!("period receiver dropped");
        }
    }
}

impl PeriodListener for mpsc::Sender<CapturedPeriod> {
    fn period_elapsed(&self, period: CapturedPeriod) {
        match self.try_send(period) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(p)) => {
                log::warn!("{}: consumer lagging, period at {} dropped", p.stream, p.offset)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => log::debug!("period receiver dropped"),
        }
    }
}

/// Host-side circular buffer plus its period size.
pub struct HostBinding {
    buffer: Vec<u8>,
    period_bytes: usize,
    write_offset: usize,
    listener: Arc<dyn PeriodListener>,
}

impl HostBinding {
    pub fn new(buffer_bytes: usize, listener: Arc<dyn PeriodListener>) -> Self {
        Self {
            buffer: vec![0; buffer_bytes],
            period_bytes: 0,
            write_offset: 0,
            listener,
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    pub fn set_period_bytes(&mut self, bytes: usize) {
        self.period_bytes = bytes;
    }

    /// Current write offset into the host buffer.
    pub fn pointer(&self) -> usize {
        self.write_offset
    }

    /// Stores `data` at the write offset (wrapping), advances the offset and
    /// notifies the listener.
    fn deliver(&mut self, stream: StreamId, data: Vec<u8>) {
        let len = self.buffer.len();
        let offset = self.write_offset;
        let head = data.len().min(len - offset);
        self.buffer[offset..offset + head].copy_from_slice(&data[..head]);
        let tail = (data.len() - head).min(len);
        self.buffer[..tail].copy_from_slice(&data[head..head + tail]);

        self.write_offset = (offset + data.len()) % len;

        self.listener.period_elapsed(CapturedPeriod {
            stream,
            offset,
            data: Bytes::from(data),
        });
    }
}

/// Per-stream state guarded by the device lock.
#[derive(Default)]
pub(crate) struct StreamSlot {
    pub binding: Option<HostBinding>,
    pub ring: Option<RingBuffer>,
    /// Bumped on every activation and teardown so a tick that raced either
    /// can tell its snapshot went stale.
    pub epoch: u64,
}

impl StreamSlot {
    pub fn state(&self) -> EngineState {
        match (&self.binding, &self.ring) {
            (_, Some(_)) => EngineState::Polling,
            (Some(_), None) => EngineState::Armed,
            (None, None) => EngineState::Idle,
        }
    }

    pub fn activate(&mut self, ring: RingBuffer) {
        self.ring = Some(ring);
        self.epoch += 1;
    }

    pub fn deactivate(&mut self) {
        self.ring = None;
        self.epoch += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// No host binding.
    Idle,
    /// Bound, waiting for a trigger or for geometry.
    Armed,
    /// Copying periods.
    Polling,
}

/// One copy-engine step for `stream`. Blocks on the bus; runs on the
/// blocking pool.
pub(crate) fn copy_tick(ctx: &DeviceContext, stream: StreamId) -> Next {
    let capture = &ctx.config.capture;
    let fast = Next::After(capture.fast_interval());
    let slow = Next::After(capture.fallback_interval());

    if ctx.health() != HealthState::Running {
        log::debug!("{}: device not running, holding off", stream);
        return slow;
    }

    let (snapshot, epoch, period) = {
        let mut state = ctx.lock_state();
        let slot = state.slot_mut(stream);
        if slot.binding.is_none() && slot.ring.is_none() {
            return Next::Done;
        }
        let period = slot.binding.as_ref().map_or(0, HostBinding::period_bytes);
        if period == 0 {
            log::debug!("{}: no period configured", stream);
            return slow;
        }
        let epoch = slot.epoch;
        match slot.ring.as_mut() {
            Some(ring) => {
                ring.align_to_period(period as u32);
                (Some(*ring), epoch, period)
            }
            None if stream.is_triggered() => return Next::Done,
            None => (None, epoch, period),
        }
    };

    let Some(mut ring) = snapshot else {
        return arm_raw(ctx, stream, epoch);
    };

    if ring.needs_producer_check() {
        let wp = match ctx.bus.read_reg(ring.write_ptr_addr) {
            Ok(wp) => wp,
            Err(e) => {
                log::warn!("{}: write pointer poll failed: {}", stream, e);
                return slow;
            }
        };
        if !ctx.config.layout.live_tag.matches(wp) {
            log::debug!("{}: write pointer {:#010x} not live", stream, wp);
            return slow;
        }
        if (ring.available(wp) as usize) < period {
            return slow;
        }
    }

    let Some(plan) = ring.plan_copy(period as u32) else {
        log::error!(
            "{}: period of {} bytes does not fit a {} byte device ring",
            stream,
            period,
            ring.capacity()
        );
        return slow;
    };

    let mut data = vec![0u8; period];
    let mut at = 0;
    for seg in plan.segments() {
        let len = seg.len as usize;
        if let Err(e) = ctx.bus.burst_read(seg.addr, &mut data[at..at + len]) {
            log::warn!("{}: burst read at {:#010x} failed: {}", stream, seg.addr, e);
            return slow;
        }
        at += len;
    }

    let mut state = ctx.lock_state();
    let slot = state.slot_mut(stream);
    match slot.ring.as_mut() {
        Some(current) if slot.epoch == epoch && current.read_ptr == ring.read_ptr => {
            current.commit(&plan);
            ring = *current;
        }
        _ => {
            log::debug!("{}: stream changed during transfer, period dropped", stream);
            return fast;
        }
    }
    if let Some(binding) = slot.binding.as_mut() {
        binding.deliver(stream, data);
    }
    log::trace!(
        "{}: period copied, read pointer now {:#010x}",
        stream,
        ring.read_ptr
    );
    fast
}

/// Raw capture has no trigger; it keeps trying to pick up geometry.
fn arm_raw(ctx: &DeviceContext, stream: StreamId, epoch: u64) -> Next {
    let capture = &ctx.config.capture;
    let ring = match arbiter::read_geometry(ctx, stream, capture.skip_bytes(stream)) {
        Ok(ring) => ring,
        Err(e) => {
            log::debug!("{}: {}", stream, e);
            return Next::After(capture.fallback_interval());
        }
    };

    let mut state = ctx.lock_state();
    let slot = state.slot_mut(stream);
    if slot.epoch == epoch && slot.ring.is_none() && slot.binding.is_some() {
        slot.activate(ring);
        log::info!(
            "{}: streaming from {:#010x} (base {:#010x}, limit {:#010x})",
            stream,
            ring.read_ptr,
            ring.base,
            ring.limit
        );
    }
    Next::After(capture.fast_interval())
}
