//! Stream Arbiter / Trigger Dispatcher.
//!
//! Runs on every wake: figures out which detector fired, validates the
//! device buffer geometry and starts the matching copy engine.

use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceContext;
use crate::error::{DspError, Result};
use crate::ring::RingBuffer;
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Neither flag was raised.
    NoTrigger,
    /// A flag fired for a stream nobody can take right now.
    Refused(StreamId),
    /// Geometry never became valid within the retry budget.
    NotReady(StreamId),
    Started(StreamId),
    /// Flag registers could not be read or cleared.
    BusError,
}

/// Reads the trigger flags in priority order and consumes the winner.
fn take_trigger(ctx: &DeviceContext) -> Result<Option<StreamId>> {
    let layout = &ctx.config.layout;
    let hotword = ctx.bus.read_reg(layout.hotword_flag)?;
    let musdet = ctx.bus.read_reg(layout.musdet_flag)?;
    let stream = if hotword == 1 {
        StreamId::Hotword
    } else if musdet == 1 {
        StreamId::Musdet
    } else {
        return Ok(None);
    };
    if let Some(flag) = layout.flag(stream) {
        ctx.bus.write_reg(flag, 0)?;
    }
    Ok(Some(stream))
}

/// One attempt at reading base, limit and write pointer, each of which must
/// carry the live tag, and turning them into a startable ring.
pub(crate) fn read_geometry(ctx: &DeviceContext, stream: StreamId, skip: u32) -> Result<RingBuffer> {
    let regs = ctx.config.layout.ring(stream);
    let tag = ctx.config.layout.live_tag;
    let read = |addr: u32| -> Result<u32> {
        let value = ctx.bus.read_reg(addr)?;
        if tag.matches(value) {
            Ok(value)
        } else {
            Err(DspError::GeometryNotReady { stream, value })
        }
    };

    let base = read(regs.base)?;
    let limit = read(regs.limit)?;
    let write_ptr = read(regs.write_ptr)?;

    RingBuffer::from_geometry(base, limit, write_ptr, regs.write_ptr, skip)
        .filter(RingBuffer::is_startable)
        .ok_or(DspError::GeometryNotReady {
            stream,
            value: write_ptr,
        })
}

/// Flag access with the same bounded retry as geometry. The wake is an edge,
/// so giving up on a transient failure would strand a raised flag.
async fn poll_trigger(ctx: &Arc<DeviceContext>) -> Result<Option<StreamId>> {
    let capture = &ctx.config.capture;
    let attempts = capture.geometry_retries.max(1);
    let mut attempt = 1;
    loop {
        match ctx.run_blocking(take_trigger).await {
            Err(e) if e.is_transient() && attempt < attempts => {
                log::debug!("trigger flags: {} (attempt {}/{})", e, attempt, attempts);
                attempt += 1;
                tokio::time::sleep(capture.geometry_retry_delay()).await;
            }
            result => return result,
        }
    }
}

async fn acquire_geometry(ctx: &Arc<DeviceContext>, stream: StreamId) -> Option<RingBuffer> {
    let capture = &ctx.config.capture;
    let skip = capture.skip_bytes(stream);
    let attempts = capture.geometry_retries.max(1);
    for attempt in 1..=attempts {
        match ctx
            .run_blocking(move |ctx| read_geometry(ctx, stream, skip))
            .await
        {
            Ok(ring) => return Some(ring),
            Err(e) => log::debug!("{} (attempt {}/{})", e, attempt, attempts),
        }
        if attempt < attempts {
            tokio::time::sleep(capture.geometry_retry_delay()).await;
        }
    }
    None
}

pub(crate) async fn dispatch(ctx: &Arc<DeviceContext>) -> Dispatch {
    let stream = match poll_trigger(ctx).await {
        Ok(Some(stream)) => stream,
        Ok(None) => return Dispatch::NoTrigger,
        Err(e) => {
            log::warn!("trigger flag access failed: {}", e);
            return Dispatch::BusError;
        }
    };
    log::info!("{} trigger fired", stream);

    if let Err(e) = check_available(ctx, stream) {
        log::error!("{}", e);
        return Dispatch::Refused(stream);
    }

    let Some(ring) = acquire_geometry(ctx, stream).await else {
        log::warn!("{}: device buffer not ready, trigger dropped", stream);
        return Dispatch::NotReady(stream);
    };

    {
        let mut state = ctx.lock_state();
        let slot = state.slot_mut(stream);
        // The host may have gone away while geometry was being read.
        if slot.binding.is_none() || slot.ring.is_some() {
            log::warn!("{}: binding changed during start, trigger dropped", stream);
            return Dispatch::Refused(stream);
        }
        slot.activate(ring);
    }

    ctx.copy_work(stream).reschedule(Duration::ZERO).await;
    log::info!(
        "{}: streaming from {:#010x} (base {:#010x}, limit {:#010x}, {} bytes backlog)",
        stream,
        ring.read_ptr,
        ring.base,
        ring.limit,
        ring.size
    );
    Dispatch::Started(stream)
}

fn check_available(ctx: &DeviceContext, stream: StreamId) -> Result<()> {
    let state = ctx.lock_state();
    let slot = state.slot(stream);
    let reason = if slot.binding.is_none() {
        "trigger fired with no host binding"
    } else if slot.ring.is_some() {
        "trigger fired while already streaming"
    } else {
        return Ok(());
    };
    Err(DspError::OperatorMisuse { stream, reason })
}
