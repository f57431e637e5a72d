//! Per-device context and the lifecycle-owner API.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::arbiter::{self, Dispatch};
use crate::bus::{Bus, SpiTransport};
use crate::config::Config;
use crate::error::{DspError, Result};
use crate::ring::RingBuffer;
use crate::stream::{self, EngineState, HostBinding, PeriodListener, StreamId, StreamSlot};
use crate::watchdog::{self, DspMode, HealthState, ResetLine};
use crate::work::{DelayedWork, Next};

#[derive(Default)]
pub(crate) struct DspState {
    slots: [StreamSlot; 3],
    /// Mode most recently requested through `start`, restored after reset.
    pub last_mode: Option<DspMode>,
}

impl DspState {
    pub fn slot(&self, stream: StreamId) -> &StreamSlot {
        &self.slots[stream.index()]
    }

    pub fn slot_mut(&mut self, stream: StreamId) -> &mut StreamSlot {
        &mut self.slots[stream.index()]
    }
}

pub(crate) struct DeviceContext {
    pub config: Config,
    pub bus: Bus,
    pub reset_line: Option<Box<dyn ResetLine>>,
    pub register_cache_dirty: AtomicBool,
    /// Consecutive failed watchdog status reads.
    pub status_failures: AtomicU32,
    state: Mutex<DspState>,
    health: AtomicU8,
    copy_work: [DelayedWork; 3],
    wake: Arc<Notify>,
}

impl DeviceContext {
    pub fn lock_state(&self) -> MutexGuard<'_, DspState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_health(&self, health: HealthState) {
        self.health.store(health as u8, Ordering::Release);
    }

    pub fn copy_work(&self, stream: StreamId) -> &DelayedWork {
        &self.copy_work[stream.index()]
    }

    /// Runs blocking hardware access on the blocking pool so the bus lock
    /// and the link never stall a runtime worker.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&DeviceContext) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.clone();
        tokio::task::spawn_blocking(move || f(&ctx))
            .await
            .map_err(|e| DspError::Transport(io::Error::other(e)))?
    }
}

/// What a wake ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The watchdog found a fault and reset the device; dispatch was skipped.
    Recovered,
    Dispatched(Dispatch),
}

/// Handle to one physical coprocessor. Cheap to clone.
#[derive(Clone)]
pub struct DspDevice {
    ctx: Arc<DeviceContext>,
}

impl DspDevice {
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, transport: Box<dyn SpiTransport>) -> Result<Self> {
        Self::with_reset_line(config, transport, None)
    }

    pub fn with_reset_line(
        config: Config,
        transport: Box<dyn SpiTransport>,
        reset_line: Option<Box<dyn ResetLine>>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| DspError::NoRuntime)?;
        let bus = Bus::new(transport, config.bus.mtu);

        let ctx = Arc::new_cyclic(|weak: &Weak<DeviceContext>| {
            let copy_work = StreamId::ALL.map(|id| {
                let weak = weak.clone();
                DelayedWork::new(format!("copy-{}", id), runtime.clone(), move || {
                    match weak.upgrade() {
                        Some(ctx) => stream::copy_tick(&ctx, id),
                        None => Next::Done,
                    }
                })
            });
            DeviceContext {
                config,
                bus,
                reset_line,
                register_cache_dirty: AtomicBool::new(false),
                status_failures: AtomicU32::new(0),
                state: Mutex::new(DspState::default()),
                health: AtomicU8::new(HealthState::Running as u8),
                copy_work,
                wake: Arc::new(Notify::new()),
            }
        });
        Ok(Self { ctx })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Raw bus access, for diagnostics and bring-up tooling.
    pub fn bus(&self) -> &Bus {
        &self.ctx.bus
    }

    // ---- host framework side ----

    /// Binds a host buffer of `buffer_bytes` to `stream`. Raw capture starts
    /// looking for device geometry right away.
    pub fn attach(
        &self,
        stream: StreamId,
        buffer_bytes: usize,
        listener: Arc<dyn PeriodListener>,
    ) -> Result<()> {
        if buffer_bytes == 0 || buffer_bytes % 8 != 0 {
            return Err(DspError::OperatorMisuse {
                stream,
                reason: "host buffer must be a non-zero multiple of 8 bytes",
            });
        }
        {
            let mut state = self.ctx.lock_state();
            let slot = state.slot_mut(stream);
            if slot.binding.is_some() {
                return Err(DspError::OperatorMisuse {
                    stream,
                    reason: "host binding already attached",
                });
            }
            slot.binding = Some(HostBinding::new(buffer_bytes, listener));
        }
        log::info!("{}: host buffer of {} bytes attached", stream, buffer_bytes);

        if !stream.is_triggered() {
            self.ctx.copy_work(stream).schedule(Duration::ZERO);
        }
        Ok(())
    }

    /// Finishes parameter negotiation for `stream`.
    pub fn set_period_bytes(&self, stream: StreamId, period_bytes: usize) -> Result<()> {
        let mut state = self.ctx.lock_state();
        let Some(binding) = state.slot_mut(stream).binding.as_mut() else {
            return Err(DspError::OperatorMisuse {
                stream,
                reason: "no host binding",
            });
        };
        if period_bytes % 8 != 0 || period_bytes > binding.buffer_bytes() {
            return Err(DspError::OperatorMisuse {
                stream,
                reason: "period must be a multiple of 8 no larger than the host buffer",
            });
        }
        binding.set_period_bytes(period_bytes);
        Ok(())
    }

    /// Tears the binding down. Any pending or running tick is cancelled and
    /// waited for before shared state changes.
    pub async fn detach(&self, stream: StreamId) {
        self.ctx.copy_work(stream).cancel_sync().await;
        let mut state = self.ctx.lock_state();
        let slot = state.slot_mut(stream);
        if slot.binding.take().is_some() {
            log::info!("{}: host buffer detached", stream);
        }
        slot.deactivate();
    }

    /// Offset the next period will be written at.
    pub fn host_pointer(&self, stream: StreamId) -> Option<usize> {
        self.ctx
            .lock_state()
            .slot(stream)
            .binding
            .as_ref()
            .map(HostBinding::pointer)
    }

    // ---- device lifecycle owner ----

    /// Puts the DSP into the function `stream` needs and remembers it for
    /// recovery.
    pub async fn start(&self, stream: StreamId) -> Result<()> {
        let mode = stream.mode();
        watchdog::apply_mode(&self.ctx, mode).await?;
        self.ctx.lock_state().last_mode = Some(mode);
        if !stream.is_triggered() {
            self.ctx.copy_work(stream).schedule(Duration::ZERO);
        }
        log::info!("{}: started ({:?})", stream, mode);
        Ok(())
    }

    pub async fn stop(&self, stream: StreamId) {
        self.ctx.copy_work(stream).cancel_sync().await;
        let owned_mode = {
            let mut state = self.ctx.lock_state();
            state.slot_mut(stream).deactivate();
            let owned = state.last_mode == Some(stream.mode());
            if owned {
                state.last_mode = None;
            }
            owned
        };
        if owned_mode {
            if let Err(e) = watchdog::apply_mode(&self.ctx, DspMode::Suspend).await {
                log::warn!("{}: suspending dsp failed: {}", stream, e);
            }
        }
        log::info!("{}: stopped", stream);
    }

    /// Interrupt-side entry point; coalesces until the dispatcher runs.
    pub fn wake(&self) {
        self.ctx.wake.notify_one();
    }

    /// Watchdog check, then trigger dispatch unless the watchdog reset the
    /// device.
    pub async fn handle_wake(&self) -> WakeOutcome {
        if watchdog::check(&self.ctx).await {
            return WakeOutcome::Recovered;
        }
        WakeOutcome::Dispatched(arbiter::dispatch(&self.ctx).await)
    }

    /// Runs [`handle_wake`](Self::handle_wake) for every [`wake`](Self::wake).
    /// The task ends once every `DspDevice` handle is dropped.
    pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let wake = self.ctx.wake.clone();
        let weak = Arc::downgrade(&self.ctx);
        tokio::spawn(async move {
            loop {
                wake.notified().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                let retry = ctx.config.capture.fallback_interval();
                let outcome = DspDevice { ctx }.handle_wake().await;
                log::debug!("wake handled: {:?}", outcome);
                if outcome == WakeOutcome::Dispatched(Dispatch::BusError) {
                    // A flag may still be set and its edge will not come again.
                    let wake = wake.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(retry).await;
                        wake.notify_one();
                    });
                }
            }
        })
    }

    pub async fn reset_and_restart_active_stream(&self) -> Result<()> {
        watchdog::recover(&self.ctx).await
    }

    // ---- introspection ----

    pub fn engine_state(&self, stream: StreamId) -> EngineState {
        self.ctx.lock_state().slot(stream).state()
    }

    pub fn ring(&self, stream: StreamId) -> Option<RingBuffer> {
        self.ctx.lock_state().slot(stream).ring
    }

    pub fn health(&self) -> HealthState {
        self.ctx.health()
    }

    pub fn copy_pending(&self, stream: StreamId) -> bool {
        self.ctx.copy_work(stream).is_pending()
    }

    pub fn last_mode(&self) -> Option<DspMode> {
        self.ctx.lock_state().last_mode
    }

    /// True once after every device reset; codec register caches must be
    /// written back before they are trusted again.
    pub fn take_register_cache_dirty(&self) -> bool {
        self.ctx.register_cache_dirty.swap(false, Ordering::AcqRel)
    }
}
