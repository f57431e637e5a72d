//! Host-side streaming core for an SPI-attached audio DSP coprocessor.
//!
//! The [`DspDevice`] owns the bus, one copy engine per capture stream, the
//! trigger arbiter and the watchdog.

pub mod arbiter;
pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod gpio;
pub mod ring;
pub mod sim;
pub mod stream;
pub mod watchdog;
pub mod work;

pub use arbiter::Dispatch;
pub use config::Config;
pub use device::{DspDevice, WakeOutcome};
pub use error::{DspError, Result};
pub use ring::{LiveTag, RingBuffer};
pub use stream::{CapturedPeriod, EngineState, PeriodListener, StreamId};
pub use watchdog::{DspMode, HealthState, ResetLine};
