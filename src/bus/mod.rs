//! Bus Transport and Burst Codec.

pub mod codec;
pub mod spidev;
mod transport;

pub use codec::{check_burst, reverse_windows, DEFAULT_MTU, REGISTER_WINDOW};
pub use spidev::SpidevTransport;
pub use transport::{Bus, SpiTransport, Transfer};
