use std::io;

use thiserror::Error;

use crate::stream::StreamId;

pub type Result<T> = std::result::Result<T, DspError>;

#[derive(Debug, Error)]
pub enum DspError {
    /// A bus transaction failed. Always transient.
    #[error("bus transaction failed: {0}")]
    Transport(#[from] io::Error),

    #[error("burst length {0} is not a multiple of 8")]
    Unaligned(usize),

    #[error("burst {addr:#010x}+{len:#x} overlaps the register window")]
    RegisterWindow { addr: u32, len: usize },

    #[error("burst {addr:#010x}+{len:#x} overflows the 32-bit address space")]
    AddressOverflow { addr: u32, len: usize },

    /// A buffer descriptor did not carry the live-region tag yet.
    #[error("{stream} buffer geometry not ready (read {value:#010x})")]
    GeometryNotReady { stream: StreamId, value: u32 },

    #[error("{stream}: {reason}")]
    OperatorMisuse {
        stream: StreamId,
        reason: &'static str,
    },

    #[error("device fault, status {0:#010x}")]
    DeviceFault(u32),

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DspError {
    /// Whether retrying later can succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DspError::Transport(_) | DspError::GeometryNotReady { .. } | DspError::DeviceFault(_)
        )
    }
}
