//! Raw link access and the global transaction lock.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One phase of a bus transaction.
#[derive(Debug)]
pub enum Transfer<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// A half-duplex serial link to the coprocessor.
///
/// Implementations run every phase of `transfers` back to back inside a
/// single chip-select assertion. A failure anywhere fails the whole call.
pub trait SpiTransport: Send {
    fn transfer(&mut self, transfers: &mut [Transfer<'_>]) -> io::Result<()>;
}

impl<T: SpiTransport + ?Sized> SpiTransport for Box<T> {
    fn transfer(&mut self, transfers: &mut [Transfer<'_>]) -> io::Result<()> {
        (**self).transfer(transfers)
    }
}

/// The single bus endpoint. Every transaction goes through [`Bus::lock`],
/// so no two transactions ever interleave on the wire.
pub struct Bus {
    transport: Mutex<Box<dyn SpiTransport>>,
    mtu: usize,
}

impl Bus {
    pub fn new(transport: Box<dyn SpiTransport>, mtu: usize) -> Self {
        Self {
            transport: Mutex::new(transport),
            mtu,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Box<dyn SpiTransport>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
