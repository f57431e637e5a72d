//! Burst and 32-bit register framing for the coprocessor link.
//!
//! Every read phase is preceded by the 5-byte header and a 4-byte turnaround
//! phase the device uses to fetch data. Burst payloads travel byte-reversed
//! in 8-byte windows in both directions.

use std::ops::Range;

use super::transport::{Bus, Transfer};
use crate::error::{DspError, Result};

pub const CMD_READ_32: u8 = 0x02;
pub const CMD_WRITE_32: u8 = 0x03;
pub const CMD_BURST_READ: u8 = 0x04;
pub const CMD_BURST_WRITE: u8 = 0x05;

/// Default largest payload carried by one burst transaction.
pub const DEFAULT_MTU: usize = 240;

/// Register-mapped window; burst access there is unreliable.
pub const REGISTER_WINDOW: Range<u32> = 0x1800_0000..0x1900_0000;

pub const HEADER_LEN: usize = 5;
pub const TURNAROUND_LEN: usize = 4;
pub const BURST_ALIGN: usize = 8;

pub fn header(cmd: u8, addr: u32) -> [u8; HEADER_LEN] {
    let a = addr.to_be_bytes();
    [cmd, a[0], a[1], a[2], a[3]]
}

/// Reverses every 8-byte window in place. Its own inverse.
pub fn reverse_windows(buf: &mut [u8]) {
    for window in buf.chunks_exact_mut(BURST_ALIGN) {
        window.reverse();
    }
}

/// Validates a burst request before anything touches the wire.
pub fn check_burst(addr: u32, len: usize) -> Result<()> {
    if len % BURST_ALIGN != 0 {
        return Err(DspError::Unaligned(len));
    }
    let end = addr as u64 + len as u64;
    if end > u32::MAX as u64 + 1 {
        return Err(DspError::AddressOverflow { addr, len });
    }
    if len > 0
        && (addr as u64) < REGISTER_WINDOW.end as u64
        && end > REGISTER_WINDOW.start as u64
    {
        return Err(DspError::RegisterWindow { addr, len });
    }
    Ok(())
}

impl Bus {
    /// Reads `buf.len()` bytes starting at `addr`.
    ///
    /// The transaction lock is held for the whole burst. On error the
    /// contents of `buf` are unspecified; use [`Bus::burst_read_vec`] when a
    /// partial result must never be observed.
    pub fn burst_read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_burst(addr, buf.len())?;
        let mtu = self.mtu();
        {
            let mut link = self.lock();
            for (i, chunk) in buf.chunks_mut(mtu).enumerate() {
                let hdr = header(CMD_BURST_READ, addr + (i * mtu) as u32);
                let mut phases = [
                    Transfer::Write(&hdr),
                    Transfer::Write(&hdr[..TURNAROUND_LEN]),
                    Transfer::Read(chunk),
                ];
                link.transfer(&mut phases)?;
            }
        }
        reverse_windows(buf);
        Ok(())
    }

    pub fn burst_read_vec(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.burst_read(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn burst_write(&self, addr: u32, data: &[u8]) -> Result<()> {
        check_burst(addr, data.len())?;
        let mtu = self.mtu();
        let mut frame = Vec::with_capacity(HEADER_LEN + mtu + 1);
        let mut link = self.lock();
        for (i, chunk) in data.chunks(mtu).enumerate() {
            frame.clear();
            frame.extend_from_slice(&header(CMD_BURST_WRITE, addr + (i * mtu) as u32));
            frame.extend_from_slice(chunk);
            reverse_windows(&mut frame[HEADER_LEN..]);
            frame.push(CMD_BURST_WRITE);
            link.transfer(&mut [Transfer::Write(&frame)])?;
        }
        Ok(())
    }

    pub fn read_reg(&self, addr: u32) -> Result<u32> {
        let hdr = header(CMD_READ_32, addr);
        let mut value = [0u8; 4];
        let mut phases = [
            Transfer::Write(&hdr),
            Transfer::Write(&hdr[..TURNAROUND_LEN]),
            Transfer::Read(&mut value),
        ];
        self.lock().transfer(&mut phases)?;
        Ok(u32::from_be_bytes(value))
    }

    pub fn write_reg(&self, addr: u32, value: u32) -> Result<()> {
        let mut frame = [0u8; HEADER_LEN + 4 + 1];
        frame[..HEADER_LEN].copy_from_slice(&header(CMD_WRITE_32, addr));
        frame[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&value.to_be_bytes());
        frame[HEADER_LEN + 4] = CMD_WRITE_32;
        self.lock().transfer(&mut [Transfer::Write(&frame)])?;
        Ok(())
    }

    /// Writes a register sequence in order, stopping at the first failure.
    pub fn write_regs(&self, seq: &[(u32, u32)]) -> Result<()> {
        for &(addr, value) in seq {
            self.write_reg(addr, value)?;
        }
        Ok(())
    }
}
