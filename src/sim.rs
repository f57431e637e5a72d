//! In-process coprocessor model speaking the exact wire protocol.
//!
//! Memory covers the two DSP banks at `0x4fe00000..0x50000000`; everything
//! else is a sparse register file. Burst payloads are stored un-reversed, so
//! what a test writes with [`SimDsp::write_mem`] is what the host reads back.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::codec::{
    CMD_BURST_READ, CMD_BURST_WRITE, CMD_READ_32, CMD_WRITE_32, HEADER_LEN, TURNAROUND_LEN,
};
use crate::bus::{reverse_windows, SpiTransport, Transfer};
use crate::config::{DspLayout, RingRegisters};

pub const MEMORY_BASE: u32 = 0x4fe0_0000;
pub const MEMORY_LEN: usize = 0x20_0000;

struct SimState {
    regs: HashMap<u32, u32>,
    memory: Vec<u8>,
    reg_writes: Vec<(u32, u32)>,
    reg_reads: HashMap<u32, usize>,
    burst_reads: Vec<(u32, usize)>,
    fail_transfers: usize,
    hang_commands: bool,
    resets: usize,
}

impl SimState {
    fn mem_range(&self, addr: u32, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(MEMORY_BASE)
            .map(|off| off as usize)
            .filter(|off| off + len <= MEMORY_LEN)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{:#010x}+{:#x} outside simulated memory", addr, len),
                )
            })?;
        Ok(start..start + len)
    }
}

#[derive(Clone)]
pub struct SimDsp {
    state: Arc<Mutex<SimState>>,
    layout: DspLayout,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl SimDsp {
    pub fn new(layout: &DspLayout) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                regs: HashMap::new(),
                memory: vec![0; MEMORY_LEN],
                reg_writes: Vec::new(),
                reg_reads: HashMap::new(),
                burst_reads: Vec::new(),
                fail_transfers: 0,
                hang_commands: false,
                resets: 0,
            })),
            layout: layout.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boxed transport sharing this device's state.
    pub fn transport(&self) -> Box<dyn SpiTransport> {
        Box::new(self.clone())
    }

    // ---- device side ----

    pub fn set_reg(&self, addr: u32, value: u32) {
        self.lock().regs.insert(addr, value);
    }

    pub fn reg(&self, addr: u32) -> u32 {
        self.lock().regs.get(&addr).copied().unwrap_or(0)
    }

    pub fn write_mem(&self, addr: u32, data: &[u8]) {
        let mut st = self.lock();
        if let Ok(range) = st.mem_range(addr, data.len()) {
            st.memory[range].copy_from_slice(data);
        }
    }

    pub fn read_mem(&self, addr: u32, len: usize) -> Vec<u8> {
        let st = self.lock();
        st.mem_range(addr, len)
            .map(|range| st.memory[range].to_vec())
            .unwrap_or_default()
    }

    /// Publishes ring geometry the way the firmware does after boot.
    pub fn map_ring(&self, regs: RingRegisters, base: u32, limit: u32, write_ptr: u32) {
        let mut st = self.lock();
        st.regs.insert(regs.base, base);
        st.regs.insert(regs.limit, limit);
        st.regs.insert(regs.write_ptr, write_ptr);
    }

    /// Appends `data` at the ring's write pointer, wrapping at its limit, and
    /// advances the pointer.
    pub fn produce(&self, regs: RingRegisters, data: &[u8]) {
        let mut st = self.lock();
        let base = st.regs.get(&regs.base).copied().unwrap_or(0);
        let limit = st.regs.get(&regs.limit).copied().unwrap_or(0);
        let mut wp = st.regs.get(&regs.write_ptr).copied().unwrap_or(base);
        if limit <= base {
            return;
        }
        for &byte in data {
            if let Ok(range) = st.mem_range(wp, 1) {
                st.memory[range.start] = byte;
            }
            wp += 1;
            if wp >= limit {
                wp = base;
            }
        }
        st.regs.insert(regs.write_ptr, wp);
    }

    // ---- fault injection ----

    /// Fails the next `n` transactions.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_transfers = n;
    }

    /// Stops acknowledging DSP commands.
    pub fn hang_commands(&self, hang: bool) {
        self.lock().hang_commands = hang;
    }

    // ---- observation ----

    pub fn reg_writes(&self) -> Vec<(u32, u32)> {
        self.lock().reg_writes.clone()
    }

    pub fn reg_reads(&self, addr: u32) -> usize {
        self.lock().reg_reads.get(&addr).copied().unwrap_or(0)
    }

    pub fn burst_reads(&self) -> Vec<(u32, usize)> {
        self.lock().burst_reads.clone()
    }

    /// Number of times the DSP core was set running.
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    pub fn clear_log(&self) {
        let mut st = self.lock();
        st.reg_writes.clear();
        st.reg_reads.clear();
        st.burst_reads.clear();
    }

    fn register_write(&self, st: &mut SimState, addr: u32, value: u32) {
        st.reg_writes.push((addr, value));
        if addr == self.layout.dsp_cmd && !st.hang_commands {
            st.regs.insert(addr, 0);
            return;
        }
        if addr == self.layout.dsp_run && value == self.layout.dsp_run_value {
            st.regs.insert(self.layout.watchdog_status, 0);
            st.resets += 1;
        }
        st.regs.insert(addr, value);
    }
}

impl SpiTransport for SimDsp {
    fn transfer(&mut self, transfers: &mut [Transfer<'_>]) -> io::Result<()> {
        let mut st = self.lock();
        if st.fail_transfers > 0 {
            st.fail_transfers -= 1;
            return Err(io::Error::other("simulated bus fault"));
        }

        let (first, rest) = transfers
            .split_first_mut()
            .ok_or_else(|| invalid("empty transaction"))?;
        let Transfer::Write(frame) = first else {
            return Err(invalid("transaction must open with a header"));
        };
        let frame: &[u8] = frame;
        let &[cmd, a0, a1, a2, a3, ..] = frame else {
            return Err(invalid("short header"));
        };
        let addr = u32::from_be_bytes([a0, a1, a2, a3]);

        match cmd {
            CMD_READ_32 | CMD_BURST_READ => {
                let [Transfer::Write(turnaround), Transfer::Read(buf)] = rest else {
                    return Err(invalid("read without turnaround and receive phase"));
                };
                if frame.len() != HEADER_LEN || turnaround.len() != TURNAROUND_LEN {
                    return Err(invalid("bad read framing"));
                }
                if cmd == CMD_READ_32 {
                    if buf.len() != 4 {
                        return Err(invalid("register read must be 4 bytes"));
                    }
                    *st.reg_reads.entry(addr).or_default() += 1;
                    let value = st.regs.get(&addr).copied().unwrap_or(0);
                    buf.copy_from_slice(&value.to_be_bytes());
                } else {
                    if buf.len() % 8 != 0 {
                        return Err(invalid("unaligned burst read"));
                    }
                    let range = st.mem_range(addr, buf.len())?;
                    buf.copy_from_slice(&st.memory[range]);
                    reverse_windows(buf);
                    st.burst_reads.push((addr, buf.len()));
                }
            }
            CMD_WRITE_32 => {
                if !rest.is_empty() || frame.len() != HEADER_LEN + 5 || frame[9] != cmd {
                    return Err(invalid("bad register write framing"));
                }
                let value = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);
                self.register_write(&mut st, addr, value);
            }
            CMD_BURST_WRITE => {
                let payload = &frame[HEADER_LEN..frame.len().saturating_sub(1).max(HEADER_LEN)];
                if !rest.is_empty() || frame.last() != Some(&cmd) || payload.len() % 8 != 0 {
                    return Err(invalid("bad burst write framing"));
                }
                let mut data = payload.to_vec();
                reverse_windows(&mut data);
                let range = st.mem_range(addr, data.len())?;
                st.memory[range].copy_from_slice(&data);
            }
            _ => return Err(invalid("unknown command")),
        }
        Ok(())
    }
}
