//! Linux `spidev` backend for [`SpiTransport`].

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;

use super::transport::{SpiTransport, Transfer};

/// `struct spi_ioc_transfer` from `<linux/spi/spidev.h>`.
#[repr(C)]
#[derive(Debug, Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

const SPI_IOC_MAGIC: u64 = b'k' as u64;

const fn iow(nr: u64, size: usize) -> u64 {
    (1 << 30) | ((size as u64) << 16) | (SPI_IOC_MAGIC << 8) | nr
}

const SPI_IOC_WR_MODE: u64 = iow(1, 1);
const SPI_IOC_WR_BITS_PER_WORD: u64 = iow(3, 1);
const SPI_IOC_WR_MAX_SPEED_HZ: u64 = iow(4, 4);

const fn spi_ioc_message(n: usize) -> u64 {
    iow(0, n * size_of::<SpiIocTransfer>())
}

fn ioctl<T>(file: &File, request: u64, arg: *const T) -> io::Result<()> {
    // SAFETY: `arg` points at a live value whose layout matches `request`.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub struct SpidevTransport {
    file: File,
    speed_hz: u32,
}

impl SpidevTransport {
    /// Opens `path` in SPI mode 0, 8 bits per word.
    pub fn open(path: &str, speed_hz: u32) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mode: u8 = 0;
        let bits: u8 = 8;
        ioctl(&file, SPI_IOC_WR_MODE, &mode)?;
        ioctl(&file, SPI_IOC_WR_BITS_PER_WORD, &bits)?;
        ioctl(&file, SPI_IOC_WR_MAX_SPEED_HZ, &speed_hz)?;
        log::info!("spidev {} opened at {} Hz", path, speed_hz);
        Ok(Self { file, speed_hz })
    }
}

impl SpiTransport for SpidevTransport {
    fn transfer(&mut self, transfers: &mut [Transfer<'_>]) -> io::Result<()> {
        let xfers: Vec<SpiIocTransfer> = transfers
            .iter_mut()
            .map(|t| {
                let mut x = SpiIocTransfer {
                    speed_hz: self.speed_hz,
                    bits_per_word: 8,
                    ..Default::default()
                };
                match t {
                    Transfer::Write(buf) => {
                        x.tx_buf = buf.as_ptr() as u64;
                        x.len = buf.len() as u32;
                    }
                    Transfer::Read(buf) => {
                        x.rx_buf = buf.as_mut_ptr() as u64;
                        x.len = buf.len() as u32;
                    }
                }
                x
            })
            .collect();
        ioctl(&self.file, spi_ioc_message(xfers.len()), xfers.as_ptr())
    }
}
