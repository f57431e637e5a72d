//! sysfs GPIO glue: the wake interrupt line and the optional reset line.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::device::DspDevice;
use crate::watchdog::ResetLine;

/// Timeout of one poll, bounds how long `stop` waits for the thread.
const POLL_TIMEOUT_MS: i32 = 500;

/// `value` file of an exported output GPIO.
pub struct SysfsResetLine {
    path: PathBuf,
}

impl SysfsResetLine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResetLine for SysfsResetLine {
    fn set_level(&self, high: bool) -> io::Result<()> {
        fs::write(&self.path, if high { "1" } else { "0" })
    }
}

/// Forwards edges of a sysfs GPIO to [`DspDevice::wake`] from a dedicated
/// OS thread. The GPIO's `edge` attribute must already be configured.
pub struct WakeWatcher {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WakeWatcher {
    pub fn spawn(path: &str, device: DspDevice) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let running = Arc::new(AtomicBool::new(true));
        log::info!("watching wake gpio {}", path);

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("dsp-wake".into())
                .spawn(move || {
                    if let Err(e) = watch(&mut file, &device, &running) {
                        log::error!("wake watcher error: {}", e);
                    }
                })?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for WakeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clear_edge(file: &mut File) -> io::Result<()> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(0))?;
    let _ = file.read(&mut buf)?;
    Ok(())
}

fn watch(file: &mut File, device: &DspDevice, running: &AtomicBool) -> io::Result<()> {
    // sysfs reports the current level as pending until it was read once.
    clear_edge(file)?;
    while running.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret > 0 && pfd.revents & libc::POLLPRI != 0 {
            clear_edge(file)?;
            device.wake();
        }
    }
    Ok(())
}
