//! Framebuffer power gate
//!
//! Two backends:
//!
//! - **Wait files** (preferred when the kernel has them): a dedicated
//!   thread blocks on reads of `/sys/power/wait_for_fb_sleep` and
//!   `/sys/power/wait_for_fb_wake` alternately and forwards one event per
//!   completed transition. The state machine toggles kernel autosuspend
//!   through the wakelock gate, then parks until the expected event
//!   arrives.
//! - **ioctl fallback**: `FBIOBLANK` on the framebuffer device,
//!   synchronous; the acknowledgement event is injected immediately so the
//!   state machine sees one shape regardless of backend.
//!
//! The thread is a pure producer: it owns its file handles, mutates no
//! shared state and talks only through the event channel. On daemon
//! shutdown it is left parked in `read(2)`; it holds nothing that needs
//! tearing down.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::event::{Event, EventTx, FbWaitEvent};

/// Yellow-alert pattern requested when a framebuffer transition stalls.
pub const PATTERN_DISPLAY_SUSPEND_STALL: &str = "PatternDisplaySuspendStall";

/// How long a framebuffer transition may take before the alert LED.
pub const FB_TRANSITION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

// FBIOBLANK and its arguments, from the kernel fb interface.
const FBIOBLANK: libc::c_ulong = 0x4611;
const FB_BLANK_UNBLANK: libc::c_int = 0;
const FB_BLANK_POWERDOWN: libc::c_int = 4;

/// Selected at startup from what the kernel offers.
#[derive(Debug)]
enum Backend {
    /// Reader thread active on the wait files.
    WaitFiles,
    /// Synchronous ioctl on the fb device.
    Ioctl,
    /// No framebuffer control at all (tests, odd hardware): transitions
    /// acknowledge immediately.
    Stub,
}

/// Framebuffer power control handle, engine side.
#[derive(Debug)]
pub struct FbPowerGate {
    backend: Backend,
    fb_device: PathBuf,
    /// Held open so the panel driver keeps its state between transitions;
    /// recycled (close + reopen) when the compositor drops off the bus to
    /// flush zombie pixels.
    device: Option<File>,
    events: EventTx,
}

impl FbPowerGate {
    /// Probe the kernel interface and start the wait thread if available.
    pub fn new(
        sleep_path: PathBuf,
        wake_path: PathBuf,
        fb_device: PathBuf,
        events: EventTx,
    ) -> Self {
        let wait_thread_up = sleep_path.exists()
            && wake_path.exists()
            && match spawn_wait_thread(sleep_path, wake_path, events.clone()) {
                Ok(()) => true,
                Err(e) => {
                    // Transient OS resource pressure; not worth taking the
                    // daemon down over, the ioctl path still works.
                    warn!(error = %e, "fb-wait thread spawn failed, falling back");
                    false
                }
            };
        let backend = if wait_thread_up {
            Backend::WaitFiles
        } else if fb_device.exists() {
            info!("wait_for_fb interface unavailable, using FBIOBLANK fallback");
            Backend::Ioctl
        } else {
            warn!("no framebuffer control interface found");
            Backend::Stub
        };
        let device = File::options().read(true).write(true).open(&fb_device).ok();
        Self { backend, fb_device, device, events }
    }

    /// Test constructor: every transition acks immediately.
    #[cfg(test)]
    pub fn stub(events: EventTx) -> Self {
        Self { backend: Backend::Stub, fb_device: PathBuf::new(), device: None, events }
    }

    /// Kick off a framebuffer sleep. With the wait-files backend the
    /// caller has already allowed kernel autosuspend and the thread will
    /// report when the fb actually sleeps; otherwise we do it here.
    pub fn start_sleep(&mut self) {
        match self.backend {
            Backend::WaitFiles => {}
            Backend::Ioctl => {
                self.blank(true);
                let _ = self.events.send(Event::FbWait(FbWaitEvent::Sleep));
            }
            Backend::Stub => {
                let _ = self.events.send(Event::FbWait(FbWaitEvent::Sleep));
            }
        }
    }

    /// Kick off a framebuffer wake; mirror image of [`start_sleep`].
    pub fn start_wake(&mut self) {
        match self.backend {
            Backend::WaitFiles => {}
            Backend::Ioctl => {
                self.blank(false);
                let _ = self.events.send(Event::FbWait(FbWaitEvent::Wake));
            }
            Backend::Stub => {
                let _ = self.events.send(Event::FbWait(FbWaitEvent::Wake));
            }
        }
    }

    fn blank(&mut self, powerdown: bool) {
        let Some(dev) = &self.device else {
            debug!("no fb device open, skipping FBIOBLANK");
            return;
        };
        let arg = if powerdown { FB_BLANK_POWERDOWN } else { FB_BLANK_UNBLANK };
        // SAFETY: plain ioctl on an fd we own.
        let rc = unsafe { libc::ioctl(dev.as_raw_fd(), FBIOBLANK, arg as libc::c_ulong) };
        if rc != 0 {
            warn!(powerdown, "FBIOBLANK failed");
        }
    }

    /// Close and reopen the framebuffer device. Clears any half-drawn
    /// frame a dying compositor left behind.
    pub fn recycle(&mut self) {
        if self.fb_device.as_os_str().is_empty() {
            return;
        }
        debug!(path = %self.fb_device.display(), "recycling framebuffer device");
        self.device = None;
        self.device = File::options().read(true).write(true).open(&self.fb_device).ok();
    }
}

/// The one auxiliary thread in the daemon.
fn spawn_wait_thread(
    sleep_path: PathBuf,
    wake_path: PathBuf,
    events: EventTx,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("fb-wait".into())
        .spawn(move || {
            info!("framebuffer wait thread up");
            loop {
                if !block_on_wait_file(&sleep_path) {
                    break;
                }
                if events.send(Event::FbWait(FbWaitEvent::Sleep)).is_err() {
                    break;
                }
                if !block_on_wait_file(&wake_path) {
                    break;
                }
                if events.send(Event::FbWait(FbWaitEvent::Wake)).is_err() {
                    break;
                }
            }
            info!("framebuffer wait thread exiting");
        })
        .map(|_join| ())
}

/// One blocking read against a wait file; returns false on unrecoverable
/// error.
fn block_on_wait_file(path: &PathBuf) -> bool {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "wait file open failed");
            return false;
        }
    };
    let mut buf = [0u8; 16];
    loop {
        match file.read(&mut buf) {
            Ok(_) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "wait file read failed");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_acks_immediately() {
        let (tx, mut rx) = crate::event::channel();
        let mut gate = FbPowerGate::stub(tx);
        gate.start_sleep();
        gate.start_wake();
        match rx.try_recv() {
            Ok(Event::FbWait(FbWaitEvent::Sleep)) => {}
            other => panic!("expected sleep ack, got {other:?}"),
        }
        match rx.try_recv() {
            Ok(Event::FbWait(FbWaitEvent::Wake)) => {}
            other => panic!("expected wake ack, got {other:?}"),
        }
    }
}
