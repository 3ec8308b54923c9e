//! Userspace wakelock gate
//!
//! Thin writes to `/sys/power/wake_lock`, `/sys/power/wake_unlock` and
//! `/sys/power/state`. Everything in the write path must stay
//! async-signal-safe: no heap allocation, no stdio formatting, only
//! `open(2)`/`write(2)`/`close(2)` on stack buffers. Number formatting is
//! hand-rolled for the same reason.
//!
//! The gate probes `/sys/power/wake_lock` once; if the kernel does not
//! provide the interface every operation is a no-op. Write failures are
//! logged at debug level and never propagate.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

/// Wakelock names owned by the display core.
pub const WAKELOCK_STM: &str = "mce_display_stm";
pub const WAKELOCK_DISPLAY_ON: &str = "mce_display_on";
pub const WAKELOCK_INPUT: &str = "mce_input_handler";
pub const WAKELOCK_LPM_OFF: &str = "mce_lpm_off";

/// `/sys/power/state` payloads: `mem` lets the kernel suspend, `on` blocks it.
const SUSPEND_ALLOW: &[u8] = b"mem";
const SUSPEND_BLOCK: &[u8] = b"on";

const WRITE_BUF_LEN: usize = 128;

/// Gate over the kernel wakelock and autosuspend interface.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct WakelockGate {
    lock_path: CString,
    unlock_path: CString,
    state_path: CString,
    supported: bool,
    /// Latch set by [`block_until_exit`]: once up, `allow_suspend` is inert.
    exit_latch: AtomicBool,
}

fn path_cstring(p: &Path) -> CString {
    // Paths come from config; an interior NUL means the node cannot exist.
    CString::new(p.as_os_str().as_bytes()).unwrap_or_default()
}

impl WakelockGate {
    /// Probe the kernel interface and build the gate.
    pub fn new(lock: &Path, unlock: &Path, state: &Path) -> Self {
        let supported = lock.exists();
        if !supported {
            debug!(path = %lock.display(), "wakelock interface not present, gate disabled");
        }
        Self {
            lock_path: path_cstring(lock),
            unlock_path: path_cstring(unlock),
            state_path: path_cstring(state),
            supported,
            exit_latch: AtomicBool::new(false),
        }
    }

    /// Whether the kernel exposes the wakelock interface at all.
    pub fn supported(&self) -> bool {
        self.supported
    }

    /// Acquire a named wakelock. Negative timeout means no timeout; a
    /// non-negative timeout is passed to the kernel in nanoseconds and the
    /// kernel drops the lock itself on the deadline.
    pub fn lock(&self, name: &str, timeout_ns: i64) {
        if !self.supported {
            return;
        }
        let mut buf = [0u8; WRITE_BUF_LEN];
        let len = if timeout_ns < 0 {
            fill(&mut buf, &[name.as_bytes()])
        } else {
            let mut num = [0u8; 20];
            let num_len = format_u64(timeout_ns as u64, &mut num);
            fill(&mut buf, &[name.as_bytes(), b" ", &num[..num_len]])
        };
        let Some(len) = len else {
            debug!(name, "wakelock write skipped, buffer too small");
            return;
        };
        self.write_raw(&self.lock_path, &buf[..len]);
    }

    /// Release a named wakelock. Releasing a lock that is not held is a
    /// kernel-level no-op and therefore also fine here.
    pub fn unlock(&self, name: &str) {
        if !self.supported {
            return;
        }
        let mut buf = [0u8; WRITE_BUF_LEN];
        let Some(len) = fill(&mut buf, &[name.as_bytes()]) else {
            return;
        };
        self.write_raw(&self.unlock_path, &buf[..len]);
    }

    /// Allow kernel autosuspend (`echo mem > /sys/power/state`).
    pub fn allow_suspend(&self) {
        if !self.supported || self.exit_latch.load(Ordering::SeqCst) {
            return;
        }
        self.write_raw(&self.state_path, SUSPEND_ALLOW);
    }

    /// Block kernel autosuspend (`echo on > /sys/power/state`).
    pub fn block_suspend(&self) {
        if !self.supported {
            return;
        }
        self.write_raw(&self.state_path, SUSPEND_BLOCK);
    }

    /// Block suspend and latch: all later [`allow_suspend`] calls become
    /// no-ops. Used on the shutdown path so the device cannot suspend
    /// between the daemon going down and the platform poweroff.
    pub fn block_until_exit(&self) {
        self.exit_latch.store(true, Ordering::SeqCst);
        self.block_suspend();
    }

    /// Raw write; async-signal-safe (open/write/close only).
    fn write_raw(&self, path: &CString, data: &[u8]) {
        // SAFETY: path is NUL-terminated, data points into caller stack.
        unsafe {
            // O_TRUNC is a no-op on sysfs attributes but keeps regular-file
            // stand-ins (tests) from accumulating stale bytes.
            let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_TRUNC);
            if fd < 0 {
                debug!(path = ?path, "wakelock node open failed");
                return;
            }
            let rc = libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
            if rc < 0 || rc as usize != data.len() {
                debug!(path = ?path, rc, "wakelock node write failed");
            }
            libc::close(fd);
        }
    }
}

/// Concatenate parts into `buf`; returns the total length, or `None` if the
/// buffer is too small. No allocation.
fn fill(buf: &mut [u8], parts: &[&[u8]]) -> Option<usize> {
    let mut at = 0;
    for part in parts {
        if at + part.len() > buf.len() {
            return None;
        }
        buf[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    Some(at)
}

/// Hand-rolled unsigned decimal formatting; returns digit count.
fn format_u64(mut value: u64, out: &mut [u8; 20]) -> usize {
    let mut tmp = [0u8; 20];
    let mut n = 0;
    loop {
        tmp[n] = b'0' + (value % 10) as u8;
        value /= 10;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
    n
}
