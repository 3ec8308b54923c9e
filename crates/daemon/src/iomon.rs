//! Input file monitors
//!
//! Named watches over driver nodes. STRING mode delivers one line per
//! notification; CHUNK mode delivers fixed-size binary records, read
//! non-blocking and unbuffered, with incomplete trailing chunks retained
//! until completed. A monitor carries a rewind policy (seek to the start
//! before each read burst; seekability is probed with `lseek`, not taken
//! from any library hint) and an error policy deciding what a HUP or read
//! failure does to the daemon.
//!
//! Chunk reads take the `mce_input_handler` wakelock before touching the
//! fd so the kernel cannot re-suspend between the driver queueing an event
//! and userspace consuming it; the engine releases the lock once the batch
//! has been dispatched. Resume detection (monotonic-vs-boot clock skew)
//! runs at dispatch time on every chunk batch.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::{lseek, Whence};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::event::{Event, EventTx, MonitorEvent};
use crate::wakelock::{WakelockGate, WAKELOCK_INPUT};

/// What one notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// One line of text per notification.
    String,
    /// Fixed-size binary records.
    Chunk { size: usize },
}

/// Whether to seek to offset zero before each read burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindPolicy {
    NoRewind,
    Rewind,
}

/// What an error condition does beyond disabling the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Take the daemon down (nonzero exit).
    Exit,
    Warn,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub name: &'static str,
    pub path: PathBuf,
    pub mode: MonitorMode,
    pub rewind: RewindPolicy,
    pub on_error: ErrorPolicy,
}

/// Open the node and start the monitor task.
pub fn spawn(cfg: MonitorConfig, events: EventTx, wakelocks: Arc<WakelockGate>) {
    tokio::spawn(async move {
        if let Err(e) = run(cfg.clone(), events.clone(), wakelocks).await {
            let exit_requested = cfg.on_error == ErrorPolicy::Exit;
            match cfg.on_error {
                ErrorPolicy::Exit => warn!(monitor = cfg.name, error = %e, "monitor failed, requesting exit"),
                ErrorPolicy::Warn => warn!(monitor = cfg.name, error = %e, "monitor failed, disabled"),
                ErrorPolicy::Ignore => debug!(monitor = cfg.name, error = %e, "monitor failed, disabled"),
            }
            let _ = events.send(Event::Input(MonitorEvent::Failed {
                monitor: cfg.name,
                exit_requested,
            }));
        }
    });
}

#[derive(Debug, thiserror::Error)]
enum MonitorError {
    #[error("open failed: {0}")]
    Open(std::io::Error),
    #[error("fd not pollable: {0}")]
    Register(std::io::Error),
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("hang-up")]
    Hup,
    #[error("event channel closed")]
    Gone,
}

async fn run(
    cfg: MonitorConfig,
    events: EventTx,
    wakelocks: Arc<WakelockGate>,
) -> Result<(), MonitorError> {
    let file = File::options()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&cfg.path)
        .map_err(MonitorError::Open)?;

    // Probe seekability with the syscall itself; pseudo-files lie in their
    // metadata.
    let seekable = lseek(file.as_raw_fd(), 0, Whence::SeekCur).is_ok();
    if cfg.rewind == RewindPolicy::Rewind && !seekable {
        debug!(monitor = cfg.name, "rewind requested on unseekable fd, ignoring");
    }

    let afd = AsyncFd::new(file).map_err(MonitorError::Register)?;
    info!(monitor = cfg.name, path = %cfg.path.display(), mode = ?cfg.mode, "monitor up");

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let mut guard = afd.readable().await.map_err(MonitorError::Read)?;

        if cfg.rewind == RewindPolicy::Rewind && seekable {
            let _ = lseek(afd.get_ref().as_raw_fd(), 0, Whence::SeekSet);
        }

        // Chunk monitors keep the kernel awake across read + dispatch.
        if matches!(cfg.mode, MonitorMode::Chunk { .. }) {
            wakelocks.lock(WAKELOCK_INPUT, -1);
        }

        let mut got_any = false;
        loop {
            match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
                Ok(Ok(0)) => {
                    if matches!(cfg.mode, MonitorMode::Chunk { .. }) && !got_any {
                        wakelocks.unlock(WAKELOCK_INPUT);
                    }
                    return Err(MonitorError::Hup);
                }
                Ok(Ok(n)) => {
                    got_any = true;
                    pending.extend_from_slice(&buf[..n]);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    if matches!(cfg.mode, MonitorMode::Chunk { .. }) && !got_any {
                        wakelocks.unlock(WAKELOCK_INPUT);
                    }
                    return Err(MonitorError::Read(e));
                }
                Err(_would_block) => break,
            }
        }

        match cfg.mode {
            MonitorMode::String => {
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                    events
                        .send(Event::Input(MonitorEvent::Line { monitor: cfg.name, line }))
                        .map_err(|_| MonitorError::Gone)?;
                }
            }
            MonitorMode::Chunk { size } => {
                let complete = pending.len() / size;
                if complete > 0 {
                    let mut records = Vec::with_capacity(complete);
                    for _ in 0..complete {
                        records.push(pending.drain(..size).collect::<Vec<u8>>());
                    }
                    if !pending.is_empty() {
                        debug!(
                            monitor = cfg.name,
                            partial = pending.len(),
                            "incomplete chunk retained"
                        );
                    }
                    // The engine releases the input wakelock after
                    // dispatching this batch.
                    events
                        .send(Event::Input(MonitorEvent::Chunks { monitor: cfg.name, records }))
                        .map_err(|_| MonitorError::Gone)?;
                } else {
                    if !pending.is_empty() {
                        debug!(
                            monitor = cfg.name,
                            partial = pending.len(),
                            "incomplete chunk retained"
                        );
                    }
                    // Nothing to dispatch: nobody will release the lock for us.
                    wakelocks.unlock(WAKELOCK_INPUT);
                }
            }
        }
    }
}
