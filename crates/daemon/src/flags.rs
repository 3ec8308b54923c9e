//! Boot and update flag-file tracking
//!
//! Three files steer startup and update policy:
//!
//! - `init-done`: presence means bootup has completed;
//! - `bootstate`: content `BOOTSTATE=USER` means a normal user session;
//! - `os-update-running`: presence forces the display on and blocks
//!   suspend.
//!
//! The files flip at second granularity during boot/update, so a small
//! poll task tracks them and reports edges to the engine. Unreadable or
//! malformed files count as absent/unknown.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info};

use crate::event::{Event, EventTx, FlagEvent};
use crate::sysfs;

const POLL_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FlagPaths {
    pub init_done: PathBuf,
    pub bootstate: PathBuf,
    pub update_mode: PathBuf,
}

/// Current reading of all three flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagSnapshot {
    pub init_done: bool,
    pub bootstate_user: bool,
    pub update_mode: bool,
}

/// One poll pass.
pub fn read_flags(paths: &FlagPaths) -> FlagSnapshot {
    FlagSnapshot {
        init_done: paths.init_done.exists(),
        bootstate_user: bootstate_is_user(&paths.bootstate),
        update_mode: paths.update_mode.exists(),
    }
}

fn bootstate_is_user(path: &PathBuf) -> bool {
    match sysfs::load_until_eof(path) {
        Ok(raw) => {
            let text = String::from_utf8_lossy(&raw);
            text.lines().any(|l| l.trim() == "BOOTSTATE=USER")
        }
        // Absent or unreadable counts as unknown, i.e. not USER.
        Err(_) => false,
    }
}

/// Start the poll task; edges are delivered as [`FlagEvent`]s. The initial
/// reading is reported too, so the engine starts from the truth on disk.
pub fn spawn(paths: FlagPaths, events: EventTx) {
    tokio::spawn(async move {
        let mut known = FlagSnapshot::default();
        let mut first = true;
        let mut tick = interval(POLL_PERIOD);
        loop {
            tick.tick().await;
            let now = read_flags(&paths);
            if first || now.init_done != known.init_done {
                debug!(present = now.init_done, "init-done flag");
                if events.send(Event::Flag(FlagEvent::InitDone(now.init_done))).is_err() {
                    return;
                }
            }
            if first || now.bootstate_user != known.bootstate_user {
                info!(user = now.bootstate_user, "bootstate");
                if events.send(Event::Flag(FlagEvent::BootstateUser(now.bootstate_user))).is_err() {
                    return;
                }
            }
            if first || now.update_mode != known.update_mode {
                info!(active = now.update_mode, "os update mode");
                if events.send(Event::Flag(FlagEvent::UpdateMode(now.update_mode))).is_err() {
                    return;
                }
            }
            known = now;
            first = false;
        }
    });
}
