//! Engine input messages
//!
//! Everything that can happen to the daemon arrives on one channel as an
//! [`Event`]. Producers are the D-Bus interface task, the bus name tracker,
//! the compositor call tasks, the framebuffer wait thread, file monitors,
//! the flag-file watcher and the signal handlers. Getter requests carry a
//! oneshot sender for the reply.

use tokio::sync::{mpsc, oneshot};

use crate::types::{CabcMode, DisplayState};

pub type EventTx = mpsc::UnboundedSender<Event>;
pub type EventRx = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventTx, EventRx) {
    mpsc::unbounded_channel()
}

/// An inbound D-Bus method call, minus the transport details.
#[derive(Debug)]
pub enum Request {
    DisplayStateReq {
        state: DisplayState,
    },
    BlankingPause {
        client: String,
    },
    CancelBlankingPause {
        client: String,
    },
    GetDisplayStatus {
        reply: oneshot::Sender<&'static str>,
    },
    GetBlankingPause {
        reply: oneshot::Sender<&'static str>,
    },
    GetBlankingInhibit {
        reply: oneshot::Sender<&'static str>,
    },
    SetCabcMode {
        client: String,
        mode: CabcMode,
    },
    GetCabcMode {
        reply: oneshot::Sender<&'static str>,
    },
}

/// Framebuffer sleep/wake notification from the wait thread (or the ioctl
/// backend's synchronous acknowledgement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbWaitEvent {
    Sleep,
    Wake,
}

/// One batch from a file monitor.
#[derive(Debug)]
pub enum MonitorEvent {
    /// One line, STRING mode.
    Line { monitor: &'static str, line: String },
    /// Complete chunks, CHUNK mode. The input wakelock is held by the
    /// producer and released by the engine once the batch is dispatched.
    Chunks { monitor: &'static str, records: Vec<Vec<u8>> },
    /// The monitor hit an error condition and removed itself.
    Failed { monitor: &'static str, exit_requested: bool },
}

/// Flag-file tracker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagEvent {
    InitDone(bool),
    BootstateUser(bool),
    UpdateMode(bool),
}

/// Typed settings keys that modules react to; dispatched after a store
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    BrightnessLevel,
    DimTimeout,
    BlankTimeouts,
    AdaptiveDim,
    InhibitMode,
    KbdSlideInhibitMode,
    NeverBlank,
    LowPowerMode,
    CompositorKillDelay,
    FadeDurations,
    OffOverride,
    BlankingPauseMode,
    SuspendPolicy,
    Orientation,
}

/// The one message type the engine consumes.
#[derive(Debug)]
pub enum Event {
    Request(Request),
    /// Bus name ownership change: (name, gone->false / appeared->true,
    /// unique name of the new owner if any).
    NameOwner {
        name: String,
        owned: bool,
        owner: Option<String>,
    },
    /// Reply (or error) for a `setUpdatesEnabled` call; `seq` matches the
    /// call it answers so stale replies are consumed but ignored.
    CompositorReply {
        seq: u64,
        enabled: bool,
        ok: bool,
    },
    /// Lazily resolved compositor PID, tagged with the owner generation it
    /// was resolved for.
    CompositorPid {
        gen: u64,
        pid: Option<i32>,
    },
    FbWait(FbWaitEvent),
    Input(MonitorEvent),
    Flag(FlagEvent),
    Setting(SettingKey),
    /// Reload the settings store from disk (SIGHUP).
    ReloadSettings,
    Shutdown,
}
