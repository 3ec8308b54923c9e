//! Compositor IPC
//!
//! The compositor owns rendering; before display power can change the
//! daemon sends a single outstanding async `setUpdatesEnabled(bool)` and
//! tracks the acknowledged state. Replies are matched by sequence number:
//! cancelling a call just bumps the sequence, so a late reply is consumed
//! but ignored.

pub mod watchdog;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::event::{Event, EventTx};

pub use watchdog::{Watchdog, WatchdogStage};

/// Acknowledged render state of the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositorUiState {
    /// No reply yet (call pending, or never asked).
    #[default]
    Unknown,
    /// The last call failed; retry while the peer stays on the bus.
    Error,
    /// Updates disabled: safe to power the panel down.
    Disabled,
    /// Updates enabled.
    Enabled,
}

/// Transport for the `setUpdatesEnabled` call.
pub enum CompositorBackend {
    /// Live bus connection.
    Bus {
        conn: zbus::Connection,
        service: String,
        object: String,
        interface: String,
        call_timeout: std::time::Duration,
    },
    /// No transport: calls are recorded and replies injected by the test.
    Recorder { sent: std::cell::RefCell<Vec<bool>> },
}

/// Compositor peer state and the one-outstanding-call discipline.
pub struct CompositorIpc {
    backend: CompositorBackend,
    events: EventTx,
    /// Unique bus name of the current owner, if any.
    pub owner: Option<String>,
    /// Process id of the owner, resolved lazily after the name appears.
    pub pid: Option<i32>,
    pub ui_state: CompositorUiState,
    /// Target of the outstanding call, if one is pending.
    pub pending: Option<bool>,
    seq: u64,
    /// Bumped on every ownership change; stale PID resolutions carry an
    /// older generation and are dropped.
    owner_gen: u64,
    /// Recorder backend only: acknowledge every call by queueing a
    /// successful reply event, so loop-level tests run unattended.
    #[cfg(test)]
    pub auto_ack: bool,
}

impl CompositorIpc {
    pub fn new(backend: CompositorBackend, events: EventTx) -> Self {
        Self {
            backend,
            events,
            owner: None,
            pid: None,
            ui_state: CompositorUiState::Unknown,
            pending: None,
            seq: 0,
            owner_gen: 0,
            #[cfg(test)]
            auto_ack: false,
        }
    }

    /// Whether a compositor currently owns the service name.
    pub fn is_available(&self) -> bool {
        self.owner.is_some()
    }

    pub fn call_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// An enable call is owed whenever a compositor is up but has not
    /// acknowledged enabled state (fresh start or restart).
    pub fn enable_owed(&self) -> bool {
        self.is_available() && self.ui_state != CompositorUiState::Enabled
    }

    /// Symmetric: a running compositor that has not acknowledged a render
    /// stop may still be drawing.
    pub fn disable_owed(&self) -> bool {
        self.is_available() && self.ui_state != CompositorUiState::Disabled
    }

    /// Dispatch `setUpdatesEnabled(enable)`; the reply arrives as an
    /// [`Event::CompositorReply`] carrying the sequence number.
    pub fn send_updates_enabled(&mut self, enable: bool) {
        self.seq += 1;
        self.pending = Some(enable);
        self.ui_state = CompositorUiState::Unknown;
        let seq = self.seq;
        debug!(enable, seq, "setUpdatesEnabled dispatched");

        match &self.backend {
            CompositorBackend::Bus { conn, service, object, interface, call_timeout } => {
                let conn = conn.clone();
                let dest = self.owner.clone().unwrap_or_else(|| service.clone());
                let object = object.clone();
                let interface = interface.clone();
                let call_timeout = *call_timeout;
                let events = self.events.clone();
                tokio::spawn(async move {
                    let args = (enable,);
                    let call = conn.call_method(
                        Some(dest.as_str()),
                        object.as_str(),
                        Some(interface.as_str()),
                        "setUpdatesEnabled",
                        &args,
                    );
                    let ok = match timeout(call_timeout, call).await {
                        Ok(Ok(_)) => true,
                        Ok(Err(e)) => {
                            warn!(error = %e, "setUpdatesEnabled failed");
                            false
                        }
                        Err(_) => {
                            warn!("setUpdatesEnabled timed out");
                            false
                        }
                    };
                    let _ = events.send(Event::CompositorReply { seq, enabled: enable, ok });
                });
            }
            CompositorBackend::Recorder { sent } => {
                sent.borrow_mut().push(enable);
                #[cfg(test)]
                if self.auto_ack {
                    let _ = self.events.send(Event::CompositorReply { seq, enabled: enable, ok: true });
                }
            }
        }
    }

    /// Consume a reply; returns false for stale replies (superseded or
    /// cancelled calls), which are ignored per the cancellation contract.
    pub fn handle_reply(&mut self, seq: u64, enabled: bool, ok: bool) -> bool {
        if seq != self.seq || self.pending.is_none() {
            debug!(seq, cur = self.seq, "stale compositor reply ignored");
            return false;
        }
        self.pending = None;
        self.ui_state = if !ok {
            CompositorUiState::Error
        } else if enabled {
            CompositorUiState::Enabled
        } else {
            CompositorUiState::Disabled
        };
        debug!(state = ?self.ui_state, "compositor reply");
        true
    }

    /// The service name gained an owner.
    pub fn name_appeared(&mut self, owner: String) {
        info!(owner = %owner, "compositor appeared on the bus");
        self.owner = Some(owner);
        self.pid = None;
        self.owner_gen += 1;
        // Whatever we knew about the renderer no longer holds.
        self.ui_state = CompositorUiState::Unknown;
        self.cancel_call();
        self.resolve_pid();
    }

    /// The service name lost its owner.
    pub fn name_vanished(&mut self) {
        info!("compositor left the bus");
        self.owner = None;
        self.pid = None;
        self.owner_gen += 1;
        self.ui_state = CompositorUiState::Unknown;
        self.cancel_call();
    }

    /// Drop interest in the outstanding call; its reply will be ignored.
    pub fn cancel_call(&mut self) {
        if self.pending.take().is_some() {
            self.seq += 1;
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Record a lazily resolved owner PID; generation-checked so a
    /// resolution for a previous owner cannot stick.
    pub fn handle_pid(&mut self, gen: u64, pid: Option<i32>) {
        if gen == self.owner_gen {
            debug!(?pid, "compositor pid resolved");
            self.pid = pid;
        }
    }

    pub fn owner_gen(&self) -> u64 {
        self.owner_gen
    }

    /// Ask the bus for the owner's PID (GetConnectionUnixProcessID).
    fn resolve_pid(&mut self) {
        let CompositorBackend::Bus { conn, .. } = &self.backend else {
            return;
        };
        let Some(owner) = self.owner.clone() else { return };
        let conn = conn.clone();
        let events = self.events.clone();
        let gen = self.owner_gen;
        tokio::spawn(async move {
            let pid = match zbus::fdo::DBusProxy::new(&conn).await {
                Ok(proxy) => match zbus::names::BusName::try_from(owner.as_str()) {
                    Ok(name) => proxy.get_connection_unix_process_id(name).await.ok().map(|p| p as i32),
                    Err(_) => None,
                },
                Err(_) => None,
            };
            let _ = events.send(Event::CompositorPid { gen, pid });
        });
    }

    #[cfg(test)]
    pub fn recorded_calls(&self) -> Vec<bool> {
        match &self.backend {
            CompositorBackend::Recorder { sent } => sent.borrow().clone(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for CompositorIpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorIpc")
            .field("owner", &self.owner)
            .field("pid", &self.pid)
            .field("ui_state", &self.ui_state)
            .field("pending", &self.pending)
            .field("seq", &self.seq)
            .finish()
    }
}
