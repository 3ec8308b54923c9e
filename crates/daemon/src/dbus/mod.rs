//! D-Bus surface
//!
//! Inbound: the `com.nokia.mce.request` interface, translated into engine
//! [`Request`]s (getters carry a oneshot for the reply). Outbound: the
//! `com.nokia.mce.signal` indications, queued on a channel and emitted by a
//! dedicated task so the engine never blocks on the bus.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use zbus::fdo;
use zbus::MessageHeader;

use crate::event::{Event, EventTx, Request};
use crate::types::{CabcMode, DisplayState};

pub const MCE_SERVICE: &str = "com.nokia.mce";
pub const MCE_REQUEST_PATH: &str = "/com/nokia/mce/request";
pub const MCE_SIGNAL_PATH: &str = "/com/nokia/mce/signal";
pub const MCE_SIGNAL_IFACE: &str = "com.nokia.mce.signal";

/// Outbound indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbusSignal {
    DisplayStatus { status: &'static str },
    BlankingPause { active: bool },
    BlankingInhibit { active: bool },
    FaderOpacity { percent: i32, duration_ms: i32 },
}

pub type SignalTx = mpsc::UnboundedSender<DbusSignal>;
pub type SignalRx = mpsc::UnboundedReceiver<DbusSignal>;

pub fn signal_channel() -> (SignalTx, SignalRx) {
    mpsc::unbounded_channel()
}

fn active_str(active: bool) -> &'static str {
    if active {
        "active"
    } else {
        "inactive"
    }
}

/// Drain the signal queue onto the bus.
pub fn spawn_signal_emitter(conn: zbus::Connection, mut rx: SignalRx) {
    tokio::spawn(async move {
        while let Some(sig) = rx.recv().await {
            let result = match sig {
                DbusSignal::DisplayStatus { status } => {
                    emit(&conn, "display_status_ind", &(status,)).await
                }
                DbusSignal::BlankingPause { active } => {
                    emit(&conn, "blanking_pause_ind", &(active_str(active),)).await
                }
                DbusSignal::BlankingInhibit { active } => {
                    emit(&conn, "blanking_inhibit_ind", &(active_str(active),)).await
                }
                DbusSignal::FaderOpacity { percent, duration_ms } => {
                    emit(&conn, "fader_opacity_ind", &(percent, duration_ms)).await
                }
            };
            if let Err(e) = result {
                // Dropped per policy; the state machine does not depend on
                // indication delivery.
                warn!(error = %e, "signal emission failed");
            }
        }
    });
}

async fn emit<B: serde::Serialize + zbus::zvariant::DynamicType>(
    conn: &zbus::Connection,
    member: &str,
    body: &B,
) -> zbus::Result<()> {
    conn.emit_signal(Option::<&str>::None, MCE_SIGNAL_PATH, MCE_SIGNAL_IFACE, member, body).await
}

/// Forward every bus name ownership change to the engine; it filters for
/// the compositor, pause clients and the CABC owner.
pub fn spawn_name_tracker(conn: zbus::Connection, events: EventTx) {
    tokio::spawn(async move {
        let proxy = match fdo::DBusProxy::new(&conn).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "DBus proxy unavailable, name tracking disabled");
                return;
            }
        };
        let mut stream = match proxy.receive_name_owner_changed().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "NameOwnerChanged subscription failed");
                return;
            }
        };
        use zbus::export::futures_util::StreamExt;
        while let Some(change) = stream.next().await {
            let Ok(args) = change.args() else { continue };
            let name = args.name().to_string();
            let owner = args.new_owner().as_ref().map(|o| o.to_string());
            let ev = Event::NameOwner { name, owned: owner.is_some(), owner };
            if events.send(ev).is_err() {
                break;
            }
        }
    });
}

/// One-shot query for the current owner of a name, reported through the
/// same [`Event::NameOwner`] path as live changes; covers peers that were
/// already up before we connected.
pub fn spawn_initial_name_query(conn: zbus::Connection, name: String, events: EventTx) {
    tokio::spawn(async move {
        let Ok(proxy) = fdo::DBusProxy::new(&conn).await else { return };
        let Ok(bus_name) = zbus::names::BusName::try_from(name.as_str()) else { return };
        if let Ok(owner) = proxy.get_name_owner(bus_name).await {
            let _ = events.send(Event::NameOwner {
                name,
                owned: true,
                owner: Some(owner.to_string()),
            });
        }
    });
}

/// The com.nokia.mce.request interface object.
pub struct RequestInterface {
    events: EventTx,
}

impl RequestInterface {
    pub fn new(events: EventTx) -> Self {
        Self { events }
    }

    fn forward(&self, req: Request) {
        if self.events.send(Event::Request(req)).is_err() {
            debug!("engine gone, dropping request");
        }
    }

    async fn getter<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> fdo::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.forward(make(tx));
        rx.await.map_err(|_| fdo::Error::Failed("daemon shutting down".into()))
    }

    fn sender_of(hdr: &MessageHeader<'_>) -> fdo::Result<String> {
        match hdr.sender() {
            Ok(Some(unique)) => Ok(unique.to_string()),
            _ => Err(fdo::Error::Failed("anonymous caller".into())),
        }
    }
}

#[zbus::dbus_interface(name = "com.nokia.mce.request")]
impl RequestInterface {
    #[dbus_interface(name = "req_display_state_on")]
    async fn req_display_state_on(&self) {
        self.forward(Request::DisplayStateReq { state: DisplayState::On });
    }

    #[dbus_interface(name = "req_display_state_dim")]
    async fn req_display_state_dim(&self) {
        self.forward(Request::DisplayStateReq { state: DisplayState::Dim });
    }

    #[dbus_interface(name = "req_display_state_off")]
    async fn req_display_state_off(&self) {
        self.forward(Request::DisplayStateReq { state: DisplayState::Off });
    }

    #[dbus_interface(name = "req_display_state_lpm")]
    async fn req_display_state_lpm(&self) {
        self.forward(Request::DisplayStateReq { state: DisplayState::LpmOn });
    }

    #[dbus_interface(name = "req_display_blanking_pause")]
    async fn req_display_blanking_pause(
        &self,
        #[zbus(header)] hdr: MessageHeader<'_>,
    ) -> fdo::Result<()> {
        let client = Self::sender_of(&hdr)?;
        self.forward(Request::BlankingPause { client });
        Ok(())
    }

    #[dbus_interface(name = "req_display_cancel_blanking_pause")]
    async fn req_display_cancel_blanking_pause(
        &self,
        #[zbus(header)] hdr: MessageHeader<'_>,
    ) -> fdo::Result<()> {
        let client = Self::sender_of(&hdr)?;
        self.forward(Request::CancelBlankingPause { client });
        Ok(())
    }

    #[dbus_interface(name = "get_display_status")]
    async fn get_display_status(&self) -> fdo::Result<String> {
        self.getter(|reply| Request::GetDisplayStatus { reply }).await.map(str::to_string)
    }

    #[dbus_interface(name = "get_blanking_pause")]
    async fn get_blanking_pause(&self) -> fdo::Result<String> {
        self.getter(|reply| Request::GetBlankingPause { reply }).await.map(str::to_string)
    }

    #[dbus_interface(name = "get_blanking_inhibit")]
    async fn get_blanking_inhibit(&self) -> fdo::Result<String> {
        self.getter(|reply| Request::GetBlankingInhibit { reply }).await.map(str::to_string)
    }

    #[dbus_interface(name = "req_cabc_mode")]
    async fn req_cabc_mode(
        &self,
        #[zbus(header)] hdr: MessageHeader<'_>,
        mode: &str,
    ) -> fdo::Result<()> {
        let client = Self::sender_of(&hdr)?;
        let Some(mode) = CabcMode::from_str(mode) else {
            // Malformed input gets an error reply and changes nothing.
            return Err(fdo::Error::InvalidArgs(format!("unknown cabc mode {mode:?}")));
        };
        self.forward(Request::SetCabcMode { client, mode });
        Ok(())
    }

    #[dbus_interface(name = "get_cabc_mode")]
    async fn get_cabc_mode(&self) -> fdo::Result<String> {
        self.getter(|reply| Request::GetCabcMode { reply }).await.map(str::to_string)
    }
}
