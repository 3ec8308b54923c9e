//! Mode Control daemon (mcectl)
//!
//! Long-running privileged service that:
//! - owns the display state machine (on, dimmed, low-power, off)
//! - writes backlight brightness to sysfs
//! - coordinates userspace wakelocks with kernel early/late suspend
//!
//! D-Bus service: com.nokia.mce at /com/nokia/mce/request and
//! /com/nokia/mce/signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcectl::compositor::{CompositorBackend, CompositorIpc};
use mcectl::config::DaemonConfig;
use mcectl::core::Core;
use mcectl::dbus::{self, RequestInterface};
use mcectl::engine::Engine;
use mcectl::event::{self, Event};
use mcectl::fbdev::FbPowerGate;
use mcectl::settings::SettingsStore;
use mcectl::wakelock::WakelockGate;
use mcectl::{flags, iomon, pipelines};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mcectl=debug")),
        )
        .init();

    info!("Starting Mode Control daemon (mcectl)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let cfg = DaemonConfig::from_env();
    let settings = SettingsStore::load(cfg.settings_path.clone());

    let wakelocks = Arc::new(WakelockGate::new(
        &cfg.wake_lock_path,
        &cfg.wake_unlock_path,
        &cfg.power_state_path,
    ));

    let (events, event_rx) = event::channel();
    let (signals, signal_rx) = dbus::signal_channel();

    // D-Bus: claim the service name and serve the request interface.
    let conn = zbus::ConnectionBuilder::system()
        .context("connecting to the system bus")?
        .name(dbus::MCE_SERVICE)
        .context("claiming the mce service name")?
        .serve_at(dbus::MCE_REQUEST_PATH, RequestInterface::new(events.clone()))
        .context("exporting the request interface")?
        .build()
        .await
        .context("finishing the bus connection")?;

    dbus::spawn_signal_emitter(conn.clone(), signal_rx);
    dbus::spawn_name_tracker(conn.clone(), events.clone());
    dbus::spawn_initial_name_query(conn.clone(), cfg.compositor_service.clone(), events.clone());

    let compositor = CompositorIpc::new(
        CompositorBackend::Bus {
            conn: conn.clone(),
            service: cfg.compositor_service.clone(),
            object: cfg.compositor_object.clone(),
            interface: cfg.compositor_interface.clone(),
            call_timeout: cfg.compositor_call_timeout,
        },
        events.clone(),
    );

    let fbdev = FbPowerGate::new(
        cfg.wait_for_fb_sleep_path.clone(),
        cfg.wait_for_fb_wake_path.clone(),
        cfg.fb_device_path.clone(),
        events.clone(),
    );

    flags::spawn(
        flags::FlagPaths {
            init_done: cfg.init_done_path.clone(),
            bootstate: cfg.bootstate_path.clone(),
            update_mode: cfg.update_mode_path.clone(),
        },
        events.clone(),
    );

    // Optional input-driver watch: chunk records the size of one kernel
    // input event, with the input wakelock held across read + dispatch.
    if let Some(node) = std::env::var_os("MCE_INPUT_EVENT_NODE") {
        iomon::spawn(
            iomon::MonitorConfig {
                name: "input-events",
                path: node.into(),
                mode: iomon::MonitorMode::Chunk { size: std::mem::size_of::<libc::input_event>() },
                rewind: iomon::RewindPolicy::NoRewind,
                on_error: iomon::ErrorPolicy::Warn,
            },
            events.clone(),
            Arc::clone(&wakelocks),
        );
    }

    spawn_signal_handlers(events.clone());

    let core = Core::new(
        cfg,
        settings,
        wakelocks,
        compositor,
        fbdev,
        events.clone(),
        signals,
    );
    let engine = Engine::new(pipelines::Pipelines::new(), core, event_rx);

    let code = engine.run().await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// SIGTERM/SIGINT stop the daemon; SIGHUP reloads the settings file.
fn spawn_signal_handlers(events: event::EventTx) {
    use tokio::signal::unix::{signal, SignalKind};

    let tx = events.clone();
    tokio::spawn(async move {
        let Ok(mut term) = signal(SignalKind::terminate()) else { return };
        let Ok(mut int) = signal(SignalKind::interrupt()) else { return };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        let _ = tx.send(Event::Shutdown);
    });

    tokio::spawn(async move {
        let Ok(mut hup) = signal(SignalKind::hangup()) else { return };
        while hup.recv().await.is_some() {
            if events.send(Event::ReloadSettings).is_err() {
                break;
            }
        }
    });
}
