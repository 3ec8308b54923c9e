//! The engine-owned state aggregate
//!
//! One value of [`Core`] holds every mutable piece of the daemon: timer
//! service, wakelock gate, subsystem states and the service handles. It is
//! owned by the engine task and handed to hooks as `&mut Core` together
//! with the pipe registry, so all policy code is plain synchronous Rust.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::blanking::BlankingState;
use crate::brightness::BrightnessLevels;
use crate::cabc::Cabc;
use crate::clock::ResumeDetector;
use crate::compositor::{CompositorIpc, Watchdog};
use crate::config::DaemonConfig;
use crate::datapipe::bindings::BindingsRegistry;
use crate::dbus::{DbusSignal, SignalTx};
use crate::display::DisplayStm;
use crate::event::EventTx;
use crate::fader::Fader;
use crate::fbdev::FbPowerGate;
use crate::hbm::Hbm;
use crate::settings::SettingsStore;
use crate::suspend::call_linger_window;
use crate::sysfs::{self, SysfsFile};
use crate::timers::{TimerKind, TimerService};
use crate::types::CallState;
use crate::wakelock::WakelockGate;

pub struct Core {
    pub cfg: DaemonConfig,
    pub settings: SettingsStore,
    pub timers: TimerService,
    pub wakelocks: Arc<WakelockGate>,
    pub events: EventTx,
    signals: SignalTx,

    pub compositor: CompositorIpc,
    pub watchdog: Watchdog,
    pub fbdev: FbPowerGate,

    pub backlight: SysfsFile,
    pub levels: BrightnessLevels,
    pub fader: Fader,
    pub cabc: Cabc,
    pub hbm: Hbm,

    pub blanking: BlankingState,
    pub stm: DisplayStm,
    pub bindings: BindingsRegistry,
    pub resume: ResumeDetector,

    /// Last call-state transition: when, and whether a call was active on
    /// either side of it (which selects the suspend linger window).
    last_call_change: Option<(Instant, bool)>,
    prev_call_state: CallState,

    /// Daemon teardown in progress; blocks all suspending.
    pub unloading: bool,
    /// Exit code chosen by whoever stops the loop.
    pub exit_code: i32,
    exiting: bool,

    #[cfg(test)]
    pub test_probe: Vec<String>,
    #[cfg(test)]
    signal_rx: Option<crate::dbus::SignalRx>,
    #[cfg(test)]
    _scratch: Option<tempfile::TempDir>,
}

impl Core {
    pub fn new(
        cfg: DaemonConfig,
        settings: SettingsStore,
        wakelocks: Arc<WakelockGate>,
        compositor: CompositorIpc,
        fbdev: FbPowerGate,
        events: EventTx,
        signals: SignalTx,
    ) -> Self {
        let max_hw = sysfs::load_number(&cfg.max_brightness_path).unwrap_or(255);
        let mut levels = BrightnessLevels::new(max_hw);
        levels.recompute(settings.get(), false);
        let backlight = SysfsFile::new(cfg.brightness_path.clone());
        let cabc = Cabc::new(cfg.cabc_mode_path.clone(), cfg.cabc_available_modes_path.clone());
        let hbm = Hbm::new(cfg.hbm_path.clone());

        Self {
            cfg,
            settings,
            timers: TimerService::new(),
            wakelocks,
            events,
            signals,
            compositor,
            watchdog: Watchdog::new(),
            fbdev,
            backlight,
            levels,
            fader: Fader::new(),
            cabc,
            hbm,
            blanking: BlankingState::new(),
            stm: DisplayStm::new(),
            bindings: BindingsRegistry::new(),
            resume: ResumeDetector::new(),
            last_call_change: None,
            prev_call_state: CallState::Invalid,
            unloading: false,
            exit_code: 0,
            exiting: false,
            #[cfg(test)]
            test_probe: Vec::new(),
            #[cfg(test)]
            signal_rx: None,
            #[cfg(test)]
            _scratch: None,
        }
    }

    /// Queue an outbound D-Bus indication.
    pub fn send_signal(&self, sig: DbusSignal) {
        if self.signals.send(sig).is_err() {
            debug!(?sig, "signal queue closed");
        }
    }

    /// Record a call-state transition for the suspend linger windows and
    /// arm a rethink at the moment the window runs out.
    pub fn note_call_state_change(&mut self, new: CallState) {
        let prev = self.prev_call_state;
        if new == prev {
            return;
        }
        self.prev_call_state = new;
        // The very first observation is boot noise, not a call event.
        if prev == CallState::Invalid && !new.is_active() {
            return;
        }
        let was_active = prev.is_active() || new.is_active();
        self.last_call_change = Some((Instant::now(), was_active));
        let window = call_linger_window(was_active);
        self.timers.cancel_kind(TimerKind::SuspendRethink);
        self.timers.schedule(TimerKind::SuspendRethink, window);
    }

    /// Time since the last call-state change, while inside the linger
    /// window.
    pub fn call_changed_ago(&self) -> Option<(std::time::Duration, bool)> {
        let (at, was_active) = self.last_call_change?;
        let ago = Instant::now().saturating_duration_since(at);
        if ago < call_linger_window(was_active) {
            Some((ago, was_active))
        } else {
            None
        }
    }

    /// Request loop termination with the given exit code.
    pub fn request_exit(&mut self, code: i32) {
        if !self.exiting {
            self.exiting = true;
            self.exit_code = code;
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exiting
    }

    /// Bare core over a scratch directory, with recorder/stub transports.
    /// Returns the pipes, the core and the engine-side event receiver.
    #[cfg(test)]
    pub fn for_test() -> (crate::pipelines::Pipelines, Core, crate::event::EventRx) {
        use crate::compositor::CompositorBackend;

        let scratch = tempfile::tempdir().expect("scratch dir");
        let dir = scratch.path();
        std::fs::write(dir.join("wake_lock"), "").unwrap();
        std::fs::write(dir.join("wake_unlock"), "").unwrap();
        std::fs::write(dir.join("state"), "").unwrap();
        std::fs::write(dir.join("max_brightness"), "255").unwrap();
        std::fs::write(dir.join("hbm_mode"), "0").unwrap();

        let cfg = DaemonConfig::for_test(dir);
        let settings = SettingsStore::load(cfg.settings_path.clone());
        let wakelocks = Arc::new(WakelockGate::new(
            &cfg.wake_lock_path,
            &cfg.wake_unlock_path,
            &cfg.power_state_path,
        ));
        let (events, rx) = crate::event::channel();
        let (signals, signal_rx) = crate::dbus::signal_channel();
        let compositor = CompositorIpc::new(
            CompositorBackend::Recorder { sent: Default::default() },
            events.clone(),
        );
        let fbdev = FbPowerGate::stub(events.clone());

        let mut core =
            Core::new(cfg, settings, wakelocks, compositor, fbdev, events, signals);
        core.signal_rx = Some(signal_rx);
        core._scratch = Some(scratch);
        (crate::pipelines::Pipelines::new(), core, rx)
    }

    /// Hand the test the receiving end of the signal queue.
    #[cfg(test)]
    pub fn take_signal_rx(&mut self) -> crate::dbus::SignalRx {
        self.signal_rx.take().expect("signal rx already taken")
    }
}
