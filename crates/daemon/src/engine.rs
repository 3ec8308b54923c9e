//! The cooperative engine loop
//!
//! One task owns the pipes and the core. It selects between the inbound
//! event channel and the earliest timer deadline; every handler runs to
//! completion, and any state-machine work scheduled during a dispatch is
//! flushed before the loop sleeps again.

use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::blanking;
use crate::compositor::watchdog;
use crate::core::Core;
use crate::display;
use crate::event::{Event, EventRx, FlagEvent, MonitorEvent, Request, SettingKey};
use crate::fader;
use crate::pipelines::Pipelines;
use crate::timers::TimerKind;
use crate::types::{DisplayState, SystemState, UserActivity};
use crate::wakelock::WAKELOCK_INPUT;

/// Used when no timer is armed; the loop still wakes eventually.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

pub struct Engine {
    px: Pipelines,
    core: Core,
    rx: EventRx,
}

impl Engine {
    pub fn new(px: Pipelines, core: Core, rx: EventRx) -> Self {
        Self { px, core, rx }
    }

    /// Install module hooks and arm boot-phase timers.
    fn startup(&mut self) {
        self.core.bindings.install(&self.px, &display::BINDINGS);
        self.core.bindings.install(&self.px, &blanking::BINDINGS);
        self.core
            .timers
            .schedule(TimerKind::DesktopReady, self.core.cfg.desktop_ready_timeout);
        blanking::rethink_timers(&self.px, &mut self.core);
    }

    /// Run until shutdown; returns the exit code.
    pub async fn run(mut self) -> i32 {
        self.startup();
        info!("engine loop running");

        loop {
            let deadline =
                self.core.timers.next_deadline().unwrap_or_else(|| Instant::now() + IDLE_SLEEP);

            tokio::select! {
                ev = self.rx.recv() => match ev {
                    Some(ev) => self.dispatch(ev),
                    None => {
                        warn!("event channel closed");
                        break;
                    }
                },
                _ = sleep_until(deadline) => {
                    for kind in self.core.timers.take_due(Instant::now()) {
                        self.dispatch_timer(kind);
                    }
                }
            }

            // Flush state-machine work scheduled during dispatch.
            if self.core.stm.rethink_is_pending() {
                display::stm_exec(&self.px, &mut self.core);
            }

            if self.core.exit_requested() {
                break;
            }
        }

        info!(code = self.core.exit_code, "engine loop done");
        self.core.exit_code
    }

    fn dispatch(&mut self, ev: Event) {
        let (px, core) = (&self.px, &mut self.core);
        match ev {
            Event::Request(req) => Self::dispatch_request(px, core, req),

            Event::NameOwner { name, owned, owner } => {
                if name == core.cfg.compositor_service {
                    if owned {
                        core.compositor.name_appeared(owner.unwrap_or(name));
                        watchdog::cancel(px, core);
                        // A compositor showing up is the cue to light the
                        // display (cold boot, UI restart).
                        if !px.system_state.cached().is_going_down() {
                            display::request_display_state(px, core, DisplayState::On);
                        }
                        display::stm_schedule_rethink(core);
                    } else {
                        core.compositor.name_vanished();
                        watchdog::cancel(px, core);
                        // Whatever the old instance had on screen is gone.
                        core.fbdev.recycle();
                        display::stm_schedule_rethink(core);
                    }
                } else if !owned {
                    // A private name died: drop its pause and CABC claims.
                    blanking::client_vanished(px, core, &name);
                    core.cabc.client_vanished(&name);
                }
            }

            Event::CompositorReply { seq, enabled, ok } => {
                if core.compositor.handle_reply(seq, enabled, ok) {
                    watchdog::cancel(px, core);
                    display::stm_schedule_rethink(core);
                }
            }

            Event::CompositorPid { gen, pid } => {
                core.compositor.handle_pid(gen, pid);
            }

            Event::FbWait(fb) => display::on_fb_event(px, core, fb),

            Event::Input(mon) => Self::dispatch_input(px, core, mon),

            Event::Flag(flag) => Self::dispatch_flag(px, core, flag),

            Event::Setting(key) => Self::dispatch_setting(px, core, key),

            Event::ReloadSettings => {
                for key in core.settings.reload() {
                    Self::dispatch_setting(px, core, key);
                }
            }

            Event::Shutdown => {
                info!("shutdown requested");
                core.unloading = true;
                // The device must not suspend between daemon exit and
                // platform poweroff.
                core.wakelocks.block_until_exit();
                core.request_exit(0);
            }
        }
    }

    fn dispatch_request(px: &Pipelines, core: &mut Core, req: Request) {
        match req {
            Request::DisplayStateReq { state } => {
                display::request_display_state(px, core, state);
            }
            Request::BlankingPause { client } => {
                blanking::add_pause_client(px, core, &client);
            }
            Request::CancelBlankingPause { client } => {
                blanking::remove_pause_client(px, core, &client);
            }
            Request::GetDisplayStatus { reply } => {
                let _ = reply.send(core.stm.curr.status_str());
            }
            Request::GetBlankingPause { reply } => {
                let active = core.blanking.pause_active();
                let _ = reply.send(if active { "active" } else { "inactive" });
            }
            Request::GetBlankingInhibit { reply } => {
                let active = blanking::inhibit_active(px, core);
                let _ = reply.send(if active { "active" } else { "inactive" });
            }
            Request::SetCabcMode { client, mode } => {
                core.cabc.request(&client, mode);
            }
            Request::GetCabcMode { reply } => {
                let _ = reply.send(core.cabc.current_str());
            }
        }
    }

    fn dispatch_input(px: &Pipelines, core: &mut Core, mon: MonitorEvent) {
        match mon {
            MonitorEvent::Line { monitor, line } => {
                debug!(monitor, line, "input line");
            }
            MonitorEvent::Chunks { monitor, records } => {
                debug!(monitor, n = records.len(), "input chunks");
                // Chunk batches come from input drivers: they are user
                // activity, and a fine moment to check for a completed
                // suspend period.
                if let Some(gap_ms) = core.resume.check() {
                    info!(gap_ms, "resume detected");
                    px.resume_detected.exec(px, core, gap_ms);
                    display::stm_schedule_rethink(core);
                }
                px.user_activity.exec(px, core, UserActivity);
                // The monitor held the input wakelock across read and
                // dispatch; the batch is dispatched now.
                core.wakelocks.unlock(WAKELOCK_INPUT);
            }
            MonitorEvent::Failed { monitor, exit_requested } => {
                warn!(monitor, exit_requested, "input monitor failed");
                if exit_requested {
                    core.request_exit(1);
                }
            }
        }
    }

    fn dispatch_flag(px: &Pipelines, core: &mut Core, flag: FlagEvent) {
        match flag {
            FlagEvent::InitDone(present) => {
                px.init_done.exec(px, core, present);
                display::stm_schedule_rethink(core);
            }
            FlagEvent::BootstateUser(user) => {
                px.bootstate_user.exec(px, core, user);
                if user {
                    px.system_state.exec(px, core, SystemState::User);
                }
                display::stm_schedule_rethink(core);
            }
            FlagEvent::UpdateMode(active) => {
                px.update_mode.exec(px, core, active);
                if active {
                    // Update mode pins the display on and the CPU awake.
                    display::request_display_state(px, core, DisplayState::On);
                }
                blanking::rethink_timers(px, core);
                display::stm_schedule_rethink(core);
            }
        }
    }

    fn dispatch_setting(px: &Pipelines, core: &mut Core, key: SettingKey) {
        debug!(?key, "setting changed");
        match key {
            SettingKey::BrightnessLevel => {
                display::on_brightness_settings_changed(px, core);
            }
            SettingKey::DimTimeout
            | SettingKey::BlankTimeouts
            | SettingKey::AdaptiveDim
            | SettingKey::InhibitMode
            | SettingKey::KbdSlideInhibitMode
            | SettingKey::BlankingPauseMode
            | SettingKey::LowPowerMode => {
                blanking::rethink_timers(px, core);
            }
            SettingKey::NeverBlank => {
                if core.settings.get().never_blank {
                    display::request_display_state(px, core, DisplayState::On);
                }
                blanking::rethink_timers(px, core);
            }
            SettingKey::SuspendPolicy => {
                display::stm_schedule_rethink(core);
            }
            SettingKey::CompositorKillDelay
            | SettingKey::FadeDurations
            | SettingKey::OffOverride
            | SettingKey::Orientation => {}
        }
    }

    fn dispatch_timer(&mut self, kind: TimerKind) {
        let (px, core) = (&self.px, &mut self.core);
        match kind {
            TimerKind::BlankDim => blanking::on_dim_timer(px, core),
            TimerKind::BlankOff => blanking::on_off_timer(px, core),
            TimerKind::BlankLpmOff => blanking::on_lpm_off_timer(px, core),
            TimerKind::BlankPausePeriod => blanking::on_pause_period_timer(px, core),
            TimerKind::AdaptiveDimWindow => blanking::on_adaptive_window_timer(px, core),
            TimerKind::FadeTick => fader::on_tick(px, core),
            TimerKind::HbmTimeout => core.hbm.on_timeout(),
            TimerKind::DisplayOnRelease => display::on_display_on_release(px, core),
            TimerKind::FbTransitionTimeout => display::on_fb_timeout(px, core),
            TimerKind::WatchdogLed => watchdog::on_led_timer(px, core),
            TimerKind::WatchdogCore => watchdog::on_core_timer(px, core),
            TimerKind::WatchdogKill => watchdog::on_kill_timer(px, core),
            TimerKind::WatchdogVerify => watchdog::on_verify_timer(px, core),
            TimerKind::SuspendRethink => display::stm_schedule_rethink(core),
            TimerKind::DesktopReady => {
                debug!("desktop-ready window over");
                display::stm_schedule_rethink(core);
            }
            TimerKind::AfterBootGrace => blanking::on_afterboot_grace_timer(px, core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::event::Request;
    use tokio::sync::oneshot;

    fn engine() -> (Engine, crate::event::EventTx) {
        let (px, core, rx) = Core::for_test();
        let tx = core.events.clone();
        let mut eng = Engine::new(px, core, rx);
        eng.startup();
        (eng, tx)
    }

    #[test]
    fn display_status_getter_replies() {
        let (mut eng, _tx) = engine();
        let (reply, mut rx) = oneshot::channel();
        eng.dispatch(Event::Request(Request::GetDisplayStatus { reply }));
        assert_eq!(rx.try_recv().unwrap(), "off");
    }

    #[test]
    fn compositor_appearance_requests_display_on() {
        let (mut eng, _tx) = engine();
        eng.dispatch(Event::NameOwner {
            name: eng.core.cfg.compositor_service.clone(),
            owned: true,
            owner: Some(":1.7".into()),
        });
        // The sanitised request went through the req pipe.
        assert_eq!(eng.px.display_state_req.cached(), DisplayState::On);
        assert!(eng.core.compositor.is_available());
    }

    #[test]
    fn update_mode_flag_forces_display_on() {
        let (mut eng, _tx) = engine();
        eng.dispatch(Event::Flag(FlagEvent::UpdateMode(true)));
        assert!(eng.px.update_mode.cached());
        assert_eq!(eng.px.display_state_req.cached(), DisplayState::On);
        // All blanking timers are down while the update runs.
        assert!(!eng.core.timers.is_scheduled(TimerKind::BlankDim));
        assert!(!eng.core.timers.is_scheduled(TimerKind::BlankOff));
    }

    #[test]
    fn monitor_exit_policy_stops_engine() {
        let (mut eng, _tx) = engine();
        eng.dispatch(Event::Input(MonitorEvent::Failed {
            monitor: "input-evdev",
            exit_requested: true,
        }));
        assert!(eng.core.exit_requested());
        assert_eq!(eng.core.exit_code, 1);
    }

    #[test]
    fn shutdown_blocks_suspend_and_exits_clean() {
        let (mut eng, _tx) = engine();
        eng.dispatch(Event::Shutdown);
        assert!(eng.core.exit_requested());
        assert_eq!(eng.core.exit_code, 0);
        assert!(eng.core.unloading);
    }

    async fn query_status(tx: &crate::event::EventTx) -> &'static str {
        let (reply, rx) = oneshot::channel();
        tx.send(Event::Request(Request::GetDisplayStatus { reply })).unwrap();
        rx.await.unwrap()
    }

    /// Poll the running engine until the display status reads `want`.
    async fn wait_status(tx: &crate::event::EventTx, want: &str) {
        for _ in 0..400 {
            if query_status(tx).await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("display never reached {want:?}");
    }

    /// Cold boot to user session against the live loop: boot flags land,
    /// the compositor appears, the display comes up, then idles down the
    /// dim/off chain on virtual time.
    #[tokio::test(start_paused = true)]
    async fn cold_boot_then_idle_blank_cycle() {
        let (px, mut core, rx) = Core::for_test();
        core.compositor.auto_ack = true;
        // Zero-length fades keep the walk free of wall-clock waits.
        core.settings.update(|s| {
            s.fade_duration_default = 0;
            s.fade_duration_dim = 0;
            s.fade_duration_blank = 0;
            s.fade_duration_unblank = 0;
            s.dim_timeout = 30;
            s.blank_timeout = 3;
        });
        let tx = core.events.clone();
        let mut sig_rx = core.take_signal_rx();
        let engine = Engine::new(px, core, rx);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let done = tokio::task::spawn_local(engine.run());

                tx.send(Event::Flag(FlagEvent::BootstateUser(true))).unwrap();
                tx.send(Event::Flag(FlagEvent::InitDone(true))).unwrap();
                tx.send(Event::NameOwner {
                    name: "org.nemomobile.compositor".into(),
                    owned: true,
                    owner: Some(":1.7".into()),
                })
                .unwrap();

                // The compositor's arrival lights the display.
                wait_status(&tx, "on").await;
                // Left alone, it dims and then blanks.
                wait_status(&tx, "dim").await;
                wait_status(&tx, "off").await;

                tx.send(Event::Shutdown).unwrap();
                assert_eq!(done.await.unwrap(), 0);

                // The status indications arrived in order, each exactly once.
                let mut statuses = Vec::new();
                while let Ok(s) = sig_rx.try_recv() {
                    if let crate::dbus::DbusSignal::DisplayStatus { status } = s {
                        statuses.push(status);
                    }
                }
                assert_eq!(statuses, vec!["on", "dim", "off"]);
            })
            .await;
    }

    /// User activity while dimmed brings the display back and restarts the
    /// idle countdown.
    #[tokio::test(start_paused = true)]
    async fn activity_resets_blank_countdown() {
        let (px, mut core, rx) = Core::for_test();
        core.compositor.auto_ack = true;
        core.settings.update(|s| {
            s.fade_duration_default = 0;
            s.fade_duration_dim = 0;
            s.fade_duration_blank = 0;
            s.fade_duration_unblank = 0;
        });
        let tx = core.events.clone();
        let engine = Engine::new(px, core, rx);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let done = tokio::task::spawn_local(engine.run());
                tx.send(Event::NameOwner {
                    name: "org.nemomobile.compositor".into(),
                    owned: true,
                    owner: Some(":1.7".into()),
                })
                .unwrap();
                wait_status(&tx, "on").await;
                wait_status(&tx, "dim").await;

                // Wake it back up and verify the countdown starts over.
                tx.send(Event::Request(Request::DisplayStateReq {
                    state: DisplayState::On,
                }))
                .unwrap();
                wait_status(&tx, "on").await;
                wait_status(&tx, "dim").await;

                tx.send(Event::Shutdown).unwrap();
                assert_eq!(done.await.unwrap(), 0);
            })
            .await;
    }

    #[test]
    fn pause_request_roundtrip() {
        let (mut eng, _tx) = engine();
        eng.px.display_state_curr.seed(DisplayState::On);
        eng.dispatch(Event::Request(Request::BlankingPause { client: ":1.4".into() }));
        let (reply, mut rx) = oneshot::channel();
        eng.dispatch(Event::Request(Request::GetBlankingPause { reply }));
        assert_eq!(rx.try_recv().unwrap(), "active");

        // Client drops off the bus: pause ends.
        eng.dispatch(Event::NameOwner { name: ":1.4".into(), owned: false, owner: None });
        let (reply, mut rx) = oneshot::channel();
        eng.dispatch(Event::Request(Request::GetBlankingPause { reply }));
        assert_eq!(rx.try_recv().unwrap(), "inactive");
    }
}
