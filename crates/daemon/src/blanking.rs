//! Blanking timer policy
//!
//! Decides when the display is allowed to march down the
//! `ON -> DIM -> (LPM_ON -> LPM_OFF) -> OFF` chain, and runs the timers
//! that drive it. One scheduler, [`rethink_timers`], cancels and reprograms
//! the relevant subset on every input change; the individual timer
//! handlers just request the next display state.
//!
//! Also owns the blanking-pause client set (peers that asked the chain to
//! hold still) and adaptive dimming (the dim timeout grows while the user
//! keeps waking the device).

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::Core;
use crate::dbus::DbusSignal;
use crate::display;
use crate::pipelines::Pipelines;
use crate::timers::TimerKind;
use crate::types::{
    AudioRoute, BlankingPauseMode, CallState, CoverState, DisplayState, InhibitMode,
    KbdSlideInhibitMode, SystemState, UiException,
};
use crate::wakelock::WAKELOCK_LPM_OFF;

/// At most this many peers may hold a blanking pause at once; further
/// requests are ignored without error.
pub const MAX_PAUSE_CLIENTS: usize = 5;

/// Fixed pause period, refreshed on each client addition.
pub const PAUSE_PERIOD: Duration = Duration::from_secs(60);

/// Act-dead caps: alarms must not keep the display burning.
const ACTDEAD_DIM_CAP_SECS: i64 = 15;
const ACTDEAD_OFF_CAP_SECS: i64 = 3;

/// After-boot grace: window length after the first compositor-driven
/// power-up, and the dim-timeout floor applied inside it.
pub const AFTERBOOT_WINDOW: Duration = Duration::from_secs(60);
const AFTERBOOT_DIM_FLOOR_SECS: i64 = 60;

#[derive(Debug, Default)]
pub struct BlankingState {
    /// Private bus names currently holding a pause.
    pub pause_clients: Vec<String>,
    /// Adaptive dimming promotion index; 0 = base timeout.
    pub adaptive_index: usize,
    /// End of the after-boot grace window, once armed.
    pub afterboot_until: Option<Instant>,
    /// Last emitted indication states, to debounce the D-Bus signals.
    pause_indicated: Option<bool>,
    inhibit_indicated: Option<bool>,
}

impl BlankingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause_active(&self) -> bool {
        !self.pause_clients.is_empty()
    }
}

/// Whether a blanking pause currently blocks dimming (keep-on mode only).
fn pause_blocks_dim(core: &Core) -> bool {
    core.blanking.pause_active()
        && core.settings.get().blanking_pause_mode == BlankingPauseMode::KeepOn
}

/// Whether a blanking pause currently blocks the off transition (any
/// active pause does).
fn pause_blocks_off(core: &Core) -> bool {
    core.blanking.pause_active()
        && core.settings.get().blanking_pause_mode != BlankingPauseMode::Disabled
}

/// Inhibit policy against the charger state. Never applies in act-dead.
fn inhibit_blocks(px: &Pipelines, core: &Core, dim_stage: bool) -> bool {
    if px.system_state.cached() == SystemState::ActDead {
        return false;
    }
    let charger = px.charger_state.cached() == crate::types::ChargerState::On;
    let mode_hit = match core.settings.get().blanking_inhibit_mode {
        InhibitMode::Off => false,
        InhibitMode::StayOn => true,
        InhibitMode::StayOnWithCharger => charger,
        // Stay-dim variants keep the display from blanking but still let it
        // dim: they only block the off stage.
        InhibitMode::StayDim => !dim_stage,
        InhibitMode::StayDimWithCharger => charger && !dim_stage,
    };
    if mode_hit {
        return true;
    }
    let slide_open = px.keyboard_slide.cached() == CoverState::Open;
    match core.settings.get().kbd_slide_inhibit_mode {
        KbdSlideInhibitMode::Off => false,
        KbdSlideInhibitMode::StayOnWhenOpen => slide_open,
        KbdSlideInhibitMode::StayDimWhenOpen => slide_open && !dim_stage,
    }
}

/// Whether the blanking inhibit indication should read active.
pub fn inhibit_active(px: &Pipelines, core: &Core) -> bool {
    inhibit_blocks(px, core, true) || inhibit_blocks(px, core, false)
}

/// The in-ear case: during a call routed to the handset with the proximity
/// sensor covered, the display must hold whatever state it is in.
fn in_ear(px: &Pipelines) -> bool {
    px.exception_state.cached().contains(UiException::CALL)
        && px.audio_route.cached() == AudioRoute::Handset
        && px.proximity.cached() == CoverState::Closed
}

/// Effective dim timeout after adaptive promotion, act-dead caps and the
/// after-boot floor.
fn effective_dim_timeout(px: &Pipelines, core: &Core) -> Duration {
    let s = core.settings.get();
    let mut secs = s.dim_timeout;

    if s.adaptive_dimming_enabled && core.blanking.adaptive_index > 0 {
        // Promote along the allowed list, counting entries above the base.
        let above: Vec<i64> =
            s.possible_dim_timeouts.iter().copied().filter(|&t| t > s.dim_timeout).collect();
        if !above.is_empty() {
            let idx = (core.blanking.adaptive_index - 1).min(above.len() - 1);
            secs = above[idx];
        }
    }

    if px.system_state.cached() == SystemState::ActDead {
        secs = secs.min(ACTDEAD_DIM_CAP_SECS);
    } else if let Some(until) = core.blanking.afterboot_until {
        if Instant::now() < until {
            secs = secs.max(AFTERBOOT_DIM_FLOOR_SECS);
        }
    }
    Duration::from_secs(secs.max(1) as u64)
}

/// Off timeout for the current display state.
fn effective_off_timeout(px: &Pipelines, core: &Core) -> Duration {
    let s = core.settings.get();
    let mut secs = match px.display_state_curr.cached() {
        DisplayState::LpmOff => s.blank_from_lpm_off_timeout,
        _ if px.tklock.cached() => s.blank_from_lockscreen_timeout,
        _ => s.blank_timeout,
    };
    if px.system_state.cached() == SystemState::ActDead {
        secs = secs.min(ACTDEAD_OFF_CAP_SECS);
    }
    Duration::from_secs(secs.max(1) as u64)
}

/// The scheduler. Cancels the dim/off/lpm timers and re-arms the subset
/// appropriate for the current input tuple.
pub fn rethink_timers(px: &Pipelines, core: &mut Core) {
    cancel_lpm_off(core);
    core.timers.cancel_kind(TimerKind::BlankDim);
    core.timers.cancel_kind(TimerKind::BlankOff);

    // Update mode and never-blank force the display on; no timers at all.
    if px.update_mode.cached() || core.settings.get().never_blank {
        update_indications(px, core);
        return;
    }

    let state = px.display_state_curr.cached();
    let call = px.call_state.cached();

    match state {
        DisplayState::On => {
            // A ringing call woke the display; it stays up until telephony
            // settles. Same for the in-ear case.
            let blocked = call == CallState::Ringing
                || in_ear(px)
                || inhibit_blocks(px, core, true)
                || pause_blocks_dim(core);
            if !blocked {
                let t = effective_dim_timeout(px, core);
                core.timers.schedule(TimerKind::BlankDim, t);
                debug!(timeout = ?t, "dim timer armed");
            }
        }
        DisplayState::Dim => {
            let blocked = call == CallState::Ringing
                || in_ear(px)
                || inhibit_blocks(px, core, false)
                || pause_blocks_off(core);
            if !blocked {
                let t = effective_off_timeout(px, core);
                core.timers.schedule(TimerKind::BlankOff, t);
                debug!(timeout = ?t, "off timer armed");
            }
        }
        DisplayState::LpmOn => {
            let t = Duration::from_secs(
                core.settings.get().blank_from_lpm_on_timeout.max(1) as u64
            );
            // The scheduled LPM-off transition must survive autosuspend.
            core.wakelocks.lock(WAKELOCK_LPM_OFF, -1);
            core.timers.schedule(TimerKind::BlankLpmOff, t);
        }
        DisplayState::LpmOff => {
            let t = effective_off_timeout(px, core);
            core.timers.schedule(TimerKind::BlankOff, t);
        }
        _ => {}
    }

    update_indications(px, core);
}

fn cancel_lpm_off(core: &mut Core) {
    if core.timers.is_scheduled(TimerKind::BlankLpmOff) {
        core.timers.cancel_kind(TimerKind::BlankLpmOff);
        core.wakelocks.unlock(WAKELOCK_LPM_OFF);
    }
}

/// Dim timer handler.
pub fn on_dim_timer(px: &Pipelines, core: &mut Core) {
    debug!("dim timer fired");
    display::request_display_state(px, core, DisplayState::Dim);
}

/// Off timer handler; from DIM the target depends on the lockscreen and
/// LPM availability, from LPM_OFF it is always OFF.
pub fn on_off_timer(px: &Pipelines, core: &mut Core) {
    debug!("off timer fired");
    let target = match px.display_state_curr.cached() {
        DisplayState::LpmOff => DisplayState::Off,
        _ if px.tklock.cached() && core.settings.get().low_power_mode_enabled => {
            DisplayState::LpmOn
        }
        _ => DisplayState::Off,
    };
    display::request_display_state(px, core, target);
}

/// LPM-off timer handler.
pub fn on_lpm_off_timer(px: &Pipelines, core: &mut Core) {
    debug!("lpm-off timer fired");
    core.wakelocks.unlock(WAKELOCK_LPM_OFF);
    display::request_display_state(px, core, DisplayState::LpmOff);
}

/// Display state transitions re-seed the whole policy: timers restart from
/// scratch and the adaptive window arms on DIM entry.
pub fn on_display_state_changed(px: &Pipelines, core: &mut Core, state: DisplayState) {
    match state {
        DisplayState::Dim => {
            if core.settings.get().adaptive_dimming_enabled {
                let window =
                    Duration::from_millis(core.settings.get().adaptive_dimming_threshold as u64);
                core.timers.cancel_kind(TimerKind::AdaptiveDimWindow);
                core.timers.schedule(TimerKind::AdaptiveDimWindow, window);
            }
        }
        DisplayState::On => {
            // Leaving DIM for a powered-on state closes the window but
            // keeps the index: the user is still in a wake/use cycle.
            core.timers.cancel_kind(TimerKind::AdaptiveDimWindow);
        }
        _ => {}
    }
    rethink_timers(px, core);
}

/// User activity restarts the countdown; while the adaptive window is
/// armed it also promotes the dim timeout one step.
pub fn on_user_activity(px: &Pipelines, core: &mut Core) {
    if core.timers.is_scheduled(TimerKind::AdaptiveDimWindow)
        && core.settings.get().adaptive_dimming_enabled
    {
        core.blanking.adaptive_index += 1;
        core.timers.cancel_kind(TimerKind::AdaptiveDimWindow);
        debug!(index = core.blanking.adaptive_index, "adaptive dim promoted");
    }
    rethink_timers(px, core);
}

/// Adaptive window expired without activity: the streak is over.
pub fn on_adaptive_window_timer(_px: &Pipelines, core: &mut Core) {
    if core.blanking.adaptive_index > 0 {
        debug!("adaptive dim index decayed");
    }
    core.blanking.adaptive_index = 0;
}

/// After-boot grace plumbing: called by the display module on the first
/// compositor-driven power-up while bootstate says USER.
pub fn arm_afterboot_grace(core: &mut Core) {
    if core.blanking.afterboot_until.is_some() {
        return;
    }
    let until = Instant::now() + AFTERBOOT_WINDOW;
    core.blanking.afterboot_until = Some(until);
    core.timers.schedule(TimerKind::AfterBootGrace, AFTERBOOT_WINDOW);
    info!("after-boot dim grace armed");
}

pub fn on_afterboot_grace_timer(px: &Pipelines, core: &mut Core) {
    core.blanking.afterboot_until = None;
    rethink_timers(px, core);
}

/// Add a blanking-pause client. Per the display state and mode the request
/// may be ignored; a duplicate add just refreshes the period.
pub fn add_pause_client(px: &Pipelines, core: &mut Core, client: &str) {
    let mode = core.settings.get().blanking_pause_mode;
    let state = px.display_state_curr.cached();
    let permitted = match state {
        DisplayState::On => mode != BlankingPauseMode::Disabled,
        DisplayState::Dim => mode == BlankingPauseMode::AllowDim,
        _ => false,
    };
    if !permitted {
        debug!(client, ?state, ?mode, "blanking pause request ignored");
        return;
    }
    if !core.blanking.pause_clients.iter().any(|c| c == client) {
        if core.blanking.pause_clients.len() >= MAX_PAUSE_CLIENTS {
            debug!(client, "blanking pause client table full, request ignored");
            return;
        }
        core.blanking.pause_clients.push(client.to_string());
        info!(client, n = core.blanking.pause_clients.len(), "blanking pause client added");
    }
    // Each addition refreshes the shared period.
    core.timers.cancel_kind(TimerKind::BlankPausePeriod);
    core.timers.schedule(TimerKind::BlankPausePeriod, PAUSE_PERIOD);
    rethink_timers(px, core);
}

/// Explicit cancel from a client.
pub fn remove_pause_client(px: &Pipelines, core: &mut Core, client: &str) {
    let before = core.blanking.pause_clients.len();
    core.blanking.pause_clients.retain(|c| c != client);
    if core.blanking.pause_clients.len() != before {
        info!(client, "blanking pause client removed");
        if core.blanking.pause_clients.is_empty() {
            core.timers.cancel_kind(TimerKind::BlankPausePeriod);
        }
        rethink_timers(px, core);
    }
}

/// A tracked peer fell off the bus.
pub fn client_vanished(px: &Pipelines, core: &mut Core, client: &str) {
    remove_pause_client(px, core, client);
}

/// Pause period ran out: all clients are dropped at once.
pub fn on_pause_period_timer(px: &Pipelines, core: &mut Core) {
    if !core.blanking.pause_clients.is_empty() {
        info!(n = core.blanking.pause_clients.len(), "blanking pause period expired");
        core.blanking.pause_clients.clear();
    }
    rethink_timers(px, core);
}

/// Emit the pause/inhibit indications when their state changed since the
/// last emission.
pub fn update_indications(px: &Pipelines, core: &mut Core) {
    let pause = core.blanking.pause_active()
        && core.settings.get().blanking_pause_mode != BlankingPauseMode::Disabled;
    if core.blanking.pause_indicated != Some(pause) {
        core.blanking.pause_indicated = Some(pause);
        core.send_signal(DbusSignal::BlankingPause { active: pause });
    }
    let inhibit = inhibit_active(px, core);
    if core.blanking.inhibit_indicated != Some(inhibit) {
        core.blanking.inhibit_indicated = Some(inhibit);
        core.send_signal(DbusSignal::BlankingInhibit { active: inhibit });
    }
}

// Any of these inputs shifting can change both the armed timer subset and
// the suspend verdict, so each change re-runs both policies.

fn rethink_on_cover(px: &Pipelines, core: &mut Core, _v: &CoverState) {
    rethink_timers(px, core);
    display::stm_schedule_rethink(core);
}

fn rethink_on_charger(px: &Pipelines, core: &mut Core, _v: &crate::types::ChargerState) {
    rethink_timers(px, core);
}

fn rethink_on_audio(px: &Pipelines, core: &mut Core, _v: &AudioRoute) {
    rethink_timers(px, core);
}

fn rethink_on_exception(px: &Pipelines, core: &mut Core, _v: &UiException) {
    rethink_timers(px, core);
    display::stm_schedule_rethink(core);
}

fn rethink_on_alarm(px: &Pipelines, core: &mut Core, _v: &crate::types::AlarmState) {
    rethink_timers(px, core);
    display::stm_schedule_rethink(core);
}

fn rethink_on_tklock(px: &Pipelines, core: &mut Core, _v: &bool) {
    rethink_timers(px, core);
}

fn rethink_on_system_state(px: &Pipelines, core: &mut Core, _v: &SystemState) {
    rethink_timers(px, core);
    display::stm_schedule_rethink(core);
}

fn install(px: &Pipelines) {
    px.proximity.add_output_trigger("blanking", rethink_on_cover);
    px.keyboard_slide.add_output_trigger("blanking", rethink_on_cover);
    px.charger_state.add_output_trigger("blanking", rethink_on_charger);
    px.audio_route.add_output_trigger("blanking", rethink_on_audio);
    px.exception_state.add_output_trigger("blanking", rethink_on_exception);
    px.alarm_state.add_output_trigger("blanking", rethink_on_alarm);
    px.tklock.add_output_trigger("blanking", rethink_on_tklock);
    px.system_state.add_output_trigger("blanking", rethink_on_system_state);
}

fn remove(px: &Pipelines) {
    px.proximity.remove_owner("blanking");
    px.keyboard_slide.remove_owner("blanking");
    px.charger_state.remove_owner("blanking");
    px.audio_route.remove_owner("blanking");
    px.exception_state.remove_owner("blanking");
    px.alarm_state.remove_owner("blanking");
    px.tklock.remove_owner("blanking");
    px.system_state.remove_owner("blanking");
}

/// Hook batch for the blanking policy.
pub const BINDINGS: crate::datapipe::bindings::ModuleBindings =
    crate::datapipe::bindings::ModuleBindings { module: "blanking", install, remove };

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::types::ChargerState;

    fn at_state(px: &Pipelines, core: &mut Core, state: DisplayState) {
        px.display_state_curr.seed(state);
        rethink_timers(px, core);
    }

    #[test]
    fn on_arms_dim_timer() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::On);
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
        assert!(!core.timers.is_scheduled(TimerKind::BlankOff));
    }

    #[test]
    fn dim_arms_off_timer() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::Dim);
        assert!(core.timers.is_scheduled(TimerKind::BlankOff));
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));
    }

    #[test]
    fn lpm_states_arm_their_timers() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::LpmOn);
        assert!(core.timers.is_scheduled(TimerKind::BlankLpmOff));
        at_state(&px, &mut core, DisplayState::LpmOff);
        assert!(!core.timers.is_scheduled(TimerKind::BlankLpmOff));
        assert!(core.timers.is_scheduled(TimerKind::BlankOff));
    }

    #[test]
    fn off_arms_nothing() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::Off);
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));
        assert!(!core.timers.is_scheduled(TimerKind::BlankOff));
    }

    #[test]
    fn ringing_call_blocks_blanking() {
        let (px, mut core, _rx) = Core::for_test();
        px.call_state.seed(CallState::Ringing);
        at_state(&px, &mut core, DisplayState::On);
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));
        // Call over: timers restart from scratch.
        px.call_state.seed(CallState::None);
        rethink_timers(&px, &mut core);
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
    }

    #[test]
    fn in_ear_blocks_blanking() {
        let (px, mut core, _rx) = Core::for_test();
        px.exception_state.seed(UiException::NONE.with(UiException::CALL));
        px.audio_route.seed(AudioRoute::Handset);
        px.proximity.seed(CoverState::Closed);
        at_state(&px, &mut core, DisplayState::On);
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));
        // Proximity opens and audio moves to speaker: normal policy resumes.
        px.proximity.seed(CoverState::Open);
        px.audio_route.seed(AudioRoute::Speaker);
        rethink_timers(&px, &mut core);
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
    }

    #[test]
    fn stay_on_inhibit_blocks_dim_stay_dim_blocks_off_only() {
        let (px, mut core, _rx) = Core::for_test();
        core.settings.update(|s| s.blanking_inhibit_mode = InhibitMode::StayOn);
        at_state(&px, &mut core, DisplayState::On);
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));

        core.settings.update(|s| s.blanking_inhibit_mode = InhibitMode::StayDim);
        rethink_timers(&px, &mut core);
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
        at_state(&px, &mut core, DisplayState::Dim);
        assert!(!core.timers.is_scheduled(TimerKind::BlankOff));
    }

    #[test]
    fn charger_variants_follow_charger() {
        let (px, mut core, _rx) = Core::for_test();
        core.settings.update(|s| s.blanking_inhibit_mode = InhibitMode::StayOnWithCharger);
        at_state(&px, &mut core, DisplayState::On);
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
        px.charger_state.seed(ChargerState::On);
        rethink_timers(&px, &mut core);
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));
    }

    #[test]
    fn actdead_ignores_inhibits_and_caps_timeouts() {
        let (px, mut core, _rx) = Core::for_test();
        core.settings.update(|s| {
            s.blanking_inhibit_mode = InhibitMode::StayOn;
            s.dim_timeout = 600;
        });
        px.system_state.seed(SystemState::ActDead);
        at_state(&px, &mut core, DisplayState::On);
        // Inhibit does not apply in act-dead, and the timeout is capped.
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
        let remaining = core.timers.remaining(TimerKind::BlankDim).unwrap();
        assert!(remaining <= Duration::from_secs(ACTDEAD_DIM_CAP_SECS as u64));
    }

    #[test]
    fn update_mode_cancels_everything() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::On);
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
        px.update_mode.seed(true);
        rethink_timers(&px, &mut core);
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));
    }

    #[test]
    fn pause_client_bounds() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::On);
        for i in 0..7 {
            add_pause_client(&px, &mut core, &format!(":1.{i}"));
        }
        // The sixth and seventh were rejected without error.
        assert_eq!(core.blanking.pause_clients.len(), MAX_PAUSE_CLIENTS);
    }

    #[test]
    fn pause_gating_by_state_and_mode() {
        let (px, mut core, _rx) = Core::for_test();
        // Default mode keep-on: allowed at ON.
        at_state(&px, &mut core, DisplayState::On);
        add_pause_client(&px, &mut core, ":1.1");
        assert!(core.blanking.pause_active());
        on_pause_period_timer(&px, &mut core);

        // At DIM only allow-dim mode may pause.
        at_state(&px, &mut core, DisplayState::Dim);
        add_pause_client(&px, &mut core, ":1.2");
        assert!(!core.blanking.pause_active());
        core.settings.update(|s| s.blanking_pause_mode = BlankingPauseMode::AllowDim);
        add_pause_client(&px, &mut core, ":1.2");
        assert!(core.blanking.pause_active());

        // At OFF the request is ignored entirely.
        on_pause_period_timer(&px, &mut core);
        at_state(&px, &mut core, DisplayState::Off);
        add_pause_client(&px, &mut core, ":1.3");
        assert!(!core.blanking.pause_active());
    }

    #[test]
    fn pause_keep_on_blocks_dim_allow_dim_permits_it() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::On);
        add_pause_client(&px, &mut core, ":1.1");
        assert!(!core.timers.is_scheduled(TimerKind::BlankDim));

        core.settings.update(|s| s.blanking_pause_mode = BlankingPauseMode::AllowDim);
        rethink_timers(&px, &mut core);
        // allow-dim: dimming proceeds while the pause holds off the blank.
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
        at_state(&px, &mut core, DisplayState::Dim);
        assert!(!core.timers.is_scheduled(TimerKind::BlankOff));
    }

    #[test]
    fn pause_expiry_drops_all_clients() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::On);
        add_pause_client(&px, &mut core, ":1.1");
        add_pause_client(&px, &mut core, ":1.2");
        on_pause_period_timer(&px, &mut core);
        assert!(!core.blanking.pause_active());
        // With the pause gone the dim timer is back.
        assert!(core.timers.is_scheduled(TimerKind::BlankDim));
    }

    #[test]
    fn last_client_removal_ends_pause() {
        let (px, mut core, _rx) = Core::for_test();
        at_state(&px, &mut core, DisplayState::On);
        add_pause_client(&px, &mut core, ":1.1");
        add_pause_client(&px, &mut core, ":1.2");
        remove_pause_client(&px, &mut core, ":1.1");
        assert!(core.blanking.pause_active());
        client_vanished(&px, &mut core, ":1.2");
        assert!(!core.blanking.pause_active());
        assert!(!core.timers.is_scheduled(TimerKind::BlankPausePeriod));
    }

    #[test]
    fn adaptive_promotion_and_decay() {
        let (px, mut core, _rx) = Core::for_test();
        core.settings.update(|s| {
            s.dim_timeout = 30;
            s.possible_dim_timeouts = vec![15, 30, 60, 120];
        });
        at_state(&px, &mut core, DisplayState::On);
        let base = core.timers.remaining(TimerKind::BlankDim).unwrap();
        assert!(base <= Duration::from_secs(30));

        // DIM entry arms the window; activity inside it promotes.
        on_display_state_changed(&px, &mut core, DisplayState::Dim);
        assert!(core.timers.is_scheduled(TimerKind::AdaptiveDimWindow));
        on_user_activity(&px, &mut core);
        assert_eq!(core.blanking.adaptive_index, 1);

        at_state(&px, &mut core, DisplayState::On);
        let promoted = core.timers.remaining(TimerKind::BlankDim).unwrap();
        assert!(promoted > Duration::from_secs(55), "expected 60 s, got {promoted:?}");

        // Window expiry without activity resets the streak.
        on_display_state_changed(&px, &mut core, DisplayState::Dim);
        on_adaptive_window_timer(&px, &mut core);
        assert_eq!(core.blanking.adaptive_index, 0);
    }

    #[test]
    fn lockscreen_blank_chain_targets() {
        let (px, mut core, _rx) = Core::for_test();
        core.settings.update(|s| s.low_power_mode_enabled = true);
        px.tklock.seed(true);

        // DIM with the lockscreen up heads for LPM_ON.
        px.display_state_curr.seed(DisplayState::Dim);
        on_off_timer(&px, &mut core);
        assert_eq!(px.display_state_req.cached(), DisplayState::LpmOn);

        // LPM_ON decays to LPM_OFF.
        px.display_state_curr.seed(DisplayState::LpmOn);
        on_lpm_off_timer(&px, &mut core);
        assert_eq!(px.display_state_req.cached(), DisplayState::LpmOff);

        // LPM_OFF finally goes dark for real.
        px.display_state_curr.seed(DisplayState::LpmOff);
        on_off_timer(&px, &mut core);
        assert_eq!(px.display_state_req.cached(), DisplayState::Off);

        // Without LPM the off timer goes straight to OFF.
        core.settings.update(|s| s.low_power_mode_enabled = false);
        px.display_state_curr.seed(DisplayState::Dim);
        on_off_timer(&px, &mut core);
        assert_eq!(px.display_state_req.cached(), DisplayState::Off);
    }

    #[test]
    fn afterboot_grace_floors_dim_timeout() {
        let (px, mut core, _rx) = Core::for_test();
        core.settings.update(|s| s.dim_timeout = 5);
        arm_afterboot_grace(&mut core);
        at_state(&px, &mut core, DisplayState::On);
        let remaining = core.timers.remaining(TimerKind::BlankDim).unwrap();
        assert!(remaining > Duration::from_secs(30), "grace floor not applied: {remaining:?}");
    }

    #[test]
    fn indications_debounce() {
        let (px, mut core, mut _rx) = Core::for_test();
        let mut sig_rx = core.take_signal_rx();
        at_state(&px, &mut core, DisplayState::On);
        // First rethink emits the initial inactive/inactive pair.
        let mut seen = Vec::new();
        while let Ok(s) = sig_rx.try_recv() {
            seen.push(s);
        }
        assert!(seen.iter().any(|s| matches!(s, DbusSignal::BlankingInhibit { active: false })));

        add_pause_client(&px, &mut core, ":1.1");
        let mut pause_events = 0;
        while let Ok(s) = sig_rx.try_recv() {
            if matches!(s, DbusSignal::BlankingPause { active: true }) {
                pause_events += 1;
            }
        }
        assert_eq!(pause_events, 1);

        // Re-running the scheduler without a state change emits nothing new.
        rethink_timers(&px, &mut core);
        assert!(sig_rx.try_recv().is_err());
    }
}
