//! Display state machine micro-states
//!
//! `curr` is the last stable state (the only thing observers see on the
//! `display_state_curr` pipe), `next` the target of the transition in
//! flight, `want` the most recent accepted request. The step function is
//! run in a loop until it produces the same micro-state twice; wait states
//! (renderer replies, fader, framebuffer) simply return themselves until
//! the event they park on has arrived and a rethink re-enters the loop.

use tracing::{debug, info};

use crate::blanking;
use crate::compositor::watchdog;
use crate::core::Core;
use crate::dbus::DbusSignal;
use crate::event::FbWaitEvent;
use crate::fader;
use crate::fbdev::{FB_TRANSITION_TIMEOUT, PATTERN_DISPLAY_SUSPEND_STALL};
use crate::pipelines::Pipelines;
use crate::timers::TimerKind;
use crate::types::{DisplayState, SuspendLevel};
use crate::wakelock::{WAKELOCK_DISPLAY_ON, WAKELOCK_STM};

/// Grace period before `mce_display_on` is actually released, so two
/// closely spaced transitions cannot let the kernel slip into suspend
/// between them.
const DISPLAY_ON_RELEASE_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Micro-states; names follow the transition chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StmState {
    #[default]
    Unset,
    RendererInitStart,
    RendererWaitStart,
    WaitFadeToTarget,
    EnterPowerOn,
    StayPowerOn,
    LeavePowerOn,
    WaitFadeToBlack,
    RendererInitStop,
    RendererWaitStop,
    InitSuspend,
    WaitSuspend,
    EnterPowerOff,
    StayPowerOff,
    LeavePowerOff,
    InitResume,
    WaitResume,
    EnterLogicalOff,
    StayLogicalOff,
    LeaveLogicalOff,
}

#[derive(Debug, Default)]
pub struct DisplayStm {
    pub curr: DisplayState,
    pub next: DisplayState,
    pub want: Option<DisplayState>,
    pub stm: StmState,

    rethink_pending: bool,
    executing: bool,
    stm_wakelock_held: bool,

    display_on_held: bool,

    /// Which framebuffer event the machine is parked on, and the last one
    /// received (consumed by the wait states).
    awaiting_fb: Option<FbWaitEvent>,
    fb_event: Option<FbWaitEvent>,

    sensors_suspended: bool,

    /// Last emitted display_status_ind payload, for exactly-once emission.
    status_indicated: Option<&'static str>,
}

impl DisplayStm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rethink_is_pending(&self) -> bool {
        self.rethink_pending
    }
}

/// Record an accepted request and run the machine immediately (forced
/// rethink), so the transient POWER_UP/POWER_DOWN states become visible to
/// observers right away.
pub fn push_target(px: &Pipelines, core: &mut Core, want: DisplayState) {
    debug!(%want, "display state target pushed");
    core.stm.want = Some(want);
    stm_exec(px, core);
}

/// Ask for a rethink on the next dispatch round. Holds `mce_display_stm`
/// until the machine has actually run.
pub fn stm_schedule_rethink(core: &mut Core) {
    if !core.stm.rethink_pending {
        core.stm.rethink_pending = true;
        if !core.stm.stm_wakelock_held {
            core.wakelocks.lock(WAKELOCK_STM, -1);
            core.stm.stm_wakelock_held = true;
        }
    }
}

/// A framebuffer sleep/wake notification arrived.
pub fn on_fb_event(px: &Pipelines, core: &mut Core, ev: FbWaitEvent) {
    core.stm.fb_event = Some(ev);
    if core.stm.awaiting_fb == Some(ev) {
        core.timers.cancel_kind(TimerKind::FbTransitionTimeout);
        px.led_pattern_deactivate.exec(px, core, PATTERN_DISPLAY_SUSPEND_STALL);
    }
    stm_exec(px, core);
}

/// Framebuffer transition took too long: raise the stall alert; the
/// machine keeps waiting.
pub fn on_fb_timeout(px: &Pipelines, core: &mut Core) {
    if core.stm.awaiting_fb.is_some() {
        px.led_pattern_activate.exec(px, core, PATTERN_DISPLAY_SUSPEND_STALL);
    }
}

/// Run the step loop to its fixed point. Re-entrant calls (hooks fired
/// from within the loop) degrade to a scheduled rethink which the loop
/// picks up before returning.
pub fn stm_exec(px: &Pipelines, core: &mut Core) {
    if core.stm.executing {
        core.stm.rethink_pending = true;
        return;
    }
    core.stm.executing = true;
    if !core.stm.stm_wakelock_held {
        core.wakelocks.lock(WAKELOCK_STM, -1);
        core.stm.stm_wakelock_held = true;
    }

    loop {
        core.stm.rethink_pending = false;
        loop {
            let before = core.stm.stm;
            step(px, core);
            if core.stm.stm == before {
                break;
            }
            debug!(from = ?before, to = ?core.stm.stm, "stm");
        }
        if !core.stm.rethink_pending {
            break;
        }
    }

    core.stm.executing = false;
    if core.stm.stm_wakelock_held {
        core.wakelocks.unlock(WAKELOCK_STM);
        core.stm.stm_wakelock_held = false;
    }
}

/// Take the pending request if it asks for something new.
fn pull_target(core: &mut Core) -> Option<DisplayState> {
    let want = core.stm.want.take()?;
    if want == core.stm.curr {
        return None;
    }
    Some(want)
}

fn early_suspend_allowed(px: &Pipelines, core: &Core) -> bool {
    crate::suspend::current_level(px, core) >= SuspendLevel::Early
}

fn late_suspend_allowed(px: &Pipelines, core: &Core) -> bool {
    crate::suspend::current_level(px, core) >= SuspendLevel::Late
}

/// Begin a transition towards `target`: publish the transient on the
/// `next` pipe, take the display-on wakelock, and emit the early "off"
/// indication when heading for a blanked state.
fn begin_transition(px: &Pipelines, core: &mut Core, target: DisplayState) {
    core.stm.next = target;
    let transient =
        if target.needs_power() { DisplayState::PowerUp } else { DisplayState::PowerDown };
    px.display_state_next.exec(px, core, transient);
    hold_display_on(core);
    // Blanked states (OFF and both LPM variants) indicate at transition
    // start: observers must see "off" before the disable-updates round
    // trip. Powered states indicate at transition end instead.
    if target.status_str() == "off" {
        emit_status(core, target);
    }
    info!(curr = %core.stm.curr, next = %target, "display transition started");
}

/// Publish a stable state on the `curr` pipe and finish the transition.
fn enter_stable(px: &Pipelines, core: &mut Core, state: DisplayState) {
    let first_power_on = state.needs_power() && !core.stm.curr.needs_power();
    if !state.needs_power() {
        // The boost must never outlive the content it was boosting.
        core.timers.cancel_kind(TimerKind::HbmTimeout);
        let _ = core.hbm.set_level(0);
    }
    core.stm.curr = state;
    core.stm.next = state;
    px.display_state_next.exec(px, core, state);
    px.display_state_curr.exec(px, core, state);
    if state.status_str() != "off" {
        emit_status(core, state);
    }
    if first_power_on && px.bootstate_user.cached() {
        blanking::arm_afterboot_grace(core);
    }
}

fn emit_status(core: &mut Core, state: DisplayState) {
    let s = state.status_str();
    if core.stm.status_indicated != Some(s) {
        core.stm.status_indicated = Some(s);
        core.send_signal(DbusSignal::DisplayStatus { status: s });
    }
}

fn hold_display_on(core: &mut Core) {
    core.timers.cancel_kind(TimerKind::DisplayOnRelease);
    if !core.stm.display_on_held {
        core.wakelocks.lock(WAKELOCK_DISPLAY_ON, -1);
        core.stm.display_on_held = true;
    }
}

/// Release via the grace timer so back-to-back transitions keep the lock.
fn release_display_on_deferred(core: &mut Core) {
    if core.stm.display_on_held && !core.timers.is_scheduled(TimerKind::DisplayOnRelease) {
        core.timers.schedule(TimerKind::DisplayOnRelease, DISPLAY_ON_RELEASE_GRACE);
    }
}

/// DisplayOnRelease timer handler.
pub fn on_display_on_release(_px: &Pipelines, core: &mut Core) {
    if core.stm.display_on_held {
        core.wakelocks.unlock(WAKELOCK_DISPLAY_ON);
        core.stm.display_on_held = false;
    }
}

fn suspend_sensors(px: &Pipelines, core: &mut Core, suspend: bool) {
    if core.stm.sensors_suspended != suspend {
        core.stm.sensors_suspended = suspend;
        px.sensors_suspended.exec(px, core, suspend);
    }
}

fn start_fb_wait(core: &mut Core, expect: FbWaitEvent) {
    core.stm.awaiting_fb = Some(expect);
    core.stm.fb_event = None;
    core.timers.cancel_kind(TimerKind::FbTransitionTimeout);
    core.timers.schedule(TimerKind::FbTransitionTimeout, FB_TRANSITION_TIMEOUT);
}

/// Consume the awaited framebuffer event if it has arrived.
fn fb_wait_done(core: &mut Core, expect: FbWaitEvent) -> bool {
    if core.stm.fb_event == Some(expect) {
        core.stm.fb_event = None;
        core.stm.awaiting_fb = None;
        core.timers.cancel_kind(TimerKind::FbTransitionTimeout);
        true
    } else {
        false
    }
}

/// One step of the machine. Returning with `stm` unchanged means "parked".
fn step(px: &Pipelines, core: &mut Core) {
    use StmState::*;

    match core.stm.stm {
        Unset => {
            if let Some(target) = pull_target(core) {
                begin_transition(px, core, target);
                core.stm.stm =
                    if target.needs_power() { RendererInitStart } else { RendererInitStop };
            }
        }

        RendererInitStart => {
            if !core.compositor.is_available() {
                core.stm.stm = WaitFadeToTarget;
            } else if !core.compositor.enable_owed() {
                core.stm.stm = WaitFadeToTarget;
            } else {
                core.compositor.send_updates_enabled(true);
                watchdog::arm(px, core);
                core.stm.stm = RendererWaitStart;
            }
        }

        RendererWaitStart => match core.compositor.ui_state {
            crate::compositor::CompositorUiState::Enabled => core.stm.stm = WaitFadeToTarget,
            crate::compositor::CompositorUiState::Error => core.stm.stm = RendererInitStart,
            _ => {}
        },

        WaitFadeToTarget => {
            if core.stm.curr.needs_power() || core.fader.is_idle() {
                core.stm.stm = EnterPowerOn;
            }
        }

        EnterPowerOn => {
            let target = core.stm.next;
            enter_stable(px, core, target);
            super::apply_brightness_for(px, core, target);
            core.stm.stm = StayPowerOn;
        }

        StayPowerOn => {
            if let Some(target) = pull_target(core) {
                begin_transition(px, core, target);
                core.stm.stm = LeavePowerOn;
            } else if core.compositor.enable_owed() && !core.compositor.call_pending() {
                // Compositor restarted under us: leave the park state to
                // re-dispatch the enable.
                core.stm.next = core.stm.curr;
                core.stm.stm = LeavePowerOn;
            }
        }

        LeavePowerOn => {
            if core.stm.next.needs_power() {
                core.stm.stm = RendererInitStart;
            } else {
                // Fade to black gates panel power-off. An active call
                // short-circuits it so the in-call blank is instant.
                if px.call_state.cached().is_active() {
                    fader::force_level(px, core, 0);
                } else {
                    fader::fade_blank(px, core);
                }
                core.stm.stm = WaitFadeToBlack;
            }
        }

        WaitFadeToBlack => {
            if core.fader.is_idle() {
                core.stm.stm = RendererInitStop;
            }
        }

        RendererInitStop => {
            if !core.compositor.is_available() {
                core.stm.stm = EnterLogicalOff;
            } else if !core.compositor.disable_owed() {
                core.stm.stm = InitSuspend;
            } else {
                core.compositor.send_updates_enabled(false);
                watchdog::arm(px, core);
                core.stm.stm = RendererWaitStop;
            }
        }

        RendererWaitStop => match core.compositor.ui_state {
            crate::compositor::CompositorUiState::Disabled => core.stm.stm = InitSuspend,
            crate::compositor::CompositorUiState::Error => core.stm.stm = RendererInitStop,
            _ => {}
        },

        InitSuspend => {
            if early_suspend_allowed(px, core) {
                core.wakelocks.allow_suspend();
                core.fbdev.start_sleep();
                start_fb_wait(core, FbWaitEvent::Sleep);
                core.stm.stm = WaitSuspend;
            } else {
                core.stm.stm = EnterLogicalOff;
            }
        }

        WaitSuspend => {
            if fb_wait_done(core, FbWaitEvent::Sleep) {
                core.stm.stm = EnterPowerOff;
            }
        }

        EnterPowerOff => {
            let target = core.stm.next;
            enter_stable(px, core, target);
            core.stm.stm = StayPowerOff;
        }

        StayPowerOff => {
            if pull_target_peek(core) || !early_suspend_allowed(px, core) {
                core.stm.stm = LeavePowerOff;
            } else if late_suspend_allowed(px, core) {
                // Deep park: sensors down, display-on lock released so the
                // kernel can reach late suspend.
                suspend_sensors(px, core, true);
                release_display_on_deferred(core);
            } else {
                suspend_sensors(px, core, false);
                hold_display_on(core);
            }
        }

        LeavePowerOff => {
            suspend_sensors(px, core, false);
            let target = core.stm.want.unwrap_or(core.stm.curr);
            if target.needs_power() || !early_suspend_allowed(px, core) {
                core.stm.stm = InitResume;
            } else {
                // Spurious wake: nothing actually changed.
                core.stm.stm = EnterPowerOff;
            }
        }

        InitResume => {
            core.wakelocks.block_suspend();
            hold_display_on(core);
            core.fbdev.start_wake();
            start_fb_wait(core, FbWaitEvent::Wake);
            core.stm.stm = WaitResume;
        }

        WaitResume => {
            if fb_wait_done(core, FbWaitEvent::Wake) {
                if let Some(target) = pull_target(core) {
                    begin_transition(px, core, target);
                }
                if core.stm.next.needs_power() {
                    // A zero level at the compositor's first frame would
                    // latch black; nudge to one, then fade up.
                    fader::force_level(px, core, 1);
                    let resume = core.levels.resume_level;
                    fader::fade_unblank(px, core, resume);
                    core.stm.stm = RendererInitStart;
                } else {
                    core.stm.stm = EnterLogicalOff;
                }
            }
        }

        EnterLogicalOff => {
            let target = core.stm.next;
            enter_stable(px, core, target);
            core.stm.stm = StayLogicalOff;
        }

        StayLogicalOff => {
            if pull_target_peek(core)
                || core.compositor.disable_owed()
                || early_suspend_allowed(px, core)
            {
                core.stm.stm = LeaveLogicalOff;
            }
        }

        LeaveLogicalOff => {
            if let Some(target) = pull_target(core) {
                begin_transition(px, core, target);
            }
            if core.stm.next.needs_power() {
                let resume = core.levels.resume_level;
                fader::fade_unblank(px, core, resume);
                core.stm.stm = RendererInitStart;
            } else if core.compositor.disable_owed() {
                core.stm.stm = RendererInitStop;
            } else {
                core.stm.stm = InitSuspend;
            }
        }
    }
}

/// Like [`pull_target`] but without consuming: park states use this to
/// decide whether to leave, and the leave state does the actual pull.
fn pull_target_peek(core: &Core) -> bool {
    core.stm.want.map(|w| w != core.stm.curr).unwrap_or(false)
}
