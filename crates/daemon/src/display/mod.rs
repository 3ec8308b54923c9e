//! Display module: request sanitation, brightness application and the
//! state machine
//!
//! External requests land on the `display_state_req` pipe; its filter
//! sanitises them (LPM availability, update-mode and never-blank
//! overrides, shutdown) and pushes the accepted target into the machine.

pub mod stm;

pub use stm::{
    on_display_on_release, on_fb_event, on_fb_timeout, push_target, stm_exec,
    stm_schedule_rethink, DisplayStm, StmState,
};

use tracing::debug;

use crate::core::Core;
use crate::dbus::DbusSignal;
use crate::datapipe::bindings::ModuleBindings;
use crate::fader;
use crate::pipelines::Pipelines;
use crate::types::{CallState, DisplayState};

/// Entry point for every display state request, local or D-Bus.
pub fn request_display_state(px: &Pipelines, core: &mut Core, want: DisplayState) {
    px.display_state_req.exec(px, core, want);
}

/// The `display_state_req` filter: sanitise, then hand the accepted value
/// to the machine.
fn display_state_req_filter(px: &Pipelines, core: &mut Core, req: DisplayState) -> DisplayState {
    let s = core.settings.get();
    let mut want = req;

    // Off may be remapped to LPM by policy.
    if want == DisplayState::Off && s.off_override_use_lpm {
        want = DisplayState::LpmOn;
    }
    // LPM requests degrade to plain off when LPM is unavailable.
    if matches!(want, DisplayState::LpmOn | DisplayState::LpmOff) && !s.low_power_mode_enabled {
        want = DisplayState::Off;
    }
    // No point rendering LPM content against a covered proximity sensor
    // (face-down on the table, in a pocket).
    if want == DisplayState::LpmOn && px.proximity.cached() == crate::types::CoverState::Closed {
        want = DisplayState::LpmOff;
    }
    // Transients and UNDEF are not requestable.
    if !want.is_stable() {
        want = DisplayState::Off;
    }
    // Update mode and never-blank force the display on.
    if s.never_blank || px.update_mode.cached() {
        want = DisplayState::On;
    }
    // No powering up while the device is going down.
    if px.system_state.cached().is_going_down() && want.needs_power() {
        want = DisplayState::Off;
    }

    if want != req {
        debug!(%req, %want, "display state request sanitised");
    }
    push_target(px, core, want);
    want
}

/// Start the brightness change that belongs to a freshly entered powered
/// state.
pub fn apply_brightness_for(px: &Pipelines, core: &mut Core, state: DisplayState) {
    let target = core.levels.level_for_state(state);
    core.levels.set_resume_level(if target > 0 { target } else { core.levels.on_level });
    match state {
        DisplayState::Dim => {
            let opacity = core.levels.dim_opacity_pct;
            let duration = core.settings.get().fade_duration_dim;
            if opacity > 0 {
                core.send_signal(DbusSignal::FaderOpacity {
                    percent: opacity as i32,
                    duration_ms: duration as i32,
                });
            }
            fader::fade_dimming(px, core, target);
        }
        DisplayState::On => {
            if !fader::fade_unblank(px, core, target) {
                fader::fade_default(px, core, target);
            }
        }
        DisplayState::LpmOn => {
            fader::fade_default(px, core, target);
        }
        _ => {}
    }
}

/// Re-run ambient-light brightness tuning after a period where it was
/// blocked by a transition fade.
pub fn als_recheck(px: &Pipelines, core: &mut Core) {
    let curr = core.stm.curr;
    if !curr.needs_power() {
        return;
    }
    let target = core.levels.level_for_state(curr);
    if core.backlight.cached() != Some(target) {
        fader::fade_als(px, core, target);
    }
}

/// Brightness settings changed: recompute levels and retune a powered
/// display.
pub fn on_brightness_settings_changed(px: &Pipelines, core: &mut Core) {
    let psm = px.power_save_mode.cached();
    let settings = core.settings.get().clone();
    core.levels.recompute(&settings, psm);
    als_recheck(px, core);
}

/// A ringing call wakes the display.
fn call_state_trigger(px: &Pipelines, core: &mut Core, state: &CallState) {
    core.note_call_state_change(*state);
    if *state == CallState::Ringing && !core.stm.curr.needs_power() {
        request_display_state(px, core, DisplayState::On);
    }
    stm_schedule_rethink(core);
}

fn display_state_curr_trigger(px: &Pipelines, core: &mut Core, state: &DisplayState) {
    crate::blanking::on_display_state_changed(px, core, *state);
}

fn user_activity_trigger(px: &Pipelines, core: &mut Core, _a: &crate::types::UserActivity) {
    crate::blanking::on_user_activity(px, core);
}

/// Power-save mode reshapes both the backlight curve and CABC.
fn power_save_trigger(px: &Pipelines, core: &mut Core, active: &bool) {
    core.cabc.set_power_save(*active);
    on_brightness_settings_changed(px, core);
}

/// A closed lid blanks the display, an opening one wakes it.
fn lid_trigger(px: &Pipelines, core: &mut Core, state: &crate::types::CoverState) {
    match state {
        crate::types::CoverState::Closed => request_display_state(px, core, DisplayState::Off),
        crate::types::CoverState::Open => request_display_state(px, core, DisplayState::On),
        crate::types::CoverState::Undef => {}
    }
}

/// High-brightness boost requests; each nonzero request re-arms the
/// renewal timer so a silent requester cannot cook the panel.
fn hbm_request_trigger(_px: &Pipelines, core: &mut Core, level: &i64) {
    core.timers.cancel_kind(crate::timers::TimerKind::HbmTimeout);
    if core.hbm.set_level(*level) {
        core.timers.schedule(crate::timers::TimerKind::HbmTimeout, crate::hbm::HBM_RENEW_PERIOD);
    }
}

/// Orientation flips count as user activity when configured to.
fn orientation_trigger(px: &Pipelines, core: &mut Core, _deg: &i32) {
    let s = core.settings.get();
    if s.orientation_sensor_enabled && s.orientation_change_is_activity {
        px.user_activity.exec(px, core, crate::types::UserActivity);
    }
}

fn install(px: &Pipelines) {
    px.display_state_req.add_filter("display", display_state_req_filter);
    px.display_state_curr.add_output_trigger("display", display_state_curr_trigger);
    px.call_state.add_output_trigger("display", call_state_trigger);
    px.user_activity.add_input_trigger("display", user_activity_trigger);
    px.power_save_mode.add_output_trigger("display", power_save_trigger);
    px.lid.add_output_trigger("display", lid_trigger);
    px.hbm_request.add_output_trigger("display", hbm_request_trigger);
    px.orientation.add_output_trigger("display", orientation_trigger);
}

fn remove(px: &Pipelines) {
    px.display_state_req.remove_owner("display");
    px.display_state_curr.remove_owner("display");
    px.call_state.remove_owner("display");
    px.user_activity.remove_owner("display");
    px.power_save_mode.remove_owner("display");
    px.lid.remove_owner("display");
    px.hbm_request.remove_owner("display");
    px.orientation.remove_owner("display");
}

/// Hook batch for the display module.
pub const BINDINGS: ModuleBindings =
    ModuleBindings { module: "display", install, remove };

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::CompositorUiState;
    use crate::core::Core;
    use crate::event::{Event, FbWaitEvent};
    use crate::types::SystemState;

    /// Build a core with the display bindings installed and a compositor
    /// on the bus.
    fn fixture() -> (Pipelines, Core, crate::event::EventRx) {
        let (px, mut core, rx) = Core::for_test();
        core.bindings.install(&px, &BINDINGS);
        px.system_state.seed(SystemState::User);
        core.compositor.name_appeared(":1.7".into());
        (px, core, rx)
    }

    /// Feed the machine the reply it is waiting for.
    fn reply_compositor(px: &Pipelines, core: &mut Core) {
        if let Some(enabled) = core.compositor.pending {
            let seq = core.compositor.seq();
            core.compositor.handle_reply(seq, enabled, true);
            crate::compositor::watchdog::cancel(px, core);
            stm_exec(px, core);
        }
    }

    /// Feed the machine the framebuffer ack it is waiting for; the stub
    /// backend pushes it onto the event channel, tests inject directly.
    fn ack_fb(px: &Pipelines, core: &mut Core, rx: &mut crate::event::EventRx) {
        while let Ok(ev) = rx.try_recv() {
            if let Event::FbWait(fb) = ev {
                on_fb_event(px, core, fb);
            }
        }
    }

    /// Drive the fader to completion so wait-states advance.
    fn finish_fades(px: &Pipelines, core: &mut Core) {
        for _ in 0..8 {
            if core.fader.is_idle() {
                break;
            }
            core.fader.fast_forward();
            fader::on_tick(px, core);
        }
        stm_exec(px, core);
    }

    fn power_up(px: &Pipelines, core: &mut Core, rx: &mut crate::event::EventRx) {
        request_display_state(px, core, DisplayState::On);
        for _ in 0..8 {
            reply_compositor(px, core);
            ack_fb(px, core, rx);
            finish_fades(px, core);
            if core.stm.stm == StmState::StayPowerOn {
                break;
            }
        }
    }

    #[test]
    fn power_up_reaches_on() {
        let (px, mut core, mut rx) = fixture();
        power_up(&px, &mut core, &mut rx);
        assert_eq!(core.stm.stm, StmState::StayPowerOn);
        assert_eq!(core.stm.curr, DisplayState::On);
        assert_eq!(px.display_state_curr.cached(), DisplayState::On);
        // The machine asked the compositor for updates before power-on.
        assert_eq!(core.compositor.ui_state, CompositorUiState::Enabled);
    }

    #[test]
    fn curr_pipe_only_sees_stable_states() {
        let (px, mut core, mut rx) = fixture();
        // Record everything that flows through the curr pipe.
        px.display_state_curr.add_output_trigger("probe", |_px, core, s: &DisplayState| {
            core.test_probe.push(format!("{s}"));
        });
        power_up(&px, &mut core, &mut rx);
        request_display_state(&px, &mut core, DisplayState::Off);
        for _ in 0..8 {
            reply_compositor(&px, &mut core);
            ack_fb(&px, &mut core, &mut rx);
            finish_fades(&px, &mut core);
        }
        assert!(!core.test_probe.is_empty());
        for s in &core.test_probe {
            assert!(
                ["OFF", "LPM_OFF", "LPM_ON", "DIM", "ON"].contains(&s.as_str()),
                "transient {s} leaked to the curr pipe"
            );
        }
    }

    #[test]
    fn power_off_waits_for_disable_reply() {
        let (px, mut core, mut rx) = fixture();
        power_up(&px, &mut core, &mut rx);

        request_display_state(&px, &mut core, DisplayState::Off);
        finish_fades(&px, &mut core);
        // Machine must now be parked on the renderer stop reply; the panel
        // is still logically on.
        assert_eq!(core.stm.stm, StmState::RendererWaitStop);
        assert_eq!(px.display_state_curr.cached(), DisplayState::On);

        reply_compositor(&px, &mut core);
        ack_fb(&px, &mut core, &mut rx);
        stm_exec(&px, &mut core);
        assert_eq!(core.stm.curr, DisplayState::Off);
        assert!(matches!(core.stm.stm, StmState::StayPowerOff | StmState::StayLogicalOff));
    }

    #[test]
    fn status_signals_emitted_in_order() {
        let (px, mut core, mut rx) = fixture();
        let mut sig_rx = core.take_signal_rx();
        power_up(&px, &mut core, &mut rx);
        request_display_state(&px, &mut core, DisplayState::Off);
        for _ in 0..8 {
            reply_compositor(&px, &mut core);
            ack_fb(&px, &mut core, &mut rx);
            finish_fades(&px, &mut core);
        }
        let mut statuses = Vec::new();
        while let Ok(s) = sig_rx.try_recv() {
            if let DbusSignal::DisplayStatus { status } = s {
                statuses.push(status);
            }
        }
        // Exactly one "on" (after power-up completed) and one "off"
        // (emitted at blanking transition start).
        assert_eq!(statuses, vec!["on", "off"]);
    }

    #[test]
    fn request_sanitation() {
        let (px, mut core, _rx) = fixture();
        // LPM disabled: lpm request degrades to off.
        request_display_state(&px, &mut core, DisplayState::LpmOn);
        assert_eq!(px.display_state_req.cached(), DisplayState::Off);

        // Update mode forces on.
        px.update_mode.seed(true);
        request_display_state(&px, &mut core, DisplayState::Off);
        assert_eq!(px.display_state_req.cached(), DisplayState::On);
        px.update_mode.seed(false);

        // Shutdown rejects power-up.
        px.system_state.seed(SystemState::Shutdown);
        request_display_state(&px, &mut core, DisplayState::On);
        assert_eq!(px.display_state_req.cached(), DisplayState::Off);
    }

    #[test]
    fn covered_proximity_degrades_lpm_on() {
        let (px, mut core, _rx) = fixture();
        core.settings.update(|s| s.low_power_mode_enabled = true);
        px.proximity.seed(crate::types::CoverState::Closed);
        request_display_state(&px, &mut core, DisplayState::LpmOn);
        assert_eq!(px.display_state_req.cached(), DisplayState::LpmOff);
        px.proximity.seed(crate::types::CoverState::Open);
        request_display_state(&px, &mut core, DisplayState::LpmOn);
        assert_eq!(px.display_state_req.cached(), DisplayState::LpmOn);
    }

    #[test]
    fn hbm_requests_are_time_limited() {
        let (px, mut core, _rx) = fixture();
        px.hbm_request.exec(&px, &mut core, 2);
        assert_eq!(core.hbm.level(), 2);
        assert!(core.timers.is_scheduled(crate::timers::TimerKind::HbmTimeout));
        // The renewal lapses: boost drops.
        core.hbm.on_timeout();
        assert_eq!(core.hbm.level(), 0);
        // An explicit zero request disarms rather than re-arms.
        px.hbm_request.exec(&px, &mut core, 0);
        assert!(!core.timers.is_scheduled(crate::timers::TimerKind::HbmTimeout));
    }

    #[test]
    fn orientation_change_counts_as_activity() {
        let (px, mut core, _rx) = fixture();
        px.user_activity.add_input_trigger("probe", |_px, core, _a| {
            core.test_probe.push("activity".into());
        });
        px.orientation.seed(90);
        px.orientation.rerun(&px, &mut core);
        assert_eq!(core.test_probe, vec!["activity"]);

        core.settings.update(|s| s.orientation_change_is_activity = false);
        px.orientation.rerun(&px, &mut core);
        assert_eq!(core.test_probe.len(), 1);
    }

    #[test]
    fn off_override_remaps_to_lpm() {
        let (px, mut core, _rx) = fixture();
        core.settings.update(|s| {
            s.off_override_use_lpm = true;
            s.low_power_mode_enabled = true;
        });
        request_display_state(&px, &mut core, DisplayState::Off);
        assert_eq!(px.display_state_req.cached(), DisplayState::LpmOn);
    }

    #[test]
    fn compositor_restart_owes_enable() {
        let (px, mut core, mut rx) = fixture();
        power_up(&px, &mut core, &mut rx);
        assert_eq!(core.stm.stm, StmState::StayPowerOn);

        // Restart: name drops and reappears.
        core.compositor.name_vanished();
        stm_exec(&px, &mut core);
        core.compositor.name_appeared(":1.8".into());
        stm_exec(&px, &mut core);

        // The machine left the park state and the next call sent was
        // setUpdatesEnabled(true).
        assert_eq!(core.stm.stm, StmState::RendererWaitStart);
        assert_eq!(core.compositor.recorded_calls().last(), Some(&true));
        reply_compositor(&px, &mut core);
        finish_fades(&px, &mut core);
        assert_eq!(core.stm.stm, StmState::StayPowerOn);
    }

    #[test]
    fn ringing_call_powers_display_on() {
        let (px, mut core, mut rx) = fixture();
        power_up(&px, &mut core, &mut rx);
        request_display_state(&px, &mut core, DisplayState::Off);
        for _ in 0..8 {
            reply_compositor(&px, &mut core);
            ack_fb(&px, &mut core, &mut rx);
            finish_fades(&px, &mut core);
        }
        assert_eq!(core.stm.curr, DisplayState::Off);

        px.call_state.exec(&px, &mut core, CallState::Ringing);
        for _ in 0..8 {
            reply_compositor(&px, &mut core);
            ack_fb(&px, &mut core, &mut rx);
            finish_fades(&px, &mut core);
        }
        assert_eq!(core.stm.curr, DisplayState::On);
    }

    #[test]
    fn active_call_blank_is_instant() {
        let (px, mut core, mut rx) = fixture();
        power_up(&px, &mut core, &mut rx);
        px.call_state.seed(CallState::Active);
        core.backlight.set(200);
        request_display_state(&px, &mut core, DisplayState::Off);
        // No fade: the level went straight to zero and the machine moved
        // past the fade wait without a single tick.
        assert!(core.fader.is_idle());
        assert_eq!(core.backlight.cached(), Some(0));
        assert!(core.stm.stm != StmState::WaitFadeToBlack);
    }
}
