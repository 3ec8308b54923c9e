//! Suspend-blocking policy
//!
//! Boils every input that may keep the CPU up into a three-valued answer:
//! no suspend at all, early suspend only, or full (late) suspend allowed.
//! The computation itself is a pure function over a snapshot so the truth
//! table is directly testable; the engine rebuilds the snapshot and
//! re-runs the state machine whenever an ingredient changes.

use std::time::Duration;

use crate::compositor::CompositorUiState;
use crate::types::{AlarmState, CallState, SuspendLevel, SuspendPolicySetting, SystemState, UiException};

/// How long after a call-state change late suspend stays blocked.
pub const CALL_ACTIVE_LINGER: Duration = Duration::from_secs(60);
pub const CALL_INACTIVE_LINGER: Duration = Duration::from_secs(5);

/// Everything the policy looks at.
#[derive(Debug, Clone)]
pub struct SuspendInputs {
    pub call_state: CallState,
    /// Time since the call state last changed, and whether a call was
    /// active at that point; `None` once the linger windows are over.
    pub call_changed_ago: Option<(Duration, bool)>,
    pub alarm_state: AlarmState,
    pub exception: UiException,
    pub system_state: SystemState,
    /// Bootup still in progress: desktop-ready timer running or init-done
    /// flag absent.
    pub booting: bool,
    pub shutting_down: bool,
    pub update_mode: bool,
    pub packagekit_locked: bool,
    /// Daemon teardown in progress.
    pub module_unloading: bool,
    pub compositor_ui_state: CompositorUiState,
    pub policy: SuspendPolicySetting,
}

/// The linger window applicable to a call-state change.
pub fn call_linger_window(was_active: bool) -> Duration {
    if was_active {
        CALL_ACTIVE_LINGER
    } else {
        CALL_INACTIVE_LINGER
    }
}

/// Compute the deepest suspend level currently allowed.
pub fn allowed_level(inp: &SuspendInputs) -> SuspendLevel {
    let mut level = SuspendLevel::Late;

    // Blockers that cap at early suspend.
    if inp.call_state == CallState::Ringing {
        level = level.min(SuspendLevel::Early);
    }
    if let Some((ago, was_active)) = inp.call_changed_ago {
        if ago < call_linger_window(was_active) {
            level = level.min(SuspendLevel::Early);
        }
    }
    if inp.alarm_state.is_active() {
        level = level.min(SuspendLevel::Early);
    }
    if inp.exception.contains(UiException::NOTIF) || inp.exception.contains(UiException::LINGER) {
        level = level.min(SuspendLevel::Early);
    }
    if inp.system_state != SystemState::User {
        level = level.min(SuspendLevel::Early);
    }
    if inp.booting || inp.shutting_down || inp.update_mode || inp.packagekit_locked {
        level = level.min(SuspendLevel::Early);
    }

    // Blockers that rule out even early suspend: without a compositor that
    // has acknowledged a render stop there is no one to gate rendering
    // against, and teardown/update must never race the kernel.
    if inp.module_unloading
        || inp.update_mode
        || inp.compositor_ui_state != CompositorUiState::Disabled
    {
        level = level.min(SuspendLevel::On);
    }

    // User-facing gate applies last.
    match inp.policy {
        SuspendPolicySetting::Disabled => SuspendLevel::On,
        SuspendPolicySetting::EarlyOnly => level.min(SuspendLevel::Early),
        SuspendPolicySetting::Enabled => level,
    }
}

/// Build the snapshot from the live pipes and core state.
pub fn gather_inputs(px: &crate::pipelines::Pipelines, core: &crate::core::Core) -> SuspendInputs {
    let system_state = px.system_state.cached();
    SuspendInputs {
        call_state: px.call_state.cached(),
        call_changed_ago: core.call_changed_ago(),
        alarm_state: px.alarm_state.cached(),
        exception: px.exception_state.cached(),
        system_state,
        booting: core.timers.is_scheduled(crate::timers::TimerKind::DesktopReady)
            || !px.init_done.cached(),
        shutting_down: system_state.is_going_down(),
        update_mode: px.update_mode.cached(),
        packagekit_locked: px.packagekit_locked.cached(),
        module_unloading: core.unloading,
        compositor_ui_state: core.compositor.ui_state,
        policy: core.settings.get().suspend_policy,
    }
}

/// The level the kernel may take the system to right now.
pub fn current_level(px: &crate::pipelines::Pipelines, core: &crate::core::Core) -> SuspendLevel {
    allowed_level(&gather_inputs(px, core))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiescent() -> SuspendInputs {
        SuspendInputs {
            call_state: CallState::None,
            call_changed_ago: None,
            alarm_state: AlarmState::Off,
            exception: UiException::NONE,
            system_state: SystemState::User,
            booting: false,
            shutting_down: false,
            update_mode: false,
            packagekit_locked: false,
            module_unloading: false,
            compositor_ui_state: CompositorUiState::Disabled,
            policy: SuspendPolicySetting::Enabled,
        }
    }

    #[test]
    fn quiescent_allows_late() {
        assert_eq!(allowed_level(&quiescent()), SuspendLevel::Late);
    }

    #[test]
    fn ringing_call_blocks_late() {
        let mut inp = quiescent();
        inp.call_state = CallState::Ringing;
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
    }

    #[test]
    fn recent_call_change_blocks_late() {
        let mut inp = quiescent();
        inp.call_changed_ago = Some((Duration::from_secs(30), true));
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
        // Active linger is 60 s, so 61 s ago no longer blocks.
        inp.call_changed_ago = Some((Duration::from_secs(61), true));
        assert_eq!(allowed_level(&inp), SuspendLevel::Late);
        // Inactive linger is only 5 s.
        inp.call_changed_ago = Some((Duration::from_secs(6), false));
        assert_eq!(allowed_level(&inp), SuspendLevel::Late);
        inp.call_changed_ago = Some((Duration::from_secs(4), false));
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
    }

    #[test]
    fn alarm_blocks_late() {
        let mut inp = quiescent();
        inp.alarm_state = AlarmState::Ringing;
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
        inp.alarm_state = AlarmState::Visible;
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
    }

    #[test]
    fn exception_bits_block_late() {
        let mut inp = quiescent();
        inp.exception = UiException::NONE.with(UiException::NOTIF);
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
        inp.exception = UiException::NONE.with(UiException::LINGER);
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
        // CALL alone does not cap suspend; the call-state inputs do.
        inp.exception = UiException::NONE.with(UiException::CALL);
        assert_eq!(allowed_level(&inp), SuspendLevel::Late);
    }

    #[test]
    fn non_user_state_blocks_late() {
        let mut inp = quiescent();
        inp.system_state = SystemState::ActDead;
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
    }

    #[test]
    fn bootup_blocks_late() {
        let mut inp = quiescent();
        inp.booting = true;
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
    }

    #[test]
    fn compositor_not_disabled_blocks_everything() {
        let mut inp = quiescent();
        inp.compositor_ui_state = CompositorUiState::Enabled;
        assert_eq!(allowed_level(&inp), SuspendLevel::On);
        inp.compositor_ui_state = CompositorUiState::Unknown;
        assert_eq!(allowed_level(&inp), SuspendLevel::On);
        inp.compositor_ui_state = CompositorUiState::Error;
        assert_eq!(allowed_level(&inp), SuspendLevel::On);
    }

    #[test]
    fn update_mode_blocks_everything() {
        let mut inp = quiescent();
        inp.update_mode = true;
        assert_eq!(allowed_level(&inp), SuspendLevel::On);
    }

    #[test]
    fn unloading_blocks_everything() {
        let mut inp = quiescent();
        inp.module_unloading = true;
        assert_eq!(allowed_level(&inp), SuspendLevel::On);
    }

    #[test]
    fn policy_gate() {
        let mut inp = quiescent();
        inp.policy = SuspendPolicySetting::Disabled;
        assert_eq!(allowed_level(&inp), SuspendLevel::On);
        inp.policy = SuspendPolicySetting::EarlyOnly;
        assert_eq!(allowed_level(&inp), SuspendLevel::Early);
    }

    #[test]
    fn late_implies_quiet_call_and_disabled_compositor() {
        // Whenever the answer is LATE, no call is ringing or recently
        // ended and the compositor has acknowledged the render stop.
        let inp = quiescent();
        assert_eq!(allowed_level(&inp), SuspendLevel::Late);
        assert_ne!(inp.call_state, CallState::Ringing);
        assert!(inp.call_changed_ago.is_none());
        assert_eq!(inp.compositor_ui_state, CompositorUiState::Disabled);
    }
}
