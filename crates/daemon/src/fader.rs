//! Backlight fader
//!
//! Animates the backlight between levels with typed fades. Only one fade
//! is active at a time; the arbitration matrix decides whether a new fade
//! may pre-empt the running one. Interpolation is linear in brightness
//! units against boot-time milliseconds, so a suspend mid-fade resolves to
//! the correct level on resume.
//!
//! While a fade runs, the process is moved to a middle-priority SCHED_FIFO
//! class so ticks keep landing under load; failure to switch class never
//! aborts the fade.

use tracing::{debug, warn};

use crate::clock;
use crate::core::Core;
use crate::pipelines::Pipelines;
use crate::timers::TimerKind;

/// Fader tick period in milliseconds.
pub const TICK_MS: i64 = 4;

/// Hardware fades are clipped to this range, milliseconds.
pub const FADE_DURATION_MAX_MS: i64 = 5000;
/// UI-visible dimming keeps a floor so the transition reads as animation.
pub const DIM_FADE_DURATION_MIN_MS: i64 = 100;

/// Fade classes, in the order they appear in the arbitration matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeType {
    #[default]
    Idle,
    Default,
    Dimming,
    Als,
    Blank,
    Unblank,
}

/// Whether a new fade of class `new` may start while `current` runs.
///
/// During a display transition fade ALS tuning is blocked to keep the
/// animation uniform; fade-to-black cannot be cancelled because it gates
/// display power-off; during unblank only the target may be adjusted.
pub fn fade_allowed(current: FadeType, new: FadeType) -> bool {
    use FadeType::*;
    match current {
        Idle | Als => true,
        Default | Dimming => new != Als,
        Blank => false,
        Unblank => new == Unblank,
    }
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    fade_type: FadeType,
    start_level: i64,
    end_level: i64,
    start_tick: i64,
    end_tick: i64,
}

/// Fader state; owns no I/O, the core-level functions below do the sysfs
/// writes and timer arming.
#[derive(Debug, Default)]
pub struct Fader {
    active: Option<Fade>,
    sched_boosted: bool,
}

impl Fader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Class of the running fade, `Idle` when none.
    pub fn current_type(&self) -> FadeType {
        self.active.map(|f| f.fade_type).unwrap_or(FadeType::Idle)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Pull the running fade's deadline into the past so the next tick
    /// completes it; lets tests walk transitions without real sleeps.
    #[cfg(test)]
    pub fn fast_forward(&mut self) {
        if let Some(f) = self.active.as_mut() {
            let now = crate::clock::boottime_ms();
            f.start_tick = now - 1;
            f.end_tick = now;
        }
    }

    /// Level the fade dictates at `tick` plus whether it has finished.
    fn level_at(&self, tick: i64) -> Option<(i64, bool)> {
        let f = self.active?;
        if tick >= f.end_tick {
            return Some((f.end_level, true));
        }
        let span = f.end_tick - f.start_tick;
        let done = tick - f.start_tick;
        let level = f.start_level + (f.end_level - f.start_level) * done.max(0) / span.max(1);
        Some((level, false))
    }
}

/// Convert the settings duration to an effective one. Positive values are
/// the transition length; negative values are a constant velocity in
/// percent of hardware range per second.
fn effective_duration_ms(duration_ms: i64, from: i64, to: i64, max_hw: i64, fade_type: FadeType) -> i64 {
    let mut dur = if duration_ms >= 0 {
        duration_ms
    } else {
        let pps = -duration_ms; // percent per second
        let delta_pct = ((to - from).abs() * 100).max(1) / max_hw.max(1);
        delta_pct * 1000 / pps.max(1)
    };
    dur = dur.clamp(0, FADE_DURATION_MAX_MS);
    if fade_type == FadeType::Dimming {
        dur = dur.max(DIM_FADE_DURATION_MIN_MS);
    }
    dur
}

/// Set the backlight immediately, cancelling any fade regardless of class.
/// Used by the state machine when a transition must not wait (active-call
/// blank, pre-resume nudge).
pub fn force_level(px: &Pipelines, core: &mut Core, level: i64) {
    finish_fade(core);
    core.backlight.set(level);
    px.display_brightness.exec(px, core, level);
}

/// Request a fade of `fade_type` towards `target`. Returns whether the
/// request was accepted (started or applied immediately).
pub fn set_fade_target(
    px: &Pipelines,
    core: &mut Core,
    fade_type: FadeType,
    target: i64,
    duration_ms: i64,
) -> bool {
    let current = core.fader.current_type();
    if !fade_allowed(current, fade_type) {
        debug!(?current, ?fade_type, "fade denied by arbitration");
        return false;
    }

    let from = core.backlight.cached().unwrap_or(0);
    let now = clock::boottime_ms();
    let dur = effective_duration_ms(duration_ms, from, target, core.levels.max_hw, fade_type);

    // Close enough, or too short to animate: set and be done.
    if (target - from).abs() <= 1 || dur < 3 * TICK_MS {
        finish_fade(core);
        core.backlight.set(target);
        px.display_brightness.exec(px, core, target);
        fade_completed(px, core, fade_type);
        return true;
    }

    core.fader.active = Some(Fade {
        fade_type,
        start_level: from,
        end_level: target,
        start_tick: now,
        end_tick: now + dur,
    });
    boost_sched(core);
    if !core.timers.is_scheduled(TimerKind::FadeTick) {
        core.timers.schedule_repeating(TimerKind::FadeTick, std::time::Duration::from_millis(TICK_MS as u64));
    }
    debug!(?fade_type, from, target, dur, "fade started");
    true
}

/// Convenience wrappers carrying the configured durations.
pub fn fade_default(px: &Pipelines, core: &mut Core, target: i64) -> bool {
    let d = core.settings.get().fade_duration_default;
    set_fade_target(px, core, FadeType::Default, target, d)
}

pub fn fade_dimming(px: &Pipelines, core: &mut Core, target: i64) -> bool {
    let d = core.settings.get().fade_duration_dim;
    set_fade_target(px, core, FadeType::Dimming, target, d)
}

pub fn fade_als(px: &Pipelines, core: &mut Core, target: i64) -> bool {
    let d = core.settings.get().fade_duration_als;
    set_fade_target(px, core, FadeType::Als, target, d)
}

pub fn fade_blank(px: &Pipelines, core: &mut Core) -> bool {
    let d = core.settings.get().fade_duration_blank;
    set_fade_target(px, core, FadeType::Blank, 0, d)
}

pub fn fade_unblank(px: &Pipelines, core: &mut Core, target: i64) -> bool {
    let d = core.settings.get().fade_duration_unblank;
    set_fade_target(px, core, FadeType::Unblank, target, d)
}

/// FadeTick timer handler.
pub fn on_tick(px: &Pipelines, core: &mut Core) {
    let now = clock::boottime_ms();
    match core.fader.level_at(now) {
        Some((level, finished)) => {
            core.backlight.set(level);
            px.display_brightness.exec(px, core, level);
            if finished {
                let t = core.fader.current_type();
                finish_fade(core);
                fade_completed(px, core, t);
            }
        }
        None => {
            // Stray tick after completion.
            core.timers.cancel_kind(TimerKind::FadeTick);
        }
    }
}

fn finish_fade(core: &mut Core) {
    core.fader.active = None;
    core.timers.cancel_kind(TimerKind::FadeTick);
    restore_sched(core);
}

fn fade_completed(px: &Pipelines, core: &mut Core, fade_type: FadeType) {
    // ALS tuning was blocked while a transition fade ran; re-check so any
    // ambient change observed meanwhile is picked up.
    if matches!(fade_type, FadeType::Default | FadeType::Dimming) {
        crate::display::als_recheck(px, core);
    }
    crate::display::stm_schedule_rethink(core);
}

fn boost_sched(core: &mut Core) {
    if core.fader.sched_boosted {
        return;
    }
    // SAFETY: plain syscalls on our own pid.
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if min < 0 || max < 0 {
            return;
        }
        let param = libc::sched_param { sched_priority: (min + max) / 2 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
            core.fader.sched_boosted = true;
        } else {
            // Not fatal: the fade just runs at normal priority.
            warn!("sched boost for fade failed");
        }
    }
}

fn restore_sched(core: &mut Core) {
    if !core.fader.sched_boosted {
        return;
    }
    unsafe {
        let param = libc::sched_param { sched_priority: 0 };
        if libc::sched_setscheduler(0, libc::SCHED_OTHER, &param) != 0 {
            warn!("sched restore after fade failed");
        }
    }
    core.fader.sched_boosted = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    #[test]
    fn matrix_idle_and_als_allow_all() {
        use FadeType::*;
        for new in [Idle, Default, Dimming, Als, Blank, Unblank] {
            assert!(fade_allowed(Idle, new));
            assert!(fade_allowed(Als, new));
        }
    }

    #[test]
    fn matrix_transition_blocks_als() {
        use FadeType::*;
        for cur in [Default, Dimming] {
            assert!(!fade_allowed(cur, Als));
            for new in [Idle, Default, Dimming, Blank, Unblank] {
                assert!(fade_allowed(cur, new));
            }
        }
    }

    #[test]
    fn matrix_blank_is_uninterruptible() {
        use FadeType::*;
        for new in [Idle, Default, Dimming, Als, Blank, Unblank] {
            assert!(!fade_allowed(Blank, new));
        }
    }

    #[test]
    fn matrix_unblank_allows_only_unblank() {
        use FadeType::*;
        assert!(fade_allowed(Unblank, Unblank));
        for new in [Idle, Default, Dimming, Als, Blank] {
            assert!(!fade_allowed(Unblank, new));
        }
    }

    #[test]
    fn duration_clipping() {
        assert_eq!(effective_duration_ms(9000, 0, 255, 255, FadeType::Default), 5000);
        assert_eq!(effective_duration_ms(50, 0, 255, 255, FadeType::Dimming), 100);
        assert_eq!(effective_duration_ms(50, 0, 255, 255, FadeType::Default), 50);
    }

    #[test]
    fn negative_duration_is_velocity() {
        // 100 percent span at 50 %/s = 2000 ms.
        let d = effective_duration_ms(-50, 0, 255, 255, FadeType::Default);
        assert!((1900..=2000).contains(&d), "got {d}");
    }

    #[test]
    fn linear_interpolation() {
        let mut fader = Fader::new();
        fader.active = Some(Fade {
            fade_type: FadeType::Default,
            start_level: 0,
            end_level: 100,
            start_tick: 1000,
            end_tick: 2000,
        });
        assert_eq!(fader.level_at(1000), Some((0, false)));
        assert_eq!(fader.level_at(1500), Some((50, false)));
        assert_eq!(fader.level_at(2000), Some((100, true)));
        assert_eq!(fader.level_at(5000), Some((100, true)));
    }

    #[test]
    fn small_delta_applies_immediately() {
        let (px, mut core, _rx) = Core::for_test();
        core.backlight.set(40);
        assert!(set_fade_target(&px, &mut core, FadeType::Default, 41, 1000));
        assert!(core.fader.is_idle());
        assert_eq!(core.backlight.cached(), Some(41));
    }

    #[test]
    fn fade_starts_and_denies_als() {
        let (px, mut core, _rx) = Core::for_test();
        core.backlight.set(100);
        assert!(set_fade_target(&px, &mut core, FadeType::Default, 200, 1000));
        assert_eq!(core.fader.current_type(), FadeType::Default);
        assert!(core.timers.is_scheduled(TimerKind::FadeTick));
        // ALS is blocked while the transition fade runs.
        assert!(!set_fade_target(&px, &mut core, FadeType::Als, 100, 1000));
        // But a blank fade may take over.
        assert!(set_fade_target(&px, &mut core, FadeType::Blank, 0, 1000));
        assert_eq!(core.fader.current_type(), FadeType::Blank);
    }
}
