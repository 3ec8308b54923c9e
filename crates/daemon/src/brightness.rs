//! Backlight level bookkeeping
//!
//! Derives the hardware levels the fader animates between from the
//! settings and the panel's reported maximum:
//!
//! - `on_level`: configured percent of hardware maximum, scaled down in
//!   power-save mode;
//! - `dim_level`: the smaller of a static percent of maximum and a dynamic
//!   percent of `on_level` (so dim can never exceed on);
//! - `lpm_level`: fixed low percent for low-power rendering;
//! - `resume_level`: what the panel is driven to on the next power-up.
//!
//! When the backlight-only dim step would be too small to notice, a
//! compositor-side dim opacity is derived via a linear map between two
//! threshold ratios.

use tracing::debug;

use crate::settings::Settings;

/// Opacity ceiling for compositor-side dimming, percent.
const DIM_OPACITY_MAX_PCT: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrightnessLevels {
    /// Panel maximum from `max_brightness`, hardware units.
    pub max_hw: i64,
    pub on_level: i64,
    pub dim_level: i64,
    pub lpm_level: i64,
    /// Level applied when the display next powers up.
    pub resume_level: i64,
    /// Compositor-side dim opacity percent (0 when backlight dimming is
    /// visible enough on its own).
    pub dim_opacity_pct: i64,
}

impl BrightnessLevels {
    pub fn new(max_hw: i64) -> Self {
        Self {
            max_hw: max_hw.max(1),
            on_level: 1,
            dim_level: 1,
            lpm_level: 1,
            resume_level: 1,
            dim_opacity_pct: 0,
        }
    }

    /// Percent of hardware maximum, with a floor of one hardware unit so a
    /// nonzero percent never rounds to black.
    fn pct_to_hw(&self, pct: i64) -> i64 {
        if pct <= 0 {
            0
        } else {
            (self.max_hw * pct.min(100) / 100).max(1)
        }
    }

    /// Recompute every derived level from the settings.
    pub fn recompute(&mut self, s: &Settings, power_save: bool) {
        let mut on_pct = (s.brightness_level * s.brightness_step_size)
            .clamp(1, 100);
        if power_save {
            on_pct = on_pct.min(s.psm_brightness_pct.clamp(1, 100));
        }
        self.on_level = self.pct_to_hw(on_pct);

        // Static percent of max vs dynamic percent of on; the dynamic leg
        // is clamped to 100 so dim can never exceed on.
        let dim_static = self.pct_to_hw(s.dim_static_pct.clamp(1, 100));
        let dim_dynamic = (self.on_level * s.dim_dynamic_pct.clamp(1, 100) / 100).max(1);
        self.dim_level = dim_static.min(dim_dynamic).min(self.on_level);

        self.lpm_level = self.pct_to_hw(s.lpm_brightness_pct.clamp(0, 100));

        self.dim_opacity_pct = self.compositor_dim_opacity(s);

        debug!(
            on = self.on_level,
            dim = self.dim_level,
            lpm = self.lpm_level,
            opacity = self.dim_opacity_pct,
            "brightness levels recomputed"
        );
    }

    /// When dim/on ratio is above the high threshold the backlight step is
    /// invisible and the compositor must dim at full opacity; below the low
    /// threshold the backlight alone suffices. Linear in between.
    fn compositor_dim_opacity(&self, s: &Settings) -> i64 {
        let lo = s.dim_compositor_lo_pct.clamp(0, 100);
        let hi = s.dim_compositor_hi_pct.clamp(lo, 100);
        let ratio = if self.on_level > 0 { self.dim_level * 100 / self.on_level } else { 0 };
        if ratio <= lo {
            0
        } else if ratio >= hi || hi == lo {
            DIM_OPACITY_MAX_PCT
        } else {
            DIM_OPACITY_MAX_PCT * (ratio - lo) / (hi - lo)
        }
    }

    /// Record the level the next power-up should restore.
    pub fn set_resume_level(&mut self, level: i64) {
        self.resume_level = level.clamp(1, self.max_hw);
    }

    /// Target level for a stable display state.
    pub fn level_for_state(&self, state: crate::types::DisplayState) -> i64 {
        use crate::types::DisplayState::*;
        match state {
            On => self.on_level,
            Dim => self.dim_level,
            LpmOn => self.lpm_level,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn levels() -> (BrightnessLevels, Settings) {
        (BrightnessLevels::new(255), Settings::default())
    }

    #[test]
    fn on_level_tracks_setting() {
        let (mut b, mut s) = levels();
        s.brightness_level = 3;
        s.brightness_step_size = 20; // 60 %
        b.recompute(&s, false);
        assert_eq!(b.on_level, 255 * 60 / 100);
    }

    #[test]
    fn power_save_caps_on_level() {
        let (mut b, mut s) = levels();
        s.brightness_level = 5;
        s.brightness_step_size = 20; // 100 %
        s.psm_brightness_pct = 30;
        b.recompute(&s, true);
        assert_eq!(b.on_level, 255 * 30 / 100);
    }

    #[test]
    fn dim_never_exceeds_on() {
        let (mut b, mut s) = levels();
        s.brightness_level = 1;
        s.brightness_step_size = 10; // on = 10 % of max
        s.dim_static_pct = 90; // static leg larger than on
        s.dim_dynamic_pct = 100;
        b.recompute(&s, false);
        assert!(b.dim_level <= b.on_level);
    }

    #[test]
    fn dim_is_min_of_both_legs() {
        let (mut b, mut s) = levels();
        s.brightness_level = 5;
        s.brightness_step_size = 20; // on = max
        s.dim_static_pct = 3;
        s.dim_dynamic_pct = 50;
        b.recompute(&s, false);
        // static leg: 3 % of 255 = 7; dynamic: 50 % of 255 = 127.
        assert_eq!(b.dim_level, (255 * 3 / 100).max(1));
    }

    #[test]
    fn opacity_linear_between_thresholds() {
        // Power-of-ten maximum keeps the ratio arithmetic exact.
        let mut b = BrightnessLevels::new(100);
        let mut s = Settings::default();
        s.dim_compositor_lo_pct = 20;
        s.dim_compositor_hi_pct = 80;
        // Make dim/on ratio 50 %: on = max, dim dynamic 50 %.
        s.brightness_level = 5;
        s.brightness_step_size = 20;
        s.dim_static_pct = 100;
        s.dim_dynamic_pct = 50;
        b.recompute(&s, false);
        assert_eq!(b.dim_level * 100 / b.on_level, 50);
        let expect = DIM_OPACITY_MAX_PCT * (50 - 20) / (80 - 20);
        assert_eq!(b.dim_opacity_pct, expect);
    }

    #[test]
    fn opacity_edges() {
        let (mut b, mut s) = levels();
        s.dim_compositor_lo_pct = 20;
        s.dim_compositor_hi_pct = 80;
        s.brightness_level = 5;
        s.brightness_step_size = 20;
        s.dim_static_pct = 10; // ratio 10 % <= lo
        s.dim_dynamic_pct = 100;
        b.recompute(&s, false);
        assert_eq!(b.dim_opacity_pct, 0);
        s.dim_static_pct = 100;
        s.dim_dynamic_pct = 90; // ratio 90 % >= hi
        b.recompute(&s, false);
        assert_eq!(b.dim_opacity_pct, DIM_OPACITY_MAX_PCT);
    }

    #[test]
    fn resume_level_clamped() {
        let (mut b, _s) = levels();
        b.set_resume_level(0);
        assert_eq!(b.resume_level, 1);
        b.set_resume_level(9999);
        assert_eq!(b.resume_level, 255);
    }

    #[test]
    fn state_levels() {
        let (mut b, s) = levels();
        b.recompute(&s, false);
        use crate::types::DisplayState::*;
        assert_eq!(b.level_for_state(On), b.on_level);
        assert_eq!(b.level_for_state(Dim), b.dim_level);
        assert_eq!(b.level_for_state(LpmOn), b.lpm_level);
        assert_eq!(b.level_for_state(Off), 0);
        assert_eq!(b.level_for_state(LpmOff), 0);
    }
}
