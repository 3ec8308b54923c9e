//! Live-bound settings store
//!
//! Typed configuration keys persisted as JSON. Values are clamped into
//! their valid ranges on load (and the clamped form is written back, so the
//! file never stays out of range). A reload produces the set of changed
//! keys so the engine can re-run exactly the policies that care.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event::SettingKey;
use crate::sysfs;
use crate::types::{BlankingPauseMode, InhibitMode, KbdSlideInhibitMode, SuspendPolicySetting};

/// All live settings with their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Brightness: level is 1..=brightness_levels, each step is
    // brightness_step_size percent of hardware maximum.
    pub brightness_level: i64,
    pub brightness_levels: i64,
    pub brightness_step_size: i64,

    pub dim_static_pct: i64,
    pub dim_dynamic_pct: i64,
    pub dim_compositor_lo_pct: i64,
    pub dim_compositor_hi_pct: i64,

    pub lpm_brightness_pct: i64,
    pub psm_brightness_pct: i64,

    // Blank timeouts, seconds.
    pub blank_timeout: i64,
    pub blank_from_lockscreen_timeout: i64,
    pub blank_from_lpm_on_timeout: i64,
    pub blank_from_lpm_off_timeout: i64,

    // Dim timeout, seconds, plus the menu of allowed values adaptive
    // dimming may promote to.
    pub dim_timeout: i64,
    pub possible_dim_timeouts: Vec<i64>,

    pub adaptive_dimming_enabled: bool,
    /// Adaptive window length, milliseconds.
    pub adaptive_dimming_threshold: i64,

    pub low_power_mode_enabled: bool,

    pub blanking_inhibit_mode: InhibitMode,
    pub kbd_slide_inhibit_mode: KbdSlideInhibitMode,
    pub never_blank: bool,

    /// Compositor kill delay, seconds, for the watchdog core-dump stage.
    pub compositor_kill_delay: i64,

    // Fade durations, milliseconds.
    pub fade_duration_default: i64,
    pub fade_duration_dim: i64,
    pub fade_duration_als: i64,
    pub fade_duration_blank: i64,
    pub fade_duration_unblank: i64,

    /// Remap display-off requests to LPM.
    pub off_override_use_lpm: bool,

    pub orientation_sensor_enabled: bool,
    pub flipover_gesture_enabled: bool,
    pub orientation_change_is_activity: bool,

    pub blanking_pause_mode: BlankingPauseMode,
    pub suspend_policy: SuspendPolicySetting,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            brightness_level: 3,
            brightness_levels: 5,
            brightness_step_size: 20,

            dim_static_pct: 3,
            dim_dynamic_pct: 50,
            dim_compositor_lo_pct: 50,
            dim_compositor_hi_pct: 100,

            lpm_brightness_pct: 5,
            psm_brightness_pct: 40,

            blank_timeout: 3,
            blank_from_lockscreen_timeout: 5,
            blank_from_lpm_on_timeout: 5,
            blank_from_lpm_off_timeout: 5,

            dim_timeout: 30,
            possible_dim_timeouts: vec![15, 30, 60, 120, 180, 300, 600],

            adaptive_dimming_enabled: true,
            adaptive_dimming_threshold: 3000,

            low_power_mode_enabled: false,

            blanking_inhibit_mode: InhibitMode::Off,
            kbd_slide_inhibit_mode: KbdSlideInhibitMode::Off,
            never_blank: false,

            compositor_kill_delay: 30,

            fade_duration_default: 150,
            fade_duration_dim: 600,
            fade_duration_als: 1000,
            fade_duration_blank: 100,
            fade_duration_unblank: 90,

            off_override_use_lpm: false,

            orientation_sensor_enabled: true,
            flipover_gesture_enabled: false,
            orientation_change_is_activity: true,

            blanking_pause_mode: BlankingPauseMode::KeepOn,
            suspend_policy: SuspendPolicySetting::Enabled,
        }
    }
}

impl Settings {
    /// Clamp every numeric field into its valid range. Returns true when
    /// anything had to change, in which case the caller writes the file
    /// back.
    pub fn clamp_ranges(&mut self) -> bool {
        let before = self.clone();

        self.brightness_levels = self.brightness_levels.clamp(1, 100);
        self.brightness_step_size = self.brightness_step_size.clamp(1, 100);
        self.brightness_level = self.brightness_level.clamp(1, self.brightness_levels);

        self.dim_static_pct = self.dim_static_pct.clamp(1, 100);
        self.dim_dynamic_pct = self.dim_dynamic_pct.clamp(1, 100);
        self.dim_compositor_lo_pct = self.dim_compositor_lo_pct.clamp(0, 100);
        self.dim_compositor_hi_pct = self.dim_compositor_hi_pct.clamp(self.dim_compositor_lo_pct, 100);

        self.lpm_brightness_pct = self.lpm_brightness_pct.clamp(0, 100);
        self.psm_brightness_pct = self.psm_brightness_pct.clamp(1, 100);

        self.blank_timeout = self.blank_timeout.max(1);
        self.blank_from_lockscreen_timeout = self.blank_from_lockscreen_timeout.max(1);
        self.blank_from_lpm_on_timeout = self.blank_from_lpm_on_timeout.max(1);
        self.blank_from_lpm_off_timeout = self.blank_from_lpm_off_timeout.max(1);

        self.dim_timeout = self.dim_timeout.max(1);
        self.possible_dim_timeouts.retain(|&t| t > 0);
        self.possible_dim_timeouts.sort_unstable();
        self.possible_dim_timeouts.dedup();
        if self.possible_dim_timeouts.is_empty() {
            self.possible_dim_timeouts = vec![self.dim_timeout];
        }

        self.adaptive_dimming_threshold = self.adaptive_dimming_threshold.clamp(100, 60_000);
        self.compositor_kill_delay = self.compositor_kill_delay.clamp(5, 600);

        for d in [
            &mut self.fade_duration_default,
            &mut self.fade_duration_dim,
            &mut self.fade_duration_als,
            &mut self.fade_duration_blank,
            &mut self.fade_duration_unblank,
        ] {
            *d = (*d).clamp(0, 5000);
        }

        *self != before
    }

    /// Keys whose backing fields differ between two snapshots.
    pub fn diff_keys(&self, other: &Settings) -> Vec<SettingKey> {
        let mut keys = Vec::new();
        if self.brightness_level != other.brightness_level
            || self.brightness_levels != other.brightness_levels
            || self.brightness_step_size != other.brightness_step_size
            || self.dim_static_pct != other.dim_static_pct
            || self.dim_dynamic_pct != other.dim_dynamic_pct
            || self.dim_compositor_lo_pct != other.dim_compositor_lo_pct
            || self.dim_compositor_hi_pct != other.dim_compositor_hi_pct
            || self.lpm_brightness_pct != other.lpm_brightness_pct
            || self.psm_brightness_pct != other.psm_brightness_pct
        {
            keys.push(SettingKey::BrightnessLevel);
        }
        if self.dim_timeout != other.dim_timeout
            || self.possible_dim_timeouts != other.possible_dim_timeouts
        {
            keys.push(SettingKey::DimTimeout);
        }
        if self.blank_timeout != other.blank_timeout
            || self.blank_from_lockscreen_timeout != other.blank_from_lockscreen_timeout
            || self.blank_from_lpm_on_timeout != other.blank_from_lpm_on_timeout
            || self.blank_from_lpm_off_timeout != other.blank_from_lpm_off_timeout
        {
            keys.push(SettingKey::BlankTimeouts);
        }
        if self.adaptive_dimming_enabled != other.adaptive_dimming_enabled
            || self.adaptive_dimming_threshold != other.adaptive_dimming_threshold
        {
            keys.push(SettingKey::AdaptiveDim);
        }
        if self.blanking_inhibit_mode != other.blanking_inhibit_mode {
            keys.push(SettingKey::InhibitMode);
        }
        if self.kbd_slide_inhibit_mode != other.kbd_slide_inhibit_mode {
            keys.push(SettingKey::KbdSlideInhibitMode);
        }
        if self.never_blank != other.never_blank {
            keys.push(SettingKey::NeverBlank);
        }
        if self.low_power_mode_enabled != other.low_power_mode_enabled {
            keys.push(SettingKey::LowPowerMode);
        }
        if self.compositor_kill_delay != other.compositor_kill_delay {
            keys.push(SettingKey::CompositorKillDelay);
        }
        if self.fade_duration_default != other.fade_duration_default
            || self.fade_duration_dim != other.fade_duration_dim
            || self.fade_duration_als != other.fade_duration_als
            || self.fade_duration_blank != other.fade_duration_blank
            || self.fade_duration_unblank != other.fade_duration_unblank
        {
            keys.push(SettingKey::FadeDurations);
        }
        if self.off_override_use_lpm != other.off_override_use_lpm {
            keys.push(SettingKey::OffOverride);
        }
        if self.blanking_pause_mode != other.blanking_pause_mode {
            keys.push(SettingKey::BlankingPauseMode);
        }
        if self.suspend_policy != other.suspend_policy {
            keys.push(SettingKey::SuspendPolicy);
        }
        if self.orientation_sensor_enabled != other.orientation_sensor_enabled
            || self.flipover_gesture_enabled != other.flipover_gesture_enabled
            || self.orientation_change_is_activity != other.orientation_change_is_activity
        {
            keys.push(SettingKey::Orientation);
        }
        keys
    }
}

/// The store: settings plus their backing file.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: Settings,
}

impl SettingsStore {
    /// Load from `path`; a missing or unparsable file yields defaults. Out
    /// of range values are clamped and the clamped file is written back.
    pub fn load(path: PathBuf) -> Self {
        let mut current = match sysfs::load_file(&path) {
            Ok(raw) => match serde_json::from_slice::<Settings>(&raw) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings unparsable, using defaults");
                    Settings::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no settings file, using defaults");
                Settings::default()
            }
        };
        let store = if current.clamp_ranges() {
            let s = Self { path, current };
            s.save();
            s
        } else {
            Self { path, current }
        };
        store
    }

    pub fn get(&self) -> &Settings {
        &self.current
    }

    /// Replace the whole snapshot (already-clamped) and persist; returns
    /// the changed keys.
    pub fn replace(&mut self, mut next: Settings) -> Vec<SettingKey> {
        next.clamp_ranges();
        let keys = next.diff_keys(&self.current);
        if !keys.is_empty() {
            self.current = next;
            self.save();
        }
        keys
    }

    /// Re-read the backing file; returns the changed keys.
    pub fn reload(&mut self) -> Vec<SettingKey> {
        let next = match sysfs::load_file(&self.path) {
            Ok(raw) => match serde_json::from_slice::<Settings>(&raw) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "settings reload unparsable, keeping current");
                    return Vec::new();
                }
            },
            Err(_) => return Vec::new(),
        };
        self.replace(next)
    }

    /// Mutate one or more fields in place and persist; returns the changed
    /// keys for dispatch.
    pub fn update(&mut self, mutate: impl FnOnce(&mut Settings)) -> Vec<SettingKey> {
        let mut next = self.current.clone();
        mutate(&mut next);
        self.replace(next)
    }

    fn save(&self) {
        match serde_json::to_vec_pretty(&self.current) {
            Ok(data) => {
                if let Some(parent) = self.path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = sysfs::update_file_atomic(&self.path, &data, true) {
                    warn!(path = %self.path.display(), error = %e, "settings save failed");
                }
            }
            Err(e) => warn!(error = %e, "settings serialize failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let mut s = Settings::default();
        assert!(!s.clamp_ranges(), "defaults must not need clamping");
    }

    #[test]
    fn out_of_range_values_clamp() {
        let mut s = Settings::default();
        s.brightness_level = 999;
        s.dim_dynamic_pct = 400;
        s.dim_timeout = -5;
        s.fade_duration_blank = 99_999;
        assert!(s.clamp_ranges());
        assert_eq!(s.brightness_level, s.brightness_levels);
        assert_eq!(s.dim_dynamic_pct, 100);
        assert_eq!(s.dim_timeout, 1);
        assert_eq!(s.fade_duration_blank, 5000);
    }

    #[test]
    fn possible_timeouts_sorted_deduped() {
        let mut s = Settings::default();
        s.possible_dim_timeouts = vec![60, 15, 60, -3, 30];
        s.clamp_ranges();
        assert_eq!(s.possible_dim_timeouts, vec![15, 30, 60]);
    }

    #[test]
    fn store_roundtrip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut store = SettingsStore::load(path.clone());
        let keys = store.update(|s| s.dim_timeout = 60);
        assert_eq!(keys, vec![SettingKey::DimTimeout]);

        // A fresh store sees the persisted value.
        let store2 = SettingsStore::load(path.clone());
        assert_eq!(store2.get().dim_timeout, 60);

        // External edit + reload reports the changed key.
        let mut edited: Settings = store2.get().clone();
        edited.never_blank = true;
        std::fs::write(&path, serde_json::to_vec(&edited).unwrap()).unwrap();
        let keys = store.reload();
        assert!(keys.contains(&SettingKey::NeverBlank));
        assert!(store.get().never_blank);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = SettingsStore::load(path);
        assert_eq!(store.get(), &Settings::default());
    }

    #[test]
    fn unchanged_update_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("settings.json");
        let mut store = SettingsStore::load(store_path);
        let keys = store.update(|_| {});
        assert!(keys.is_empty());
    }
}
