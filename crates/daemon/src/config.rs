//! Daemon configuration from environment variables
//!
//! Every kernel node and flag file the daemon touches is overridable via the
//! environment. Production runs use the defaults; tests point the daemon at
//! scratch files.

use std::path::PathBuf;
use std::time::Duration;

/// Static daemon configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    // Wakelock / suspend control nodes
    pub wake_lock_path: PathBuf,
    pub wake_unlock_path: PathBuf,
    pub power_state_path: PathBuf,

    // Framebuffer power gate
    pub wait_for_fb_sleep_path: PathBuf,
    pub wait_for_fb_wake_path: PathBuf,
    pub fb_device_path: PathBuf,

    // Backlight
    pub brightness_path: PathBuf,
    pub max_brightness_path: PathBuf,

    // CABC and HBM panel nodes
    pub cabc_mode_path: PathBuf,
    pub cabc_available_modes_path: PathBuf,
    pub hbm_path: PathBuf,

    // Flag files
    pub init_done_path: PathBuf,
    pub bootstate_path: PathBuf,
    pub update_mode_path: PathBuf,

    // Settings store
    pub settings_path: PathBuf,

    // D-Bus peers
    pub compositor_service: String,
    pub compositor_object: String,
    pub compositor_interface: String,
    pub compositor_call_timeout: Duration,

    // Boot sequencing
    pub desktop_ready_timeout: Duration,
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}

fn env_secs(var: &str, default: u64) -> Duration {
    let secs = std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default);
    Duration::from_secs(secs)
}

impl DaemonConfig {
    /// Build configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            wake_lock_path: env_path("MCE_WAKE_LOCK_PATH", "/sys/power/wake_lock"),
            wake_unlock_path: env_path("MCE_WAKE_UNLOCK_PATH", "/sys/power/wake_unlock"),
            power_state_path: env_path("MCE_POWER_STATE_PATH", "/sys/power/state"),

            wait_for_fb_sleep_path: env_path(
                "MCE_WAIT_FOR_FB_SLEEP_PATH",
                "/sys/power/wait_for_fb_sleep",
            ),
            wait_for_fb_wake_path: env_path(
                "MCE_WAIT_FOR_FB_WAKE_PATH",
                "/sys/power/wait_for_fb_wake",
            ),
            fb_device_path: env_path("MCE_FB_DEVICE_PATH", "/dev/fb0"),

            brightness_path: env_path(
                "MCE_BRIGHTNESS_PATH",
                "/sys/class/backlight/display/brightness",
            ),
            max_brightness_path: env_path(
                "MCE_MAX_BRIGHTNESS_PATH",
                "/sys/class/backlight/display/max_brightness",
            ),

            cabc_mode_path: env_path("MCE_CABC_MODE_PATH", "/sys/class/backlight/display/cabc_mode"),
            cabc_available_modes_path: env_path(
                "MCE_CABC_AVAILABLE_MODES_PATH",
                "/sys/class/backlight/display/cabc_available_modes",
            ),
            hbm_path: env_path("MCE_HBM_PATH", "/sys/class/backlight/display/hbm_mode"),

            init_done_path: env_path("MCE_INIT_DONE_PATH", "/run/systemd/boot-status/init-done"),
            bootstate_path: env_path("MCE_BOOTSTATE_PATH", "/run/systemd/boot-status/bootstate"),
            update_mode_path: env_path("MCE_UPDATE_MODE_PATH", "/tmp/os-update-running"),

            settings_path: env_path("MCE_SETTINGS_PATH", "/var/lib/mce/settings.json"),

            compositor_service: std::env::var("MCE_COMPOSITOR_SERVICE")
                .unwrap_or_else(|_| "org.nemomobile.compositor".to_string()),
            compositor_object: std::env::var("MCE_COMPOSITOR_OBJECT")
                .unwrap_or_else(|_| "/".to_string()),
            compositor_interface: std::env::var("MCE_COMPOSITOR_INTERFACE")
                .unwrap_or_else(|_| "org.nemomobile.compositor".to_string()),
            compositor_call_timeout: env_secs("MCE_COMPOSITOR_CALL_TIMEOUT_SECS", 120),

            desktop_ready_timeout: env_secs("MCE_DESKTOP_READY_TIMEOUT_SECS", 90),
        }
    }

    /// Configuration rooted in a scratch directory, for tests.
    #[cfg(test)]
    pub fn for_test(root: &std::path::Path) -> Self {
        let p = |name: &str| root.join(name);
        Self {
            wake_lock_path: p("wake_lock"),
            wake_unlock_path: p("wake_unlock"),
            power_state_path: p("state"),
            wait_for_fb_sleep_path: p("wait_for_fb_sleep"),
            wait_for_fb_wake_path: p("wait_for_fb_wake"),
            fb_device_path: p("fb0"),
            brightness_path: p("brightness"),
            max_brightness_path: p("max_brightness"),
            cabc_mode_path: p("cabc_mode"),
            cabc_available_modes_path: p("cabc_available_modes"),
            hbm_path: p("hbm_mode"),
            init_done_path: p("init-done"),
            bootstate_path: p("bootstate"),
            update_mode_path: p("os-update-running"),
            settings_path: p("settings.json"),
            compositor_service: "org.nemomobile.compositor".to_string(),
            compositor_object: "/".to_string(),
            compositor_interface: "org.nemomobile.compositor".to_string(),
            compositor_call_timeout: Duration::from_secs(120),
            desktop_ready_timeout: Duration::from_secs(90),
        }
    }
}
