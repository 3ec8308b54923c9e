//! Shared state vocabulary for the mode control core
//!
//! These enums are the payloads carried by the datapipes. Default values
//! are the "not yet observed" variants so that modules coming up in any
//! order see a well-defined world.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Display power state.
///
/// Stable variants are the only ones ever published on the `display_state_curr`
/// pipe; the transient variants appear on `display_state_next` while the state
/// machine is mid-transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    /// Display fully off, panel powered down.
    Off,
    /// Low-power mode, screen dark.
    LpmOff,
    /// Low-power mode, content visible.
    LpmOn,
    /// Dimmed but on.
    Dim,
    /// Fully on.
    On,
    /// Transient: powering up.
    PowerUp,
    /// Transient: powering down.
    PowerDown,
    /// Not yet decided.
    Undef,
}

impl DisplayState {
    /// Whether this is a stable state (may be published as `curr`).
    pub fn is_stable(self) -> bool {
        !matches!(self, Self::PowerUp | Self::PowerDown | Self::Undef)
    }

    /// Whether the panel must be powered for this state.
    pub fn needs_power(self) -> bool {
        matches!(self, Self::On | Self::Dim | Self::LpmOn)
    }

    /// The wire string used by `display_status_ind` / `get_display_status`.
    pub fn status_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Dim => "dim",
            _ => "off",
        }
    }
}

impl Default for DisplayState {
    fn default() -> Self {
        Self::Undef
    }
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "OFF",
            Self::LpmOff => "LPM_OFF",
            Self::LpmOn => "LPM_ON",
            Self::Dim => "DIM",
            Self::On => "ON",
            Self::PowerUp => "POWER_UP",
            Self::PowerDown => "POWER_DOWN",
            Self::Undef => "UNDEF",
        };
        f.write_str(s)
    }
}

/// Availability of a tracked D-Bus peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Undef,
    Running,
    Stopped,
}

/// Binary cover / sensor state (proximity, lid, camera lens).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverState {
    #[default]
    Undef,
    Open,
    Closed,
}

/// Alarm UI state as reported by the alarm service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlarmState {
    #[default]
    Invalid,
    Off,
    Visible,
    Ringing,
}

impl AlarmState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Visible | Self::Ringing)
    }
}

/// Telephony call state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Invalid,
    None,
    Ringing,
    Active,
    /// Emergency service call.
    Service,
}

impl CallState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ringing | Self::Active | Self::Service)
    }
}

/// Where call audio is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioRoute {
    #[default]
    Undef,
    Handset,
    Speaker,
    Headset,
}

/// Overall system run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemState {
    #[default]
    Undef,
    /// Normal user session.
    User,
    /// Alarm-only mode; the device is otherwise powered down.
    ActDead,
    Shutdown,
    Reboot,
}

impl SystemState {
    pub fn is_going_down(self) -> bool {
        matches!(self, Self::Shutdown | Self::Reboot)
    }
}

/// Exceptional UI conditions that keep the display up and/or block suspend.
///
/// A plain bitset; kept hand-rolled so it stays `Copy` and trivially
/// constructable in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UiException(u32);

impl UiException {
    pub const NONE: UiException = UiException(0);
    pub const CALL: UiException = UiException(1 << 0);
    pub const ALARM: UiException = UiException(1 << 1);
    pub const NOTIF: UiException = UiException(1 << 2);
    pub const LINGER: UiException = UiException(1 << 3);

    pub fn contains(self, bit: UiException) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn with(self, bit: UiException) -> UiException {
        UiException(self.0 | bit.0)
    }

    pub fn without(self, bit: UiException) -> UiException {
        UiException(self.0 & !bit.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Charger connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargerState {
    #[default]
    Undef,
    On,
    Off,
}

/// Display blanking inhibit policy selected by settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InhibitMode {
    #[default]
    Off,
    StayOnWithCharger,
    StayDimWithCharger,
    StayOn,
    StayDim,
}

/// Keyboard-slide blanking inhibit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbdSlideInhibitMode {
    #[default]
    Off,
    StayOnWhenOpen,
    StayDimWhenOpen,
}

/// What a blanking-pause request is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankingPauseMode {
    Disabled,
    #[default]
    KeepOn,
    AllowDim,
}

/// How deep the kernel may take the system while we are idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuspendLevel {
    /// No suspending at all.
    On,
    /// Early suspend only (display/input power down, CPU stays up).
    Early,
    /// Full suspend allowed.
    Late,
}

/// User-facing gate over the suspend policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendPolicySetting {
    Disabled,
    EarlyOnly,
    #[default]
    Enabled,
}

/// Content-adaptive backlight control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CabcMode {
    Off,
    #[default]
    Ui,
    StillImage,
    MovingImage,
}

impl CabcMode {
    /// Sysfs attribute string for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Ui => "ui",
            Self::StillImage => "still-image",
            Self::MovingImage => "moving-image",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "ui" => Some(Self::Ui),
            "still-image" => Some(Self::StillImage),
            "moving-image" => Some(Self::MovingImage),
            _ => None,
        }
    }
}

/// A user activity report; payload is unused, arrival is the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserActivity;
