//! The process-wide datapipe registry
//!
//! Every pipe is created here at startup and lives for the whole process.
//! Modules reach the pipes through this registry both to execute them and
//! to install their hook batches.

use crate::datapipe::Datapipe;
use crate::types::{
    AlarmState, AudioRoute, CallState, ChargerState, CoverState, DisplayState, SystemState,
    UiException, UserActivity,
};

/// All datapipes, by name. Sensor-fed pipes are read-only: their cache is
/// the only source of truth and filter chains evolve it.
pub struct Pipelines {
    // Display state plumbing
    pub display_state_req: Datapipe<DisplayState>,
    pub display_state_curr: Datapipe<DisplayState>,
    pub display_state_next: Datapipe<DisplayState>,
    pub display_brightness: Datapipe<i64>,

    // Sensors and covers
    pub proximity: Datapipe<CoverState>,
    pub lid: Datapipe<CoverState>,
    pub keyboard_slide: Datapipe<CoverState>,

    // Telephony, alarms, audio
    pub call_state: Datapipe<CallState>,
    pub alarm_state: Datapipe<AlarmState>,
    pub audio_route: Datapipe<AudioRoute>,

    // System mode
    pub system_state: Datapipe<SystemState>,
    pub charger_state: Datapipe<ChargerState>,
    pub exception_state: Datapipe<UiException>,
    pub tklock: Datapipe<bool>,
    pub power_save_mode: Datapipe<bool>,
    pub update_mode: Datapipe<bool>,
    pub init_done: Datapipe<bool>,
    pub bootstate_user: Datapipe<bool>,
    pub packagekit_locked: Datapipe<bool>,

    // Activity and resume
    pub user_activity: Datapipe<UserActivity>,
    /// Device orientation in degrees, from the orientation sensor.
    pub orientation: Datapipe<i32>,
    /// Duration of a freshly detected suspend period, milliseconds.
    pub resume_detected: Datapipe<i64>,

    /// High-brightness boost level wanted by the ambient-light filter.
    pub hbm_request: Datapipe<i64>,

    // Outbound to sibling modules
    pub sensors_suspended: Datapipe<bool>,
    pub led_pattern_activate: Datapipe<&'static str>,
    pub led_pattern_deactivate: Datapipe<&'static str>,

    #[cfg(test)]
    pub test_pipe: Datapipe<i64>,
    #[cfg(test)]
    pub test_ro_pipe: Datapipe<i64>,
}

impl Pipelines {
    pub fn new() -> Self {
        Self {
            display_state_req: Datapipe::new("display_state_req", false, DisplayState::Undef),
            display_state_curr: Datapipe::new("display_state_curr", false, DisplayState::Undef),
            display_state_next: Datapipe::new("display_state_next", false, DisplayState::Undef),
            display_brightness: Datapipe::new("display_brightness", false, 0),

            proximity: Datapipe::new("proximity", true, CoverState::Undef),
            lid: Datapipe::new("lid", true, CoverState::Undef),
            keyboard_slide: Datapipe::new("keyboard_slide", true, CoverState::Undef),

            call_state: Datapipe::new("call_state", false, CallState::Invalid),
            alarm_state: Datapipe::new("alarm_state", false, AlarmState::Invalid),
            audio_route: Datapipe::new("audio_route", false, AudioRoute::Undef),

            system_state: Datapipe::new("system_state", false, SystemState::Undef),
            charger_state: Datapipe::new("charger_state", false, ChargerState::Undef),
            exception_state: Datapipe::new("exception_state", false, UiException::NONE),
            tklock: Datapipe::new("tklock", false, false),
            power_save_mode: Datapipe::new("power_save_mode", false, false),
            update_mode: Datapipe::new("update_mode", false, false),
            init_done: Datapipe::new("init_done", false, false),
            bootstate_user: Datapipe::new("bootstate_user", false, false),
            packagekit_locked: Datapipe::new("packagekit_locked", false, false),

            user_activity: Datapipe::new("user_activity", false, UserActivity),
            orientation: Datapipe::new("orientation", true, 0),
            resume_detected: Datapipe::new("resume_detected", false, 0),

            hbm_request: Datapipe::new("hbm_request", false, 0),

            sensors_suspended: Datapipe::new("sensors_suspended", false, false),
            led_pattern_activate: Datapipe::new("led_pattern_activate", false, ""),
            led_pattern_deactivate: Datapipe::new("led_pattern_deactivate", false, ""),

            #[cfg(test)]
            test_pipe: Datapipe::new("test_pipe", false, 0),
            #[cfg(test)]
            test_ro_pipe: Datapipe::new("test_ro_pipe", true, 0),
        }
    }
}

impl Default for Pipelines {
    fn default() -> Self {
        Self::new()
    }
}
