//! Compositor unresponsiveness watchdog
//!
//! Armed whenever a `setUpdatesEnabled` call goes out; a reply cancels the
//! chain. Escalation:
//!
//! 1. panic LED after a delay that shrinks from 15 s during early boot to
//!    3 s in steady state;
//! 2. core dump at the configured kill delay from the call: verify no
//!    debugger is attached (ptrace attach/detach probe), then
//!    `SIGXCPU` + `SIGCONT`;
//! 3. `SIGKILL` 25 s after the core-dump attempt;
//! 4. verify 5 s later that the process is gone; if not, give up and clear
//!    the alert.
//!
//! If the owner PID could not be resolved by the time a lethal stage
//! fires, the stage degrades to clearing the alert instead of signalling
//! an unrelated process.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::Core;
use crate::pipelines::Pipelines;
use crate::timers::TimerKind;

/// LED pattern names handed to the LED pipes.
pub const PATTERN_DISPLAY_UNRESPONSIVE: &str = "PatternDisplayUnresponsive";

/// Steady-state LED delay.
const LED_DELAY_MIN: Duration = Duration::from_secs(3);
/// LED delay right after daemon start.
const LED_DELAY_MAX: Duration = Duration::from_secs(15);
/// The LED delay shrinks by one second per this much uptime.
const LED_DELAY_DECAY_STEP: Duration = Duration::from_secs(30);

const KILL_AFTER_CORE: Duration = Duration::from_secs(25);
const VERIFY_AFTER_KILL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchdogStage {
    #[default]
    Idle,
    /// Waiting to light the panic LED.
    LedPending,
    /// LED on, waiting for the core-dump deadline.
    CorePending,
    /// Core dump signalled, waiting for the kill deadline.
    KillPending,
    /// SIGKILL sent, waiting to verify the process is gone.
    VerifyPending,
}

#[derive(Debug)]
pub struct Watchdog {
    pub stage: WatchdogStage,
    started: Instant,
}

impl Watchdog {
    pub fn new() -> Self {
        Self { stage: WatchdogStage::Idle, started: Instant::now() }
    }

    /// Panic-LED delay for the current daemon uptime.
    pub fn led_delay(&self, now: Instant) -> Duration {
        let uptime = now.saturating_duration_since(self.started);
        let steps = (uptime.as_secs() / LED_DELAY_DECAY_STEP.as_secs()).min(
            LED_DELAY_MAX.as_secs() - LED_DELAY_MIN.as_secs(),
        );
        LED_DELAY_MAX - Duration::from_secs(steps)
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm the chain for a freshly dispatched call.
pub fn arm(_px: &Pipelines, core: &mut Core) {
    cancel_timers(core);
    core.watchdog.stage = WatchdogStage::LedPending;
    let delay = core.watchdog.led_delay(Instant::now());
    core.timers.schedule(TimerKind::WatchdogLed, delay);
}

/// A reply landed (or the peer dropped off the bus): stop the chain and
/// clear the alert.
pub fn cancel(px: &Pipelines, core: &mut Core) {
    if core.watchdog.stage == WatchdogStage::Idle {
        return;
    }
    cancel_timers(core);
    core.watchdog.stage = WatchdogStage::Idle;
    led_off(px, core);
}

fn cancel_timers(core: &mut Core) {
    core.timers.cancel_kind(TimerKind::WatchdogLed);
    core.timers.cancel_kind(TimerKind::WatchdogCore);
    core.timers.cancel_kind(TimerKind::WatchdogKill);
    core.timers.cancel_kind(TimerKind::WatchdogVerify);
}

fn led_on(px: &Pipelines, core: &mut Core) {
    px.led_pattern_activate.exec(px, core, PATTERN_DISPLAY_UNRESPONSIVE);
}

fn led_off(px: &Pipelines, core: &mut Core) {
    px.led_pattern_deactivate.exec(px, core, PATTERN_DISPLAY_UNRESPONSIVE);
}

/// Stage 1: panic LED.
pub fn on_led_timer(px: &Pipelines, core: &mut Core) {
    if core.watchdog.stage != WatchdogStage::LedPending {
        return;
    }
    warn!("compositor not responding, panic led on");
    led_on(px, core);
    core.watchdog.stage = WatchdogStage::CorePending;

    // Core-dump deadline counts from the call, i.e. from when the LED timer
    // was armed; what is left is kill delay minus the LED delay.
    let kill_delay = Duration::from_secs(core.settings.get().compositor_kill_delay as u64);
    let led_delay = core.watchdog.led_delay(Instant::now());
    let remaining = kill_delay.saturating_sub(led_delay);
    core.timers.schedule(TimerKind::WatchdogCore, remaining);
}

/// Stage 2: request a core dump unless a debugger owns the process.
pub fn on_core_timer(px: &Pipelines, core: &mut Core) {
    if core.watchdog.stage != WatchdogStage::CorePending {
        return;
    }
    let Some(pid) = core.compositor.pid else {
        warn!("compositor pid unknown, skipping core dump and kill");
        cancel(px, core);
        return;
    };
    if debugger_attached(pid) {
        info!(pid, "debugger attached to compositor, leaving it alone");
        cancel(px, core);
        return;
    }
    warn!(pid, "requesting compositor core dump");
    let p = Pid::from_raw(pid);
    let _ = kill(p, Signal::SIGXCPU);
    let _ = kill(p, Signal::SIGCONT);
    core.watchdog.stage = WatchdogStage::KillPending;
    core.timers.schedule(TimerKind::WatchdogKill, KILL_AFTER_CORE);
}

/// Stage 3: SIGKILL.
pub fn on_kill_timer(_px: &Pipelines, core: &mut Core) {
    if core.watchdog.stage != WatchdogStage::KillPending {
        return;
    }
    match core.compositor.pid {
        Some(pid) => {
            warn!(pid, "killing unresponsive compositor");
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            core.watchdog.stage = WatchdogStage::VerifyPending;
            core.timers.schedule(TimerKind::WatchdogVerify, VERIFY_AFTER_KILL);
        }
        None => {
            core.watchdog.stage = WatchdogStage::Idle;
        }
    }
}

/// Stage 4: confirm the process went away; either way the chain ends.
pub fn on_verify_timer(px: &Pipelines, core: &mut Core) {
    if core.watchdog.stage != WatchdogStage::VerifyPending {
        return;
    }
    if let Some(pid) = core.compositor.pid {
        // Signal 0 probes existence without touching the process.
        if kill(Pid::from_raw(pid), None).is_ok() {
            warn!(pid, "compositor survived SIGKILL, giving up");
        }
    }
    cancel(px, core);
}

/// Probe for an attached debugger: if we cannot PTRACE_ATTACH, someone
/// else already traces the process.
fn debugger_attached(pid: i32) -> bool {
    let p = Pid::from_raw(pid);
    match nix::sys::ptrace::attach(p) {
        Ok(()) => {
            // Attach stops the target; reap the stop and detach.
            let _ = waitpid(p, None);
            let _ = nix::sys::ptrace::detach(p, None);
            false
        }
        Err(_) => true,
    }
}
