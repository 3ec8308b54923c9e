//! Monotonic and boot clock helpers
//!
//! Two clocks are needed: `CLOCK_MONOTONIC` stops while the system is
//! suspended, `CLOCK_BOOTTIME` does not. Fade interpolation and timer math
//! use boot time; the skew between the two clocks is how suspend periods
//! are detected after the fact.

use nix::time::{clock_gettime, ClockId};

/// Milliseconds on `CLOCK_MONOTONIC`.
pub fn monotonic_ms() -> i64 {
    ts_ms(ClockId::CLOCK_MONOTONIC)
}

/// Milliseconds on `CLOCK_BOOTTIME`.
pub fn boottime_ms() -> i64 {
    ts_ms(ClockId::CLOCK_BOOTTIME)
}

fn ts_ms(id: ClockId) -> i64 {
    match clock_gettime(id) {
        Ok(ts) => ts.tv_sec() * 1000 + ts.tv_nsec() / 1_000_000,
        // clock_gettime on a supported clock id does not fail in practice;
        // returning 0 keeps callers total.
        Err(_) => 0,
    }
}

/// Minimum growth of the boottime-vs-monotonic gap that is reported as a
/// suspend period rather than scheduling jitter.
pub const RESUME_SKEW_THRESHOLD_MS: i64 = 100;

/// Tracks the gap between the boot and monotonic clocks and reports when it
/// grows, i.e. when the system has been suspended since the last check.
#[derive(Debug, Default)]
pub struct ResumeDetector {
    last_skew_ms: i64,
}

impl ResumeDetector {
    pub fn new() -> Self {
        Self {
            last_skew_ms: boottime_ms() - monotonic_ms(),
        }
    }

    /// Returns the duration of a newly detected suspend period, if any.
    ///
    /// A gap increase below [`RESUME_SKEW_THRESHOLD_MS`] is absorbed silently
    /// so clock read jitter does not produce phantom resume reports.
    pub fn check(&mut self) -> Option<i64> {
        let skew = boottime_ms() - monotonic_ms();
        let delta = skew - self.last_skew_ms;
        if delta > RESUME_SKEW_THRESHOLD_MS {
            self.last_skew_ms = skew;
            Some(delta)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn with_skew(skew_ms: i64) -> Self {
        Self { last_skew_ms: skew_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_advance() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
        assert!(boottime_ms() >= monotonic_ms());
    }

    #[test]
    fn no_resume_without_skew_growth() {
        let mut det = ResumeDetector::new();
        // Without an actual suspend the skew cannot grow past the threshold.
        assert_eq!(det.check(), None);
    }

    #[test]
    fn resume_reported_on_skew_growth() {
        // Pretend the last observed skew was 10 s smaller than it is now.
        let current = boottime_ms() - monotonic_ms();
        let mut det = ResumeDetector::with_skew(current - 10_000);
        let gap = det.check().expect("10 s skew growth must be reported");
        assert!(gap >= 10_000);
        // Second check from the new baseline is quiet again.
        assert_eq!(det.check(), None);
    }
}
