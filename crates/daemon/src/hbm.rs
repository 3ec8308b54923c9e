//! High brightness mode
//!
//! HBM is a panel boost above the normal backlight maximum, meant for
//! direct-sunlight readability. The panel can only sustain it briefly, so
//! every nonzero level is wrapped in a renewal timer: the requester (the
//! ambient-light filter, through the `hbm_request` pipe) must keep asking
//! for it, otherwise the level falls back to zero when the timer runs out.

use std::path::PathBuf;

use std::time::Duration;

use tracing::debug;

use crate::sysfs::SysfsFile;

/// Highest level the panel interface accepts.
pub const HBM_LEVEL_MAX: i64 = 2;

/// A nonzero level decays back to zero this long after the last request.
pub const HBM_RENEW_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Hbm {
    node: SysfsFile,
    available: bool,
    level: i64,
}

impl Hbm {
    pub fn new(path: PathBuf) -> Self {
        let available = path.exists();
        if !available {
            debug!(path = %path.display(), "no hbm node, feature disabled");
        }
        Self { node: SysfsFile::new(path), available, level: 0 }
    }

    pub fn available(&self) -> bool {
        self.available
    }

    pub fn level(&self) -> i64 {
        self.level
    }

    /// Apply a level request; returns whether the renewal timer must be
    /// (re)armed. Out-of-range requests clamp, unsupported panels no-op.
    #[must_use]
    pub fn set_level(&mut self, level: i64) -> bool {
        if !self.available {
            return false;
        }
        let level = level.clamp(0, HBM_LEVEL_MAX);
        if self.node.set(level) {
            debug!(level, "hbm level written");
        }
        self.level = level;
        level > 0
    }

    /// Renewal timer ran out: drop back to normal brightness.
    pub fn on_timeout(&mut self) {
        if self.level > 0 {
            debug!("hbm renewal lapsed, dropping boost");
            let _ = self.set_level(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Hbm, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbm_mode");
        std::fs::write(&path, "0").unwrap();
        (Hbm::new(path), dir)
    }

    fn node_value(dir: &tempfile::TempDir) -> String {
        std::fs::read_to_string(dir.path().join("hbm_mode")).unwrap()
    }

    #[test]
    fn level_clamps_and_writes() {
        let (mut hbm, dir) = fixture();
        assert!(hbm.set_level(9));
        assert_eq!(hbm.level(), HBM_LEVEL_MAX);
        assert_eq!(node_value(&dir), "2");
    }

    #[test]
    fn zero_needs_no_renewal() {
        let (mut hbm, dir) = fixture();
        assert!(hbm.set_level(1));
        assert!(!hbm.set_level(0));
        assert_eq!(node_value(&dir), "0");
    }

    #[test]
    fn timeout_drops_boost() {
        let (mut hbm, dir) = fixture();
        let _ = hbm.set_level(2);
        hbm.on_timeout();
        assert_eq!(hbm.level(), 0);
        assert_eq!(node_value(&dir), "0");
    }

    #[test]
    fn missing_node_disables_feature() {
        let dir = tempfile::tempdir().unwrap();
        let mut hbm = Hbm::new(dir.path().join("missing"));
        assert!(!hbm.available());
        assert!(!hbm.set_level(2));
        assert_eq!(hbm.level(), 0);
    }
}
