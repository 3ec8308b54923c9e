//! Content-adaptive backlight control
//!
//! A string sysfs attribute on the panel selects the CABC mode. Supported
//! modes are probed once from the sibling `cabc_available_modes` node;
//! requests for anything else are ignored. The last client to set a mode
//! is tracked by bus name so the mode reverts to default when that client
//! goes away. Power-save mode installs an override that wins over any
//! client choice.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::sysfs;
use crate::types::CabcMode;

/// Mode forced while power-save is active: the most aggressive one.
const PSM_OVERRIDE_MODE: CabcMode = CabcMode::MovingImage;

#[derive(Debug)]
pub struct Cabc {
    mode_path: PathBuf,
    available: Vec<String>,
    /// Mode chosen by settings/client, before the power-save override.
    requested: CabcMode,
    /// Client that owns the current request, if any.
    client: Option<String>,
    psm_override: bool,
    /// Last string actually written, to skip duplicate writes.
    written: Option<&'static str>,
}

impl Cabc {
    /// Probe the available-modes node and apply the default mode.
    pub fn new(mode_path: PathBuf, available_path: PathBuf) -> Self {
        let available = match sysfs::load_until_eof(&available_path) {
            Ok(raw) => String::from_utf8_lossy(&raw)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Err(_) => {
                debug!(path = %available_path.display(), "no cabc mode list, cabc disabled");
                Vec::new()
            }
        };
        let mut cabc = Self {
            mode_path,
            available,
            requested: CabcMode::default(),
            client: None,
            psm_override: false,
            written: None,
        };
        cabc.apply();
        cabc
    }

    pub fn supported(&self, mode: CabcMode) -> bool {
        self.available.iter().any(|m| m == mode.as_str())
    }

    /// Effective mode after the power-save override.
    pub fn effective(&self) -> CabcMode {
        if self.psm_override && self.supported(PSM_OVERRIDE_MODE) {
            PSM_OVERRIDE_MODE
        } else {
            self.requested
        }
    }

    pub fn current_str(&self) -> &'static str {
        self.effective().as_str()
    }

    /// Handle a client request. Unsupported modes are ignored without
    /// error.
    pub fn request(&mut self, client: &str, mode: CabcMode) {
        if !self.available.is_empty() && !self.supported(mode) {
            debug!(client, mode = mode.as_str(), "unsupported cabc mode ignored");
            return;
        }
        info!(client, mode = mode.as_str(), "cabc mode requested");
        self.requested = mode;
        self.client = Some(client.to_string());
        self.apply();
    }

    /// A bus peer vanished; if it owned the mode, revert to default.
    pub fn client_vanished(&mut self, client: &str) {
        if self.client.as_deref() == Some(client) {
            info!(client, "cabc client gone, reverting to default");
            self.client = None;
            self.requested = CabcMode::default();
            self.apply();
        }
    }

    /// Track power-save mode.
    pub fn set_power_save(&mut self, active: bool) {
        if self.psm_override != active {
            self.psm_override = active;
            self.apply();
        }
    }

    /// Write the effective mode to the panel, skipping duplicates.
    fn apply(&mut self) {
        if self.available.is_empty() {
            return;
        }
        let mode = self.effective().as_str();
        if self.written == Some(mode) {
            return;
        }
        match sysfs::write_string(&self.mode_path, mode) {
            Ok(()) => {
                self.written = Some(mode);
            }
            Err(e) => warn!(mode, error = %e, "cabc write failed"),
        }
    }
}
