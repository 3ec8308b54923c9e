//! Module hook batches
//!
//! Each feature module declares one [`ModuleBindings`] value: an install
//! function that registers every filter/trigger the module needs, and a
//! remove function that takes them all out again. The registry tracks which
//! modules are installed so repeated installs are no-ops and removals are
//! exact.

use std::cell::RefCell;
use std::collections::HashSet;

use tracing::debug;

use crate::pipelines::Pipelines;

/// A module's datapipe hook batch.
#[derive(Clone, Copy)]
pub struct ModuleBindings {
    /// Module tag; also the owner string of every hook the module installs.
    pub module: &'static str,
    pub install: fn(&Pipelines),
    pub remove: fn(&Pipelines),
}

/// Tracks installed module batches.
#[derive(Default)]
pub struct BindingsRegistry {
    installed: RefCell<HashSet<&'static str>>,
}

impl BindingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a module's hooks; a second install of the same module is a
    /// no-op.
    pub fn install(&self, px: &Pipelines, b: &ModuleBindings) {
        if !self.installed.borrow_mut().insert(b.module) {
            debug!(module = b.module, "bindings already installed");
            return;
        }
        debug!(module = b.module, "installing bindings");
        (b.install)(px);
    }

    /// Remove a module's hooks; removing a module that is not installed is a
    /// no-op.
    pub fn remove(&self, px: &Pipelines, b: &ModuleBindings) {
        if !self.installed.borrow_mut().remove(b.module) {
            return;
        }
        debug!(module = b.module, "removing bindings");
        (b.remove)(px);
    }

    pub fn is_installed(&self, module: &'static str) -> bool {
        self.installed.borrow().contains(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    fn install_probe(px: &Pipelines) {
        px.test_pipe.add_output_trigger("probe", |_px, core, v| {
            core.test_probe.push(format!("probe:{v}"));
        });
    }

    fn remove_probe(px: &Pipelines) {
        px.test_pipe.remove_owner("probe");
    }

    const PROBE: ModuleBindings =
        ModuleBindings { module: "probe", install: install_probe, remove: remove_probe };

    #[test]
    fn install_remove_cycle() {
        let (px, mut core, _rx) = Core::for_test();
        let reg = BindingsRegistry::new();

        reg.install(&px, &PROBE);
        reg.install(&px, &PROBE); // idempotent
        px.test_pipe.exec(&px, &mut core, 1);
        assert_eq!(core.test_probe.len(), 1);

        reg.remove(&px, &PROBE);
        reg.remove(&px, &PROBE); // exact, second is a no-op
        px.test_pipe.exec(&px, &mut core, 2);
        assert_eq!(core.test_probe.len(), 1);
        assert!(!reg.is_installed("probe"));
    }
}
