//! Datapipe fabric
//!
//! A datapipe is a named cell holding a cached payload plus three ordered
//! hook lists: filters (transform the in-data), input triggers (observe the
//! unfiltered input) and output triggers (observe the post-filter value).
//!
//! Execution order for one `exec_full` call:
//!   1. input triggers fire on the unfiltered input;
//!   2. filters run in registration order, each feeding the next;
//!   3. the cache is replaced with the final value if the cache policy says so;
//!   4. output triggers fire on the final value.
//!
//! Read-only pipes reject external in-data: the cache is the only source of
//! truth and the filter chain is what evolves it.
//!
//! Hooks are plain function pointers tagged with the owning module, so a
//! module's hooks can be installed and removed as a batch (see
//! [`bindings`]). Re-entrant execution of the *same* pipe is rejected with
//! an error log; executing *other* pipes from within a hook is normal and
//! how the state machine publishes its results.

pub mod bindings;

use std::cell::RefCell;
use std::fmt::Debug;

use tracing::{error, trace};

use crate::core::Core;
use crate::pipelines::Pipelines;

/// Filter hook: may pass, substitute or reject (by returning the cached
/// value) the in-data. Must be deterministic.
pub type FilterFn<T> = fn(&Pipelines, &mut Core, T) -> T;

/// Trigger hook: observes a value, mutates core state, may execute other
/// pipes.
pub type TriggerFn<T> = fn(&Pipelines, &mut Core, &T);

/// Which value enters the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    UseIndata,
    UseCache,
}

/// Whether the final value replaces the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    CacheIndata,
    DontCache,
}

struct Hook<F> {
    owner: &'static str,
    f: F,
}

struct Inner<T> {
    cache: T,
    executing: bool,
    filters: Vec<Hook<FilterFn<T>>>,
    input_triggers: Vec<Hook<TriggerFn<T>>>,
    output_triggers: Vec<Hook<TriggerFn<T>>>,
}

/// A single named value cell. Created once at startup, lives for the
/// process.
pub struct Datapipe<T> {
    name: &'static str,
    read_only: bool,
    inner: RefCell<Inner<T>>,
}

impl<T: Clone + PartialEq + Debug> Datapipe<T> {
    pub fn new(name: &'static str, read_only: bool, initial: T) -> Self {
        Self {
            name,
            read_only,
            inner: RefCell::new(Inner {
                cache: initial,
                executing: false,
                filters: Vec::new(),
                input_triggers: Vec::new(),
                output_triggers: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Clone of the cached value; always the last successfully executed
    /// transition.
    pub fn cached(&self) -> T {
        self.inner.borrow().cache.clone()
    }

    /// Overwrite the cache without running any hooks. Startup seeding only.
    pub fn seed(&self, value: T) {
        self.inner.borrow_mut().cache = value;
    }

    pub fn add_filter(&self, owner: &'static str, f: FilterFn<T>) {
        let mut inner = self.inner.borrow_mut();
        if inner.filters.iter().any(|h| h.owner == owner && h.f == f) {
            return;
        }
        inner.filters.push(Hook { owner, f });
    }

    pub fn remove_filter(&self, owner: &'static str, f: FilterFn<T>) {
        self.inner.borrow_mut().filters.retain(|h| !(h.owner == owner && h.f == f));
    }

    pub fn add_input_trigger(&self, owner: &'static str, f: TriggerFn<T>) {
        let mut inner = self.inner.borrow_mut();
        if inner.input_triggers.iter().any(|h| h.owner == owner && h.f == f) {
            return;
        }
        inner.input_triggers.push(Hook { owner, f });
    }

    pub fn remove_input_trigger(&self, owner: &'static str, f: TriggerFn<T>) {
        self.inner.borrow_mut().input_triggers.retain(|h| !(h.owner == owner && h.f == f));
    }

    pub fn add_output_trigger(&self, owner: &'static str, f: TriggerFn<T>) {
        let mut inner = self.inner.borrow_mut();
        if inner.output_triggers.iter().any(|h| h.owner == owner && h.f == f) {
            return;
        }
        inner.output_triggers.push(Hook { owner, f });
    }

    pub fn remove_output_trigger(&self, owner: &'static str, f: TriggerFn<T>) {
        self.inner.borrow_mut().output_triggers.retain(|h| !(h.owner == owner && h.f == f));
    }

    /// Remove every hook a module has installed on this pipe.
    pub fn remove_owner(&self, owner: &'static str) {
        let mut inner = self.inner.borrow_mut();
        inner.filters.retain(|h| h.owner != owner);
        inner.input_triggers.retain(|h| h.owner != owner);
        inner.output_triggers.retain(|h| h.owner != owner);
    }

    /// Convenience: execute with the given in-data and cache the result.
    pub fn exec(&self, px: &Pipelines, core: &mut Core, indata: T) {
        self.exec_full(px, core, indata, Source::UseIndata, CachePolicy::CacheIndata);
    }

    /// Re-run hooks on the cached value without touching the cache.
    pub fn rerun(&self, px: &Pipelines, core: &mut Core) {
        let cached = self.cached();
        self.exec_full(px, core, cached, Source::UseCache, CachePolicy::DontCache);
    }

    /// Full execution with explicit source selector and cache policy.
    pub fn exec_full(
        &self,
        px: &Pipelines,
        core: &mut Core,
        indata: T,
        source: Source,
        policy: CachePolicy,
    ) {
        // Re-entrancy on the same pipe is a programming error; drop the
        // execution rather than corrupting hook ordering.
        let (input, input_triggers, filters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.executing {
                error!(pipe = self.name, "re-entrant datapipe execution rejected");
                return;
            }
            inner.executing = true;
            // Read-only pipes take the cache as the only source of truth.
            let input = if self.read_only || source == Source::UseCache {
                inner.cache.clone()
            } else {
                indata
            };
            let input_triggers: Vec<TriggerFn<T>> =
                inner.input_triggers.iter().map(|h| h.f).collect();
            let filters: Vec<FilterFn<T>> = inner.filters.iter().map(|h| h.f).collect();
            (input, input_triggers, filters)
        };

        trace!(pipe = self.name, value = ?input, "datapipe exec");

        for t in input_triggers {
            t(px, core, &input);
        }

        let mut value = input;
        for f in filters {
            value = f(px, core, value);
        }

        let output_triggers: Vec<TriggerFn<T>> = {
            let mut inner = self.inner.borrow_mut();
            if policy == CachePolicy::CacheIndata {
                inner.cache = value.clone();
            }
            inner.output_triggers.iter().map(|h| h.f).collect()
        };

        for t in output_triggers {
            t(px, core, &value);
        }

        self.inner.borrow_mut().executing = false;
    }
}

impl<T: Debug + Clone + PartialEq> Debug for Datapipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datapipe")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("cache", &self.inner.borrow().cache)
            .finish()
    }
}
