//! Cooperative timer service
//!
//! Timers never run on their own task: the engine loop asks for the next
//! deadline, sleeps until it (or until an event arrives), then drains the
//! due entries and dispatches them by tag. Cancellation is by id or by tag
//! and is idempotent; a generation counter makes stale heap entries
//! harmless.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

/// Dispatch tag for a timer. One enum instead of callbacks keeps timer
/// behavior in one match and borrow-checkable against the whole core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    // Blanking policy
    BlankDim,
    BlankOff,
    BlankLpmOff,
    BlankPausePeriod,
    AdaptiveDimWindow,
    // Fader and panel boost
    FadeTick,
    HbmTimeout,
    // Display state machine
    DisplayOnRelease,
    FbTransitionTimeout,
    // Compositor watchdog
    WatchdogLed,
    WatchdogCore,
    WatchdogKill,
    WatchdogVerify,
    // Suspend policy
    SuspendRethink,
    DesktopReady,
    AfterBootGrace,
}

/// Opaque handle for cancelling one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    slot: u32,
    gen: u32,
}

#[derive(Debug)]
struct Entry {
    kind: TimerKind,
    deadline: Instant,
    period: Option<Duration>,
}

/// A slot keeps its generation across reuse so stale ids can never hit a
/// newer entry.
#[derive(Debug, Default)]
struct Slot {
    gen: u32,
    entry: Option<Entry>,
}

/// Deadline heap with slot reuse.
#[derive(Debug, Default)]
pub struct TimerService {
    slots: Vec<Slot>,
    free: Vec<u32>,
    heap: BinaryHeap<Reverse<(Instant, u32, u32)>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a single-shot timer.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> TimerId {
        self.insert(kind, delay, None)
    }

    /// Schedule a repeating timer; re-armed on each fire until cancelled.
    pub fn schedule_repeating(&mut self, kind: TimerKind, period: Duration) -> TimerId {
        self.insert(kind, period, Some(period))
    }

    fn insert(&mut self, kind: TimerKind, delay: Duration, period: Option<Duration>) -> TimerId {
        let deadline = Instant::now() + delay;
        let slot = match self.free.pop() {
            Some(s) => s,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let s = &mut self.slots[slot as usize];
        s.gen = s.gen.wrapping_add(1);
        s.entry = Some(Entry { kind, deadline, period });
        self.heap.push(Reverse((deadline, slot, s.gen)));
        TimerId { slot, gen: s.gen }
    }

    /// Cancel by id. Cancelling an already-fired or already-cancelled timer
    /// is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(s) = self.slots.get_mut(id.slot as usize) {
            if s.gen == id.gen && s.entry.is_some() {
                s.entry = None;
                self.free.push(id.slot);
            }
        }
    }

    /// Cancel every scheduled entry with this tag.
    pub fn cancel_kind(&mut self, kind: TimerKind) {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.entry.as_ref().map(|e| e.kind == kind).unwrap_or(false) {
                s.entry = None;
                self.free.push(i as u32);
            }
        }
    }

    /// Whether any entry with this tag is armed.
    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.slots.iter().filter_map(|s| s.entry.as_ref()).any(|e| e.kind == kind)
    }

    /// Remaining time until the entry with this tag fires, if armed.
    pub fn remaining(&self, kind: TimerKind) -> Option<Duration> {
        let now = Instant::now();
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.kind == kind)
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }

    /// Earliest live deadline, for the engine's sleep.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Pop stale heap entries (cancelled or superseded) on the way.
        while let Some(Reverse((deadline, slot, gen))) = self.heap.peek().copied() {
            let live = self
                .slots
                .get(slot as usize)
                .filter(|s| s.gen == gen)
                .and_then(|s| s.entry.as_ref())
                .map(|e| e.deadline == deadline)
                .unwrap_or(false);
            if live {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every entry due at `now`; repeating entries are re-armed.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, slot, gen))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            let Some(s) = self.slots.get_mut(slot as usize) else { continue };
            if s.gen != gen {
                continue; // stale
            }
            let Some(entry) = s.entry.as_mut() else { continue };
            if entry.deadline != deadline {
                continue; // rescheduled
            }
            due.push(entry.kind);
            if let Some(period) = entry.period {
                entry.deadline = now + period;
                let re = (entry.deadline, slot, gen);
                self.heap.push(Reverse(re));
            } else {
                s.entry = None;
                self.free.push(slot);
            }
        }
        due
    }
}
