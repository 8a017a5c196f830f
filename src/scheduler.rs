//! Tick Scheduler
//!
//! The host only calls us on a fixed-rate tick. Anything delayed or
//! periodic is a target tick number checked on each call; nothing here
//! sleeps or spawns tasks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;
use crate::world::ResourceHandle;

// ============================================================================
// Clock
// ============================================================================

/// Wall-clock source. Cycle expiry and accept timestamps read from this
/// instead of calling `Utc::now()` directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Tick Primitives
// ============================================================================

/// One-shot target tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: u64,
}

impl Deadline {
    pub fn after(now: u64, delay: u64) -> Self {
        Self { at: now.saturating_add(delay) }
    }

    pub fn is_due(&self, tick: u64) -> bool {
        tick >= self.at
    }
}

/// Re-arming periodic check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    every: u64,
    next: u64,
}

impl Interval {
    /// First fires `every` ticks after `start`
    pub fn new(every: u64, start: u64) -> Self {
        let every = every.max(1);
        Self { every, next: start.saturating_add(every) }
    }

    /// True when due; re-arms relative to `tick`
    pub fn poll(&mut self, tick: u64) -> bool {
        if tick < self.next {
            return false;
        }
        self.next = tick.saturating_add(self.every);
        true
    }

    pub fn next_due(&self) -> u64 {
        self.next
    }
}

/// Per-key rate limit: a key may fire at most once per window
#[derive(Debug, Clone)]
pub struct Debounce<K> {
    window: u64,
    last: HashMap<K, u64>,
}

impl<K: Eq + Hash> Debounce<K> {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Returns true (and records the tick) if `key` is outside its window
    pub fn allow(&mut self, key: K, tick: u64) -> bool {
        match self.last.get(&key) {
            Some(&last) if tick < last.saturating_add(self.window) => false,
            _ => {
                self.last.insert(key, tick);
                true
            }
        }
    }

    pub fn forget(&mut self, key: &K) {
        self.last.remove(key);
    }

    /// Drop keys whose window has passed
    pub fn sweep(&mut self, tick: u64) {
        let window = self.window;
        self.last.retain(|_, last| tick < last.saturating_add(window));
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Last damager per resource, for kill notifications
#[derive(Debug, Clone, Default)]
pub struct DamageLedger {
    entries: HashMap<ResourceHandle, (String, u64)>,
}

impl DamageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, handle: ResourceHandle, actor_id: &str, tick: u64) {
        self.entries.insert(handle, (actor_id.to_string(), tick));
    }

    pub fn last_damager(&self, handle: ResourceHandle) -> Option<&str> {
        self.entries.get(&handle).map(|(actor, _)| actor.as_str())
    }

    /// Remove and return the last damager
    pub fn take(&mut self, handle: ResourceHandle) -> Option<String> {
        self.entries.remove(&handle).map(|(actor, _)| actor)
    }

    /// Drop entries older than `max_age` ticks; returns how many were removed
    pub fn sweep(&mut self, tick: u64, max_age: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, recorded)| tick.saturating_sub(*recorded) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Standing Loops
// ============================================================================

/// Work due on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    /// Per-actor encounter reconciliation
    Reconcile,
    /// Global orphan resource cleanup
    OrphanCleanup,
    /// Expire short-lived attribution entries
    StaleSweep,
}

pub struct TickScheduler {
    tick: u64,
    reconcile: Interval,
    orphan_cleanup: Option<Deadline>,
    orphan_repeat: Option<u64>,
    stale_sweep: Interval,
}

impl TickScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            tick: 0,
            reconcile: Interval::new(config.reconcile_interval_ticks, 0),
            // Delayed so reconnecting actors reclaim their encounters first
            orphan_cleanup: Some(Deadline::after(0, config.orphan_cleanup_delay_ticks)),
            orphan_repeat: config.orphan_cleanup_repeat_ticks.filter(|t| *t > 0),
            stale_sweep: Interval::new(config.stale_sweep_interval_ticks, 0),
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Advance one tick and report what is due
    pub fn advance(&mut self) -> Vec<Duty> {
        self.tick += 1;
        let tick = self.tick;
        let mut due = Vec::new();

        if self.reconcile.poll(tick) {
            due.push(Duty::Reconcile);
        }

        if let Some(deadline) = self.orphan_cleanup {
            if deadline.is_due(tick) {
                due.push(Duty::OrphanCleanup);
                self.orphan_cleanup = self.orphan_repeat.map(|every| Deadline::after(tick, every));
            }
        }

        if self.stale_sweep.poll(tick) {
            due.push(Duty::StaleSweep);
        }
        due
    }
}
