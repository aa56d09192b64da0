//! Clocks and keyed, cancellable deadlines.
//!
//! Nothing in the engine sleeps. Debounces and timeouts are deadlines in a
//! [`Scheduler`]; the host calls `tick(now)` and the owner fires whatever
//! [`Scheduler::take_due`] hands back.

use std::cell::Cell;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn advance_ms(&self, ms: u64) -> DateTime<Utc> {
        let next = self.now.get() + millis(ms);
        self.now.set(next);
        next
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Convert a configured millisecond count into a chrono duration.
pub fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Named timers owned by the store and the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    StageRebalance,
    Persist,
    EditingTimeout,
    QueueRetry,
}

impl TimerKey {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerKey::StageRebalance => "stage_rebalance",
            TimerKey::Persist => "persist",
            TimerKey::EditingTimeout => "editing_timeout",
            TimerKey::QueueRetry => "queue_retry",
        }
    }
}

/// One deadline per key; scheduling an existing key replaces its deadline.
#[derive(Debug, Default)]
pub struct Scheduler {
    deadlines: BTreeMap<TimerKey, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: TimerKey, at: DateTime<Utc>) {
        self.deadlines.insert(key, at);
    }

    pub fn schedule_in(&mut self, key: TimerKey, now: DateTime<Utc>, delay_ms: u64) {
        self.schedule(key, now + millis(delay_ms));
    }

    /// Keep the earlier of the existing and the requested deadline.
    pub fn schedule_no_later(&mut self, key: TimerKey, at: DateTime<Utc>) {
        let entry = self.deadlines.entry(key).or_insert(at);
        if at < *entry {
            *entry = at;
        }
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    pub fn cancel_all(&mut self) {
        if !self.deadlines.is_empty() {
            tracing::debug!(count = self.deadlines.len(), "cancelling timers");
        }
        self.deadlines.clear();
    }

    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn deadline(&self, key: TimerKey) -> Option<DateTime<Utc>> {
        self.deadlines.get(&key).copied()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.deadlines.values().min().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TimerKey> {
        let mut due: Vec<(DateTime<Utc>, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, *key))
            .collect();
        due.sort();
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }
}
