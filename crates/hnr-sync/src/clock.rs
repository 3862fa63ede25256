use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Wall-clock source, injectable so runs can be replayed at a fixed instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
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

/// Hands out ordering keys that never repeat within the process, even when
/// batches are stamped in the same millisecond or the wall clock steps back.
#[derive(Debug)]
pub struct OrderingStamper {
    last: AtomicI64,
}

impl Default for OrderingStamper {
    fn default() -> Self {
        Self {
            last: AtomicI64::new(i64::MIN),
        }
    }
}

impl OrderingStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `count` consecutive keys starting at `base_ms` or just past the
    /// last key issued, whichever is greater.
    pub fn reserve(&self, base_ms: i64, count: usize) -> Range<i64> {
        if count == 0 {
            return base_ms..base_ms;
        }
        let count = count as i64;
        let mut start = base_ms;
        // The closure always returns Some, so the update cannot fail.
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                start = base_ms.max(last.saturating_add(1));
                Some(start + count - 1)
            });
        start..start + count
    }
}
