//! Router counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals, one per outcome
#[derive(Debug, Default)]
pub struct RouterStats {
    pub(super) received: AtomicU64,
    pub(super) ignored: AtomicU64,
    pub(super) published: AtomicU64,
    pub(super) skipped: AtomicU64,
    pub(super) failed: AtomicU64,
}

impl RouterStats {
    pub(super) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub received: u64,
    pub ignored: u64,
    pub published: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl fmt::Display for RouterStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} ignored={} published={} skipped={} failed={}",
            self.received, self.ignored, self.published, self.skipped, self.failed
        )
    }
}
