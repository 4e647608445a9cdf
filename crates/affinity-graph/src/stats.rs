//! Graph builder counters for external monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Live counters, updated by report-delivery threads and the prune task.
#[derive(Debug, Default)]
pub struct BuilderStats {
    updates: AtomicU64,
    prunes: AtomicU64,
    processing_micros: AtomicU64,
}

/// Point-in-time copy of [`BuilderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderStatsSnapshot {
    pub update_count: u64,
    pub prune_count: u64,
    pub processing_time: Duration,
}

impl BuilderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update(&self, elapsed: Duration) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub fn record_prune(&self, elapsed: Duration) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    /// Time spent outside update and prune, e.g. folding a snapshot.
    pub fn add_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processing_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BuilderStatsSnapshot {
        BuilderStatsSnapshot {
            update_count: self.updates.load(Ordering::Relaxed),
            prune_count: self.prunes.load(Ordering::Relaxed),
            processing_time: Duration::from_micros(self.processing_micros.load(Ordering::Relaxed)),
        }
    }
}
