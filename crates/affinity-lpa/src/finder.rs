//! The affinity group finder interface and its run statistics.

use std::time::Duration;

use affinity_graph::{NodeId, RelocatingAffinityGroup};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Computes affinity groups for the relocation service.
#[async_trait]
pub trait AffinityGroupFinder: Send + Sync {
    /// Run the algorithm once. Returns a complete partition, possibly empty,
    /// or an error; never a partial result.
    async fn find_affinity_groups(&self) -> Result<Vec<RelocatingAffinityGroup>>;

    /// Drop everything known about a failed or departed node.
    async fn remove_node(&self, node: NodeId);

    async fn enable(&self) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    /// Stop for good. Idempotent.
    async fn shutdown(&self);

    fn stats(&self) -> FinderStats;
}

/// Read-only run statistics for external monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinderStats {
    /// Runs started.
    pub runs: u64,
    /// Runs that ended without a usable partition.
    pub failed: u64,
    /// Runs that hit the iteration bound before converging.
    pub stopped: u64,
    pub min_runtime: Option<Duration>,
    pub avg_runtime: Duration,
    pub max_runtime: Duration,
    pub avg_iterations: f64,
    pub last_group_count: usize,
}

#[derive(Debug, Default)]
struct Totals {
    stats: FinderStats,
    completed: u64,
    runtime: Duration,
    iterations: u64,
}

/// Accumulates [`FinderStats`] from concurrent callers.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    totals: Mutex<Totals>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        self.totals.lock().stats.runs += 1;
    }

    pub fn run_failed(&self) {
        self.totals.lock().stats.failed += 1;
    }

    /// Record a run that produced `groups` groups after `iterations` passes.
    pub fn run_completed(&self, runtime: Duration, iterations: u32, converged: bool, groups: usize) {
        let mut totals = self.totals.lock();
        totals.completed += 1;
        totals.runtime += runtime;
        totals.iterations += u64::from(iterations);
        let completed = totals.completed;
        let avg_runtime = totals.runtime / u32::try_from(completed).unwrap_or(u32::MAX);
        let avg_iterations = totals.iterations as f64 / completed as f64;

        let stats = &mut totals.stats;
        if !converged {
            stats.stopped += 1;
        }
        stats.min_runtime = Some(stats.min_runtime.map_or(runtime, |min| min.min(runtime)));
        stats.max_runtime = stats.max_runtime.max(runtime);
        stats.avg_runtime = avg_runtime;
        stats.avg_iterations = avg_iterations;
        stats.last_group_count = groups;
    }

    pub fn snapshot(&self) -> FinderStats {
        self.totals.lock().stats.clone()
    }
}
