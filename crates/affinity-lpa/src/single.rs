//! Single-node affinity group finder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use affinity_graph::{GraphBuilder, Lifecycle, NodeId, RelocatingAffinityGroup};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::LpaConfig;
use crate::error::Result;
use crate::finder::{AffinityGroupFinder, FinderStats, StatsRecorder};
use crate::propagation;

/// Runs label propagation directly over the local builder's graph. Every
/// member is placed on the local node.
pub struct SingleLabelPropagation {
    node: NodeId,
    builder: Arc<dyn GraphBuilder>,
    max_iterations: u32,
    lifecycle: Lifecycle,
    run_number: AtomicU64,
    running: tokio::sync::Mutex<()>,
    stats: StatsRecorder,
}

impl std::fmt::Debug for SingleLabelPropagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleLabelPropagation")
            .field("node", &self.node)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl SingleLabelPropagation {
    pub fn new(node: NodeId, builder: Arc<dyn GraphBuilder>, config: &LpaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            node,
            builder,
            max_iterations: config.max_iterations,
            lifecycle: Lifecycle::new(),
            run_number: AtomicU64::new(0),
            running: tokio::sync::Mutex::new(()),
            stats: StatsRecorder::new(),
        })
    }
}

#[async_trait]
impl AffinityGroupFinder for SingleLabelPropagation {
    async fn find_affinity_groups(&self) -> Result<Vec<RelocatingAffinityGroup>> {
        self.lifecycle.ensure_enabled()?;
        let _running = self.running.lock().await;
        let mut graph = self.builder.affinity_graph()?;
        if graph.is_empty() {
            debug!(node = %self.node, "empty graph, no groups");
            return Ok(Vec::new());
        }

        let run = self.run_number.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        self.stats.run_started();
        let max_iterations = self.max_iterations;
        let outcome = tokio::task::spawn_blocking(move || {
            graph.reset_labels();
            let (iterations, converged) = propagation::propagate(&mut graph, run, max_iterations);
            propagation::gather_groups(&graph, run).map(|groups| (groups, iterations, converged))
        })
        .await;
        let (groups, iterations, converged) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                self.stats.run_failed();
                return Err(e);
            }
            Err(e) => {
                self.stats.run_failed();
                return Err(e.into());
            }
        };

        let groups = groups
            .into_iter()
            .map(|group| {
                let placement = group.members().iter().map(|m| (*m, self.node)).collect();
                Ok(RelocatingAffinityGroup::new(group.id(), run, placement)?)
            })
            .collect::<Result<Vec<_>>>()?;
        let runtime = started.elapsed();
        self.stats.run_completed(runtime, iterations, converged, groups.len());
        info!(node = %self.node, run, groups = groups.len(), iterations, converged, "local run finished");
        Ok(groups)
    }

    async fn remove_node(&self, node: NodeId) {
        self.builder.remove_node(node);
    }

    async fn enable(&self) -> Result<()> {
        self.lifecycle.enable()?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.lifecycle.disable()?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    fn stats(&self) -> FinderStats {
        self.stats.snapshot()
    }
}
