//! Graph builders.
//!
//! A builder consumes access reports and maintains the local affinity graph,
//! the object-use map and the conflict tracker. Two strategies exist:
//!
//! - [`WeightedGraphBuilder`] keeps the folded identity graph up to date on
//!   every report.
//! - [`BipartiteGraphBuilder`] keeps the identity/object graph and folds it
//!   into an identity graph when a snapshot is requested.

mod bipartite;
mod weighted;

pub use bipartite::BipartiteGraphBuilder;
pub use weighted::WeightedGraphBuilder;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessDetail;
use crate::conflict::{ConflictMap, ConflictTracker};
use crate::error::{Error, Result};
use crate::graph::AffinityGraph;
use crate::identity::{Identity, NodeId, ObjectId};
use crate::lifecycle::Lifecycle;
use crate::stats::BuilderStatsSnapshot;

/// Object → (identity → access count).
pub type ObjectUseMap = HashMap<ObjectId, HashMap<Identity, u64>>;

/// Graph construction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Weighted,
    Bipartite,
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderKind::Weighted => write!(f, "weighted"),
            BuilderKind::Bipartite => write!(f, "bipartite"),
        }
    }
}

impl FromStr for BuilderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weighted" => Ok(BuilderKind::Weighted),
            "bipartite" => Ok(BuilderKind::Bipartite),
            other => Err(Error::InvalidConfig(format!("unknown graph builder {other:?}"))),
        }
    }
}

/// Retention settings shared by all builders.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Length of one snapshot period; the prune task runs once per period.
    pub snapshot_period: Duration,

    /// Number of closed periods whose reports stay in the graph.
    pub period_count: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            snapshot_period: Duration::from_secs(5 * 60),
            period_count: 1,
        }
    }
}

impl GraphConfig {
    #[must_use]
    pub fn with_snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot_period = period;
        self
    }

    #[must_use]
    pub fn with_period_count(mut self, count: usize) -> Self {
        self.period_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.period_count == 0 {
            return Err(Error::InvalidConfig(
                "period count must be at least 1".to_string(),
            ));
        }
        if self.snapshot_period.is_zero() {
            return Err(Error::InvalidConfig(
                "snapshot period must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builds and maintains a node's affinity graph from access reports.
///
/// Implementations are shared between report-delivery threads, the prune
/// task and the label propagation participant.
pub trait GraphBuilder: Send + Sync {
    /// Strategy implemented by this builder.
    fn kind(&self) -> BuilderKind;

    /// Fold one access report into the graph. System identities are ignored.
    fn update_graph(&self, owner: Identity, detail: &AccessDetail) -> Result<()>;

    /// Owned snapshot of the current graph, every vertex at its initial label.
    fn affinity_graph(&self) -> Result<AffinityGraph>;

    /// Snapshot of the object-use map.
    fn object_use_map(&self) -> ObjectUseMap;

    /// Object-use entries for the given objects only.
    fn object_uses(&self, objects: &[ObjectId]) -> ObjectUseMap {
        let mut uses = self.object_use_map();
        uses.retain(|object, _| objects.contains(object));
        uses
    }

    /// Close the current snapshot period and expire the oldest one.
    fn prune(&self) -> Result<()>;

    fn conflicts(&self) -> &ConflictTracker;

    fn lifecycle(&self) -> &Lifecycle;

    fn stats(&self) -> BuilderStatsSnapshot;

    /// Record a conflict between a local access and `node`'s copy of `object`.
    fn note_conflict_detected(&self, object: ObjectId, node: NodeId, for_update: bool) -> Result<()> {
        self.lifecycle().ensure_running()?;
        self.conflicts().note_conflict_detected(object, node, for_update);
        Ok(())
    }

    fn conflict_map(&self) -> ConflictMap {
        self.conflicts().conflict_map()
    }

    /// Drop everything attributed to a failed or departed node.
    fn remove_node(&self, node: NodeId) {
        self.conflicts().remove_node(node);
    }

    fn enable(&self) -> Result<bool> {
        self.lifecycle().enable()
    }

    fn disable(&self) -> Result<bool> {
        self.lifecycle().disable()
    }

    fn shutdown(&self) {
        self.lifecycle().shutdown();
    }
}

/// Instantiate the configured builder.
pub fn build(kind: BuilderKind, config: &GraphConfig) -> Result<Arc<dyn GraphBuilder>> {
    config.validate()?;
    let builder: Arc<dyn GraphBuilder> = match kind {
        BuilderKind::Weighted => Arc::new(WeightedGraphBuilder::new(config.period_count)?),
        BuilderKind::Bipartite => Arc::new(BipartiteGraphBuilder::new(config.period_count)?),
    };
    Ok(builder)
}

/// Decide whether a report should reach the graph at all.
///
/// Returns `Ok(false)` when it should be dropped quietly (system owner or a
/// disabled builder) and an error once the builder is shut down.
fn accepts_report(lifecycle: &Lifecycle, owner: &Identity) -> Result<bool> {
    lifecycle.ensure_running()?;
    Ok(!owner.is_system() && lifecycle.is_enabled())
}
