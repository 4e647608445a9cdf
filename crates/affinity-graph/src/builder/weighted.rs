//! Builder that maintains the folded identity graph directly.
//!
//! For the k-th access (within the retention window) of identity `owner` to
//! object `O`, every other identity `X` that used `O` gets an edge to `owner`.
//! A new edge starts at weight 1; an existing edge grows only while
//! `k <= uses(X, O)`, so two identities alternating on an object add one unit
//! per pairing rather than one per access.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{accepts_report, BuilderKind, GraphBuilder, ObjectUseMap};
use crate::access::AccessDetail;
use crate::conflict::ConflictTracker;
use crate::error::Result;
use crate::graph::{AffinityGraph, EdgeKey};
use crate::identity::{Identity, ObjectId};
use crate::lifecycle::Lifecycle;
use crate::prune::PruneWindow;
use crate::stats::{BuilderStats, BuilderStatsSnapshot};

/// Changes made during one snapshot period.
#[derive(Debug, Default)]
struct PeriodChanges {
    edges: HashMap<EdgeKey, u64>,
    object_uses: ObjectUseMap,
}

#[derive(Debug)]
struct WeightedState {
    graph: AffinityGraph,
    object_uses: ObjectUseMap,
    /// Total uses per identity across all objects, to spot vertices that
    /// no longer have anything keeping them alive.
    use_totals: HashMap<Identity, u64>,
    window: PruneWindow<PeriodChanges>,
}

/// Weighted identity graph builder.
#[derive(Debug)]
pub struct WeightedGraphBuilder {
    state: Mutex<WeightedState>,
    conflicts: ConflictTracker,
    lifecycle: Lifecycle,
    stats: BuilderStats,
}

impl WeightedGraphBuilder {
    /// Create a builder retaining `period_count` closed periods.
    pub fn new(period_count: usize) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(WeightedState {
                graph: AffinityGraph::new(),
                object_uses: HashMap::new(),
                use_totals: HashMap::new(),
                window: PruneWindow::new(period_count)?,
            }),
            conflicts: ConflictTracker::new(period_count)?,
            lifecycle: Lifecycle::new(),
            stats: BuilderStats::new(),
        })
    }
}

impl GraphBuilder for WeightedGraphBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Weighted
    }

    fn update_graph(&self, owner: Identity, detail: &AccessDetail) -> Result<()> {
        if !accepts_report(&self.lifecycle, &owner)? {
            trace!(%owner, "report dropped");
            return Ok(());
        }
        // every vertex is backed by at least one object use
        if detail.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut state = self.state.lock();
        let WeightedState {
            graph,
            object_uses,
            use_totals,
            window,
        } = &mut *state;
        let period = window.period();
        graph.add_vertex(owner);

        for accessed in detail.objects() {
            let object = accessed.object();
            for _ in 0..accessed.count() {
                let uses = object_uses.entry(object).or_default();
                let current = {
                    let count = uses.entry(owner).or_insert(0);
                    *count += 1;
                    *count
                };
                *use_totals.entry(owner).or_insert(0) += 1;

                let changes = window.current_mut();
                *changes
                    .object_uses
                    .entry(object)
                    .or_default()
                    .entry(owner)
                    .or_insert(0) += 1;

                for (other, other_count) in uses.iter() {
                    let Some(key) = EdgeKey::new(owner, *other) else {
                        continue;
                    };
                    if !graph.contains_edge(&key) || current <= *other_count {
                        graph.increment_edge(owner, *other, 1, period);
                        *changes.edges.entry(key).or_insert(0) += 1;
                    }
                }
            }
        }
        drop(state);
        self.stats.record_update(start.elapsed());
        Ok(())
    }

    fn affinity_graph(&self) -> Result<AffinityGraph> {
        self.lifecycle.ensure_running()?;
        Ok(self.state.lock().graph.clone())
    }

    fn object_use_map(&self) -> ObjectUseMap {
        self.state.lock().object_uses.clone()
    }

    fn object_uses(&self, objects: &[ObjectId]) -> ObjectUseMap {
        let state = self.state.lock();
        objects
            .iter()
            .filter_map(|object| state.object_uses.get(object).map(|uses| (*object, uses.clone())))
            .collect()
    }

    fn prune(&self) -> Result<()> {
        self.lifecycle.ensure_running()?;
        let start = Instant::now();
        self.conflicts.prune();

        let mut state = self.state.lock();
        let WeightedState {
            graph,
            object_uses,
            use_totals,
            window,
        } = &mut *state;
        let Some(expired) = window.advance() else {
            drop(state);
            self.stats.record_prune(start.elapsed());
            return Ok(());
        };

        let mut touched = Vec::new();
        for (object, uses) in expired.object_uses {
            let Some(current) = object_uses.get_mut(&object) else {
                continue;
            };
            for (identity, n) in uses {
                if let Some(count) = current.get_mut(&identity) {
                    *count = count.saturating_sub(n);
                    if *count == 0 {
                        current.remove(&identity);
                    }
                }
                if let Some(total) = use_totals.get_mut(&identity) {
                    *total = total.saturating_sub(n);
                    if *total == 0 {
                        use_totals.remove(&identity);
                    }
                }
                touched.push(identity);
            }
            if current.is_empty() {
                object_uses.remove(&object);
            }
        }
        for (key, n) in expired.edges {
            graph.decrement_edge(&key, n);
            let (a, b) = key.endpoints();
            touched.push(a);
            touched.push(b);
        }

        let mut removed = 0usize;
        for identity in touched {
            if graph.degree(&identity) == 0
                && !use_totals.contains_key(&identity)
                && graph.remove_vertex(&identity).is_some()
            {
                removed += 1;
            }
        }
        debug!(
            period = window.period(),
            removed_vertices = removed,
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            "pruned weighted graph"
        );
        drop(state);
        self.stats.record_prune(start.elapsed());
        Ok(())
    }

    fn conflicts(&self) -> &ConflictTracker {
        &self.conflicts
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn stats(&self) -> BuilderStatsSnapshot {
        self.stats.snapshot()
    }
}
