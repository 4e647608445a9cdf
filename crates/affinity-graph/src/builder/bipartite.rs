//! Builder that keeps the identity/object bipartite graph and folds it on
//! demand.
//!
//! Reports only touch identity→object edges, which keeps the update path
//! cheap. Folding connects two identities through every object they share,
//! each shared object contributing `min(w(a, O), w(b, O))`.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{accepts_report, BuilderKind, GraphBuilder, ObjectUseMap};
use crate::access::AccessDetail;
use crate::conflict::ConflictTracker;
use crate::error::Result;
use crate::graph::AffinityGraph;
use crate::identity::{Identity, ObjectId};
use crate::lifecycle::Lifecycle;
use crate::prune::PruneWindow;
use crate::stats::{BuilderStats, BuilderStatsSnapshot};

type EdgeIncrements = HashMap<(Identity, ObjectId), u64>;

#[derive(Debug)]
struct BipartiteState {
    by_identity: HashMap<Identity, HashMap<ObjectId, u64>>,
    by_object: ObjectUseMap,
    window: PruneWindow<EdgeIncrements>,
}

/// Bipartite identity/object graph builder.
#[derive(Debug)]
pub struct BipartiteGraphBuilder {
    state: Mutex<BipartiteState>,
    conflicts: ConflictTracker,
    lifecycle: Lifecycle,
    stats: BuilderStats,
}

impl BipartiteGraphBuilder {
    pub fn new(period_count: usize) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(BipartiteState {
                by_identity: HashMap::new(),
                by_object: HashMap::new(),
                window: PruneWindow::new(period_count)?,
            }),
            conflicts: ConflictTracker::new(period_count)?,
            lifecycle: Lifecycle::new(),
            stats: BuilderStats::new(),
        })
    }
}

impl GraphBuilder for BipartiteGraphBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Bipartite
    }

    fn update_graph(&self, owner: Identity, detail: &AccessDetail) -> Result<()> {
        if !accepts_report(&self.lifecycle, &owner)? {
            trace!(%owner, "report dropped");
            return Ok(());
        }
        if detail.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        {
            let mut state = self.state.lock();
            let BipartiteState {
                by_identity,
                by_object,
                window,
            } = &mut *state;
            let objects = by_identity.entry(owner).or_default();
            for accessed in detail.objects() {
                let object = accessed.object();
                let n = u64::from(accessed.count());
                *objects.entry(object).or_insert(0) += n;
                *by_object.entry(object).or_default().entry(owner).or_insert(0) += n;
                *window.current_mut().entry((owner, object)).or_insert(0) += n;
            }
        }
        self.stats.record_update(start.elapsed());
        Ok(())
    }

    fn affinity_graph(&self) -> Result<AffinityGraph> {
        self.lifecycle.ensure_running()?;
        let start = Instant::now();
        let (identities, by_object, period) = {
            let state = self.state.lock();
            (
                state.by_identity.keys().copied().collect::<Vec<_>>(),
                state.by_object.clone(),
                state.window.period(),
            )
        };

        let mut folded = AffinityGraph::new();
        for identity in identities {
            folded.add_vertex(identity);
        }
        for users in by_object.values() {
            let users: Vec<(Identity, u64)> = users.iter().map(|(id, w)| (*id, *w)).collect();
            for (i, (a, wa)) in users.iter().enumerate() {
                for (b, wb) in &users[i + 1..] {
                    folded.increment_edge(*a, *b, (*wa).min(*wb), period);
                }
            }
        }
        self.stats.add_time(start.elapsed());
        Ok(folded)
    }

    fn object_use_map(&self) -> ObjectUseMap {
        self.state.lock().by_object.clone()
    }

    fn object_uses(&self, objects: &[ObjectId]) -> ObjectUseMap {
        let state = self.state.lock();
        objects
            .iter()
            .filter_map(|object| state.by_object.get(object).map(|uses| (*object, uses.clone())))
            .collect()
    }

    fn prune(&self) -> Result<()> {
        self.lifecycle.ensure_running()?;
        let start = Instant::now();
        self.conflicts.prune();
        {
            let mut state = self.state.lock();
            let BipartiteState {
                by_identity,
                by_object,
                window,
            } = &mut *state;
            if let Some(expired) = window.advance() {
                for ((identity, object), n) in expired {
                    if let Some(objects) = by_identity.get_mut(&identity) {
                        subtract(objects, &object, n);
                        if objects.is_empty() {
                            by_identity.remove(&identity);
                        }
                    }
                    if let Some(users) = by_object.get_mut(&object) {
                        subtract(users, &identity, n);
                        if users.is_empty() {
                            by_object.remove(&object);
                        }
                    }
                }
                debug!(
                    period = window.period(),
                    identities = by_identity.len(),
                    objects = by_object.len(),
                    "pruned bipartite graph"
                );
            }
        }
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

fn subtract<K: std::hash::Hash + Eq>(map: &mut HashMap<K, u64>, key: &K, n: u64) {
    if let Some(weight) = map.get_mut(key) {
        *weight = weight.saturating_sub(n);
        if *weight == 0 {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WeightedGraphBuilder;

    fn id(n: u64) -> Identity {
        Identity::new(n)
    }

    fn report(builder: &dyn GraphBuilder, owner: u64, objects: &[u64]) {
        let detail: AccessDetail = objects.iter().copied().map(ObjectId).collect();
        builder.update_graph(id(owner), &detail).unwrap();
    }

    fn five_reports(builder: &dyn GraphBuilder) {
        report(builder, 1, &[1, 2]);
        report(builder, 2, &[1, 3]);
        report(builder, 3, &[4, 2, 3]);
        report(builder, 4, &[4]);
        report(builder, 1, &[3]);
    }

    #[test]
    fn folding_matches_weighted_builder_on_reference_reports() {
        let bipartite = BipartiteGraphBuilder::new(1).unwrap();
        let weighted = WeightedGraphBuilder::new(1).unwrap();
        five_reports(&bipartite);
        five_reports(&weighted);
        let folded = bipartite.affinity_graph().unwrap();
        let direct = weighted.affinity_graph().unwrap();
        assert_eq!(folded.vertex_count(), direct.vertex_count());
        assert_eq!(folded.edge_count(), direct.edge_count());
        for (key, edge) in direct.edges() {
            let (a, b) = key.endpoints();
            assert_eq!(folded.edge_weight(a, b), Some(edge.weight()), "edge {a}-{b}");
        }
    }

    #[test]
    fn shared_object_contributes_minimum_weight() {
        let builder = BipartiteGraphBuilder::new(1).unwrap();
        report(&builder, 1, &[1, 1]);
        report(&builder, 2, &[1, 1, 1]);
        report(&builder, 3, &[1, 1]);
        let graph = builder.affinity_graph().unwrap();
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.edge_weight(id(1), id(2)), Some(2));
        assert_eq!(graph.edge_weight(id(1), id(3)), Some(2));
        assert_eq!(graph.edge_weight(id(2), id(3)), Some(2));
    }

    #[test]
    fn object_use_map_reads_bipartite_edges() {
        let builder = BipartiteGraphBuilder::new(1).unwrap();
        report(&builder, 1, &[1, 1]);
        report(&builder, 2, &[1]);
        let uses = builder.object_use_map();
        assert_eq!(uses[&ObjectId(1)][&id(1)], 2);
        assert_eq!(uses[&ObjectId(1)][&id(2)], 1);
    }

    #[test]
    fn lone_and_system_identities() {
        let builder = BipartiteGraphBuilder::new(1).unwrap();
        report(&builder, 1, &[1, 2]);
        builder
            .update_graph(Identity::system(2), &AccessDetail::new().with_access(ObjectId(1)))
            .unwrap();
        let graph = builder.affinity_graph().unwrap();
        assert_eq!(graph.vertex_count(), 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn empty_report_leaves_no_identity() {
        let builder = BipartiteGraphBuilder::new(1).unwrap();
        builder.update_graph(id(1), &AccessDetail::new()).unwrap();
        assert!(builder.affinity_graph().unwrap().is_empty());
        assert!(builder.object_use_map().is_empty());
    }

    #[test]
    fn prune_empties_unrefreshed_graph() {
        let builder = BipartiteGraphBuilder::new(2).unwrap();
        five_reports(&builder);
        builder.prune().unwrap();
        five_reports(&builder);
        builder.prune().unwrap();
        let graph = builder.affinity_graph().unwrap();
        assert_eq!(graph.edge_weight(id(1), id(2)), Some(4));
        builder.prune().unwrap();
        let graph = builder.affinity_graph().unwrap();
        assert_eq!(graph.edge_weight(id(1), id(2)), Some(2));
        builder.prune().unwrap();
        assert!(builder.affinity_graph().unwrap().is_empty());
        assert!(builder.object_use_map().is_empty());
    }
}
