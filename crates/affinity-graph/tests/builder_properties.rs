//! Property tests shared by both graph builders.

use affinity_graph::{build, AccessDetail, BuilderKind, GraphBuilder, GraphConfig, Identity, ObjectId};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

const KINDS: [BuilderKind; 2] = [BuilderKind::Weighted, BuilderKind::Bipartite];

fn builder(kind: BuilderKind, period_count: usize) -> Arc<dyn GraphBuilder> {
    build(kind, &GraphConfig::default().with_period_count(period_count))
        .unwrap_or_else(|e| panic!("builder construction failed: {e}"))
}

fn detail(objects: &[u64]) -> AccessDetail {
    objects.iter().copied().map(ObjectId).collect()
}

fn report_strategy() -> impl Strategy<Value = Vec<(u64, bool, Vec<u64>)>> {
    prop::collection::vec(
        (0u64..8, prop::bool::weighted(0.1), prop::collection::vec(0u64..6, 0..4)),
        0..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn repeated_co_access_accumulates(rounds in 1usize..12, object in 0u64..100) {
        for kind in KINDS {
            let builder = builder(kind, 1);
            for _ in 0..rounds {
                builder.update_graph(Identity::new(1), &detail(&[object])).unwrap();
                builder.update_graph(Identity::new(2), &detail(&[object])).unwrap();
            }
            let graph = builder.affinity_graph().unwrap();
            prop_assert_eq!(graph.edge_weight(Identity::new(1), Identity::new(2)), Some(rounds as u64));
            prop_assert_eq!(graph.edge_count(), 1);
        }
    }

    #[test]
    fn lone_identity_never_gets_an_edge(objects in prop::collection::vec(0u64..50, 1..20), id in 0u64..1000) {
        for kind in KINDS {
            let builder = builder(kind, 1);
            builder.update_graph(Identity::new(id), &detail(&objects)).unwrap();
            builder.update_graph(Identity::new(id), &detail(&objects)).unwrap();
            let graph = builder.affinity_graph().unwrap();
            prop_assert_eq!(graph.edge_count(), 0);
            prop_assert_eq!(graph.vertex_count(), 1);
        }
    }

    #[test]
    fn system_identities_never_enter_the_graph(reports in report_strategy()) {
        for kind in KINDS {
            let builder = builder(kind, 1);
            for (owner, system, objects) in &reports {
                let owner = if *system { Identity::system(*owner) } else { Identity::new(*owner) };
                builder.update_graph(owner, &detail(objects)).unwrap();
            }
            let graph = builder.affinity_graph().unwrap();
            prop_assert!(graph.identities().all(|identity| !identity.is_system()));
            for (key, edge) in graph.edges() {
                let (a, b) = key.endpoints();
                prop_assert!(a != b);
                prop_assert!(edge.weight() >= 1);
                prop_assert!(graph.contains_vertex(&a) && graph.contains_vertex(&b));
            }
        }
    }

    #[test]
    fn pruning_only_shrinks_and_eventually_empties(
        reports in report_strategy(),
        period_count in 1usize..4,
    ) {
        for kind in KINDS {
            let builder = builder(kind, period_count);
            for (owner, _, objects) in &reports {
                builder.update_graph(Identity::new(*owner), &detail(objects)).unwrap();
            }
            builder.update_graph(Identity::new(99), &AccessDetail::new()).unwrap();
            let mut graph = builder.affinity_graph().unwrap();
            for _ in 0..=period_count {
                builder.prune().unwrap();
                let next = builder.affinity_graph().unwrap();
                prop_assert!(next.vertex_count() <= graph.vertex_count());
                prop_assert!(next.edge_count() <= graph.edge_count());
                prop_assert!(next.total_weight() <= graph.total_weight());
                graph = next;
            }
            prop_assert!(graph.is_empty());
            prop_assert_eq!(graph.edge_count(), 0);
            prop_assert!(builder.object_use_map().is_empty());
        }
    }
}

#[test]
fn concurrent_reports_lose_no_increments() {
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 50;
    for kind in KINDS {
        let builder = builder(kind, 1);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                let builder = Arc::clone(&builder);
                scope.spawn(move || {
                    for _ in 0..ROUNDS {
                        builder.update_graph(Identity::new(1), &detail(&[7])).unwrap();
                        builder.update_graph(Identity::new(2), &detail(&[7])).unwrap();
                    }
                });
            }
        });
        let graph = builder.affinity_graph().unwrap();
        assert_eq!(graph.edge_weight(Identity::new(1), Identity::new(2)), Some(THREADS * ROUNDS), "{kind}");
        let uses = builder.object_use_map();
        assert_eq!(uses[&ObjectId(7)][&Identity::new(1)], THREADS * ROUNDS);
        assert_eq!(uses[&ObjectId(7)][&Identity::new(2)], THREADS * ROUNDS);
        assert_eq!(builder.stats().update_count, 2 * THREADS * ROUNDS);
    }
}
