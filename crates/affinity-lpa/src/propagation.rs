//! Label propagation over one node's graph.
//!
//! Every pass reads the labels of the previous pass. A vertex tallies the
//! labels of its neighbors, weighted by edge weight, plus whatever remote
//! participants reported for the objects it uses, and proposes the label
//! with the highest total. It keeps its current label when that label is
//! among the maxima, and otherwise takes the lowest maximal label.
//!
//! Applying every proposal at once can make two groups swap labels forever,
//! so each pass only applies the proposals of vertices whose
//! `blake3(run, iteration, identity)` has an even first byte. The choice is
//! deterministic for a given run, so every node agrees on it without
//! talking.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use affinity_graph::{AffinityGraph, AffinityGroup, Identity, Label};
use tracing::trace;

use crate::error::Result;

/// Label → weight.
pub type LabelTally = HashMap<Label, u64>;

/// Weights contributed by remote participants, per local identity.
pub type RemoteTally = HashMap<Identity, LabelTally>;

/// Result of one propagation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassOutcome {
    /// Vertices whose proposal differed from their label.
    pub changed: usize,
    /// Proposals actually applied.
    pub applied: usize,
    pub converged: bool,
}

/// Pick the label `current` moves to given `tally`.
pub fn propose_label(current: Label, tally: &LabelTally) -> Label {
    let Some(max) = tally.values().copied().max() else {
        return current;
    };
    if tally.get(&current) == Some(&max) {
        return current;
    }
    tally
        .iter()
        .filter(|(_, weight)| **weight == max)
        .map(|(label, _)| *label)
        .min()
        .unwrap_or(current)
}

/// Whether `identity` may change its label in this pass.
pub fn is_active(run: u64, iteration: u32, identity: &Identity) -> bool {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&run.to_le_bytes());
    hasher.update(&iteration.to_le_bytes());
    hasher.update(&identity.to_bytes());
    hasher.finalize().as_bytes()[0] & 1 == 0
}

/// Run one synchronous pass over `graph`.
pub fn run_pass(graph: &mut AffinityGraph, remote: &RemoteTally, run: u64, iteration: u32) -> PassOutcome {
    let previous = graph.labels();
    let mut proposals = Vec::new();
    for (identity, current) in &previous {
        let mut tally = LabelTally::new();
        for (neighbor, weight) in graph.neighbors(identity) {
            if let Some(label) = previous.get(&neighbor) {
                *tally.entry(*label).or_insert(0) += weight;
            }
        }
        if let Some(remote) = remote.get(identity) {
            for (label, weight) in remote {
                *tally.entry(*label).or_insert(0) += weight;
            }
        }
        let proposal = propose_label(*current, &tally);
        if proposal != *current {
            proposals.push((*identity, proposal));
        }
    }

    let mut outcome = PassOutcome {
        changed: proposals.len(),
        applied: 0,
        converged: proposals.is_empty(),
    };
    for (identity, label) in proposals {
        if is_active(run, iteration, &identity) {
            graph.set_label(&identity, label);
            outcome.applied += 1;
        }
    }
    trace!(run, iteration, changed = outcome.changed, applied = outcome.applied, "pass complete");
    outcome
}

/// Group the graph's vertices by current label, in label order.
pub fn gather_groups(graph: &AffinityGraph, generation: u64) -> Result<Vec<AffinityGroup>> {
    let mut by_label: BTreeMap<Label, BTreeSet<Identity>> = BTreeMap::new();
    for vertex in graph.vertices() {
        by_label.entry(vertex.label()).or_default().insert(vertex.identity());
    }
    by_label
        .into_iter()
        .map(|(label, members)| Ok(AffinityGroup::new(label, generation, members)?))
        .collect()
}

/// Iterate a standalone graph until it converges or `max_iterations` passes
/// have run. Returns the number of passes and whether it converged.
pub fn propagate(graph: &mut AffinityGraph, run: u64, max_iterations: u32) -> (u32, bool) {
    let remote = RemoteTally::new();
    for iteration in 0..max_iterations {
        if run_pass(graph, &remote, run, iteration).converged {
            return (iteration + 1, true);
        }
    }
    (max_iterations, false)
}
