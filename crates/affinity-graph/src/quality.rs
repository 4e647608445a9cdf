//! Partition quality metrics.
//!
//! Used to validate results, never on the run path.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::graph::AffinityGraph;
use crate::group::AffinityGroup;
use crate::identity::Identity;

/// Weighted modularity of `groups` over `graph`:
///
/// ```text
/// Q = Σ_c [ in_c / m − (deg_c / 2m)² ]
/// ```
///
/// where `m` is the total edge weight, `in_c` the weight of edges inside `c`
/// and `deg_c` the summed weighted degree of `c`'s members. Members missing
/// from the graph contribute nothing.
pub fn modularity(graph: &AffinityGraph, groups: &[AffinityGroup]) -> Result<f64> {
    if graph.is_empty() || graph.total_weight() == 0 {
        return Err(Error::InvalidInput("modularity of an empty graph".to_string()));
    }
    if groups.is_empty() {
        return Err(Error::InvalidInput("modularity of an empty partition".to_string()));
    }

    let mut community: HashMap<Identity, usize> = HashMap::new();
    for (index, group) in groups.iter().enumerate() {
        for member in group.members() {
            community.insert(*member, index);
        }
    }

    let mut inside = vec![0u64; groups.len()];
    let mut degree = vec![0u64; groups.len()];
    for (key, edge) in graph.edges() {
        let (a, b) = key.endpoints();
        let (ca, cb) = (community.get(&a), community.get(&b));
        if let Some(c) = ca {
            degree[*c] += edge.weight();
        }
        if let Some(c) = cb {
            degree[*c] += edge.weight();
        }
        if let (Some(ca), Some(cb)) = (ca, cb) {
            if ca == cb {
                inside[*ca] += edge.weight();
            }
        }
    }

    let m = graph.total_weight() as f64;
    let q: f64 = inside
        .iter()
        .zip(&degree)
        .map(|(&in_c, &deg_c)| {
            let share = deg_c as f64 / (2.0 * m);
            in_c as f64 / m - share * share
        })
        .sum();
    Ok(q)
}

/// Jaccard similarity between two partitions: the number of identity pairs
/// grouped together in both, over the number grouped together in either.
///
/// Two partitions without a single co-membered pair are identical (1.0).
pub fn jaccard(a: &[AffinityGroup], b: &[AffinityGroup]) -> Result<f64> {
    if a.is_empty() || b.is_empty() {
        return Err(Error::InvalidInput("jaccard of an empty partition".to_string()));
    }
    let pairs_a = co_membered_pairs(a);
    let pairs_b = co_membered_pairs(b);
    let union = pairs_a.union(&pairs_b).count();
    if union == 0 {
        return Ok(1.0);
    }
    let both = pairs_a.intersection(&pairs_b).count();
    Ok(both as f64 / union as f64)
}

fn co_membered_pairs(groups: &[AffinityGroup]) -> HashSet<(Identity, Identity)> {
    let mut pairs = HashSet::new();
    for group in groups {
        let members: Vec<Identity> = group.members().iter().copied().collect();
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                // members are sorted, so (a, b) is already canonical
                pairs.insert((*a, *b));
            }
        }
    }
    pairs
}
