//! Affinity groups produced by a label propagation run.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{Identity, Label, NodeId};

/// Identities the algorithm believes should be co-located.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroup {
    id: Label,
    generation: u64,
    members: BTreeSet<Identity>,
}

impl AffinityGroup {
    /// Create a group. Fails if `members` is empty.
    pub fn new(id: Label, generation: u64, members: BTreeSet<Identity>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::InvalidInput(format!("affinity group {id} has no members")));
        }
        Ok(Self {
            id,
            generation,
            members,
        })
    }

    /// The label shared by every member.
    pub fn id(&self) -> Label {
        self.id
    }

    /// Run number that produced this group.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn members(&self) -> &BTreeSet<Identity> {
        &self.members
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Looks up the node an identity currently runs on.
pub trait NodeLocator {
    fn locate(&self, identity: &Identity) -> Option<NodeId>;
}

impl<F> NodeLocator for F
where
    F: Fn(&Identity) -> Option<NodeId>,
{
    fn locate(&self, identity: &Identity) -> Option<NodeId> {
        self(identity)
    }
}

/// An affinity group together with where its members live.
///
/// The target node hosts the plurality of members. When several nodes host
/// equally many, the lowest node id wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocatingAffinityGroup {
    group: AffinityGroup,
    placement: BTreeMap<Identity, NodeId>,
    target: NodeId,
    stragglers: BTreeSet<Identity>,
}

impl RelocatingAffinityGroup {
    /// Build from a member → node map. Fails if the map is empty.
    pub fn new(id: Label, generation: u64, placement: BTreeMap<Identity, NodeId>) -> Result<Self> {
        let group = AffinityGroup::new(id, generation, placement.keys().copied().collect())?;
        let target = plurality_node(placement.values().copied())
            .ok_or_else(|| Error::InvalidInput(format!("affinity group {id} has no placement")))?;
        let stragglers = placement
            .iter()
            .filter(|(_, node)| **node != target)
            .map(|(identity, _)| *identity)
            .collect();
        Ok(Self {
            group,
            placement,
            target,
            stragglers,
        })
    }

    pub fn group(&self) -> &AffinityGroup {
        &self.group
    }

    pub fn id(&self) -> Label {
        self.group.id()
    }

    pub fn generation(&self) -> u64 {
        self.group.generation()
    }

    pub fn members(&self) -> &BTreeSet<Identity> {
        self.group.members()
    }

    /// Node each member was on when the group was computed.
    pub fn placement(&self) -> &BTreeMap<Identity, NodeId> {
        &self.placement
    }

    pub fn target_node(&self) -> NodeId {
        self.target
    }

    /// Members that were not on the target node when the group was computed.
    pub fn stragglers(&self) -> &BTreeSet<Identity> {
        &self.stragglers
    }

    /// Recompute stragglers against live placement. Members the locator
    /// cannot place are left out.
    pub fn find_stragglers(&self, locator: &dyn NodeLocator) -> BTreeSet<Identity> {
        self.group
            .members()
            .iter()
            .filter(|identity| matches!(locator.locate(identity), Some(node) if node != self.target))
            .copied()
            .collect()
    }
}

fn plurality_node(nodes: impl Iterator<Item = NodeId>) -> Option<NodeId> {
    let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
    for node in nodes {
        *counts.entry(node).or_insert(0) += 1;
    }
    // BTreeMap iterates in ascending order, so keeping only strictly larger
    // counts leaves the lowest node id among the maxima
    let mut best: Option<(NodeId, usize)> = None;
    for (node, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((node, count));
        }
    }
    best.map(|(node, _)| node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> Identity {
        Identity::new(n)
    }

    fn placement(entries: &[(u64, u64)]) -> BTreeMap<Identity, NodeId> {
        entries.iter().map(|(i, n)| (id(*i), NodeId(*n))).collect()
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(matches!(
            AffinityGroup::new(1, 1, BTreeSet::new()),
            Err(Error::InvalidInput(_))
        ));
        assert!(RelocatingAffinityGroup::new(1, 1, BTreeMap::new()).is_err());
    }

    #[test]
    fn plurality_node_is_target() {
        let group =
            RelocatingAffinityGroup::new(7, 3, placement(&[(1, 42), (2, 42), (3, 42), (4, 9)])).unwrap();
        assert_eq!(group.target_node(), NodeId(42));
        assert_eq!(group.stragglers().len(), 1);
        assert!(group.stragglers().contains(&id(4)));
        assert_eq!(group.id(), 7);
        assert_eq!(group.generation(), 3);
        assert_eq!(group.members().len(), 4);
    }

    #[test]
    fn colocated_group_has_no_stragglers() {
        let group = RelocatingAffinityGroup::new(1, 1, placement(&[(1, 5), (2, 5), (3, 5)])).unwrap();
        assert_eq!(group.target_node(), NodeId(5));
        assert!(group.stragglers().is_empty());
    }

    #[test]
    fn tie_goes_to_lowest_node() {
        let group = RelocatingAffinityGroup::new(1, 1, placement(&[(1, 8), (2, 3), (3, 8), (4, 3)])).unwrap();
        assert_eq!(group.target_node(), NodeId(3));
        let stragglers: Vec<_> = group.stragglers().iter().copied().collect();
        assert_eq!(stragglers, vec![id(1), id(3)]);
    }

    #[test]
    fn stragglers_follow_live_placement() {
        let group = RelocatingAffinityGroup::new(1, 1, placement(&[(1, 1), (2, 1), (3, 2)])).unwrap();
        // identity 3 has since moved to the target and identity 1 has left
        let locator = |identity: &Identity| match identity.id() {
            1 => Some(NodeId(4)),
            2 | 3 => Some(NodeId(1)),
            _ => None,
        };
        let live = group.find_stragglers(&locator);
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec![id(1)]);

        let unknown = |_: &Identity| -> Option<NodeId> { None };
        assert!(group.find_stragglers(&unknown).is_empty());
    }
}
