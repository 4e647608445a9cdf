//! Weighted, undirected identity co-access graph.
//!
//! The graph is an arena: vertices live in a map keyed by [`Identity`], each
//! holding the set of its neighbors, and edges live in a flat map keyed by a
//! canonical [`EdgeKey`]. No vertex holds a reference to another.
//!
//! ```text
//!   vertices: Identity ─► LabelVertex + {neighbor identities}
//!   edges:    (min, max) ─► Edge { weight, last_updated }
//! ```
//!
//! Invariants: both endpoints of every edge are vertices, every edge weight is
//! at least 1, and there are no self loops.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::identity::{Identity, Label};

/// A vertex: an identity plus its current propagation label.
///
/// Equality and hashing only consider the identity, so a vertex can be found
/// while its label changes.
#[derive(Debug, Clone, Copy)]
pub struct LabelVertex {
    identity: Identity,
    label: Label,
}

impl LabelVertex {
    /// A vertex carrying the identity's initial label.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            label: identity.initial_label(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn set_label(&mut self, label: Label) {
        self.label = label;
    }

    /// Restore the identity's initial label.
    pub fn reset_label(&mut self) {
        self.label = self.identity.initial_label();
    }
}

impl PartialEq for LabelVertex {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for LabelVertex {}

impl Hash for LabelVertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

/// Canonical key of an undirected edge: `(min, max)` of its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey(Identity, Identity);

impl EdgeKey {
    /// Key for the edge between `a` and `b`, or `None` for a self loop.
    pub fn new(a: Identity, b: Identity) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self(a, b)),
            std::cmp::Ordering::Greater => Some(Self(b, a)),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn endpoints(&self) -> (Identity, Identity) {
        (self.0, self.1)
    }

    /// The endpoint opposite `vertex`, if `vertex` is an endpoint.
    pub fn opposite(&self, vertex: Identity) -> Option<Identity> {
        if vertex == self.0 {
            Some(self.1)
        } else if vertex == self.1 {
            Some(self.0)
        } else {
            None
        }
    }
}

/// Edge payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    weight: u64,
    last_updated: u64,
}

impl Edge {
    /// Co-access weight, always at least 1.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Period in which the weight last grew.
    pub fn last_updated(&self) -> u64 {
        self.last_updated
    }
}

#[derive(Debug, Clone)]
struct VertexEntry {
    vertex: LabelVertex,
    neighbors: HashSet<Identity>,
}

/// The affinity graph.
#[derive(Debug, Clone, Default)]
pub struct AffinityGraph {
    vertices: HashMap<Identity, VertexEntry>,
    edges: HashMap<EdgeKey, Edge>,
    total_weight: u64,
}

impl AffinityGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Returns `true` if it was not already present.
    pub fn add_vertex(&mut self, identity: Identity) -> bool {
        if self.vertices.contains_key(&identity) {
            return false;
        }
        self.vertices.insert(
            identity,
            VertexEntry {
                vertex: LabelVertex::new(identity),
                neighbors: HashSet::new(),
            },
        );
        true
    }

    pub fn contains_vertex(&self, identity: &Identity) -> bool {
        self.vertices.contains_key(identity)
    }

    pub fn vertex(&self, identity: &Identity) -> Option<&LabelVertex> {
        self.vertices.get(identity).map(|e| &e.vertex)
    }

    pub fn label(&self, identity: &Identity) -> Option<Label> {
        self.vertex(identity).map(LabelVertex::label)
    }

    /// Set a vertex label. Returns `false` if the vertex is unknown.
    pub fn set_label(&mut self, identity: &Identity, label: Label) -> bool {
        match self.vertices.get_mut(identity) {
            Some(entry) => {
                entry.vertex.set_label(label);
                true
            }
            None => false,
        }
    }

    /// Reset every vertex to its initial label.
    pub fn reset_labels(&mut self) {
        for entry in self.vertices.values_mut() {
            entry.vertex.reset_label();
        }
    }

    /// Current label of every vertex.
    pub fn labels(&self) -> HashMap<Identity, Label> {
        self.vertices
            .iter()
            .map(|(id, e)| (*id, e.vertex.label()))
            .collect()
    }

    pub fn vertices(&self) -> impl Iterator<Item = &LabelVertex> {
        self.vertices.values().map(|e| &e.vertex)
    }

    pub fn identities(&self) -> impl Iterator<Item = Identity> + '_ {
        self.vertices.keys().copied()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Sum of all edge weights.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn contains_edge(&self, key: &EdgeKey) -> bool {
        self.edges.contains_key(key)
    }

    pub fn edge(&self, a: Identity, b: Identity) -> Option<&Edge> {
        EdgeKey::new(a, b).and_then(|key| self.edges.get(&key))
    }

    pub fn edge_weight(&self, a: Identity, b: Identity) -> Option<u64> {
        self.edge(a, b).map(Edge::weight)
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeKey, &Edge)> {
        self.edges.iter().map(|(k, e)| (*k, e))
    }

    /// Add `by` to the weight of edge `(a, b)`, creating the edge and its
    /// endpoints as needed. Returns the new weight, or `None` for a self loop.
    pub fn increment_edge(&mut self, a: Identity, b: Identity, by: u64, period: u64) -> Option<u64> {
        let key = EdgeKey::new(a, b)?;
        if by == 0 {
            return Some(self.edges.get(&key).map_or(0, Edge::weight));
        }
        self.add_vertex(a);
        self.add_vertex(b);
        let edge = self.edges.entry(key).or_insert(Edge {
            weight: 0,
            last_updated: period,
        });
        edge.weight += by;
        edge.last_updated = period;
        let weight = edge.weight;
        self.total_weight += by;
        if let Some(entry) = self.vertices.get_mut(&a) {
            entry.neighbors.insert(b);
        }
        if let Some(entry) = self.vertices.get_mut(&b) {
            entry.neighbors.insert(a);
        }
        Some(weight)
    }

    /// Subtract `by` from an edge, removing the edge once its weight would
    /// drop to zero. Endpoints are left in place. Returns the remaining weight.
    pub fn decrement_edge(&mut self, key: &EdgeKey, by: u64) -> Option<u64> {
        let edge = self.edges.get_mut(key)?;
        if edge.weight > by {
            edge.weight -= by;
            self.total_weight -= by;
            return Some(edge.weight);
        }
        self.remove_edge(key);
        Some(0)
    }

    /// Remove an edge, leaving its endpoints in place.
    pub fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        self.total_weight -= edge.weight;
        let (a, b) = key.endpoints();
        if let Some(entry) = self.vertices.get_mut(&a) {
            entry.neighbors.remove(&b);
        }
        if let Some(entry) = self.vertices.get_mut(&b) {
            entry.neighbors.remove(&a);
        }
        Some(edge)
    }

    /// Remove a vertex together with its incident edges.
    pub fn remove_vertex(&mut self, identity: &Identity) -> Option<LabelVertex> {
        let neighbors: Vec<Identity> = self.vertices.get(identity)?.neighbors.iter().copied().collect();
        for neighbor in neighbors {
            if let Some(key) = EdgeKey::new(*identity, neighbor) {
                self.remove_edge(&key);
            }
        }
        self.vertices.remove(identity).map(|e| e.vertex)
    }

    /// Neighbors of a vertex with the weight of the connecting edge.
    pub fn neighbors<'a>(&'a self, identity: &Identity) -> impl Iterator<Item = (Identity, u64)> + 'a {
        let identity = *identity;
        self.vertices
            .get(&identity)
            .into_iter()
            .flat_map(move |entry| {
                entry.neighbors.iter().filter_map(move |neighbor| {
                    EdgeKey::new(identity, *neighbor)
                        .and_then(|key| self.edges.get(&key))
                        .map(|edge| (*neighbor, edge.weight))
                })
            })
    }

    /// Number of incident edges.
    pub fn degree(&self, identity: &Identity) -> usize {
        self.vertices.get(identity).map_or(0, |e| e.neighbors.len())
    }

    /// Sum of incident edge weights.
    pub fn weighted_degree(&self, identity: &Identity) -> u64 {
        self.neighbors(identity).map(|(_, w)| w).sum()
    }

    /// Fold another graph into this one, summing weights of shared edges.
    /// Labels of vertices already present are kept.
    pub fn merge(&mut self, other: &AffinityGraph) {
        for identity in other.identities() {
            self.add_vertex(identity);
        }
        for (key, edge) in other.edges() {
            let (a, b) = key.endpoints();
            self.increment_edge(a, b, edge.weight, edge.last_updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> Identity {
        Identity::new(n)
    }

    #[test]
    fn edge_key_is_canonical() {
        assert_eq!(EdgeKey::new(id(2), id(1)), EdgeKey::new(id(1), id(2)));
        assert!(EdgeKey::new(id(1), id(1)).is_none(), "self loops have no key");
        let key = EdgeKey::new(id(5), id(3)).unwrap();
        assert_eq!(key.endpoints(), (id(3), id(5)));
        assert_eq!(key.opposite(id(3)), Some(id(5)));
        assert_eq!(key.opposite(id(4)), None);
    }

    #[test]
    fn increment_creates_endpoints_and_accumulates() {
        let mut graph = AffinityGraph::new();
        assert_eq!(graph.increment_edge(id(1), id(2), 1, 0), Some(1));
        assert_eq!(graph.increment_edge(id(2), id(1), 2, 3), Some(3));
        assert_eq!(graph.vertex_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.total_weight(), 3);
        assert_eq!(graph.edge(id(1), id(2)).unwrap().last_updated(), 3);
        assert_eq!(graph.increment_edge(id(1), id(1), 1, 0), None);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn decrement_removes_exhausted_edges_only() {
        let mut graph = AffinityGraph::new();
        graph.increment_edge(id(1), id(2), 3, 0);
        let key = EdgeKey::new(id(1), id(2)).unwrap();
        assert_eq!(graph.decrement_edge(&key, 1), Some(2));
        assert_eq!(graph.decrement_edge(&key, 2), Some(0));
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.vertex_count(), 2, "endpoints survive edge removal");
        assert_eq!(graph.degree(&id(1)), 0);
        assert_eq!(graph.total_weight(), 0);
    }

    #[test]
    fn remove_vertex_drops_incident_edges() {
        let mut graph = AffinityGraph::new();
        graph.increment_edge(id(1), id(2), 1, 0);
        graph.increment_edge(id(1), id(3), 2, 0);
        graph.increment_edge(id(2), id(3), 4, 0);
        graph.remove_vertex(&id(1));
        assert_eq!(graph.vertex_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.total_weight(), 4);
        assert_eq!(graph.degree(&id(2)), 1);
    }

    #[test]
    fn labels_are_independent_of_vertex_identity() {
        let mut graph = AffinityGraph::new();
        graph.add_vertex(id(9));
        assert_eq!(graph.label(&id(9)), Some(9));
        assert!(graph.set_label(&id(9), 4));
        let mut copy = LabelVertex::new(id(9));
        copy.set_label(100);
        assert_eq!(graph.vertex(&id(9)), Some(&copy), "equality ignores labels");
        graph.reset_labels();
        assert_eq!(graph.label(&id(9)), Some(9));
        assert!(!graph.set_label(&id(10), 1));
    }

    #[test]
    fn weighted_degree_sums_incident_weights() {
        let mut graph = AffinityGraph::new();
        graph.increment_edge(id(1), id(2), 2, 0);
        graph.increment_edge(id(1), id(3), 5, 0);
        assert_eq!(graph.weighted_degree(&id(1)), 7);
        let mut neighbors: Vec<_> = graph.neighbors(&id(1)).collect();
        neighbors.sort();
        assert_eq!(neighbors, vec![(id(2), 2), (id(3), 5)]);
    }

    #[test]
    fn merge_sums_shared_edges() {
        let mut left = AffinityGraph::new();
        left.increment_edge(id(1), id(2), 2, 0);
        let mut right = AffinityGraph::new();
        right.increment_edge(id(1), id(2), 3, 0);
        right.increment_edge(id(3), id(4), 1, 0);
        right.add_vertex(id(5));
        left.merge(&right);
        assert_eq!(left.edge_weight(id(1), id(2)), Some(5));
        assert_eq!(left.edge_count(), 2);
        assert_eq!(left.vertex_count(), 5);
    }
}
