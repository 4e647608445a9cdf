//! Affinity Graph
//!
//! Windowed identity co-access graphs for affinity-group detection.
//!
//! Every completed unit of work reports which shared objects its owner
//! touched. Identities that touch the same objects get connected, and the
//! weight of the connection grows with repeated co-access:
//!
//! ```text
//!   access report ──► GraphListener ──► GraphBuilder ──► AffinityGraph snapshot
//!                                          │   ▲
//!   cache conflict ──► ConflictTracker ◄───┘   └── prune() once per period
//! ```
//!
//! Builders keep only the last `period_count` closed periods. Reports that
//! are not refreshed drain out of the graph completely.
//!
//! Label propagation over the snapshots produces [`AffinityGroup`]s, and
//! [`quality`] scores them.

mod access;
pub mod builder;
mod conflict;
mod error;
mod graph;
mod group;
mod identity;
mod lifecycle;
mod listener;
mod prune;
pub mod quality;
mod stats;

pub use access::{AccessDetail, AccessedObject};
pub use builder::{
    build, BipartiteGraphBuilder, BuilderKind, GraphBuilder, GraphConfig, ObjectUseMap,
    WeightedGraphBuilder,
};
pub use conflict::{ConflictMap, ConflictTracker};
pub use error::{Error, Result};
pub use graph::{AffinityGraph, Edge, EdgeKey, LabelVertex};
pub use group::{AffinityGroup, NodeLocator, RelocatingAffinityGroup};
pub use identity::{Identity, Label, NodeId, ObjectId};
pub use lifecycle::{ComponentState, Lifecycle};
pub use listener::GraphListener;
pub use prune::PruneWindow;
pub use quality::{jaccard, modularity};
pub use stats::{BuilderStats, BuilderStatsSnapshot};
