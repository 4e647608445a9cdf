//! Participant and coordinator RPC surfaces.
//!
//! Calls that start work (`prepare_algorithm`, `start_iteration`) return as
//! soon as the request is validated. Completion comes back out of band
//! through the coordinator callbacks, each tagged with the run number:
//!
//! ```text
//!   coordinator                         participant
//!   ───────────                         ───────────
//!   prepare_algorithm(run)  ─────────►  snapshot graph, exchange conflicts
//!                           ◄─────────  ready_to_begin(node, run, failed)
//!   start_iteration(k)      ─────────►  remote_labels(k) from peers, one pass
//!                           ◄─────────  finished_iteration(node, run, converged, failed, k)
//!   affinity_groups(run, true) ──────►  local groups by label
//! ```
//!
//! Any call may fail with [`Error::Communication`](crate::Error::Communication);
//! the coordinator treats that like a participant reporting `failed`.

use std::collections::HashMap;
use std::sync::Arc;

use affinity_graph::{AffinityGroup, Label, NodeId, ObjectId};
use async_trait::async_trait;

use crate::error::Result;

/// Object → (label → access count of each local identity holding that label).
pub type RemoteLabels = HashMap<ObjectId, HashMap<Label, Vec<u64>>>;

/// Calls the coordinator (and peers) make on a node's participant.
#[async_trait]
pub trait LpaClient: Send + Sync {
    /// Begin preparing for `run`. Readiness is reported through
    /// [`LpaServer::ready_to_begin`].
    async fn prepare_algorithm(&self, run: u64) -> Result<()>;

    /// Begin iteration `iteration` of the prepared run. Completion is
    /// reported through [`LpaServer::finished_iteration`].
    async fn start_iteration(&self, iteration: u32) -> Result<()>;

    /// Local groups of `run`. With `clear`, run state is dropped afterwards.
    async fn affinity_groups(&self, run: u64, clear: bool) -> Result<Vec<AffinityGroup>>;

    /// Labels of local identities using `objects`, as they stood when
    /// `iteration` began.
    async fn remote_labels(&self, objects: Vec<ObjectId>, iteration: u32) -> Result<RemoteLabels>;

    /// Tell this participant that `from` shares `objects` with it in `run`.
    async fn notify_cross_node_edges(
        &self,
        objects: Vec<ObjectId>,
        from: NodeId,
        run: u64,
    ) -> Result<()>;

    async fn enable(&self) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Calls participants make on the coordinator.
#[async_trait]
pub trait LpaServer: Send + Sync {
    /// Add or replace the participant for `node`.
    async fn register(&self, node: NodeId, client: Arc<dyn LpaClient>) -> Result<()>;

    async fn ready_to_begin(&self, node: NodeId, run: u64, failed: bool) -> Result<()>;

    async fn finished_iteration(
        &self,
        node: NodeId,
        run: u64,
        converged: bool,
        failed: bool,
        iteration: u32,
    ) -> Result<()>;

    /// Participant registered for `node`, if any.
    async fn client_proxy(&self, node: NodeId) -> Result<Option<Arc<dyn LpaClient>>>;
}
