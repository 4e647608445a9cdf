//! Node liveness.
//!
//! The cluster membership service is external. Participants and the
//! coordinator only need to ask whether a node is alive, report a node they
//! could not reach, and hear about failures.

use std::collections::HashSet;

use affinity_graph::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    Started(NodeId),
    Failed(NodeId),
}

/// Liveness service seam.
pub trait Watchdog: Send + Sync {
    /// Whether `node` is believed alive. Unknown nodes count as alive.
    fn is_alive(&self, node: NodeId) -> bool;

    /// Report that `node` stopped responding.
    fn report_failure(&self, node: NodeId);

    /// Subscribe to membership changes.
    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}

/// In-process watchdog.
#[derive(Debug)]
pub struct LocalWatchdog {
    failed: RwLock<HashSet<NodeId>>,
    events: broadcast::Sender<NodeEvent>,
}

impl Default for LocalWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalWatchdog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            failed: RwLock::new(HashSet::new()),
            events,
        }
    }

    /// Mark `node` alive, e.g. after a restart.
    pub fn node_started(&self, node: NodeId) {
        self.failed.write().remove(&node);
        let _ = self.events.send(NodeEvent::Started(node));
    }
}

impl Watchdog for LocalWatchdog {
    fn is_alive(&self, node: NodeId) -> bool {
        !self.failed.read().contains(&node)
    }

    fn report_failure(&self, node: NodeId) {
        if self.failed.write().insert(node) {
            info!(%node, "node declared failed");
            // nobody listening is fine
            let _ = self.events.send(NodeEvent::Failed(node));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
