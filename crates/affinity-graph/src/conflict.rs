//! Cross-node conflict tracking.
//!
//! When a local access evicts or conflicts with a copy of an object cached on
//! another node, the data store reports it here. The resulting map tells the
//! label propagation participant which remote nodes share which objects with
//! us, which is how edges spanning nodes are discovered.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::identity::{NodeId, ObjectId};
use crate::prune::PruneWindow;

/// Remote node → (object → conflict count).
pub type ConflictMap = HashMap<NodeId, HashMap<ObjectId, u64>>;

#[derive(Debug)]
struct ConflictState {
    conflicts: ConflictMap,
    window: PruneWindow<ConflictMap>,
}

/// Thread-safe conflict counters with windowed expiry.
#[derive(Debug)]
pub struct ConflictTracker {
    state: Mutex<ConflictState>,
}

impl ConflictTracker {
    /// Create a tracker whose counts expire with a `period_count` window.
    pub fn new(period_count: usize) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(ConflictState {
                conflicts: HashMap::new(),
                window: PruneWindow::new(period_count)?,
            }),
        })
    }

    /// Record that an access to `object` conflicted with `node`'s copy.
    pub fn note_conflict_detected(&self, object: ObjectId, node: NodeId, for_update: bool) {
        trace!(%object, %node, for_update, "conflict detected");
        let mut state = self.state.lock();
        let ConflictState { conflicts, window } = &mut *state;
        *conflicts.entry(node).or_default().entry(object).or_insert(0) += 1;
        *window
            .current_mut()
            .entry(node)
            .or_default()
            .entry(object)
            .or_insert(0) += 1;
    }

    /// Snapshot of all conflicts.
    pub fn conflict_map(&self) -> ConflictMap {
        self.state.lock().conflicts.clone()
    }

    /// Conflicts with a single node.
    pub fn conflicts_with(&self, node: NodeId) -> Option<HashMap<ObjectId, u64>> {
        self.state.lock().conflicts.get(&node).cloned()
    }

    /// Forget everything attributed to `node`. Unknown nodes are ignored.
    pub fn remove_node(&self, node: NodeId) -> bool {
        let removed = self.state.lock().conflicts.remove(&node).is_some();
        if removed {
            debug!(%node, "dropped conflicts for removed node");
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().conflicts.is_empty()
    }

    /// Advance the window, subtracting the counts of the expired period.
    pub fn prune(&self) {
        let mut state = self.state.lock();
        let ConflictState { conflicts, window } = &mut *state;
        let Some(expired) = window.advance() else {
            return;
        };
        for (node, objects) in expired {
            // the node may have been removed since
            let Some(counts) = conflicts.get_mut(&node) else {
                continue;
            };
            for (object, n) in objects {
                if let Some(count) = counts.get_mut(&object) {
                    *count = count.saturating_sub(n);
                    if *count == 0 {
                        counts.remove(&object);
                    }
                }
            }
            if counts.is_empty() {
                conflicts.remove(&node);
            }
        }
    }
}
