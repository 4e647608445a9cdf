//! Entry point for completed-work reports.

use std::sync::Arc;

use tracing::debug;

use crate::access::AccessDetail;
use crate::builder::GraphBuilder;
use crate::error::Result;
use crate::identity::Identity;

/// Forwards access reports from the telemetry pipeline to a graph builder.
#[derive(Clone)]
pub struct GraphListener {
    builder: Arc<dyn GraphBuilder>,
}

impl GraphListener {
    pub fn new(builder: Arc<dyn GraphBuilder>) -> Self {
        Self { builder }
    }

    /// Report one completed unit of work.
    ///
    /// Reports owned by system identities and reports that touched nothing are
    /// skipped before they reach the builder.
    pub fn report(&self, owner: Identity, detail: &AccessDetail) -> Result<()> {
        if owner.is_system() || detail.is_empty() {
            return Ok(());
        }
        debug!(%owner, objects = detail.len(), "access report");
        self.builder.update_graph(owner, detail)
    }

    pub fn builder(&self) -> &Arc<dyn GraphBuilder> {
        &self.builder
    }
}

impl std::fmt::Debug for GraphListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphListener")
            .field("builder", &self.builder.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WeightedGraphBuilder;
    use crate::identity::ObjectId;

    #[test]
    fn forwards_reports_to_builder() {
        let builder: Arc<dyn GraphBuilder> = Arc::new(WeightedGraphBuilder::new(1).unwrap());
        let listener = GraphListener::new(Arc::clone(&builder));
        let detail = AccessDetail::new().with_access(ObjectId(1));
        listener.report(Identity::new(1), &detail).unwrap();
        listener.report(Identity::new(2), &detail).unwrap();
        let graph = builder.affinity_graph().unwrap();
        assert_eq!(graph.edge_weight(Identity::new(1), Identity::new(2)), Some(1));
        assert_eq!(builder.stats().update_count, 2);
    }

    #[test]
    fn skips_system_owners_and_empty_reports() {
        let builder: Arc<dyn GraphBuilder> = Arc::new(WeightedGraphBuilder::new(1).unwrap());
        let listener = GraphListener::new(Arc::clone(&builder));
        listener
            .report(Identity::system(1), &AccessDetail::new().with_access(ObjectId(1)))
            .unwrap();
        listener.report(Identity::new(2), &AccessDetail::new()).unwrap();
        assert_eq!(builder.stats().update_count, 0);
        assert!(builder.affinity_graph().unwrap().is_empty());
    }
}
