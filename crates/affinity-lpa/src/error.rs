//! Error types for affinity-lpa.

use std::time::Duration;

use affinity_graph::NodeId;
use thiserror::Error;

/// Result type for affinity-lpa operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by participants, the coordinator and the group driver.
#[derive(Debug, Error)]
pub enum Error {
    /// The local graph builder failed.
    #[error("graph error: {0}")]
    Graph(#[source] affinity_graph::Error),

    /// A configuration value is out of range. Never clamped silently.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A call carried the wrong run or iteration number.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The component is in the wrong state for the requested operation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// The component has been shut down.
    #[error("component has been shut down")]
    Shutdown,

    /// A remote participant or coordinator could not be reached.
    #[error("communication with {node} failed: {reason}")]
    Communication { node: NodeId, reason: String },

    /// A stage did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// No participant is registered for the node.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn communication(node: NodeId, reason: impl Into<String>) -> Self {
        Error::Communication {
            node,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Communication { .. } | Error::Timeout(_))
    }
}

impl From<affinity_graph::Error> for Error {
    fn from(e: affinity_graph::Error) -> Self {
        match e {
            affinity_graph::Error::Shutdown => Error::Shutdown,
            affinity_graph::Error::InvalidConfig(reason) => Error::InvalidConfig(reason),
            affinity_graph::Error::InvalidState { expected, actual } => {
                Error::InvalidState { expected, actual }
            }
            other => Error::Graph(other),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_lifecycle_errors_keep_their_meaning() {
        assert!(matches!(Error::from(affinity_graph::Error::Shutdown), Error::Shutdown));
        assert!(matches!(
            Error::from(affinity_graph::Error::InvalidConfig("x".into())),
            Error::InvalidConfig(_)
        ));
        assert!(matches!(
            Error::from(affinity_graph::Error::InvalidInput("x".into())),
            Error::Graph(_)
        ));
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(Error::communication(NodeId(1), "refused").is_retryable());
        assert!(Error::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!Error::Protocol("stale run".into()).is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }
}
