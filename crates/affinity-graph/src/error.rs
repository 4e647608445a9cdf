//! Error types for affinity-graph.

use thiserror::Error;

/// Result type for affinity-graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by graph builders, trackers and the quality evaluator.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range. Never clamped silently.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A report or argument was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The component is in the wrong state for the requested operation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// The component has been shut down.
    #[error("component has been shut down")]
    Shutdown,
}
