//! Distributed label propagation over per-node affinity graphs.
//!
//! Every node runs a [`LabelPropagation`] participant over the graph its
//! builder maintains. The core node also hosts a [`LabelPropagationServer`]
//! that drives all participants through the same run in lock-step (see
//! [`rpc`] for the call sequence) and merges their local groups by label.
//! [`SingleLabelPropagation`] runs the same passes on one node without
//! peers, and [`GroupDriver`] calls either finder on a schedule.
//! [`AffinityService`] wires all of this up for one node.

mod config;
mod driver;
mod error;
mod finder;
mod participant;
pub mod propagation;
mod retry;
pub mod rpc;
mod server;
mod service;
mod single;
mod watchdog;

pub use config::{
    validate_update_frequency, AffinityConfig, LpaConfig, DEFAULT_SERVER_PORT, UPDATE_FREQUENCY_SECS,
};
pub use driver::{GroupDriver, Groups};
pub use error::{Error, Result};
pub use finder::{AffinityGroupFinder, FinderStats, StatsRecorder};
pub use participant::{LabelPropagation, ParticipantPhase};
pub use retry::IoRetry;
pub use rpc::{LpaClient, LpaServer, RemoteLabels};
pub use server::{LabelPropagationServer, RunPhase};
pub use service::{AffinityService, NodeRole};
pub use single::SingleLabelPropagation;
pub use watchdog::{LocalWatchdog, NodeEvent, Watchdog};
