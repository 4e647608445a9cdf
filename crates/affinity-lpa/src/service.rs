//! Per-node wiring of the affinity subsystem.

use std::sync::Arc;

use affinity_graph::{GraphBuilder, GraphListener, NodeId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AffinityConfig;
use crate::driver::GroupDriver;
use crate::error::Result;
use crate::finder::AffinityGroupFinder;
use crate::participant::LabelPropagation;
use crate::rpc::{LpaClient, LpaServer};
use crate::server::LabelPropagationServer;
use crate::single::SingleLabelPropagation;
use crate::watchdog::Watchdog;

/// What a node contributes to the subsystem.
#[derive(Clone)]
pub enum NodeRole {
    /// Hosts the coordinator and a participant.
    Core,
    /// Runs a participant that registers with a remote coordinator.
    App {
        server: Arc<dyn LpaServer>,
        coordinator: NodeId,
    },
    /// Runs the algorithm locally without any peers.
    Single,
}

impl std::fmt::Debug for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Core => f.write_str("Core"),
            NodeRole::App { coordinator, .. } => {
                f.debug_struct("App").field("coordinator", coordinator).finish()
            }
            NodeRole::Single => f.write_str("Single"),
        }
    }
}

struct Parts {
    builder: Arc<dyn GraphBuilder>,
    listener: GraphListener,
    participant: Option<LabelPropagation>,
    coordinator: Option<LabelPropagationServer>,
    driver: Option<GroupDriver>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The affinity subsystem of one node.
///
/// Every accessor returns `None` when the node is configured without a
/// builder.
pub struct AffinityService {
    node: NodeId,
    parts: Option<Parts>,
}

impl std::fmt::Debug for AffinityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityService")
            .field("node", &self.node)
            .field("enabled", &self.parts.is_some())
            .finish()
    }
}

impl AffinityService {
    /// Build and start the subsystem for `node`.
    pub async fn start(
        node: NodeId,
        role: NodeRole,
        config: AffinityConfig,
        watchdog: Arc<dyn Watchdog>,
    ) -> Result<Self> {
        config.validate()?;
        let Some(kind) = config.builder else {
            info!(%node, "affinity subsystem configured off");
            return Ok(Self { node, parts: None });
        };

        let builder = affinity_graph::build(kind, &config.graph)?;
        let listener = GraphListener::new(Arc::clone(&builder));
        let (participant, coordinator, finder) = match role {
            NodeRole::Core => {
                let server = LabelPropagationServer::new(node, config.lpa.clone(), Arc::clone(&watchdog))?;
                let participant = LabelPropagation::new(
                    node,
                    node,
                    Arc::clone(&builder),
                    Arc::new(server.clone()),
                    Arc::clone(&watchdog),
                    config.lpa.clone(),
                )?;
                participant.register().await?;
                let finder: Arc<dyn AffinityGroupFinder> = Arc::new(server.clone());
                (Some(participant), Some(server), Some(finder))
            }
            NodeRole::App { server, coordinator } => {
                let participant = LabelPropagation::new(
                    node,
                    coordinator,
                    Arc::clone(&builder),
                    server,
                    Arc::clone(&watchdog),
                    config.lpa.clone(),
                )?;
                participant.register().await?;
                (Some(participant), None, None)
            }
            NodeRole::Single => {
                let finder: Arc<dyn AffinityGroupFinder> =
                    Arc::new(SingleLabelPropagation::new(node, Arc::clone(&builder), &config.lpa)?);
                (None, None, Some(finder))
            }
        };

        let mut tasks = vec![spawn_prune(node, Arc::clone(&builder), config.graph.snapshot_period)];
        let driver = match finder {
            Some(finder) => {
                let driver = GroupDriver::new(finder, config.update_frequency)?;
                tasks.push(driver.spawn());
                Some(driver)
            }
            None => None,
        };

        info!(%node, builder = %kind, coordinator = coordinator.is_some(), "affinity subsystem started");
        Ok(Self {
            node,
            parts: Some(Parts {
                builder,
                listener,
                participant,
                coordinator,
                driver,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn builder(&self) -> Option<&Arc<dyn GraphBuilder>> {
        self.parts.as_ref().map(|parts| &parts.builder)
    }

    /// Entry point for access reports.
    pub fn listener(&self) -> Option<&GraphListener> {
        self.parts.as_ref().map(|parts| &parts.listener)
    }

    /// The finder, on nodes that run one.
    pub fn finder(&self) -> Option<Arc<dyn AffinityGroupFinder>> {
        self.parts.as_ref()?.driver.as_ref().map(GroupDriver::finder)
    }

    pub fn driver(&self) -> Option<&GroupDriver> {
        self.parts.as_ref()?.driver.as_ref()
    }

    pub fn participant(&self) -> Option<&LabelPropagation> {
        self.parts.as_ref()?.participant.as_ref()
    }

    pub fn coordinator(&self) -> Option<&LabelPropagationServer> {
        self.parts.as_ref()?.coordinator.as_ref()
    }

    /// Coordinator endpoint for app nodes to register with.
    pub fn lpa_server(&self) -> Option<Arc<dyn LpaServer>> {
        self.coordinator()
            .map(|server| Arc::new(server.clone()) as Arc<dyn LpaServer>)
    }

    /// Tear the subsystem down. Idempotent.
    pub async fn shutdown(&self) {
        let Some(parts) = &self.parts else {
            return;
        };
        let tasks: Vec<JoinHandle<()>> = parts.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(driver) = &parts.driver {
            driver.shutdown().await;
        }
        if let Some(participant) = &parts.participant {
            if let Err(e) = participant.shutdown().await {
                debug!(node = %self.node, error = %e, "participant shutdown failed");
            }
        }
        parts.builder.shutdown();
        info!(node = %self.node, "affinity subsystem shut down");
    }
}

fn spawn_prune(node: NodeId, builder: Arc<dyn GraphBuilder>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            match builder.prune() {
                Ok(()) => debug!(%node, "pruned affinity graph"),
                Err(affinity_graph::Error::Shutdown) => break,
                Err(e) => warn!(%node, error = %e, "prune failed"),
            }
        }
    })
}
