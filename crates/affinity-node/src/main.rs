//! Affinity node simulation
//!
//! Runs a core node and a few app nodes in one process, feeds them a seeded
//! workload with planted communities and reports how well the found groups
//! recover them.

mod workload;

use std::sync::Arc;

use affinity_graph::{jaccard, modularity, AffinityGraph, AffinityGroup, GraphBuilder, NodeId};
use affinity_lpa::{AffinityConfig, AffinityGroupFinder, AffinityService, LocalWatchdog, NodeRole};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::workload::{SimConfig, SimError, Workload};

#[derive(Debug, Serialize)]
struct RoundSummary {
    round: u32,
    reports: usize,
    groups: usize,
    stragglers: usize,
    modularity: Option<f64>,
    jaccard: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "affinity_node=info,affinity_lpa=info,affinity_graph=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AffinityConfig::from_env()?;
    let sim = SimConfig::from_env()?;
    if config.builder.is_none() {
        info!("affinity subsystem configured off, nothing to simulate");
        return Ok(());
    }
    info!(nodes = sim.nodes, communities = sim.communities, seed = sim.seed, "starting simulation");

    let watchdog = Arc::new(LocalWatchdog::new());
    let services = start_cluster(&config, sim.nodes, watchdog).await?;
    let core = &services[0];
    let driver = core
        .driver()
        .ok_or_else(|| SimError::InvalidConfig("core node has no group driver".to_string()))?;

    let mut workload = Workload::new(&sim);
    let planted = workload.planted()?;
    let mut summaries = Vec::new();
    for round in 1..=sim.rounds {
        let reports = workload.drive(&services)?;
        let Some(groups) = driver.run_once().await else {
            warn!(round, "run failed, skipping round");
            continue;
        };
        let found: Vec<AffinityGroup> = groups.iter().map(|g| g.group().clone()).collect();
        let merged = merged_graph(&services)?;

        let summary = RoundSummary {
            round,
            reports,
            groups: groups.len(),
            stragglers: groups.iter().map(|g| g.stragglers().len()).sum(),
            modularity: modularity(&merged, &found).ok(),
            jaccard: jaccard(&found, &planted).ok(),
        };
        info!(
            round,
            groups = summary.groups,
            stragglers = summary.stragglers,
            modularity = ?summary.modularity,
            jaccard = ?summary.jaccard,
            "round finished"
        );
        summaries.push(summary);
    }

    info!(stats = ?driver.finder().stats(), "finder statistics");
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    for service in services.iter().rev() {
        service.shutdown().await;
    }
    Ok(())
}

/// Node 1 hosts the coordinator, the rest register with it.
async fn start_cluster(
    config: &AffinityConfig,
    nodes: usize,
    watchdog: Arc<LocalWatchdog>,
) -> Result<Vec<AffinityService>, SimError> {
    let core = AffinityService::start(NodeId(1), NodeRole::Core, config.clone(), watchdog.clone()).await?;
    let server = core
        .lpa_server()
        .ok_or_else(|| SimError::InvalidConfig("core node has no coordinator".to_string()))?;
    let mut services = vec![core];
    for n in 2..=nodes as u64 {
        let role = NodeRole::App {
            server: Arc::clone(&server),
            coordinator: NodeId(1),
        };
        services.push(AffinityService::start(NodeId(n), role, config.clone(), watchdog.clone()).await?);
    }
    Ok(services)
}

/// Union of every node's local graph.
fn merged_graph(services: &[AffinityService]) -> Result<AffinityGraph, SimError> {
    let mut merged = AffinityGraph::new();
    for builder in services.iter().filter_map(AffinityService::builder) {
        merged.merge(&builder.affinity_graph()?);
    }
    Ok(merged)
}
