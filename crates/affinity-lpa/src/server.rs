//! Label propagation coordinator.
//!
//! One run walks every live participant through the same stages in lock
//! step:
//!
//! ```text
//!   Idle ─► Preparing ─► Iterating(0) ─► … ─► Iterating(k) ─► Gathering ─► Idle
//!              │              │                   │
//!              └── barrier ───┴────── barrier ────┘
//! ```
//!
//! Before a stage is dispatched the barrier is armed with the set of live
//! participants. Callbacks for that run and stage remove their node from the
//! pending set; the stage ends when the set is empty or the stage timeout
//! expires. Participants that fail, time out or cannot be reached are
//! dropped from the rest of the run and their vertices are left out of the
//! result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use affinity_graph::{
    AffinityGroup, Identity, Label, Lifecycle, NodeId, RelocatingAffinityGroup,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::LpaConfig;
use crate::error::{Error, Result};
use crate::finder::{AffinityGroupFinder, FinderStats, StatsRecorder};
use crate::rpc::{LpaClient, LpaServer};
use crate::watchdog::{NodeEvent, Watchdog};

/// Stage of the run in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Preparing,
    Iterating(u32),
    Gathering,
}

#[derive(Debug)]
struct Barrier {
    run: u64,
    phase: RunPhase,
    pending: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    converged: bool,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Prepare,
    Iteration(u32),
}

impl Stage {
    fn phase(self) -> RunPhase {
        match self {
            Stage::Prepare => RunPhase::Preparing,
            Stage::Iteration(k) => RunPhase::Iterating(k),
        }
    }
}

type Participants = BTreeMap<NodeId, Arc<dyn LpaClient>>;

struct ServerInner {
    node: NodeId,
    config: LpaConfig,
    watchdog: Arc<dyn Watchdog>,
    lifecycle: Lifecycle,
    clients: RwLock<HashMap<NodeId, Arc<dyn LpaClient>>>,
    run_number: AtomicU64,
    barrier: Mutex<Barrier>,
    barrier_notify: Notify,
    running: tokio::sync::Mutex<()>,
    stats: StatsRecorder,
}

/// Coordinates label propagation runs across registered participants.
#[derive(Clone)]
pub struct LabelPropagationServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for LabelPropagationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelPropagationServer")
            .field("node", &self.inner.node)
            .field("participants", &self.participants())
            .field("phase", &self.run_phase())
            .finish()
    }
}

impl LabelPropagationServer {
    /// Create the coordinator hosted on `node`. Must be called inside a Tokio
    /// runtime: it subscribes to watchdog events in a background task.
    pub fn new(node: NodeId, config: LpaConfig, watchdog: Arc<dyn Watchdog>) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(ServerInner {
            node,
            config,
            watchdog,
            lifecycle: Lifecycle::new(),
            clients: RwLock::new(HashMap::new()),
            run_number: AtomicU64::new(0),
            barrier: Mutex::new(Barrier {
                run: 0,
                phase: RunPhase::Idle,
                pending: HashSet::new(),
                failed: HashSet::new(),
                converged: true,
            }),
            barrier_notify: Notify::new(),
            running: tokio::sync::Mutex::new(()),
            stats: StatsRecorder::new(),
        });
        spawn_failure_listener(Arc::downgrade(&inner), inner.watchdog.subscribe());
        info!(%node, port = inner.config.server_port, "label propagation coordinator started");
        Ok(Self { inner })
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// Registered participants in node order.
    pub fn participants(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.clients.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn run_phase(&self) -> RunPhase {
        self.inner.barrier.lock().phase
    }

    /// Number of the most recently started run, 0 before the first.
    pub fn run_number(&self) -> u64 {
        self.inner.run_number.load(Ordering::SeqCst)
    }
}

fn spawn_failure_listener(
    inner: Weak<ServerInner>,
    mut events: tokio::sync::broadcast::Receiver<NodeEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::Failed(node)) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.purge(node);
                }
                Ok(NodeEvent::Started(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "coordinator missed watchdog events");
                }
                Err(RecvError::Closed) => break,
            }
            if inner.strong_count() == 0 {
                break;
            }
        }
    });
}

impl ServerInner {
    /// Unregister `node` and release any barrier waiting on it.
    fn purge(&self, node: NodeId) {
        if self.clients.write().remove(&node).is_some() {
            info!(%node, "participant unregistered");
        }
        self.exclude(node);
    }

    /// Drop `node` from the current barrier as failed.
    fn exclude(&self, node: NodeId) {
        let released = {
            let mut barrier = self.barrier.lock();
            let released = barrier.pending.remove(&node);
            if barrier.phase != RunPhase::Idle {
                barrier.failed.insert(node);
            }
            released
        };
        if released {
            self.barrier_notify.notify_waiters();
        }
    }

    fn snapshot_clients(&self) -> Participants {
        self.clients
            .read()
            .iter()
            .map(|(node, client)| (*node, Arc::clone(client)))
            .collect()
    }

    fn arm(&self, run: u64, phase: RunPhase, live: &Participants) {
        let mut barrier = self.barrier.lock();
        barrier.run = run;
        barrier.phase = phase;
        barrier.pending = live.keys().copied().collect();
        barrier.failed.clear();
        barrier.converged = true;
    }

    fn disarm(&self) {
        let mut barrier = self.barrier.lock();
        barrier.phase = RunPhase::Idle;
        barrier.pending.clear();
        barrier.failed.clear();
    }

    /// Count a participant callback against the armed barrier.
    fn arrive(&self, node: NodeId, run: u64, phase: RunPhase, converged: bool, failed: bool) {
        {
            let mut barrier = self.barrier.lock();
            if barrier.run != run || barrier.phase != phase {
                debug!(%node, run, ?phase, current = ?barrier.phase, "stale callback ignored");
                return;
            }
            if !barrier.pending.remove(&node) {
                debug!(%node, run, ?phase, "duplicate callback ignored");
                return;
            }
            if failed {
                barrier.failed.insert(node);
            } else {
                barrier.converged &= converged;
            }
        }
        self.barrier_notify.notify_waiters();
    }

    async fn dispatch(&self, node: NodeId, client: &Arc<dyn LpaClient>, run: u64, stage: Stage) -> Result<()> {
        self.config
            .retry
            .run(node, &*self.watchdog, || match stage {
                Stage::Prepare => client.prepare_algorithm(run),
                Stage::Iteration(k) => client.start_iteration(k),
            })
            .await
    }

    /// Dispatch `stage` to every live participant and wait for the barrier.
    /// Returns whether every participant that finished reported converged.
    async fn stage(&self, run: u64, stage: Stage, live: &mut Participants) -> Result<bool> {
        let phase = stage.phase();
        self.arm(run, phase, live);

        let dispatched = join_all(live.iter().map(|(node, client)| async move {
            (*node, self.dispatch(*node, client, run, stage).await)
        }))
        .await;
        for (node, result) in dispatched {
            if let Err(e) = result {
                warn!(%node, run, ?phase, error = %e, "dispatch failed, excluding participant");
                live.remove(&node);
                if matches!(e, Error::Communication { .. } | Error::Timeout(_)) {
                    self.purge(node);
                } else {
                    self.exclude(node);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.stage_timeout;
        loop {
            let notified = self.barrier_notify.notified();
            self.lifecycle.ensure_running()?;
            if self.barrier.lock().pending.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let late: Vec<NodeId> = self.barrier.lock().pending.iter().copied().collect();
                warn!(run, ?phase, late = ?late, "stage timed out");
                for node in late {
                    self.watchdog.report_failure(node);
                    self.purge(node);
                }
            }
        }

        let (failed, converged) = {
            let barrier = self.barrier.lock();
            (barrier.failed.clone(), barrier.converged)
        };
        for node in failed {
            if live.remove(&node).is_some() {
                debug!(%node, run, ?phase, "participant reported failure");
            }
        }
        Ok(converged)
    }

    async fn gather(&self, run: u64, live: &Participants) -> Result<Vec<RelocatingAffinityGroup>> {
        self.barrier.lock().phase = RunPhase::Gathering;
        let results = join_all(live.iter().map(|(node, client)| async move {
            let groups = self
                .config
                .retry
                .run(*node, &*self.watchdog, || client.affinity_groups(run, true))
                .await;
            (*node, groups)
        }))
        .await;

        let mut reports: Vec<(NodeId, Vec<AffinityGroup>)> = Vec::new();
        for (node, result) in results {
            match result {
                Ok(groups) => reports.push((node, groups)),
                Err(e) => {
                    warn!(%node, run, error = %e, "could not collect groups, excluding participant");
                    if e.is_retryable() {
                        self.purge(node);
                    }
                }
            }
        }
        merge_groups(run, reports)
    }

    async fn run(&self) -> Result<Vec<RelocatingAffinityGroup>> {
        let mut live = self.snapshot_clients();
        if live.is_empty() {
            debug!("no participants registered");
            return Ok(Vec::new());
        }

        let run = self.run_number.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        self.stats.run_started();
        info!(run, participants = live.len(), "starting label propagation run");

        let result = self.stages(run, &mut live).await;
        self.disarm();
        match result {
            Ok(Some((groups, iterations, converged))) => {
                let runtime = started.elapsed();
                self.stats.run_completed(runtime, iterations, converged, groups.len());
                info!(
                    run,
                    groups = groups.len(),
                    iterations,
                    converged,
                    runtime_ms = runtime.as_millis() as u64,
                    "label propagation run finished"
                );
                Ok(groups)
            }
            Ok(None) => {
                self.stats.run_failed();
                warn!(run, "no live participants left, returning no groups");
                Ok(Vec::new())
            }
            Err(e) => {
                self.stats.run_failed();
                Err(e)
            }
        }
    }

    async fn stages(
        &self,
        run: u64,
        live: &mut Participants,
    ) -> Result<Option<(Vec<RelocatingAffinityGroup>, u32, bool)>> {
        self.stage(run, Stage::Prepare, live).await?;
        if live.is_empty() {
            return Ok(None);
        }

        let mut iterations = 0;
        let mut converged = false;
        for k in 0..self.config.max_iterations {
            converged = self.stage(run, Stage::Iteration(k), live).await?;
            iterations = k + 1;
            if live.is_empty() {
                return Ok(None);
            }
            if converged {
                break;
            }
        }
        if !converged {
            info!(run, iterations, "iteration bound reached before convergence");
        }

        self.lifecycle.ensure_running()?;
        let groups = self.gather(run, live).await?;
        Ok(Some((groups, iterations, converged)))
    }
}

/// Merge per-node groups by label. An identity reported by several nodes is
/// placed on the first of them in node order.
fn merge_groups(
    run: u64,
    mut reports: Vec<(NodeId, Vec<AffinityGroup>)>,
) -> Result<Vec<RelocatingAffinityGroup>> {
    reports.sort_by_key(|(node, _)| *node);
    let mut seen: HashSet<Identity> = HashSet::new();
    let mut placements: BTreeMap<Label, BTreeMap<Identity, NodeId>> = BTreeMap::new();
    for (node, groups) in reports {
        for group in groups {
            for member in group.members() {
                if seen.insert(*member) {
                    placements.entry(group.id()).or_default().insert(*member, node);
                }
            }
        }
    }
    placements
        .into_iter()
        .map(|(label, placement)| Ok(RelocatingAffinityGroup::new(label, run, placement)?))
        .collect()
}

#[async_trait]
impl LpaServer for LabelPropagationServer {
    async fn register(&self, node: NodeId, client: Arc<dyn LpaClient>) -> Result<()> {
        self.inner.lifecycle.ensure_running()?;
        if self.inner.clients.write().insert(node, client).is_some() {
            info!(%node, "participant re-registered");
        } else {
            info!(%node, "participant registered");
        }
        Ok(())
    }

    async fn ready_to_begin(&self, node: NodeId, run: u64, failed: bool) -> Result<()> {
        self.inner.lifecycle.ensure_running()?;
        self.inner.arrive(node, run, RunPhase::Preparing, true, failed);
        Ok(())
    }

    async fn finished_iteration(
        &self,
        node: NodeId,
        run: u64,
        converged: bool,
        failed: bool,
        iteration: u32,
    ) -> Result<()> {
        self.inner.lifecycle.ensure_running()?;
        self.inner
            .arrive(node, run, RunPhase::Iterating(iteration), converged, failed);
        Ok(())
    }

    async fn client_proxy(&self, node: NodeId) -> Result<Option<Arc<dyn LpaClient>>> {
        self.inner.lifecycle.ensure_running()?;
        Ok(self.inner.clients.read().get(&node).cloned())
    }
}

#[async_trait]
impl AffinityGroupFinder for LabelPropagationServer {
    async fn find_affinity_groups(&self) -> Result<Vec<RelocatingAffinityGroup>> {
        self.inner.lifecycle.ensure_enabled()?;
        let _running = self.inner.running.lock().await;
        self.inner.lifecycle.ensure_enabled()?;
        self.inner.run().await
    }

    async fn remove_node(&self, node: NodeId) {
        self.inner.purge(node);
    }

    async fn enable(&self) -> Result<()> {
        if self.inner.lifecycle.enable()? {
            for (node, client) in self.inner.snapshot_clients() {
                if let Err(e) = client.enable().await {
                    warn!(%node, error = %e, "could not enable participant");
                }
            }
            info!("coordinator enabled");
        }
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        if self.inner.lifecycle.disable()? {
            for (node, client) in self.inner.snapshot_clients() {
                if let Err(e) = client.disable().await {
                    warn!(%node, error = %e, "could not disable participant");
                }
            }
            info!("coordinator disabled");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.inner.lifecycle.shutdown() {
            return;
        }
        self.inner.barrier_notify.notify_waiters();
        let clients: Vec<(NodeId, Arc<dyn LpaClient>)> = self.inner.clients.write().drain().collect();
        for (node, client) in clients {
            if let Err(e) = client.shutdown().await {
                debug!(%node, error = %e, "participant shutdown failed");
            }
        }
        info!(node = %self.inner.node, "coordinator shut down");
    }

    fn stats(&self) -> FinderStats {
        self.inner.stats.snapshot()
    }
}
