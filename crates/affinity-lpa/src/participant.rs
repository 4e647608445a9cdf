//! Per-node label propagation participant.
//!
//! ```text
//!   Idle ─prepare─► Preparing ─► WaitingForServer ─start(0)─► InIteration(0)
//!                                                   ─start(k+1)─► InIteration(k+1)
//!   InIteration(k) ─groups─► GatheringGroups ─groups(clear)─► Finished
//! ```
//!
//! The state is split across locks so peers are never blocked by a running
//! pass:
//!
//! - `progress` admits or rejects calls synchronously,
//! - `run_state` is held for the whole of a background stage, so stages of
//!   one participant never interleave,
//! - `published` holds the labels peers read through `remote_labels`, kept
//!   for the last two iteration boundaries so a peer still in iteration `k`
//!   never sees labels this node produced in `k`,
//! - `node_conflicts` records which peers share which objects with us in
//!   the newest run we heard of.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use affinity_graph::{
    AffinityGraph, AffinityGroup, GraphBuilder, Identity, Label, Lifecycle, NodeId, ObjectId,
    ObjectUseMap,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::LpaConfig;
use crate::error::{Error, Result};
use crate::propagation::{self, RemoteTally};
use crate::rpc::{LpaClient, LpaServer, RemoteLabels};
use crate::watchdog::{NodeEvent, Watchdog};

/// Where a participant is within the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantPhase {
    Idle,
    Preparing,
    WaitingForServer,
    InIteration(u32),
    GatheringGroups,
    Finished,
}

#[derive(Debug)]
struct Progress {
    run: Option<u64>,
    iteration: Option<u32>,
    phase: ParticipantPhase,
}

#[derive(Debug, Default)]
struct RunState {
    graph: Option<AffinityGraph>,
    object_uses: ObjectUseMap,
    remote_tally: RemoteTally,
    groups: Option<(u64, Vec<AffinityGroup>)>,
}

/// Labels at iteration boundaries. `current` is the input to iteration
/// `boundary`, `previous` the input to the one before it.
#[derive(Debug, Default)]
struct Published {
    boundary: u32,
    current: Arc<HashMap<Identity, Label>>,
    previous: Arc<HashMap<Identity, Label>>,
}

impl Published {
    fn reset(&mut self, labels: HashMap<Identity, Label>) {
        self.boundary = 0;
        self.current = Arc::new(labels);
        self.previous = Arc::clone(&self.current);
    }

    fn advance(&mut self, boundary: u32, labels: HashMap<Identity, Label>) {
        self.previous = std::mem::replace(&mut self.current, Arc::new(labels));
        self.boundary = boundary;
    }

    fn for_iteration(&self, iteration: u32) -> Arc<HashMap<Identity, Label>> {
        if iteration < self.boundary {
            Arc::clone(&self.previous)
        } else {
            Arc::clone(&self.current)
        }
    }
}

/// Peers sharing objects with this node, for one run.
#[derive(Debug, Default)]
struct NodeConflicts {
    run: u64,
    peers: HashMap<NodeId, HashSet<ObjectId>>,
}

impl NodeConflicts {
    /// Move to `run`, forgetting entries of earlier runs. False if `run` is
    /// older than what is already held.
    fn admit(&mut self, run: u64) -> bool {
        if run < self.run {
            return false;
        }
        if run > self.run {
            self.run = run;
            self.peers.clear();
        }
        true
    }
}

struct Inner {
    node: NodeId,
    coordinator: NodeId,
    builder: Arc<dyn GraphBuilder>,
    server: Arc<dyn LpaServer>,
    watchdog: Arc<dyn Watchdog>,
    config: LpaConfig,
    lifecycle: Lifecycle,
    progress: Mutex<Progress>,
    run_state: tokio::sync::Mutex<RunState>,
    published: RwLock<Published>,
    node_conflicts: Mutex<NodeConflicts>,
    proxies: Mutex<HashMap<NodeId, Arc<dyn LpaClient>>>,
}

/// One node's share of the distributed algorithm.
#[derive(Clone)]
pub struct LabelPropagation {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LabelPropagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelPropagation")
            .field("node", &self.inner.node)
            .field("phase", &self.phase())
            .finish()
    }
}

impl LabelPropagation {
    /// Create the participant for `node`. Must be called inside a Tokio
    /// runtime: it subscribes to watchdog events in a background task.
    pub fn new(
        node: NodeId,
        coordinator: NodeId,
        builder: Arc<dyn GraphBuilder>,
        server: Arc<dyn LpaServer>,
        watchdog: Arc<dyn Watchdog>,
        config: LpaConfig,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            node,
            coordinator,
            builder,
            server,
            watchdog,
            config,
            lifecycle: Lifecycle::new(),
            progress: Mutex::new(Progress {
                run: None,
                iteration: None,
                phase: ParticipantPhase::Idle,
            }),
            run_state: tokio::sync::Mutex::new(RunState::default()),
            published: RwLock::new(Published::default()),
            node_conflicts: Mutex::new(NodeConflicts::default()),
            proxies: Mutex::new(HashMap::new()),
        });
        spawn_failure_listener(Arc::downgrade(&inner), inner.watchdog.subscribe());
        Ok(Self { inner })
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub fn phase(&self) -> ParticipantPhase {
        self.inner.progress.lock().phase
    }

    /// Register with the coordinator.
    pub async fn register(&self) -> Result<()> {
        let client: Arc<dyn LpaClient> = Arc::new(self.clone());
        let inner = &self.inner;
        inner
            .config
            .retry
            .run(inner.coordinator, &*inner.watchdog, || {
                inner.server.register(inner.node, Arc::clone(&client))
            })
            .await
    }

    /// Peers sharing objects with this node in the current run.
    pub fn node_conflicts(&self) -> HashMap<NodeId, HashSet<ObjectId>> {
        self.inner.node_conflicts.lock().peers.clone()
    }

    /// Remote weights folded in during the latest iteration.
    pub async fn remote_tally(&self) -> RemoteTally {
        self.inner.run_state.lock().await.remote_tally.clone()
    }

    /// Forget everything about `node`.
    pub fn remove_node(&self, node: NodeId) {
        self.inner.remove_node(node);
    }
}

fn spawn_failure_listener(inner: Weak<Inner>, mut events: tokio::sync::broadcast::Receiver<NodeEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::Failed(node)) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.remove_node(node);
                }
                Ok(NodeEvent::Started(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "participant missed watchdog events");
                }
                Err(RecvError::Closed) => break,
            }
            if inner.strong_count() == 0 {
                break;
            }
        }
    });
}

impl Inner {
    fn remove_node(&self, node: NodeId) {
        self.proxies.lock().remove(&node);
        self.node_conflicts.lock().peers.remove(&node);
        self.builder.remove_node(node);
        debug!(node = %self.node, removed = %node, "purged node");
    }


    async fn proxy(&self, node: NodeId) -> Result<Option<Arc<dyn LpaClient>>> {
        let cached = self.proxies.lock().get(&node).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let proxy = self
            .config
            .retry
            .run(self.coordinator, &*self.watchdog, || self.server.client_proxy(node))
            .await?;
        if let Some(proxy) = &proxy {
            self.proxies.lock().insert(node, Arc::clone(proxy));
        }
        Ok(proxy)
    }

    async fn prepare(self: Arc<Self>, run: u64) {
        let mut state = self.run_state.lock().await;
        let failed = match self.snapshot_and_exchange(run, &mut state).await {
            Ok(()) => false,
            Err(e) => {
                warn!(node = %self.node, run, error = %e, "prepare failed");
                true
            }
        };
        drop(state);
        {
            let mut progress = self.progress.lock();
            if progress.run == Some(run) && progress.phase == ParticipantPhase::Preparing {
                progress.phase = ParticipantPhase::WaitingForServer;
            }
        }
        let reported = self
            .config
            .retry
            .run(self.coordinator, &*self.watchdog, || {
                self.server.ready_to_begin(self.node, run, failed)
            })
            .await;
        if let Err(e) = reported {
            warn!(node = %self.node, run, error = %e, "could not report readiness");
        }
    }

    async fn snapshot_and_exchange(&self, run: u64, state: &mut RunState) -> Result<()> {
        let mut graph = self.builder.affinity_graph()?;
        graph.reset_labels();
        self.published.write().reset(graph.labels());
        state.object_uses = self.builder.object_use_map();
        state.graph = Some(graph);
        state.remote_tally.clear();
        state.groups = None;

        let mut outgoing: Vec<(NodeId, Vec<ObjectId>)> = Vec::new();
        {
            let mut node_conflicts = self.node_conflicts.lock();
            if !node_conflicts.admit(run) {
                return Err(Error::Protocol(format!(
                    "prepare for run {run} after conflicts of run {}",
                    node_conflicts.run
                )));
            }
            for (node, objects) in self.builder.conflict_map() {
                if node == self.node || objects.is_empty() {
                    continue;
                }
                node_conflicts
                    .peers
                    .entry(node)
                    .or_default()
                    .extend(objects.keys().copied());
                outgoing.push((node, objects.into_keys().collect()));
            }
        }
        debug!(node = %self.node, run, peers = outgoing.len(), "exchanging cross-node edges");

        let results: Vec<(NodeId, Result<()>)> = stream::iter(outgoing)
            .map(|(peer, objects)| async move {
                let result = self.notify_peer(peer, objects, run).await;
                (peer, result)
            })
            .buffer_unordered(self.config.num_threads)
            .collect()
            .await;
        for (peer, result) in results {
            if let Err(e) = result {
                warn!(node = %self.node, peer = %peer, error = %e, "peer unreachable, purging");
                self.remove_node(peer);
            }
        }
        Ok(())
    }

    async fn notify_peer(&self, peer: NodeId, objects: Vec<ObjectId>, run: u64) -> Result<()> {
        let proxy = self.proxy(peer).await?.ok_or(Error::UnknownNode(peer))?;
        self.config
            .retry
            .run(peer, &*self.watchdog, || {
                proxy.notify_cross_node_edges(objects.clone(), self.node, run)
            })
            .await
    }

    async fn iterate(self: Arc<Self>, run: u64, iteration: u32) {
        let mut state = self.run_state.lock().await;
        let (converged, failed) = match self.pass(run, iteration, &mut state).await {
            Ok(converged) => (converged, false),
            Err(e) => {
                warn!(node = %self.node, run, iteration, error = %e, "iteration failed");
                (false, true)
            }
        };
        drop(state);
        let reported = self
            .config
            .retry
            .run(self.coordinator, &*self.watchdog, || {
                self.server
                    .finished_iteration(self.node, run, converged, failed, iteration)
            })
            .await;
        if let Err(e) = reported {
            warn!(node = %self.node, run, iteration, error = %e, "could not report iteration");
        }
    }

    async fn pass(&self, run: u64, iteration: u32, state: &mut RunState) -> Result<bool> {
        let RunState {
            graph,
            object_uses,
            remote_tally,
            ..
        } = state;
        let graph = graph.as_mut().ok_or(Error::InvalidState {
            expected: "prepared graph",
            actual: "no graph".to_string(),
        })?;

        let peers: Vec<(NodeId, Vec<ObjectId>)> = self
            .node_conflicts
            .lock()
            .peers
            .iter()
            .map(|(node, objects)| (*node, objects.iter().copied().collect()))
            .collect();
        let replies: Vec<(NodeId, Result<RemoteLabels>)> = stream::iter(peers)
            .map(|(peer, objects)| async move {
                let result = self.fetch_labels(peer, objects, iteration).await;
                (peer, result)
            })
            .buffer_unordered(self.config.num_threads)
            .collect()
            .await;

        remote_tally.clear();
        for (peer, reply) in replies {
            match reply {
                Ok(labels) => fold_remote_labels(remote_tally, graph, object_uses, &labels),
                Err(e) => {
                    warn!(node = %self.node, peer = %peer, error = %e, "peer unreachable, purging");
                    self.remove_node(peer);
                }
            }
        }

        let outcome = propagation::run_pass(graph, remote_tally, run, iteration);
        self.published.write().advance(iteration + 1, graph.labels());
        debug!(
            node = %self.node,
            run,
            iteration,
            changed = outcome.changed,
            applied = outcome.applied,
            converged = outcome.converged,
            "iteration finished"
        );
        Ok(outcome.converged)
    }

    async fn fetch_labels(
        &self,
        peer: NodeId,
        objects: Vec<ObjectId>,
        iteration: u32,
    ) -> Result<RemoteLabels> {
        let proxy = self.proxy(peer).await?.ok_or(Error::UnknownNode(peer))?;
        self.config
            .retry
            .run(peer, &*self.watchdog, || {
                proxy.remote_labels(objects.clone(), iteration)
            })
            .await
    }
}

/// Fold labels reported by a peer into per-identity weights.
///
/// A local identity that used an object `c` times gains `min(c, r)` for every
/// remote identity that used it `r` times.
fn fold_remote_labels(
    tally: &mut RemoteTally,
    graph: &AffinityGraph,
    object_uses: &ObjectUseMap,
    labels: &RemoteLabels,
) {
    for (object, by_label) in labels {
        let Some(users) = object_uses.get(object) else {
            continue;
        };
        for (identity, count) in users {
            if !graph.contains_vertex(identity) {
                continue;
            }
            let entry = tally.entry(*identity).or_default();
            for (label, remote_counts) in by_label {
                let weight: u64 = remote_counts.iter().map(|r| (*r).min(*count)).sum();
                if weight > 0 {
                    *entry.entry(*label).or_insert(0) += weight;
                }
            }
        }
    }
}

#[async_trait]
impl LpaClient for LabelPropagation {
    async fn prepare_algorithm(&self, run: u64) -> Result<()> {
        self.inner.lifecycle.ensure_enabled()?;
        {
            let mut progress = self.inner.progress.lock();
            match progress.run {
                Some(current) if current == run => {
                    debug!(node = %self.inner.node, run, "duplicate prepare ignored");
                    return Ok(());
                }
                Some(current) if current > run => {
                    return Err(Error::Protocol(format!(
                        "prepare for run {run} after run {current}"
                    )));
                }
                _ => {}
            }
            progress.run = Some(run);
            progress.iteration = None;
            progress.phase = ParticipantPhase::Preparing;
        }
        info!(node = %self.inner.node, run, "preparing run");
        tokio::spawn(Arc::clone(&self.inner).prepare(run));
        Ok(())
    }

    async fn start_iteration(&self, iteration: u32) -> Result<()> {
        self.inner.lifecycle.ensure_enabled()?;
        let run = {
            let mut progress = self.inner.progress.lock();
            let Some(run) = progress.run else {
                return Err(Error::Protocol(format!("iteration {iteration} without a prepared run")));
            };
            if progress.iteration == Some(iteration) {
                debug!(node = %self.inner.node, run, iteration, "duplicate iteration ignored");
                return Ok(());
            }
            if matches!(
                progress.phase,
                ParticipantPhase::GatheringGroups | ParticipantPhase::Finished
            ) {
                return Err(Error::Protocol(format!(
                    "iteration {iteration} after run {run} finished"
                )));
            }
            let expected = progress.iteration.map_or(0, |last| last + 1);
            if iteration != expected {
                return Err(Error::Protocol(format!(
                    "iteration {iteration} out of order, expected {expected}"
                )));
            }
            progress.iteration = Some(iteration);
            progress.phase = ParticipantPhase::InIteration(iteration);
            run
        };
        tokio::spawn(Arc::clone(&self.inner).iterate(run, iteration));
        Ok(())
    }

    async fn affinity_groups(&self, run: u64, clear: bool) -> Result<Vec<AffinityGroup>> {
        self.inner.lifecycle.ensure_running()?;
        {
            let mut progress = self.inner.progress.lock();
            if progress.run != Some(run) {
                return Err(Error::Protocol(format!(
                    "groups requested for run {run}, current run is {:?}",
                    progress.run
                )));
            }
            if progress.phase != ParticipantPhase::Finished {
                progress.phase = ParticipantPhase::GatheringGroups;
            }
        }

        let mut state = self.inner.run_state.lock().await;
        if let Some((cached_run, groups)) = &state.groups {
            if *cached_run == run {
                return Ok(groups.clone());
            }
        }
        let graph = state.graph.as_ref().ok_or(Error::InvalidState {
            expected: "prepared graph",
            actual: "no graph".to_string(),
        })?;
        let groups = propagation::gather_groups(graph, run)?;
        if clear {
            state.groups = Some((run, groups.clone()));
            state.graph = None;
            state.object_uses.clear();
            state.remote_tally.clear();
            drop(state);
            self.inner.node_conflicts.lock().peers.clear();
            self.inner.progress.lock().phase = ParticipantPhase::Finished;
            debug!(node = %self.inner.node, run, groups = groups.len(), "run state cleared");
        }
        Ok(groups)
    }

    async fn remote_labels(&self, objects: Vec<ObjectId>, iteration: u32) -> Result<RemoteLabels> {
        self.inner.lifecycle.ensure_running()?;
        let published = self.inner.published.read().for_iteration(iteration);
        let uses = self.inner.builder.object_uses(&objects);
        let mut labels = RemoteLabels::new();
        for (object, users) in uses {
            let mut by_label: HashMap<Label, Vec<u64>> = HashMap::new();
            for (identity, count) in users {
                if let Some(label) = published.get(&identity) {
                    by_label.entry(*label).or_default().push(count);
                }
            }
            if !by_label.is_empty() {
                labels.insert(object, by_label);
            }
        }
        Ok(labels)
    }

    async fn notify_cross_node_edges(
        &self,
        objects: Vec<ObjectId>,
        from: NodeId,
        run: u64,
    ) -> Result<()> {
        self.inner.lifecycle.ensure_running()?;
        if from == self.inner.node || objects.is_empty() {
            return Ok(());
        }
        let mut node_conflicts = self.inner.node_conflicts.lock();
        if !node_conflicts.admit(run) {
            debug!(
                node = %self.inner.node,
                %from,
                run,
                current = node_conflicts.run,
                "stale cross-node edges ignored"
            );
            return Ok(());
        }
        node_conflicts.peers.entry(from).or_default().extend(objects);
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        if self.inner.lifecycle.enable()? {
            info!(node = %self.inner.node, "participant enabled");
        }
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        if self.inner.lifecycle.disable()? {
            info!(node = %self.inner.node, "participant disabled");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.inner.lifecycle.shutdown() {
            self.inner.proxies.lock().clear();
            self.inner.node_conflicts.lock().peers.clear();
            self.inner.progress.lock().phase = ParticipantPhase::Idle;
            info!(node = %self.inner.node, "participant shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use affinity_graph::{AccessDetail, WeightedGraphBuilder};
    use tokio::sync::Notify;

    use super::*;
    use crate::retry::IoRetry;
    use crate::watchdog::LocalWatchdog;

    const COORDINATOR: NodeId = NodeId(100);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Callback {
        Ready { node: NodeId, run: u64, failed: bool },
        Finished { node: NodeId, run: u64, iteration: u32, failed: bool },
    }

    /// Coordinator stand-in that records callbacks.
    #[derive(Default)]
    struct RecordingServer {
        clients: RwLock<HashMap<NodeId, Arc<dyn LpaClient>>>,
        callbacks: Mutex<Vec<Callback>>,
        notify: Notify,
    }

    impl RecordingServer {
        fn callbacks(&self) -> Vec<Callback> {
            self.callbacks.lock().clone()
        }

        async fn wait_for(&self, count: usize) {
            let waited = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let notified = self.notify.notified();
                    if self.callbacks.lock().len() >= count {
                        return;
                    }
                    notified.await;
                }
            })
            .await;
            assert!(waited.is_ok(), "only saw {:?}", self.callbacks());
        }

        fn push(&self, callback: Callback) {
            self.callbacks.lock().push(callback);
            self.notify.notify_waiters();
        }
    }

    #[async_trait]
    impl LpaServer for RecordingServer {
        async fn register(&self, node: NodeId, client: Arc<dyn LpaClient>) -> Result<()> {
            self.clients.write().insert(node, client);
            Ok(())
        }

        async fn ready_to_begin(&self, node: NodeId, run: u64, failed: bool) -> Result<()> {
            self.push(Callback::Ready { node, run, failed });
            Ok(())
        }

        async fn finished_iteration(
            &self,
            node: NodeId,
            run: u64,
            _converged: bool,
            failed: bool,
            iteration: u32,
        ) -> Result<()> {
            self.push(Callback::Finished {
                node,
                run,
                iteration,
                failed,
            });
            Ok(())
        }

        async fn client_proxy(&self, node: NodeId) -> Result<Option<Arc<dyn LpaClient>>> {
            Ok(self.clients.read().get(&node).cloned())
        }
    }

    fn id(n: u64) -> Identity {
        Identity::new(n)
    }

    fn config() -> LpaConfig {
        LpaConfig::default().with_retry(IoRetry::new(2, Duration::from_millis(1)))
    }

    fn report(builder: &dyn GraphBuilder, owner: u64, accesses: &[(u64, u32)]) {
        let mut detail = AccessDetail::new();
        for (object, count) in accesses {
            detail.access_times(ObjectId(*object), *count).unwrap();
        }
        builder.update_graph(id(owner), &detail).unwrap();
    }

    /// Three nodes sharing a partial toy graph:
    ///
    /// - node 1: id1 uses obj1 twice, id2 uses obj1 twice and obj2 once, and
    ///   saw a conflict with node 3 on obj2
    /// - node 2: id3 uses obj1 once and saw a conflict with node 1 on obj1
    /// - node 3: id4 uses obj3 and obj2, id5 uses obj3
    async fn cluster() -> (Arc<RecordingServer>, Vec<LabelPropagation>) {
        let server = Arc::new(RecordingServer::default());
        let watchdog: Arc<dyn Watchdog> = Arc::new(LocalWatchdog::new());

        let b1 = Arc::new(WeightedGraphBuilder::new(1).unwrap());
        report(&*b1, 1, &[(1, 2)]);
        report(&*b1, 2, &[(1, 2), (2, 1)]);
        b1.note_conflict_detected(ObjectId(2), NodeId(3), false).unwrap();

        let b2 = Arc::new(WeightedGraphBuilder::new(1).unwrap());
        report(&*b2, 3, &[(1, 1)]);
        b2.note_conflict_detected(ObjectId(1), NodeId(1), false).unwrap();

        let b3 = Arc::new(WeightedGraphBuilder::new(1).unwrap());
        report(&*b3, 4, &[(3, 1)]);
        report(&*b3, 5, &[(3, 1)]);
        report(&*b3, 4, &[(2, 1)]);

        let builders: [Arc<dyn GraphBuilder>; 3] = [b1, b2, b3];
        let mut participants = Vec::new();
        for (n, builder) in builders.into_iter().enumerate() {
            let participant = LabelPropagation::new(
                NodeId(n as u64 + 1),
                COORDINATOR,
                builder,
                Arc::clone(&server) as Arc<dyn LpaServer>,
                Arc::clone(&watchdog),
                config(),
            )
            .unwrap();
            participant.register().await.unwrap();
            participants.push(participant);
        }
        (server, participants)
    }

    async fn prepare_all(server: &RecordingServer, participants: &[LabelPropagation], run: u64) {
        for participant in participants {
            participant.prepare_algorithm(run).await.unwrap();
        }
        server.wait_for(participants.len()).await;
    }

    fn conflicts(entries: &[(u64, &[u64])]) -> HashMap<NodeId, HashSet<ObjectId>> {
        entries
            .iter()
            .map(|(node, objects)| (NodeId(*node), objects.iter().copied().map(ObjectId).collect()))
            .collect()
    }

    fn tally(entries: &[(u64, &[(u64, u64)])]) -> RemoteTally {
        entries
            .iter()
            .map(|(identity, labels)| (id(*identity), labels.iter().copied().collect()))
            .collect()
    }

    #[tokio::test]
    async fn prepare_exchanges_cross_node_edges() {
        let (server, lps) = cluster().await;
        prepare_all(&server, &lps, 1).await;

        assert_eq!(lps[0].node_conflicts(), conflicts(&[(2, &[1]), (3, &[2])]));
        assert_eq!(lps[1].node_conflicts(), conflicts(&[(1, &[1])]));
        assert_eq!(lps[2].node_conflicts(), conflicts(&[(1, &[2])]));
        assert!(server
            .callbacks()
            .iter()
            .all(|c| matches!(c, Callback::Ready { run: 1, failed: false, .. })));
        for lp in &lps {
            assert_eq!(lp.phase(), ParticipantPhase::WaitingForServer);
        }
    }

    #[tokio::test]
    async fn remote_labels_report_counts_per_label() {
        let (server, lps) = cluster().await;
        prepare_all(&server, &lps, 1).await;

        let labels = lps[0]
            .remote_labels(vec![ObjectId(1), ObjectId(2), ObjectId(9)], 0)
            .await
            .unwrap();
        let obj1: HashMap<Label, Vec<u64>> = [(1, vec![2]), (2, vec![2])].into_iter().collect();
        let obj2: HashMap<Label, Vec<u64>> = [(2, vec![1])].into_iter().collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[&ObjectId(1)], obj1);
        assert_eq!(labels[&ObjectId(2)], obj2);
    }

    #[tokio::test]
    async fn iteration_folds_remote_labels_from_both_peers() {
        let (server, lps) = cluster().await;
        prepare_all(&server, &lps, 1).await;

        lps[0].start_iteration(0).await.unwrap();
        server.wait_for(4).await;
        assert_eq!(
            lps[0].remote_tally().await,
            tally(&[(1, &[(3, 1)]), (2, &[(3, 1), (4, 1)])])
        );
    }

    #[tokio::test]
    async fn peers_fold_labels_of_node_one() {
        let (server, lps) = cluster().await;
        prepare_all(&server, &lps, 1).await;

        lps[1].start_iteration(0).await.unwrap();
        lps[2].start_iteration(0).await.unwrap();
        server.wait_for(5).await;
        assert_eq!(lps[1].remote_tally().await, tally(&[(3, &[(1, 1), (2, 1)])]));
        assert_eq!(lps[2].remote_tally().await, tally(&[(4, &[(2, 1)])]));
    }

    #[tokio::test]
    async fn finished_peer_still_serves_labels_of_the_running_iteration() {
        let (server, lps) = cluster().await;
        prepare_all(&server, &lps, 1).await;
        let objects = vec![ObjectId(2), ObjectId(3)];
        let initial = lps[2].remote_labels(objects.clone(), 0).await.unwrap();

        lps[2].start_iteration(0).await.unwrap();
        server.wait_for(4).await;
        assert_eq!(lps[2].remote_labels(objects.clone(), 0).await.unwrap(), initial);
        let next = lps[2].remote_labels(objects, 1).await.unwrap();
        assert_eq!(next.keys().collect::<HashSet<_>>(), initial.keys().collect::<HashSet<_>>());

        // node 1 starts iteration 0 late and still folds node 3's initial labels
        lps[0].start_iteration(0).await.unwrap();
        server.wait_for(5).await;
        assert_eq!(
            lps[0].remote_tally().await,
            tally(&[(1, &[(3, 1)]), (2, &[(3, 1), (4, 1)])])
        );
    }

    #[tokio::test]
    async fn conflicts_of_an_abandoned_run_do_not_leak() {
        let (server, lps) = cluster().await;
        let lp = &lps[2];
        lp.notify_cross_node_edges(vec![ObjectId(9)], NodeId(1), 1).await.unwrap();
        lp.prepare_algorithm(1).await.unwrap();
        server.wait_for(1).await;
        assert_eq!(lp.node_conflicts(), conflicts(&[(1, &[9])]));

        // run 1 is never gathered here; run 2 notifications arrive before prepare
        lp.notify_cross_node_edges(vec![ObjectId(2)], NodeId(1), 2).await.unwrap();
        lp.notify_cross_node_edges(vec![ObjectId(8)], NodeId(2), 1).await.unwrap();
        assert_eq!(lp.node_conflicts(), conflicts(&[(1, &[2])]));

        lp.prepare_algorithm(2).await.unwrap();
        server.wait_for(2).await;
        assert_eq!(lp.node_conflicts(), conflicts(&[(1, &[2])]));
        assert!(server
            .callbacks()
            .iter()
            .all(|c| matches!(c, Callback::Ready { failed: false, .. })));
    }

    #[tokio::test]
    async fn duplicate_prepare_reports_ready_once() {
        let (server, lps) = cluster().await;
        lps[2].prepare_algorithm(1).await.unwrap();
        lps[2].prepare_algorithm(1).await.unwrap();
        server.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.callbacks().len(), 1);
        assert!(lps[2].prepare_algorithm(0).await.is_err(), "older run must be rejected");
    }

    #[tokio::test]
    async fn duplicate_iteration_reports_once_and_order_is_enforced() {
        let (server, lps) = cluster().await;
        let lp = &lps[2];
        assert!(matches!(lp.start_iteration(0).await, Err(Error::Protocol(_))));

        lp.prepare_algorithm(1).await.unwrap();
        server.wait_for(1).await;
        assert!(matches!(lp.start_iteration(1).await, Err(Error::Protocol(_))));
        lp.start_iteration(0).await.unwrap();
        lp.start_iteration(0).await.unwrap();
        server.wait_for(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let finished: Vec<_> = server
            .callbacks()
            .into_iter()
            .filter(|c| matches!(c, Callback::Finished { .. }))
            .collect();
        assert_eq!(
            finished,
            vec![Callback::Finished {
                node: NodeId(3),
                run: 1,
                iteration: 0,
                failed: false
            }]
        );
        assert!(matches!(lp.start_iteration(2).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn groups_are_cached_after_clear() {
        let (server, lps) = cluster().await;
        let lp = &lps[2];
        lp.prepare_algorithm(4).await.unwrap();
        server.wait_for(1).await;

        assert!(matches!(lp.affinity_groups(3, false).await, Err(Error::Protocol(_))));
        let first = lp.affinity_groups(4, false).await.unwrap();
        let again = lp.affinity_groups(4, false).await.unwrap();
        assert_eq!(first, again);
        // node 3 has id4 and id5 on a shared object but no iteration ran yet
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|g| g.generation() == 4));

        let cleared = lp.affinity_groups(4, true).await.unwrap();
        assert_eq!(cleared, first);
        assert_eq!(lp.phase(), ParticipantPhase::Finished);
        assert!(lp.node_conflicts().is_empty());
        assert_eq!(lp.affinity_groups(4, true).await.unwrap(), first);
    }

    #[tokio::test]
    async fn remove_node_purges_peer_state() {
        let (server, lps) = cluster().await;
        prepare_all(&server, &lps, 1).await;
        lps[0].remove_node(NodeId(3));
        assert_eq!(lps[0].node_conflicts(), conflicts(&[(2, &[1])]));
    }

    #[tokio::test]
    async fn watchdog_failure_purges_peer() {
        let server = Arc::new(RecordingServer::default());
        let watchdog = Arc::new(LocalWatchdog::new());
        let builder = Arc::new(WeightedGraphBuilder::new(1).unwrap());
        builder.note_conflict_detected(ObjectId(1), NodeId(9), false).unwrap();
        let lp = LabelPropagation::new(
            NodeId(1),
            COORDINATOR,
            builder.clone(),
            server,
            watchdog.clone(),
            config(),
        )
        .unwrap();
        lp.notify_cross_node_edges(vec![ObjectId(1)], NodeId(9), 1).await.unwrap();

        watchdog.report_failure(NodeId(9));
        let purged = tokio::time::timeout(Duration::from_secs(5), async {
            while !lp.node_conflicts().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(purged.is_ok());
        assert!(builder.conflict_map().is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let (_server, lps) = cluster().await;
        let lp = &lps[0];
        lp.disable().await.unwrap();
        assert!(lp.prepare_algorithm(1).await.is_err());
        lp.enable().await.unwrap();
        lp.shutdown().await.unwrap();
        lp.shutdown().await.unwrap();
        assert!(matches!(lp.prepare_algorithm(1).await, Err(Error::Shutdown)));
        assert!(matches!(lp.enable().await, Err(Error::Shutdown)));
    }
}
