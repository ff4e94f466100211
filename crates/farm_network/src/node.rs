//! PeerNode: composition root and scheduler for one farm site.
//!
//! [`PeerNode`] owns the message store, the peer registry, the router and a
//! transport, and runs four tasks against them:
//! - inbound handler (decode, dedup, deliver, relay)
//! - heartbeat loop (probe every neighbor, update liveness)
//! - retry loop (re-attempt `QUEUED` records with exponential backoff)
//! - sweep loop (age out and drop terminal records, prune dead neighbors)
//!
//! Every cycle is also exposed as a method so simulations can drive the
//! node step by step.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{AlertDirection, AlertRecord, PestDetection, RecentAlerts};
use crate::bridge::{AlertBridge, UndeliverableNotice};
use crate::config::NodeConfig;
use crate::error::NetworkError;
use crate::identity::{NodeIdentity, PeerId};
use crate::message::{Envelope, Heartbeat, MessageId, MessageKind, Payload, Query, QueryResponse};
use crate::peer::{PeerEntry, PeerRegistry, PeerStatus};
use crate::router::{RouteDecision, Router};
use crate::store::{MessageStore, RecordState, StoreRecord, StoreStats};
use crate::transport::Transport;

/// Snapshot of a node for operator views.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub name: String,
    pub listen_addr: Option<String>,
    pub advertised_addr: Option<String>,
    pub running: bool,
    pub peers_alive: usize,
    pub peers_suspect: usize,
    pub peers_dead: usize,
    pub store: StoreStats,
}

/// Outcome of one sweep cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub removed: usize,
    pub pruned_peers: usize,
}

/// State shared by the node handle and its tasks.
struct NodeCore {
    identity: NodeIdentity,
    config: NodeConfig,
    router: Router,
    store: MessageStore,
    registry: RwLock<PeerRegistry>,
    registry_path: Option<PathBuf>,
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn AlertBridge>,
    next_seq: AtomicU64,
    local_addr: parking_lot::RwLock<Option<String>>,
    /// What heartbeats tell neighbors to dial.
    advertised_addr: parking_lot::RwLock<Option<String>>,
    recent: parking_lot::Mutex<RecentAlerts>,
    /// Keeps retry cycles from overlapping.
    retry_gate: AsyncMutex<()>,
}

/// A running (or ready to run) farm peer.
pub struct PeerNode {
    core: Arc<NodeCore>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNode {
    /// Build a node around an already opened store.
    pub fn new(
        identity: NodeIdentity,
        config: NodeConfig,
        store: MessageStore,
        transport: Arc<dyn Transport>,
        bridge: Arc<dyn AlertBridge>,
    ) -> Self {
        Self::assemble(identity, config, store, PeerRegistry::new(), None, transport, bridge)
    }

    /// Open a node backed by files in `config.data_dir`: the message store
    /// (fatal if it cannot be opened) and the saved peer registry.
    pub fn open(
        identity: NodeIdentity,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        bridge: Arc<dyn AlertBridge>,
    ) -> Result<Self, NetworkError> {
        config.validate()?;
        let peer_id = identity.peer_id.as_str().to_string();
        let store = MessageStore::open(&config.store_path(&peer_id))?;
        let registry_path = config.registry_path(&peer_id);
        let registry = PeerRegistry::load_or_default(&registry_path);
        Ok(Self::assemble(
            identity,
            config,
            store,
            registry,
            Some(registry_path),
            transport,
            bridge,
        ))
    }

    fn assemble(
        identity: NodeIdentity,
        config: NodeConfig,
        store: MessageStore,
        registry: PeerRegistry,
        registry_path: Option<PathBuf>,
        transport: Arc<dyn Transport>,
        bridge: Arc<dyn AlertBridge>,
    ) -> Self {
        // Never reuse a sequence number from a previous run.
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let stored = store
            .max_sequence(&identity.peer_id)
            .map_or(0, |seq| seq.saturating_add(1));

        Self {
            core: Arc::new(NodeCore {
                router: Router::new(identity.peer_id.clone()),
                identity,
                config,
                store,
                registry: RwLock::new(registry),
                registry_path,
                transport,
                bridge,
                next_seq: AtomicU64::new(now_ms.max(stored)),
                local_addr: parking_lot::RwLock::new(None),
                advertised_addr: parking_lot::RwLock::new(None),
                recent: parking_lot::Mutex::new(RecentAlerts::new()),
                retry_gate: AsyncMutex::new(()),
            }),
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Return the node's peer ID.
    pub fn peer_id(&self) -> &PeerId {
        &self.core.identity.peer_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.core.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    /// The durable message store.
    pub fn store(&self) -> &MessageStore {
        &self.core.store
    }

    /// Address the transport is bound to, once started.
    pub fn local_addr(&self) -> Option<String> {
        self.core.local_addr.read().clone()
    }

    /// Address announced to neighbors, once started.
    pub fn advertised_addr(&self) -> Option<String> {
        self.core.advertised_addr.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Start the node: bind the transport and spawn the inbound, heartbeat,
    /// retry and sweep tasks.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let bound = self.core.transport.bind(&self.core.config.listen_addr).await?;
        let advertised = match self.core.config.advertised_addr(&bound.local_addr) {
            Ok(addr) => addr,
            Err(e) => {
                self.core.transport.close().await;
                return Err(e);
            }
        };
        *self.core.local_addr.write() = Some(bound.local_addr.clone());
        *self.core.advertised_addr.write() = Some(advertised);

        let resumed = self.core.resume_unrouted().await;
        if resumed > 0 {
            info!("Resumed {resumed} messages left unrouted by the previous run");
        }

        let (shutdown_tx, _) = broadcast::channel(8);

        // Inbound handler.
        let core = Arc::clone(&self.core);
        let mut frames = bound.frames;
        let mut shutdown = shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(frame) => core.on_receive(&frame).await,
                        None => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("Inbound handler shutting down");
                        break;
                    }
                }
            }
        }));

        let config = &self.core.config;
        self.tasks.push(spawn_periodic(
            "heartbeat",
            Arc::clone(&self.core),
            config.heartbeat_interval,
            shutdown_tx.subscribe(),
            |core| async move { core.run_heartbeat_cycle().await },
        ));
        self.tasks.push(spawn_periodic(
            "retry",
            Arc::clone(&self.core),
            config.retry_interval,
            shutdown_tx.subscribe(),
            |core| async move {
                core.run_retry_cycle().await;
            },
        ));
        self.tasks.push(spawn_periodic(
            "sweep",
            Arc::clone(&self.core),
            config.sweep_interval,
            shutdown_tx.subscribe(),
            |core| async move {
                core.run_sweep_cycle().await;
            },
        ));

        // Introduce ourselves to the configured neighbors.
        if !config.known_peers.is_empty() {
            let core = Arc::clone(&self.core);
            self.tasks.push(tokio::spawn(async move {
                let addrs = core.config.known_peers.clone();
                let core = &core;
                join_all(addrs.iter().map(|addr| async move {
                    if let Err(e) = core.introduce(addr).await {
                        warn!("Failed to reach known peer {addr}: {e}");
                    }
                }))
                .await;
            }));
        }

        self.shutdown_tx = Some(shutdown_tx);
        info!(
            "PeerNode '{}' started (peer_id: {}, listening on {})",
            self.core.identity.name, self.core.identity.peer_id, bound.local_addr
        );
        Ok(())
    }

    /// Stop the node: let in-flight work finish, persist state and release
    /// the transport.
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {e}");
            }
        }

        if let Err(e) = self.core.store.checkpoint() {
            warn!("Store checkpoint on shutdown failed: {e}");
        }
        self.core.save_registry().await;
        self.core.transport.close().await;
        *self.core.local_addr.write() = None;
        *self.core.advertised_addr.write() = None;
        info!("PeerNode '{}' stopped", self.core.identity.name);
    }

    /// Originate a message from this node and run it through the router.
    ///
    /// The message is recorded before anything is sent, so it survives a
    /// crash and is retried while no neighbor is reachable.
    pub async fn originate(&self, payload: Payload) -> Result<MessageId, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        if payload.kind() == MessageKind::Heartbeat {
            return Err(NetworkError::InvalidRequest(
                "heartbeats are link-local and cannot be originated".to_string(),
            ));
        }
        let envelope = Envelope::new(
            self.peer_id().clone(),
            self.core.next_sequence(),
            payload,
            self.core.config.default_ttl_hops,
        );
        let id = envelope.id().clone();
        self.core.recent.lock().push(&envelope, AlertDirection::Sent);
        info!("Originating {} {id}", envelope.kind());
        self.core.process(envelope).await;
        Ok(id)
    }

    /// Raise a pest alert from a local detection.
    pub async fn send_alert(&self, detection: &PestDetection) -> Result<MessageId, NetworkError> {
        self.originate(Payload::PestAlert(detection.to_alert())).await
    }

    /// Flood a free-text question to the network.
    pub async fn query(&self, text: impl Into<String>) -> Result<MessageId, NetworkError> {
        self.originate(Payload::Query(Query { text: text.into() })).await
    }

    /// Answer a query this node received; the response travels back along
    /// the query's path when it can.
    pub async fn answer_query(
        &self,
        query_id: &MessageId,
        text: impl Into<String>,
    ) -> Result<MessageId, NetworkError> {
        let record = self
            .core
            .store
            .get(query_id)
            .ok_or_else(|| NetworkError::UnknownMessage(query_id.to_string()))?;
        let query = &record.envelope;
        if query.kind() != MessageKind::Query {
            return Err(NetworkError::InvalidRequest(format!(
                "{query_id} is a {}, not a QUERY",
                query.kind()
            )));
        }
        self.originate(Payload::QueryResponse(QueryResponse {
            query_id: query_id.clone(),
            query_origin: query.origin().clone(),
            reply_path: query.path().to_vec(),
            text: text.into(),
        }))
        .await
    }

    /// Introduce this node to whoever listens at `addr`.
    ///
    /// The neighbor registers us and heartbeats back, which registers it.
    pub async fn connect(&self, addr: &str) -> Result<(), NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        self.core.introduce(addr).await
    }

    /// Register a neighbor directly.
    pub async fn add_peer(&self, peer_id: PeerId, addr: impl Into<String>) {
        self.core.registry.write().await.upsert(peer_id, addr);
    }

    /// Snapshot of the registry, sorted by peer id.
    pub async fn peers(&self) -> Vec<PeerEntry> {
        let registry = self.core.registry.read().await;
        registry.list_all().into_iter().cloned().collect()
    }

    pub async fn peer_status(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        self.core.registry.read().await.status_of(peer_id)
    }

    /// Records still waiting for relay.
    pub fn queued(&self) -> Vec<StoreRecord> {
        self.core.store.queued()
    }

    /// The last alerts sent or received, oldest first.
    pub fn recent_alerts(&self) -> Vec<AlertRecord> {
        self.core.recent.lock().iter().cloned().collect()
    }

    pub async fn status(&self) -> NodeStatus {
        let registry = self.core.registry.read().await;
        NodeStatus {
            peer_id: self.peer_id().clone(),
            name: self.core.identity.name.clone(),
            listen_addr: self.local_addr(),
            advertised_addr: self.advertised_addr(),
            running: self.is_running(),
            peers_alive: registry.count(PeerStatus::Alive),
            peers_suspect: registry.count(PeerStatus::Suspect),
            peers_dead: registry.count(PeerStatus::Dead),
            store: self.core.store.stats(),
        }
    }

    /// Handle raw bytes from the transport.
    pub async fn on_receive(&self, bytes: &[u8]) {
        self.core.on_receive(bytes).await;
    }

    /// Probe every registry entry once.
    pub async fn run_heartbeat_cycle(&self) {
        self.core.run_heartbeat_cycle().await;
    }

    /// Re-attempt every due `QUEUED` record. Returns how many were attempted.
    pub async fn run_retry_cycle(&self) -> usize {
        self.core.run_retry_cycle().await
    }

    /// Age out delivered records, drop old terminal ones, prune dead peers.
    pub async fn run_sweep_cycle(&self) -> SweepReport {
        self.core.run_sweep_cycle().await
    }
}

impl NodeCore {
    fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn on_receive(&self, bytes: &[u8]) {
        let envelope = match Envelope::from_wire(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping inbound frame: {e}");
                return;
            }
        };
        if let Payload::Heartbeat(hb) = envelope.payload() {
            self.on_heartbeat(envelope.origin(), hb).await;
            return;
        }
        self.process(envelope).await;
    }

    async fn on_heartbeat(&self, from: &PeerId, hb: &Heartbeat) {
        if from == &self.identity.peer_id {
            return;
        }
        let is_new = self
            .registry
            .write()
            .await
            .upsert(from.clone(), hb.address.clone());
        if is_new {
            // Let the newcomer learn about us without waiting a full cycle.
            if let Err(e) = self.introduce(&hb.address).await {
                debug!("Introduction reply to {from} failed: {e}");
            }
        }
    }

    /// Dedup, deliver and relay one envelope (received or originated).
    async fn process(&self, envelope: Envelope) {
        let id = envelope.id().clone();
        if !self.store.has_seen(&id) && self.is_stale(&envelope) {
            // Older than the retention window: a swept record may have
            // covered it, so it cannot count as first sight.
            warn!(
                "Dropping stale {id} from {} created {}",
                envelope.origin(),
                envelope.created_at()
            );
            return;
        }
        let recorded = self.store.record(&envelope);
        if !recorded.inserted {
            // Everyone on this copy's path already holds the message.
            let mut holders = envelope.path().to_vec();
            holders.push(envelope.origin().clone());
            if let Some(record) = self.store.note_holders(&id, &holders) {
                self.settle(&record);
            }
            debug!("Duplicate {id} dropped");
            return;
        }
        self.dispatch(&envelope).await;
    }

    /// Apply the routing decision for a newly recorded envelope.
    async fn dispatch(&self, envelope: &Envelope) {
        let id = envelope.id();
        let alive = self.registry.read().await.alive_peers();
        match self.router.route(envelope, true, &alive) {
            RouteDecision::Duplicate => {}
            RouteDecision::Terminal { deliver_local } => {
                if deliver_local {
                    self.deliver(envelope);
                    self.store.mark_delivered(id);
                } else {
                    self.store.mark_expired(id);
                }
                debug!("{id} terminal here (ttl {})", envelope.ttl_hops());
            }
            RouteDecision::Forward {
                envelope: forwarded,
                targets,
                deliver_local,
            } => {
                if deliver_local {
                    self.deliver(envelope);
                }
                self.store.mark_queued(id);
                self.relay(&forwarded, targets, Vec::new()).await;
            }
        }
    }

    /// Route records a crash left in `NEW`, so they reach the bridge and
    /// the retry queue instead of blocking later copies as duplicates.
    async fn resume_unrouted(&self) -> usize {
        let records = self.store.with_state(RecordState::New);
        join_all(records.iter().map(|record| async move {
            let envelope = &record.envelope;
            if envelope.origin() != &self.identity.peer_id && self.is_stale(envelope) {
                self.store.mark_expired(&record.message_id);
            } else {
                self.dispatch(envelope).await;
            }
        }))
        .await;
        records.len()
    }

    fn is_stale(&self, envelope: &Envelope) -> bool {
        chrono::Duration::from_std(self.config.retention_window)
            .ok()
            .and_then(|window| envelope.created_at().checked_add_signed(window))
            .is_some_and(|limit| limit < Utc::now())
    }

    /// Hand a message to the local bridge, at most once per id.
    fn deliver(&self, envelope: &Envelope) {
        if !self.store.mark_delivered_locally(envelope.id()) {
            return;
        }
        self.recent.lock().push(envelope, AlertDirection::Received);
        self.bridge.deliver_local(envelope);
    }

    // -----------------------------------------------------------------------
    // Relay
    // -----------------------------------------------------------------------

    /// Send `forwarded` to `targets` concurrently and book the attempt.
    ///
    /// `carried` are pending targets from earlier rounds that could not be
    /// tried this time.
    async fn relay(&self, forwarded: &Envelope, targets: Vec<PeerId>, carried: Vec<PeerId>) {
        let id = forwarded.id();
        let frame = match forwarded.to_wire() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot encode {id}: {e}");
                self.store.mark_expired(id);
                return;
            }
        };

        let (reached, mut pending) = self.send_to_peers(&frame, &targets).await;
        for peer in carried {
            if !pending.contains(&peer) && !reached.contains(&peer) {
                pending.push(peer);
            }
        }
        debug!(
            "Relayed {id}: {} reached, {} pending",
            reached.len(),
            pending.len()
        );
        if let Some(record) = self.store.record_attempt(id, &reached, pending) {
            self.settle(&record);
        }
    }

    /// Move a record to a terminal state once its relay work is done or its
    /// attempts are used up.
    fn settle(&self, record: &StoreRecord) {
        if record.state.is_terminal() || record.attempt_count == 0 {
            return;
        }
        let id = &record.message_id;
        let is_origin = record.envelope.origin() == &self.identity.peer_id;
        if record.pending.is_empty() && (!record.reached.is_empty() || !is_origin) {
            if self.store.mark_delivered(id) {
                debug!("{id} delivered to all reachable neighbors");
            }
            return;
        }
        if record.attempt_count <= self.config.max_retry_attempts {
            return;
        }
        if !record.reached.is_empty() {
            // Some neighbors hold it and keep flooding; only the stragglers
            // are given up on.
            if self.store.mark_delivered(id) {
                info!(
                    "{id} reached {} neighbors, giving up on {} after {} attempts",
                    record.reached.len(),
                    record.pending.len(),
                    record.attempt_count
                );
            }
            return;
        }
        if self.store.mark_expired(id) {
            let notice = UndeliverableNotice {
                envelope: record.envelope.clone(),
                attempts: record.attempt_count,
                unreached: record.pending.clone(),
            };
            warn!("{}", notice.error());
            self.bridge.undeliverable(&notice);
        }
    }

    /// Send one frame to several neighbors at once. Returns (reached, failed).
    async fn send_to_peers(&self, frame: &[u8], targets: &[PeerId]) -> (Vec<PeerId>, Vec<PeerId>) {
        let addressed: Vec<(PeerId, Option<String>)> = {
            let registry = self.registry.read().await;
            targets
                .iter()
                .map(|peer| (peer.clone(), registry.address_of(peer).map(str::to_string)))
                .collect()
        };

        let results = join_all(addressed.into_iter().map(|(peer, addr)| async move {
            let result = match addr {
                Some(addr) => self.send_frame(&addr, frame.to_vec()).await,
                None => Err(NetworkError::PeerUnreachable(format!("{peer}: no address"))),
            };
            (peer, result)
        }))
        .await;

        let mut reached = Vec::new();
        let mut failed = Vec::new();
        for (peer, result) in results {
            match result {
                Ok(()) => reached.push(peer),
                Err(e) => {
                    debug!("Send to {peer} failed: {e}");
                    failed.push(peer);
                }
            }
        }
        (reached, failed)
    }

    /// One send, bounded by the configured timeout.
    async fn send_frame(&self, addr: &str, frame: Vec<u8>) -> Result<(), NetworkError> {
        let timeout = self.config.send_timeout;
        tokio::time::timeout(timeout, self.transport.send(addr, frame))
            .await
            .map_err(|_| NetworkError::Timeout(timeout))?
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    fn heartbeat_frame(&self) -> Result<Vec<u8>, NetworkError> {
        let address = self
            .advertised_addr
            .read()
            .clone()
            .ok_or(NetworkError::NotRunning)?;
        Envelope::new(
            self.identity.peer_id.clone(),
            self.next_sequence(),
            Payload::Heartbeat(Heartbeat { address }),
            1,
        )
        .to_wire()
    }

    async fn introduce(&self, addr: &str) -> Result<(), NetworkError> {
        let frame = self.heartbeat_frame()?;
        self.send_frame(addr, frame).await
    }

    async fn run_heartbeat_cycle(&self) {
        let frame = match self.heartbeat_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping heartbeat cycle: {e}");
                return;
            }
        };
        let entries: Vec<(PeerId, String)> = {
            let registry = self.registry.read().await;
            registry
                .list_all()
                .into_iter()
                .map(|e| (e.peer_id.clone(), e.address.clone()))
                .collect()
        };

        let results = join_all(entries.into_iter().map(|(peer, addr)| {
            let frame = frame.clone();
            async move {
                let result = self.send_frame(&addr, frame).await;
                (peer, addr, result)
            }
        }))
        .await;

        let mut registry = self.registry.write().await;
        for (peer, addr, result) in results {
            match result {
                Ok(()) => {
                    registry.upsert(peer, addr);
                }
                Err(e) => {
                    debug!("Heartbeat to {peer} failed: {e}");
                    registry.on_heartbeat_timeout(&peer);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Retry and sweep
    // -----------------------------------------------------------------------

    async fn run_retry_cycle(&self) -> usize {
        let _gate = self.retry_gate.lock().await;
        let now = Utc::now();
        let alive = self.registry.read().await.alive_peers();

        let due: Vec<StoreRecord> = self
            .store
            .queued()
            .into_iter()
            .filter(|record| {
                let (since, attempts) = match record.last_attempt_at {
                    Some(last) => (last, record.attempt_count),
                    // Never attempted: the first relay is probably in flight.
                    None => (record.first_seen_at, 1),
                };
                chrono::Duration::from_std(self.config.backoff_after(attempts))
                    .ok()
                    .and_then(|backoff| since.checked_add_signed(backoff))
                    .is_some_and(|due_at| due_at <= now)
            })
            .collect();

        let attempted = due.len();
        join_all(due.into_iter().map(|record| {
            let alive = &alive;
            async move {
                if record.envelope.ttl_hops() == 0 {
                    self.store.mark_expired(&record.message_id);
                    return;
                }
                let forwarded = record.envelope.forwarded_by(&self.identity.peer_id);
                let targets = self
                    .router
                    .retry_targets(&forwarded, alive, &record.reached);
                let carried = record
                    .pending
                    .iter()
                    .filter(|peer| !alive.contains(*peer))
                    .cloned()
                    .collect();
                self.relay(&forwarded, targets, carried).await;
            }
        }))
        .await;

        if attempted > 0 {
            debug!("Retry cycle attempted {attempted} records");
        }
        attempted
    }

    async fn run_sweep_cycle(&self) -> SweepReport {
        let retention = self.config.retention_window;
        let report = SweepReport {
            expired: self.store.expire_stale(retention),
            removed: self.store.sweep(retention),
            pruned_peers: self
                .registry
                .write()
                .await
                .prune_dead(self.config.dead_peer_grace),
        };
        self.save_registry().await;
        if report != SweepReport::default() {
            debug!("Sweep: {report:?}");
        }
        report
    }

    async fn save_registry(&self) {
        let Some(path) = &self.registry_path else {
            return;
        };
        if let Err(e) = self.registry.read().await.save_to_file(path) {
            warn!("Failed to save peer registry: {e}");
        }
    }
}

/// Run `tick` every `period` until shutdown.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    core: Arc<NodeCore>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<NodeCore>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => tick(Arc::clone(&core)).await,
                _ = shutdown.recv() => {
                    debug!("{name} loop shutting down");
                    break;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
