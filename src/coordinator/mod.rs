// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node coordinator.
//!
//! The orchestrator that ties together:
//! - The operation log via [`crate::engine::ReplicationEngine`]
//! - One [`crate::peer::PeerClient`] per peer (push queue + pull sweep)
//! - Cursor persistence via [`crate::cursor::CursorStore`]
//! - Peer health via [`crate::health::HealthBroadcaster`]
//! - Placement repair via [`RepairLoop`]
//!
//! # Architecture
//!
//! ```text
//!            store_blob()                      ┌──────────── per peer ───────────┐
//!  client ─────────────► BlobStore             │                                 │
//!                           │                  │ Outbox ─► sender ─► POST receive│
//!                           ▼                  │                                 │
//!                   engine.record_local ──────►│ sweeper ◄─ GET bulk?after=cursor│
//!                           │                  │    │                            │
//!                           ▼                  │    └─► engine.apply ─► cursor   │
//!                      SQLite (ops, blobs,     └─────────────────────────────────┘
//!                      cursors)
//!                           ▲
//!        health ────────────┤ snapshot ──► placement ──► repair (pull/push bytes)
//! ```
//!
//! All background tasks watch one shutdown channel and are joined with a
//! drain timeout on [`Node::shutdown`].

mod repair;
mod types;

pub use repair::{run_repair, BlobProblem, RepairLoop, RepairReport, RepairStats};
pub use types::{BlobInfo, BlobLocation, NodeState, NodeStatus};

use crate::blob_store::{content_key, is_valid_key, BlobStore, FsBlobStore};
use crate::config::{NodeConfig, PeerConfig};
use crate::cursor::CursorStore;
use crate::engine::ReplicationEngine;
use crate::error::{ReplicationError, Result};
use crate::health::{run_health, HealthBroadcaster, HealthRegistry};
use crate::metrics;
use crate::operation::format_rfc3339_nanos;
use crate::peer::PeerClient;
use crate::placement::PlacementEngine;
use crate::signing::{NodeSigner, PeerKeys};
use crate::store;
use crate::transport::{HttpTransport, PeerTransport, TransportTimeouts};
use bytes::Bytes;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Replication client type used by [`Node`].
pub type NodeClient<T> = PeerClient<T, ReplicationEngine>;

/// A blobmesh storage node.
///
/// Owns the store, the per-peer clients and the background tasks. Generic
/// over the peer transport and blob backend so tests can swap either.
pub struct Node<T: PeerTransport = HttpTransport, B: BlobStore = FsBlobStore> {
    config: NodeConfig,

    /// Node state (broadcast to watchers)
    state_tx: watch::Sender<NodeState>,

    /// Node state receiver (for internal use)
    state_rx: watch::Receiver<NodeState>,

    pool: SqlitePool,
    engine: Arc<ReplicationEngine>,
    cursors: Arc<CursorStore>,
    clients: Vec<Arc<NodeClient<T>>>,
    transport: Arc<T>,
    blobs: Arc<B>,
    health: Arc<HealthRegistry>,
    broadcaster: Arc<HealthBroadcaster<T>>,
    placement: Arc<PlacementEngine>,
    repair: Arc<RepairLoop<T, B>>,

    /// Verification keys for every cluster member, self included
    peer_keys: Arc<PeerKeys>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Node<HttpTransport, FsBlobStore> {
    /// Build a node with the signed HTTP transport and on-disk blobs.
    ///
    /// The node starts in `Created` state. Call [`start()`](Self::start)
    /// to begin replication.
    pub async fn open(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let signer = Arc::new(NodeSigner::from_hex(config.host(), &config.private_key)?);
        let transport = HttpTransport::new(signer, TransportTimeouts::from_settings(&config.settings))?;
        let blobs = FsBlobStore::new(&config.store.blob_dir)?;
        Self::with_parts(config, Arc::new(transport), Arc::new(blobs)).await
    }
}

impl<T: PeerTransport, B: BlobStore> Node<T, B> {
    /// Build a node over an explicit transport and blob backend.
    ///
    /// Opens the store, runs migrations and wires one client per peer (self
    /// filtered out) with its outbox registered on the engine.
    pub async fn with_parts(config: NodeConfig, transport: Arc<T>, blobs: Arc<B>) -> Result<Self> {
        config.validate()?;
        let host = config.self_peer.normalized_host().to_string();
        let peers = config.other_peers();

        let pool = store::open_pool(&config.store).await?;
        let engine = Arc::new(
            ReplicationEngine::new(pool.clone(), &host, config.settings.sweep.retry_policy()).await?,
        );
        let cursors = Arc::new(CursorStore::new(pool.clone()).await?);

        let clients: Vec<Arc<NodeClient<T>>> = peers
            .iter()
            .map(|peer| {
                let client = PeerClient::new(
                    peer.normalized_host(),
                    config.settings.push.queue_capacity,
                    Arc::clone(&transport),
                    Arc::clone(&engine),
                    Arc::clone(&cursors),
                    config.settings.sweep.clone(),
                );
                engine.register_outbox(client.outbox());
                Arc::new(client)
            })
            .collect();

        let peer_hosts: Vec<String> = peers.iter().map(|p| p.normalized_host().to_string()).collect();
        let health = Arc::new(HealthRegistry::new(
            &host,
            peer_hosts.iter().map(String::as_str),
            config.settings.health.miss_threshold,
        ));
        let broadcaster = Arc::new(HealthBroadcaster::new(
            Arc::clone(&transport),
            Arc::clone(&engine),
            Arc::clone(&health),
            peer_hosts,
            config.replication_factor,
            config.settings.health.clone(),
        ));
        let placement = Arc::new(PlacementEngine::new(config.all_hosts(), config.replication_factor));
        let repair = Arc::new(RepairLoop::new(
            Arc::clone(&engine),
            Arc::clone(&blobs),
            Arc::clone(&transport),
            Arc::clone(&placement),
            Arc::clone(&health),
            config.settings.repair.clone(),
        ));

        let signer = NodeSigner::from_hex(&host, &config.private_key)?;
        let self_key = PeerConfig::new(&host, &signer.public_key_hex());
        let peer_keys = Arc::new(PeerKeys::from_peers(
            peers.iter().chain(std::iter::once(&self_key)),
            config.settings.auth.nonce_max_skew(),
        )?);

        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            host = %host,
            peers = clients.len(),
            replication_factor = config.replication_factor,
            "Node created"
        );

        Ok(Self {
            config,
            state_tx,
            state_rx,
            pool,
            engine,
            cursors,
            clients,
            transport,
            blobs,
            health,
            broadcaster,
            placement,
            repair,
            peer_keys,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Get current node state.
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    /// Flips to `true` once shutdown begins. Long-lived responses watch it.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), NodeState::Running)
    }

    fn set_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
        metrics::set_node_state(&state.to_string());
    }

    /// Start background replication.
    ///
    /// 1. Builds the initial self health report (fails the node if the store
    ///    is unreadable)
    /// 2. Spawns a push sender and a sweeper per peer
    /// 3. Spawns the health broadcaster and repair loop (if enabled)
    pub async fn start(&self) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            host = %self.host(),
            peer_count = self.clients.len(),
            "Starting node"
        );

        match self.broadcaster.build_report().await {
            Ok(report) => self.health.set_self_report(report),
            Err(e) => {
                error!(error = %e, "Failed to read local store on start");
                self.set_state(NodeState::Failed);
                return Err(e);
            }
        }

        let settings = &self.config.settings;
        let mut handles = self.handles.lock().await;

        for client in &self.clients {
            let sender = Arc::clone(client);
            handles.push(tokio::spawn(sender.run_sender(self.shutdown_rx.clone())));

            if settings.sweep.enabled {
                let sweeper = Arc::clone(client);
                handles.push(tokio::spawn(sweeper.run_sweeper(self.shutdown_rx.clone())));
            }
            debug!(peer = %client.host(), sweep = settings.sweep.enabled, "Spawned peer tasks");
        }

        if settings.health.enabled {
            let broadcaster = Arc::clone(&self.broadcaster);
            handles.push(tokio::spawn(run_health(broadcaster, self.shutdown_rx.clone())));
            info!("Spawned health broadcaster");
        }

        if settings.repair.enabled {
            let repair = Arc::clone(&self.repair);
            handles.push(tokio::spawn(run_repair(repair, self.shutdown_rx.clone())));
            info!("Spawned repair loop");
        }

        let task_count = handles.len();
        drop(handles);

        self.set_state(NodeState::Running);
        info!(task_count, "Node running");
        Ok(())
    }

    /// Shutdown the node gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all tasks to stop
    /// 2. Wait for tasks to exit (with timeout)
    /// 3. Checkpoint and close the store
    pub async fn shutdown(&self) {
        if self.state() == NodeState::Stopped {
            debug!("Node already stopped");
            return;
        }
        info!("Shutting down node");
        self.set_state(NodeState::ShuttingDown);

        // Signal shutdown to all tasks
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        let drain_timeout = std::time::Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        if !self.config.store.is_in_memory() {
            if let Err(e) = store::checkpoint(&self.pool).await {
                warn!(error = %e, "WAL checkpoint failed on shutdown");
            }
        }
        self.pool.close().await;

        self.set_state(NodeState::Stopped);
        info!("Node stopped");
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Content-address `data`, store it locally and record the holding.
    ///
    /// Storing a blob this node already holds rewrites the file but does not
    /// log a second operation.
    pub async fn store_blob(&self, data: Bytes) -> Result<String> {
        if self.state() == NodeState::Stopped {
            return Err(ReplicationError::Shutdown);
        }
        let key = content_key(&data);
        let size = data.len() as u64;
        self.blobs.put(&key, data).await?;

        let holders = self.engine.blob_locations(&key).await?;
        if !holders.iter().any(|h| h == self.host()) {
            self.engine.record_blob_stored(&key, size).await?;
            debug!(key = %key, size, "Blob stored");
        }
        Ok(key)
    }

    /// Raw bytes of a locally held blob.
    pub async fn get_blob(&self, key: &str) -> Result<Option<Bytes>> {
        if !is_valid_key(key) {
            return Err(ReplicationError::malformed(format!("invalid blob key {:?}", key)));
        }
        self.blobs.get(key).await
    }

    /// Recorded holders of `key` and where placement wants it.
    pub async fn blob_location(&self, key: &str) -> Result<BlobLocation> {
        if !is_valid_key(key) {
            return Err(ReplicationError::malformed(format!("invalid blob key {:?}", key)));
        }
        Ok(BlobLocation {
            key: key.to_string(),
            holders: self.engine.blob_locations(key).await?,
            desired: self.placement.decide(key, &self.health.snapshot()),
        })
    }

    /// Whether this node holds `key`, and its size.
    pub async fn blob_info(&self, key: &str) -> Result<BlobInfo> {
        if !is_valid_key(key) {
            return Err(ReplicationError::malformed(format!("invalid blob key {:?}", key)));
        }
        let size = self.blobs.size(key).await?;
        Ok(BlobInfo {
            key: key.to_string(),
            local: size.is_some(),
            size,
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Node status for `/internal/status`. No network I/O.
    pub async fn status(&self) -> Result<NodeStatus> {
        let cursors = self
            .cursors
            .get_all()
            .await?
            .into_iter()
            .map(|(peer, t)| (peer, format_rfc3339_nanos(&t)))
            .collect();
        Ok(NodeStatus {
            host: self.host().to_string(),
            state: self.state(),
            replication_factor: self.config.replication_factor,
            peers: self.clients.iter().map(|c| c.stats()).collect(),
            cursors,
            op_count: self.engine.op_count().await?,
            blob_record_count: self.engine.blob_record_count().await?,
            healthy_peers: self.health.healthy_count(),
        })
    }

    /// This node's host, without trailing slash.
    pub fn host(&self) -> &str {
        self.engine.host()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn cursors(&self) -> &Arc<CursorStore> {
        &self.cursors
    }

    pub fn clients(&self) -> &[Arc<NodeClient<T>>] {
        &self.clients
    }

    /// The client for `host`, if it is a configured peer.
    pub fn client(&self, host: &str) -> Option<&Arc<NodeClient<T>>> {
        let host = host.trim_end_matches('/');
        self.clients.iter().find(|c| c.host() == host)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn blobs(&self) -> &Arc<B> {
        &self.blobs
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn broadcaster(&self) -> &Arc<HealthBroadcaster<T>> {
        &self.broadcaster
    }

    pub fn placement(&self) -> &Arc<PlacementEngine> {
        &self.placement
    }

    pub fn repair(&self) -> &Arc<RepairLoop<T, B>> {
        &self.repair
    }

    pub fn peer_keys(&self) -> &Arc<PeerKeys> {
        &self.peer_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::error::BoxFuture;
    use crate::health::HealthReport;
    use crate::operation::Operation;
    use chrono::{DateTime, Utc};

    const SEED_A: &str = "0101010101010101010101010101010101010101010101010101010101010101";
    const SEED_B: &str = "0202020202020202020202020202020202020202020202020202020202020202";
    const A: &str = "http://a:4000";
    const B: &str = "http://b:4000";

    struct NullTransport;

    impl PeerTransport for NullTransport {
        fn push_op<'a>(&'a self, peer: &'a str, _body: Bytes) -> BoxFuture<'a, ()> {
            Box::pin(async move { Err(ReplicationError::transport(peer, "offline")) })
        }

        fn fetch_bulk<'a>(&'a self, _peer: &'a str, _after: DateTime<Utc>) -> BoxFuture<'a, Vec<Operation>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn fetch_health<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, HealthReport> {
            Box::pin(async move { Err(ReplicationError::transport(peer, "offline")) })
        }

        fn fetch_blob<'a>(&'a self, _peer: &'a str, _key: &'a str) -> BoxFuture<'a, Option<Bytes>> {
            Box::pin(async { Ok(None) })
        }

        fn store_blob<'a>(&'a self, peer: &'a str, _data: Bytes) -> BoxFuture<'a, ()> {
            Box::pin(async move { Err(ReplicationError::transport(peer, "offline")) })
        }
    }

    fn test_config() -> NodeConfig {
        let mut config = NodeConfig::for_testing(A, SEED_A);
        let b_key = NodeSigner::from_hex(B, SEED_B).unwrap().public_key_hex();
        config.peers = vec![
            PeerConfig::new(A, &config.self_peer.public_key),
            PeerConfig::new(B, &b_key),
        ];
        config
    }

    async fn node() -> Node<NullTransport, MemoryBlobStore> {
        Node::with_parts(test_config(), Arc::new(NullTransport), Arc::new(MemoryBlobStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_node_initial_state() {
        let node = node().await;

        assert_eq!(node.state(), NodeState::Created);
        assert!(!node.is_running());
        assert_eq!(node.host(), A);
    }

    #[tokio::test]
    async fn test_self_filtered_from_clients() {
        let node = node().await;

        assert_eq!(node.clients().len(), 1);
        assert_eq!(node.clients()[0].host(), B);
        assert!(node.client("http://b:4000/").is_some());
        assert!(node.client(A).is_none());
        assert_eq!(node.engine().outbox_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_keys_include_self() {
        let node = node().await;

        assert!(node.peer_keys().knows(A));
        assert!(node.peer_keys().knows(B));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.replication_factor = 0;
        let result = Node::with_parts(config, Arc::new(NullTransport), Arc::new(MemoryBlobStore::new())).await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let node = node().await;
        let mut state_rx = node.state_receiver();

        node.start().await.unwrap();
        assert!(node.is_running());
        assert_eq!(*state_rx.borrow_and_update(), NodeState::Running);

        node.shutdown().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let node = node().await;
        node.start().await.unwrap();

        let result = node.start().await;
        if let Err(ReplicationError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let node = node().await;

        node.shutdown().await;
        assert_eq!(node.state(), NodeState::Stopped);

        // Second shutdown is a no-op
        node.shutdown().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_store_blob_records_once() {
        let node = node().await;
        let data = Bytes::from_static(b"hello world");

        let key = node.store_blob(data.clone()).await.unwrap();
        assert_eq!(key, content_key(&data));
        assert_eq!(node.get_blob(&key).await.unwrap(), Some(data.clone()));
        assert_eq!(node.engine().op_count().await.unwrap(), 1);

        // Same content again: no second op
        node.store_blob(data).await.unwrap();
        assert_eq!(node.engine().op_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_blob_queues_push() {
        let node = node().await;

        node.store_blob(Bytes::from_static(b"queued")).await.unwrap();

        let stats = node.clients()[0].stats();
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn test_blob_location_and_info() {
        let node = node().await;
        let key = node.store_blob(Bytes::from_static(b"where")).await.unwrap();

        let location = node.blob_location(&key).await.unwrap();
        assert_eq!(location.holders, vec![A.to_string()]);
        assert_eq!(location.desired.len(), 1);

        let info = node.blob_info(&key).await.unwrap();
        assert!(info.local);
        assert_eq!(info.size, Some(5));

        let missing = node.blob_info(&content_key(b"nope")).await.unwrap();
        assert!(!missing.local);
        assert!(missing.size.is_none());
    }

    #[tokio::test]
    async fn test_invalid_key_is_malformed() {
        let node = node().await;
        assert!(node.blob_info("../etc/passwd").await.unwrap_err().is_malformed());
        assert!(node.get_blob("abc").await.unwrap_err().is_malformed());
    }

    #[tokio::test]
    async fn test_status() {
        let node = node().await;
        node.store_blob(Bytes::from_static(b"status")).await.unwrap();
        node.cursors()
            .advance(B, crate::operation::from_nanos(42))
            .await
            .unwrap();

        let status = node.status().await.unwrap();
        assert_eq!(status.host, A);
        assert_eq!(status.state, NodeState::Created);
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.op_count, 1);
        assert_eq!(status.blob_record_count, 1);
        assert!(status.cursors.contains_key(B));
    }
}
