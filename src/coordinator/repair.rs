// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Repair loop: converge actual blob storage with placement.
//!
//! Push and sweep replicate *metadata*; this loop moves the *bytes*. Each
//! cycle walks one page of known keys (a rolling keyset cursor that wraps
//! around) and, per key:
//!
//! ```text
//!  metadata holders ──► correct from local disk ──► desired = decide(key, health)
//!        │                                              │
//!        │        self desired, missing ◄───────────────┤
//!        │          └─► pull from holders (rank order), verify, store, record
//!        │                                              │
//!        │        self is designated pusher ◄───────────┤
//!        │          └─► push to every desired target still missing it
//!        │                                              │
//!        └──────► over-/under-replicated report ◄───────┘
//! ```
//!
//! The designated pusher is the lowest-sorted holder that is not `Down`, so
//! exactly one node pushes each missing copy per cycle.
//!
//! # Backoff on Failure
//!
//! A failed transfer puts the peer in exponential backoff (`base * 2^n`,
//! capped). Peers in backoff are skipped until it expires; a successful
//! transfer resets it. Failures are never fatal to the cycle.

use crate::blob_store::{verify_content, BlobStore};
use crate::config::RepairConfig;
use crate::engine::ReplicationEngine;
use crate::error::Result;
use crate::health::{HealthRegistry, HealthSnapshot};
use crate::metrics;
use crate::placement::PlacementEngine;
use crate::resilience::RateLimiter;
use crate::transport::PeerTransport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn, Instrument};

/// Statistics from a repair cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    /// Keys examined this cycle
    pub keys_checked: usize,
    /// Blobs copied onto this node
    pub pulled: usize,
    /// Blobs copied from this node to a peer
    pub pushed: usize,
    /// Metadata rows corrected from local disk
    pub metadata_fixed: usize,
    /// Local copies removed as over-replicated
    pub deleted: usize,
    pub over_replicated: usize,
    pub under_replicated: usize,
    /// Transfers that failed or timed out
    pub failed_transfers: usize,
    /// Keys whose repair hit a local error
    pub errors: usize,
}

/// A key whose holders differ from its placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobProblem {
    pub key: String,
    pub holders: Vec<String>,
    pub desired: Vec<String>,
    /// Desired hosts that do not hold the blob.
    pub missing: Vec<String>,
}

/// Outcome of the most recent cycle, served on `/internal/blobs/problems`.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RepairStats,
    pub under_replicated: Vec<BlobProblem>,
    pub over_replicated: Vec<BlobProblem>,
}

impl RepairReport {
    fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            stats: RepairStats::default(),
            under_replicated: Vec::new(),
            over_replicated: Vec::new(),
        }
    }
}

#[derive(Default)]
struct RepairState {
    /// Last key of the previous page; `None` starts from the beginning.
    key_cursor: Option<String>,
    /// Per-peer backoff: (consecutive_failures, backoff_until)
    peer_backoff: HashMap<String, (u32, Instant)>,
}

impl RepairState {
    fn in_backoff(&self, peer: &str, now: Instant) -> bool {
        match self.peer_backoff.get(peer) {
            Some((failures, until)) if now < *until => {
                debug!(
                    peer = %peer,
                    consecutive_failures = failures,
                    backoff_remaining_secs = (*until - now).as_secs(),
                    "Skipping peer - in backoff"
                );
                metrics::record_repair_skipped("peer_backoff");
                true
            }
            _ => false,
        }
    }

    fn record_failure(&mut self, peer: &str, config: &RepairConfig) {
        let failures = self.peer_backoff.get(peer).map(|(f, _)| *f).unwrap_or(0) + 1;
        let until = Instant::now() + config.backoff_for_failures(failures);
        self.peer_backoff.insert(peer.to_string(), (failures, until));
    }

    fn record_success(&mut self, peer: &str) {
        self.peer_backoff.remove(peer);
    }
}

/// Periodic placement repair for this node.
pub struct RepairLoop<T: PeerTransport, B: BlobStore> {
    host: String,
    engine: Arc<ReplicationEngine>,
    blobs: Arc<B>,
    transport: Arc<T>,
    placement: Arc<PlacementEngine>,
    health: Arc<HealthRegistry>,
    config: RepairConfig,
    rate_limiter: Option<RateLimiter>,
    state: tokio::sync::Mutex<RepairState>,
    last_report: parking_lot::RwLock<Option<RepairReport>>,
}

impl<T: PeerTransport, B: BlobStore> RepairLoop<T, B> {
    pub fn new(
        engine: Arc<ReplicationEngine>,
        blobs: Arc<B>,
        transport: Arc<T>,
        placement: Arc<PlacementEngine>,
        health: Arc<HealthRegistry>,
        config: RepairConfig,
    ) -> Self {
        let rate_limiter = config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for repair transfers"
            );
            RateLimiter::new(cfg)
        });
        Self {
            host: engine.host().to_string(),
            engine,
            blobs,
            transport,
            placement,
            health,
            config,
            rate_limiter,
            state: tokio::sync::Mutex::new(RepairState::default()),
            last_report: parking_lot::RwLock::new(None),
        }
    }

    /// The report of the most recent completed cycle, if any.
    pub fn last_report(&self) -> Option<RepairReport> {
        self.last_report.read().clone()
    }

    /// Run one repair cycle over the next page of keys.
    ///
    /// Concurrent calls are serialized. Per-key failures are counted in the
    /// report and never abort the cycle.
    #[instrument(skip(self), fields(max_keys = self.config.max_keys_per_cycle))]
    pub async fn run_cycle(&self) -> RepairReport {
        let mut state = self.state.lock().await;
        let start = Instant::now();
        let mut report = RepairReport::started(Utc::now());
        let snapshot = self.health.snapshot();
        let limit = self.config.max_keys_per_cycle.max(1);

        let page = match self.next_page(state.key_cursor.as_deref(), limit).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "Failed to list keys for repair");
                report.stats.errors += 1;
                Vec::new()
            }
        };
        // A short page means the keyspace is exhausted; wrap next time
        state.key_cursor = if page.len() < limit {
            None
        } else {
            page.last().cloned()
        };

        for key in &page {
            report.stats.keys_checked += 1;
            if let Err(e) = self.repair_key(key, &snapshot, &mut state, &mut report).await {
                report.stats.errors += 1;
                warn!(key = %key, error = %e, "Failed to repair key");
            }
        }

        report.finished_at = Utc::now();
        let duration = start.elapsed();
        let stats = &report.stats;
        metrics::record_repair_cycle(
            stats.keys_checked,
            stats.pulled,
            stats.pushed,
            stats.over_replicated,
            stats.errors,
            duration,
        );

        if stats.pulled + stats.pushed + stats.deleted + stats.metadata_fixed > 0 {
            info!(
                keys_checked = stats.keys_checked,
                pulled = stats.pulled,
                pushed = stats.pushed,
                metadata_fixed = stats.metadata_fixed,
                deleted = stats.deleted,
                under_replicated = stats.under_replicated,
                duration_ms = duration.as_millis(),
                "Repair cycle complete with updates"
            );
        } else {
            debug!(
                keys_checked = stats.keys_checked,
                under_replicated = stats.under_replicated,
                "Repair cycle complete, nothing to move"
            );
        }

        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Next `limit` keys after `after`, from metadata and local disk merged.
    async fn next_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let mut keys = self.engine.known_keys(after, limit).await?;
        keys.extend(self.blobs.keys_after(after, limit).await?);
        keys.sort();
        keys.dedup();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn repair_key(
        &self,
        key: &str,
        snapshot: &HealthSnapshot,
        state: &mut RepairState,
        report: &mut RepairReport,
    ) -> Result<()> {
        let mut holders = self.engine.blob_locations(key).await?;
        let mut local = self.blobs.exists(key).await?;
        let listed = holders.iter().any(|h| h == &self.host);

        // Local disk is the truth for this node's own row
        if local && !listed {
            let size = self.blobs.size(key).await?.unwrap_or(0);
            self.engine.record_blob_stored(key, size).await?;
            insert_sorted(&mut holders, &self.host);
            report.stats.metadata_fixed += 1;
            debug!(key = %key, "Recorded untracked local blob");
        } else if !local && listed {
            self.engine.record_blob_deleted(key).await?;
            holders.retain(|h| h != &self.host);
            report.stats.metadata_fixed += 1;
            debug!(key = %key, "Recorded missing local blob");
        }

        let desired = self.placement.decide(key, snapshot);
        let self_desired = desired.iter().any(|h| h == &self.host);

        if self_desired && !local && self.pull(key, &holders, snapshot, state, report).await? {
            local = true;
            insert_sorted(&mut holders, &self.host);
            report.stats.pulled += 1;
        }

        let pusher = holders.iter().find(|h| !snapshot.is_down(h));
        if local && pusher.map(String::as_str) == Some(self.host.as_str()) {
            let targets: Vec<String> = desired
                .iter()
                .filter(|d| !holders.contains(d))
                .cloned()
                .collect();
            for target in self.push(key, &targets, state, report).await? {
                insert_sorted(&mut holders, &target);
                report.stats.pushed += 1;
            }
        }

        let missing: Vec<String> = desired
            .iter()
            .filter(|d| !holders.contains(d))
            .cloned()
            .collect();

        if local && !self_desired && !desired.is_empty() && missing.is_empty() {
            report.stats.over_replicated += 1;
            report.over_replicated.push(BlobProblem {
                key: key.to_string(),
                holders: holders.clone(),
                desired: desired.clone(),
                missing: Vec::new(),
            });
            if self.config.delete_over_replicated {
                self.blobs.delete(key).await?;
                self.engine.record_blob_deleted(key).await?;
                holders.retain(|h| h != &self.host);
                report.stats.deleted += 1;
                info!(key = %key, "Deleted over-replicated local copy");
            }
        }

        if !missing.is_empty() {
            report.stats.under_replicated += 1;
            report.under_replicated.push(BlobProblem {
                key: key.to_string(),
                holders,
                desired,
                missing,
            });
        }
        Ok(())
    }

    /// Copy `key` onto this node from the first holder that serves a valid
    /// copy. Returns `true` if stored.
    async fn pull(
        &self,
        key: &str,
        holders: &[String],
        snapshot: &HealthSnapshot,
        state: &mut RepairState,
        report: &mut RepairReport,
    ) -> Result<bool> {
        let now = Instant::now();
        let sources: Vec<String> = self
            .placement
            .rank(key)
            .into_iter()
            .filter(|h| h != &self.host && holders.contains(h))
            .collect();

        for peer in sources {
            if snapshot.is_down(&peer) || state.in_backoff(&peer, now) {
                continue;
            }
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let fetched = tokio::time::timeout(
                self.config.transfer_timeout_duration(),
                self.transport.fetch_blob(&peer, key),
            )
            .await;

            let data = match fetched {
                Ok(Ok(Some(data))) => data,
                Ok(Ok(None)) => {
                    // Stale metadata, not a peer failure
                    debug!(peer = %peer, key = %key, "Holder no longer has blob");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, key = %key, error = %e, "Blob pull failed");
                    self.transfer_failed(&peer, "pull", state, report);
                    continue;
                }
                Err(_) => {
                    warn!(peer = %peer, key = %key, "Blob pull timed out");
                    self.transfer_failed(&peer, "pull", state, report);
                    continue;
                }
            };

            if !verify_content(key, &data) {
                warn!(peer = %peer, key = %key, "Pulled blob failed hash verification");
                self.transfer_failed(&peer, "pull", state, report);
                continue;
            }

            let size = data.len() as u64;
            self.blobs.put(key, data).await?;
            self.engine.record_blob_stored(key, size).await?;
            state.record_success(&peer);
            metrics::record_repair_transfer(&peer, "pull", true);
            debug!(peer = %peer, key = %key, size, "Pulled blob");
            return Ok(true);
        }
        Ok(false)
    }

    /// Push `key` to each target. Returns the targets that accepted it.
    async fn push(
        &self,
        key: &str,
        targets: &[String],
        state: &mut RepairState,
        report: &mut RepairReport,
    ) -> Result<Vec<String>> {
        let mut delivered = Vec::new();
        if targets.is_empty() {
            return Ok(delivered);
        }
        let Some(data) = self.blobs.get(key).await? else {
            return Ok(delivered);
        };
        let now = Instant::now();

        for target in targets {
            if target == &self.host || state.in_backoff(target, now) {
                continue;
            }
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let result = tokio::time::timeout(
                self.config.transfer_timeout_duration(),
                self.transport.store_blob(target, data.clone()),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    state.record_success(target);
                    metrics::record_repair_transfer(target, "push", true);
                    debug!(peer = %target, key = %key, "Pushed blob");
                    delivered.push(target.clone());
                }
                Ok(Err(e)) => {
                    warn!(peer = %target, key = %key, error = %e, "Blob push failed");
                    self.transfer_failed(target, "push", state, report);
                }
                Err(_) => {
                    warn!(peer = %target, key = %key, "Blob push timed out");
                    self.transfer_failed(target, "push", state, report);
                }
            }
        }
        Ok(delivered)
    }

    fn transfer_failed(&self, peer: &str, direction: &str, state: &mut RepairState, report: &mut RepairReport) {
        state.record_failure(peer, &self.config);
        report.stats.failed_transfers += 1;
        metrics::record_repair_transfer(peer, direction, false);
    }
}

fn insert_sorted(hosts: &mut Vec<String>, host: &str) {
    if let Err(pos) = hosts.binary_search_by(|h| h.as_str().cmp(host)) {
        hosts.insert(pos, host.to_string());
    }
}

/// Run the repair loop until shutdown is signaled.
pub async fn run_repair<T: PeerTransport, B: BlobStore>(
    repair: Arc<RepairLoop<T, B>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("repair");

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        let interval = repair.config.interval();
        info!(
            interval_secs = interval.as_secs(),
            max_keys = repair.config.max_keys_per_cycle,
            backoff_base_sec = repair.config.backoff_base_sec,
            backoff_max_sec = repair.config.backoff_max_sec,
            "Starting repair loop"
        );

        let mut timer = tokio::time::interval(interval);
        // Skip missed ticks instead of bursting to catch up
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping repair loop");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            repair.run_cycle().await;
        }

        info!("Repair loop stopped");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{content_key, MemoryBlobStore};
    use bytes::Bytes;
    use crate::config::StoreConfig;
    use crate::error::{BoxFuture, ReplicationError};
    use crate::health::{HealthReport, PeerStatus};
    use crate::operation::Operation;
    use crate::resilience::RetryPolicy;
    use crate::store::open_pool;
    use parking_lot::Mutex;

    const SELF: &str = "http://a:4000";
    const B: &str = "http://b:4000";
    const C: &str = "http://c:4000";

    /// Serves blobs from a fixed map and records pushes.
    #[derive(Default)]
    struct FakeTransport {
        remote: Mutex<HashMap<(String, String), Bytes>>,
        pushed: Mutex<Vec<(String, String)>>,
        fail_push: Mutex<bool>,
    }

    impl FakeTransport {
        fn serve(&self, peer: &str, data: &'static [u8]) {
            self.remote
                .lock()
                .insert((peer.to_string(), content_key(data)), Bytes::from_static(data));
        }
    }

    impl PeerTransport for FakeTransport {
        fn push_op<'a>(&'a self, _peer: &'a str, _body: Bytes) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn fetch_bulk<'a>(&'a self, _peer: &'a str, _after: DateTime<Utc>) -> BoxFuture<'a, Vec<Operation>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn fetch_health<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, HealthReport> {
            Box::pin(async move { Err(ReplicationError::transport(peer, "unused")) })
        }

        fn fetch_blob<'a>(&'a self, peer: &'a str, key: &'a str) -> BoxFuture<'a, Option<Bytes>> {
            Box::pin(async move {
                Ok(self
                    .remote
                    .lock()
                    .get(&(peer.to_string(), key.to_string()))
                    .cloned())
            })
        }

        fn store_blob<'a>(&'a self, peer: &'a str, data: Bytes) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if *self.fail_push.lock() {
                    return Err(ReplicationError::transport(peer, "refused"));
                }
                self.pushed.lock().push((peer.to_string(), content_key(&data)));
                Ok(())
            })
        }
    }

    struct Fixture {
        engine: Arc<ReplicationEngine>,
        blobs: Arc<MemoryBlobStore>,
        transport: Arc<FakeTransport>,
        health: Arc<HealthRegistry>,
        placement: Arc<PlacementEngine>,
    }

    impl Fixture {
        async fn new(rf: usize) -> Self {
            let pool = open_pool(&StoreConfig::in_memory()).await.unwrap();
            let engine = Arc::new(ReplicationEngine::new(pool, SELF, RetryPolicy::testing()).await.unwrap());
            Self {
                engine,
                blobs: Arc::new(MemoryBlobStore::new()),
                transport: Arc::new(FakeTransport::default()),
                health: Arc::new(HealthRegistry::new(SELF, [B, C], 3)),
                placement: Arc::new(PlacementEngine::new([SELF, B, C], rf)),
            }
        }

        fn repair(&self, config: RepairConfig) -> RepairLoop<FakeTransport, MemoryBlobStore> {
            RepairLoop::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.blobs),
                Arc::clone(&self.transport),
                Arc::clone(&self.placement),
                Arc::clone(&self.health),
                config,
            )
        }

        /// Record that `host` holds `key` as if replicated from it.
        async fn remote_holds(&self, host: &str, key: &str, nanos: i64) {
            let op = Operation {
                host: host.to_string(),
                relayed_at: crate::operation::from_nanos(nanos),
                op_type: crate::operation::OpType::Create,
                table: crate::operation::BLOBS_TABLE.to_string(),
                payload: crate::operation::BlobRecord {
                    key: key.to_string(),
                    host: host.to_string(),
                    size: 5,
                }
                .to_payload(),
            };
            self.engine.apply(&op).await.unwrap();
        }
    }

    fn config() -> RepairConfig {
        RepairConfig {
            max_keys_per_cycle: 100,
            ..Default::default()
        }
    }

    /// Data whose top-ranked host under `placement` is `want`.
    fn data_ranked_first(placement: &PlacementEngine, want: &str) -> Bytes {
        (0..1000)
            .map(|i| Bytes::from(format!("d{}", i)))
            .find(|d| placement.rank(&content_key(d))[0] == want)
            .expect("some candidate ranks the wanted host first")
    }

    #[tokio::test]
    async fn test_records_untracked_local_blob() {
        let fx = Fixture::new(3).await;
        let data = Bytes::from_static(b"hello");
        let key = content_key(&data);
        fx.blobs.put(&key, data).await.unwrap();

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.metadata_fixed, 1);
        assert_eq!(fx.engine.blob_locations(&key).await.unwrap(), vec![SELF.to_string()]);
    }

    #[tokio::test]
    async fn test_records_missing_local_blob() {
        let fx = Fixture::new(1).await;
        let key = content_key(b"gone");
        fx.engine.record_blob_stored(&key, 4).await.unwrap();

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.metadata_fixed, 1);
        assert!(fx.engine.blob_locations(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pulls_when_self_desired() {
        let fx = Fixture::new(3).await;
        let data: &'static [u8] = b"hello";
        let key = content_key(data);
        fx.remote_holds(B, &key, 10).await;
        fx.transport.serve(B, data);

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.pulled, 1);
        assert!(fx.blobs.exists(&key).await.unwrap());
        let holders = fx.engine.blob_locations(&key).await.unwrap();
        assert!(holders.contains(&SELF.to_string()));
    }

    #[tokio::test]
    async fn test_pull_rejects_corrupt_content() {
        let fx = Fixture::new(3).await;
        let key = content_key(b"hello");
        fx.remote_holds(B, &key, 10).await;
        fx.transport
            .remote
            .lock()
            .insert((B.to_string(), key.clone()), Bytes::from_static(b"tampered"));

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.pulled, 0);
        assert_eq!(report.stats.failed_transfers, 1);
        assert!(!fx.blobs.exists(&key).await.unwrap());
        assert_eq!(report.under_replicated.len(), 1);
    }

    #[tokio::test]
    async fn test_designated_pusher_pushes_to_missing_targets() {
        // rf 3 over 3 hosts: every host is desired, self ("a") sorts first
        let fx = Fixture::new(3).await;
        let data = Bytes::from_static(b"payload");
        let key = content_key(&data);
        fx.blobs.put(&key, data).await.unwrap();
        fx.engine.record_blob_stored(&key, 7).await.unwrap();

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.pushed, 2);
        let mut pushed: Vec<String> = fx.transport.pushed.lock().iter().map(|(p, _)| p.clone()).collect();
        pushed.sort();
        assert_eq!(pushed, vec![B.to_string(), C.to_string()]);
        assert!(report.under_replicated.is_empty());
    }

    #[tokio::test]
    async fn test_not_designated_pusher_does_not_push() {
        let fx = Fixture::new(3).await;
        let data = Bytes::from_static(b"payload");
        let key = content_key(&data);
        fx.blobs.put(&key, data).await.unwrap();
        fx.engine.record_blob_stored(&key, 7).await.unwrap();
        // A lower-sorted live holder exists
        fx.remote_holds("http://0:4000", &key, 10).await;

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.pushed, 0);
        assert!(fx.transport.pushed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_down_holder_loses_pusher_role() {
        let fx = Fixture::new(3).await;
        let data = Bytes::from_static(b"payload");
        let key = content_key(&data);
        fx.blobs.put(&key, data).await.unwrap();
        fx.engine.record_blob_stored(&key, 7).await.unwrap();
        fx.remote_holds("http://0:4000", &key, 10).await;
        let now = Utc::now();
        let health = HealthRegistry::new(SELF, ["http://0:4000", B, C], 1);
        health.record_miss("http://0:4000", now);
        let repair = RepairLoop::new(
            Arc::clone(&fx.engine),
            Arc::clone(&fx.blobs),
            Arc::clone(&fx.transport),
            Arc::clone(&fx.placement),
            Arc::new(health),
            config(),
        );

        let report = repair.run_cycle().await;

        assert_eq!(report.stats.pushed, 2);
    }

    #[tokio::test]
    async fn test_failed_push_enters_backoff() {
        let fx = Fixture::new(3).await;
        let data = Bytes::from_static(b"payload");
        let key = content_key(&data);
        fx.blobs.put(&key, data).await.unwrap();
        fx.engine.record_blob_stored(&key, 7).await.unwrap();
        *fx.transport.fail_push.lock() = true;
        let repair = fx.repair(config());

        let first = repair.run_cycle().await;
        assert_eq!(first.stats.failed_transfers, 2);
        assert_eq!(first.under_replicated.len(), 1);

        // Both targets are in backoff now, so nothing is attempted
        *fx.transport.fail_push.lock() = false;
        let second = repair.run_cycle().await;
        assert_eq!(second.stats.failed_transfers, 0);
        assert_eq!(second.stats.pushed, 0);
        assert!(fx.transport.pushed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_over_replicated_reported_not_deleted_by_default() {
        let fx = Fixture::new(1).await;
        let data = data_ranked_first(&fx.placement, B);
        let key = content_key(&data);
        let size = data.len() as u64;
        fx.blobs.put(&key, data).await.unwrap();
        fx.engine.record_blob_stored(&key, size).await.unwrap();
        fx.remote_holds(B, &key, 10).await;

        let report = fx.repair(config()).run_cycle().await;

        assert_eq!(report.stats.over_replicated, 1);
        assert_eq!(report.over_replicated[0].key, key);
        assert!(fx.blobs.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_over_replicated_deleted_when_enabled() {
        let fx = Fixture::new(1).await;
        let data = data_ranked_first(&fx.placement, B);
        let key = content_key(&data);
        let size = data.len() as u64;
        fx.blobs.put(&key, data).await.unwrap();
        fx.engine.record_blob_stored(&key, size).await.unwrap();
        fx.remote_holds(B, &key, 10).await;

        let report = fx
            .repair(RepairConfig {
                delete_over_replicated: true,
                ..config()
            })
            .run_cycle()
            .await;

        assert_eq!(report.stats.deleted, 1);
        assert!(!fx.blobs.exists(&key).await.unwrap());
        assert_eq!(fx.engine.blob_locations(&key).await.unwrap(), vec![B.to_string()]);
    }

    #[tokio::test]
    async fn test_key_cursor_pages_and_wraps() {
        let fx = Fixture::new(3).await;
        for data in [&b"k1"[..], b"k2", b"k3"] {
            let key = content_key(data);
            fx.blobs.put(&key, Bytes::copy_from_slice(data)).await.unwrap();
        }
        let repair = fx.repair(RepairConfig {
            max_keys_per_cycle: 2,
            ..config()
        });

        assert_eq!(repair.run_cycle().await.stats.keys_checked, 2);
        assert_eq!(repair.run_cycle().await.stats.keys_checked, 1);
        // Wrapped back to the start
        assert_eq!(repair.run_cycle().await.stats.keys_checked, 2);
    }

    #[tokio::test]
    async fn test_key_cursor_merges_metadata_and_disk_pages() {
        let fx = Fixture::new(3).await;
        for (i, data) in [&b"m1"[..], b"d1", b"m2", b"d2", b"d3"].into_iter().enumerate() {
            let key = content_key(data);
            fx.blobs.put(&key, Bytes::copy_from_slice(data)).await.unwrap();
            if i % 2 == 0 {
                fx.engine.record_blob_stored(&key, data.len() as u64).await.unwrap();
            }
        }
        let repair = fx.repair(RepairConfig {
            max_keys_per_cycle: 2,
            ..config()
        });

        let checked: Vec<_> = [
            repair.run_cycle().await,
            repair.run_cycle().await,
            repair.run_cycle().await,
        ]
        .iter()
        .map(|r| r.stats.keys_checked)
        .collect();
        assert_eq!(checked, vec![2, 2, 1]);
        // Disk-only keys were recorded along the way
        assert_eq!(fx.engine.local_blob_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_last_report_kept() {
        let fx = Fixture::new(3).await;
        let repair = fx.repair(config());
        assert!(repair.last_report().is_none());

        repair.run_cycle().await;
        let report = repair.last_report().unwrap();
        assert_eq!(report.stats, RepairStats::default());
    }

    #[test]
    fn test_backoff_state() {
        let config = RepairConfig {
            backoff_base_sec: 5,
            backoff_max_sec: 300,
            ..Default::default()
        };
        let mut state = RepairState::default();
        assert!(!state.in_backoff(B, Instant::now()));

        state.record_failure(B, &config);
        state.record_failure(B, &config);
        assert_eq!(state.peer_backoff[B].0, 2);
        assert!(state.in_backoff(B, Instant::now()));

        state.record_success(B);
        assert!(!state.in_backoff(B, Instant::now()));
    }

    #[test]
    fn test_insert_sorted_dedups() {
        let mut hosts = vec![B.to_string()];
        insert_sorted(&mut hosts, SELF);
        insert_sorted(&mut hosts, B);
        assert_eq!(hosts, vec![SELF.to_string(), B.to_string()]);
    }

    #[test]
    fn test_down_status_helper() {
        let snapshot = HealthSnapshot::new(SELF).with_status(B, PeerStatus::Down);
        assert!(snapshot.is_down(B));
    }
}
