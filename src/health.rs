// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer health: this node's report and the probed view of every peer.
//!
//! Each cycle the [`HealthBroadcaster`] refreshes this node's own
//! [`HealthReport`] and probes every peer's `GET /internal/health`
//! concurrently. Results land in the [`HealthRegistry`], which placement
//! reads through immutable [`HealthSnapshot`]s.
//!
//! # Status Transitions
//!
//! ```text
//!             probe ok                     probe ok
//!   Unknown ───────────► Healthy ◄──────────────────────┐
//!      ▲                   │ miss                       │
//!      │                   ▼                            │
//!      └──────────── Unknown (misses < threshold) ──► Down
//!                                    miss #threshold
//! ```
//!
//! A single failed probe never marks a peer down; only `miss_threshold`
//! consecutive misses do. The peer's last report survives misses until it
//! goes down. This node is always `Healthy` in its own snapshots.

use crate::config::HealthConfig;
use crate::engine::ReplicationEngine;
use crate::error::Result;
use crate::transport::PeerTransport;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

fn normalize(host: &str) -> String {
    host.trim_end_matches('/').to_string()
}

/// A node's summary of itself, served at `GET /internal/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub host: String,
    pub observed_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub version: String,
    /// Live blobs this node holds (per its own records).
    pub blob_count: u64,
    /// Operations in its log, all origins.
    pub op_count: u64,
    pub replication_factor: usize,
}

/// Health of a peer as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Healthy,
    /// Never probed, or missed fewer than `miss_threshold` probes in a row.
    Unknown,
    /// Missed `miss_threshold` probes in a row. Excluded from placement.
    Down,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Healthy => "healthy",
            PeerStatus::Unknown => "unknown",
            PeerStatus::Down => "down",
        }
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest probe result for one peer. Replaced on every probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHealth {
    pub host: String,
    /// When we last probed (success or miss).
    pub observed_at: Option<DateTime<Utc>>,
    pub reachable: bool,
    pub status: PeerStatus,
    pub consecutive_misses: u32,
    /// When a probe last succeeded.
    pub last_seen: Option<DateTime<Utc>>,
    pub report: Option<HealthReport>,
}

impl PeerHealth {
    fn never_probed(host: &str) -> Self {
        Self {
            host: normalize(host),
            observed_at: None,
            reachable: false,
            status: PeerStatus::Unknown,
            consecutive_misses: 0,
            last_seen: None,
            report: None,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time status of every cluster host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    self_host: String,
    statuses: BTreeMap<String, PeerStatus>,
}

impl HealthSnapshot {
    pub fn new(self_host: &str) -> Self {
        Self {
            self_host: normalize(self_host),
            statuses: BTreeMap::new(),
        }
    }

    /// Builder used by tests and the registry.
    pub fn with_status(mut self, host: &str, status: PeerStatus) -> Self {
        self.statuses.insert(normalize(host), status);
        self
    }

    /// Status of `host`. Self is always healthy; hosts never seen are unknown.
    pub fn status(&self, host: &str) -> PeerStatus {
        let host = host.trim_end_matches('/');
        if host == self.self_host {
            return PeerStatus::Healthy;
        }
        self.statuses.get(host).copied().unwrap_or(PeerStatus::Unknown)
    }

    pub fn is_down(&self, host: &str) -> bool {
        self.status(host) == PeerStatus::Down
    }

    pub fn self_host(&self) -> &str {
        &self.self_host
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Shared health view, written by the broadcaster and read by everyone else.
pub struct HealthRegistry {
    self_host: String,
    miss_threshold: u32,
    peers: RwLock<BTreeMap<String, PeerHealth>>,
    self_report: RwLock<Option<HealthReport>>,
}

impl HealthRegistry {
    pub fn new<'a>(self_host: &str, peer_hosts: impl IntoIterator<Item = &'a str>, miss_threshold: u32) -> Self {
        let peers = peer_hosts
            .into_iter()
            .map(|h| (normalize(h), PeerHealth::never_probed(h)))
            .collect();
        Self {
            self_host: normalize(self_host),
            miss_threshold: miss_threshold.max(1),
            peers: RwLock::new(peers),
            self_report: RwLock::new(None),
        }
    }

    pub fn miss_threshold(&self) -> u32 {
        self.miss_threshold
    }

    /// Record a successful probe: healthy, misses reset, report replaced.
    pub fn record_success(&self, host: &str, report: HealthReport, now: DateTime<Utc>) {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(normalize(host))
            .or_insert_with(|| PeerHealth::never_probed(host));
        entry.observed_at = Some(now);
        entry.reachable = true;
        entry.status = PeerStatus::Healthy;
        entry.consecutive_misses = 0;
        entry.last_seen = Some(now);
        entry.report = Some(report);
    }

    /// Record a failed probe. Returns the resulting status.
    pub fn record_miss(&self, host: &str, now: DateTime<Utc>) -> PeerStatus {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(normalize(host))
            .or_insert_with(|| PeerHealth::never_probed(host));
        entry.observed_at = Some(now);
        entry.reachable = false;
        entry.consecutive_misses = entry.consecutive_misses.saturating_add(1);
        if entry.consecutive_misses >= self.miss_threshold {
            entry.status = PeerStatus::Down;
            entry.report = None;
        } else {
            entry.status = PeerStatus::Unknown;
        }
        entry.status
    }

    pub fn peer(&self, host: &str) -> Option<PeerHealth> {
        self.peers.read().get(host.trim_end_matches('/')).cloned()
    }

    /// Every peer's latest health, sorted by host.
    pub fn peers(&self) -> Vec<PeerHealth> {
        self.peers.read().values().cloned().collect()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            self_host: self.self_host.clone(),
            statuses: self
                .peers
                .read()
                .iter()
                .map(|(host, health)| (host.clone(), health.status))
                .collect(),
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Healthy)
            .count()
    }

    pub fn set_self_report(&self, report: HealthReport) {
        *self.self_report.write() = Some(report);
    }

    pub fn self_report(&self) -> Option<HealthReport> {
        self.self_report.read().clone()
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCycleStats {
    pub reachable: usize,
    pub unreachable: usize,
    pub newly_down: usize,
}

/// Builds this node's report and probes peers.
pub struct HealthBroadcaster<T: PeerTransport> {
    transport: Arc<T>,
    engine: Arc<ReplicationEngine>,
    registry: Arc<HealthRegistry>,
    peers: Vec<String>,
    started_at: DateTime<Utc>,
    replication_factor: usize,
    config: HealthConfig,
}

impl<T: PeerTransport> HealthBroadcaster<T> {
    pub fn new(
        transport: Arc<T>,
        engine: Arc<ReplicationEngine>,
        registry: Arc<HealthRegistry>,
        peers: Vec<String>,
        replication_factor: usize,
        config: HealthConfig,
    ) -> Self {
        Self {
            transport,
            engine,
            registry,
            peers,
            started_at: Utc::now(),
            replication_factor,
            config,
        }
    }

    /// Snapshot this node's own state.
    pub async fn build_report(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            host: self.engine.host().to_string(),
            observed_at: Utc::now(),
            started_at: self.started_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
            blob_count: self.engine.local_blob_count().await?,
            op_count: self.engine.op_count().await?,
            replication_factor: self.replication_factor,
        })
    }

    /// Refresh the self report, then probe every peer once.
    pub async fn run_cycle(&self) -> HealthCycleStats {
        match self.build_report().await {
            Ok(report) => self.registry.set_self_report(report),
            Err(e) => warn!(error = %e, "Failed to build self health report"),
        }

        let timeout = self.config.request_timeout_duration();
        let probes = self.peers.iter().map(|peer| async move {
            let start = Instant::now();
            let result = tokio::time::timeout(timeout, self.transport.fetch_health(peer)).await;
            (peer, result, start.elapsed())
        });
        let results = futures::future::join_all(probes).await;

        let mut stats = HealthCycleStats::default();
        let now = Utc::now();
        for (peer, result, latency) in results {
            match result {
                Ok(Ok(report)) => {
                    stats.reachable += 1;
                    self.registry.record_success(peer, report, now);
                    crate::metrics::record_health_probe(peer, true, latency);
                    crate::metrics::set_peer_status(peer, PeerStatus::Healthy.as_str());
                }
                failure => {
                    stats.unreachable += 1;
                    let was_down = self
                        .registry
                        .peer(peer)
                        .map(|p| p.status == PeerStatus::Down)
                        .unwrap_or(false);
                    let status = self.registry.record_miss(peer, now);
                    if status == PeerStatus::Down && !was_down {
                        stats.newly_down += 1;
                        warn!(peer = %peer, misses = self.registry.miss_threshold(), "Peer marked down");
                    }
                    match failure {
                        Ok(Err(e)) => debug!(peer = %peer, error = %e, status = %status, "Health probe failed"),
                        _ => debug!(peer = %peer, status = %status, "Health probe timed out"),
                    }
                    crate::metrics::record_health_probe(peer, false, latency);
                    crate::metrics::set_peer_status(peer, status.as_str());
                }
            }
        }
        crate::metrics::set_healthy_peers(self.registry.healthy_count());
        stats
    }
}

/// Run the health broadcaster until shutdown is signaled.
pub async fn run_health<T: PeerTransport>(
    broadcaster: Arc<HealthBroadcaster<T>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("health");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let interval = broadcaster.config.interval();
        info!(
            interval_secs = interval.as_secs(),
            peers = broadcaster.peers.len(),
            miss_threshold = broadcaster.registry.miss_threshold(),
            "Starting health broadcaster"
        );

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping health broadcaster");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let stats = broadcaster.run_cycle().await;
            debug!(
                reachable = stats.reachable,
                unreachable = stats.unreachable,
                "Health cycle complete"
            );
        }

        info!("Health broadcaster stopped");
    }
    .instrument(span)
    .await
}
