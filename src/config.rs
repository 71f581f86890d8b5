// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a storage node.
//!
//! Configuration is loaded from a JSON file by the binary
//! ([`NodeConfig::from_file`]) or built programmatically and passed to
//! [`Node::open()`](crate::Node::open).
//!
//! # Quick Start
//!
//! ```rust
//! use blobmesh::config::{NodeConfig, PeerConfig};
//!
//! let mut config = NodeConfig::for_testing("http://127.0.0.1:4001", &"11".repeat(32));
//! config.peers.push(PeerConfig::new("http://127.0.0.1:4002", &"ab".repeat(32)));
//! assert_eq!(config.other_peers().len(), 1);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! NodeConfig
//! ├── self: PeerConfig              # This node's host + public key
//! ├── peers: Vec<PeerConfig>        # Every node in the cluster (self is filtered)
//! ├── replication_factor: usize     # Desired copies per blob
//! ├── listen_addr: Option<String>   # Defaults to 0.0.0.0:<port of self.host>
//! ├── private_key: String           # Hex Ed25519 seed (never serialized)
//! ├── settings: NodeSettings
//! │   ├── push: PushConfig          # Eager per-peer push queue
//! │   ├── sweep: SweepConfig        # Periodic pull reconciliation
//! │   ├── health: HealthConfig      # Peer health probing
//! │   ├── repair: RepairConfig      # Placement convergence
//! │   └── auth: AuthConfig          # Signed nonce freshness
//! └── store: StoreConfig            # SQLite path + blob directory
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "self": { "host": "http://node1.example.com:4000", "public_key": "3b6a27bc..." },
//!   "private_key": "9d61b19d...",
//!   "peers": [
//!     { "host": "http://node1.example.com:4000", "public_key": "3b6a27bc..." },
//!     { "host": "http://node2.example.com:4000", "public_key": "fc51cd8e..." }
//!   ],
//!   "replication_factor": 2,
//!   "settings": {
//!     "sweep": { "interval_sec": 60, "request_timeout": "1m" },
//!     "repair": { "interval_sec": 120, "delete_over_replicated": false }
//!   },
//!   "store": { "sqlite_path": "/var/lib/blobmesh/node.db", "blob_dir": "/var/lib/blobmesh/blobs" }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Node::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identity. `host` is the base URL peers use to reach us.
    #[serde(rename = "self")]
    pub self_peer: PeerConfig,

    /// All cluster members. May include self; it is filtered out where needed.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Number of copies each blob should have across the cluster.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Socket address to bind. Derived from `self.host` when absent.
    #[serde(default)]
    pub listen_addr: Option<String>,

    /// Hex-encoded 32-byte Ed25519 seed used to sign outbound requests.
    #[serde(default, skip_serializing)]
    pub private_key: String,

    #[serde(default)]
    pub settings: NodeSettings,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_replication_factor() -> usize {
    3
}

impl NodeConfig {
    /// Create a minimal single-node config for testing (in-memory store).
    pub fn for_testing(host: &str, private_key: &str) -> Self {
        let public_key = crate::signing::NodeSigner::from_hex(host, private_key)
            .map(|s| s.public_key_hex())
            .unwrap_or_default();
        Self {
            self_peer: PeerConfig::new(host, &public_key),
            peers: Vec::new(),
            replication_factor: 1,
            listen_addr: None,
            private_key: private_key.to_string(),
            settings: NodeSettings::for_testing(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ReplicationError::Config(format!("Invalid config JSON: {}", e)))
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// This node's host (base URL).
    pub fn host(&self) -> &str {
        &self.self_peer.host
    }

    /// Peers other than self, deduplicated by host, in config order.
    pub fn other_peers(&self) -> Vec<PeerConfig> {
        let mut seen = HashSet::new();
        self.peers
            .iter()
            .filter(|p| !p.same_host(&self.self_peer.host))
            .filter(|p| seen.insert(p.normalized_host().to_string()))
            .cloned()
            .collect()
    }

    /// Every cluster host including self, deduplicated.
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.self_peer.normalized_host().to_string()];
        hosts.extend(self.other_peers().iter().map(|p| p.normalized_host().to_string()));
        hosts
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> Result<String> {
        if let Some(addr) = &self.listen_addr {
            return Ok(addr.clone());
        }
        let url = reqwest::Url::parse(&self.self_peer.host).map_err(|e| {
            ReplicationError::Config(format!("Invalid self host {}: {}", self.self_peer.host, e))
        })?;
        let port = url.port_or_known_default().ok_or_else(|| {
            ReplicationError::Config(format!("No port in self host {}", self.self_peer.host))
        })?;
        Ok(format!("0.0.0.0:{}", port))
    }

    /// Check the config for errors that would only surface at runtime.
    pub fn validate(&self) -> Result<()> {
        self.self_peer.validate()?;
        for peer in &self.peers {
            peer.validate()?;
        }
        if self.replication_factor == 0 {
            return Err(ReplicationError::Config(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.private_key.is_empty() {
            return Err(ReplicationError::Config("private_key is required".to_string()));
        }
        let signer = crate::signing::NodeSigner::from_hex(self.host(), &self.private_key)?;
        if !self.self_peer.public_key.is_empty()
            && !signer.public_key_hex().eq_ignore_ascii_case(&self.self_peer.public_key)
        {
            return Err(ReplicationError::Config(
                "private_key does not match self.public_key".to_string(),
            ));
        }
        if self.settings.push.queue_capacity == 0 {
            return Err(ReplicationError::Config(
                "settings.push.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.settings.sweep.bulk_batch_size == 0 {
            return Err(ReplicationError::Config(
                "settings.sweep.bulk_batch_size must be at least 1".to_string(),
            ));
        }
        // tokio::time::interval panics on a zero period
        for (name, secs) in [
            ("sweep", self.settings.sweep.interval_sec),
            ("health", self.settings.health.interval_sec),
            ("repair", self.settings.repair.interval_sec),
        ] {
            if secs == 0 {
                return Err(ReplicationError::Config(format!(
                    "settings.{}.interval_sec must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig: one entry per cluster member
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Base URL, e.g. `"http://node2.example.com:4000"`.
    pub host: String,

    /// Hex-encoded Ed25519 verifying key.
    #[serde(default)]
    pub public_key: String,
}

impl PeerConfig {
    pub fn new(host: &str, public_key: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            public_key: public_key.to_string(),
        }
    }

    /// Host without a trailing slash.
    pub fn normalized_host(&self) -> &str {
        self.host.trim_end_matches('/')
    }

    pub fn same_host(&self, other: &str) -> bool {
        self.normalized_host() == other.trim_end_matches('/')
    }

    /// Join an absolute path onto this peer's base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.normalized_host(), path)
    }

    fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.host)
            .map_err(|e| ReplicationError::Config(format!("Invalid peer host {}: {}", self.host, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ReplicationError::Config(format!(
                "Peer host {} must be http(s)",
                self.host
            )));
        }
        if !self.public_key.is_empty() {
            crate::signing::decode_verifying_key(&self.public_key).map_err(|e| {
                ReplicationError::Config(format!("Peer {} public_key: {}", self.host, e))
            })?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters for the background tasks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeSettings {
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl NodeSettings {
    /// Short timeouts and fast retries; background loops disabled so tests drive them.
    pub fn for_testing() -> Self {
        Self {
            push: PushConfig {
                queue_capacity: 8,
                request_timeout: "2s".to_string(),
            },
            sweep: SweepConfig {
                enabled: false,
                request_timeout: "5s".to_string(),
                apply_max_attempts: 3,
                apply_retry_delay_ms: 5,
                apply_retry_max_delay_ms: 20,
                ..Default::default()
            },
            health: HealthConfig {
                enabled: false,
                request_timeout: "2s".to_string(),
                ..Default::default()
            },
            repair: RepairConfig {
                enabled: false,
                transfer_timeout: "5s".to_string(),
                ..Default::default()
            },
            auth: AuthConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn parse_duration_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PushConfig: eager best-effort delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-peer push queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Bounded outbound queue capacity. Overflowing pushes are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout for a single push request (e.g. "5s").
    #[serde(default = "default_push_timeout")]
    pub request_timeout: String,
}

fn default_queue_capacity() -> usize {
    8
}

fn default_push_timeout() -> String {
    "5s".to_string()
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            request_timeout: "5s".to_string(),
        }
    }
}

impl PushConfig {
    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SweepConfig: pull reconciliation
// ═══════════════════════════════════════════════════════════════════════════════

/// Pull-sweep configuration (client side and the bulk endpoint we serve).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Whether the periodic sweeper tasks run.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often each peer is swept (seconds).
    #[serde(default = "default_sweep_interval_sec")]
    pub interval_sec: u64,

    /// Timeout for the bulk request (e.g. "1m").
    #[serde(default = "default_sweep_timeout")]
    pub request_timeout: String,

    /// Maximum operations served per bulk response.
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,

    /// Attempts per operation apply before the batch halts.
    #[serde(default = "default_apply_max_attempts")]
    pub apply_max_attempts: usize,

    /// Initial delay between apply retries (ms).
    #[serde(default = "default_apply_retry_delay_ms")]
    pub apply_retry_delay_ms: u64,

    /// Ceiling for apply retry delay (ms).
    #[serde(default = "default_apply_retry_max_delay_ms")]
    pub apply_retry_max_delay_ms: u64,
}

fn default_sweep_interval_sec() -> u64 {
    60
}

fn default_sweep_timeout() -> String {
    "60s".to_string()
}

fn default_bulk_batch_size() -> usize {
    1000
}

fn default_apply_max_attempts() -> usize {
    5
}

fn default_apply_retry_delay_ms() -> u64 {
    1000
}

fn default_apply_retry_max_delay_ms() -> u64 {
    5000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            request_timeout: "60s".to_string(),
            bulk_batch_size: 1000,
            apply_max_attempts: 5,
            apply_retry_delay_ms: 1000,
            apply_retry_max_delay_ms: 5000,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(60))
    }

    /// Retry policy applied to each operation within a sweep.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.apply_max_attempts.max(1),
            initial_delay: Duration::from_millis(self.apply_retry_delay_ms),
            max_delay: Duration::from_millis(self.apply_retry_max_delay_ms),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HealthConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Peer health probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe interval (seconds).
    #[serde(default = "default_health_interval_sec")]
    pub interval_sec: u64,

    /// Timeout for one health probe (e.g. "5s").
    #[serde(default = "default_health_timeout")]
    pub request_timeout: String,

    /// Consecutive failed probes before a peer is considered down.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

fn default_health_interval_sec() -> u64 {
    30
}

fn default_health_timeout() -> String {
    "5s".to_string()
}

fn default_miss_threshold() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 30,
            request_timeout: "5s".to_string(),
            miss_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RepairConfig: placement convergence
// ═══════════════════════════════════════════════════════════════════════════════

/// Repair loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to run a repair cycle (seconds).
    #[serde(default = "default_repair_interval_sec")]
    pub interval_sec: u64,

    /// Maximum keys examined per cycle. Remaining keys are picked up by
    /// later cycles (rolling keyset cursor).
    #[serde(default = "default_max_keys_per_cycle")]
    pub max_keys_per_cycle: usize,

    /// Base backoff when a peer fails a transfer.
    /// Actual backoff = min(base * 2^consecutive_failures, max).
    #[serde(default = "default_backoff_base_sec")]
    pub backoff_base_sec: u64,

    /// Maximum backoff (ceiling).
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,

    /// Delete local copies that placement no longer wants once every
    /// desired holder has the blob.
    #[serde(default = "default_false")]
    pub delete_over_replicated: bool,

    /// Timeout for one blob transfer (e.g. "30s").
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout: String,

    /// Throttle blob transfers.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained transfers per second when throttled.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when throttled.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_repair_interval_sec() -> u64 {
    120
}

fn default_max_keys_per_cycle() -> usize {
    1000
}

fn default_backoff_base_sec() -> u64 {
    5
}

fn default_backoff_max_sec() -> u64 {
    300 // 5 minutes
}

fn default_transfer_timeout() -> String {
    "30s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 120,
            max_keys_per_cycle: 1000,
            backoff_base_sec: 5,
            backoff_max_sec: 300,
            delete_over_replicated: false,
            transfer_timeout: "30s".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 50,
            rate_limit_burst: 10,
        }
    }
}

impl RepairConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn transfer_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.transfer_timeout, Duration::from_secs(30))
    }

    /// Calculate backoff duration for a given number of consecutive failures.
    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        let backoff_secs = self
            .backoff_base_sec
            .saturating_mul(2u64.saturating_pow(consecutive_failures));
        Duration::from_secs(backoff_secs.min(self.backoff_max_sec))
    }

    /// Returns `None` if transfer throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AuthConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted clock skew for signed nonces (seconds).
    #[serde(default = "default_nonce_max_skew_sec")]
    pub nonce_max_skew_sec: u64,
}

fn default_nonce_max_skew_sec() -> u64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { nonce_max_skew_sec: 300 }
    }
}

impl AuthConfig {
    pub fn nonce_max_skew(&self) -> Duration {
        Duration::from_secs(self.nonce_max_skew_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite + blob directory
// ═══════════════════════════════════════════════════════════════════════════════

/// Local persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database (op log, blob metadata, cursors).
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Directory holding blob files.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "blobmesh.db".to_string(),
            wal_mode: true,
            blob_dir: "blobs".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            blob_dir: "blobs".to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
