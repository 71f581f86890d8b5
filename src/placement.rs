// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blob placement by rendezvous (highest-random-weight) hashing.
//!
//! Every host gets a score per key:
//!
//! ```text
//! score(key, host) = u64::from_be_bytes(SHA-256(key || 0x00 || host)[..8])
//! ```
//!
//! Hosts are ranked by score descending (ties by host ascending) and the
//! first `replication_factor` hosts that are not `Down` are the placement.
//! Every node computes the same answer from the same inputs, whatever order
//! its peer list is in, and adding or removing a host only moves the keys
//! whose top-`rf` set actually included it.

use crate::health::{HealthSnapshot, PeerStatus};
use sha2::{Digest, Sha256};

/// Rendezvous score of `host` for `key`.
pub fn score(key: &str, host: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(host.trim_end_matches('/').as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Maps content keys to the hosts that should store them.
#[derive(Debug, Clone)]
pub struct PlacementEngine {
    hosts: Vec<String>,
    replication_factor: usize,
}

impl PlacementEngine {
    /// `hosts` is every cluster member including self; duplicates and
    /// trailing slashes are ignored.
    pub fn new(hosts: impl IntoIterator<Item = impl AsRef<str>>, replication_factor: usize) -> Self {
        let mut hosts: Vec<String> = hosts
            .into_iter()
            .map(|h| h.as_ref().trim_end_matches('/').to_string())
            .collect();
        hosts.sort();
        hosts.dedup();
        Self {
            hosts,
            replication_factor,
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// All hosts in preference order for `key`, ignoring health.
    pub fn rank(&self, key: &str) -> Vec<String> {
        let mut scored: Vec<(u64, &String)> = self.hosts.iter().map(|h| (score(key, h), h)).collect();
        scored.sort_by(|(sa, ha), (sb, hb)| sb.cmp(sa).then_with(|| ha.cmp(hb)));
        scored.into_iter().map(|(_, h)| h.clone()).collect()
    }

    /// Desired holders of `key`: the top `replication_factor` hosts that
    /// are not down. Fewer eligible hosts returns all of them.
    pub fn decide(&self, key: &str, health: &HealthSnapshot) -> Vec<String> {
        self.rank(key)
            .into_iter()
            .filter(|h| health.status(h) != PeerStatus::Down)
            .take(self.replication_factor)
            .collect()
    }
}
