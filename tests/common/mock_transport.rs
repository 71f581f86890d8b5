// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted `PeerTransport` and `OperationSink` for testing.
//!
//! `MockTransport` serves per-peer bulk logs, health reports and blobs from
//! memory and records every call. `MockSink` applies operations into a list
//! and can be told to fail specific timestamps.
//!
//! # Example
//! ```rust,ignore
//! let transport = MockTransport::new();
//! transport.set_bulk(PEER, vec![op1, op2]);
//! transport.fail_bulk(PEER, true);
//!
//! // Use in tests...
//!
//! assert_eq!(transport.bulk_afters(PEER).len(), 1);
//! ```

use blobmesh::blob_store::content_key;
use blobmesh::engine::{ApplyOutcome, OperationSink};
use blobmesh::error::{BoxFuture, ReplicationError};
use blobmesh::health::HealthReport;
use blobmesh::operation::Operation;
use blobmesh::transport::PeerTransport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MockTransport {
    bulk: Mutex<HashMap<String, Vec<Operation>>>,
    bulk_limit: Mutex<Option<usize>>,
    bulk_afters: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    failing_bulk: Mutex<HashSet<String>>,
    pushed: Mutex<Vec<(String, Bytes)>>,
    failing_push: Mutex<HashSet<String>>,
    health: Mutex<HashMap<String, HealthReport>>,
    blobs: Mutex<HashMap<(String, String), Bytes>>,
    stored: Mutex<Vec<(String, String)>>,
    failing_store: Mutex<HashSet<String>>,
}

fn toggle(set: &Mutex<HashSet<String>>, peer: &str, on: bool) {
    let mut set = set.lock();
    if on {
        set.insert(peer.to_string());
    } else {
        set.remove(peer);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Replace the log `peer` serves on bulk requests.
    pub fn set_bulk(&self, peer: &str, ops: Vec<Operation>) {
        self.bulk.lock().insert(peer.to_string(), ops);
    }

    /// Cap the number of operations per bulk response.
    pub fn set_bulk_limit(&self, limit: usize) {
        *self.bulk_limit.lock() = Some(limit);
    }

    pub fn fail_bulk(&self, peer: &str, fail: bool) {
        toggle(&self.failing_bulk, peer, fail);
    }

    pub fn fail_push(&self, peer: &str, fail: bool) {
        toggle(&self.failing_push, peer, fail);
    }

    pub fn fail_store(&self, peer: &str, fail: bool) {
        toggle(&self.failing_store, peer, fail);
    }

    /// Make `peer` answer health probes with `report`.
    pub fn set_health(&self, peer: &str, report: HealthReport) {
        self.health.lock().insert(peer.to_string(), report);
    }

    /// Stop answering health probes for `peer`.
    pub fn clear_health(&self, peer: &str) {
        self.health.lock().remove(peer);
    }

    /// Put a blob on `peer`, keyed by its content hash.
    pub fn put_blob(&self, peer: &str, data: Bytes) -> String {
        let key = content_key(&data);
        self.blobs.lock().insert((peer.to_string(), key.clone()), data);
        key
    }

    // =========================================================================
    // Recorded calls
    // =========================================================================

    /// Every `after` a bulk request to `peer` was made with, in order.
    pub fn bulk_afters(&self, peer: &str) -> Vec<DateTime<Utc>> {
        self.bulk_afters.lock().get(peer).cloned().unwrap_or_default()
    }

    /// Decoded operations pushed to `peer`, in order.
    pub fn pushed_to(&self, peer: &str) -> Vec<Operation> {
        self.pushed
            .lock()
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, body)| Operation::decode(body).unwrap())
            .collect()
    }

    pub fn push_count(&self) -> usize {
        self.pushed.lock().len()
    }

    /// `(peer, key)` for every accepted `store_blob`.
    pub fn stored(&self) -> Vec<(String, String)> {
        self.stored.lock().clone()
    }

    pub fn has_blob(&self, peer: &str, key: &str) -> bool {
        self.blobs.lock().contains_key(&(peer.to_string(), key.to_string()))
    }
}

impl PeerTransport for MockTransport {
    fn push_op<'a>(&'a self, peer: &'a str, body: Bytes) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.failing_push.lock().contains(peer) {
                return Err(ReplicationError::transport(peer, "connection refused"));
            }
            self.pushed.lock().push((peer.to_string(), body));
            Ok(())
        })
    }

    fn fetch_bulk<'a>(&'a self, peer: &'a str, after: DateTime<Utc>) -> BoxFuture<'a, Vec<Operation>> {
        Box::pin(async move {
            self.bulk_afters
                .lock()
                .entry(peer.to_string())
                .or_default()
                .push(after);
            if self.failing_bulk.lock().contains(peer) {
                return Err(ReplicationError::RemoteRejected {
                    peer: peer.to_string(),
                    status: 503,
                });
            }
            let limit = self.bulk_limit.lock().unwrap_or(usize::MAX);
            Ok(self
                .bulk
                .lock()
                .get(peer)
                .map(|ops| {
                    ops.iter()
                        .filter(|op| op.relayed_at > after)
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn fetch_health<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, HealthReport> {
        Box::pin(async move {
            self.health
                .lock()
                .get(peer)
                .cloned()
                .ok_or_else(|| ReplicationError::transport(peer, "connection refused"))
        })
    }

    fn fetch_blob<'a>(&'a self, peer: &'a str, key: &'a str) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move { Ok(self.blobs.lock().get(&(peer.to_string(), key.to_string())).cloned()) })
    }

    fn store_blob<'a>(&'a self, peer: &'a str, data: Bytes) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.failing_store.lock().contains(peer) {
                return Err(ReplicationError::RemoteRejected {
                    peer: peer.to_string(),
                    status: 500,
                });
            }
            let key = content_key(&data);
            self.blobs.lock().insert((peer.to_string(), key.clone()), data);
            self.stored.lock().push((peer.to_string(), key));
            Ok(())
        })
    }
}

// =============================================================================
// MockSink
// =============================================================================

/// Records applied operations; fails the timestamps it is told to.
#[derive(Default)]
pub struct MockSink {
    applied: Mutex<Vec<Operation>>,
    seen: Mutex<HashSet<String>>,
    /// relayed_at nanos that always fail with a retryable error
    failing: Mutex<HashSet<i64>>,
    attempts: AtomicUsize,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(&self, nanos: i64) {
        self.failing.lock().insert(nanos);
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn applied(&self) -> Vec<Operation> {
        self.applied.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl OperationSink for MockSink {
    fn apply<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            op.decode_record()?;
            let nanos = op.relayed_at_nanos()?;
            if self.failing.lock().contains(&nanos) {
                return Err(ReplicationError::Store(sqlx::Error::PoolTimedOut));
            }
            if !self.seen.lock().insert(op.id()) {
                return Ok(ApplyOutcome::Duplicate);
            }
            self.applied.lock().push(op.clone());
            Ok(ApplyOutcome::Applied)
        })
    }
}
