// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node state types.
//!
//! Defines the state machine for the node lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ (start failed)             │ shutdown()
//!    ↓                            ↓
//! Failed                    ShuttingDown
//!                                 │
//!                                 │ (tasks drained, pool closed)
//!                                 ↓
//!                              Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `Node::open()`. Store open, no tasks running.
//! - **Running**: Senders, sweepers, health and repair tasks are spawned.
//! - **ShuttingDown**: `shutdown()` called. Waiting for tasks to observe the signal.
//! - **Stopped**: Tasks joined and the pool closed. Safe to drop.
//! - **Failed**: Start-up failed. Check logs for details.

use crate::peer::PeerClientStats;
use serde::Serialize;
use std::collections::BTreeMap;

/// State of the node.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Node built but not started.
    ///
    /// Call [`start()`](super::Node::start) to begin replication.
    Created,

    /// Running and replicating.
    Running,

    /// Shutting down gracefully.
    ///
    /// Transitions to `Stopped` when every task has exited or timed out.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time view of a node, served on `/internal/status`.
///
/// Built from cached state and two count queries; no network I/O.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub host: String,
    pub state: NodeState,
    pub replication_factor: usize,
    /// Per-peer replication client counters, in config order.
    pub peers: Vec<PeerClientStats>,
    /// Sweep cursor per peer as RFC 3339 with nanoseconds.
    pub cursors: BTreeMap<String, String>,
    pub op_count: u64,
    pub blob_record_count: u64,
    pub healthy_peers: usize,
}

/// Where a blob is and where it should be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobLocation {
    pub key: String,
    /// Hosts whose latest metadata says they hold the blob, sorted.
    pub holders: Vec<String>,
    /// Placement for the key under the current health view.
    pub desired: Vec<String>,
}

/// Local presence of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub key: String,
    pub local: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}
