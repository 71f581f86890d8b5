// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Deterministic node identities and configs
//! - A scripted in-memory `PeerTransport` and `OperationSink`
//! - Operation builders

#![allow(dead_code)]

pub mod mock_transport;

pub use mock_transport::*;

use blobmesh::config::{NodeConfig, PeerConfig};
use blobmesh::operation::{from_nanos, BlobRecord, OpType, Operation, BLOBS_TABLE};
use blobmesh::signing::NodeSigner;

/// A cluster member with a fixed signing seed.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    pub host: String,
    pub seed_hex: String,
}

impl TestIdentity {
    pub fn new(host: &str, seed: u8) -> Self {
        Self {
            host: host.to_string(),
            seed_hex: hex::encode([seed; 32]),
        }
    }

    pub fn signer(&self) -> NodeSigner {
        NodeSigner::from_seed(&self.host, hex_seed(&self.seed_hex))
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig::new(&self.host, &self.signer().public_key_hex())
    }
}

fn hex_seed(seed_hex: &str) -> [u8; 32] {
    let bytes = hex::decode(seed_hex).unwrap();
    bytes.as_slice().try_into().unwrap()
}

/// Test config for `me` with every identity in `cluster` as a peer.
///
/// Background loops are disabled; tests drive sweeps and cycles directly.
pub fn node_config(me: &TestIdentity, cluster: &[&TestIdentity], replication_factor: usize) -> NodeConfig {
    let mut config = NodeConfig::for_testing(&me.host, &me.seed_hex);
    config.peers = cluster.iter().map(|id| id.peer_config()).collect();
    config.replication_factor = replication_factor;
    config
}

/// A blob-holding operation originated by `host`.
pub fn blob_op(host: &str, nanos: i64, op_type: OpType, key: &str) -> Operation {
    Operation {
        host: host.to_string(),
        relayed_at: from_nanos(nanos),
        op_type,
        table: BLOBS_TABLE.to_string(),
        payload: BlobRecord {
            key: key.to_string(),
            host: host.to_string(),
            size: 1,
        }
        .to_payload(),
    }
}

/// An operation that decodes as an envelope but can never apply.
pub fn malformed_op(host: &str, nanos: i64) -> Operation {
    Operation {
        host: host.to_string(),
        relayed_at: from_nanos(nanos),
        op_type: OpType::Create,
        table: "no_such_table".to_string(),
        payload: serde_json::json!({}),
    }
}

/// A valid content key for `seed`.
pub fn key_for(seed: &str) -> String {
    blobmesh::blob_store::content_key(seed.as_bytes())
}
