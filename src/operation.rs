// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated operations.
//!
//! An [`Operation`] is one immutable write record. It is identified by its
//! origin `host` and `relayed_at` (nanosecond UTC timestamp, strictly
//! increasing per origin), which together form the natural key used for
//! idempotent apply.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "host": "http://node1:4000",
//!   "relayed_at": "2026-03-01T12:00:00.000000123Z",
//!   "op_type": "create",
//!   "table": "blobs",
//!   "payload": { "key": "ab12...", "host": "http://node1:4000", "size": 1024 }
//! }
//! ```
//!
//! Decoding happens in two stages: the envelope (`serde_json` into
//! [`Operation`]) and the effect ([`Operation::decode_record`]). An envelope
//! that parses but whose table or payload is unusable is *malformed*: it will
//! never apply and must be skipped rather than retried.

use crate::blob_store::is_valid_key;
use crate::error::{ReplicationError, Result};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The only replicated table: blob location records.
pub const BLOBS_TABLE: &str = "blobs";

/// Kind of write an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Update,
    Delete,
    /// Any op type this node does not understand (decodes, never applies).
    #[serde(other)]
    Unknown,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
            OpType::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> OpType {
        match raw {
            "create" => OpType::Create,
            "update" => OpType::Update,
            "delete" => OpType::Delete,
            _ => OpType::Unknown,
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replicated write record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Origin node (base URL).
    pub host: String,
    /// Origin-assigned timestamp; with `host` the natural key.
    pub relayed_at: DateTime<Utc>,
    pub op_type: OpType,
    pub table: String,
    pub payload: serde_json::Value,
}

/// Payload of a `blobs` operation: `host` holds (or dropped) blob `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub key: String,
    pub host: String,
    #[serde(default)]
    pub size: u64,
}

/// Decoded effect of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Blob(BlobRecord),
}

impl Operation {
    /// Decode one operation from JSON bytes (push body).
    pub fn decode(bytes: &[u8]) -> Result<Operation> {
        serde_json::from_slice(bytes)
            .map_err(|e| ReplicationError::malformed(format!("undecodable operation envelope: {}", e)))
    }

    /// Encode to JSON bytes for push.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ReplicationError::Internal(format!("operation encode failed: {}", e)))
    }

    /// `relayed_at` as nanoseconds since the Unix epoch.
    pub fn relayed_at_nanos(&self) -> Result<i64> {
        to_nanos(&self.relayed_at).ok_or_else(|| {
            ReplicationError::malformed(format!(
                "relayed_at {} out of representable range",
                self.relayed_at
            ))
        })
    }

    /// Validate the envelope and decode the effect.
    ///
    /// Every failure here is [`ReplicationError::Malformed`].
    pub fn decode_record(&self) -> Result<Record> {
        if self.host.trim().is_empty() {
            return Err(ReplicationError::malformed("operation has empty origin host"));
        }
        let nanos = self.relayed_at_nanos()?;
        if nanos <= 0 {
            return Err(ReplicationError::malformed(format!(
                "relayed_at {} is not after the epoch",
                format_rfc3339_nanos(&self.relayed_at)
            )));
        }
        if self.op_type == OpType::Unknown {
            return Err(ReplicationError::malformed("unknown op_type"));
        }

        match self.table.as_str() {
            BLOBS_TABLE => {
                let record: BlobRecord = serde_json::from_value(self.payload.clone()).map_err(|e| {
                    ReplicationError::malformed(format!("invalid blobs payload: {}", e))
                })?;
                if !is_valid_key(&record.key) {
                    return Err(ReplicationError::malformed(format!(
                        "invalid blob key {:?}",
                        record.key
                    )));
                }
                if record.host.trim_end_matches('/') != self.host.trim_end_matches('/') {
                    return Err(ReplicationError::malformed(format!(
                        "blob record host {} does not match origin {}",
                        record.host, self.host
                    )));
                }
                Ok(Record::Blob(record))
            }
            other => Err(ReplicationError::malformed(format!("unknown table {:?}", other))),
        }
    }

    /// Short identity for logs: `host@relayed_at`.
    pub fn id(&self) -> String {
        format!("{}@{}", self.host, format_rfc3339_nanos(&self.relayed_at))
    }
}

impl BlobRecord {
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.key,
            "host": self.host,
            "size": self.size,
        })
    }
}

// =============================================================================
// Time helpers
// =============================================================================

/// The zero cursor: Unix epoch.
pub fn zero_time() -> DateTime<Utc> {
    Utc.timestamp_nanos(0)
}

pub fn to_nanos(t: &DateTime<Utc>) -> Option<i64> {
    t.timestamp_nanos_opt()
}

pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// RFC 3339 with nine fractional digits, `Z` suffix.
pub fn format_rfc3339_nanos(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 timestamp (any offset) into UTC.
pub fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ReplicationError::malformed(format!("invalid timestamp {:?}: {}", raw, e)))
}
