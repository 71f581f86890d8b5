// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer sweep cursors.
//!
//! Stores the `relayed_at` of the last operation applied from each peer in
//! the node database, so a restarted node resumes pulling where it stopped.
//!
//! ## Cursor Semantics
//!
//! The cursor is the **last successfully applied** `relayed_at` for a peer.
//! The next sweep asks for operations strictly after it.
//!
//! ```text
//! apply op@T1 ─► apply op@T2 ─► apply op@T3 fails ─► persist cursor T2
//!                                                    (next sweep: after=T2)
//! ```
//!
//! Writes go straight to SQLite (no debounce): a sweep runs at most once a
//! minute per peer, and losing cursor progress would only cause re-pulling
//! already-applied, idempotent operations.
//!
//! Cursors never move backwards. [`CursorStore::advance`] ignores an older
//! timestamp both in the cache and in SQL.

use crate::error::Result;
use crate::operation::{from_nanos, to_nanos, zero_time};
use crate::store::execute_with_retry;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Persistent cursor storage over the node database.
pub struct CursorStore {
    pool: SqlitePool,
    /// Write-through cache; populated lazily from SQLite.
    cache: Arc<RwLock<HashMap<String, i64>>>,
}

fn key(peer: &str) -> String {
    peer.trim_end_matches('/').to_string()
}

impl CursorStore {
    /// Load all persisted cursors into the cache.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let rows: Vec<(String, i64)> = execute_with_retry("cursor_load", || async {
            sqlx::query_as("SELECT peer_host, relayed_at FROM cursors")
                .fetch_all(&pool)
                .await
        })
        .await?;

        let mut cache = HashMap::new();
        for (peer, nanos) in rows {
            debug!(peer = %peer, relayed_at = nanos, "Loaded cursor from disk");
            cache.insert(peer, nanos);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
        })
    }

    /// Cursor for a peer. `None` on first sync with this peer.
    pub async fn get(&self, peer: &str) -> Result<Option<DateTime<Utc>>> {
        let peer = key(peer);
        if let Some(nanos) = self.cache.read().await.get(&peer) {
            return Ok(Some(from_nanos(*nanos)));
        }

        let pool = &self.pool;
        let row: Option<(i64,)> = execute_with_retry("cursor_get", || async {
            sqlx::query_as("SELECT relayed_at FROM cursors WHERE peer_host = ?")
                .bind(&peer)
                .fetch_optional(pool)
                .await
        })
        .await?;

        Ok(match row {
            Some((nanos,)) => {
                self.cache.write().await.insert(peer, nanos);
                Some(from_nanos(nanos))
            }
            None => None,
        })
    }

    /// Cursor for a peer, or the Unix epoch (pull everything) on first sync.
    pub async fn get_or_zero(&self, peer: &str) -> Result<DateTime<Utc>> {
        Ok(self.get(peer).await?.unwrap_or_else(zero_time))
    }

    /// Move a peer's cursor forward to `relayed_at` and persist it.
    ///
    /// Returns `false` (and writes nothing) if the cursor is already at or
    /// past `relayed_at`.
    pub async fn advance(&self, peer: &str, relayed_at: DateTime<Utc>) -> Result<bool> {
        let peer = key(peer);
        let Some(nanos) = to_nanos(&relayed_at) else {
            warn!(peer = %peer, %relayed_at, "Cursor out of range, not persisted");
            return Ok(false);
        };

        if let Some(current) = self.cache.read().await.get(&peer) {
            if *current >= nanos {
                return Ok(false);
            }
        }

        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;
        let result = execute_with_retry("cursor_advance", || async {
            sqlx::query(
                r#"
                INSERT INTO cursors (peer_host, relayed_at, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(peer_host) DO UPDATE SET
                    relayed_at = excluded.relayed_at,
                    updated_at = excluded.updated_at
                WHERE excluded.relayed_at > cursors.relayed_at
                "#,
            )
            .bind(&peer)
            .bind(nanos)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let moved = result.rows_affected() > 0;
        if moved {
            let mut cache = self.cache.write().await;
            let entry = cache.entry(peer.clone()).or_insert(nanos);
            *entry = (*entry).max(nanos);
            debug!(peer = %peer, relayed_at = nanos, "Cursor advanced");
            crate::metrics::record_cursor_advance(&peer, nanos as f64 / 1e9);
        }
        Ok(moved)
    }

    /// All persisted cursors (for status and debugging).
    pub async fn get_all(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let pool = &self.pool;
        let rows: Vec<(String, i64)> = execute_with_retry("cursor_get_all", || async {
            sqlx::query_as("SELECT peer_host, relayed_at FROM cursors")
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(peer, nanos)| (peer, from_nanos(nanos)))
            .collect())
    }
}
