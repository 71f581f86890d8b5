// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine: exactly-once apply and the local operation log.
//!
//! Every operation, whether pushed by its origin, pulled during a sweep, or
//! created locally, goes through [`ReplicationEngine::apply`]:
//!
//! ```text
//!   decode_record ──► per-origin lane ──► BEGIN
//!                                          INSERT ops ... ON CONFLICT DO NOTHING
//!                                          │  0 rows ──► ROLLBACK, Duplicate
//!                                          ▼
//!                                          UPSERT blobs (LWW by relayed_at)
//!                                         COMMIT ──► Applied
//! ```
//!
//! # Ordering
//!
//! Applies for one origin are serialized through an async lane (a mutex per
//! origin in a [`DashMap`]); different origins proceed in parallel. The
//! `blobs` upsert only overwrites a row with a newer `relayed_at`, and deletes
//! are tombstones, so the materialized state is the log-order result even when
//! push and sweep deliver one origin's operations out of order.
//!
//! # Local Writes
//!
//! [`ReplicationEngine::record_local`] takes this node's own lane, stamps a
//! strictly increasing `relayed_at` (wall clock, clamped to `last + 1ns`),
//! applies it, then hands the encoded operation to every registered
//! [`Outbox`] for push and to the live feed. The lane is held until fan-out
//! finishes, so commit order, `bulk_log` order and push order all agree.

use crate::error::{BoxFuture, ReplicationError, Result};
use crate::operation::{from_nanos, to_nanos, BlobRecord, OpType, Operation, Record, BLOBS_TABLE};
use crate::peer::Outbox;
use crate::resilience::RetryPolicy;
use crate::store::execute_with_retry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

/// Buffered local operations per live-feed subscriber before it lags.
const FEED_CAPACITY: usize = 1024;

/// Result of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First time this `(host, relayed_at)` was seen; effect committed.
    Applied,
    /// Already in the log; nothing changed.
    Duplicate,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
        }
    }
}

/// Where replicated operations are applied.
///
/// Implemented by [`ReplicationEngine`]; peer clients depend on the trait so
/// sweep semantics can be tested against scripted failures.
pub trait OperationSink: Send + Sync + 'static {
    fn apply<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, ApplyOutcome>;
}

type OpRow = (String, i64, String, String, String);

fn row_to_operation((host, nanos, op_type, table, payload): OpRow) -> Result<Operation> {
    let payload = serde_json::from_str(&payload).map_err(|e| {
        ReplicationError::Internal(format!("stored payload for {}@{} is not JSON: {}", host, nanos, e))
    })?;
    Ok(Operation {
        host,
        relayed_at: from_nanos(nanos),
        op_type: OpType::parse(&op_type),
        table,
        payload,
    })
}

/// An operation checked and encoded for the store.
struct Prepared {
    record: Record,
    origin: String,
    nanos: i64,
    size: i64,
    payload: String,
}

fn prepare(op: &Operation) -> Result<Prepared> {
    let record = op.decode_record()?;
    let size = match &record {
        Record::Blob(blob) => i64::try_from(blob.size).map_err(|_| {
            ReplicationError::malformed(format!("blob size {} out of range for {}", blob.size, blob.key))
        })?,
    };
    let payload = serde_json::to_string(&op.payload)
        .map_err(|e| ReplicationError::Internal(format!("payload encode failed: {}", e)))?;
    Ok(Prepared {
        record,
        origin: op.host.trim_end_matches('/').to_string(),
        nanos: op.relayed_at_nanos()?,
        size,
        payload,
    })
}

/// Applies operations to the node database and serves the local log.
pub struct ReplicationEngine {
    pool: SqlitePool,
    host: String,
    lanes: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Last `relayed_at` (nanos) issued or seen for this node's own origin.
    clock: parking_lot::Mutex<i64>,
    outboxes: parking_lot::RwLock<Vec<Outbox>>,
    feed: broadcast::Sender<Operation>,
    retry: RetryPolicy,
}

impl ReplicationEngine {
    /// Build the engine over an opened pool. The local clock resumes from the
    /// newest persisted operation of this origin.
    pub async fn new(pool: SqlitePool, host: &str, retry: RetryPolicy) -> Result<Self> {
        let host = host.trim_end_matches('/').to_string();
        let (last,): (Option<i64>,) = execute_with_retry("engine_load_clock", || async {
            sqlx::query_as("SELECT MAX(relayed_at) FROM ops WHERE host = ?")
                .bind(&host)
                .fetch_one(&pool)
                .await
        })
        .await?;

        Ok(Self {
            pool,
            host,
            lanes: DashMap::new(),
            clock: parking_lot::Mutex::new(last.unwrap_or(0)),
            outboxes: parking_lot::RwLock::new(Vec::new()),
            feed: broadcast::channel(FEED_CAPACITY).0,
            retry,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a peer outbox to receive every future local operation.
    pub fn register_outbox(&self, outbox: Outbox) {
        debug!(peer = %outbox.host(), "Outbox registered");
        self.outboxes.write().push(outbox);
    }

    pub fn outbox_count(&self) -> usize {
        self.outboxes.read().len()
    }

    /// Follow local operations as they commit, in `relayed_at` order.
    ///
    /// A subscriber that falls more than a buffer behind sees
    /// [`broadcast::error::RecvError::Lagged`] and should resume from
    /// `bulk_log`.
    pub fn subscribe(&self) -> broadcast::Receiver<Operation> {
        self.feed.subscribe()
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.clock.lock();
        let now = to_nanos(&Utc::now()).unwrap_or(*last + 1);
        let next = now.max(*last + 1);
        *last = next;
        from_nanos(next)
    }

    fn observe_own(&self, nanos: i64) {
        let mut last = self.clock.lock();
        if nanos > *last {
            *last = nanos;
        }
    }

    fn lane(&self, origin: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes.entry(origin.to_string()).or_default().clone()
    }

    // =========================================================================
    // Apply
    // =========================================================================

    /// Apply one operation exactly once.
    ///
    /// Returns [`ReplicationError::Malformed`] for operations that can never
    /// apply; store errors keep their retryability.
    #[instrument(skip(self, op), fields(op = %op.id()))]
    pub async fn apply(&self, op: &Operation) -> Result<ApplyOutcome> {
        let prepared = match prepare(op) {
            Ok(prepared) => prepared,
            Err(e) => {
                crate::metrics::record_apply(&op.host, "malformed");
                return Err(e);
            }
        };

        let lane = self.lane(&prepared.origin);
        let _guard = lane.lock().await;
        self.commit(op, &prepared).await
    }

    /// Write a prepared operation. The caller holds the origin's lane.
    async fn commit(&self, op: &Operation, prepared: &Prepared) -> Result<ApplyOutcome> {
        let result = execute_with_retry("engine_apply", || self.apply_in_tx(op, prepared))
            .await
            .map_err(ReplicationError::from);

        match &result {
            Ok(outcome) => {
                if prepared.origin == self.host {
                    self.observe_own(prepared.nanos);
                }
                crate::metrics::record_apply(&prepared.origin, outcome.as_str());
                debug!(outcome = outcome.as_str(), "Operation applied");
            }
            Err(e) => {
                crate::metrics::record_apply(&prepared.origin, "error");
                warn!(error = %e, "Operation apply failed");
            }
        }
        result
    }

    async fn apply_in_tx(
        &self,
        op: &Operation,
        prepared: &Prepared,
    ) -> std::result::Result<ApplyOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ops (host, relayed_at, op_type, tbl, payload)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(host, relayed_at) DO NOTHING
            "#,
        )
        .bind(&prepared.origin)
        .bind(prepared.nanos)
        .bind(op.op_type.as_str())
        .bind(&op.table)
        .bind(&prepared.payload)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ApplyOutcome::Duplicate);
        }

        match &prepared.record {
            Record::Blob(blob) => {
                let deleted = i64::from(op.op_type == OpType::Delete);
                sqlx::query(
                    r#"
                    INSERT INTO blobs (key, host, size, relayed_at, deleted)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(key, host) DO UPDATE SET
                        size = excluded.size,
                        relayed_at = excluded.relayed_at,
                        deleted = excluded.deleted
                    WHERE excluded.relayed_at > blobs.relayed_at
                    "#,
                )
                .bind(&blob.key)
                .bind(&prepared.origin)
                .bind(prepared.size)
                .bind(prepared.nanos)
                .bind(deleted)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Create, apply and fan out a new local operation.
    ///
    /// The origin lane is held from stamping through commit and fan-out, so
    /// local operations become visible to `bulk_log` in `relayed_at` order.
    /// A sweeper that has seen `t2` can never later miss a `t1 < t2`.
    pub async fn record_local(
        &self,
        op_type: OpType,
        table: &str,
        payload: serde_json::Value,
    ) -> Result<Operation> {
        let lane = self.lane(&self.host);
        let _guard = lane.lock().await;

        let op = Operation {
            host: self.host.clone(),
            relayed_at: self.next_timestamp(),
            op_type,
            table: table.to_string(),
            payload,
        };
        let prepared = prepare(&op)?;

        let engine = self;
        let (op_ref, prepared_ref) = (&op, &prepared);
        self.retry
            .run("record_local", move || engine.commit(op_ref, prepared_ref))
            .await?;
        crate::metrics::record_local_op(op_type.as_str());

        let bytes = op.encode()?;
        let outboxes = self.outboxes.read();
        for outbox in outboxes.iter() {
            outbox.send(bytes.clone());
        }
        debug!(op = %op.id(), peers = outboxes.len(), "Local operation fanned out");
        drop(outboxes);
        // No subscribers is fine
        let _ = self.feed.send(op.clone());
        Ok(op)
    }

    /// Record that this node now holds `key`.
    pub async fn record_blob_stored(&self, key: &str, size: u64) -> Result<Operation> {
        let record = BlobRecord {
            key: key.to_string(),
            host: self.host.clone(),
            size,
        };
        self.record_local(OpType::Create, BLOBS_TABLE, record.to_payload())
            .await
    }

    /// Record that this node no longer holds `key`.
    pub async fn record_blob_deleted(&self, key: &str) -> Result<Operation> {
        let record = BlobRecord {
            key: key.to_string(),
            host: self.host.clone(),
            size: 0,
        };
        self.record_local(OpType::Delete, BLOBS_TABLE, record.to_payload())
            .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Operations originated by this node with `relayed_at > after`,
    /// ascending, at most `limit`.
    pub async fn bulk_log(&self, after: DateTime<Utc>, limit: usize) -> Result<Vec<Operation>> {
        let after = to_nanos(&after).unwrap_or(i64::MIN);
        let pool = &self.pool;
        let host = &self.host;
        let rows: Vec<OpRow> = execute_with_retry("engine_bulk_log", || async move {
            sqlx::query_as(
                r#"
                SELECT host, relayed_at, op_type, tbl, payload FROM ops
                WHERE host = ? AND relayed_at > ?
                ORDER BY relayed_at ASC
                LIMIT ?
                "#,
            )
            .bind(host)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(pool)
            .await
        })
        .await?;

        rows.into_iter().map(row_to_operation).collect()
    }

    /// Hosts currently recorded as holding `key`, sorted.
    pub async fn blob_locations(&self, key: &str) -> Result<Vec<String>> {
        let pool = &self.pool;
        let rows: Vec<(String,)> = execute_with_retry("engine_blob_locations", || async move {
            sqlx::query_as("SELECT host FROM blobs WHERE key = ? AND deleted = 0 ORDER BY host")
                .bind(key)
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(rows.into_iter().map(|(h,)| h).collect())
    }

    /// Keys with at least one live holder, ascending, strictly after `after`.
    pub async fn known_keys(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let pool = &self.pool;
        let after = after.unwrap_or("");
        let rows: Vec<(String,)> = execute_with_retry("engine_known_keys", || async move {
            sqlx::query_as(
                "SELECT DISTINCT key FROM blobs WHERE deleted = 0 AND key > ? ORDER BY key LIMIT ?",
            )
            .bind(after)
            .bind(limit as i64)
            .fetch_all(pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    /// Total operations in the log (all origins).
    pub async fn op_count(&self) -> Result<u64> {
        let pool = &self.pool;
        let (count,): (i64,) = execute_with_retry("engine_op_count", || async move {
            sqlx::query_as("SELECT COUNT(*) FROM ops").fetch_one(pool).await
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Live `(key, host)` location records.
    pub async fn blob_record_count(&self) -> Result<u64> {
        let pool = &self.pool;
        let (count,): (i64,) = execute_with_retry("engine_blob_count", || async move {
            sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE deleted = 0")
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Live blobs this node itself has recorded as holding.
    pub async fn local_blob_count(&self) -> Result<u64> {
        let pool = &self.pool;
        let host = &self.host;
        let (count,): (i64,) = execute_with_retry("engine_local_blob_count", || async move {
            sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE host = ? AND deleted = 0")
                .bind(host)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Whether `(host, relayed_at)` is in the log.
    #[cfg(test)]
    pub(crate) async fn has_op(&self, host: &str, relayed_at: DateTime<Utc>) -> Result<bool> {
        let pool = &self.pool;
        let host = host.trim_end_matches('/');
        let nanos = to_nanos(&relayed_at).unwrap_or(i64::MIN);
        let row: Option<(i64,)> = execute_with_retry("engine_has_op", || async move {
            sqlx::query_as("SELECT 1 FROM ops WHERE host = ? AND relayed_at = ?")
                .bind(host)
                .bind(nanos)
                .fetch_optional(pool)
                .await
        })
        .await?;
        Ok(row.is_some())
    }
}

impl OperationSink for ReplicationEngine {
    fn apply<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(ReplicationEngine::apply(self, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::content_key;
    use crate::config::StoreConfig;
    use crate::store::open_pool;
    use serde_json::json;

    const A: &str = "http://a:4000";
    const B: &str = "http://b:4000";

    async fn engine(host: &str) -> ReplicationEngine {
        let pool = open_pool(&StoreConfig::in_memory()).await.unwrap();
        ReplicationEngine::new(pool, host, RetryPolicy::testing()).await.unwrap()
    }

    fn blob_op(host: &str, nanos: i64, op_type: OpType, key: &str) -> Operation {
        Operation {
            host: host.to_string(),
            relayed_at: from_nanos(nanos),
            op_type,
            table: BLOBS_TABLE.to_string(),
            payload: json!({"key": key, "host": host, "size": 7}),
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let engine = engine(A).await;
        let key = content_key(b"x");
        let op = blob_op(B, 100, OpType::Create, &key);

        assert_eq!(engine.apply(&op).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(engine.apply(&op).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(engine.op_count().await.unwrap(), 1);
        assert_eq!(engine.blob_locations(&key).await.unwrap(), vec![B]);
    }

    #[tokio::test]
    async fn test_out_of_order_delete_wins_by_relayed_at() {
        let engine = engine(A).await;
        let key = content_key(b"x");
        let create = blob_op(B, 100, OpType::Create, &key);
        let delete = blob_op(B, 200, OpType::Delete, &key);

        // Delete arrives first (sweep), create later (late push)
        engine.apply(&delete).await.unwrap();
        engine.apply(&create).await.unwrap();

        assert!(engine.blob_locations(&key).await.unwrap().is_empty());
        assert_eq!(engine.op_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recreate_after_delete() {
        let engine = engine(A).await;
        let key = content_key(b"x");
        engine.apply(&blob_op(B, 100, OpType::Create, &key)).await.unwrap();
        engine.apply(&blob_op(B, 200, OpType::Delete, &key)).await.unwrap();
        engine.apply(&blob_op(B, 300, OpType::Update, &key)).await.unwrap();
        assert_eq!(engine.blob_locations(&key).await.unwrap(), vec![B]);
        assert_eq!(engine.known_keys(None, 10).await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_malformed_apply_has_no_effect() {
        let engine = engine(A).await;
        let mut op = blob_op(B, 100, OpType::Create, &content_key(b"x"));
        op.table = "users".to_string();

        let err = engine.apply(&op).await.unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(engine.op_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_applies() {
        let engine = Arc::new(engine(A).await);
        let op = blob_op(B, 100, OpType::Create, &content_key(b"x"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let op = op.clone();
            handles.push(tokio::spawn(async move { engine.apply(&op).await.unwrap() }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(engine.op_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_local_timestamps_strictly_increase() {
        let engine = engine(A).await;
        let mut last = None;
        for i in 0..20u8 {
            let op = engine
                .record_blob_stored(&content_key(&[i]), 1)
                .await
                .unwrap();
            if let Some(prev) = last {
                assert!(op.relayed_at > prev);
            }
            last = Some(op.relayed_at);
        }
        assert_eq!(engine.op_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_record_local_fans_out_to_outboxes() {
        let engine = engine(A).await;
        let (outbox_b, mut rx_b) = Outbox::new(B, 4);
        let (outbox_c, mut rx_c) = Outbox::new("http://c:4000", 4);
        engine.register_outbox(outbox_b);
        engine.register_outbox(outbox_c);

        let op = engine.record_blob_stored(&content_key(b"x"), 1).await.unwrap();

        let pushed_b = Operation::decode(&rx_b.recv().await.unwrap()).unwrap();
        let pushed_c = Operation::decode(&rx_c.recv().await.unwrap()).unwrap();
        assert_eq!(pushed_b, op);
        assert_eq!(pushed_c, op);
    }

    #[tokio::test]
    async fn test_bulk_log_serves_own_ops_ascending() {
        let engine = engine(A).await;
        // Foreign op is never served
        engine
            .apply(&blob_op(B, 1, OpType::Create, &content_key(b"b")))
            .await
            .unwrap();

        let mut local = Vec::new();
        for i in 0..5u8 {
            local.push(engine.record_blob_stored(&content_key(&[i]), 1).await.unwrap());
        }

        let all = engine.bulk_log(crate::operation::zero_time(), 100).await.unwrap();
        assert_eq!(all, local);

        let after_second = engine.bulk_log(local[1].relayed_at, 2).await.unwrap();
        assert_eq!(after_second, local[2..4].to_vec());

        let tail = engine.bulk_log(local[4].relayed_at, 100).await.unwrap();
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_clock_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join("node.db").to_string_lossy().to_string(),
            wal_mode: true,
            blob_dir: "blobs".to_string(),
        };
        let pool = open_pool(&config).await.unwrap();
        let engine = ReplicationEngine::new(pool.clone(), A, RetryPolicy::testing())
            .await
            .unwrap();

        // An op stamped far in the future (clock skew on a previous run)
        let future = blob_op(A, i64::MAX / 2, OpType::Create, &content_key(b"f"));
        engine.apply(&future).await.unwrap();
        drop(engine);

        let engine = ReplicationEngine::new(pool, A, RetryPolicy::testing())
            .await
            .unwrap();
        let op = engine.record_blob_stored(&content_key(b"g"), 1).await.unwrap();
        assert!(op.relayed_at > future.relayed_at);
    }

    #[tokio::test]
    async fn test_has_op_and_counts() {
        let engine = engine(A).await;
        let key = content_key(b"x");
        let op = engine.record_blob_stored(&key, 3).await.unwrap();
        assert!(engine.has_op(A, op.relayed_at).await.unwrap());
        assert!(!engine.has_op(B, op.relayed_at).await.unwrap());
        assert_eq!(engine.blob_record_count().await.unwrap(), 1);

        engine.record_blob_deleted(&key).await.unwrap();
        assert_eq!(engine.blob_record_count().await.unwrap(), 0);
        assert_eq!(engine.op_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_record_local_commits_in_stamp_order() {
        let engine = Arc::new(engine(A).await);
        let mut feed = engine.subscribe();

        let mut handles = Vec::new();
        for i in 0..32u8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.record_blob_stored(&content_key(&[i]), 1).await.unwrap()
            }));
        }
        let mut recorded = Vec::new();
        for handle in handles {
            recorded.push(handle.await.unwrap());
        }

        // The feed reports commit order; it must match stamp order
        let mut committed = Vec::new();
        for _ in 0..recorded.len() {
            committed.push(feed.recv().await.unwrap());
        }
        assert!(committed.windows(2).all(|w| w[0].relayed_at < w[1].relayed_at));

        let log = engine.bulk_log(crate::operation::zero_time(), 100).await.unwrap();
        assert_eq!(log, committed);
        for op in &recorded {
            assert!(log.contains(op));
        }
    }

    #[tokio::test]
    async fn test_sweeper_cursor_never_skips_concurrent_local_ops() {
        let engine = Arc::new(engine(A).await);

        let writer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                for i in 0..64u8 {
                    engine.record_blob_stored(&content_key(&[i]), 1).await.unwrap();
                }
            })
        };

        // Page through the log while writes race it, like a peer sweeping
        let mut cursor = crate::operation::zero_time();
        let mut seen = Vec::new();
        loop {
            let finished = writer.is_finished();
            let page = engine.bulk_log(cursor, 5).await.unwrap();
            if page.is_empty() && finished {
                break;
            }
            if let Some(last) = page.last() {
                cursor = last.relayed_at;
            }
            seen.extend(page);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        assert_eq!(seen.len(), 64);

        assert_eq!(seen, engine.bulk_log(crate::operation::zero_time(), 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_blob_size_is_malformed() {
        let engine = engine(A).await;
        let mut op = blob_op(B, 100, OpType::Create, &content_key(b"x"));
        op.payload = json!({"key": content_key(b"x"), "host": B, "size": u64::MAX});

        let err = engine.apply(&op).await.unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(engine.op_count().await.unwrap(), 0);
        assert!(engine.blob_locations(&content_key(b"x")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_without_subscribers_does_not_block_writes() {
        let engine = engine(A).await;
        engine.record_blob_stored(&content_key(b"x"), 1).await.unwrap();

        let mut feed = engine.subscribe();
        let op = engine.record_blob_stored(&content_key(b"y"), 1).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), op);
    }

    #[tokio::test]
    async fn test_known_keys_paging() {
        let engine = engine(A).await;
        let mut keys: Vec<String> = (0..5u8).map(|i| content_key(&[i])).collect();
        for key in &keys {
            engine.record_blob_stored(key, 1).await.unwrap();
        }
        keys.sort();

        let first = engine.known_keys(None, 2).await.unwrap();
        assert_eq!(first, keys[..2].to_vec());
        let rest = engine.known_keys(Some(&first[1]), 10).await.unwrap();
        assert_eq!(rest, keys[2..].to_vec());
    }
}
