// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite pool setup and schema.
//!
//! One database holds everything the node must remember across restarts:
//!
//! | Table | Key | Contents |
//! |-------|-----|----------|
//! | `ops` | `(host, relayed_at)` | Append-only operation log (local and replicated) |
//! | `blobs` | `(key, host)` | Materialized blob locations, last-writer-wins by `relayed_at` |
//! | `cursors` | `peer_host` | Last applied `relayed_at` per peer |
//!
//! `relayed_at` is stored as i64 nanoseconds since the Unix epoch so ordering
//! comparisons happen in SQL.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. [`execute_with_retry`] retries those with a short exponential
//! backoff; other errors are returned immediately.

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open the node database and run migrations.
///
/// `":memory:"` opens a private in-memory database on a single connection
/// (each SQLite memory connection would otherwise be its own database).
pub async fn open_pool(config: &StoreConfig) -> Result<SqlitePool> {
    let pool = if config.is_in_memory() {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        if let Some(parent) = std::path::Path::new(&config.sqlite_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ReplicationError::Config(format!("Cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let journal = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?
    };

    migrate(&pool).await?;
    info!(path = %config.sqlite_path, wal = config.wal_mode, "Node store opened");
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS ops (
            host TEXT NOT NULL,
            relayed_at INTEGER NOT NULL,
            op_type TEXT NOT NULL,
            tbl TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (host, relayed_at)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            key TEXT NOT NULL,
            host TEXT NOT NULL,
            size INTEGER NOT NULL,
            relayed_at INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (key, host)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS blobs_live_key ON blobs (deleted, key)",
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            peer_host TEXT PRIMARY KEY,
            relayed_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Force flush WAL to the main database (for clean shutdown).
pub async fn checkpoint(pool: &SqlitePool) -> Result<()> {
    execute_with_retry("store_checkpoint", || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
    })
    .await?;
    debug!("WAL checkpoint complete");
    Ok(())
}
