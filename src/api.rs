// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Internal HTTP API served by every node.
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | POST | `/internal/crud/receive` | body signature by the op's origin |
//! | GET | `/internal/crud/bulk?after=` | signed nonce |
//! | GET | `/internal/crud/stream?after=` | signed nonce |
//! | GET | `/internal/health` | none |
//! | GET | `/internal/health/peers` | none |
//! | GET | `/internal/status` | none |
//! | GET | `/internal/blobs/problems` | none |
//! | GET | `/internal/blobs/location/:key` | none |
//! | GET | `/internal/blobs/info/:key` | none |
//! | GET | `/internal/blobs/:key` | none |
//! | POST | `/internal/blobs` | body signature by a known peer |
//!
//! Errors are `{"error": "..."}` with the status from [`error_status`].

use crate::blob_store::BlobStore;
use crate::coordinator::Node;
use crate::error::ReplicationError;
use crate::operation::{format_rfc3339_nanos, parse_rfc3339, zero_time, Operation};
use crate::signing::{HOST_HEADER, SIGNATURE_HEADER};
use crate::transport::PeerTransport;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Request paths, shared with [`crate::transport::HttpTransport`].
pub mod paths {
    pub const RECEIVE: &str = "/internal/crud/receive";
    pub const BULK: &str = "/internal/crud/bulk";
    pub const STREAM: &str = "/internal/crud/stream";
    pub const HEALTH: &str = "/internal/health";
    pub const HEALTH_PEERS: &str = "/internal/health/peers";
    pub const STATUS: &str = "/internal/status";
    pub const BLOBS: &str = "/internal/blobs";
    pub const BLOB_PROBLEMS: &str = "/internal/blobs/problems";
    pub const BLOB_LOCATION: &str = "/internal/blobs/location/:key";
    pub const BLOB_INFO: &str = "/internal/blobs/info/:key";
    pub const BLOB: &str = "/internal/blobs/:key";

    /// Concrete path for one blob.
    pub fn blob(key: &str) -> String {
        format!("{}/{}", BLOBS, key)
    }
}

/// Largest request body accepted (blob uploads).
pub const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

type SharedNode<T, B> = Arc<Node<T, B>>;

/// Build the router for `node`.
pub fn router<T: PeerTransport, B: BlobStore>(node: SharedNode<T, B>) -> Router {
    Router::new()
        .route(paths::RECEIVE, post(receive::<T, B>))
        .route(paths::BULK, get(bulk::<T, B>))
        .route(paths::STREAM, get(stream::<T, B>))
        .route(paths::HEALTH, get(health::<T, B>))
        .route(paths::HEALTH_PEERS, get(health_peers::<T, B>))
        .route(paths::STATUS, get(status::<T, B>))
        .route(paths::BLOBS, post(upload_blob::<T, B>))
        .route(paths::BLOB_PROBLEMS, get(blob_problems::<T, B>))
        .route(paths::BLOB_LOCATION, get(blob_location::<T, B>))
        .route(paths::BLOB_INFO, get(blob_info::<T, B>))
        .route(paths::BLOB, get(get_blob::<T, B>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(node)
}

/// HTTP status for a failed request.
pub fn error_status(e: &ReplicationError) -> StatusCode {
    match e {
        ReplicationError::Malformed(_) => StatusCode::BAD_REQUEST,
        ReplicationError::Auth(_) => StatusCode::UNAUTHORIZED,
        ReplicationError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &ReplicationError) -> Response {
    let status = error_status(e);
    if status.is_server_error() {
        error!(error = %e, status = status.as_u16(), "Request failed");
    } else {
        debug!(error = %e, status = status.as_u16(), "Request rejected");
    }
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str, ReplicationError> {
    headers
        .get(name)
        .ok_or_else(|| ReplicationError::Auth(format!("missing {} header", name)))?
        .to_str()
        .map_err(|_| ReplicationError::Auth(format!("{} header is not ASCII", name)))
}

/// Check the body signature headers; returns the signer.
fn verify_signed_body<T: PeerTransport, B: BlobStore>(
    node: &Node<T, B>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, ReplicationError> {
    let signer = header(headers, HOST_HEADER)?;
    let signature = header(headers, SIGNATURE_HEADER)?;
    node.peer_keys().verify_body(signer, body, signature)?;
    Ok(signer.trim_end_matches('/').to_string())
}

// =============================================================================
// Replication
// =============================================================================

/// POST /internal/crud/receive - apply one pushed operation
async fn receive<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signer = match verify_signed_body(&node, &headers, &body) {
        Ok(signer) => signer,
        Err(e) => {
            warn!(error = %e, "Rejected unsigned push");
            return error_response(&e);
        }
    };

    let op = match Operation::decode(&body) {
        Ok(op) => op,
        Err(e) => return error_response(&e),
    };
    if op.host.trim_end_matches('/') != signer {
        let e = ReplicationError::Auth(format!("{} cannot push operations originated by {}", signer, op.host));
        warn!(error = %e, "Rejected push");
        return error_response(&e);
    }

    match node.engine().apply(&op).await {
        Ok(outcome) => (StatusCode::OK, Json(json!({ "outcome": outcome.as_str() }))).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct BulkQuery {
    after: Option<String>,
}

impl BulkQuery {
    fn after(&self) -> Result<DateTime<Utc>, ReplicationError> {
        match self.after.as_deref().filter(|a| !a.is_empty()) {
            Some(raw) => parse_rfc3339(raw),
            None => Ok(zero_time()),
        }
    }
}

/// Check the nonce `Authorization` header; returns the requesting peer.
fn verify_nonce<T: PeerTransport, B: BlobStore>(
    node: &Node<T, B>,
    headers: &HeaderMap,
) -> Result<String, ReplicationError> {
    header(headers, AUTHORIZATION.as_str()).and_then(|h| node.peer_keys().verify_nonce_header(h))
}

/// GET /internal/crud/bulk?after= - this node's own operations after a timestamp
async fn bulk<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    headers: HeaderMap,
    Query(query): Query<BulkQuery>,
) -> Response {
    let requester = match verify_nonce(&node, &headers) {
        Ok(host) => host,
        Err(e) => {
            warn!(error = %e, "Rejected bulk request");
            return error_response(&e);
        }
    };

    let after = match query.after() {
        Ok(t) => t,
        Err(e) => return error_response(&e),
    };

    let limit = node.config().settings.sweep.bulk_batch_size;
    match node.engine().bulk_log(after, limit).await {
        Ok(ops) => {
            debug!(peer = %requester, count = ops.len(), "Served bulk request");
            (StatusCode::OK, Json(ops)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /internal/crud/stream?after= - this node's own operations as server-sent events
///
/// Replays the log after `after` in bulk-sized pages, then follows new local
/// operations live. Each event is `op` with the operation as JSON and its
/// `relayed_at` as the event id. A follower that lags the live feed is caught
/// up from the log again, so no operation is skipped.
async fn stream<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    headers: HeaderMap,
    Query(query): Query<BulkQuery>,
) -> Response {
    let requester = match verify_nonce(&node, &headers) {
        Ok(host) => host,
        Err(e) => {
            warn!(error = %e, "Rejected stream request");
            return error_response(&e);
        }
    };

    let after = match query.after() {
        Ok(t) => t,
        Err(e) => return error_response(&e),
    };

    debug!(peer = %requester, after = %format_rfc3339_nanos(&after), "Streaming operations");
    let follow = Follow {
        // Subscribe before the first page so nothing falls between them
        feed: node.engine().subscribe(),
        shutdown: node.shutdown_receiver(),
        node,
        peer: requester,
        cursor: after,
        backlog: VecDeque::new(),
        catching_up: true,
    };
    let events = futures::stream::unfold(follow, |mut follow| async move {
        let op = follow.next_op().await?;
        Some((op, follow))
    })
    .map(|op| {
        Event::default()
            .event("op")
            .id(format_rfc3339_nanos(&op.relayed_at))
            .json_data(&op)
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// One stream follower: log pages first, then the live feed.
struct Follow<T: PeerTransport, B: BlobStore> {
    node: SharedNode<T, B>,
    feed: broadcast::Receiver<Operation>,
    shutdown: watch::Receiver<bool>,
    peer: String,
    /// `relayed_at` of the last operation sent.
    cursor: DateTime<Utc>,
    backlog: VecDeque<Operation>,
    catching_up: bool,
}

impl<T: PeerTransport, B: BlobStore> Follow<T, B> {
    async fn next_op(&mut self) -> Option<Operation> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            if let Some(op) = self.backlog.pop_front() {
                self.cursor = op.relayed_at;
                return Some(op);
            }

            if self.catching_up {
                let limit = self.node.config().settings.sweep.bulk_batch_size;
                match self.node.engine().bulk_log(self.cursor, limit).await {
                    Ok(page) => {
                        self.catching_up = page.len() >= limit;
                        self.backlog.extend(page);
                    }
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "Stream catch-up failed, closing");
                        return None;
                    }
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.changed() => return None,

                received = self.feed.recv() => match received {
                    // Already sent from the log
                    Ok(op) if op.relayed_at <= self.cursor => continue,
                    Ok(op) => {
                        self.cursor = op.relayed_at;
                        return Some(op);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(peer = %self.peer, missed, "Stream follower lagged, catching up from log");
                        self.catching_up = true;
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

// =============================================================================
// Health and status
// =============================================================================

/// GET /internal/health - this node's health report
async fn health<T: PeerTransport, B: BlobStore>(State(node): State<SharedNode<T, B>>) -> Response {
    if let Some(report) = node.health().self_report() {
        return (StatusCode::OK, Json(report)).into_response();
    }
    match node.broadcaster().build_report().await {
        Ok(report) => {
            node.health().set_self_report(report.clone());
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /internal/health/peers - health of every peer as seen from here
async fn health_peers<T: PeerTransport, B: BlobStore>(State(node): State<SharedNode<T, B>>) -> Response {
    (StatusCode::OK, Json(node.health().peers())).into_response()
}

/// GET /internal/status - node state, peer clients and cursors
async fn status<T: PeerTransport, B: BlobStore>(State(node): State<SharedNode<T, B>>) -> Response {
    match node.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// Blobs
// =============================================================================

/// GET /internal/blobs/problems - last repair report
async fn blob_problems<T: PeerTransport, B: BlobStore>(State(node): State<SharedNode<T, B>>) -> Response {
    // null until the first cycle completes
    (StatusCode::OK, Json(node.repair().last_report())).into_response()
}

/// GET /internal/blobs/location/:key - recorded holders and desired placement
async fn blob_location<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    Path(key): Path<String>,
) -> Response {
    match node.blob_location(&key).await {
        Ok(location) => (StatusCode::OK, Json(location)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /internal/blobs/info/:key - local presence and size
async fn blob_info<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    Path(key): Path<String>,
) -> Response {
    match node.blob_info(&key).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /internal/blobs/:key - raw bytes
async fn get_blob<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    Path(key): Path<String>,
) -> Response {
    match node.get_blob(&key).await {
        Ok(Some(data)) => (StatusCode::OK, [(CONTENT_TYPE, "application/octet-stream")], data).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "blob not found", "key": key }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /internal/blobs - store a blob copied by a peer
async fn upload_blob<T: PeerTransport, B: BlobStore>(
    State(node): State<SharedNode<T, B>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signer = match verify_signed_body(&node, &headers, &body) {
        Ok(signer) => signer,
        Err(e) => {
            warn!(error = %e, "Rejected unsigned blob upload");
            return error_response(&e);
        }
    };

    match node.store_blob(body).await {
        Ok(key) => {
            debug!(peer = %signer, key = %key, "Accepted blob upload");
            (StatusCode::OK, Json(json!({ "key": key }))).into_response()
        }
        Err(e) => error_response(&e),
    }
}
