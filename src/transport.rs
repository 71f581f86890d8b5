// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound peer transport.
//!
//! [`PeerTransport`] is everything a node asks of another node. The default
//! [`HttpTransport`] speaks the internal HTTP API with `reqwest` and signs
//! every request with this node's key:
//!
//! | Call | Request | Auth |
//! |------|---------|------|
//! | `push_op` | `POST /internal/crud/receive` | body signature |
//! | `fetch_bulk` | `GET /internal/crud/bulk?after=` | signed nonce |
//! | `fetch_health` | `GET /internal/health` | none |
//! | `fetch_blob` | `GET /internal/blobs/:key` | none |
//! | `store_blob` | `POST /internal/blobs` | body signature |
//!
//! Non-2xx answers become [`ReplicationError::RemoteRejected`]; connect,
//! timeout and body errors become [`ReplicationError::Transport`]. Nothing is
//! retried here: callers own their retry schedule.

use crate::api::paths;
use crate::config::NodeSettings;
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::health::HealthReport;
use crate::operation::{format_rfc3339_nanos, Operation};
use crate::signing::{NodeSigner, HOST_HEADER, SIGNATURE_HEADER};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// What a node needs from its peers.
pub trait PeerTransport: Send + Sync + 'static {
    /// Deliver one encoded operation to `peer`.
    fn push_op<'a>(&'a self, peer: &'a str, body: Bytes) -> BoxFuture<'a, ()>;

    /// Operations originated by `peer` with `relayed_at > after`, in the
    /// order the peer sent them.
    fn fetch_bulk<'a>(&'a self, peer: &'a str, after: DateTime<Utc>) -> BoxFuture<'a, Vec<Operation>>;

    fn fetch_health<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, HealthReport>;

    /// Blob bytes, or `None` if the peer does not have it.
    fn fetch_blob<'a>(&'a self, peer: &'a str, key: &'a str) -> BoxFuture<'a, Option<Bytes>>;

    /// Ask `peer` to store a blob copy.
    fn store_blob<'a>(&'a self, peer: &'a str, data: Bytes) -> BoxFuture<'a, ()>;
}

/// Request timeouts per call type.
#[derive(Debug, Clone)]
pub struct TransportTimeouts {
    pub push: Duration,
    pub bulk: Duration,
    pub health: Duration,
    pub transfer: Duration,
}

impl TransportTimeouts {
    pub fn from_settings(settings: &NodeSettings) -> Self {
        Self {
            push: settings.push.request_timeout_duration(),
            bulk: settings.sweep.request_timeout_duration(),
            health: settings.health.request_timeout_duration(),
            transfer: settings.repair.transfer_timeout_duration(),
        }
    }
}

/// Signed HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
    signer: Arc<NodeSigner>,
    timeouts: TransportTimeouts,
}

fn url(peer: &str, path: &str) -> String {
    format!("{}{}", peer.trim_end_matches('/'), path)
}

fn check_status(peer: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ReplicationError::RemoteRejected {
            peer: peer.to_string(),
            status: status.as_u16(),
        })
    }
}

impl HttpTransport {
    pub fn new(signer: Arc<NodeSigner>, timeouts: TransportTimeouts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("blobmesh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReplicationError::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            signer,
            timeouts,
        })
    }

    pub fn signer(&self) -> &NodeSigner {
        &self.signer
    }

    async fn post_signed(&self, peer: &str, path: &str, body: Bytes, content_type: &str, timeout: Duration) -> Result<()> {
        let signature = self.signer.sign_hex(&body);
        let response = self
            .client
            .post(url(peer, path))
            .timeout(timeout)
            .header(CONTENT_TYPE, content_type)
            .header(HOST_HEADER, self.signer.host())
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| ReplicationError::transport(peer, e))?;
        check_status(peer, response)?;
        Ok(())
    }
}

impl PeerTransport for HttpTransport {
    fn push_op<'a>(&'a self, peer: &'a str, body: Bytes) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_signed(peer, paths::RECEIVE, body, "application/json", self.timeouts.push)
                .await
        })
    }

    fn fetch_bulk<'a>(&'a self, peer: &'a str, after: DateTime<Utc>) -> BoxFuture<'a, Vec<Operation>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url(peer, paths::BULK))
                .timeout(self.timeouts.bulk)
                .query(&[("after", format_rfc3339_nanos(&after))])
                .header(AUTHORIZATION, self.signer.nonce_header())
                .send()
                .await
                .map_err(|e| ReplicationError::transport(peer, e))?;
            let response = check_status(peer, response)?;
            response
                .json::<Vec<Operation>>()
                .await
                .map_err(|e| ReplicationError::transport(peer, format!("undecodable bulk response: {}", e)))
        })
    }

    fn fetch_health<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, HealthReport> {
        Box::pin(async move {
            let response = self
                .client
                .get(url(peer, paths::HEALTH))
                .timeout(self.timeouts.health)
                .send()
                .await
                .map_err(|e| ReplicationError::transport(peer, e))?;
            let response = check_status(peer, response)?;
            response
                .json::<HealthReport>()
                .await
                .map_err(|e| ReplicationError::transport(peer, format!("undecodable health report: {}", e)))
        })
    }

    fn fetch_blob<'a>(&'a self, peer: &'a str, key: &'a str) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url(peer, &paths::blob(key)))
                .timeout(self.timeouts.transfer)
                .send()
                .await
                .map_err(|e| ReplicationError::transport(peer, e))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let response = check_status(peer, response)?;
            let data = response
                .bytes()
                .await
                .map_err(|e| ReplicationError::transport(peer, e))?;
            Ok(Some(data))
        })
    }

    fn store_blob<'a>(&'a self, peer: &'a str, data: Bytes) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_signed(
                peer,
                paths::BLOBS,
                data,
                "application/octet-stream",
                self.timeouts.transfer,
            )
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{from_nanos, OpType, BLOBS_TABLE};
    use crate::signing::PeerKeys;
    use crate::config::PeerConfig;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SELF_HOST: &str = "http://self:4000";

    fn signer() -> Arc<NodeSigner> {
        Arc::new(NodeSigner::from_seed(SELF_HOST, [9; 32]))
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(
            signer(),
            TransportTimeouts {
                push: Duration::from_secs(2),
                bulk: Duration::from_secs(2),
                health: Duration::from_secs(2),
                transfer: Duration::from_secs(2),
            },
        )
        .unwrap()
    }

    fn sample_op(host: &str, nanos: i64) -> Operation {
        Operation {
            host: host.to_string(),
            relayed_at: from_nanos(nanos),
            op_type: OpType::Create,
            table: BLOBS_TABLE.to_string(),
            payload: json!({"key": "a".repeat(64), "host": host, "size": 1}),
        }
    }

    #[tokio::test]
    async fn test_push_op_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(paths::RECEIVE))
            .and(header_exists(HOST_HEADER))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let body = sample_op(SELF_HOST, 5).encode().unwrap();
        transport().push_op(&server.uri(), body.clone()).await.unwrap();

        // The signature verifies against our public key
        let requests = server.received_requests().await.unwrap();
        let sig = requests[0]
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let keys = PeerKeys::from_peers(
            &[PeerConfig::new(SELF_HOST, &signer().public_key_hex())],
            Duration::from_secs(300),
        )
        .unwrap();
        keys.verify_body(SELF_HOST, &body, &sig).unwrap();
    }

    #[tokio::test]
    async fn test_push_op_non_2xx_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(paths::RECEIVE))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = transport()
            .push_op(&server.uri(), Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::RemoteRejected { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_bulk_sends_cursor_and_nonce() {
        let server = MockServer::start().await;
        let ops = vec![sample_op("http://peer:4000", 10), sample_op("http://peer:4000", 20)];
        Mock::given(method("GET"))
            .and(path(paths::BULK))
            .and(query_param("after", "1970-01-01T00:00:00.000000005Z"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&ops))
            .mount(&server)
            .await;

        let fetched = transport()
            .fetch_bulk(&server.uri(), from_nanos(5))
            .await
            .unwrap();
        assert_eq!(fetched, ops);

        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Nonce http://self:4000 "));
    }

    #[tokio::test]
    async fn test_fetch_bulk_undecodable_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(paths::BULK))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = transport()
            .fetch_bulk(&server.uri(), from_nanos(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_fetch_blob_not_found() {
        let server = MockServer::start().await;
        let key = "b".repeat(64);
        Mock::given(method("GET"))
            .and(path(paths::blob(&key)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(transport().fetch_blob(&server.uri(), &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_blob_bytes() {
        let server = MockServer::start().await;
        let key = "c".repeat(64);
        Mock::given(method("GET"))
            .and(path(paths::blob(&key)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"blob bytes".to_vec()))
            .mount(&server)
            .await;

        let data = transport().fetch_blob(&server.uri(), &key).await.unwrap();
        assert_eq!(data.unwrap(), Bytes::from_static(b"blob bytes"));
    }

    #[tokio::test]
    async fn test_store_blob_posts_signed_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(paths::BLOBS))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        transport()
            .store_blob(&server.uri(), Bytes::from_static(b"copy"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        // Port 9 (discard) on loopback is expected to refuse connections
        let err = transport()
            .fetch_health("http://127.0.0.1:9")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { .. }));
        assert!(err.is_retryable());
    }
}
