//! # blobmesh
//!
//! Storage node for a peer-to-peer, content-addressed blob cluster.
//!
//! ## Architecture
//!
//! Every node keeps an append-only log of operations (who holds which blob)
//! and replicates it to every peer over signed HTTP, then moves blob bytes
//! so each key lives on the hosts placement picks for it:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                 blobmesh node                             │
//! │                                                                           │
//! │  ┌─────────────┐   record_local   ┌───────────────────┐    ┌───────────┐  │
//! │  │  BlobStore  │─────────────────►│ ReplicationEngine │◄───│ PeerClient│  │
//! │  │ (fs / mem)  │                  │ (apply, bulk log) │    │ per peer  │  │
//! │  └─────────────┘                  └───────────────────┘    │ push+sweep│  │
//! │         ▲                                  │               └───────────┘  │
//! │         │                                  ▼                     │        │
//! │  ┌─────────────┐   decide()       ┌───────────────────┐   ┌────────────┐  │
//! │  │ RepairLoop  │◄─────────────────│ PlacementEngine   │   │ CursorStore│  │
//! │  │ (pull/push) │   health         │ (rendezvous hash) │   │ (SQLite)   │  │
//! │  └─────────────┘◄─────────────────┤ HealthBroadcaster │   └────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Replication
//!
//! 1. **Push**: each local operation is queued to every peer right away
//!    (bounded, never blocks the writer; drops are recovered by sweep)
//! 2. **Sweep**: each peer's log is pulled periodically from a persisted
//!    cursor; the cursor never passes an operation that failed to apply
//!
//! Applying is idempotent on `(host, relayed_at)`, so overlap between the
//! two paths is harmless.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blobmesh::{Node, NodeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> blobmesh::Result<()> {
//!     let config = NodeConfig::from_file("node.json")?;
//!     let node = Arc::new(Node::open(config).await?);
//!     node.start().await?;
//!
//!     let app = blobmesh::api::router(Arc::clone(&node));
//!     // serve `app` with axum, then:
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod operation;
pub mod peer;
pub mod placement;
pub mod resilience;
pub mod signing;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{NodeConfig, NodeSettings, PeerConfig, StoreConfig};
pub use coordinator::{Node, NodeState, NodeStatus, RepairLoop, RepairReport};
pub use cursor::CursorStore;
pub use engine::{ApplyOutcome, OperationSink, ReplicationEngine};
pub use error::{ReplicationError, Result};
pub use health::{HealthBroadcaster, HealthRegistry, HealthReport, PeerStatus};
pub use operation::{OpType, Operation};
pub use peer::{Outbox, PeerClient, SweepOutcome};
pub use placement::PlacementEngine;
pub use transport::{HttpTransport, PeerTransport};
