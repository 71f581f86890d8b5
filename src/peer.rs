// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer replication client: eager push plus periodic pull sweep.
//!
//! Each known peer gets one [`PeerClient`] and two tasks:
//!
//! ```text
//!   record_local ──► Outbox (bounded mpsc) ──► run_sender ──► POST /internal/crud/receive
//!                       full? drop + warn
//!
//!   run_sweeper (every interval):
//!     cursor ──► GET /internal/crud/bulk?after=cursor ──► apply each (RetryPolicy)
//!                                                          │ malformed: skip
//!                                                          │ other failure: halt
//!                                                          ▼
//!                                            advance cursor to last applied/skipped
//! ```
//!
//! # Push
//!
//! Push is best effort: never blocks the writer, never retried. A dropped or
//! failed push is recovered by the next sweep.
//!
//! # Sweep
//!
//! Operations are applied in the order the peer returned them. The cursor
//! never passes an operation that failed for a reason other than being
//! malformed, so the next sweep asks for the same range again.

use crate::config::SweepConfig;
use crate::cursor::CursorStore;
use crate::engine::{ApplyOutcome, OperationSink};
use crate::error::Result;
use crate::metrics;
use crate::operation::{format_rfc3339_nanos, to_nanos};
use crate::resilience::RetryPolicy;
use crate::transport::PeerTransport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

// =============================================================================
// Outbox
// =============================================================================

/// Producer side of a peer's bounded push queue.
///
/// Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct Outbox {
    host: String,
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl Outbox {
    /// Create a queue holding at most `capacity` payloads.
    pub fn new(host: &str, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                host: host.trim_end_matches('/').to_string(),
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Enqueue without blocking. Returns `false` if the payload was dropped.
    pub fn send(&self, payload: Bytes) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => {
                metrics::set_push_queue_depth(&self.host, self.len());
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = %self.host,
                    queued = self.len(),
                    capacity = self.capacity(),
                    "Push queue full, dropping operation (sweep will recover it)"
                );
                metrics::record_push_dropped(&self.host);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %self.host, "Push queue closed, dropping operation");
                false
            }
        }
    }

    /// Payloads waiting to be pushed.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Sweep outcome and stats
// =============================================================================

/// Result of one pull sweep against a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    /// Operations returned by the peer.
    pub fetched: usize,
    pub applied: usize,
    pub duplicates: usize,
    /// Malformed operations passed over.
    pub skipped: usize,
    /// A non-malformed apply failure stopped the batch early.
    pub halted: bool,
    /// Cursor after the sweep.
    pub cursor: DateTime<Utc>,
}

impl SweepOutcome {
    fn empty(cursor: DateTime<Utc>) -> Self {
        Self {
            fetched: 0,
            applied: 0,
            duplicates: 0,
            skipped: 0,
            halted: false,
            cursor,
        }
    }

    /// Whether any operation was applied, duplicated or skipped.
    pub fn made_progress(&self) -> bool {
        self.applied + self.duplicates + self.skipped > 0
    }
}

#[derive(Default)]
struct ClientCounters {
    pushes_ok: AtomicU64,
    pushes_failed: AtomicU64,
    sweeps_ok: AtomicU64,
    sweeps_failed: AtomicU64,
    /// Unix millis of the last successful sweep; 0 = never.
    last_sweep_ms: AtomicI64,
}

/// Point-in-time client statistics for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerClientStats {
    pub host: String,
    pub queued: usize,
    pub queue_capacity: usize,
    pub pushes_ok: u64,
    pub pushes_failed: u64,
    pub pushes_dropped: u64,
    pub sweeps_ok: u64,
    pub sweeps_failed: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_sweep_error: Option<String>,
}

// =============================================================================
// PeerClient
// =============================================================================

/// Replication client for one peer.
pub struct PeerClient<T: PeerTransport, A: OperationSink> {
    host: String,
    outbox: Outbox,
    /// Consumer side of the push queue; taken by the sender task.
    queue: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    transport: Arc<T>,
    sink: Arc<A>,
    cursors: Arc<CursorStore>,
    config: SweepConfig,
    retry: RetryPolicy,
    counters: ClientCounters,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl<T: PeerTransport, A: OperationSink> PeerClient<T, A> {
    pub fn new(
        host: &str,
        queue_capacity: usize,
        transport: Arc<T>,
        sink: Arc<A>,
        cursors: Arc<CursorStore>,
        config: SweepConfig,
    ) -> Self {
        let (outbox, rx) = Outbox::new(host, queue_capacity);
        let retry = config.retry_policy();
        Self {
            host: outbox.host().to_string(),
            outbox,
            queue: parking_lot::Mutex::new(Some(rx)),
            transport,
            sink,
            cursors,
            config,
            retry,
            counters: ClientCounters::default(),
            last_error: parking_lot::Mutex::new(None),
        }
    }

    /// Replace the apply retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// A producer handle for this peer's push queue.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Enqueue a payload for push. Never blocks; `false` means dropped.
    pub fn send(&self, payload: Bytes) -> bool {
        self.outbox.send(payload)
    }

    pub fn stats(&self) -> PeerClientStats {
        let last_ms = self.counters.last_sweep_ms.load(Ordering::Relaxed);
        PeerClientStats {
            host: self.host.clone(),
            queued: self.outbox.len(),
            queue_capacity: self.outbox.capacity(),
            pushes_ok: self.counters.pushes_ok.load(Ordering::Relaxed),
            pushes_failed: self.counters.pushes_failed.load(Ordering::Relaxed),
            pushes_dropped: self.outbox.dropped(),
            sweeps_ok: self.counters.sweeps_ok.load(Ordering::Relaxed),
            sweeps_failed: self.counters.sweeps_failed.load(Ordering::Relaxed),
            last_sweep_at: (last_ms > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_ms))
                .flatten(),
            last_sweep_error: self.last_error.lock().clone(),
        }
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Push one payload now. Errors are returned, not retried.
    pub async fn push_one(&self, payload: Bytes) -> Result<()> {
        let start = Instant::now();
        let result = self.transport.push_op(&self.host, payload).await;
        let ok = result.is_ok();
        metrics::record_push(&self.host, ok, start.elapsed());
        if ok {
            self.counters.pushes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.pushes_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Drain the push queue until shutdown. Runs at most once per client.
    pub async fn run_sender(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("sender", peer = %self.host);

        async move {
            let Some(mut rx) = self.queue.lock().take() else {
                warn!("Push queue already taken, sender not started");
                return;
            };
            let _ = shutdown_rx.borrow_and_update();
            debug!(capacity = self.outbox.capacity(), "Starting push sender");

            loop {
                let payload = tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Shutdown signal received, stopping push sender");
                            break;
                        }
                        continue;
                    }

                    payload = rx.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                };

                if let Err(e) = self.push_one(payload).await {
                    warn!(error = %e, "Push failed, leaving it to the next sweep");
                }
                metrics::set_push_queue_depth(&self.host, rx.len());
            }

            debug!(dropped_unsent = rx.len(), "Push sender stopped");
        }
        .instrument(span)
        .await
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Pull and apply everything the peer has after our cursor.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let start = Instant::now();
        let result = self.sweep_inner(start).await;
        match &result {
            Ok(_) => {
                self.counters.sweeps_ok.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .last_sweep_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                *self.last_error.lock() = None;
            }
            Err(e) => {
                self.counters.sweeps_failed.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
        result
    }

    async fn sweep_inner(&self, start: Instant) -> Result<SweepOutcome> {
        let after = self.cursors.get_or_zero(&self.host).await.map_err(|e| {
            metrics::record_sweep_failed(&self.host, "cursor");
            e
        })?;

        let ops = self
            .transport
            .fetch_bulk(&self.host, after)
            .await
            .map_err(|e| {
                metrics::record_sweep_failed(&self.host, "fetch");
                e
            })?;

        let mut outcome = SweepOutcome::empty(after);
        outcome.fetched = ops.len();
        let mut last_processed = None;

        for op in &ops {
            let sink = &*self.sink;
            match self.retry.run("sweep_apply", move || sink.apply(op)).await {
                Ok(ApplyOutcome::Applied) => outcome.applied += 1,
                Ok(ApplyOutcome::Duplicate) => outcome.duplicates += 1,
                Err(e) if e.is_malformed() => {
                    warn!(
                        peer = %self.host,
                        origin = %op.host,
                        relayed_at = %format_rfc3339_nanos(&op.relayed_at),
                        table = %op.table,
                        error = %e,
                        "Skipping malformed operation"
                    );
                    outcome.skipped += 1;
                }
                Err(e) => {
                    warn!(
                        peer = %self.host,
                        origin = %op.host,
                        relayed_at = %format_rfc3339_nanos(&op.relayed_at),
                        error = %e,
                        "Apply failed after retries, halting batch"
                    );
                    outcome.halted = true;
                    metrics::record_sweep_halted(&self.host);
                    break;
                }
            }
            // An unrepresentable stamp can't be a cursor; keep the last one that can
            if to_nanos(&op.relayed_at).is_some() {
                last_processed = Some(op.relayed_at);
            }
        }

        if let Some(cursor) = last_processed {
            self.cursors.advance(&self.host, cursor).await?;
            outcome.cursor = self.cursors.get_or_zero(&self.host).await?;
        }

        let took = start.elapsed();
        metrics::record_sweep(&self.host, outcome.fetched, outcome.applied, outcome.duplicates, took);
        if outcome.made_progress() {
            info!(
                peer = %self.host,
                took_ms = took.as_millis() as u64,
                fetched = outcome.fetched,
                applied = outcome.applied,
                duplicates = outcome.duplicates,
                skipped = outcome.skipped,
                halted = outcome.halted,
                cursor = %format_rfc3339_nanos(&outcome.cursor),
                "Sweep complete"
            );
        } else {
            debug!(peer = %self.host, took_ms = took.as_millis() as u64, halted = outcome.halted, "Sweep found nothing new");
        }
        Ok(outcome)
    }

    /// Sweep on a fixed interval until shutdown. Errors are logged, never fatal.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("sweeper", peer = %self.host);

        async move {
            let _ = shutdown_rx.borrow_and_update();

            let interval = self.config.interval();
            debug!(interval_secs = interval.as_secs(), "Starting sweeper");

            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Shutdown signal received, stopping sweeper");
                            break;
                        }
                        continue;
                    }

                    _ = timer.tick() => {}
                }

                if let Err(e) = self.sweep().await {
                    warn!(error = %e, "Sweep failed");
                    metrics::record_error(&self.host, "sweep");
                }
            }

            debug!("Sweeper stopped");
        }
        .instrument(span)
        .await
    }
}
