//! Per-chunk worker: one task per work unit, gated by the concurrency
//! semaphore, retrying rate-limited responses through the circuit breaker
//! and racing fatal outcomes onto the shared cell.

use crate::fetcher::outcome::OutcomeCell;
use crate::fetcher::splitter::ChunkSpec;
use crate::rpc::breaker::{Admission, RateLimitBreaker, RateLimitVerdict};
use crate::rpc::client::{is_rate_limited, LogSource};
use crate::runtime::telemetry::FetchTelemetry;
use alloy::rpc::types::{Filter, Log};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Call-scoped state borrowed by every worker of one invocation.
///
/// The call owns the chunk result slots outright; workers only ever write
/// the slot matching their chunk id, so the mutex is uncontended in
/// practice and exists to hand the slots to the aggregator in one piece.
pub(crate) struct WorkerShared {
    pub(crate) outcome: OutcomeCell,
    pub(crate) gate: Semaphore,
    pub(crate) breaker: RateLimitBreaker,
    pub(crate) telemetry: Arc<FetchTelemetry>,
    results: Mutex<Vec<Option<Vec<Log>>>>,
    retry_backoff: Duration,
}

impl WorkerShared {
    pub(crate) fn new(
        chunk_count: usize,
        gate_permits: usize,
        breaker: RateLimitBreaker,
        telemetry: Arc<FetchTelemetry>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            outcome: OutcomeCell::new(),
            gate: Semaphore::new(gate_permits),
            breaker,
            telemetry,
            results: Mutex::new((0..chunk_count).map(|_| None).collect()),
            retry_backoff,
        }
    }

    fn store_result(&self, id: usize, logs: Vec<Log>) {
        let mut slots = self.results.lock().expect("result slots mutex poisoned");
        debug_assert!(slots[id].is_none(), "chunk {id} result stored twice");
        slots[id] = Some(logs);
    }

    /// Hands the slots to the aggregator once all workers have joined.
    pub(crate) fn take_results(&self) -> Vec<Option<Vec<Log>>> {
        std::mem::take(&mut *self.results.lock().expect("result slots mutex poisoned"))
    }
}

/// State machine for a single chunk: Ready -> Fetching -> Done, detouring
/// through retries on rate limiting and aborting cooperatively once the
/// call has settled.
pub(crate) struct ChunkWorker {
    chunk: ChunkSpec,
    filter: Filter,
    source: Arc<dyn LogSource>,
    shared: Arc<WorkerShared>,
}

impl ChunkWorker {
    pub(crate) fn new(
        chunk: ChunkSpec,
        filter: Filter,
        source: Arc<dyn LogSource>,
        shared: Arc<WorkerShared>,
    ) -> Self {
        Self {
            chunk,
            filter,
            source,
            shared,
        }
    }

    /// Runs the chunk to completion. Fatal outcomes are recorded on the
    /// shared cell rather than returned; the gate permit acquired below is
    /// released on every exit path by its guard.
    pub(crate) async fn run(self) {
        let cancel = self.shared.outcome.cancellation().clone();

        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(
                    chunk = self.chunk.id,
                    "call settled before this chunk acquired a slot"
                );
                return;
            }
            permit = self.shared.gate.acquire() => {
                permit.expect("gate semaphore is never closed")
            }
        };

        loop {
            // Cooperative cancellation: never start an attempt once the
            // call has settled, even though an in-flight request below is
            // always allowed to finish.
            if cancel.is_cancelled() {
                tracing::debug!(chunk = self.chunk.id, "call settled; abandoning chunk");
                return;
            }

            let probe = match self.shared.breaker.admit(&cancel).await {
                Admission::Cancelled => {
                    tracing::debug!(
                        chunk = self.chunk.id,
                        "call settled while waiting for breaker admission"
                    );
                    return;
                }
                Admission::Probe => true,
                Admission::Unrestricted => false,
            };

            match self.source.filter_logs(&self.filter).await {
                Ok(logs) => {
                    if probe {
                        self.shared.breaker.on_probe_success();
                    } else {
                        self.shared.breaker.on_success();
                    }
                    tracing::debug!(
                        chunk = self.chunk.id,
                        from_block = self.chunk.from_block,
                        to_block = self.chunk.to_block,
                        logs = logs.len(),
                        "chunk query completed"
                    );
                    self.shared.telemetry.record_chunk_completed(logs.len() as u64);
                    self.shared.store_result(self.chunk.id, logs);
                    return;
                }
                Err(error) if is_rate_limited(&error) => {
                    self.shared.telemetry.record_rate_limited();
                    if probe {
                        self.shared.breaker.on_probe_rate_limited();
                        continue;
                    }
                    match self.shared.breaker.on_rate_limited() {
                        RateLimitVerdict::Tripped => {
                            self.shared.telemetry.record_breaker_trip();
                            // The pump parks itself once the breaker closes
                            // or the call token is cancelled.
                            let _pump = self.shared.breaker.spawn_recovery_pump(cancel.clone());
                        }
                        RateLimitVerdict::Backoff => {
                            tracing::trace!(
                                chunk = self.chunk.id,
                                backoff_ms = self.shared.retry_backoff.as_millis() as u64,
                                "rate limited; backing off before retry"
                            );
                            if !self.backoff(&cancel).await {
                                return;
                            }
                        }
                        RateLimitVerdict::AwaitAdmission => {}
                    }
                }
                Err(error) => {
                    self.shared.telemetry.record_fatal_error();
                    let error = error.context(format!(
                        "chunk {} (blocks {}..={}) failed",
                        self.chunk.id, self.chunk.from_block, self.chunk.to_block
                    ));
                    if self.shared.outcome.record_fatal(&error) {
                        tracing::error!(
                            chunk = self.chunk.id,
                            error = %error,
                            "fatal provider error; failing the call"
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Fixed backoff between closed-state retries; returns false when the
    /// call settled during the sleep.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        if self.shared.retry_backoff.is_zero() {
            tokio::task::yield_now().await;
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.shared.retry_backoff) => true,
        }
    }
}
