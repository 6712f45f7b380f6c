//! Call orchestration: chunk fan-out, the call-wide timer, the completion
//! barrier, and ordered aggregation.

use crate::fetcher::outcome::FetchError;
use crate::fetcher::splitter::{split_range, ChunkSpec};
use crate::fetcher::worker::{ChunkWorker, WorkerShared};
use crate::rpc::breaker::RateLimitBreaker;
use crate::rpc::client::{AlloyLogSource, LogSource};
use crate::runtime::config::FetchConfig;
use crate::runtime::telemetry::{FetchTelemetry, TelemetrySnapshot};
use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const TOPIC_SLOTS: usize = 4;

/// One log query: an inclusive block range, OR-combined contract addresses,
/// ordered topic-slot OR-sets (passed through to the provider unmodified),
/// and an optional call-wide deadline. Without a deadline the call runs
/// until it settles on its own.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
    pub timeout: Option<Duration>,
}

impl LogQuery {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..Default::default()
        }
    }

    pub fn addresses(mut self, addresses: Vec<Address>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn topics(mut self, topics: Vec<Vec<B256>>) -> Self {
        self.topics = topics;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Concurrent event-log fetcher over a chunked block range.
///
/// Splits the requested range into bounded chunks, queries them through the
/// collaborator behind a concurrency gate and a rate-limit circuit breaker,
/// and reassembles one sequence in ascending chunk order. The contract is
/// binary: the complete ordered log set, or one aggregated error and no
/// logs.
pub struct LogsFetcher {
    source: Arc<dyn LogSource>,
    config: FetchConfig,
    telemetry: Arc<FetchTelemetry>,
}

impl LogsFetcher {
    pub fn new(source: Arc<dyn LogSource>, config: FetchConfig) -> Self {
        Self {
            source,
            config,
            telemetry: Arc::new(FetchTelemetry::default()),
        }
    }

    /// Builds a fetcher over an alloy HTTP provider.
    pub fn connect_http(url: &str, config: FetchConfig) -> Result<Self> {
        let source = AlloyLogSource::connect_http(url)?;
        Ok(Self::new(Arc::new(source), config))
    }

    /// Counters accumulated across this fetcher's calls.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Current chain head reported by the collaborator.
    pub async fn current_block_number(&self) -> Result<u64> {
        self.source.block_number().await
    }

    /// Fetches all logs matching `query` across its whole block range.
    pub async fn fetch_logs(&self, query: LogQuery) -> Result<Vec<Log>, FetchError> {
        if query.topics.len() > TOPIC_SLOTS {
            return Err(FetchError::TooManyTopicSlots {
                count: query.topics.len(),
            });
        }

        let chunks = split_range(query.from_block, query.to_block, self.config.chunk_size())?;
        let gate_permits = chunks.len().min(self.config.max_concurrent());
        let breaker = RateLimitBreaker::new(
            self.config.trip_threshold(),
            self.config.probe_interval(),
            self.config.recovery_ratio(),
        );
        let shared = Arc::new(WorkerShared::new(
            chunks.len(),
            gate_permits,
            breaker,
            self.telemetry.clone(),
            self.config.retry_backoff(),
        ));

        tracing::info!(
            from_block = query.from_block,
            to_block = query.to_block,
            chunks = chunks.len(),
            gate = gate_permits,
            "fetching logs across chunked range"
        );

        let timer = query.timeout.map(|budget| {
            let shared = shared.clone();
            let (from, to) = (query.from_block, query.to_block);
            tokio::spawn(async move {
                let cancel = shared.outcome.cancellation().clone();
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(budget) => {
                        if shared.outcome.record_timeout(from, to, budget) {
                            tracing::warn!(
                                from_block = from,
                                to_block = to,
                                budget_ms = budget.as_millis() as u64,
                                "call-wide deadline expired"
                            );
                        }
                    }
                }
            })
        });

        let mut workers = JoinSet::new();
        for chunk in &chunks {
            let worker = ChunkWorker::new(
                *chunk,
                chunk_filter(&query, chunk),
                self.source.clone(),
                shared.clone(),
            );
            workers.spawn(worker.run());
        }

        // Completion barrier: every chunk joins exactly once, whatever its
        // exit path was. A panicked worker must not leave the call ongoing.
        while let Some(joined) = workers.join_next().await {
            if let Err(join_error) = joined {
                let error = anyhow::anyhow!("chunk worker panicked: {join_error}");
                shared.outcome.record_fatal(&error);
            }
        }

        // Stop the timer and any recovery pump still ticking; the outcome
        // CAS below stays authoritative regardless of who loses this race.
        shared.outcome.cancellation().cancel();
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        if shared.outcome.try_succeed() {
            let mut logs = Vec::new();
            for (id, slot) in shared.take_results().into_iter().enumerate() {
                debug_assert!(slot.is_some(), "chunk {id} joined without a result");
                if let Some(mut chunk_logs) = slot {
                    logs.append(&mut chunk_logs);
                }
            }
            tracing::info!(logs = logs.len(), "log fetch completed");
            Ok(logs)
        } else {
            let error = shared.outcome.final_error();
            tracing::warn!(error = %error, "log fetch failed");
            Err(error)
        }
    }
}

/// Projects the caller's filter onto one chunk's block range.
fn chunk_filter(query: &LogQuery, chunk: &ChunkSpec) -> Filter {
    let mut filter = Filter::new()
        .from_block(chunk.from_block)
        .to_block(chunk.to_block);
    if !query.addresses.is_empty() {
        filter = filter.address(query.addresses.clone());
    }
    for (slot, values) in query.topics.iter().enumerate().take(TOPIC_SLOTS) {
        if !values.is_empty() {
            filter.topics[slot] = values.clone().into();
        }
    }
    filter
}
