//! Scripted in-process collaborator for the integration suite.
//!
//! Each call is routed through a caller-supplied script keyed by the
//! 0-based call index, so tests can stage rate-limit streaks, fatal
//! failures, and latency patterns without a network in sight. The mock also
//! tracks the in-flight high-water mark and captures every filter it saw.

use alloy::eips::BlockNumberOrTag;
use alloy::rpc::types::{Filter, Log};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use logsweep::LogSource;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one scripted call.
pub enum Scripted {
    Logs(Vec<Log>),
    RateLimited,
    Fatal(&'static str),
}

type Script = dyn Fn(&Filter, u64) -> Scripted + Send + Sync;
type DelayFn = dyn Fn(u64) -> Duration + Send + Sync;

pub struct MockLogSource {
    script: Box<Script>,
    delay: Option<Box<DelayFn>>,
    chain_head: u64,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    filters: Mutex<Vec<Filter>>,
}

impl MockLogSource {
    pub fn new(script: impl Fn(&Filter, u64) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: None,
            chain_head: 0,
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Per-call latency, keyed by the 0-based call index.
    pub fn with_delay(mut self, delay: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn with_chain_head(mut self, head: u64) -> Self {
        self.chain_head = head;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn captured_filters(&self) -> Vec<Filter> {
        self.filters.lock().expect("filter log poisoned").clone()
    }
}

impl LogSource for MockLogSource {
    fn block_number(&self) -> BoxFuture<'_, Result<u64>> {
        let head = self.chain_head;
        Box::pin(async move { Ok(head) })
    }

    fn filter_logs<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<Vec<Log>>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            self.filters
                .lock()
                .expect("filter log poisoned")
                .push(filter.clone());

            if let Some(delay) = &self.delay {
                let pause = delay(call);
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }

            let outcome = (self.script)(filter, call);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Scripted::Logs(logs) => Ok(logs),
                Scripted::RateLimited => Err(anyhow!("429 Too Many Requests")),
                Scripted::Fatal(message) => Err(anyhow!("{message}")),
            }
        })
    }
}

/// Numeric bounds of a chunk filter; the engine always sets both.
pub fn filter_range(filter: &Filter) -> (u64, u64) {
    let from = match filter.block_option.get_from_block() {
        Some(BlockNumberOrTag::Number(number)) => *number,
        other => panic!("chunk filters must carry a numeric from_block, got {other:?}"),
    };
    let to = match filter.block_option.get_to_block() {
        Some(BlockNumberOrTag::Number(number)) => *number,
        other => panic!("chunk filters must carry a numeric to_block, got {other:?}"),
    };
    (from, to)
}

/// One synthetic log per block of the filter's range, tagged with its block
/// number so ordering assertions can read the sequence back.
pub fn logs_for_range(filter: &Filter) -> Vec<Log> {
    let (from, to) = filter_range(filter);
    (from..=to)
        .map(|number| Log {
            block_number: Some(number),
            ..Log::default()
        })
        .collect()
}

pub fn block_numbers(logs: &[Log]) -> Vec<u64> {
    logs.iter()
        .map(|log| log.block_number.expect("synthetic logs always carry a block number"))
        .collect()
}
