use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters recorded across a fetcher's calls.
#[derive(Default, Debug)]
pub struct FetchTelemetry {
    chunks_completed: AtomicU64,
    logs_fetched: AtomicU64,
    rate_limited: AtomicU64,
    breaker_trips: AtomicU64,
    fatal_errors: AtomicU64,
}

impl FetchTelemetry {
    pub fn record_chunk_completed(&self, logs: u64) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
        if logs > 0 {
            self.logs_fetched.fetch_add(logs, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_completed(&self) -> u64 {
        self.chunks_completed.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            logs_fetched: self.logs_fetched.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub chunks_completed: u64,
    pub logs_fetched: u64,
    pub rate_limited: u64,
    pub breaker_trips: u64,
    pub fatal_errors: u64,
}
