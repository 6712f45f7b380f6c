use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_CHUNK_SIZE: u64 = 2000;
const DEFAULT_MAX_CONCURRENT: usize = 50;
const DEFAULT_TRIP_THRESHOLD: u32 = 100;
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(2);
const DEFAULT_RECOVERY_RATIO: f64 = 0.25;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(2);

/// Runtime tunables for a [`crate::LogsFetcher`].
///
/// All instances are constructed via [`FetchConfig::builder`] or
/// [`FetchConfig::default`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    chunk_size: u64,
    max_concurrent: usize,
    trip_threshold: u32,
    probe_interval: Duration,
    recovery_ratio: f64,
    retry_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            trip_threshold: DEFAULT_TRIP_THRESHOLD,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            recovery_ratio: DEFAULT_RECOVERY_RATIO,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl FetchConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> FetchConfigBuilder {
        FetchConfigBuilder::default()
    }

    /// Maximum number of blocks a single chunk query may span.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Upper bound on simultaneously in-flight chunk queries.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Consecutive rate-limited responses that trip the circuit breaker.
    pub fn trip_threshold(&self) -> u32 {
        self.trip_threshold
    }

    /// Cadence at which paused workers are re-admitted while the breaker is open.
    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    /// Fractional failure ratio below which an open breaker fully closes.
    pub fn recovery_ratio(&self) -> f64 {
        self.recovery_ratio
    }

    /// Fixed delay between rate-limited retries while the breaker is closed.
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }

        if self.max_concurrent == 0 {
            bail!("max_concurrent must be greater than 0");
        }

        if self.trip_threshold == 0 {
            bail!("trip_threshold must be greater than 0");
        }

        if self.probe_interval.is_zero() {
            bail!("probe_interval must be greater than 0");
        }

        if !(self.recovery_ratio > 0.0 && self.recovery_ratio <= 1.0) {
            bail!("recovery_ratio must lie in (0, 1]");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct FetchConfigBuilder {
    chunk_size: Option<u64>,
    max_concurrent: Option<usize>,
    trip_threshold: Option<u32>,
    probe_interval: Option<Duration>,
    recovery_ratio: Option<f64>,
    retry_backoff: Option<Duration>,
}

impl FetchConfigBuilder {
    pub fn chunk_size(mut self, blocks: u64) -> Self {
        self.chunk_size = Some(blocks);
        self
    }

    pub fn max_concurrent(mut self, requests: usize) -> Self {
        self.max_concurrent = Some(requests);
        self
    }

    pub fn trip_threshold(mut self, responses: u32) -> Self {
        self.trip_threshold = Some(responses);
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = Some(interval);
        self
    }

    pub fn recovery_ratio(mut self, ratio: f64) -> Self {
        self.recovery_ratio = Some(ratio);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn build(self) -> Result<FetchConfig> {
        let config = FetchConfig {
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            max_concurrent: self.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT),
            trip_threshold: self.trip_threshold.unwrap_or(DEFAULT_TRIP_THRESHOLD),
            probe_interval: self.probe_interval.unwrap_or(DEFAULT_PROBE_INTERVAL),
            recovery_ratio: self.recovery_ratio.unwrap_or(DEFAULT_RECOVERY_RATIO),
            retry_backoff: self.retry_backoff.unwrap_or(DEFAULT_RETRY_BACKOFF),
        };

        config.validate()?;
        Ok(config)
    }
}
