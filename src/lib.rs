pub mod fetcher;
pub mod rpc;
pub mod runtime;

pub use fetcher::engine::{LogQuery, LogsFetcher};
pub use fetcher::outcome::FetchError;
pub use fetcher::splitter::{split_range, ChunkSpec};
pub use rpc::breaker::{BreakerPhase, BreakerSnapshot, RateLimitBreaker};
pub use rpc::client::{is_rate_limited, AlloyLogSource, LogSource};
pub use runtime::config::{FetchConfig, FetchConfigBuilder};
pub use runtime::telemetry::{init_tracing, TelemetrySnapshot};
