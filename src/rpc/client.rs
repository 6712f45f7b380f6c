//! Collaborator capability consumed by the engine: the `LogSource` trait,
//! the alloy-backed production implementation, and the rate-limit
//! classification applied to collaborator errors.

use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::reqwest::Url;
use anyhow::{Context, Result};
use futures::future::BoxFuture;

/// Marker emitted by throttling providers alongside HTTP 429 responses.
const RATE_LIMIT_MARKER: &str = "429 Too Many Requests";

/// Transport-agnostic view of an Ethereum JSON-RPC provider.
///
/// The engine never sees the transport; anything that can report the chain
/// head and answer `eth_getLogs`-shaped queries can drive it, which is also
/// how tests inject scripted collaborators.
pub trait LogSource: Send + Sync {
    /// Current chain head block number.
    fn block_number(&self) -> BoxFuture<'_, Result<u64>>;

    /// All logs matching `filter` within its block range.
    fn filter_logs<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<Vec<Log>>>;
}

/// Returns true when a collaborator error is the provider signalling that
/// request volume exceeded its allowance, as opposed to a fatal failure.
///
/// Classification is textual: providers surface throttling through the HTTP
/// status line, so the whole context chain is searched for the marker.
pub fn is_rate_limited(error: &anyhow::Error) -> bool {
    let text = format!("{error:#}");
    text.contains(RATE_LIMIT_MARKER) || text.to_ascii_lowercase().contains("too many requests")
}

/// [`LogSource`] backed by an alloy provider.
#[derive(Debug, Clone)]
pub struct AlloyLogSource<P> {
    provider: P,
}

impl<P: Provider> AlloyLogSource<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl AlloyLogSource<DynProvider> {
    /// Connects to an HTTP JSON-RPC endpoint.
    pub fn connect_http(url: &str) -> Result<Self> {
        let url: Url = url
            .parse()
            .with_context(|| format!("invalid RPC URL: {url}"))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider })
    }
}

impl<P: Provider> LogSource for AlloyLogSource<P> {
    fn block_number(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.provider
                .get_block_number()
                .await
                .context("eth_blockNumber request failed")
        })
    }

    fn filter_logs<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<Vec<Log>>> {
        Box::pin(async move {
            self.provider
                .get_logs(filter)
                .await
                .context("eth_getLogs request failed")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classifies_provider_throttling_as_rate_limited() {
        let err = anyhow!("server returned an error response: 429 Too Many Requests");
        assert!(is_rate_limited(&err));

        let err = anyhow!("HTTP error 429 with body: {{\"error\":\"Too Many Requests\"}}");
        assert!(is_rate_limited(&err));
    }

    #[test]
    fn marker_survives_added_context() {
        let err = anyhow!("429 Too Many Requests").context("eth_getLogs request failed");
        assert!(
            is_rate_limited(&err),
            "classification must search the whole context chain"
        );
    }

    #[test]
    fn other_errors_are_fatal() {
        for message in [
            "execution aborted (timeout = 5s)",
            "query returned more than 10000 results",
            "connection refused",
        ] {
            let err = anyhow!(message);
            assert!(!is_rate_limited(&err), "{message} must classify as fatal");
        }
    }
}
