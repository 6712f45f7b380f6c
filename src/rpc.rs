//! Provider plumbing: the collaborator capability, the alloy-backed client,
//! rate-limit classification, and the circuit breaker.

pub mod breaker;
pub mod client;

pub use breaker::{BreakerPhase, BreakerSnapshot, RateLimitBreaker};
pub use client::{is_rate_limited, AlloyLogSource, LogSource};
