//! Race-safe terminal state and error aggregation for one fetch call.
//!
//! Many workers, the call-wide timer, and the aggregator all race to settle
//! the call. Exactly one transition away from `Ongoing` is permitted: the
//! first compare-and-swap wins and every later attempt is a no-op. The
//! winner's classification is authoritative; errors observed afterwards are
//! only appended to the report as supplementary lines.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error surfaced by [`crate::LogsFetcher::fetch_logs`].
///
/// The contract is binary: a call either returns the complete ordered log
/// sequence or one of these and no logs.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid block range: from block {from} is greater than to block {to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("log filters support at most 4 topic slots, got {count}")]
    TooManyTopicSlots { count: usize },
    #[error("log query failed: {report}")]
    Failed { report: String },
    #[error("log query timed out: {report}")]
    TimedOut { report: String },
}

/// Terminal classification of a whole call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ongoing,
    Success,
    Failed,
    TimedOut,
}

const ONGOING: u8 = 0;
const SUCCESS: u8 = 1;
const FAILED: u8 = 2;
const TIMED_OUT: u8 = 3;

#[derive(Default)]
struct ErrorReport {
    primary: Option<String>,
    supplementary: Vec<String>,
}

impl ErrorReport {
    fn render(&self) -> String {
        let mut message = self
            .primary
            .clone()
            .unwrap_or_else(|| "call settled without a recorded cause".to_string());
        for extra in &self.supplementary {
            message.push_str("; also: ");
            message.push_str(extra);
        }
        message
    }
}

/// Shared outcome cell, one per invocation.
///
/// The cancellation token is cancelled on the `Failed` and `TimedOut`
/// transitions so blocked workers wake immediately. The `Success` transition
/// never cancels it; the engine cancels the token itself after the
/// completion barrier to park the timer and any recovery pump.
pub(crate) struct OutcomeCell {
    state: AtomicU8,
    report: Mutex<ErrorReport>,
    cancel: CancellationToken,
}

impl OutcomeCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ONGOING),
            report: Mutex::new(ErrorReport::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn load(&self) -> CallOutcome {
        match self.state.load(Ordering::Acquire) {
            SUCCESS => CallOutcome::Success,
            FAILED => CallOutcome::Failed,
            TIMED_OUT => CallOutcome::TimedOut,
            _ => CallOutcome::Ongoing,
        }
    }

    /// Token observed by every blocking operation in the workers.
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Records a fatal collaborator error. Returns `true` if this call won
    /// the one-shot `Ongoing -> Failed` transition.
    pub(crate) fn record_fatal(&self, error: &anyhow::Error) -> bool {
        let won = self
            .state
            .compare_exchange(ONGOING, FAILED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let rendered = format!("{error:#}");
        {
            let mut report = self.report.lock().expect("outcome report mutex poisoned");
            if won {
                report.primary = Some(rendered);
            } else {
                report.supplementary.push(rendered);
            }
        }

        if won {
            self.cancel.cancel();
        }
        won
    }

    /// Records expiry of the call-wide deadline. Returns `true` if this call
    /// won the one-shot `Ongoing -> TimedOut` transition.
    pub(crate) fn record_timeout(&self, from: u64, to: u64, budget: Duration) -> bool {
        let won = self
            .state
            .compare_exchange(ONGOING, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            let mut report = self.report.lock().expect("outcome report mutex poisoned");
            report.primary = Some(format!(
                "search from block {from} to block {to} exceeded its {budget:?} deadline"
            ));
            drop(report);
            self.cancel.cancel();
        }
        won
    }

    /// Claimed by the aggregator once all workers have joined.
    pub(crate) fn try_succeed(&self) -> bool {
        self.state
            .compare_exchange(ONGOING, SUCCESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Builds the aggregated error once the call has settled unsuccessfully.
    pub(crate) fn final_error(&self) -> FetchError {
        let report = self
            .report
            .lock()
            .expect("outcome report mutex poisoned")
            .render();
        match self.load() {
            CallOutcome::TimedOut => FetchError::TimedOut { report },
            _ => FetchError::Failed { report },
        }
    }
}
