//! Circuit breaker with smooth recovery.
//!
//! Sustained rate limiting trips the breaker Closed -> Open (exactly one
//! worker wins the transition). While Open, retries are funneled through a
//! single admission gate: a recovery pump releases one permit per probe
//! interval, and each admitted probe's outcome feeds the recovery window.
//! Once the window's fractional failure ratio drops below the recovery
//! ratio, the breaker fully closes and every paused worker is released at
//! once via the phase broadcast.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
}

/// Snapshot of breaker internals for observability.
#[derive(Debug, Copy, Clone)]
pub struct BreakerSnapshot {
    pub phase: BreakerPhase,
    pub consecutive_rate_limits: u32,
    pub window_failed: u32,
    pub window_total: u32,
}

/// What a worker should do after reporting a rate-limited response from an
/// unrestricted attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RateLimitVerdict {
    /// Breaker stays closed: apply the fixed backoff and retry.
    Backoff,
    /// This worker won the Closed -> Open transition; it must start the
    /// recovery pump, then wait for admission like everyone else.
    Tripped,
    /// Breaker is already open: block on the admission gate.
    AwaitAdmission,
}

/// How a worker got past [`RateLimitBreaker::admit`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Breaker closed: proceed normally.
    Unrestricted,
    /// Admitted as a recovery probe while open; the attempt's outcome must
    /// be reported through the probe methods.
    Probe,
    /// The call was cancelled while waiting.
    Cancelled,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;

#[derive(Default)]
struct RecoveryWindow {
    failed: u32,
    total: u32,
}

impl RecoveryWindow {
    fn failure_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.failed) / f64::from(self.total)
    }
}

struct BreakerInner {
    phase: AtomicU8,
    streak: AtomicU32,
    window: Mutex<RecoveryWindow>,
    probes: Semaphore,
    phase_tx: watch::Sender<BreakerPhase>,
}

/// Shared backpressure controller, one per call, cloned into every worker
/// and into the recovery pump.
#[derive(Clone)]
pub struct RateLimitBreaker {
    inner: Arc<BreakerInner>,
    trip_threshold: u32,
    probe_interval: Duration,
    recovery_ratio: f64,
}

impl RateLimitBreaker {
    pub fn new(trip_threshold: u32, probe_interval: Duration, recovery_ratio: f64) -> Self {
        let (phase_tx, _) = watch::channel(BreakerPhase::Closed);
        Self {
            inner: Arc::new(BreakerInner {
                phase: AtomicU8::new(CLOSED),
                streak: AtomicU32::new(0),
                window: Mutex::new(RecoveryWindow::default()),
                probes: Semaphore::new(0),
                phase_tx,
            }),
            trip_threshold: trip_threshold.max(1),
            probe_interval,
            recovery_ratio,
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        match self.inner.phase.load(Ordering::Acquire) {
            OPEN => BreakerPhase::Open,
            _ => BreakerPhase::Closed,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let window = self.inner.window.lock().expect("breaker window poisoned");
        BreakerSnapshot {
            phase: self.phase(),
            consecutive_rate_limits: self.inner.streak.load(Ordering::Acquire),
            window_failed: window.failed,
            window_total: window.total,
        }
    }

    /// Gate every retry attempt through here. Returns immediately while the
    /// breaker is closed; while open, blocks until this worker is admitted
    /// as a probe, the breaker fully closes, or the call is cancelled.
    pub(crate) async fn admit(&self, cancel: &CancellationToken) -> Admission {
        if self.phase() == BreakerPhase::Closed {
            return Admission::Unrestricted;
        }

        let mut phase_rx = self.inner.phase_tx.subscribe();
        loop {
            if self.phase() == BreakerPhase::Closed {
                return Admission::Unrestricted;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Admission::Cancelled,
                permit = self.inner.probes.acquire() => {
                    permit.expect("probe semaphore is never closed").forget();
                    return Admission::Probe;
                }
                _ = phase_rx.changed() => {}
            }
        }
    }

    /// Reports a rate-limited response from an unrestricted attempt.
    pub(crate) fn on_rate_limited(&self) -> RateLimitVerdict {
        if self.phase() == BreakerPhase::Open {
            return RateLimitVerdict::AwaitAdmission;
        }

        let streak = self.inner.streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= self.trip_threshold && self.try_trip() {
            return RateLimitVerdict::Tripped;
        }

        if self.phase() == BreakerPhase::Open {
            RateLimitVerdict::AwaitAdmission
        } else {
            RateLimitVerdict::Backoff
        }
    }

    /// Reports a successful unrestricted attempt: the rate-limit streak is
    /// no longer consecutive.
    pub(crate) fn on_success(&self) {
        self.inner.streak.store(0, Ordering::Release);
    }

    /// Reports a rate-limited probe attempt while open.
    pub(crate) fn on_probe_rate_limited(&self) {
        let mut window = self.inner.window.lock().expect("breaker window poisoned");
        window.failed += 1;
        window.total += 1;
        // A failure can only raise the ratio, so no close check here.
    }

    /// Reports a successful probe attempt while open; closes the breaker
    /// once the post-attempt failure ratio falls below the recovery ratio.
    pub(crate) fn on_probe_success(&self) {
        let should_close = {
            let mut window = self.inner.window.lock().expect("breaker window poisoned");
            window.total += 1;
            window.failure_ratio() < self.recovery_ratio
        };
        if should_close {
            self.close();
        }
    }

    fn try_trip(&self) -> bool {
        if self
            .inner
            .phase
            .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.inner.streak.store(0, Ordering::Release);
        {
            let mut window = self.inner.window.lock().expect("breaker window poisoned");
            *window = RecoveryWindow::default();
        }
        // Drain permits left over from an earlier open episode so admission
        // restarts at the pump's cadence.
        while let Ok(permit) = self.inner.probes.try_acquire() {
            permit.forget();
        }
        self.inner.phase_tx.send_replace(BreakerPhase::Open);
        tracing::warn!(
            threshold = self.trip_threshold,
            "circuit breaker tripped; pausing rate-limited retries"
        );
        true
    }

    fn close(&self) {
        if self
            .inner
            .phase
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.inner.streak.store(0, Ordering::Release);
        {
            let mut window = self.inner.window.lock().expect("breaker window poisoned");
            *window = RecoveryWindow::default();
        }
        self.inner.phase_tx.send_replace(BreakerPhase::Closed);
        tracing::info!("circuit breaker recovered; releasing all paused workers");
    }

    /// Started by the worker that tripped the breaker: after an initial
    /// delay, releases one paused worker per probe interval until the
    /// breaker closes or the call ends.
    pub(crate) fn spawn_recovery_pump(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let breaker = self.clone();
        tokio::spawn(async move {
            let mut phase_rx = breaker.inner.phase_tx.subscribe();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(breaker.probe_interval) => {}
            }

            let mut ticker = interval(breaker.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = phase_rx.changed() => {
                        if breaker.phase() == BreakerPhase::Closed {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        // Cap outstanding permits at one: admission stays
                        // rate-limited instead of bursting after idle ticks.
                        if breaker.inner.probes.available_permits() == 0 {
                            breaker.inner.probes.add_permits(1);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_breaker(threshold: u32) -> RateLimitBreaker {
        RateLimitBreaker::new(threshold, Duration::from_millis(1), 0.25)
    }

    #[tokio::test]
    async fn trips_exactly_once_at_threshold() {
        let breaker = test_breaker(5);

        for _ in 0..4 {
            assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Backoff);
        }
        assert_eq!(breaker.phase(), BreakerPhase::Closed);

        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);
        assert_eq!(breaker.phase(), BreakerPhase::Open);

        assert_eq!(
            breaker.on_rate_limited(),
            RateLimitVerdict::AwaitAdmission,
            "only the first worker past the threshold may observe the trip"
        );

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.consecutive_rate_limits, 0, "trip resets the streak");
        assert_eq!(snapshot.window_total, 0, "trip resets the recovery window");
    }

    #[tokio::test]
    async fn success_resets_the_consecutive_streak() {
        let breaker = test_breaker(3);

        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Backoff);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Backoff);
        breaker.on_success();

        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Backoff);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Backoff);
        assert_eq!(
            breaker.phase(),
            BreakerPhase::Closed,
            "non-consecutive rate limits must not trip the breaker"
        );

        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);
    }

    #[tokio::test]
    async fn admit_is_unrestricted_while_closed() {
        let breaker = test_breaker(10);
        let cancel = CancellationToken::new();
        assert_eq!(breaker.admit(&cancel).await, Admission::Unrestricted);
    }

    #[tokio::test]
    async fn pump_admits_probes_one_at_a_time() {
        let breaker = test_breaker(1);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);

        let cancel = CancellationToken::new();
        let _pump = breaker.spawn_recovery_pump(cancel.clone());

        let admission = timeout(Duration::from_millis(250), breaker.admit(&cancel))
            .await
            .expect("pump should admit a probe promptly");
        assert_eq!(admission, Admission::Probe);

        cancel.cancel();
    }

    #[tokio::test]
    async fn closes_once_failure_ratio_drops_below_threshold() {
        let breaker = test_breaker(1);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);

        breaker.on_probe_rate_limited();
        assert_eq!(breaker.phase(), BreakerPhase::Open, "1/1 failed stays open");

        breaker.on_probe_success();
        assert_eq!(breaker.phase(), BreakerPhase::Open, "1/2 = 0.5 stays open");
        breaker.on_probe_success();
        assert_eq!(breaker.phase(), BreakerPhase::Open, "1/3 stays open");
        breaker.on_probe_success();
        assert_eq!(
            breaker.phase(),
            BreakerPhase::Open,
            "1/4 = 0.25 is not strictly below the threshold"
        );

        breaker.on_probe_success();
        assert_eq!(breaker.phase(), BreakerPhase::Closed, "1/5 = 0.2 closes");

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.window_total, 0, "close resets the recovery window");
    }

    #[tokio::test]
    async fn first_clean_probe_after_trip_closes_immediately() {
        let breaker = test_breaker(1);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);

        breaker.on_probe_success();
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn close_broadcast_releases_waiting_workers() {
        let breaker = test_breaker(1);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);

        let cancel = CancellationToken::new();
        let waiter = {
            let breaker = breaker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { breaker.admit(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "waiter should block while open");

        breaker.on_probe_success();

        let admission = timeout(Duration::from_millis(250), waiter)
            .await
            .expect("close must release waiters")
            .expect("waiter task should not panic");
        assert_eq!(admission, Admission::Unrestricted);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiting_workers() {
        let breaker = test_breaker(1);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);

        let cancel = CancellationToken::new();
        let waiter = {
            let breaker = breaker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { breaker.admit(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        let admission = timeout(Duration::from_millis(250), waiter)
            .await
            .expect("cancellation must release waiters")
            .expect("waiter task should not panic");
        assert_eq!(admission, Admission::Cancelled);
    }

    #[tokio::test]
    async fn pump_stops_when_cancelled() {
        let breaker = test_breaker(1);
        assert_eq!(breaker.on_rate_limited(), RateLimitVerdict::Tripped);

        let cancel = CancellationToken::new();
        let pump = breaker.spawn_recovery_pump(cancel.clone());

        cancel.cancel();
        timeout(Duration::from_millis(250), pump)
            .await
            .expect("pump should exit promptly after cancellation")
            .expect("pump task should not panic");
    }
}
