//! Retry policy and clock shared by every bounded wait.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::FleetResult;

/// Time source for poll loops. Tests drive it through tokio's paused clock.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait::async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant { Instant::now() }
    async fn sleep(&self, d: Duration) { tokio::time::sleep(d).await }
}

/// Fixed-interval retry with an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self { Self { interval, timeout } }

    pub fn every(interval_ms: u64, timeout_secs: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms), Duration::from_secs(timeout_secs))
    }

    pub fn deadline(&self, now: Instant) -> Instant { now + self.timeout }

    /// Same interval, shorter deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self { Self { interval: self.interval, timeout } }
}

/// Poll `check` until it yields `Ok(true)` or the policy deadline passes.
///
/// The check always runs at least once. Errors are treated as "not yet" and retried.
/// Returns `false` on timeout; the caller owns the meaning of that.
pub async fn poll_until<C, F, Fut>(clock: &C, policy: &RetryPolicy, mut check: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = FleetResult<bool>>,
{
    let deadline = policy.deadline(clock.now());
    loop {
        match check().await {
            Ok(true) => return true,
            Ok(false) => trace!("poll condition not met yet"),
            Err(e) => debug!(error = %e, "poll check failed; retrying"),
        }
        let now = clock.now();
        if now >= deadline {
            return false;
        }
        clock.sleep(policy.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FleetError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_true_once_condition_holds() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let policy = RetryPolicy::every(100, 10);
        let ok = poll_until(&TokioClock, &policy, move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 { Err(FleetError::Api("transient".into())) } else { Ok(n >= 3) }
        }).await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_overshooting() {
        let started = Instant::now();
        let policy = RetryPolicy::new(Duration::from_millis(700), Duration::from_secs(2));
        let ok = poll_until(&TokioClock, &policy, || async { Ok(false) }).await;
        assert!(!ok);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_millis(2100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_checks_once() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::ZERO);
        let ok = poll_until(&TokioClock, &policy, move || async move { counter.fetch_add(1, Ordering::SeqCst); Ok(false) }).await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
