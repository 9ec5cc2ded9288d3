//! Exponential backoff with jitter for failed or explicitly-requeued reconciles.

use std::time::Duration;

/// Compute the delay before the next retry of a failed reconcile, and the attempt count to
/// store alongside it.
///
/// `attempt` is the number of previous failed attempts (0 on the first failure).
/// `delay = min(2^attempt, max_backoff) + uniform(0, 1) seconds`; the returned attempt is
/// `attempt + 1`.
#[must_use]
pub fn failure_delay(attempt: u32, max_backoff: Duration) -> (Duration, u32) {
    let base = 2u64.saturating_pow(attempt);
    let capped = base.min(max_backoff.as_secs().max(1));
    let jitter = rand::random::<f64>();
    (Duration::from_secs_f64(capped as f64 + jitter), attempt + 1)
}

/// Compute the delay for a reconcile that explicitly requested `requeue_after`.
///
/// Resets the stored attempt count to 0, since the caller has expressed domain knowledge of
/// when to retry and exponential history should not apply.
#[must_use]
pub fn explicit_delay(requeue_after: Duration) -> (Duration, u32) {
    let jitter = rand::random::<f64>();
    (requeue_after + Duration::from_secs_f64(jitter), 0)
}
