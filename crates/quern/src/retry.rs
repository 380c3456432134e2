//! Retry policy: a pure decision function from failure counts to either a
//! delayed re-queue or the dead-letter queue.
//!
//! Backoff is `base ^ attempts` whole seconds with no jitter: integer
//! arithmetic keeps the schedule reproducible, at the cost of synchronised
//! retries when many jobs fail together.

/// Outcome of a failed execution. `attempts` in both variants is the
/// post-increment count to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue: set `state = pending` and run no earlier than `next_run_at`.
    Retry { attempts: i64, next_run_at: i64 },
    /// Out of retries: set `state = dead`.
    Dead { attempts: i64 },
}

/// Decide what happens after a failed execution.
///
/// `attempts` is the pre-increment count from the job record; the total
/// number of permitted executions is `max_retries + 1`.
pub fn decide(attempts: i64, max_retries: i64, backoff_base: i64, now_ts: i64) -> RetryDecision {
    let attempts = attempts + 1;
    if attempts > max_retries {
        return RetryDecision::Dead { attempts };
    }
    let base = backoff_base.max(1);
    let exponent = u32::try_from(attempts).unwrap_or(u32::MAX);
    let delay = base.checked_pow(exponent).unwrap_or(i64::MAX);
    RetryDecision::Retry {
        attempts,
        next_run_at: now_ts.saturating_add(delay),
    }
}
