// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The black-box retry scheduler.
//!
//! Given a policy and an `attempt()` callback, repeatedly invokes it until
//! it stops returning a retriable outcome or the budget runs out. The core
//! itself never retries — `engine::try_acquire` returns a single outcome —
//! so every caller-facing retry loop for `lock`/`lock_sync` goes through
//! here. The backoff shape (exponential, capped, jittered by nothing since
//! determinism matters more than thundering-herd avoidance for a local
//! filesystem lock) mirrors the step/cap pattern of the ambient daemon's own
//! startup backoff, adapted to per-attempt doubling instead of a fixed step.

use std::future::Future;
use std::time::Duration;

/// Retry policy for `lock`/`lock_sync` (`retries`, plus the
/// `min_timeout`/`max_timeout`/`factor` the retry adapter itself owns).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Number of additional attempts after the first. Zero means "try
    /// once, no retry."
    pub retries: u32,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Ceiling on the delay between any two attempts.
    pub max_timeout: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from the `retries` count alone, using the library's
    /// default timeout/factor shape.
    #[must_use]
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    fn delay_for_attempt(self, attempt: u32) -> Duration {
        let factor = self.factor.max(1);
        let scaled = self
            .min_timeout
            .as_millis()
            .saturating_mul(u128::from(factor).saturating_pow(attempt));
        let capped = scaled.min(self.max_timeout.as_millis());
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }
}

/// Whether a given attempt's error should be retried.
pub trait Retriable {
    /// Returns `true` if this outcome is worth retrying.
    fn is_retriable(&self) -> bool;
}

/// Drives `attempt` under `policy` until it returns a non-retriable error,
/// succeeds, or the retry budget is exhausted.
pub async fn run_async<T, E, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T, E>
where
    E: Retriable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if tries >= policy.retries || !err.is_retriable() => return Err(err),
            Err(_) => {
                let delay = policy.delay_for_attempt(tries);
                tracing::debug!(
                    attempt = tries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying after collision"
                );
                tokio::time::sleep(delay).await;
                tries += 1;
            }
        }
    }
}

/// Synchronous counterpart of [`run_async`]. The synchronous public API
/// never calls this with `retries > 0` (rejected up front as
/// `SyncRetriesUnsupported`), but the scheduler itself is retry-count
/// agnostic, so it is exercised directly here.
pub fn run_sync<T, E>(
    policy: RetryPolicy,
    mut attempt: impl FnMut() -> Result<T, E>,
) -> Result<T, E>
where
    E: Retriable,
{
    let mut tries = 0;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) if tries >= policy.retries || !err.is_retriable() => return Err(err),
            Err(_) => {
                let delay = policy.delay_for_attempt(tries);
                std::thread::sleep(delay);
                tries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Collision;

    impl Retriable for Collision {
        fn is_retriable(&self) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct Fatal;

    impl Retriable for Fatal {
        fn is_retriable(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let result: Result<u32, Collision> = run_async(RetryPolicy::default(), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_until_budget_exhausted_then_returns_error() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            retries: 3,
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(4),
            factor: 2,
        };
        let result: Result<(), Collision> = run_async(policy, || {
            calls.set(calls.get() + 1);
            async { Err(Collision) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 4, "first attempt plus 3 retries");
    }

    #[tokio::test]
    async fn non_retriable_error_stops_immediately() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::with_retries(5);
        let result: Result<(), Fatal> = run_async(policy, || {
            calls.set(calls.get() + 1);
            async { Err(Fatal) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn eventual_success_after_retries_returns_ok() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            retries: 5,
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(2),
            factor: 2,
        };
        let result: Result<u32, Collision> = run_async(policy, || {
            calls.set(calls.get() + 1);
            async move {
                if calls.get() < 3 {
                    Err(Collision)
                } else {
                    Ok(calls.get())
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn sync_variant_retries_synchronously() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            retries: 2,
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(2),
            factor: 2,
        };
        let result: Result<u32, Collision> = run_sync(policy, || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(Collision)
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn delay_for_attempt_is_capped() {
        let policy = RetryPolicy {
            retries: 10,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_millis(500),
            factor: 2,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }
}
