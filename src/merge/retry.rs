use std::thread;
use std::time::Duration;

use tracing::warn;

use super::{MergeError, MergeOutcome};

const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total merge attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(16);
        self.backoff
            .saturating_mul(1_u32 << exponent)
            .min(MAX_BACKOFF)
    }
}

/// Re-runs `attempt` while it reports a conflict, sleeping between tries.
/// Any error is returned immediately; running out of attempts yields
/// [`MergeError::MergeFailed`].
pub fn retry_on_conflict<F>(policy: &RetryPolicy, mut attempt: F) -> Result<MergeOutcome, MergeError>
where
    F: FnMut() -> Result<MergeOutcome, MergeError>,
{
    let max_attempts = policy.max_attempts.max(1);
    for current in 1..=max_attempts {
        match attempt()? {
            MergeOutcome::Conflict { observed_version } => {
                if current < max_attempts {
                    let delay = policy.delay_before(current + 1);
                    warn!(attempt = current, observed_version, ?delay, "merge conflict, retrying");
                    thread::sleep(delay);
                }
            }
            resolved => return Ok(resolved),
        }
    }
    Err(MergeError::MergeFailed {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn resolves_after_transient_conflicts() {
        let mut calls = 0;
        let outcome = retry_on_conflict(&fast_policy(3), || {
            calls += 1;
            if calls < 3 {
                Ok(MergeOutcome::Conflict {
                    observed_version: calls,
                })
            } else {
                Ok(MergeOutcome::Updated {
                    canonical_id: 1,
                    version: 3,
                })
            }
        })
        .expect("resolves on third try");
        assert_eq!(calls, 3);
        assert_eq!(
            outcome,
            MergeOutcome::Updated {
                canonical_id: 1,
                version: 3
            }
        );
    }

    #[test]
    fn exhausting_attempts_reports_merge_failed() {
        let mut calls = 0;
        let err = retry_on_conflict(&fast_policy(4), || {
            calls += 1;
            Ok(MergeOutcome::Conflict {
                observed_version: 1,
            })
        })
        .expect_err("never resolves");
        assert_eq!(calls, 4);
        assert!(matches!(err, MergeError::MergeFailed { attempts: 4 }));
    }

    #[test]
    fn errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_on_conflict(&fast_policy(5), || {
            calls += 1;
            Err(MergeError::MissingProvenance)
        })
        .expect_err("error surfaces");
        assert_eq!(calls, 1);
        assert!(matches!(err, MergeError::MissingProvenance));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let outcome = retry_on_conflict(&fast_policy(0), || {
            calls += 1;
            Ok(MergeOutcome::Created { canonical_id: 9 })
        })
        .expect("single attempt");
        assert_eq!(calls, 1);
        assert_eq!(outcome.canonical_id(), Some(9));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
        assert_eq!(policy.delay_before(10), MAX_BACKOFF);
    }
}
