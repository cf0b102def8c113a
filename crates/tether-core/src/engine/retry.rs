//! Retry decisions for failed step tries.
//!
//! Stateless: all logic is in associated functions that take the policy and
//! the step's recorded attempt/deadline as parameters. The executor persists
//! the decision and lets the timer service deliver the next try.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_types::retry::RetryPolicy;
use tether_types::step::ErrorInfo;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a step try failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another try at `wake_at`.
    RetryAt { wake_at: DateTime<Utc> },
    /// No retries left; record the failure.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Overall deadline for a step whose first try starts at `started_at`.
    pub fn deadline(policy: Option<&RetryPolicy>, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timeout = policy?.overall_timeout()?;
        let timeout = chrono::Duration::from_std(timeout).ok()?;
        started_at.checked_add_signed(timeout)
    }

    /// Time left before `deadline`. `None` means unbounded; `Some(ZERO)`
    /// means the deadline has passed.
    pub fn remaining(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
        deadline.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Decide whether to retry after `tries` failed tries (1-based).
    ///
    /// The wake time never lands past the deadline, so a backoff that would
    /// overrun it wakes the step exactly when it must time out.
    pub fn decide(
        policy: Option<&RetryPolicy>,
        tries: u32,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> RetryDecision {
        let Some(policy) = policy else {
            return RetryDecision::GiveUp;
        };
        if !policy.should_retry(tries) {
            return RetryDecision::GiveUp;
        }
        let backoff_until = chrono::Duration::from_std(policy.backoff(tries))
            .ok()
            .and_then(|backoff| now.checked_add_signed(backoff));
        match (backoff_until, deadline) {
            (Some(at), Some(deadline)) => RetryDecision::RetryAt { wake_at: at.min(deadline) },
            (Some(at), None) => RetryDecision::RetryAt { wake_at: at },
            (None, Some(deadline)) => RetryDecision::RetryAt { wake_at: deadline },
            (None, None) => RetryDecision::GiveUp,
        }
    }

    /// Error recorded when a step runs past its overall deadline.
    pub fn timeout_error(policy: Option<&RetryPolicy>) -> ErrorInfo {
        let limit = policy.and_then(|p| p.timeout_in_ms).unwrap_or_default();
        ErrorInfo::new("TimeoutError", format!("operation exceeded {limit} ms"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, 1000, 2.0)
    }

    #[test]
    fn retries_until_limit() {
        let now = Utc::now();
        let p = policy();
        for (tries, gap) in [(1, 1000), (2, 2000), (3, 4000)] {
            match RetryHandler::decide(Some(&p), tries, now, None) {
                RetryDecision::RetryAt { wake_at } => {
                    assert_eq!((wake_at - now).num_milliseconds(), gap)
                }
                RetryDecision::GiveUp => panic!("try {tries} should retry"),
            }
        }
        assert_eq!(RetryHandler::decide(Some(&p), 4, now, None), RetryDecision::GiveUp);
    }

    #[test]
    fn no_policy_never_retries() {
        assert_eq!(RetryHandler::decide(None, 1, Utc::now(), None), RetryDecision::GiveUp);
    }

    #[test]
    fn wake_is_capped_at_deadline() {
        let now = Utc::now();
        let deadline = now + chrono::Duration::milliseconds(1500);
        let p = policy();
        assert_eq!(
            RetryHandler::decide(Some(&p), 2, now, Some(deadline)),
            RetryDecision::RetryAt { wake_at: deadline }
        );
    }

    #[test]
    fn deadline_and_remaining() {
        let now = Utc::now();
        let p = policy().with_timeout(30_000);
        let deadline = RetryHandler::deadline(Some(&p), now).unwrap();
        assert_eq!((deadline - now).num_seconds(), 30);
        assert_eq!(
            RetryHandler::remaining(Some(deadline), now + chrono::Duration::seconds(40)),
            Some(Duration::ZERO)
        );
        assert_eq!(RetryHandler::remaining(None, now), None);
        assert!(RetryHandler::deadline(Some(&policy()), now).is_none());
        assert_eq!(RetryHandler::timeout_error(Some(&p)).name, "TimeoutError");
    }
}
