//! Retry policy and the background-call options that carry one.
//!
//! Field names follow the camelCase wire shape used by job declarations:
//! `{limit, minTimeoutInMs, factor, maxTimeoutInMs?, timeoutInMs?}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for a retried operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries after the first try.
    pub limit: u32,
    /// Delay before the first retry.
    #[serde(default = "default_min_timeout_in_ms")]
    pub min_timeout_in_ms: u64,
    /// Multiplier applied to the delay after each failed retry.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Upper bound on a single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_in_ms: Option<u64>,
    /// Overall deadline measured from the first try, regardless of retries left.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_ms: Option<u64>,
}

fn default_min_timeout_in_ms() -> u64 {
    1_000
}

fn default_factor() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn new(limit: u32, min_timeout_in_ms: u64, factor: f64) -> Self {
        Self {
            limit,
            min_timeout_in_ms,
            factor,
            max_timeout_in_ms: None,
            timeout_in_ms: None,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, default_min_timeout_in_ms(), default_factor())
    }

    pub fn with_max_timeout(mut self, max_timeout_in_ms: u64) -> Self {
        self.max_timeout_in_ms = Some(max_timeout_in_ms);
        self
    }

    pub fn with_timeout(mut self, timeout_in_ms: u64) -> Self {
        self.timeout_in_ms = Some(timeout_in_ms);
        self
    }

    /// Whether a retry is allowed after `tries` failed tries (1-based).
    pub fn should_retry(&self, tries: u32) -> bool {
        tries >= 1 && tries <= self.limit
    }

    /// Delay to wait after `tries` failed tries before the next one.
    ///
    /// `min_timeout * factor^(tries - 1)`, capped at `max_timeout_in_ms`.
    pub fn backoff(&self, tries: u32) -> Duration {
        let exponent = tries.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = if self.factor.is_finite() && self.factor > 0.0 {
            self.factor
        } else {
            1.0
        };
        let raw = self.min_timeout_in_ms as f64 * factor.powi(exponent);
        let mut millis = if raw.is_finite() && raw < u64::MAX as f64 {
            raw as u64
        } else {
            u64::MAX
        };
        if let Some(cap) = self.max_timeout_in_ms {
            millis = millis.min(cap);
        }
        Duration::from_millis(millis)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.timeout_in_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// BackgroundCallOptions
// ---------------------------------------------------------------------------

/// `{timeout: {durationInMs, retry?}}` accepted by background calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundCallOptions {
    pub timeout: BackgroundTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTimeout {
    /// Overall duration after which the call fails.
    pub duration_in_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl BackgroundCallOptions {
    pub fn new(duration_in_ms: u64, retry: Option<RetryPolicy>) -> Self {
        Self {
            timeout: BackgroundTimeout {
                duration_in_ms,
                retry,
            },
        }
    }

    /// The effective policy: the declared retry (or none) bounded by the
    /// overall duration.
    pub fn policy(&self) -> RetryPolicy {
        self.timeout
            .retry
            .clone()
            .unwrap_or_else(RetryPolicy::none)
            .with_timeout(self.timeout.duration_in_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_from_min() {
        let policy = RetryPolicy::new(3, 1000, 2.0);
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_respects_cap() {
        let policy = RetryPolicy::new(10, 1000, 2.0).with_max_timeout(3000);
        assert_eq!(policy.backoff(5), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(u32::MAX, u64::MAX, 10.0);
        assert_eq!(policy.backoff(1000), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_should_retry_up_to_limit() {
        let policy = RetryPolicy::new(3, 1000, 2.0);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_background_options_parse_wire_shape() {
        let opts: BackgroundCallOptions = serde_json::from_value(json!({
            "timeout": {
                "durationInMs": 30000,
                "retry": {"limit": 3, "minTimeoutInMs": 1000, "factor": 2}
            }
        }))
        .unwrap();
        let policy = opts.policy();
        assert_eq!(policy.limit, 3);
        assert_eq!(policy.min_timeout_in_ms, 1000);
        assert_eq!(policy.overall_timeout(), Some(Duration::from_millis(30000)));
    }

    #[test]
    fn test_background_options_without_retry_never_retry() {
        let opts = BackgroundCallOptions::new(5000, None);
        let policy = opts.policy();
        assert_eq!(policy.limit, 0);
        assert_eq!(policy.timeout_in_ms, Some(5000));
    }
}
