//! Retry policy for queued Telegram deliveries
//!
//! Whether a failed attempt is retried is decided from the error kind alone:
//! throttling waits the duration the failure carries, transport failures
//! wait the fixed backoff, everything else is final.

use std::time::Duration;

use serde::Deserialize;

use crate::Error;

/// Retry policy for delivery jobs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before retrying a transport failure
    #[serde(with = "secs")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay
    Retry(Duration),
    /// Attempt ceiling reached
    Exhausted,
    /// Failure will not resolve by waiting
    Permanent,
}

/// Decide the next step after attempt number `attempt` (1-based) failed with `err`
#[must_use]
pub fn decide(policy: &RetryPolicy, attempt: u32, err: &Error) -> RetryDecision {
    if !err.is_retryable() {
        return RetryDecision::Permanent;
    }

    if attempt >= policy.max_attempts {
        return RetryDecision::Exhausted;
    }

    RetryDecision::Retry(err.retry_after().unwrap_or(policy.backoff))
}

/// Whether an HTTP status on a response without a decodable envelope is transient
#[must_use]
pub fn is_recoverable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Error {
        Error::Transport("connection reset by peer".into())
    }

    // -- decide ---------------------------------------------------------------

    #[test]
    fn transport_retries_with_fixed_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(
            decide(&policy, 1, &transport()),
            RetryDecision::Retry(Duration::from_secs(60))
        );
        assert_eq!(
            decide(&policy, 2, &transport()),
            RetryDecision::Retry(Duration::from_secs(60))
        );
    }

    #[test]
    fn third_failure_exhausts() {
        let policy = RetryPolicy::default();
        assert_eq!(decide(&policy, 3, &transport()), RetryDecision::Exhausted);
    }

    #[test]
    fn flood_control_waits_exactly_retry_after() {
        let policy = RetryPolicy::default();
        let err = Error::FloodControl {
            chat_id: Some(1),
            retry_after: Duration::from_secs(17),
        };
        assert_eq!(
            decide(&policy, 1, &err),
            RetryDecision::Retry(Duration::from_secs(17))
        );
    }

    #[test]
    fn local_rate_limit_waits_projected_headroom() {
        let policy = RetryPolicy::default();
        let err = Error::RateLimited {
            retry_after: Duration::from_millis(400),
        };
        assert_eq!(
            decide(&policy, 1, &err),
            RetryDecision::Retry(Duration::from_millis(400))
        );
    }

    #[test]
    fn api_errors_are_permanent() {
        let policy = RetryPolicy::default();
        let err = Error::Api {
            code: 400,
            description: "Bad Request: chat not found".into(),
        };
        assert_eq!(decide(&policy, 1, &err), RetryDecision::Permanent);
    }

    #[test]
    fn permanent_takes_precedence_over_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(decide(&policy, 5, &Error::Unauthorized), RetryDecision::Permanent);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(decide(&policy, 1, &transport()), RetryDecision::Exhausted);
    }

    // -- is_recoverable_status ------------------------------------------------

    #[test]
    fn recoverable_on_rate_limit_and_server_errors() {
        assert!(is_recoverable_status(429));
        assert!(is_recoverable_status(500));
        assert!(is_recoverable_status(502));
        assert!(is_recoverable_status(599));
    }

    #[test]
    fn not_recoverable_on_client_errors() {
        assert!(!is_recoverable_status(400));
        assert!(!is_recoverable_status(403));
        assert!(!is_recoverable_status(404));
        assert!(!is_recoverable_status(200));
    }

    // -- Default policy -------------------------------------------------------

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(60));
    }
}
