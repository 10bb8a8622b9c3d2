//! Retry with exponential backoff for provider calls.
//!
//! The source of truth for when a failed provider call is worth a second
//! attempt: transport errors, rate limits (429), and server errors (5xx).
//! Everything else fails fast.

use std::time::Duration;

/// Retry policy applied at every provider-client boundary.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call.
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt).
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries (for tests and fire-and-forget paths).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Whether an HTTP status is worth retrying: 429 and 5xx only.
pub fn is_recoverable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_statuses() {
        assert!(is_recoverable_status(429));
        assert!(is_recoverable_status(500));
        assert!(is_recoverable_status(503));
        assert!(!is_recoverable_status(400));
        assert!(!is_recoverable_status(401));
        assert!(!is_recoverable_status(404));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(delay_for_attempt(&policy, 0), Duration::from_millis(500));
        assert_eq!(delay_for_attempt(&policy, 1), Duration::from_secs(1));
        // Capped from here on.
        assert_eq!(delay_for_attempt(&policy, 4), Duration::from_secs(1));
    }
}
