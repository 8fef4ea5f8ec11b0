//! Dial backoff.

use netron_types::ConnectConfig;
use std::time::Duration;

/// Delay before retry number `attempt` (0-based).
///
/// Formula: `min(min_delay * 2^attempt, max_delay)`
pub(crate) fn backoff_delay(policy: &ConnectConfig, attempt: u32) -> Duration {
    let base = policy
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    Duration::from_millis(base.min(policy.max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_and_capped() {
        let policy = ConnectConfig {
            retries: 5,
            min_delay_ms: 300,
            max_delay_ms: 3000,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(300));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(600));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(2400));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_millis(3000));
        assert_eq!(backoff_delay(&policy, 200), Duration::from_millis(3000));
    }
}
