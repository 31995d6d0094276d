// retry.rs - Exponential-backoff retry scheduler
//
// Stateless: every function takes the data it needs and returns a value.
// No I/O, no clock reads beyond what the caller passes in — keeps the
// readiness predicate trivially testable without a database.

use crate::config::SyncConfig;

/// `delay_ms = min(initial_backoff_ms * 2^retry_count, max_backoff_ms)`.
///
/// No jitter: the formula is exact and monotonic by construction; adding
/// jitter would make that property only approximately true.
pub fn backoff_ms(retry_count: u32, config: &SyncConfig) -> i64 {
    let multiplier = 1i64.checked_shl(retry_count).unwrap_or(i64::MAX);
    config
        .initial_backoff_ms
        .saturating_mul(multiplier)
        .min(config.max_backoff_ms)
}

/// `retryable()` readiness predicate: `retry_count < max_retries AND now >= updated_at + backoff(retry_count)`.
pub fn is_ready(updated_at: i64, retry_count: u32, now: i64, config: &SyncConfig) -> bool {
    retry_count < config.max_retries && now >= updated_at + backoff_ms(retry_count, config)
}

/// An item is "failed" iff its retry count has reached the ceiling.
pub fn is_failed(retry_count: u32, config: &SyncConfig) -> bool {
    retry_count >= config.max_retries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SyncConfig {
        SyncConfig::default()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let c = cfg();
        assert_eq!(backoff_ms(0, &c), 1_000);
        assert_eq!(backoff_ms(1, &c), 2_000);
        assert_eq!(backoff_ms(2, &c), 4_000);
        assert_eq!(backoff_ms(3, &c), 8_000);
        assert_eq!(backoff_ms(4, &c), 16_000);
        // would be 32_000 at retry 5, still under the 60s cap
        assert_eq!(backoff_ms(5, &c), 32_000);
        // large retry counts saturate at the ceiling, never overflow
        assert_eq!(backoff_ms(40, &c), 60_000);
    }

    #[test]
    fn backoff_is_monotonic_up_to_the_ceiling() {
        let c = cfg();
        for r in 0..4 {
            assert!(backoff_ms(r, &c) <= backoff_ms(r + 1, &c));
        }
    }

    #[test]
    fn readiness_respects_ceiling_and_window() {
        let c = cfg();
        // retry_count at ceiling is never ready regardless of elapsed time
        assert!(!is_ready(0, 5, 1_000_000, &c));
        // within the backoff window: not ready
        assert!(!is_ready(1_000, 0, 1_500, &c));
        // exactly at the boundary: ready
        assert!(is_ready(1_000, 0, 2_000, &c));
        // past the boundary: ready
        assert!(is_ready(1_000, 0, 10_000, &c));
    }

    #[test]
    fn failed_iff_at_ceiling() {
        let c = cfg();
        assert!(!is_failed(4, &c));
        assert!(is_failed(5, &c));
        assert!(is_failed(6, &c));
    }
}
