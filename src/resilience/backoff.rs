//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
///
/// `attempt` is 1-based: the delay after the first failure is `base`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);

        let b1 = calculate_backoff(1, base, Duration::from_millis(2000));
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, base, Duration::from_millis(2000));
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, base, Duration::from_millis(1000));
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);
    }

    #[test]
    fn test_zero_base_disables_backoff() {
        assert_eq!(calculate_backoff(3, Duration::ZERO, Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(calculate_backoff(0, Duration::from_millis(100), Duration::from_secs(1)), Duration::ZERO);
    }
}
