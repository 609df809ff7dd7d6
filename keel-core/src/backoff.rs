//! Retry backoff
//!
//! Quadratic backoff used between job attempts: `min(n², cap) * unit`.
//! With the defaults (unit = 10s, cap = 12) the delay tops out at 120s
//! from the fourth failure on.

use std::time::Duration;

/// Default multiplier applied to each backoff step
pub const DEFAULT_UNIT: Duration = Duration::from_secs(10);

/// Default cap on the number of steps
pub const DEFAULT_CAP: u32 = 12;

/// Backoff after `failures` failed attempts, using the default unit and cap
pub fn backoff(failures: u32) -> Duration {
    backoff_with(failures, DEFAULT_UNIT, DEFAULT_CAP)
}

/// Backoff after `failures` failed attempts with an explicit unit and cap
pub fn backoff_with(failures: u32, unit: Duration, cap: u32) -> Duration {
    let steps = failures.saturating_mul(failures).min(cap);
    unit * steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_values() {
        assert_eq!(backoff(0), Duration::ZERO);
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(2), Duration::from_secs(40));
        assert_eq!(backoff(3), Duration::from_secs(90));
        assert_eq!(backoff(4), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_capped_and_monotonic() {
        let mut previous = Duration::ZERO;
        for n in 0..1000 {
            let current = backoff(n);
            assert!(current >= previous, "backoff decreased at n={}", n);
            if n >= 4 {
                assert_eq!(current, Duration::from_secs(120));
            }
            previous = current;
        }

        // No overflow at the extremes
        assert_eq!(backoff(u32::MAX), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_custom_unit() {
        let unit = Duration::from_millis(5);
        assert_eq!(backoff_with(2, unit, DEFAULT_CAP), Duration::from_millis(20));
        assert_eq!(backoff_with(10, unit, DEFAULT_CAP), Duration::from_millis(60));
    }
}
