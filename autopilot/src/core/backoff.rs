//! Adaptive loop backoff.

/// Largest exponent applied to the base interval (2^6 = 64x).
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Compute the next loop interval in seconds from the consecutive failure count.
///
/// - `failures <= 0` returns `base_secs` unchanged.
/// - Otherwise `base_secs * 2^min(failures, 6)`.
/// - The result never exceeds `max_minutes * 60`.
pub fn backoff_secs(base_secs: u64, failures: i64, max_minutes: u64) -> u64 {
    if failures <= 0 {
        return base_secs;
    }
    let exponent = u32::try_from(failures)
        .unwrap_or(MAX_BACKOFF_EXPONENT)
        .min(MAX_BACKOFF_EXPONENT);
    let interval = base_secs.saturating_mul(1u64 << exponent);
    interval.min(max_minutes.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_failures_keep_base() {
        assert_eq!(backoff_secs(30, 0, 5), 30);
        assert_eq!(backoff_secs(30, -3, 5), 30);
        assert_eq!(backoff_secs(30, i64::MIN, 5), 30);
    }

    #[test]
    fn doubles_per_failure() {
        assert_eq!(backoff_secs(30, 1, 5), 60);
        assert_eq!(backoff_secs(30, 2, 5), 120);
    }

    #[test]
    fn exponent_is_capped_at_six() {
        assert_eq!(backoff_secs(30, 6, 100), 30 * 64);
        assert_eq!(backoff_secs(30, 50, 100), 30 * 64);
    }

    #[test]
    fn result_is_capped_by_max_minutes() {
        assert_eq!(backoff_secs(30, 10, 5), 300);
        assert_eq!(backoff_secs(u64::MAX, 3, 1), 60);
    }

    #[test]
    fn monotonic_in_failures_and_bounded() {
        for base in [0u64, 1, 7, 30, 300] {
            for max_minutes in [5u64, 60] {
                let mut previous = base;
                for failures in 1i64..20 {
                    let value = backoff_secs(base, failures, max_minutes);
                    assert!(value <= max_minutes * 60);
                    assert!(value >= previous);
                    previous = value;
                }
            }
        }
    }
}
