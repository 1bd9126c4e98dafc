use std::time::Duration;

/// Published when no usable sample exists for a cycle. Never equal to any rate.
pub const SENTINEL: f64 = f64::NAN;

/// Reports whether a published value is the sentinel.
pub fn is_sentinel(value: f64) -> bool {
    value.is_nan()
}

/// Per-second rate between two raw counter samples.
///
/// Counter decreases (device restart, wraparound) are passed through as
/// negative rates. A non-positive `elapsed` yields the sentinel.
pub fn rate(prev: i128, next: i128, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return SENTINEL;
    }

    next.saturating_sub(prev) as f64 / secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rate_over_interval() {
        assert!(approx_eq(rate(1000, 1200, Duration::from_secs(10)), 20.0));
    }

    #[test]
    fn test_rate_fractional_elapsed() {
        let r = rate(0, 1000, Duration::from_millis(10_250));
        assert!(approx_eq(r, 1000.0 / 10.25), "rate={r}");
    }

    #[test]
    fn test_unchanged_counter_is_zero_not_sentinel() {
        let r = rate(500, 500, Duration::from_secs(60));
        assert_eq!(r, 0.0);
        assert!(!is_sentinel(r));
    }

    #[test]
    fn test_counter_decrease_gives_negative_rate() {
        let r = rate(1200, 1000, Duration::from_secs(10));
        assert!(approx_eq(r, -20.0), "rate={r}");
    }

    #[test]
    fn test_zero_elapsed_is_sentinel() {
        assert!(is_sentinel(rate(1, 2, Duration::ZERO)));
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let r = rate(i128::from(i64::MIN), i128::from(u64::MAX), Duration::from_secs(1));
        assert!(r > 0.0 && r.is_finite());
    }

    #[test]
    fn test_counter64_beyond_i64_range() {
        let prev = i128::from(u64::MAX) - 2_000;
        let r = rate(prev, i128::from(u64::MAX), Duration::from_secs(10));
        assert!(approx_eq(r, 200.0), "rate={r}");
    }
}
