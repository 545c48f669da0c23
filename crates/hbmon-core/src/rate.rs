//! Rate derivation shared by the monitor and its clients.
//!
//! The monitor side works in fixed point: rates and goal bounds are
//! scaled by [`MEASURE_SCALE`], so a stored value of 1_000_000 is
//! 1000.0 beats per second. Client handles convert to `f64` at the
//! surface. A measure with zero elapsed time yields 0, meaning "not yet
//! available", never a division by zero.

use crate::constants::{MEASURE_SCALE, NSEC_PER_SEC};

/// Fixed-point rate: `count / (time_ns / 1e9)`, scaled by
/// [`MEASURE_SCALE`]. Zero elapsed time yields 0.
#[inline]
pub fn scaled_rate(count: u64, time_ns: u64) -> u64 {
    if time_ns == 0 {
        return 0;
    }
    ((count as u128 * NSEC_PER_SEC as u128 * MEASURE_SCALE as u128) / time_ns as u128) as u64
}

/// Floating-point rate in beats per second. Zero elapsed time yields 0.
#[inline]
pub fn rate_hz(count: u64, time_ns: u64) -> f64 {
    if time_ns == 0 {
        return 0.0;
    }
    count as f64 / time_ns as f64 * NSEC_PER_SEC as f64
}

/// Scale a goal bound for storage.
#[inline]
pub fn scale_bound(rate_hz: f64) -> u64 {
    (rate_hz * MEASURE_SCALE as f64) as u64
}

/// Recover a stored goal bound.
#[inline]
pub fn unscale_bound(scaled: u64) -> f64 {
    scaled as f64 / MEASURE_SCALE as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_time_is_zero_rate() {
        assert_eq!(scaled_rate(12345, 0), 0);
        assert_eq!(rate_hz(12345, 0), 0.0);
    }

    #[test]
    fn test_thousand_beats_per_second() {
        // 1000 beats over exactly one second.
        assert_eq!(scaled_rate(1000, NSEC_PER_SEC), 1000 * MEASURE_SCALE);
        assert!((rate_hz(1000, NSEC_PER_SEC) - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_overflow_on_large_counts() {
        // 10^10 beats over one second overflows a u64 intermediate
        // product; the widened math must still be exact.
        let count = 10_000_000_000u64;
        assert_eq!(scaled_rate(count, NSEC_PER_SEC), count * MEASURE_SCALE);
    }

    #[test]
    fn test_bound_round_trip() {
        assert_eq!(scale_bound(2.0), 2000);
        assert!((unscale_bound(2000) - 2.0).abs() < f64::EPSILON);
        assert_eq!(scale_bound(0.0), 0);
    }
}
