// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Estimation of the output size of a selective operation (e.g. a filter) on a
//! large input, from the output sizes observed on two small inputs.
//!
//! The output size is modeled by the saturating curve `f(x) = a * x / (x + b)`,
//! i.e. a scaled and stretched `x / (x + 1)`: the marginal selectivity
//! diminishes as the input grows. The ratio `f(S1) / f(S2)` of the two samples
//! only depends on `b`, and is mapped back to `b` with a lookup table; `a` is
//! then fitted so that the curve passes through the larger sample.

use std::sync::OnceLock;

/// Input size of the first (smaller) sample.
pub const SAMPLE_SIZE_1: usize = 1024;
/// Input size of the second (larger) sample.
pub const SAMPLE_SIZE_2: usize = 2048;

/// Number of entries in the ratio-to-scale lookup table.
const TABLE_SIZE: usize = 100;
/// Smallest ratio (exclusive) that can be extrapolated.
const MIN_RATIO: f64 = SAMPLE_SIZE_1 as f64 / SAMPLE_SIZE_2 as f64;
/// Width of the ratio interval covered by each table entry.
const BUCKET_WIDTH: f64 = (1.0 - MIN_RATIO) / TABLE_SIZE as f64;
/// Upper bound of the bisection. The ratio at this scale is below the center
/// of the first bucket.
const MAX_SCALE: f64 = 1e7;
const BISECTION_STEPS: usize = 128;

/// Ratio `f(S1) / f(S2)` of the curve of scale `b`, for any amplitude.
fn sample_ratio(b: f64) -> f64 {
    let s1 = SAMPLE_SIZE_1 as f64;
    let s2 = SAMPLE_SIZE_2 as f64;
    (s1 * (s2 + b)) / (s2 * (s1 + b))
}

/// Finds the scale `b` whose sample ratio is `ratio`, by bisection. The sample
/// ratio is strictly decreasing in `b`, from 1 at `b = 0` towards
/// [`MIN_RATIO`].
fn bisect_scale(ratio: f64) -> f64 {
    let mut low = 0.0;
    let mut high = MAX_SCALE;
    for _ in 0..BISECTION_STEPS {
        let mid = (low + high) / 2.0;
        if sample_ratio(mid) > ratio {
            low = mid;
        } else {
            high = mid;
        }
    }
    (low + high) / 2.0
}

/// Lookup table mapping the ratio bucket to the curve scale. Entry `i` covers
/// ratios in `[MIN_RATIO + i * BUCKET_WIDTH, MIN_RATIO + (i + 1) *
/// BUCKET_WIDTH)` and stores the scale of the bucket center.
fn scale_table() -> &'static [f64; TABLE_SIZE] {
    static TABLE: OnceLock<[f64; TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(|| {
        std::array::from_fn(|i| bisect_scale(MIN_RATIO + (i as f64 + 0.5) * BUCKET_WIDTH))
    })
}

/// Estimates the output size at `target_size` input items, given the output
/// sizes observed at [`SAMPLE_SIZE_1`] and [`SAMPLE_SIZE_2`] input items.
///
/// The result never exceeds `target_size`. If the samples aren't consistent
/// with a saturating curve (the ratio `size_at_s1 / size_at_s2` is outside
/// `(0.5, 1.0)`), the larger sample is returned as is.
pub fn estimate_result_size(size_at_s1: usize, size_at_s2: usize, target_size: usize) -> usize {
    if size_at_s2 == 0 {
        return 0;
    }
    let ratio = size_at_s1 as f64 / size_at_s2 as f64;
    if ratio <= MIN_RATIO || ratio >= 1.0 {
        return size_at_s2.min(target_size);
    }

    let bucket = (((ratio - MIN_RATIO) / BUCKET_WIDTH) as usize).min(TABLE_SIZE - 1);
    let b = scale_table()[bucket];
    let s2 = SAMPLE_SIZE_2 as f64;
    let a = size_at_s2 as f64 * (s2 + b) / s2;

    let x = target_size as f64;
    let estimate = a * x / (x + b);
    // The float-to-int conversion saturates, and NaN (for x = b = 0) maps to 0.
    (estimate.round() as usize).min(target_size)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_table_is_monotonic() {
        let table = scale_table();
        // Larger ratios mean faster saturation, hence smaller scales.
        for pair in table.windows(2) {
            assert!(pair[0] > pair[1]);
        }
        assert!(table.iter().all(|&b| b > 0.0 && b < MAX_SCALE));
        for (i, &b) in table.iter().enumerate() {
            let center = MIN_RATIO + (i as f64 + 0.5) * BUCKET_WIDTH;
            assert!((sample_ratio(b) - center).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fits_larger_sample() {
        for (s1, s2) in [(510, 1000), (700, 1000), (990, 1000), (60, 100)] {
            let estimate = estimate_result_size(s1, s2, SAMPLE_SIZE_2);
            assert!(estimate.abs_diff(s2) <= 1, "{s1} {s2} -> {estimate}");
        }
    }

    #[test]
    fn test_approximates_smaller_sample() {
        for (s1, s2) in [(510, 1000), (700, 1000), (900, 1000)] {
            let estimate = estimate_result_size(s1, s2, SAMPLE_SIZE_1);
            assert!(estimate.abs_diff(s1) <= 10, "{s1} {s2} -> {estimate}");
        }
    }

    #[test]
    fn test_saturates() {
        let mut previous = 0;
        for target in [4096, 10_000, 100_000, 1_000_000, 100_000_000] {
            let estimate = estimate_result_size(900, 1000, target);
            assert!(estimate >= previous);
            assert!(estimate >= 1000);
            previous = estimate;
        }
        // Strongly saturating samples extrapolate to a bounded output.
        assert!(estimate_result_size(990, 1000, 1 << 40) < 2000);
    }

    #[test]
    fn test_no_extrapolation_outside_ratio_range() {
        // Linear selectivity.
        assert_eq!(estimate_result_size(500, 1000, 1_000_000), 1000);
        // Output shrinking or constant as input grows.
        assert_eq!(estimate_result_size(1000, 1000, 1_000_000), 1000);
        assert_eq!(estimate_result_size(1200, 1000, 1_000_000), 1000);
        assert_eq!(estimate_result_size(1200, 1000, 10), 10);
        assert_eq!(estimate_result_size(0, 0, 1_000_000), 0);
        assert_eq!(estimate_result_size(0, 10, 1_000_000), 10);
    }

    #[test]
    fn test_never_exceeds_target() {
        for s2 in [1usize, 10, 1000, 2048, 5000] {
            for s1 in [0, s2 / 3, s2 / 2 + 1, s2 * 3 / 4, s2.saturating_sub(1), s2, s2 * 2] {
                for target in [0, 1, 5, 100, 1024, 2048, 1 << 20, usize::MAX] {
                    assert!(estimate_result_size(s1, s2, target) <= target);
                }
            }
        }
    }
}
