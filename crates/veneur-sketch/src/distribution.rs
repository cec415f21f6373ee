// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::SketchError;

/// Default relative accuracy when none is configured.
pub const DEFAULT_ACCURACY: f64 = 0.01;

/// A log-bucketed distribution sketch with a fixed relative-error guarantee.
///
/// Values are mapped to buckets indexed by `ceil(log_gamma(x))` where
/// `gamma = (1 + alpha) / (1 - alpha)` for relative accuracy `alpha`; a
/// quantile query returns a value within `alpha * x` of the true quantile
/// `x`. Bucket count grows with the dynamic range of the data, not with the
/// number of inserts. Exact `min`, `max`, `count`, and `sum` are carried
/// alongside the buckets since the exporter needs them anyway and they cost
/// four words.
///
/// Non-positive values land in a dedicated zero bucket; the sketch's error
/// guarantee applies to the positive range, which is all the ingest path
/// produces for timers and histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistSketch {
    gamma: f64,
    bins: BTreeMap<i32, u64>,
    zero_count: u64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl DistSketch {
    pub fn new(relative_accuracy: f64) -> Result<Self, SketchError> {
        if !relative_accuracy.is_finite() || relative_accuracy <= 0.0 || relative_accuracy >= 1.0 {
            return Err(SketchError::InvalidAccuracy(relative_accuracy));
        }
        Ok(DistSketch {
            gamma: (1.0 + relative_accuracy) / (1.0 - relative_accuracy),
            bins: BTreeMap::new(),
            zero_count: 0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        })
    }

    fn bucket_index(&self, value: f64) -> i32 {
        (value.ln() / self.gamma.ln()).ceil() as i32
    }

    fn bucket_value(&self, index: i32) -> f64 {
        // Midpoint estimator: 2 * gamma^i / (gamma + 1) halves the worst-case
        // error relative to the bucket's upper bound.
        2.0 * self.gamma.powi(index) / (self.gamma + 1.0)
    }

    /// Inserts one observation. Non-finite values are ignored.
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if value > 0.0 {
            *self.bins.entry(self.bucket_index(value)).or_insert(0) += 1;
        } else {
            self.zero_count += 1;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Merges another sketch of the same precision into this one. Merge is
    /// associative and commutative: bucket counts add, extrema combine.
    pub fn merge(&mut self, other: &DistSketch) -> Result<(), SketchError> {
        if self.gamma.to_bits() != other.gamma.to_bits() {
            return Err(SketchError::PrecisionMismatch(self.gamma, other.gamma));
        }
        for (&index, &count) in &other.bins {
            *self.bins.entry(index).or_insert(0) += count;
        }
        self.zero_count += other.zero_count;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }

    /// Returns the estimated value at quantile `q`, clamped into
    /// `[min, max]` so the estimate can never escape the observed range.
    pub fn quantile(&self, q: f64) -> Result<f64, SketchError> {
        if !(0.0..=1.0).contains(&q) {
            return Err(SketchError::InvalidQuantile(q));
        }
        if self.count == 0 {
            return Err(SketchError::Empty);
        }

        let rank = (q * (self.count - 1) as f64) as u64;
        if rank < self.zero_count {
            return Ok(self.min.min(0.0));
        }

        let mut seen = self.zero_count;
        for (&index, &count) in &self.bins {
            seen += count;
            if rank < seen {
                return Ok(self.bucket_value(index).clamp(self.min, self.max));
            }
        }
        Ok(self.max)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of occupied buckets; memory is proportional to this, which is
    /// bounded by the data's dynamic range rather than the insert count.
    pub fn bucket_count(&self) -> usize {
        self.bins.len() + usize::from(self.zero_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_sketch(n: u64, upper: f64) -> DistSketch {
        let mut sketch = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        for i in 0..n {
            sketch.insert((i as f64 + 0.5) * upper / n as f64);
        }
        sketch
    }

    #[test]
    fn test_new_rejects_bad_accuracy() {
        assert!(DistSketch::new(0.0).is_err());
        assert!(DistSketch::new(1.0).is_err());
        assert!(DistSketch::new(-0.1).is_err());
        assert!(DistSketch::new(f64::NAN).is_err());
    }

    #[test]
    fn test_empty_sketch() {
        let sketch = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), Err(SketchError::Empty));
        assert_eq!(sketch.min(), None);
        assert_eq!(sketch.max(), None);
    }

    #[test]
    fn test_quantiles_within_relative_error() {
        let sketch = uniform_sketch(10_000, 1000.0);
        assert_eq!(sketch.count(), 10_000);

        let p50 = sketch.quantile(0.5).unwrap();
        assert!((450.0..=550.0).contains(&p50), "p50 was {p50}");

        let p99 = sketch.quantile(0.99).unwrap();
        assert!((960.0..=1000.0).contains(&p99), "p99 was {p99}");
    }

    #[test]
    fn test_quantiles_bounded_by_extrema_and_monotone() {
        let sketch = uniform_sketch(5_000, 320.0);
        let min = sketch.min().unwrap();
        let max = sketch.max().unwrap();
        let mut prev = f64::NEG_INFINITY;
        for q in [0.0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 1.0] {
            let value = sketch.quantile(q).unwrap();
            assert!(value >= min && value <= max, "q{q} = {value} outside range");
            assert!(value >= prev, "quantiles must be monotone in q");
            prev = value;
        }
    }

    #[test]
    fn test_quantile_rejects_out_of_range() {
        let sketch = uniform_sketch(10, 10.0);
        assert!(sketch.quantile(-0.1).is_err());
        assert!(sketch.quantile(1.1).is_err());
    }

    #[test]
    fn test_merge_matches_single_sketch() {
        let mut left = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        let mut right = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        let mut all = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        for i in 0..1000 {
            let value = 1.0 + i as f64;
            if i % 2 == 0 {
                left.insert(value);
            } else {
                right.insert(value);
            }
            all.insert(value);
        }
        left.merge(&right).unwrap();
        assert_eq!(left.count(), all.count());
        assert_eq!(left.min(), all.min());
        assert_eq!(left.max(), all.max());
        for q in [0.5, 0.9, 0.99] {
            let merged = left.quantile(q).unwrap();
            let single = all.quantile(q).unwrap();
            assert!(
                (merged - single).abs() <= 2.0 * DEFAULT_ACCURACY * single,
                "q{q}: merged {merged} vs single {single}"
            );
        }
    }

    #[test]
    fn test_merge_is_commutative_bitwise() {
        let mut a = uniform_sketch(500, 100.0);
        let mut b = uniform_sketch(300, 5000.0);
        let (a0, b0) = (a.clone(), b.clone());

        a.merge(&b0).unwrap();
        b.merge(&a0).unwrap();

        // Serialized forms must match byte for byte.
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn test_merge_rejects_precision_mismatch() {
        let mut a = DistSketch::new(0.01).unwrap();
        let b = DistSketch::new(0.05).unwrap();
        assert!(matches!(
            a.merge(&b),
            Err(SketchError::PrecisionMismatch(_, _))
        ));
    }

    #[test]
    fn test_zero_and_negative_values() {
        let mut sketch = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        sketch.insert(0.0);
        sketch.insert(0.0);
        sketch.insert(10.0);
        assert_eq!(sketch.count(), 3);
        assert_eq!(sketch.min(), Some(0.0));
        assert_eq!(sketch.quantile(0.0).unwrap(), 0.0);
        assert_eq!(sketch.quantile(1.0).unwrap(), 10.0);
    }

    #[test]
    fn test_memory_bounded_by_range_not_inserts() {
        let mut sketch = DistSketch::new(DEFAULT_ACCURACY).unwrap();
        for i in 0..100_000u64 {
            sketch.insert(1.0 + (i % 1000) as f64);
        }
        // 1..=1000 at 1% accuracy is a few hundred buckets at most.
        assert!(sketch.bucket_count() < 1000);
    }

    #[test]
    fn test_serialization_round_trip() {
        let sketch = uniform_sketch(100, 50.0);
        let bytes = serde_json::to_vec(&sketch).unwrap();
        let back: DistSketch = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, sketch);
        assert_eq!(
            back.quantile(0.9).unwrap(),
            sketch.quantile(0.9).unwrap()
        );
    }
}
