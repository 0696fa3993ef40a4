//! Bucketing and reduction of raw points into a coarser resolution.
//!
//! A source table holds unordered points for many series. For one series the
//! reducer partitions its points into buckets of the target frequency, keyed by
//! `timestamp - timestamp % frequency`, and collapses every non-empty bucket
//! into a single point with an [`AggregationFn`].
//!
//! ```text
//! source (300s)   0   300   600   900  ...  3300 | 3600 ...
//!                 └──────────── bucket 0 ────────┘ └─ bucket 3600
//! target (3600s)  0                               3600
//! ```
//!
//! Reduction is independent of input order: bucket values are sorted before
//! the function is applied, so even floating-point sums are bit-identical.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::retention::RetentionLevel;

/// A single metric sample: series name, timestamp in seconds, value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Series (metric) name.
    pub series: String,
    /// UTC timestamp in seconds.
    pub timestamp: u64,
    /// Sample value.
    pub value: f64,
}

impl Point {
    /// Creates a new point.
    pub fn new(series: impl Into<String>, timestamp: u64, value: f64) -> Self {
        Self {
            series: series.into(),
            timestamp,
            value,
        }
    }
}

/// Reduction function combining all values of one bucket into one value.
///
/// Every variant is insensitive to the order of its inputs. Non-finite values
/// are filtered out before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFn {
    /// Arithmetic mean of all finite values.
    Average,

    /// Minimum of all finite values.
    Min,

    /// Maximum of all finite values.
    Max,

    /// Sum of all finite values.
    Sum,

    /// Count of finite values.
    Count,
}

impl AggregationFn {
    /// Applies this function to a slice of values.
    ///
    /// Non-finite values are filtered out. If nothing remains, returns NaN.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tierdown::reduce::AggregationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    ///
    /// let avg = AggregationFn::Average.apply(&values);
    /// assert!((avg - (7.0 / 3.0)).abs() < 1e-10);
    /// assert_eq!(AggregationFn::Min.apply(&values), 1.0);
    /// assert_eq!(AggregationFn::Max.apply(&values), 4.0);
    /// assert_eq!(AggregationFn::Sum.apply(&values), 7.0);
    /// assert_eq!(AggregationFn::Count.apply(&values), 3.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // Acceptable for aggregation
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();

        if finite.is_empty() {
            return f64::NAN;
        }

        // Fixed summation order regardless of how the store returned rows.
        finite.sort_by(f64::total_cmp);

        match self {
            Self::Average => finite.iter().sum::<f64>() / finite.len() as f64,
            Self::Min => finite[0],
            Self::Max => finite[finite.len() - 1],
            Self::Sum => finite.iter().sum(),
            Self::Count => finite.len() as f64,
        }
    }

    /// Returns the lowercase configuration name of this function.
    pub fn name(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "count",
        }
    }
}

/// Returns the bucket key of `timestamp` for buckets `frequency` seconds wide.
pub fn bucket_of(timestamp: u64, frequency: u64) -> u64 {
    timestamp - timestamp % frequency
}

/// Verifies that `source` may be aggregated into `target`.
///
/// The target frequency must divide the target block size, and must be a
/// multiple of the source frequency.
///
/// # Errors
///
/// Returns [`ConfigError::FrequencyDoesNotDivideBlockSize`] or
/// [`ConfigError::FrequencyNotMultiple`].
pub fn check_divisibility(source: &RetentionLevel, target: &RetentionLevel) -> Result<()> {
    if !target.block_size().is_multiple_of(target.frequency()) {
        return Err(ConfigError::FrequencyDoesNotDivideBlockSize {
            level: target.name().to_string(),
            frequency: target.frequency(),
            block_size: target.block_size(),
        }
        .into());
    }

    if !target.frequency().is_multiple_of(source.frequency()) {
        return Err(ConfigError::FrequencyNotMultiple {
            source_level: source.name().to_string(),
            source_frequency: source.frequency(),
            target: target.name().to_string(),
            target_frequency: target.frequency(),
        }
        .into());
    }

    Ok(())
}

/// Reduces the points of one series into buckets of `frequency` seconds.
///
/// Returns one point per non-empty bucket, ordered by bucket timestamp. No
/// gap filling is performed.
///
/// # Panics
///
/// Panics if `frequency` is zero. Level frequencies are validated non-zero
/// when a configuration is loaded.
pub fn reduce<I>(series: &str, points: I, frequency: u64, function: AggregationFn) -> Vec<Point>
where
    I: IntoIterator<Item = (u64, f64)>,
{
    assert!(frequency > 0, "bucket frequency must be non-zero");

    let mut buckets: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
    for (timestamp, value) in points {
        buckets
            .entry(bucket_of(timestamp, frequency))
            .or_default()
            .push(value);
    }

    buckets
        .into_iter()
        .map(|(bucket, values)| Point::new(series, bucket, function.apply(&values)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(name: &str, frequency: u64, block_size: u64) -> RetentionLevel {
        RetentionLevel::new(name, frequency, 2, block_size, None)
    }

    #[test]
    fn test_aggregation_functions() {
        let values = [1.0, 2.0, f64::NAN, 4.0, 3.0, f64::INFINITY];

        assert!((AggregationFn::Average.apply(&values) - 2.5).abs() < f64::EPSILON);
        assert_eq!(AggregationFn::Min.apply(&values), 1.0);
        assert_eq!(AggregationFn::Max.apply(&values), 4.0);
        assert_eq!(AggregationFn::Sum.apply(&values), 10.0);
        assert_eq!(AggregationFn::Count.apply(&values), 4.0);

        assert!(AggregationFn::Max.apply(&[f64::NAN]).is_nan());
        assert!(AggregationFn::Average.apply(&[]).is_nan());
    }

    #[test]
    fn test_reduce_groups_by_bucket() {
        let points = vec![(3599, 1.0), (0, 5.0), (300, 2.0), (3600, 7.0), (7199, 1.0)];
        let reduced = reduce("cpu", points, 3600, AggregationFn::Max);

        assert_eq!(
            reduced,
            vec![Point::new("cpu", 0, 5.0), Point::new("cpu", 3600, 7.0)]
        );
    }

    #[test]
    fn test_reduce_is_order_insensitive() {
        let points: Vec<(u64, f64)> = (0u32..200)
            .map(|i| (u64::from(i) * 37 % 7200, f64::from(i) * 0.1 + 1e-9))
            .collect();
        let mut reversed = points.clone();
        reversed.reverse();
        let mut rotated = points.clone();
        rotated.rotate_left(73);

        for function in [
            AggregationFn::Average,
            AggregationFn::Sum,
            AggregationFn::Min,
            AggregationFn::Max,
            AggregationFn::Count,
        ] {
            let a = reduce("s", points.clone(), 600, function);
            let b = reduce("s", reversed.clone(), 600, function);
            let c = reduce("s", rotated.clone(), 600, function);
            assert_eq!(a, b, "{function:?} differs on reversed input");
            assert_eq!(a, c, "{function:?} differs on rotated input");
        }
    }

    #[test]
    fn test_reduce_outputs_are_bucket_aligned_and_non_empty() {
        let points = vec![(301, 1.0), (899, 2.0), (1234, 3.0), (1235, 3.0)];
        let reduced = reduce("s", points.clone(), 600, AggregationFn::Count);

        for point in &reduced {
            assert_eq!(point.timestamp % 600, 0);
            let min_in_bucket = points
                .iter()
                .filter(|(ts, _)| bucket_of(*ts, 600) == point.timestamp)
                .map(|(ts, _)| *ts)
                .min()
                .unwrap();
            assert_eq!(point.timestamp, bucket_of(min_in_bucket, 600));
            assert!(point.value >= 1.0);
        }
        assert_eq!(reduced.len(), 2);
    }

    #[test]
    fn test_reduce_duplicates_and_empty() {
        let reduced = reduce("s", vec![(10, 2.0), (10, 2.0)], 60, AggregationFn::Sum);
        assert_eq!(reduced, vec![Point::new("s", 0, 4.0)]);

        assert!(reduce("s", Vec::new(), 60, AggregationFn::Sum).is_empty());
    }

    #[test]
    fn test_check_divisibility() {
        let raw = level("raw", 300, 3600);
        let hourly = level("hourly", 3600, 604_800);
        assert!(check_divisibility(&raw, &hourly).is_ok());

        let bad_block = level("odd", 3600, 5000);
        let err = check_divisibility(&raw, &bad_block).unwrap_err();
        assert!(err.is_configuration());

        let bad_frequency = level("odd", 700, 7000);
        let err = check_divisibility(&raw, &bad_frequency).unwrap_err();
        assert!(matches!(
            err,
            crate::error::TierdownError::Config(ConfigError::FrequencyNotMultiple { .. })
        ));
    }
}
