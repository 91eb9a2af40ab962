//! Incremental statistics accumulator.
//!
//! Every update is O(1): Welford recurrences for variance and covariance,
//! Kahan compensation for long-running sums, and a bounded-error streaming
//! histogram for quantiles (O(buckets) read). Accumulators are mergeable so
//! sliding windows can combine per-pane state on emit.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::histogram::StreamingHistogram;

/// Z-score beyond which an update counts as an outlier.
pub const DEFAULT_OUTLIER_SIGMA: f64 = 3.0;

/// Samples required before outlier detection engages (a running std over
/// fewer points is meaningless).
const OUTLIER_MIN_SAMPLES: u64 = 3;

// ============================================================================
// Functions
// ============================================================================

/// Aggregate functions a rule may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Variance,
    VariancePop,
    Stddev,
    StddevPop,
    Median,
    P25,
    P50,
    P75,
    P90,
    P95,
    P99,
    Outliers,
    TrendSlope,
    Range,
    AboveCount,
    BelowCount,
    InRangeCount,
    Completeness,
    NullRate,
    Change,
    ChangeRate,
    Volatility,
    Cv,
}

impl AggregateFunction {
    pub fn name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Variance => "variance",
            AggregateFunction::VariancePop => "variance_pop",
            AggregateFunction::Stddev => "stddev",
            AggregateFunction::StddevPop => "stddev_pop",
            AggregateFunction::Median => "median",
            AggregateFunction::P25 => "p25",
            AggregateFunction::P50 => "p50",
            AggregateFunction::P75 => "p75",
            AggregateFunction::P90 => "p90",
            AggregateFunction::P95 => "p95",
            AggregateFunction::P99 => "p99",
            AggregateFunction::Outliers => "outliers",
            AggregateFunction::TrendSlope => "trend_slope",
            AggregateFunction::Range => "range",
            AggregateFunction::AboveCount => "above_count",
            AggregateFunction::BelowCount => "below_count",
            AggregateFunction::InRangeCount => "in_range_count",
            AggregateFunction::Completeness => "completeness",
            AggregateFunction::NullRate => "null_rate",
            AggregateFunction::Change => "change",
            AggregateFunction::ChangeRate => "change_rate",
            AggregateFunction::Volatility => "volatility",
            AggregateFunction::Cv => "cv",
        }
    }
}

impl FromStr for AggregateFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let f = match s.to_ascii_lowercase().as_str() {
            "count" => AggregateFunction::Count,
            "sum" => AggregateFunction::Sum,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            "avg" | "mean" => AggregateFunction::Avg,
            "variance" | "variance_samp" => AggregateFunction::Variance,
            "variance_pop" => AggregateFunction::VariancePop,
            "stddev" | "stddev_samp" => AggregateFunction::Stddev,
            "stddev_pop" => AggregateFunction::StddevPop,
            "median" => AggregateFunction::Median,
            "p25" => AggregateFunction::P25,
            "p50" => AggregateFunction::P50,
            "p75" => AggregateFunction::P75,
            "p90" => AggregateFunction::P90,
            "p95" => AggregateFunction::P95,
            "p99" => AggregateFunction::P99,
            "outliers" | "outlier_count" => AggregateFunction::Outliers,
            "trend_slope" | "trend" => AggregateFunction::TrendSlope,
            "range" => AggregateFunction::Range,
            "above_count" => AggregateFunction::AboveCount,
            "below_count" => AggregateFunction::BelowCount,
            "in_range_count" => AggregateFunction::InRangeCount,
            "completeness" => AggregateFunction::Completeness,
            "null_rate" => AggregateFunction::NullRate,
            "change" => AggregateFunction::Change,
            "change_rate" => AggregateFunction::ChangeRate,
            "volatility" => AggregateFunction::Volatility,
            "cv" | "coefficient_of_variation" => AggregateFunction::Cv,
            other => return Err(format!("unknown aggregate function '{other}'")),
        };
        Ok(f)
    }
}

// ============================================================================
// Thresholds
// ============================================================================

/// Optional threshold configuration for counting functions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_high: Option<f64>,
    /// Z-score for the outlier counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_sigma: Option<f64>,
    /// Expected sample spacing, used by `completeness`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_interval_ms: Option<u64>,
}

// ============================================================================
// Kahan-compensated sum
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    fn add(&mut self, v: f64) {
        let y = v - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    fn merge(&mut self, other: &KahanSum) {
        self.add(other.sum);
        self.add(-other.compensation);
    }

    fn value(self) -> f64 {
        self.sum - self.compensation
    }
}

// ============================================================================
// Welford running moments
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn add(&mut self, v: f64) {
        self.count += 1;
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (v - self.mean);
    }

    /// Chan et al. parallel combination.
    fn merge(&mut self, other: &Welford) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.mean += delta * other.count as f64 / total as f64;
        self.count = total;
    }

    fn variance_pop(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    fn variance_samp(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

// ============================================================================
// Incremental regression (slope of value over time)
// ============================================================================

/// Co-moment form of simple linear regression: slope = C / M2x. Stable and
/// mergeable, unlike raw power sums.
#[derive(Debug, Clone, Copy, Default)]
struct TrendState {
    count: u64,
    mean_x: f64,
    mean_y: f64,
    comoment: f64,
    m2x: f64,
}

impl TrendState {
    fn add(&mut self, x: f64, y: f64) {
        self.count += 1;
        let n = self.count as f64;
        let dx = x - self.mean_x;
        self.mean_x += dx / n;
        self.mean_y += (y - self.mean_y) / n;
        self.comoment += dx * (y - self.mean_y);
        self.m2x += dx * (x - self.mean_x);
    }

    fn merge(&mut self, other: &TrendState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = (self.count + other.count) as f64;
        let dx = other.mean_x - self.mean_x;
        let dy = other.mean_y - self.mean_y;
        let w = self.count as f64 * other.count as f64 / total;
        self.comoment += other.comoment + dx * dy * w;
        self.m2x += other.m2x + dx * dx * w;
        self.mean_x += dx * other.count as f64 / total;
        self.mean_y += dy * other.count as f64 / total;
        self.count += other.count;
    }

    /// Units: value per second.
    fn slope(&self) -> f64 {
        if self.count < 2 || self.m2x.abs() < f64::EPSILON {
            0.0
        } else {
            self.comoment / self.m2x
        }
    }
}

// ============================================================================
// Accumulator
// ============================================================================

/// All incremental state for one window (or one pane of a sliding window).
#[derive(Debug, Clone)]
pub struct Accumulator {
    thresholds: Thresholds,
    count: u64,
    nulls: u64,
    sum: KahanSum,
    min: f64,
    max: f64,
    moments: Welford,
    delta_moments: Welford,
    trend: TrendState,
    histogram: StreamingHistogram,
    first: Option<(DateTime<Utc>, f64)>,
    last: Option<(DateTime<Utc>, f64)>,
    outliers: u64,
    above: u64,
    below: u64,
    in_range: u64,
}

impl Accumulator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            count: 0,
            nulls: 0,
            sum: KahanSum::default(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            moments: Welford::default(),
            delta_moments: Welford::default(),
            trend: TrendState::default(),
            histogram: StreamingHistogram::default(),
            first: None,
            last: None,
            outliers: 0,
            above: 0,
            below: 0,
            in_range: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.nulls == 0
    }

    /// Record one numeric sample. O(1).
    pub fn update(&mut self, timestamp: DateTime<Utc>, value: f64) {
        // Outlier check against the running distribution *before* this
        // sample shifts it.
        if self.moments.count >= OUTLIER_MIN_SAMPLES {
            let std = self.moments.variance_pop().sqrt();
            if std > f64::EPSILON {
                let sigma = self
                    .thresholds
                    .outlier_sigma
                    .unwrap_or(DEFAULT_OUTLIER_SIGMA);
                if ((value - self.moments.mean) / std).abs() > sigma {
                    self.outliers += 1;
                }
            }
        }

        if let Some((_, prev)) = self.last {
            self.delta_moments.add(value - prev);
        }

        self.count += 1;
        self.sum.add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.moments.add(value);
        // x in epoch milliseconds scaled to seconds; co-moment form keeps
        // this stable despite the large origin.
        self.trend
            .add(timestamp.timestamp_millis() as f64 / 1_000.0, value);
        self.histogram.insert(value);

        if self.first.is_none() {
            self.first = Some((timestamp, value));
        }
        self.last = Some((timestamp, value));

        if let Some(t) = self.thresholds.above {
            if value > t {
                self.above += 1;
            }
        }
        if let Some(t) = self.thresholds.below {
            if value < t {
                self.below += 1;
            }
        }
        if let (Some(lo), Some(hi)) = (self.thresholds.range_low, self.thresholds.range_high) {
            if value >= lo && value <= hi {
                self.in_range += 1;
            }
        }
    }

    /// Record a sample whose value had no numeric representation.
    pub fn record_null(&mut self) {
        self.nulls += 1;
    }

    /// Combine with a later accumulator (sliding-window pane merge).
    /// `other` must cover a time range at or after `self`.
    pub fn merge(&mut self, other: &Accumulator) {
        if other.is_empty() {
            return;
        }
        // Boundary delta between the panes, then the pane-internal deltas.
        if let (Some((_, last)), Some((_, first))) = (self.last, other.first) {
            self.delta_moments.add(first - last);
        }
        self.delta_moments.merge(&other.delta_moments);

        self.count += other.count;
        self.nulls += other.nulls;
        self.sum.merge(&other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.moments.merge(&other.moments);
        self.trend.merge(&other.trend);
        self.histogram.merge(&other.histogram);
        self.outliers += other.outliers;
        self.above += other.above;
        self.below += other.below;
        self.in_range += other.in_range;

        if self.first.is_none() {
            self.first = other.first;
        }
        if other.last.is_some() {
            self.last = other.last;
        }
    }

    /// Read one aggregate function. O(1) except quantiles (O(buckets)).
    pub fn value_of(&self, func: AggregateFunction, window: Duration) -> f64 {
        match func {
            AggregateFunction::Count => self.count as f64,
            AggregateFunction::Sum => self.sum.value(),
            AggregateFunction::Min => {
                if self.count == 0 {
                    0.0
                } else {
                    self.min
                }
            }
            AggregateFunction::Max => {
                if self.count == 0 {
                    0.0
                } else {
                    self.max
                }
            }
            AggregateFunction::Avg => self.moments.mean,
            AggregateFunction::Variance => self.moments.variance_samp(),
            AggregateFunction::VariancePop => self.moments.variance_pop(),
            AggregateFunction::Stddev => self.moments.variance_samp().sqrt(),
            AggregateFunction::StddevPop => self.moments.variance_pop().sqrt(),
            AggregateFunction::Median | AggregateFunction::P50 => self.histogram.quantile(0.50),
            AggregateFunction::P25 => self.histogram.quantile(0.25),
            AggregateFunction::P75 => self.histogram.quantile(0.75),
            AggregateFunction::P90 => self.histogram.quantile(0.90),
            AggregateFunction::P95 => self.histogram.quantile(0.95),
            AggregateFunction::P99 => self.histogram.quantile(0.99),
            AggregateFunction::Outliers => self.outliers as f64,
            AggregateFunction::TrendSlope => self.trend.slope(),
            AggregateFunction::Range => {
                if self.count == 0 {
                    0.0
                } else {
                    self.max - self.min
                }
            }
            AggregateFunction::AboveCount => self.above as f64,
            AggregateFunction::BelowCount => self.below as f64,
            AggregateFunction::InRangeCount => self.in_range as f64,
            AggregateFunction::Completeness => {
                match self.thresholds.expected_interval_ms {
                    Some(interval_ms) if interval_ms > 0 => {
                        let expected = window.as_millis() as f64 / interval_ms as f64;
                        if expected <= 0.0 {
                            1.0
                        } else {
                            (self.count as f64 / expected).min(1.0)
                        }
                    }
                    _ => {
                        if self.count > 0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                }
            }
            AggregateFunction::NullRate => {
                let total = self.count + self.nulls;
                if total == 0 {
                    0.0
                } else {
                    self.nulls as f64 / total as f64
                }
            }
            AggregateFunction::Change => match (self.first, self.last) {
                (Some((_, f)), Some((_, l))) => l - f,
                _ => 0.0,
            },
            AggregateFunction::ChangeRate => match (self.first, self.last) {
                (Some((t0, f)), Some((t1, l))) => {
                    let secs = (t1 - t0).num_milliseconds() as f64 / 1_000.0;
                    if secs.abs() < f64::EPSILON {
                        0.0
                    } else {
                        (l - f) / secs
                    }
                }
                _ => 0.0,
            },
            AggregateFunction::Volatility => self.delta_moments.variance_samp().sqrt(),
            AggregateFunction::Cv => {
                if self.moments.mean.abs() < f64::EPSILON {
                    0.0
                } else {
                    self.moments.variance_samp().sqrt() / self.moments.mean.abs()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use statrs::statistics::Statistics;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn fill(values: &[f64]) -> Accumulator {
        let mut acc = Accumulator::new(Thresholds::default());
        for (i, v) in values.iter().enumerate() {
            acc.update(ts(i as i64), *v);
        }
        acc
    }

    #[test]
    fn basic_stats_match_reference() {
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        let acc = fill(&values);
        let w = Duration::from_secs(5);
        assert_eq!(acc.value_of(AggregateFunction::Count, w), 5.0);
        assert!((acc.value_of(AggregateFunction::Avg, w) - values.iter().copied().mean()).abs() < 1e-9);
        assert!(
            (acc.value_of(AggregateFunction::Stddev, w) - values.iter().copied().std_dev()).abs()
                < 1e-9
        );
        assert_eq!(acc.value_of(AggregateFunction::Min, w), 10.0);
        assert_eq!(acc.value_of(AggregateFunction::Max, w), 50.0);
        assert_eq!(acc.value_of(AggregateFunction::Range, w), 40.0);
        assert_eq!(acc.value_of(AggregateFunction::Sum, w), 150.0);
    }

    #[test]
    fn trend_slope_recovers_linear_signal() {
        // y = 3x + 7, one sample per second
        let mut acc = Accumulator::new(Thresholds::default());
        for i in 0..60 {
            acc.update(ts(i), 3.0 * i as f64 + 7.0);
        }
        let slope = acc.value_of(AggregateFunction::TrendSlope, Duration::from_secs(60));
        assert!((slope - 3.0).abs() < 1e-6, "slope was {slope}");
    }

    #[test]
    fn change_and_rate() {
        let acc = fill(&[100.0, 110.0, 130.0]);
        let w = Duration::from_secs(3);
        assert_eq!(acc.value_of(AggregateFunction::Change, w), 30.0);
        // 30 over 2 seconds
        assert!((acc.value_of(AggregateFunction::ChangeRate, w) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn merge_equals_single_pass() {
        let all = [1.0, 4.0, 2.0, 8.0, 5.0, 7.0, 3.0, 6.0];
        let whole = fill(&all);

        let mut left = Accumulator::new(Thresholds::default());
        for (i, v) in all[..4].iter().enumerate() {
            left.update(ts(i as i64), *v);
        }
        let mut right = Accumulator::new(Thresholds::default());
        for (i, v) in all[4..].iter().enumerate() {
            right.update(ts(4 + i as i64), *v);
        }
        left.merge(&right);

        let w = Duration::from_secs(8);
        for func in [
            AggregateFunction::Count,
            AggregateFunction::Sum,
            AggregateFunction::Avg,
            AggregateFunction::Stddev,
            AggregateFunction::Min,
            AggregateFunction::Max,
            AggregateFunction::Change,
            AggregateFunction::TrendSlope,
            AggregateFunction::Volatility,
        ] {
            let a = whole.value_of(func, w);
            let b = left.value_of(func, w);
            assert!((a - b).abs() < 1e-9, "{}: {a} vs {b}", func.name());
        }
    }

    #[test]
    fn outliers_counted_beyond_sigma() {
        let mut acc = Accumulator::new(Thresholds::default());
        for i in 0..50 {
            acc.update(ts(i), 10.0 + (i % 3) as f64 * 0.1);
        }
        acc.update(ts(50), 500.0);
        assert_eq!(acc.value_of(AggregateFunction::Outliers, Duration::from_secs(51)), 1.0);
    }

    #[test]
    fn threshold_counters() {
        let thresholds = Thresholds {
            above: Some(25.0),
            below: Some(15.0),
            range_low: Some(15.0),
            range_high: Some(35.0),
            ..Thresholds::default()
        };
        let mut acc = Accumulator::new(thresholds);
        for (i, v) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
            acc.update(ts(i as i64), *v);
        }
        let w = Duration::from_secs(4);
        assert_eq!(acc.value_of(AggregateFunction::AboveCount, w), 2.0);
        assert_eq!(acc.value_of(AggregateFunction::BelowCount, w), 1.0);
        assert_eq!(acc.value_of(AggregateFunction::InRangeCount, w), 2.0);
    }

    #[test]
    fn null_rate() {
        let mut acc = fill(&[1.0, 2.0, 3.0]);
        acc.record_null();
        assert!((acc.value_of(AggregateFunction::NullRate, Duration::from_secs(4)) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn completeness_against_expected_interval() {
        let thresholds = Thresholds {
            expected_interval_ms: Some(1_000),
            ..Thresholds::default()
        };
        let mut acc = Accumulator::new(thresholds);
        for i in 0..5 {
            acc.update(ts(i * 2), 1.0); // every other second
        }
        let completeness = acc.value_of(AggregateFunction::Completeness, Duration::from_secs(10));
        assert!((completeness - 0.5).abs() < 1e-9);
    }

    #[test]
    fn function_parsing() {
        assert_eq!("avg".parse::<AggregateFunction>().unwrap(), AggregateFunction::Avg);
        assert_eq!("mean".parse::<AggregateFunction>().unwrap(), AggregateFunction::Avg);
        assert_eq!("p95".parse::<AggregateFunction>().unwrap(), AggregateFunction::P95);
        assert!("frobnicate".parse::<AggregateFunction>().is_err());
    }

    #[test]
    fn quantiles_on_small_sets_are_exact() {
        let acc = fill(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        let w = Duration::from_secs(10);
        let median = acc.value_of(AggregateFunction::Median, w);
        assert!((median - 5.5).abs() <= 0.5, "median was {median}");
        let p90 = acc.value_of(AggregateFunction::P90, w);
        assert!(p90 >= 9.0, "p90 was {p90}");
    }
}
