//! Per-(device, key) value history backing `avg(last_values, n)` and
//! `stddev(last_values, n)` in expressions.
//!
//! The engine records a point's value *after* the rule pass so an expression
//! always sees the values that preceded the point under evaluation.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Default retained samples per series.
pub const DEFAULT_SERIES_DEPTH: usize = 64;

pub struct SeriesHistory {
    series: DashMap<(String, String), VecDeque<f64>>,
    depth: usize,
}

impl SeriesHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            series: DashMap::new(),
            depth: depth.max(1),
        }
    }

    /// Snapshot of the series for (device, key), oldest first. `None` when
    /// the pair has never produced a numeric value.
    pub fn values(&self, device_id: &str, key: &str) -> Option<Vec<f64>> {
        self.series
            .get(&(device_id.to_string(), key.to_string()))
            .map(|buf| buf.iter().copied().collect())
    }

    /// Append one value, trimming to the configured depth.
    pub fn record(&self, device_id: &str, key: &str, value: f64) {
        let mut buf = self
            .series
            .entry((device_id.to_string(), key.to_string()))
            .or_default();
        if buf.len() >= self.depth {
            buf.pop_front();
        }
        buf.push_back(value);
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

impl Default for SeriesHistory {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separate_series_per_device_key() {
        let history = SeriesHistory::new(8);
        history.record("a", "temp", 1.0);
        history.record("a", "rpm", 2.0);
        history.record("b", "temp", 3.0);
        assert_eq!(history.values("a", "temp").unwrap(), vec![1.0]);
        assert_eq!(history.values("b", "temp").unwrap(), vec![3.0]);
        assert!(history.values("b", "rpm").is_none());
    }

    #[test]
    fn depth_bounded() {
        let history = SeriesHistory::new(3);
        for i in 0..10 {
            history.record("d", "k", f64::from(i));
        }
        assert_eq!(history.values("d", "k").unwrap(), vec![7.0, 8.0, 9.0]);
    }
}
