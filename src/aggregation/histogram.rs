//! Bounded-error streaming quantile estimator.
//!
//! Exact while small: the first `COLLAPSE_AT` samples are kept verbatim, so
//! short windows read perfect quantiles. Past that the samples collapse into
//! a fixed-width bucket histogram over the observed range; out-of-range
//! samples widen the range and rebin by bucket midpoint. Error is bounded by
//! the bucket width at all times, updates stay O(1) amortised and quantile
//! reads are O(buckets).

/// Number of fixed-width buckets after collapse.
const BUCKET_COUNT: usize = 128;

/// Exact-sample threshold before collapsing into buckets.
const COLLAPSE_AT: usize = 256;

#[derive(Debug, Clone)]
pub struct StreamingHistogram {
    /// Exact samples until collapse
    samples: Vec<f64>,
    /// Bucket counts after collapse
    counts: Vec<u64>,
    lo: f64,
    hi: f64,
    total: u64,
    collapsed: bool,
}

impl Default for StreamingHistogram {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            counts: Vec::new(),
            lo: 0.0,
            hi: 0.0,
            total: 0,
            collapsed: false,
        }
    }
}

impl StreamingHistogram {
    pub fn insert(&mut self, value: f64) {
        self.total += 1;
        if !self.collapsed {
            self.samples.push(value);
            if self.samples.len() >= COLLAPSE_AT {
                self.collapse();
            }
            return;
        }
        if value < self.lo || value > self.hi {
            self.widen(value.min(self.lo), value.max(self.hi));
        }
        let idx = self.bucket_index(value);
        self.counts[idx] += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Read the q-quantile (0 < q < 1). Exact before collapse, bucket
    /// midpoint after.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        if !self.collapsed {
            let mut sorted = self.samples.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            // Linear interpolation between closest ranks.
            let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
            let below = rank.floor() as usize;
            let above = rank.ceil() as usize;
            if below == above {
                return sorted[below];
            }
            let frac = rank - below as f64;
            return sorted[below] * (1.0 - frac) + sorted[above] * frac;
        }

        let target = (q.clamp(0.0, 1.0) * self.total as f64).ceil().max(1.0) as u64;
        let width = (self.hi - self.lo) / BUCKET_COUNT as f64;
        let mut seen = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                return self.lo + (i as f64 + 0.5) * width;
            }
        }
        self.hi
    }

    /// Merge another histogram into this one.
    pub fn merge(&mut self, other: &StreamingHistogram) {
        if other.total == 0 {
            return;
        }
        if !other.collapsed {
            for v in &other.samples {
                // `insert` bumps total; adjust afterwards.
                self.insert(*v);
                self.total -= 1;
            }
            self.total += other.samples.len() as u64;
            return;
        }
        if !self.collapsed {
            self.collapse_with_range(
                other.lo.min(self.observed_lo()),
                other.hi.max(self.observed_hi()),
            );
        } else if other.lo < self.lo || other.hi > self.hi {
            self.widen(self.lo.min(other.lo), self.hi.max(other.hi));
        }
        let width = (other.hi - other.lo) / BUCKET_COUNT as f64;
        for (i, count) in other.counts.iter().enumerate() {
            if *count > 0 {
                let midpoint = other.lo + (i as f64 + 0.5) * width;
                let idx = self.bucket_index(midpoint);
                self.counts[idx] += count;
            }
        }
        self.total += other.total;
    }

    fn observed_lo(&self) -> f64 {
        self.samples.iter().copied().fold(f64::INFINITY, f64::min)
    }

    fn observed_hi(&self) -> f64 {
        self.samples
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    fn collapse(&mut self) {
        let lo = self.observed_lo();
        let hi = self.observed_hi();
        self.collapse_with_range(lo, hi);
    }

    fn collapse_with_range(&mut self, lo: f64, hi: f64) {
        // Pad a degenerate range so bucket width is never zero.
        let (lo, hi) = if (hi - lo).abs() < f64::EPSILON {
            (lo - 0.5, hi + 0.5)
        } else {
            (lo, hi)
        };
        self.lo = lo;
        self.hi = hi;
        self.counts = vec![0; BUCKET_COUNT];
        self.collapsed = true;
        let samples = std::mem::take(&mut self.samples);
        for v in samples {
            let idx = self.bucket_index(v);
            self.counts[idx] += 1;
        }
    }

    /// Grow the range to cover [lo, hi], rebinning old counts by midpoint.
    fn widen(&mut self, lo: f64, hi: f64) {
        let old_counts = std::mem::replace(&mut self.counts, vec![0; BUCKET_COUNT]);
        let old_lo = self.lo;
        let old_width = (self.hi - self.lo) / BUCKET_COUNT as f64;
        self.lo = lo;
        self.hi = hi;
        for (i, count) in old_counts.iter().enumerate() {
            if *count > 0 {
                let midpoint = old_lo + (i as f64 + 0.5) * old_width;
                let idx = self.bucket_index(midpoint);
                self.counts[idx] += count;
            }
        }
    }

    fn bucket_index(&self, value: f64) -> usize {
        let width = (self.hi - self.lo) / BUCKET_COUNT as f64;
        let idx = ((value - self.lo) / width) as usize;
        idx.min(BUCKET_COUNT - 1)
    }
}
