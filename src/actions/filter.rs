//! Filter action: per-key predicates deciding pass or suppress.
//!
//! Predicates: range check, dedup (value within epsilon of the last seen
//! inside a time window), token-bucket rate limit, regex pattern match and
//! Z-score outlier rejection. A passing point re-publishes with a tag
//! naming the deciding predicate; a suppressed point reports
//! `{filtered: true}` and goes nowhere.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::bus::BatchPublisher;
use crate::metrics::GatewayMetrics;
use crate::rules::RegexCache;
use crate::types::{ActionSpec, DataPoint, Rule, Value};

use super::{ActionEnv, ActionHandler, ActionOutcome};

/// Tag recording which predicate let a point through.
pub const DECIDED_BY_TAG: &str = "filter.decided_by";

#[derive(Debug, Deserialize)]
#[serde(tag = "predicate", rename_all = "snake_case")]
enum FilterConfig {
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(flatten)]
        output: OutputConfig,
    },
    Dedup {
        epsilon: f64,
        /// A repeat older than this window passes regardless of epsilon
        window_secs: f64,
        #[serde(flatten)]
        output: OutputConfig,
    },
    RateLimit {
        /// Bucket capacity (burst)
        capacity: f64,
        refill_per_sec: f64,
        #[serde(flatten)]
        output: OutputConfig,
    },
    Pattern {
        pattern: String,
        #[serde(flatten)]
        output: OutputConfig,
    },
    Zscore {
        /// Trailing samples the score is computed against
        window: usize,
        threshold: f64,
        #[serde(flatten)]
        output: OutputConfig,
    },
}

#[derive(Debug, Default, Deserialize)]
struct OutputConfig {
    #[serde(default)]
    subject: Option<String>,
}

impl FilterConfig {
    fn predicate_name(&self) -> &'static str {
        match self {
            FilterConfig::Range { .. } => "range",
            FilterConfig::Dedup { .. } => "dedup",
            FilterConfig::RateLimit { .. } => "rate_limit",
            FilterConfig::Pattern { .. } => "pattern",
            FilterConfig::Zscore { .. } => "zscore",
        }
    }

    fn output(&self) -> &OutputConfig {
        match self {
            FilterConfig::Range { output, .. }
            | FilterConfig::Dedup { output, .. }
            | FilterConfig::RateLimit { output, .. }
            | FilterConfig::Pattern { output, .. }
            | FilterConfig::Zscore { output, .. } => output,
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    /// Dedup memory
    last_passed: Option<(Instant, f64)>,
    /// Token bucket
    tokens: f64,
    last_refill: Option<Instant>,
    /// Z-score trailing window
    window: VecDeque<f64>,
}

pub struct FilterAction {
    publisher: BatchPublisher,
    metrics: Arc<GatewayMetrics>,
    regexes: Arc<RegexCache>,
    states: dashmap::DashMap<String, KeyState>,
}

impl FilterAction {
    pub fn new(env: &ActionEnv) -> Self {
        Self {
            publisher: env.publisher.clone(),
            metrics: Arc::clone(&env.metrics),
            regexes: Arc::clone(&env.regexes),
            states: dashmap::DashMap::new(),
        }
    }

    /// Apply the predicate. `Ok(true)` passes, `Ok(false)` suppresses.
    fn decide(&self, config: &FilterConfig, key: &str, point: &DataPoint) -> Result<bool, String> {
        match config {
            FilterConfig::Range { min, max, .. } => {
                let v = numeric(point)?;
                Ok(min.is_none_or(|m| v >= m) && max.is_none_or(|m| v <= m))
            }

            FilterConfig::Dedup {
                epsilon,
                window_secs,
                ..
            } => {
                let v = numeric(point)?;
                let mut state = self.states.entry(key.to_string()).or_default();
                let pass = match state.last_passed {
                    Some((at, prev)) => {
                        at.elapsed().as_secs_f64() > *window_secs || (v - prev).abs() >= *epsilon
                    }
                    None => true,
                };
                if pass {
                    state.last_passed = Some((Instant::now(), v));
                }
                Ok(pass)
            }

            FilterConfig::RateLimit {
                capacity,
                refill_per_sec,
                ..
            } => {
                let mut state = self.states.entry(key.to_string()).or_default();
                let now = Instant::now();
                match state.last_refill {
                    Some(last) => {
                        let refill = now.duration_since(last).as_secs_f64() * refill_per_sec;
                        state.tokens = (state.tokens + refill).min(*capacity);
                    }
                    None => state.tokens = *capacity,
                }
                state.last_refill = Some(now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }

            FilterConfig::Pattern { pattern, .. } => {
                let text = match &point.value {
                    Value::String(s) => s.clone(),
                    other => return Err(format!("pattern filter on {} value", other.data_type())),
                };
                let re = self
                    .regexes
                    .get_or_compile(pattern)
                    .map_err(|e| format!("pattern: {e}"))?;
                Ok(re.is_match(&text))
            }

            FilterConfig::Zscore {
                window, threshold, ..
            } => {
                let v = numeric(point)?;
                let capacity = (*window).max(2);
                let mut state = self.states.entry(key.to_string()).or_default();
                let pass = if state.window.len() < 2 {
                    true // not enough history to call anything an outlier
                } else {
                    let n = state.window.len() as f64;
                    let mean = state.window.iter().sum::<f64>() / n;
                    let var = state
                        .window
                        .iter()
                        .map(|x| (x - mean).powi(2))
                        .sum::<f64>()
                        / n;
                    let std = var.sqrt();
                    std < f64::EPSILON || ((v - mean) / std).abs() <= *threshold
                };
                if state.window.len() >= capacity {
                    state.window.pop_front();
                }
                state.window.push_back(v);
                Ok(pass)
            }
        }
    }
}

#[async_trait]
impl ActionHandler for FilterAction {
    fn kind(&self) -> &'static str {
        "filter"
    }

    async fn execute(&self, point: &DataPoint, rule: &Rule, spec: &ActionSpec) -> ActionOutcome {
        let config: FilterConfig = match serde_json::from_value(spec.config.clone()) {
            Ok(c) => c,
            Err(e) => return ActionOutcome::fail(format!("filter config: {e}")),
        };

        let key = format!("{}|{}|{}", rule.id, point.device_id, point.key);
        let pass = match self.decide(&config, &key, point) {
            Ok(p) => p,
            Err(e) => return ActionOutcome::fail(e),
        };
        let predicate = config.predicate_name();

        if !pass {
            self.metrics.filters_suppressed.fetch_add(1, Ordering::Relaxed);
            return ActionOutcome::ok_with(serde_json::json!({
                "filtered": true,
                "predicate": predicate,
            }));
        }

        let mut passed = point.clone();
        passed.tags = point.tags.deep_clone();
        passed.tags.insert(DECIDED_BY_TAG, predicate);
        let subject = config
            .output()
            .subject
            .clone()
            .unwrap_or_else(|| format!("iot.rules.{}.filter", rule.id));
        let payload = match serde_json::to_vec(&passed) {
            Ok(p) => p,
            Err(e) => return ActionOutcome::fail(format!("filter encode: {e}")),
        };
        if let Err(e) = self.publisher.publish_async(&subject, &payload).await {
            return ActionOutcome::fail(format!("filter publish: {e}"));
        }
        self.metrics.filters_passed.fetch_add(1, Ordering::Relaxed);

        ActionOutcome::ok_with(serde_json::json!({
            "filtered": false,
            "predicate": predicate,
            "subject": subject,
        }))
    }
}

fn numeric(point: &DataPoint) -> Result<f64, String> {
    point
        .value
        .as_f64()
        .ok_or_else(|| format!("filter needs a numeric value, got {}", point.data_type()))
}
