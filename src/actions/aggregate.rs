//! Aggregate action: windowed incremental statistics per group-by key.
//!
//! One window state exists per (rule, group-by tuple); the sharded store's
//! entry guard serialises updates per key, which is the implicit per-key
//! ordering grouped aggregation relies on. Summaries publish on
//! `iot.rules.<rule_id>.aggregate` when the window's emit condition fires -
//! on arrival (sliding step crossed, tumbling close, count reached) or from
//! the periodic sweeper (elapsed windows, session gaps). The sweeper also
//! drives TTL eviction.
//!
//! A point whose value is itself a sequence (array, matrix, timeseries) is
//! rejected with an error metric; aggregation over sequences is undefined.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregation::{AggregateFunction, Thresholds, WindowEmit, WindowSpec, WindowStore};
use crate::bus::BatchPublisher;
use crate::metrics::GatewayMetrics;
use crate::types::{ActionSpec, DataPoint, Rule};

use super::{ActionEnv, ActionHandler, ActionOutcome};

/// Sweeper period for elapsed windows and TTL eviction.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct AggregateConfig {
    window: WindowSpec,
    functions: Vec<String>,
    /// Point fields forming the group key (`device_id`, `key`, `tags.<x>`)
    #[serde(default)]
    group_by: Vec<String>,
    #[serde(default)]
    thresholds: Thresholds,
    #[serde(default)]
    subject: Option<String>,
}

/// Published summary payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub rule_id: String,
    pub window: String,
    pub count: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_by: BTreeMap<String, String>,
    pub values: BTreeMap<String, f64>,
}

/// Per-group metadata the sweeper needs to publish without the triggering
/// rule in hand.
#[derive(Clone)]
struct GroupMeta {
    rule_id: String,
    window_kind: String,
    window_size: Duration,
    functions: Vec<AggregateFunction>,
    group_by: BTreeMap<String, String>,
    subject: String,
}

pub struct AggregateAction {
    publisher: BatchPublisher,
    metrics: Arc<GatewayMetrics>,
    store: Arc<WindowStore>,
    groups: Arc<DashMap<String, GroupMeta>>,
}

impl AggregateAction {
    pub fn new(env: &ActionEnv) -> Self {
        Self {
            publisher: env.publisher.clone(),
            metrics: Arc::clone(&env.metrics),
            store: Arc::new(WindowStore::new()),
            groups: Arc::new(DashMap::new()),
        }
    }

    fn group_values(group_by: &[String], point: &DataPoint) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        for field in group_by {
            let value = match field.as_str() {
                "device_id" => point.device_id.clone(),
                "key" => point.key.clone(),
                tag if tag.starts_with("tags.") => {
                    point.tags.get(&tag["tags.".len()..]).unwrap_or_default()
                }
                _ => String::new(),
            };
            values.insert(field.clone(), value);
        }
        values
    }

    async fn publish_summary(
        publisher: &BatchPublisher,
        metrics: &GatewayMetrics,
        meta: &GroupMeta,
        emit: WindowEmit,
    ) -> Result<(), String> {
        let mut values = BTreeMap::new();
        for func in &meta.functions {
            values.insert(
                func.name().to_string(),
                emit.acc.value_of(*func, meta.window_size),
            );
        }
        let summary = AggregateSummary {
            rule_id: meta.rule_id.clone(),
            window: meta.window_kind.clone(),
            count: emit.acc.count(),
            start: emit.start,
            end: emit.end,
            group_by: meta.group_by.clone(),
            values,
        };
        let payload = serde_json::to_vec(&summary).map_err(|e| e.to_string())?;
        publisher
            .publish_async(&meta.subject, &payload)
            .await
            .map_err(|e| e.to_string())?;
        metrics.aggregates_emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for AggregateAction {
    fn kind(&self) -> &'static str {
        "aggregate"
    }

    async fn execute(&self, point: &DataPoint, rule: &Rule, spec: &ActionSpec) -> ActionOutcome {
        let config: AggregateConfig = match serde_json::from_value(spec.config.clone()) {
            Ok(c) => c,
            Err(e) => return ActionOutcome::fail(format!("aggregate config: {e}")),
        };
        if let Err(e) = config.window.validate() {
            return ActionOutcome::fail(format!("aggregate window: {e}"));
        }

        // Sequence payloads have no defined aggregation semantics.
        if point.value.is_sequence() {
            self.metrics.record_error("aggregate_sequence", "warning");
            return ActionOutcome::fail(format!(
                "aggregate over {} value is undefined",
                point.data_type()
            ));
        }

        let mut functions = Vec::with_capacity(config.functions.len());
        for name in &config.functions {
            match AggregateFunction::from_str(name) {
                Ok(f) => functions.push(f),
                Err(e) => return ActionOutcome::fail(e),
            }
        }

        let group_by = Self::group_values(&config.group_by, point);
        let group_part: Vec<&str> = group_by.values().map(String::as_str).collect();
        let key = format!("{}|{}", rule.id, group_part.join("|"));

        self.groups.entry(key.clone()).or_insert_with(|| GroupMeta {
            rule_id: rule.id.clone(),
            window_kind: config.window.kind.to_string(),
            window_size: config.window.size(),
            functions: functions.clone(),
            group_by: group_by.clone(),
            subject: config
                .subject
                .clone()
                .unwrap_or_else(|| format!("iot.rules.{}.aggregate", rule.id)),
        });

        let emits = self.store.update(
            &key,
            &config.window,
            &config.thresholds,
            point.timestamp,
            point.value.as_f64(),
        );

        let mut published = 0usize;
        if !emits.is_empty() {
            // Clone the meta out of the sharded map; publish awaits and the
            // guard must not live across it.
            let meta = self.groups.get(&key).map(|m| m.clone());
            if let Some(meta) = meta {
                for emit in emits {
                    match Self::publish_summary(&self.publisher, &self.metrics, &meta, emit).await {
                        Ok(()) => published += 1,
                        Err(e) => return ActionOutcome::fail(format!("aggregate publish: {e}")),
                    }
                }
            }
        }

        ActionOutcome::ok_with(serde_json::json!({
            "group": key,
            "summaries_emitted": published,
        }))
    }

    fn start_background(&self, cancel: CancellationToken) {
        let store = Arc::clone(&self.store);
        let groups = Arc::clone(&self.groups);
        let publisher = self.publisher.clone();
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                for (key, emit) in store.sweep(Utc::now()) {
                    let Some(meta) = groups.get(&key).map(|m| m.clone()) else {
                        continue;
                    };
                    if let Err(e) =
                        AggregateAction::publish_summary(&publisher, &metrics, &meta, emit).await
                    {
                        warn!(key = %key, error = %e, "Sweeper summary publish failed");
                    }
                }
            }
            debug!("Aggregate sweeper stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn group_values_resolve_fields_and_tags() {
        let point = DataPoint::new("dev-7", "temp", Value::Float(1.0)).unwrap();
        point.tags.insert("site", "plant-1");
        let groups = AggregateAction::group_values(
            &[
                "device_id".to_string(),
                "tags.site".to_string(),
                "tags.missing".to_string(),
            ],
            &point,
        );
        assert_eq!(groups["device_id"], "dev-7");
        assert_eq!(groups["tags.site"], "plant-1");
        assert_eq!(groups["tags.missing"], "");
    }

    #[test]
    fn scenario_config_shape_parses() {
        let config: AggregateConfig = serde_json::from_value(serde_json::json!({
            "window": {"kind": "tumbling", "count": 5},
            "functions": ["avg", "min", "max"],
            "group_by": ["device_id"]
        }))
        .unwrap();
        assert_eq!(config.functions.len(), 3);
        assert!(config.window.validate().is_ok());
    }
}
