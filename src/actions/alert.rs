//! Alert action: throttled alert emission with auto-resolve.
//!
//! Throttling is keyed by `rule_id|device_id|field`. The read-modify-write
//! on the throttle state runs under the sharded map's entry guard, so N
//! concurrent fires of one key within the throttle window emit exactly one
//! alert - the remainder report `{throttled: true}`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::bus::BusClient;
use crate::metrics::GatewayMetrics;
use crate::notify::NotifierRegistry;
use crate::types::{ActionSpec, AlertEvent, AlertLevel, AlertResolved, DataPoint, Rule, Value};

use super::{ActionEnv, ActionHandler, ActionOutcome};

/// Shared alert stream every emission lands on.
pub const SUBJECT_TRIGGERED: &str = "iot.alerts.triggered";

/// Resolve events.
pub const SUBJECT_RESOLVED: &str = "iot.alerts.resolved";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AlertConfig {
    #[serde(default)]
    level: AlertLevel,
    #[serde(default = "default_message")]
    message: String,
    /// Minimum re-fire interval per throttle key, seconds
    #[serde(default, alias = "throttle")]
    throttle_secs: u64,
    /// Notification channel names ("channels" kept as a config alias)
    #[serde(default, alias = "channels")]
    notification_channels: Vec<String>,
    #[serde(default)]
    auto_resolve: bool,
    #[serde(default = "default_resolve_timeout")]
    resolve_timeout_secs: u64,
}

fn default_message() -> String {
    "{{rule_name}}: {{device_id}}.{{key}} = {{value}}".to_string()
}

fn default_resolve_timeout() -> u64 {
    300
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_fired_at: Option<Instant>,
    /// Fires swallowed by the throttle window since the last emission
    pending: u64,
    /// Bumped per emission; the auto-resolve timer only acts if it still
    /// owns the latest generation
    generation: u64,
}

pub struct AlertAction {
    bus: BusClient,
    metrics: Arc<GatewayMetrics>,
    notifier: Arc<NotifierRegistry>,
    states: Arc<DashMap<String, ThrottleState>>,
}

impl AlertAction {
    pub fn new(env: &ActionEnv) -> Self {
        Self {
            bus: env.bus.clone(),
            metrics: Arc::clone(&env.metrics),
            notifier: Arc::clone(&env.notifier),
            states: Arc::new(DashMap::new()),
        }
    }

    fn throttle_key(rule: &Rule, point: &DataPoint) -> String {
        format!("{}|{}|{}", rule.id, point.device_id, point.key)
    }

    /// Atomically claim the right to emit for `key`. Returns the emission
    /// generation, or `None` when inside the throttle window.
    fn try_claim(&self, key: &str, throttle: Duration) -> Option<u64> {
        let mut entry = self.states.entry(key.to_string()).or_default();
        if let Some(last) = entry.last_fired_at {
            if !throttle.is_zero() && last.elapsed() < throttle {
                entry.pending += 1;
                return None;
            }
        }
        entry.last_fired_at = Some(Instant::now());
        entry.pending = 0;
        entry.generation += 1;
        Some(entry.generation)
    }

    fn schedule_auto_resolve(&self, key: String, alert_id: String, rule_id: String, generation: u64, timeout: Duration) {
        let states = Arc::clone(&self.states);
        let bus = self.bus.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // A re-fire during the sleep bumped the generation and owns a
            // fresher timer; this one stands down.
            let still_latest = states
                .get(&key)
                .is_some_and(|s| s.generation == generation);
            if !still_latest {
                return;
            }
            let resolved = AlertResolved {
                alert_id,
                rule_id,
                alert_key: key.clone(),
                timestamp: Utc::now(),
            };
            match serde_json::to_vec(&resolved) {
                Ok(payload) => {
                    if let Err(e) = bus.publish(SUBJECT_RESOLVED, &payload).await {
                        warn!(key = %key, error = %e, "Resolve publish failed");
                    } else {
                        metrics.alerts_resolved.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Alert auto-resolved");
                    }
                }
                Err(e) => warn!(error = %e, "Resolve event encode failed"),
            }
        });
    }
}

#[async_trait]
impl ActionHandler for AlertAction {
    fn kind(&self) -> &'static str {
        "alert"
    }

    async fn execute(&self, point: &DataPoint, rule: &Rule, spec: &ActionSpec) -> ActionOutcome {
        let config: AlertConfig = match serde_json::from_value(spec.config.clone()) {
            Ok(c) => c,
            Err(e) => return ActionOutcome::fail(format!("alert config: {e}")),
        };

        let key = Self::throttle_key(rule, point);
        let throttle = Duration::from_secs(config.throttle_secs);
        let Some(generation) = self.try_claim(&key, throttle) else {
            self.metrics.alerts_throttled.fetch_add(1, Ordering::Relaxed);
            return ActionOutcome::throttled();
        };

        let event = AlertEvent {
            id: format!("{}|{}", key, Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            level: config.level,
            message: render_template(&config.message, point, rule),
            device_id: Some(point.device_id.clone()),
            key: Some(point.key.clone()),
            value: scalar_json(&point.value),
            tags: point.tags.to_sorted(),
            timestamp: Utc::now(),
            throttle_secs: config.throttle_secs,
            notification_channels: config.notification_channels.clone(),
            auto_resolve: config.auto_resolve,
            resolve_timeout_secs: config.auto_resolve.then_some(config.resolve_timeout_secs),
            priority: Some(rule.priority),
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => return ActionOutcome::fail(format!("alert encode: {e}")),
        };

        // Shared stream plus the per-rule stream.
        let per_rule = format!("iot.alerts.{}", rule.id);
        if let Err(e) = self
            .bus
            .publish_batch(
                &[SUBJECT_TRIGGERED, per_rule.as_str()],
                &[payload.as_slice(), payload.as_slice()],
            )
            .await
        {
            return ActionOutcome::fail(format!("alert publish: {e}"));
        }
        self.metrics.alerts_emitted.fetch_add(1, Ordering::Relaxed);

        let failures = self
            .notifier
            .dispatch(&config.notification_channels, &event)
            .await;
        if failures > 0 {
            self.metrics
                .notifications_failed
                .fetch_add(failures as u64, Ordering::Relaxed);
        }

        if config.auto_resolve {
            self.schedule_auto_resolve(
                key,
                event.id.clone(),
                rule.id.clone(),
                generation,
                Duration::from_secs(config.resolve_timeout_secs),
            );
        }

        ActionOutcome::ok_with(serde_json::json!({
            "alert_id": event.id,
            "level": event.level,
        }))
    }
}

/// Substitute `{{placeholder}}` tokens: point fields, rule fields and
/// `tags.<name>`. Shared with the forward action's templated payloads.
pub(crate) fn render_template(template: &str, point: &DataPoint, rule: &Rule) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                match lookup_placeholder(name, point, rule) {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..close]);
                        out.push_str("}}");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup_placeholder(name: &str, point: &DataPoint, rule: &Rule) -> Option<String> {
    match name {
        "value" => Some(display_value(&point.value)),
        "device_id" => Some(point.device_id.clone()),
        "key" => Some(point.key.clone()),
        "quality" => Some(point.quality.to_string()),
        "rule_id" => Some(rule.id.clone()),
        "rule_name" => Some(rule.name.clone()),
        tag if tag.starts_with("tags.") => point.tags.get(&tag["tags.".len()..]),
        _ => None,
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{f}"),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        other => other
            .as_f64()
            .map_or_else(|| format!("<{}>", other.data_type()), |f| format!("{f}")),
    }
}

fn scalar_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::String(s) => Some(serde_json::Value::String(s.clone())),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        other => other
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> Rule {
        Rule {
            id: "overheat".to_string(),
            name: "Overheat guard".to_string(),
            description: String::new(),
            enabled: true,
            priority: 80,
            version: 1,
            data_type: None,
            conditions: crate::types::Condition::Simple {
                field: "value".to_string(),
                operator: crate::types::Operator::Gt,
                value: serde_json::json!(40),
            },
            actions: Vec::new(),
            tags: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn template_renders_point_fields_and_tags() {
        let point = DataPoint::new("dev-1", "temp", Value::Float(41.5)).unwrap();
        point.tags.insert("site", "plant-7");
        let rendered = render_template(
            "{{rule_name}} at {{tags.site}}: {{device_id}}.{{key}} = {{value}}",
            &point,
            &rule(),
        );
        assert_eq!(rendered, "Overheat guard at plant-7: dev-1.temp = 41.5");
    }

    #[test]
    fn unknown_placeholder_left_verbatim() {
        let point = DataPoint::new("dev-1", "temp", Value::Float(1.0)).unwrap();
        let rendered = render_template("x {{nope}} y", &point, &rule());
        assert_eq!(rendered, "x {{nope}} y");
    }

    #[test]
    fn alert_config_accepts_aliases() {
        let config: AlertConfig = serde_json::from_value(serde_json::json!({
            "level": "critical",
            "throttle": 2,
            "channels": ["console"]
        }))
        .unwrap();
        assert_eq!(config.level, AlertLevel::Critical);
        assert_eq!(config.throttle_secs, 2);
        assert_eq!(config.notification_channels, vec!["console"]);
    }
}
