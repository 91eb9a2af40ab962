//! Alert event types published on `iot.alerts.*`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alert severity. Orders so that `Critical > Error > Warning > Info`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Wire shape of one emitted alert.
///
/// Published on `iot.alerts.triggered` (shared) and `iot.alerts.<rule_id>`
/// (per rule), and handed to each configured notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Unique id for this emission (rule id + throttle key + nanos)
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub level: AlertLevel,
    /// Rendered message (template placeholders already substituted)
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Triggering point value, if scalar-representable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Minimum re-fire interval for this alert key, in seconds
    pub throttle_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification_channels: Vec<String>,
    #[serde(default)]
    pub auto_resolve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

/// Resolve event published on `iot.alerts.resolved` when an auto-resolve
/// timer expires with no re-fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertResolved {
    /// Id of the alert emission being resolved
    pub alert_id: String,
    pub rule_id: String,
    /// Throttle key (`rule_id|device_id|field`) the resolve applies to
    pub alert_key: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(AlertLevel::Critical > AlertLevel::Error);
        assert!(AlertLevel::Error > AlertLevel::Warning);
        assert!(AlertLevel::Warning > AlertLevel::Info);
    }

    #[test]
    fn level_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AlertLevel::Critical).unwrap(),
            "\"critical\""
        );
    }

    #[test]
    fn event_round_trip() {
        let event = AlertEvent {
            id: "r1|dev|value|123".to_string(),
            rule_id: "r1".to_string(),
            rule_name: "overheat".to_string(),
            level: AlertLevel::Warning,
            message: "temp 41 over limit".to_string(),
            device_id: Some("dev".to_string()),
            key: Some("temp".to_string()),
            value: Some(serde_json::json!(41.0)),
            tags: BTreeMap::new(),
            timestamp: Utc::now(),
            throttle_secs: 2,
            notification_channels: vec!["console".to_string()],
            auto_resolve: false,
            resolve_timeout_secs: None,
            priority: Some(80),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AlertEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rule_id, "r1");
        assert_eq!(back.level, AlertLevel::Warning);
    }
}
