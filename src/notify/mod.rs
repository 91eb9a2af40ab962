//! Notification channels for alert side-delivery.
//!
//! The alert action fans emitted events out to named channels besides the
//! bus. Console and webhook ship in-tree; email/SMS/chat gateways live in
//! external services and plug in through the same trait. A failing channel
//! is logged and counted, never fatal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{AlertEvent, AlertLevel};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned status {0}")]
    Status(u16),

    #[error("Channel misconfigured: {0}")]
    Config(String),
}

/// Channel declaration as written in the gateway config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One delivery target for alert events.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &AlertEvent) -> Result<(), NotifyError>;
}

// ============================================================================
// Console channel
// ============================================================================

/// Writes alerts into the structured log at a level matching severity.
pub struct ConsoleChannel {
    name: String,
}

impl ConsoleChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertEvent) -> Result<(), NotifyError> {
        match alert.level {
            AlertLevel::Critical | AlertLevel::Error => error!(
                rule = %alert.rule_id,
                device = alert.device_id.as_deref().unwrap_or("-"),
                level = %alert.level,
                "{}",
                alert.message
            ),
            AlertLevel::Warning => warn!(
                rule = %alert.rule_id,
                device = alert.device_id.as_deref().unwrap_or("-"),
                "{}",
                alert.message
            ),
            AlertLevel::Info => info!(
                rule = %alert.rule_id,
                device = alert.device_id.as_deref().unwrap_or("-"),
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

// ============================================================================
// Webhook channel
// ============================================================================

/// POSTs the alert event JSON to a configured URL.
pub struct WebhookChannel {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertEvent) -> Result<(), NotifyError> {
        let resp = self.http.post(&self.url).json(alert).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Name -> channel map. Dispatch isolates per-channel failures.
#[derive(Default)]
pub struct NotifierRegistry {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config declarations. Unknown channel types are rejected;
    /// the rest still register.
    pub fn from_specs(specs: &[ChannelSpec]) -> Self {
        let mut registry = Self::new();
        for spec in specs {
            match spec.channel_type.as_str() {
                "console" => registry.register(Arc::new(ConsoleChannel::new(&spec.name))),
                "webhook" => match &spec.url {
                    Some(url) => match WebhookChannel::new(&spec.name, url) {
                        Ok(ch) => registry.register(Arc::new(ch)),
                        Err(e) => warn!(channel = %spec.name, error = %e, "Webhook channel skipped"),
                    },
                    None => warn!(channel = %spec.name, "Webhook channel missing url, skipped"),
                },
                other => warn!(channel = %spec.name, kind = other, "Unknown channel type, skipped"),
            }
        }
        registry
    }

    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Deliver to each named channel in turn. Returns the failure count;
    /// failures are logged and do not stop later channels.
    pub async fn dispatch(&self, names: &[String], alert: &AlertEvent) -> usize {
        let mut failures = 0;
        for name in names {
            match self.channels.get(name) {
                Some(channel) => {
                    if let Err(e) = channel.send(alert).await {
                        warn!(channel = %name, error = %e, "Notification delivery failed");
                        failures += 1;
                    }
                }
                None => {
                    warn!(channel = %name, "Unknown notification channel");
                    failures += 1;
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert() -> AlertEvent {
        AlertEvent {
            id: "a1".to_string(),
            rule_id: "r1".to_string(),
            rule_name: "test".to_string(),
            level: AlertLevel::Info,
            message: "hello".to_string(),
            device_id: None,
            key: None,
            value: None,
            tags: Default::default(),
            timestamp: Utc::now(),
            throttle_secs: 0,
            notification_channels: Vec::new(),
            auto_resolve: false,
            resolve_timeout_secs: None,
            priority: None,
        }
    }

    #[tokio::test]
    async fn console_channel_always_succeeds() {
        let registry = NotifierRegistry::from_specs(&[ChannelSpec {
            name: "console".to_string(),
            channel_type: "console".to_string(),
            url: None,
        }]);
        let failures = registry.dispatch(&["console".to_string()], &alert()).await;
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn unknown_channel_counts_as_failure() {
        let registry = NotifierRegistry::new();
        let failures = registry.dispatch(&["nope".to_string()], &alert()).await;
        assert_eq!(failures, 1);
    }

    #[test]
    fn unknown_type_skipped_quietly() {
        let registry = NotifierRegistry::from_specs(&[ChannelSpec {
            name: "pager".to_string(),
            channel_type: "carrier-pigeon".to_string(),
            url: None,
        }]);
        assert!(!registry.contains("pager"));
    }
}
