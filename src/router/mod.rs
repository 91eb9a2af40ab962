//! Sink router: bridges rule outputs and alerts into passive sinks.
//!
//! Exactly one subscription-capable component per deployment reads the rule
//! output subjects - this router. It subscribes to `iot.rules.>` and
//! `iot.alerts.>`, decodes each message into the target shape (alert event
//! or rule result) and invokes `publish` on every running passive sink in
//! sequence. A per-target failure is logged and counted and does not halt
//! the others. Raw telemetry reaches passive sinks separately through the
//! plug-in manager; the router never deduplicates.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusMessage, Subscription};
use crate::metrics::GatewayMetrics;
use crate::plugins::{PluginRegistry, SinkMessage};
use crate::runtime::Service;
use crate::types::AlertEvent;

/// Default bridged subjects.
pub fn default_subjects() -> Vec<String> {
    vec!["iot.rules.>".to_string(), "iot.alerts.>".to_string()]
}

const ROUTER_QUEUE: usize = 1_024;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub enabled: bool,
    pub subjects: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subjects: default_subjects(),
        }
    }
}

struct RouterState {
    subscriptions: Vec<Subscription>,
}

pub struct SinkRouter {
    config: RouterConfig,
    bus: BusClient,
    registry: Arc<PluginRegistry>,
    metrics: Arc<GatewayMetrics>,
    cancel: CancellationToken,
    state: Mutex<RouterState>,
}

impl SinkRouter {
    pub fn new(
        config: RouterConfig,
        bus: BusClient,
        registry: Arc<PluginRegistry>,
        metrics: Arc<GatewayMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            metrics,
            cancel,
            state: Mutex::new(RouterState {
                subscriptions: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl Service for SinkRouter {
    fn name(&self) -> &'static str {
        "sink-router"
    }

    async fn init(&self) -> anyhow::Result<()> {
        if !self.config.enabled {
            // Rule outputs will go unseen by northbound stores; raw
            // telemetry still reaches passive sinks via the plug-in manager.
            warn!("Sink router disabled - rule outputs will not reach passive sinks");
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.registry.has_bus_capable_sink() {
            // Deployment contract: one subscription-capable reader of the
            // rule output subjects. A bus-capable sink handles its own
            // subscriptions; the router stands down to avoid double-writes.
            info!("Bus-capable sink registered, sink router standing down");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<BusMessage>(ROUTER_QUEUE);
        tokio::spawn(route_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            rx,
            self.cancel.clone(),
        ));

        let mut subscriptions = Vec::new();
        for subject in &self.config.subjects {
            let tx = tx.clone();
            let metrics = Arc::clone(&self.metrics);
            let handler: crate::bus::MessageHandler = Arc::new(move |msg: BusMessage| {
                if tx.try_send(msg).is_err() {
                    metrics.router_failures.fetch_add(1, Ordering::Relaxed);
                }
            });
            subscriptions.push(self.bus.subscribe(subject, handler).await?);
        }
        self.state.lock().await.subscriptions = subscriptions;

        info!(subjects = ?self.config.subjects, "Sink router started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let subscriptions = std::mem::take(&mut self.state.lock().await.subscriptions);
        for sub in subscriptions {
            sub.release().await;
        }
        info!("Sink router stopped");
        Ok(())
    }
}

async fn route_loop(
    registry: Arc<PluginRegistry>,
    metrics: Arc<GatewayMetrics>,
    mut rx: mpsc::Receiver<BusMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            }
        };

        let message = decode(&msg);
        let sinks = registry.passive_sinks();
        if sinks.is_empty() {
            continue;
        }
        for sink in sinks {
            let result = {
                let instance = sink.instance.lock().await;
                instance.publish(&message).await
            };
            match result {
                Ok(()) => {
                    metrics.router_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    metrics.router_failures.fetch_add(1, Ordering::Relaxed);
                    metrics.record_error("router_delivery", "warning");
                    debug!(error = %e, "Router delivery failed, continuing with other sinks");
                }
            }
        }
    }
    debug!("Sink router loop stopped");
}

/// Decode a bridged message into its target shape. Alerts parse into
/// [`AlertEvent`]; everything else passes as a raw rule output.
fn decode(msg: &BusMessage) -> SinkMessage {
    if msg.subject.starts_with("iot.alerts.") {
        if let Ok(alert) = serde_json::from_slice::<AlertEvent>(&msg.payload) {
            return SinkMessage::Alert(alert);
        }
    }
    let payload = serde_json::from_slice::<serde_json::Value>(&msg.payload)
        .unwrap_or(serde_json::Value::Null);
    SinkMessage::RuleOutput {
        subject: msg.subject.clone(),
        payload,
    }
}
