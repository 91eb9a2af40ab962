//! Plug-in layer: adapter/sink contracts, registry, sidecar bridge and the
//! manager service.
//!
//! The manager instantiates every enabled declaration at init, starts them
//! at service start (a failing plug-in lands in `error` and the rest of the
//! gateway keeps going), and owns the raw telemetry pass-through: it
//! subscribes to `iot.data.>` and pushes each decoded point to every
//! running passive sink.

pub mod api;
pub mod registry;
pub mod sidecar;

pub use api::{Adapter, AdapterContext, Sink, SinkMessage};
pub use registry::{AdapterFactory, PluginRegistry, SinkFactory};
pub use sidecar::SidecarAdapter;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusMessage, Subscription};
use crate::metrics::GatewayMetrics;
use crate::runtime::Service;
use crate::types::{DataPoint, LifecycleError};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plug-in config error: {0}")]
    Config(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Plug-in '{0}' not found")]
    NotFound(String),

    #[error("Plug-in '{0}' already registered")]
    Duplicate(String),

    #[error("Unknown plug-in type '{0}'")]
    UnknownType(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    #[error("Internal: {0}")]
    Internal(String),
}

/// Config declaration for one adapter or sink instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

/// Raw pass-through queue depth.
const PASSTHROUGH_QUEUE: usize = 1_024;

struct ManagerState {
    subscription: Option<Subscription>,
}

pub struct PluginManager {
    registry: Arc<PluginRegistry>,
    bus: BusClient,
    metrics: Arc<GatewayMetrics>,
    adapters: Vec<PluginDecl>,
    sinks: Vec<PluginDecl>,
    telemetry_subject: String,
    cancel: CancellationToken,
    state: Mutex<ManagerState>,
}

impl PluginManager {
    pub fn new(
        registry: Arc<PluginRegistry>,
        bus: BusClient,
        metrics: Arc<GatewayMetrics>,
        adapters: Vec<PluginDecl>,
        sinks: Vec<PluginDecl>,
        telemetry_subject: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            bus,
            metrics,
            adapters,
            sinks,
            telemetry_subject,
            cancel,
            state: Mutex::new(ManagerState { subscription: None }),
        }
    }

    pub fn registry(&self) -> Arc<PluginRegistry> {
        Arc::clone(&self.registry)
    }

    fn adapter_context(&self, name: &str) -> AdapterContext {
        AdapterContext {
            name: name.to_string(),
            bus: self.bus.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

#[async_trait]
impl Service for PluginManager {
    fn name(&self) -> &'static str {
        "plugin-manager"
    }

    async fn init(&self) -> anyhow::Result<()> {
        for decl in self.adapters.iter().filter(|d| d.enabled) {
            if let Err(e) = self.registry.create_adapter(decl) {
                // Misdeclared plug-in: recorded, the rest still register.
                self.metrics.record_error("plugin_create", "error");
                warn!(name = %decl.name, error = %e, "Adapter registration failed");
            }
        }
        for decl in self.sinks.iter().filter(|d| d.enabled) {
            if let Err(e) = self.registry.create_sink(decl) {
                self.metrics.record_error("plugin_create", "error");
                warn!(name = %decl.name, error = %e, "Sink registration failed");
            }
        }
        info!(
            adapters = self.registry.adapter_names().len(),
            sinks = self.registry.sink_names().len(),
            "Plug-in manager initialized"
        );
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        // Sinks first so raw pass-through has somewhere to deliver.
        for name in self.registry.sink_names() {
            if let Err(e) = self.registry.start_sink(&name).await {
                self.metrics.record_error("plugin_start", "error");
                warn!(name = %name, error = %e, "Sink start failed, isolating");
            }
        }
        for name in self.registry.adapter_names() {
            let ctx = self.adapter_context(&name);
            if let Err(e) = self.registry.start_adapter(&name, ctx).await {
                self.metrics.record_error("plugin_start", "error");
                warn!(name = %name, error = %e, "Adapter start failed, isolating");
            }
        }
        self.metrics
            .plugins_errored
            .store(self.registry.errored_count(), Ordering::Relaxed);

        // Raw telemetry pass-through to passive sinks. The bus handler only
        // enqueues; one dispatcher task fans out.
        let (tx, rx) = mpsc::channel::<BusMessage>(PASSTHROUGH_QUEUE);
        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        tokio::spawn(passthrough_loop(registry, metrics, rx, cancel));

        let drop_metrics = Arc::clone(&self.metrics);
        let handler: crate::bus::MessageHandler = Arc::new(move |msg: BusMessage| {
            if tx.try_send(msg).is_err() {
                drop_metrics.points_dropped.fetch_add(1, Ordering::Relaxed);
            }
        });
        let subscription = self.bus.subscribe(&self.telemetry_subject, handler).await?;
        self.state.lock().await.subscription = Some(subscription);

        info!("Plug-in manager started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(sub) = self.state.lock().await.subscription.take() {
            sub.release().await;
        }
        for name in self.registry.adapter_names() {
            if self.registry.adapter_status(&name) == Some(crate::types::PluginStatus::Running) {
                if let Err(e) = self.registry.stop_adapter(&name).await {
                    warn!(name = %name, error = %e, "Adapter stop failed");
                }
            }
        }
        for name in self.registry.sink_names() {
            if self.registry.sink_status(&name) == Some(crate::types::PluginStatus::Running) {
                if let Err(e) = self.registry.stop_sink(&name).await {
                    warn!(name = %name, error = %e, "Sink stop failed");
                }
            }
        }
        info!("Plug-in manager stopped");
        Ok(())
    }
}

/// Deliver raw telemetry to every running passive sink. Per-sink failures
/// are counted and do not stop the others.
async fn passthrough_loop(
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
        let point: DataPoint = match serde_json::from_slice(&msg.payload) {
            Ok(p) => p,
            Err(_) => continue, // engine already counts malformed payloads
        };
        let message = SinkMessage::Point(point);
        for sink in registry.passive_sinks() {
            let result = {
                let instance = sink.instance.lock().await;
                instance.publish(&message).await
            };
            if let Err(e) = result {
                metrics.record_error("sink_publish", "warning");
                debug!(error = %e, "Raw pass-through delivery failed");
            }
        }
    }
    debug!("Raw pass-through stopped");
}
