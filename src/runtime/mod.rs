//! Runtime orchestrator.
//!
//! Single entry point: brings the bus up (embedded server or external
//! connection), builds every component in dependency order, starts the
//! services, and tears everything down in reverse under a bounded shutdown
//! budget. A service failing `init` or `start` is fatal: components already
//! started are rolled back and the process exits non-zero.

pub mod service;

pub use service::Service;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actions::{ActionEnv, ActionRegistry};
use crate::bus::{BatchConfig, BatchPublisher, BusClient, BusServer};
use crate::config::{BusMode, GatewayConfig};
use crate::metrics::{GatewayMetrics, MetricsSources};
use crate::notify::NotifierRegistry;
use crate::plugins::{PluginManager, PluginRegistry};
use crate::router::{RouterConfig, SinkRouter};
use crate::rules::expr::ExprCache;
use crate::rules::{EngineConfig, RegexCache, RuleEngine, RuleStore, SeriesHistory};

/// Bounded time for the reverse-order service stop plus bus teardown.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Embedded server bind host. All interfaces, so sidecars and external
/// tools share the bus.
const EMBEDDED_BIND_HOST: &str = "0.0.0.0";

pub struct Runtime {
    config: GatewayConfig,
    config_path: Option<std::path::PathBuf>,
    cancel: CancellationToken,
    registry: Arc<PluginRegistry>,
    metrics: Arc<GatewayMetrics>,
    bus_server: Option<BusServer>,
    bus: Option<BusClient>,
    services: Vec<Arc<dyn Service>>,
    started: usize,
}

impl Runtime {
    pub fn new(config: GatewayConfig, config_path: Option<std::path::PathBuf>) -> Self {
        Self {
            config,
            config_path,
            cancel: CancellationToken::new(),
            registry: Arc::new(PluginRegistry::new()),
            metrics: GatewayMetrics::new(),
            bus_server: None,
            bus: None,
            services: Vec::new(),
            started: 0,
        }
    }

    /// Root cancellation signal; cancelling it initiates shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registry handle, for registering built-in plug-in factories before
    /// `start`.
    pub fn registry(&self) -> Arc<PluginRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn bus(&self) -> Option<BusClient> {
        self.bus.clone()
    }

    /// Bring up the bus, construct all components in dependency order and
    /// start the services. Fatal on any failure, with rollback.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        info!(gateway = %self.config.gateway.id, "Starting gateway runtime");

        let bus = self.bring_up_bus().await?;
        self.metrics.bus_connected.store(true, Ordering::Relaxed);
        self.bus = Some(bus.clone());

        // --- shared infrastructure ---
        let publisher = BatchPublisher::new(
            bus.clone(),
            BatchConfig {
                batch_size: self.config.rule_engine.batch_size,
                ..BatchConfig::default()
            },
            self.cancel.clone(),
        );
        let notifier = Arc::new(NotifierRegistry::from_specs(&self.config.notifications));
        let exprs = Arc::new(ExprCache::new(
            self.config
                .rule_engine
                .expression_engine
                .cache_size
                .unwrap_or(crate::rules::expr::DEFAULT_CACHE_SIZE),
        ));
        let regexes = Arc::new(RegexCache::new());
        let series = Arc::new(SeriesHistory::default());

        let env = ActionEnv {
            bus: bus.clone(),
            publisher,
            metrics: Arc::clone(&self.metrics),
            notifier,
            exprs: Arc::clone(&exprs),
            regexes: Arc::clone(&regexes),
        };
        let actions = Arc::new(ActionRegistry::standard(&env));

        let store = Arc::new(RuleStore::new(self.config.rule_engine.rules_dir.clone()));
        let inline = store.load_inline(self.config.rule_engine.rules.clone());
        for (source, reason) in &inline.rejected {
            warn!(source = %source, reason = %reason, "Inline rule rejected");
        }

        // --- services, dependency order ---
        let updater: Arc<dyn Service> = Arc::new(MetricsUpdater {
            metrics: Arc::clone(&self.metrics),
            registry: Arc::clone(&self.registry),
            cancel: self.cancel.clone(),
        });
        let plugin_manager: Arc<dyn Service> = Arc::new(PluginManager::new(
            Arc::clone(&self.registry),
            bus.clone(),
            Arc::clone(&self.metrics),
            self.config.southbound.adapters.clone(),
            self.config.northbound.sinks.clone(),
            self.config.rule_engine.subject.clone(),
            self.cancel.clone(),
        ));
        let router: Arc<dyn Service> = Arc::new(SinkRouter::new(
            RouterConfig {
                enabled: self.config.northbound.router.enabled,
                subjects: self.config.northbound.router.subjects.clone(),
            },
            bus.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            self.cancel.clone(),
        ));

        self.services = vec![updater, plugin_manager, router];
        if self.config.rule_engine.enabled {
            let engine: Arc<dyn Service> = Arc::new(RuleEngine::new(
                EngineConfig {
                    subject: self.config.rule_engine.subject.clone(),
                    worker_pool_size: self.config.rule_engine.worker_pool_size,
                    queue_capacity: self.config.rule_engine.queue_capacity,
                    shed_low_priority: self.config.rule_engine.shed_low_priority,
                    shed_priority_floor: self.config.rule_engine.shed_priority_floor,
                    shed_watermark: self.config.rule_engine.shed_watermark,
                },
                bus.clone(),
                store,
                actions,
                Arc::clone(&self.metrics),
                series,
                regexes,
                exprs,
                self.cancel.clone(),
            ));
            self.services.push(engine);
        } else {
            warn!("Rule engine disabled by configuration");
        }

        for (idx, service) in self.services.iter().enumerate() {
            let result = async {
                service
                    .init()
                    .await
                    .with_context(|| format!("{} init", service.name()))?;
                service
                    .start()
                    .await
                    .with_context(|| format!("{} start", service.name()))
            }
            .await;

            match result {
                Ok(()) => {
                    self.started = idx + 1;
                    info!(service = service.name(), "Service started");
                }
                Err(e) => {
                    error!(service = service.name(), error = %e, "Service failed, rolling back");
                    self.rollback().await;
                    return Err(e);
                }
            }
        }

        self.spawn_config_watcher();
        info!("Gateway runtime started");
        Ok(())
    }

    /// Block until the root cancellation fires, then stop.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.cancel.cancelled().await;
        info!("Shutdown signal received");
        self.stop().await;
        Ok(())
    }

    /// Reverse-order teardown under [`SHUTDOWN_BUDGET`].
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(SHUTDOWN_BUDGET, async {
            self.rollback().await;
            if let Some(bus) = self.bus.take() {
                bus.close();
            }
            if let Some(server) = self.bus_server.take() {
                server.shutdown().await;
            }
        })
        .await;
        if result.is_err() {
            warn!(budget = ?SHUTDOWN_BUDGET, "Shutdown budget exceeded, abandoning remaining teardown");
        }
        self.metrics.bus_connected.store(false, Ordering::Relaxed);
        info!("Gateway runtime stopped");
    }

    async fn rollback(&mut self) {
        for service in self.services[..self.started].iter().rev() {
            if let Err(e) = service.stop().await {
                warn!(service = service.name(), error = %e, "Service stop failed");
            } else {
                info!(service = service.name(), "Service stopped");
            }
        }
        self.started = 0;
    }

    async fn bring_up_bus(&mut self) -> anyhow::Result<BusClient> {
        let mode = self.config.gateway.bus_mode()?;
        let addr = match mode {
            BusMode::Embedded {
                port,
                fallback_port,
            } => {
                let server = BusServer::start(
                    EMBEDDED_BIND_HOST,
                    port,
                    fallback_port,
                    self.cancel.child_token(),
                )
                .await
                .context("embedded bus bring-up")?;
                let addr = format!("127.0.0.1:{}", server.local_addr().port());
                self.bus_server = Some(server);
                addr
            }
            BusMode::External { addr } => addr,
        };
        let bus = BusClient::connect(&addr, self.cancel.clone())
            .await
            .context("bus connect")?;
        Ok(bus)
    }

    fn spawn_config_watcher(&self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        let cancel = self.cancel.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = crate::config::watcher::ConfigWatcher::new(path, cancel.clone());
        tokio::spawn(watcher.run(tx));
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(e) => e,
                        None => break,
                    }
                };
                match event {
                    crate::config::watcher::ConfigEvent::Applied(changes) if changes.is_empty() => {
                        info!("Config file changed, nothing in the hot-reload whitelist differs");
                    }
                    crate::config::watcher::ConfigEvent::Applied(changes) => {
                        for change in changes {
                            info!(
                                field = change.field,
                                old = %change.old,
                                new = %change.new,
                                "Config change applied"
                            );
                        }
                    }
                    crate::config::watcher::ConfigEvent::Rejected(reason) => {
                        warn!(reason = %reason, "Config reload rejected, keeping old config");
                    }
                }
            }
        });
    }
}

// ============================================================================
// Metrics updater service
// ============================================================================

/// Thin service wrapper around the metrics ticker.
struct MetricsUpdater {
    metrics: Arc<GatewayMetrics>,
    registry: Arc<PluginRegistry>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl Service for MetricsUpdater {
    fn name(&self) -> &'static str {
        "metrics-updater"
    }

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let metrics = Arc::clone(&self.metrics);
        let sources = MetricsSources {
            plugins: Some(Arc::clone(&self.registry) as _),
        };
        let cancel = self.cancel.clone();
        tokio::spawn(crate::metrics::run_updater(metrics, sources, cancel));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        // The ticker watches the root token; nothing else to unwind.
        Ok(())
    }
}
