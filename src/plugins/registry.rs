//! Plug-in registry: factories, live instances, lifecycle enforcement.
//!
//! Factories for built-in plug-ins register at process start; sidecar
//! declarations instantiate the bridge adapter. The status map is
//! read-mostly (sharded), with a single writer per plug-in driving the
//! state machine - every transition is checked against
//! [`PluginStatus::check_transition`] and any failure short-cuts to
//! `Error` without taking the rest of the gateway down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::metrics::InstanceMetricsSource;
use crate::types::{
    AdapterMetrics, PluginKind, PluginMeta, PluginMode, PluginStatus, SinkMetrics,
};

use super::api::{Adapter, AdapterContext, Sink};
use super::sidecar::SidecarAdapter;
use super::{PluginDecl, PluginError};

pub type AdapterFactory = Arc<dyn Fn(&str) -> Box<dyn Adapter> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn(&str) -> Box<dyn Sink> + Send + Sync>;

pub struct AdapterHandle {
    pub meta: RwLock<PluginMeta>,
    pub instance: Mutex<Box<dyn Adapter>>,
    pub config: serde_json::Value,
}

pub struct SinkHandle {
    pub meta: RwLock<PluginMeta>,
    pub instance: Mutex<Box<dyn Sink>>,
    pub config: serde_json::Value,
    pub bus_capable: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    adapter_factories: RwLock<HashMap<String, AdapterFactory>>,
    sink_factories: RwLock<HashMap<String, SinkFactory>>,
    adapters: DashMap<String, Arc<AdapterHandle>>,
    sinks: DashMap<String, Arc<SinkHandle>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_adapter_factory(
        &self,
        type_name: &str,
        factory: impl Fn(&str) -> Box<dyn Adapter> + Send + Sync + 'static,
    ) {
        if let Ok(mut factories) = self.adapter_factories.write() {
            factories.insert(type_name.to_string(), Arc::new(factory));
        }
    }

    pub fn register_sink_factory(
        &self,
        type_name: &str,
        factory: impl Fn(&str) -> Box<dyn Sink> + Send + Sync + 'static,
    ) {
        if let Ok(mut factories) = self.sink_factories.write() {
            factories.insert(type_name.to_string(), Arc::new(factory));
        }
    }

    /// Instantiate one adapter from its config declaration.
    pub fn create_adapter(&self, decl: &PluginDecl) -> Result<(), PluginError> {
        if self.adapters.contains_key(&decl.name) {
            return Err(PluginError::Duplicate(decl.name.clone()));
        }
        let (instance, mode, entry): (Box<dyn Adapter>, PluginMode, String) =
            if decl.plugin_type == "sidecar" {
                let sidecar = SidecarAdapter::new(&decl.name);
                let entry = SidecarAdapter::endpoint_of(&decl.config);
                (Box::new(sidecar), PluginMode::Sidecar, entry)
            } else {
                let factories = self
                    .adapter_factories
                    .read()
                    .map_err(|_| PluginError::Internal("factory lock poisoned".to_string()))?;
                let factory = factories
                    .get(&decl.plugin_type)
                    .ok_or_else(|| PluginError::UnknownType(decl.plugin_type.clone()))?;
                (factory(&decl.name), PluginMode::Builtin, decl.plugin_type.clone())
            };

        let meta = PluginMeta {
            name: decl.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            kind: PluginKind::Adapter,
            mode,
            entry,
            status: PluginStatus::Created,
            last_error: None,
            started_at: None,
            extra: Default::default(),
        };
        self.adapters.insert(
            decl.name.clone(),
            Arc::new(AdapterHandle {
                meta: RwLock::new(meta),
                instance: Mutex::new(instance),
                config: decl.config.clone(),
            }),
        );
        info!(name = %decl.name, kind = "adapter", "Plug-in registered");
        Ok(())
    }

    /// Instantiate one sink from its config declaration.
    pub fn create_sink(&self, decl: &PluginDecl) -> Result<(), PluginError> {
        if self.sinks.contains_key(&decl.name) {
            return Err(PluginError::Duplicate(decl.name.clone()));
        }
        let factories = self
            .sink_factories
            .read()
            .map_err(|_| PluginError::Internal("factory lock poisoned".to_string()))?;
        let factory = factories
            .get(&decl.plugin_type)
            .ok_or_else(|| PluginError::UnknownType(decl.plugin_type.clone()))?;
        let instance = factory(&decl.name);
        let bus_capable = instance.bus_capable();

        let meta = PluginMeta {
            name: decl.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            kind: PluginKind::Sink,
            mode: PluginMode::Builtin,
            entry: decl.plugin_type.clone(),
            status: PluginStatus::Created,
            last_error: None,
            started_at: None,
            extra: Default::default(),
        };
        self.sinks.insert(
            decl.name.clone(),
            Arc::new(SinkHandle {
                meta: RwLock::new(meta),
                instance: Mutex::new(instance),
                config: decl.config.clone(),
                bus_capable,
            }),
        );
        info!(name = %decl.name, kind = "sink", bus_capable, "Plug-in registered");
        Ok(())
    }

    /// Drive an adapter through init -> start. A failure lands it in
    /// `Error` with the cause recorded; the caller keeps going.
    pub async fn start_adapter(&self, name: &str, ctx: AdapterContext) -> Result<(), PluginError> {
        let handle = self
            .adapters
            .get(name)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let result = async {
            let mut instance = handle.instance.lock().await;
            let status = self.adapter_status(name).unwrap_or_default();
            if status == PluginStatus::Created {
                transition(&handle.meta, PluginStatus::Initialized)?;
                instance.init(&handle.config).await?;
            }
            transition(&handle.meta, PluginStatus::Starting)?;
            instance.start(ctx).await?;
            transition(&handle.meta, PluginStatus::Running)?;
            if let Ok(mut meta) = handle.meta.write() {
                meta.started_at = Some(chrono::Utc::now());
                meta.last_error = None;
            }
            Ok::<(), PluginError>(())
        }
        .await;

        if let Err(e) = &result {
            mark_error(&handle.meta, e);
            warn!(name, error = %e, "Adapter failed to start");
        }
        result
    }

    pub async fn stop_adapter(&self, name: &str) -> Result<(), PluginError> {
        let handle = self
            .adapters
            .get(name)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let result = async {
            transition(&handle.meta, PluginStatus::Stopping)?;
            handle.instance.lock().await.stop().await?;
            transition(&handle.meta, PluginStatus::Stopped)?;
            Ok::<(), PluginError>(())
        }
        .await;

        if let Err(e) = &result {
            mark_error(&handle.meta, e);
        }
        result
    }

    /// `restart` is stop then start.
    pub async fn restart_adapter(&self, name: &str, ctx: AdapterContext) -> Result<(), PluginError> {
        if self.adapter_status(name) == Some(PluginStatus::Running) {
            self.stop_adapter(name).await?;
        }
        self.start_adapter(name, ctx).await
    }

    pub async fn start_sink(&self, name: &str) -> Result<(), PluginError> {
        let handle = self
            .sinks
            .get(name)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let result = async {
            let mut instance = handle.instance.lock().await;
            let status = self.sink_status(name).unwrap_or_default();
            if status == PluginStatus::Created {
                transition(&handle.meta, PluginStatus::Initialized)?;
                instance.init(&handle.config).await?;
            }
            transition(&handle.meta, PluginStatus::Starting)?;
            instance.start().await?;
            transition(&handle.meta, PluginStatus::Running)?;
            if let Ok(mut meta) = handle.meta.write() {
                meta.started_at = Some(chrono::Utc::now());
                meta.last_error = None;
            }
            Ok::<(), PluginError>(())
        }
        .await;

        if let Err(e) = &result {
            mark_error(&handle.meta, e);
            warn!(name, error = %e, "Sink failed to start");
        }
        result
    }

    pub async fn stop_sink(&self, name: &str) -> Result<(), PluginError> {
        let handle = self
            .sinks
            .get(name)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let result = async {
            transition(&handle.meta, PluginStatus::Stopping)?;
            handle.instance.lock().await.stop().await?;
            transition(&handle.meta, PluginStatus::Stopped)?;
            Ok::<(), PluginError>(())
        }
        .await;

        if let Err(e) = &result {
            mark_error(&handle.meta, e);
        }
        result
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn adapter_status(&self, name: &str) -> Option<PluginStatus> {
        self.adapters
            .get(name)
            .and_then(|h| h.meta.read().ok().map(|m| m.status))
    }

    pub fn sink_status(&self, name: &str) -> Option<PluginStatus> {
        self.sinks
            .get(name)
            .and_then(|h| h.meta.read().ok().map(|m| m.status))
    }

    pub fn metas(&self) -> Vec<PluginMeta> {
        let mut metas = Vec::new();
        for handle in self.adapters.iter() {
            if let Ok(meta) = handle.meta.read() {
                metas.push(meta.clone());
            }
        }
        for handle in self.sinks.iter() {
            if let Ok(meta) = handle.meta.read() {
                metas.push(meta.clone());
            }
        }
        metas
    }

    /// Running passive sinks (raw pass-through and router targets).
    pub fn passive_sinks(&self) -> Vec<Arc<SinkHandle>> {
        self.sinks
            .iter()
            .filter(|h| !h.bus_capable)
            .filter(|h| h.meta.read().is_ok_and(|m| m.status == PluginStatus::Running))
            .map(|h| Arc::clone(&h))
            .collect()
    }

    /// Whether any registered sink can subscribe on its own.
    pub fn has_bus_capable_sink(&self) -> bool {
        self.sinks.iter().any(|h| h.bus_capable)
    }

    pub fn errored_count(&self) -> u64 {
        let adapters = self
            .adapters
            .iter()
            .filter(|h| h.meta.read().is_ok_and(|m| m.status == PluginStatus::Error))
            .count();
        let sinks = self
            .sinks
            .iter()
            .filter(|h| h.meta.read().is_ok_and(|m| m.status == PluginStatus::Error))
            .count();
        (adapters + sinks) as u64
    }
}

impl InstanceMetricsSource for PluginRegistry {
    fn adapter_metrics(&self) -> Vec<AdapterMetrics> {
        let mut out = Vec::new();
        for handle in self.adapters.iter() {
            // try_lock: the collector never waits on a busy adapter.
            if let Ok(instance) = handle.instance.try_lock() {
                out.push(instance.metrics());
            }
        }
        out
    }

    fn sink_metrics(&self) -> Vec<SinkMetrics> {
        let mut out = Vec::new();
        for handle in self.sinks.iter() {
            if let Ok(instance) = handle.instance.try_lock() {
                out.push(instance.metrics());
            }
        }
        out
    }
}

/// Apply one checked transition under the meta write lock.
fn transition(
    meta: &RwLock<PluginMeta>,
    to: PluginStatus,
) -> Result<(), PluginError> {
    let mut meta = meta
        .write()
        .map_err(|_| PluginError::Internal("meta lock poisoned".to_string()))?;
    meta.status.check_transition(to)?;
    meta.status = to;
    Ok(())
}

fn mark_error(meta: &RwLock<PluginMeta>, error: &PluginError) {
    if let Ok(mut meta) = meta.write() {
        meta.status = PluginStatus::Error;
        meta.last_error = Some(error.to_string());
    }
}
