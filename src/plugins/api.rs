//! Adapter and sink contracts.
//!
//! Concrete protocol drivers (Modbus, MQTT, HTTP pollers) and store writers
//! (TSDB, cache, broker bridges) live outside the core; they implement
//! these traits and register through factories. The sidecar bridge is the
//! one in-tree adapter.

use async_trait::async_trait;

use crate::bus::{BusClient, BusError};
use crate::types::{AdapterMetrics, AlertEvent, DataPoint, SinkMetrics};

use super::PluginError;

/// Handed to an adapter at start: how it publishes telemetry.
#[derive(Clone)]
pub struct AdapterContext {
    pub name: String,
    pub bus: BusClient,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl AdapterContext {
    /// Encode and publish one point on its telemetry subject.
    pub async fn publish_point(&self, point: &DataPoint) -> Result<(), BusError> {
        let payload = serde_json::to_vec(point)
            .map_err(|e| BusError::Protocol(format!("point encode: {e}")))?;
        self.bus.publish(&point.subject(), &payload).await
    }
}

/// Southbound (device-facing) ingestor.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Validate and absorb configuration. Called once, before `start`.
    async fn init(&mut self, config: &serde_json::Value) -> Result<(), PluginError>;

    /// Begin producing. Must not block: long-running collection spawns its
    /// own task and watches `ctx.cancel`.
    async fn start(&mut self, ctx: AdapterContext) -> Result<(), PluginError>;

    async fn stop(&mut self) -> Result<(), PluginError>;

    /// Instance counters, read by the metrics collector once per tick.
    fn metrics(&self) -> AdapterMetrics;
}

/// What a sink receives.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    /// Raw telemetry pass-through from the plug-in manager
    Point(DataPoint),
    /// Decoded rule output bridged by the sink router
    RuleOutput {
        subject: String,
        payload: serde_json::Value,
    },
    /// Alert event bridged by the sink router
    Alert(AlertEvent),
}

/// Northbound (store/transport-facing) emitter.
///
/// Sinks that can subscribe to the bus themselves declare `bus_capable`;
/// everything else is passive and only receives via `publish` - raw
/// telemetry from the plug-in manager, rule outputs from the sink router.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn bus_capable(&self) -> bool {
        false
    }

    async fn init(&mut self, config: &serde_json::Value) -> Result<(), PluginError>;

    async fn start(&mut self) -> Result<(), PluginError>;

    async fn stop(&mut self) -> Result<(), PluginError>;

    async fn publish(&self, message: &SinkMessage) -> Result<(), PluginError>;

    fn metrics(&self) -> SinkMetrics;
}
