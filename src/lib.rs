//! Fluxgate: message-bus-centered IoT data gateway core.
//!
//! Telemetry flows from southbound adapters onto the embedded subject bus,
//! through the rule engine's worker pool, and out to northbound sinks.
//!
//! ## Architecture
//!
//! - **Bus**: embedded NATS-style broker (or external), wildcard subjects,
//!   batched async publishing
//! - **Rule engine**: priority-ordered rules, condition trees, expression
//!   language, worker pool
//! - **Actions**: alert (throttled, auto-resolving), transform, filter,
//!   aggregate (windowed incremental statistics), forward
//! - **Sink router**: bridges rule outputs into passive sinks
//! - **Runtime**: lifecycle orchestration, config hot-reload, metrics

pub mod actions;
pub mod aggregation;
pub mod bus;
pub mod config;
pub mod metrics;
pub mod notify;
pub mod plugins;
pub mod router;
pub mod rules;
pub mod runtime;
pub mod types;

// Re-export the wire-level model
pub use types::{
    AlertEvent, AlertLevel, AlertResolved, Condition, DataPoint, DataType, Operator, Rule, TagMap,
    Value,
};

// Re-export the main entry points
pub use bus::{BatchPublisher, BusClient, BusServer, Subscription};
pub use config::GatewayConfig;
pub use metrics::GatewayMetrics;
pub use plugins::{Adapter, AdapterContext, PluginRegistry, Sink, SinkMessage};
pub use rules::{RuleEngine, RuleStore};
pub use runtime::{Runtime, Service};
