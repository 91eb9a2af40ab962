//! Core data model: points, rules, alerts, plug-in metadata.

mod alert;
mod plugin;
mod point;
mod rule;
mod tags;

pub use alert::{AlertEvent, AlertLevel, AlertResolved};
pub use plugin::{
    AdapterMetrics, LifecycleError, PluginKind, PluginMeta, PluginMode, PluginStatus, SinkMetrics,
};
pub use point::{Color, DataPoint, DataType, Location, PointError, TimeSeries, Value, Vector3d};
pub use rule::{
    ActionSpec, Condition, Operator, RetryPolicy, Rule, RuleValidationError, KNOWN_ACTION_TYPES,
    MAX_CONDITION_DEPTH,
};
pub use tags::TagMap;
