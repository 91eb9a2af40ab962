//! Plug-in metadata, lifecycle states and per-instance counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Illegal plug-in transition {from} -> {to}")]
    IllegalTransition {
        from: PluginStatus,
        to: PluginStatus,
    },
}

/// Adapter (southbound) or sink (northbound).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Adapter,
    Sink,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::Adapter => write!(f, "adapter"),
            PluginKind::Sink => write!(f, "sink"),
        }
    }
}

/// Compiled-in factory or external sidecar process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    #[default]
    Builtin,
    Sidecar,
}

/// Plug-in lifecycle state.
///
/// Legal flow: `Created -> Initialized -> Starting -> Running -> Stopping ->
/// Stopped`; any transition failure short-cuts to `Error`. `restart` is
/// modelled as stop followed by start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    #[default]
    Created,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginStatus::Created => "created",
            PluginStatus::Initialized => "initialized",
            PluginStatus::Starting => "starting",
            PluginStatus::Running => "running",
            PluginStatus::Stopping => "stopping",
            PluginStatus::Stopped => "stopped",
            PluginStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl PluginStatus {
    /// Check a requested transition against the state machine.
    ///
    /// `Error` is reachable from every state (the failure short-cut), and an
    /// errored or stopped plug-in may be started again (`restart`).
    pub fn check_transition(self, to: PluginStatus) -> Result<(), LifecycleError> {
        use PluginStatus::{
            Created, Error, Initialized, Running, Starting, Stopped, Stopping,
        };
        let legal = matches!(
            (self, to),
            (_, Error)
                | (Created, Initialized)
                | (Initialized, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopping)
        );
        if legal {
            Ok(())
        } else {
            Err(LifecycleError::IllegalTransition { from: self, to })
        }
    }
}

/// Registry entry describing one configured plug-in instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    #[serde(default)]
    pub mode: PluginMode,
    /// Factory type name for builtins, `host:port` for sidecars
    pub entry: String,
    #[serde(default)]
    pub status: PluginStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Per-adapter counters, read by the metrics collector once per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub points_collected: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub connection_uptime_secs: u64,
    pub avg_response_time_ms: f64,
}

/// Per-sink counters, read by the metrics collector once per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkMetrics {
    pub messages_published: u64,
    pub errors: u64,
    pub connection_uptime_secs: u64,
    pub avg_response_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use PluginStatus::*;
        let path = [Created, Initialized, Starting, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(pair[0].check_transition(pair[1]).is_ok());
        }
    }

    #[test]
    fn error_reachable_from_anywhere() {
        use PluginStatus::*;
        for from in [Created, Initialized, Starting, Running, Stopping, Stopped] {
            assert!(from.check_transition(Error).is_ok());
        }
    }

    #[test]
    fn restart_from_stopped_and_error() {
        assert!(PluginStatus::Stopped
            .check_transition(PluginStatus::Starting)
            .is_ok());
        assert!(PluginStatus::Error
            .check_transition(PluginStatus::Starting)
            .is_ok());
    }

    #[test]
    fn skipping_init_is_illegal() {
        assert!(PluginStatus::Created
            .check_transition(PluginStatus::Running)
            .is_err());
    }
}
