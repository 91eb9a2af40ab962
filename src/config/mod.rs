//! Gateway configuration.
//!
//! Typed sections loaded from YAML or JSON, validated at load time.
//!
//! ## Loading order
//!
//! 1. `--config <path>` CLI argument
//! 2. `FLUXGATE_CONFIG` environment variable
//! 3. `fluxgate.yaml` in the current working directory
//! 4. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere.
//! Live reload applies a whitelisted subset (log level, load shedding)
//! through `config::overrides()`; an invalid new file is rejected and the
//! running config stays.

pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::ChannelSpec;
use crate::plugins::PluginDecl;
use crate::types::Rule;

/// Default embedded bus port.
pub const DEFAULT_BUS_PORT: u16 = 4222;

/// Fallback when the primary embedded port is busy.
pub const DEFAULT_BUS_FALLBACK_PORT: u16 = 4223;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Gateway instance id (appears in logs and exported metrics)
    pub id: String,
    /// Reserved for the external admin surface
    pub http_port: u16,
    pub log_level: String,
    /// `embedded`, `embedded:<port>` or `<host>:<port>`
    pub nats_url: String,
    /// Where sidecar manifests and plug-in assets live
    pub plugins_dir: Option<PathBuf>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            id: "fluxgate".to_string(),
            http_port: 8080,
            log_level: "info".to_string(),
            nats_url: "embedded".to_string(),
            plugins_dir: None,
        }
    }
}

/// How the runtime reaches the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMode {
    Embedded { port: u16, fallback_port: u16 },
    External { addr: String },
}

impl GatewaySection {
    pub fn bus_mode(&self) -> Result<BusMode, ConfigError> {
        let url = self.nats_url.trim();
        if url == "embedded" {
            return Ok(BusMode::Embedded {
                port: DEFAULT_BUS_PORT,
                fallback_port: DEFAULT_BUS_FALLBACK_PORT,
            });
        }
        if let Some(port) = url.strip_prefix("embedded:") {
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad embedded port in '{url}'")))?;
            return Ok(BusMode::Embedded {
                port,
                fallback_port: port.wrapping_add(1).max(1),
            });
        }
        let addr = url.strip_prefix("nats://").unwrap_or(url);
        if !addr.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "nats_url '{url}' needs host:port"
            )));
        }
        Ok(BusMode::External {
            addr: addr.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExpressionEngineSection {
    pub cache_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleEngineSection {
    pub enabled: bool,
    pub rules_dir: Option<PathBuf>,
    pub subject: String,
    pub worker_pool_size: usize,
    /// Batched async publish threshold
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub expression_engine: ExpressionEngineSection,
    pub shed_low_priority: bool,
    pub shed_priority_floor: u8,
    pub shed_watermark: u64,
    /// Inline rules, merged with the rules directory
    pub rules: Vec<Rule>,
}

impl Default for RuleEngineSection {
    fn default() -> Self {
        Self {
            enabled: true,
            rules_dir: None,
            subject: "iot.data.>".to_string(),
            worker_pool_size: 8,
            batch_size: crate::bus::DEFAULT_BATCH_SIZE,
            queue_capacity: 1_024,
            expression_engine: ExpressionEngineSection::default(),
            shed_low_priority: false,
            shed_priority_floor: 50,
            shed_watermark: 512,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SouthboundSection {
    pub adapters: Vec<PluginDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub enabled: bool,
    pub subjects: Vec<String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            enabled: true,
            subjects: crate::router::default_subjects(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NorthboundSection {
    pub sinks: Vec<PluginDecl>,
    pub router: RouterSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub rule_engine: RuleEngineSection,
    pub southbound: SouthboundSection,
    pub northbound: NorthboundSection,
    pub notifications: Vec<ChannelSpec>,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl GatewayConfig {
    /// Load from a YAML or JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&text, path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let is_json = path.extension().is_some_and(|e| e == "json");
        let result = if is_json {
            serde_json::from_str(text).map_err(|e| e.to_string())
        } else {
            // YAML is a superset of JSON, so .yaml/.yml and extensionless
            // files all go through the YAML parser.
            serde_yaml::from_str(text).map_err(|e| e.to_string())
        };
        result.map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.id.is_empty() {
            return Err(ConfigError::Invalid("gateway.id must not be empty".to_string()));
        }
        if !LOG_LEVELS.contains(&self.gateway.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "gateway.log_level '{}' not one of {:?}",
                self.gateway.log_level, LOG_LEVELS
            )));
        }
        self.gateway.bus_mode()?;
        if self.rule_engine.worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "rule_engine.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.rule_engine.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "rule_engine.batch_size must be at least 1".to_string(),
            ));
        }
        if !crate::bus::subject::valid_pattern(&self.rule_engine.subject) {
            return Err(ConfigError::Invalid(format!(
                "rule_engine.subject '{}' is not a valid pattern",
                self.rule_engine.subject
            )));
        }
        for rule in &self.rule_engine.rules {
            rule.validate()
                .map_err(|e| ConfigError::Invalid(format!("inline rule: {e}")))?;
        }
        let mut names: Vec<&str> = self
            .southbound
            .adapters
            .iter()
            .chain(self.northbound.sinks.iter())
            .map(|d| d.name.as_str())
            .collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(
                "plug-in names must be unique across adapters and sinks".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Global config
// ============================================================================

static CONFIG: OnceLock<GatewayConfig> = OnceLock::new();

/// Whitelisted hot-reloadable subset. Everything else requires a restart.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub shed_low_priority: Option<bool>,
}

static OVERRIDES: OnceLock<ArcSwap<Overrides>> = OnceLock::new();

fn overrides_cell() -> &'static ArcSwap<Overrides> {
    OVERRIDES.get_or_init(|| ArcSwap::from_pointee(Overrides::default()))
}

/// Initialize the global configuration. Must run once before `get()`.
pub fn init(config: GatewayConfig) {
    if CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once - ignoring");
    }
}

/// Global configuration. Panics when `init()` has not run; a missing config
/// is a startup bug, not a recoverable condition.
pub fn get() -> &'static GatewayConfig {
    CONFIG
        .get()
        .expect("config::get() called before config::init()")
}

pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}

/// Current hot-reload overrides.
pub fn overrides() -> Arc<Overrides> {
    overrides_cell().load_full()
}

/// One applied (or rejected) live change.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub field: &'static str,
    pub old: String,
    pub new: String,
}

/// Re-read the config file and apply the whitelisted subset. An invalid
/// file is rejected wholesale and the running config stays untouched.
pub fn reload(path: &Path) -> Result<Vec<ConfigChange>, ConfigError> {
    let fresh = GatewayConfig::load(path)?;
    let current = get();
    let active = overrides();
    let mut changes = Vec::new();
    let mut next = (*active).clone();

    let active_level = active
        .log_level
        .clone()
        .unwrap_or_else(|| current.gateway.log_level.clone());
    if fresh.gateway.log_level != active_level {
        changes.push(ConfigChange {
            field: "gateway.log_level",
            old: active_level,
            new: fresh.gateway.log_level.clone(),
        });
        next.log_level = Some(fresh.gateway.log_level.clone());
    }

    let active_shed = active
        .shed_low_priority
        .unwrap_or(current.rule_engine.shed_low_priority);
    if fresh.rule_engine.shed_low_priority != active_shed {
        changes.push(ConfigChange {
            field: "rule_engine.shed_low_priority",
            old: active_shed.to_string(),
            new: fresh.rule_engine.shed_low_priority.to_string(),
        });
        next.shed_low_priority = Some(fresh.rule_engine.shed_low_priority);
    }

    if !changes.is_empty() {
        overrides_cell().store(Arc::new(next));
    }
    Ok(changes)
}

/// Resolve the config file path from CLI/env/cwd.
pub fn resolve_path(cli: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = cli {
        return Some(path);
    }
    if let Ok(path) = std::env::var("FLUXGATE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from("fluxgate.yaml");
    default.exists().then_some(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn bus_mode_parsing() {
        let mut section = GatewaySection::default();
        assert_eq!(
            section.bus_mode().unwrap(),
            BusMode::Embedded {
                port: DEFAULT_BUS_PORT,
                fallback_port: DEFAULT_BUS_FALLBACK_PORT
            }
        );
        section.nats_url = "embedded:5300".to_string();
        assert_eq!(
            section.bus_mode().unwrap(),
            BusMode::Embedded {
                port: 5300,
                fallback_port: 5301
            }
        );
        section.nats_url = "nats://broker-1:4222".to_string();
        assert_eq!(
            section.bus_mode().unwrap(),
            BusMode::External {
                addr: "broker-1:4222".to_string()
            }
        );
        section.nats_url = "nonsense".to_string();
        assert!(section.bus_mode().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
gateway:
  id: plant-7-gw
  log_level: debug
  nats_url: "embedded:5400"
rule_engine:
  worker_pool_size: 4
  subject: "iot.data.>"
southbound:
  adapters:
    - name: line-sensors
      type: sidecar
      config:
        host: 127.0.0.1
        port: 50052
northbound:
  sinks: []
notifications:
  - name: console
    type: console
"#;
        let config = GatewayConfig::parse(yaml, Path::new("test.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateway.id, "plant-7-gw");
        assert_eq!(config.rule_engine.worker_pool_size, 4);
        assert_eq!(config.southbound.adapters.len(), 1);
        assert_eq!(config.southbound.adapters[0].plugin_type, "sidecar");
    }

    #[test]
    fn bad_log_level_rejected() {
        let mut config = GatewayConfig::default();
        config.gateway.log_level = "chatty".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_plugin_names_rejected() {
        let mut config = GatewayConfig::default();
        let decl = PluginDecl {
            name: "dup".to_string(),
            plugin_type: "sidecar".to_string(),
            enabled: true,
            config: serde_json::Value::Null,
        };
        config.southbound.adapters.push(decl.clone());
        config.northbound.sinks.push(decl);
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_config_parses() {
        let json = r#"{"gateway": {"id": "g1"}, "rule_engine": {"worker_pool_size": 2}}"#;
        let config = GatewayConfig::parse(json, Path::new("test.json")).unwrap();
        assert_eq!(config.gateway.id, "g1");
        assert_eq!(config.rule_engine.worker_pool_size, 2);
    }
}
