//! Sidecar bridge adapter.
//!
//! External plug-in processes speak line-delimited JSON over TCP (default
//! port 50052). The sidecar is the server; this adapter connects as a
//! client, sends `CONFIG`, then consumes `DATA` batches and publishes each
//! point onto its telemetry subject. Heartbeats flow both ways on a 15 s
//! interval; a dropped connection reconnects with capped back-off until the
//! adapter stops.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{AdapterMetrics, DataPoint};

use super::api::{Adapter, AdapterContext};
use super::PluginError;

/// Default sidecar listen port.
pub const DEFAULT_PORT: u16 = 50052;

/// Bidirectional heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Reconnect back-off ceiling.
const RECONNECT_CAP: Duration = Duration::from_secs(30);

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Config,
    Data,
    Status,
    Response,
    Heartbeat,
}

/// Line-framed message envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Nanoseconds since the epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: Option<serde_json::Value>) -> Self {
        Self {
            message_type,
            id: None,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataPayload {
    points: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
struct SidecarConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    points_collected: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    /// Epoch seconds of the current connection, 0 when disconnected
    connected_since: AtomicI64,
    response_time_sum_us: AtomicU64,
    response_time_count: AtomicU64,
}

impl Counters {
    fn record_error(&self, error: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.into());
        }
    }
}

pub struct SidecarAdapter {
    name: String,
    addr: Option<String>,
    gateway_config: serde_json::Value,
    counters: Arc<Counters>,
    cancel: Option<CancellationToken>,
}

impl SidecarAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            addr: None,
            gateway_config: serde_json::Value::Null,
            counters: Arc::new(Counters::default()),
            cancel: None,
        }
    }

    /// `host:port` shown as the registry entry for this declaration.
    pub fn endpoint_of(config: &serde_json::Value) -> String {
        let parsed: SidecarConfig =
            serde_json::from_value(config.clone()).unwrap_or_else(|_| SidecarConfig {
                host: default_host(),
                port: default_port(),
            });
        format!("{}:{}", parsed.host, parsed.port)
    }
}

#[async_trait]
impl Adapter for SidecarAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, config: &serde_json::Value) -> Result<(), PluginError> {
        let parsed: SidecarConfig = serde_json::from_value(config.clone())
            .map_err(|e| PluginError::Config(format!("sidecar config: {e}")))?;
        self.addr = Some(format!("{}:{}", parsed.host, parsed.port));
        self.gateway_config = config.clone();
        Ok(())
    }

    async fn start(&mut self, ctx: AdapterContext) -> Result<(), PluginError> {
        let addr = self
            .addr
            .clone()
            .ok_or_else(|| PluginError::Config("sidecar not initialized".to_string()))?;
        let cancel = ctx.cancel.child_token();
        self.cancel = Some(cancel.clone());

        let counters = Arc::clone(&self.counters);
        let gateway_config = self.gateway_config.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            run_bridge(name, addr, gateway_config, ctx, counters, cancel).await;
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.counters.connected_since.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn metrics(&self) -> AdapterMetrics {
        let connected_since = self.counters.connected_since.load(Ordering::Relaxed);
        let uptime = if connected_since > 0 {
            (chrono::Utc::now().timestamp() - connected_since).max(0) as u64
        } else {
            0
        };
        let count = self.counters.response_time_count.load(Ordering::Relaxed);
        let avg_ms = if count == 0 {
            0.0
        } else {
            self.counters.response_time_sum_us.load(Ordering::Relaxed) as f64
                / count as f64
                / 1_000.0
        };
        AdapterMetrics {
            points_collected: self.counters.points_collected.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_error: self.counters.last_error.lock().ok().and_then(|l| l.clone()),
            connection_uptime_secs: uptime,
            avg_response_time_ms: avg_ms,
        }
    }
}

// ============================================================================
// Bridge loop
// ============================================================================

async fn run_bridge(
    name: String,
    addr: String,
    gateway_config: serde_json::Value,
    ctx: AdapterContext,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(sidecar = %name, addr = %addr, "Sidecar connected");
                counters
                    .connected_since
                    .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                backoff = Duration::from_secs(1);

                if let Err(e) =
                    drive_connection(&name, stream, &gateway_config, &ctx, &counters, &cancel).await
                {
                    counters.record_error(e.to_string());
                    warn!(sidecar = %name, error = %e, "Sidecar connection ended");
                }
                counters.connected_since.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                counters.record_error(e.to_string());
                debug!(sidecar = %name, addr = %addr, error = %e, "Sidecar connect failed");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff + jitter) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_CAP);
    }
    debug!(sidecar = %name, "Sidecar bridge stopped");
}

async fn drive_connection(
    name: &str,
    stream: TcpStream,
    gateway_config: &serde_json::Value,
    ctx: &AdapterContext,
    counters: &Counters,
    cancel: &CancellationToken,
) -> Result<(), PluginError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    // Handshake: the gateway opens with CONFIG; the sidecar then streams
    // DATA at its configured interval.
    let config_msg = Envelope::new(MessageType::Config, Some(gateway_config.clone()));
    send_envelope(&mut write_half, &config_msg).await?;

    // Heartbeats go out on their own task so the reader never races a
    // partially-consumed line against the timer.
    let conn_cancel = cancel.child_token();
    let writer = tokio::spawn(heartbeat_loop(write_half, conn_cancel.clone()));

    let result = loop {
        line.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            read = reader.read_line(&mut line) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => break Err(PluginError::Connection(e.to_string())),
        };
        if n == 0 {
            break Err(PluginError::Connection("sidecar closed stream".to_string()));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                counters.record_error(format!("bad envelope: {e}"));
                continue;
            }
        };
        handle_envelope(name, envelope, ctx, counters).await;
    };

    conn_cancel.cancel();
    let _ = writer.await;
    result
}

async fn heartbeat_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    cancel: CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = heartbeat.tick() => {
                let ping = Envelope::new(MessageType::Heartbeat, None);
                if send_envelope(&mut write_half, &ping).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_envelope(
    name: &str,
    envelope: Envelope,
    ctx: &AdapterContext,
    counters: &Counters,
) {
    match envelope.message_type {
        MessageType::Data => {
            let Some(payload) = envelope.payload else {
                counters.record_error("DATA without payload");
                return;
            };
            let data: DataPayload = match serde_json::from_value(payload) {
                Ok(d) => d,
                Err(e) => {
                    counters.record_error(format!("DATA payload: {e}"));
                    return;
                }
            };
            let received = std::time::Instant::now();
            for point in data.points {
                if let Err(e) = point.value.validate() {
                    counters.record_error(format!("point rejected: {e}"));
                    continue;
                }
                match ctx.publish_point(&point).await {
                    Ok(()) => {
                        counters.points_collected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => counters.record_error(format!("publish: {e}")),
                }
            }
            let elapsed = u64::try_from(received.elapsed().as_micros()).unwrap_or(u64::MAX);
            counters
                .response_time_sum_us
                .fetch_add(elapsed, Ordering::Relaxed);
            counters.response_time_count.fetch_add(1, Ordering::Relaxed);
        }
        MessageType::Status => {
            debug!(sidecar = %name, payload = ?envelope.payload, "Sidecar status");
        }
        MessageType::Heartbeat => {
            debug!(sidecar = %name, "Sidecar heartbeat");
        }
        MessageType::Response => {
            debug!(sidecar = %name, id = ?envelope.id, "Sidecar response");
        }
        MessageType::Config => {
            // CONFIG flows gateway -> sidecar only.
            counters.record_error("unexpected CONFIG from sidecar");
        }
    }
}

async fn send_envelope(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    envelope: &Envelope,
) -> Result<(), PluginError> {
    let mut frame =
        serde_json::to_vec(envelope).map_err(|e| PluginError::Connection(e.to_string()))?;
    frame.push(b'\n');
    write_half
        .write_all(&frame)
        .await
        .map_err(|e| PluginError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(MessageType::Config, Some(serde_json::json!({"interval": 5})));
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "CONFIG");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(json["payload"]["interval"], 5);
    }

    #[test]
    fn envelope_parses_data() {
        let line = r#"{"type":"DATA","timestamp":1,"payload":{"points":[{"key":"t","device_id":"d","timestamp":"2026-01-01T00:00:00Z","type":"float","value":1.5}]}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.message_type, MessageType::Data);
        let data: DataPayload = serde_json::from_value(env.payload.unwrap()).unwrap();
        assert_eq!(data.points.len(), 1);
        assert_eq!(data.points[0].key, "t");
    }

    #[test]
    fn endpoint_defaults() {
        assert_eq!(
            SidecarAdapter::endpoint_of(&serde_json::json!({})),
            "127.0.0.1:50052"
        );
        assert_eq!(
            SidecarAdapter::endpoint_of(&serde_json::json!({"host": "10.0.0.5", "port": 6000})),
            "10.0.0.5:6000"
        );
    }
}
