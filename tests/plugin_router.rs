//! Plug-in manager and sink router behaviour: raw pass-through to passive
//! sinks, rule-output bridging, and isolation of a plug-in that fails to
//! start.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fluxgate::bus::{BusClient, BusServer};
use fluxgate::metrics::GatewayMetrics;
use fluxgate::plugins::{
    Adapter, AdapterContext, PluginDecl, PluginError, PluginManager, PluginRegistry, Sink,
    SinkMessage,
};
use fluxgate::router::{RouterConfig, SinkRouter};
use fluxgate::runtime::Service;
use fluxgate::types::{AlertEvent, AlertLevel, DataPoint, PluginStatus, SinkMetrics, Value};

struct CaptureSink {
    name: String,
    tx: mpsc::UnboundedSender<SinkMessage>,
}

#[async_trait]
impl Sink for CaptureSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, _config: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    async fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn publish(&self, message: &SinkMessage) -> Result<(), PluginError> {
        self.tx
            .send(message.clone())
            .map_err(|_| PluginError::SinkWrite("capture channel closed".to_string()))
    }

    fn metrics(&self) -> SinkMetrics {
        SinkMetrics::default()
    }
}

struct BrokenAdapter;

#[async_trait]
impl Adapter for BrokenAdapter {
    fn name(&self) -> &str {
        "broken"
    }

    async fn init(&mut self, _config: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    async fn start(&mut self, _ctx: AdapterContext) -> Result<(), PluginError> {
        Err(PluginError::Connection("device unreachable".to_string()))
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn metrics(&self) -> fluxgate::types::AdapterMetrics {
        fluxgate::types::AdapterMetrics::default()
    }
}

async fn bus(cancel: &CancellationToken) -> (BusServer, BusClient) {
    let server = BusServer::start("127.0.0.1", 0, 0, cancel.child_token())
        .await
        .expect("embedded bus");
    let addr = format!("127.0.0.1:{}", server.local_addr().port());
    let client = BusClient::connect(&addr, cancel.clone())
        .await
        .expect("bus client");
    (server, client)
}

fn decl(name: &str, plugin_type: &str) -> PluginDecl {
    PluginDecl {
        name: name.to_string(),
        plugin_type: plugin_type.to_string(),
        enabled: true,
        config: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn raw_telemetry_reaches_passive_sinks() {
    let cancel = CancellationToken::new();
    let (server, client) = bus(&cancel).await;
    let metrics = GatewayMetrics::new();

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(PluginRegistry::new());
    registry.register_sink_factory("capture", move |name| {
        Box::new(CaptureSink {
            name: name.to_string(),
            tx: sink_tx.clone(),
        }) as Box<dyn Sink>
    });

    let manager = PluginManager::new(
        Arc::clone(&registry),
        client.clone(),
        Arc::clone(&metrics),
        Vec::new(),
        vec![decl("tsdb", "capture")],
        "iot.data.>".to_string(),
        cancel.clone(),
    );
    manager.init().await.unwrap();
    manager.start().await.unwrap();
    assert_eq!(registry.sink_status("tsdb"), Some(PluginStatus::Running));

    let point = DataPoint::new("dev-1", "temp", Value::Float(19.5)).unwrap();
    let payload = serde_json::to_vec(&point).unwrap();
    client.publish(&point.subject(), &payload).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
        .await
        .expect("sink never received raw telemetry")
        .unwrap();
    match delivered {
        SinkMessage::Point(p) => assert_eq!(p.key, "temp"),
        other => panic!("expected raw point, got {other:?}"),
    }

    manager.stop().await.unwrap();
    assert_eq!(registry.sink_status("tsdb"), Some(PluginStatus::Stopped));
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn failed_adapter_is_isolated() {
    let cancel = CancellationToken::new();
    let (server, client) = bus(&cancel).await;
    let metrics = GatewayMetrics::new();

    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(PluginRegistry::new());
    registry.register_adapter_factory("flaky-device", |_| Box::new(BrokenAdapter) as Box<dyn Adapter>);
    registry.register_sink_factory("capture", move |name| {
        Box::new(CaptureSink {
            name: name.to_string(),
            tx: sink_tx.clone(),
        }) as Box<dyn Sink>
    });

    let manager = PluginManager::new(
        Arc::clone(&registry),
        client.clone(),
        Arc::clone(&metrics),
        vec![decl("line-3", "flaky-device")],
        vec![decl("tsdb", "capture")],
        "iot.data.>".to_string(),
        cancel.clone(),
    );
    manager.init().await.unwrap();
    // The broken adapter must not prevent the manager (or the sink) from
    // starting.
    manager.start().await.unwrap();
    assert_eq!(registry.adapter_status("line-3"), Some(PluginStatus::Error));
    assert_eq!(registry.sink_status("tsdb"), Some(PluginStatus::Running));
    assert_eq!(registry.errored_count(), 1);

    manager.stop().await.unwrap();
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn router_bridges_alerts_into_passive_sinks() {
    let cancel = CancellationToken::new();
    let (server, client) = bus(&cancel).await;
    let metrics = GatewayMetrics::new();

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(PluginRegistry::new());
    registry.register_sink_factory("capture", move |name| {
        Box::new(CaptureSink {
            name: name.to_string(),
            tx: sink_tx.clone(),
        }) as Box<dyn Sink>
    });
    registry.create_sink(&decl("tsdb", "capture")).unwrap();
    registry.start_sink("tsdb").await.unwrap();

    let router = SinkRouter::new(
        RouterConfig::default(),
        client.clone(),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        cancel.clone(),
    );
    router.init().await.unwrap();
    router.start().await.unwrap();

    let alert = AlertEvent {
        id: "a1".to_string(),
        rule_id: "overheat".to_string(),
        rule_name: "Overheat guard".to_string(),
        level: AlertLevel::Critical,
        message: "temperature over limit".to_string(),
        device_id: Some("press-7".to_string()),
        key: Some("temperature".to_string()),
        value: Some(serde_json::json!(41.0)),
        tags: Default::default(),
        timestamp: chrono::Utc::now(),
        throttle_secs: 2,
        notification_channels: Vec::new(),
        auto_resolve: false,
        resolve_timeout_secs: None,
        priority: Some(80),
    };
    client
        .publish(
            "iot.alerts.overheat",
            &serde_json::to_vec(&alert).unwrap(),
        )
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
        .await
        .expect("router never delivered the alert")
        .unwrap();
    match delivered {
        SinkMessage::Alert(a) => {
            assert_eq!(a.rule_id, "overheat");
            assert_eq!(a.level, AlertLevel::Critical);
        }
        other => panic!("expected alert, got {other:?}"),
    }

    // Rule outputs bridge as raw payloads.
    client
        .publish("iot.rules.overheat.aggregate", br#"{"avg": 3.0}"#)
        .await
        .unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
        .await
        .expect("router never delivered the rule output")
        .unwrap();
    match delivered {
        SinkMessage::RuleOutput { subject, payload } => {
            assert_eq!(subject, "iot.rules.overheat.aggregate");
            assert_eq!(payload["avg"], 3.0);
        }
        other => panic!("expected rule output, got {other:?}"),
    }

    router.stop().await.unwrap();
    cancel.cancel();
    server.shutdown().await;
}
