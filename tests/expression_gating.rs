//! Expression-gated rule over the per-series value history: the classic
//! spike detector `value > avg(last_values, 3) + 2 * stddev(last_values, 3)`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fluxgate::actions::{ActionEnv, ActionRegistry};
use fluxgate::bus::{BatchConfig, BatchPublisher, BusClient, BusServer};
use fluxgate::metrics::GatewayMetrics;
use fluxgate::notify::NotifierRegistry;
use fluxgate::rules::expr::ExprCache;
use fluxgate::rules::{EngineConfig, RegexCache, RuleEngine, RuleStore, SeriesHistory};
use fluxgate::runtime::Service;
use fluxgate::types::{AlertEvent, DataPoint, Value};

#[tokio::test]
async fn spike_gate_matches_only_the_outlier() {
    let cancel = CancellationToken::new();
    let server = BusServer::start("127.0.0.1", 0, 0, cancel.child_token())
        .await
        .expect("embedded bus");
    let addr = format!("127.0.0.1:{}", server.local_addr().port());
    let client = BusClient::connect(&addr, cancel.clone())
        .await
        .expect("bus client");

    let metrics = GatewayMetrics::new();
    let publisher = BatchPublisher::new(
        client.clone(),
        BatchConfig::default(),
        cancel.clone(),
    );
    let exprs = Arc::new(ExprCache::new(256));
    let regexes = Arc::new(RegexCache::new());
    let env = ActionEnv {
        bus: client.clone(),
        publisher,
        metrics: Arc::clone(&metrics),
        notifier: Arc::new(NotifierRegistry::new()),
        exprs: Arc::clone(&exprs),
        regexes: Arc::clone(&regexes),
    };
    let actions = Arc::new(ActionRegistry::standard(&env));

    let store = Arc::new(RuleStore::new(None));
    let rule = serde_json::from_value(serde_json::json!({
        "id": "spike",
        "name": "spike detector",
        "conditions": {
            "kind": "expression",
            "script": "value > avg(last_values, 3) + 2 * stddev(last_values, 3)"
        },
        "actions": [{"type": "alert", "config": {"level": "warning", "throttle": 0}}]
    }))
    .expect("rule json");
    let report = store.load_inline(vec![rule]);
    assert!(report.rejected.is_empty());

    // One worker: history order must match injection order.
    let engine = RuleEngine::new(
        EngineConfig {
            worker_pool_size: 1,
            ..EngineConfig::default()
        },
        client.clone(),
        store,
        actions,
        Arc::clone(&metrics),
        Arc::new(SeriesHistory::default()),
        regexes,
        Arc::clone(&exprs),
        cancel.clone(),
    );
    engine.init().await.unwrap();
    engine.start().await.unwrap();

    let (tx, mut alerts) = mpsc::channel(16);
    let handler: fluxgate::bus::MessageHandler = Arc::new(move |msg| {
        let _ = tx.try_send(msg);
    });
    let sub = client.subscribe("iot.alerts.spike", handler).await.unwrap();

    for v in [10.0, 10.0, 10.0, 10.0, 50.0] {
        let point = DataPoint::new("vib-1", "amplitude", Value::Float(v)).unwrap();
        let payload = serde_json::to_vec(&point).unwrap();
        client.publish(&point.subject(), &payload).await.unwrap();
    }

    // Exactly one alert: the fifth point.
    let msg = tokio::time::timeout(Duration::from_secs(2), alerts.recv())
        .await
        .expect("spike alert expected")
        .expect("channel open");
    let event: AlertEvent = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(event.value, Some(serde_json::json!(50.0)));
    assert!(
        tokio::time::timeout(Duration::from_millis(300), alerts.recv())
            .await
            .is_err(),
        "steady points must not match"
    );

    // The first point evaluated against an empty history: that is a
    // condition error (counted), not a match and not a crash.
    assert_eq!(metrics.condition_errors.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.rules_matched.load(Ordering::Relaxed), 1);
    // Identical expression text parsed exactly once across five points.
    assert_eq!(exprs.misses(), 1);
    assert_eq!(exprs.hits(), 4);

    sub.release().await;
    engine.stop().await.unwrap();
    cancel.cancel();
    server.shutdown().await;
}
