//! Alert auto-resolve timers: one resolve event after quiet period, timer
//! reset on re-fire.

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
use fluxgate::types::{AlertResolved, DataPoint, Value};

async fn start_stack(
    rule_json: serde_json::Value,
) -> (CancellationToken, BusServer, BusClient, RuleEngine) {
    let cancel = CancellationToken::new();
    let server = BusServer::start("127.0.0.1", 0, 0, cancel.child_token())
        .await
        .expect("embedded bus");
    let addr = format!("127.0.0.1:{}", server.local_addr().port());
    let client = BusClient::connect(&addr, cancel.clone())
        .await
        .expect("bus client");

    let metrics = GatewayMetrics::new();
    let exprs = Arc::new(ExprCache::new(64));
    let regexes = Arc::new(RegexCache::new());
    let env = ActionEnv {
        bus: client.clone(),
        publisher: BatchPublisher::new(client.clone(), BatchConfig::default(), cancel.clone()),
        metrics: Arc::clone(&metrics),
        notifier: Arc::new(NotifierRegistry::new()),
        exprs: Arc::clone(&exprs),
        regexes: Arc::clone(&regexes),
    };
    let actions = Arc::new(ActionRegistry::standard(&env));
    let store = Arc::new(RuleStore::new(None));
    let report = store.load_inline(vec![serde_json::from_value(rule_json).unwrap()]);
    assert!(report.rejected.is_empty());

    let engine = RuleEngine::new(
        EngineConfig {
            worker_pool_size: 2,
            ..EngineConfig::default()
        },
        client.clone(),
        store,
        actions,
        metrics,
        Arc::new(SeriesHistory::default()),
        regexes,
        exprs,
        cancel.clone(),
    );
    engine.init().await.unwrap();
    engine.start().await.unwrap();
    (cancel, server, client, engine)
}

fn resolving_rule() -> serde_json::Value {
    serde_json::json!({
        "id": "door-open",
        "name": "Door open",
        "conditions": {"kind": "simple", "field": "value", "operator": "eq", "value": true},
        "actions": [{
            "type": "alert",
            "config": {
                "level": "warning",
                "throttle": 0,
                "auto_resolve": true,
                "resolve_timeout_secs": 1
            }
        }]
    })
}

#[tokio::test]
async fn quiet_period_emits_single_resolve() {
    let (cancel, server, client, engine) = start_stack(resolving_rule()).await;

    let (tx, mut resolves) = mpsc::channel(8);
    let handler: fluxgate::bus::MessageHandler = Arc::new(move |msg| {
        let _ = tx.try_send(msg);
    });
    let sub = client.subscribe("iot.alerts.resolved", handler).await.unwrap();

    let point = DataPoint::new("door-3", "open", Value::Bool(true)).unwrap();
    client
        .publish(&point.subject(), &serde_json::to_vec(&point).unwrap())
        .await
        .unwrap();

    // One resolve after the quiet second, then silence.
    let msg = tokio::time::timeout(Duration::from_secs(3), resolves.recv())
        .await
        .expect("resolve event expected")
        .unwrap();
    let resolved: AlertResolved = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(resolved.rule_id, "door-open");
    assert_eq!(resolved.alert_key, "door-open|door-3|open");
    assert!(
        tokio::time::timeout(Duration::from_millis(500), resolves.recv())
            .await
            .is_err(),
        "exactly one resolve per alert"
    );

    sub.release().await;
    engine.stop().await.unwrap();
    cancel.cancel();
    server.shutdown().await;
}

#[tokio::test]
async fn refire_resets_the_timer() {
    let (cancel, server, client, engine) = start_stack(resolving_rule()).await;

    let (tx, mut resolves) = mpsc::channel(8);
    let handler: fluxgate::bus::MessageHandler = Arc::new(move |msg| {
        let _ = tx.try_send(msg);
    });
    let sub = client.subscribe("iot.alerts.resolved", handler).await.unwrap();

    let point = DataPoint::new("door-3", "open", Value::Bool(true)).unwrap();
    let payload = serde_json::to_vec(&point).unwrap();
    client.publish(&point.subject(), &payload).await.unwrap();

    // Re-fire inside the resolve window: the first timer must stand down.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.publish(&point.subject(), &payload).await.unwrap();

    // Nothing resolves before the second timer matures (~1.5 s from start).
    assert!(
        tokio::time::timeout(Duration::from_millis(800), resolves.recv())
            .await
            .is_err(),
        "first timer must have been reset by the re-fire"
    );
    // Exactly one resolve eventually.
    tokio::time::timeout(Duration::from_secs(2), resolves.recv())
        .await
        .expect("resolve event expected")
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(500), resolves.recv())
            .await
            .is_err(),
        "only one resolve in total"
    );

    sub.release().await;
    engine.stop().await.unwrap();
    cancel.cancel();
    server.shutdown().await;
}
