//! Rule engine integration tests over a live embedded bus.
//!
//! Covers the end-to-end scenarios: threshold alert with throttling, the
//! concurrent throttle race, transform output, priority ordering, the
//! empty-rule-set boundary and malformed payload resilience.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fluxgate::actions::{ActionEnv, ActionRegistry};
use fluxgate::bus::{BatchConfig, BatchPublisher, BusClient, BusMessage, BusServer};
use fluxgate::metrics::GatewayMetrics;
use fluxgate::notify::NotifierRegistry;
use fluxgate::rules::expr::ExprCache;
use fluxgate::rules::{EngineConfig, RegexCache, RuleEngine, RuleStore, SeriesHistory};
use fluxgate::runtime::Service;
use fluxgate::types::{AlertEvent, DataPoint, Rule, Value};

struct Harness {
    cancel: CancellationToken,
    server: BusServer,
    client: BusClient,
    metrics: Arc<GatewayMetrics>,
    engine: RuleEngine,
}

impl Harness {
    async fn start(workers: usize, rules: Vec<Rule>) -> Self {
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
            BatchConfig {
                flush_interval: Duration::from_millis(10),
                ..BatchConfig::default()
            },
            cancel.clone(),
        );
        let exprs = Arc::new(ExprCache::new(1_024));
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
        let report = store.load_inline(rules);
        assert!(report.rejected.is_empty(), "rules rejected: {:?}", report.rejected);

        let engine = RuleEngine::new(
            EngineConfig {
                worker_pool_size: workers,
                ..EngineConfig::default()
            },
            client.clone(),
            store,
            actions,
            Arc::clone(&metrics),
            Arc::new(SeriesHistory::default()),
            regexes,
            exprs,
            cancel.clone(),
        );
        engine.init().await.expect("engine init");
        engine.start().await.expect("engine start");

        Self {
            cancel,
            server,
            client,
            metrics,
            engine,
        }
    }

    async fn collect(&self, pattern: &str) -> (fluxgate::Subscription, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(256);
        let handler: fluxgate::bus::MessageHandler = Arc::new(move |msg| {
            let _ = tx.try_send(msg);
        });
        let sub = self
            .client
            .subscribe(pattern, handler)
            .await
            .expect("subscribe");
        (sub, rx)
    }

    async fn inject(&self, point: &DataPoint) {
        let payload = serde_json::to_vec(point).unwrap();
        self.client.publish(&point.subject(), &payload).await.unwrap();
    }

    async fn shutdown(self) {
        self.engine.stop().await.expect("engine stop");
        self.cancel.cancel();
        self.server.shutdown().await;
    }
}

fn rule(json: serde_json::Value) -> Rule {
    serde_json::from_value(json).expect("rule json")
}

fn threshold_alert_rule(throttle_secs: u64) -> Rule {
    rule(serde_json::json!({
        "id": "overheat",
        "name": "Overheat guard",
        "priority": 80,
        "conditions": {"kind": "simple", "field": "value", "operator": "gt", "value": 40},
        "actions": [{
            "type": "alert",
            "config": {"level": "critical", "throttle": throttle_secs}
        }]
    }))
}

async fn recv_within(rx: &mut mpsc::Receiver<BusMessage>, ms: u64) -> BusMessage {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

async fn wait_until(mut cond: impl FnMut() -> bool, ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn threshold_alert_fires_once_within_throttle() {
    let harness = Harness::start(4, vec![threshold_alert_rule(2)]).await;
    let (sub, mut alerts) = harness.collect("iot.alerts.triggered").await;

    for _ in 0..3 {
        let point = DataPoint::new("press-7", "temperature", Value::Float(41.0)).unwrap();
        harness.inject(&point).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    let first = recv_within(&mut alerts, 2_000).await;
    let event: AlertEvent = serde_json::from_slice(&first.payload).unwrap();
    assert_eq!(event.rule_id, "overheat");
    assert_eq!(event.device_id.as_deref(), Some("press-7"));

    // The two follow-ups report throttled and emit nothing.
    let metrics = Arc::clone(&harness.metrics);
    assert!(
        wait_until(move || metrics.alerts_throttled.load(Ordering::Relaxed) == 2, 2_000).await,
        "expected 2 throttled outcomes, got {}",
        harness.metrics.alerts_throttled.load(Ordering::Relaxed)
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(300), alerts.recv())
            .await
            .is_err(),
        "no second alert may be emitted inside the throttle window"
    );
    assert_eq!(harness.metrics.alerts_emitted.load(Ordering::Relaxed), 1);

    sub.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn concurrent_throttle_race_emits_exactly_one() {
    let harness = Harness::start(8, vec![threshold_alert_rule(2)]).await;
    let (sub, mut alerts) = harness.collect("iot.alerts.triggered").await;

    // 10 simultaneous triggers of the same throttle key.
    let publishes = (0..10).map(|_| {
        let client = harness.client.clone();
        async move {
            let point = DataPoint::new("press-7", "temperature", Value::Float(41.0)).unwrap();
            let payload = serde_json::to_vec(&point).unwrap();
            client.publish(&point.subject(), &payload).await.unwrap();
        }
    });
    futures::future::join_all(publishes).await;

    // All 10 evaluated and matched...
    let metrics = Arc::clone(&harness.metrics);
    assert!(
        wait_until(move || metrics.rules_matched.load(Ordering::Relaxed) == 10, 3_000).await,
        "all 10 points must match"
    );
    // ... but exactly one emission survived the CAS.
    recv_within(&mut alerts, 2_000).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(400), alerts.recv())
            .await
            .is_err(),
        "exactly one alert may escape the throttle"
    );
    assert_eq!(harness.metrics.alerts_emitted.load(Ordering::Relaxed), 1);
    assert_eq!(harness.metrics.alerts_throttled.load(Ordering::Relaxed), 9);

    sub.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn transform_scales_onto_output_subject() {
    let transform_rule = rule(serde_json::json!({
        "id": "c-to-f",
        "name": "Celsius to Fahrenheit",
        "conditions": {"kind": "simple", "field": "key", "operator": "eq", "value": "temperature_c"},
        "actions": [{
            "type": "transform",
            "config": {"formula": "x * 9 / 5 + 32", "new_key": "temperature_f"}
        }]
    }));
    let harness = Harness::start(4, vec![transform_rule]).await;
    let (sub, mut outputs) = harness.collect("iot.rules.c-to-f.transform").await;

    let point = DataPoint::new("boiler-1", "temperature_c", Value::Float(100.0)).unwrap();
    harness.inject(&point).await;

    let msg = recv_within(&mut outputs, 2_000).await;
    let transformed: DataPoint = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(transformed.key, "temperature_f");
    assert_eq!(transformed.value, Value::Float(212.0));
    assert_eq!(transformed.device_id, "boiler-1");

    sub.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn priority_order_runs_higher_rule_first() {
    let high = rule(serde_json::json!({
        "id": "high",
        "name": "high priority",
        "priority": 90,
        "conditions": {"kind": "simple", "field": "value", "operator": "exists"},
        "actions": [{"type": "forward", "config": {"subjects": ["test.out.high"]}}]
    }));
    let low = rule(serde_json::json!({
        "id": "low",
        "name": "low priority",
        "priority": 10,
        "conditions": {"kind": "simple", "field": "value", "operator": "exists"},
        "actions": [{"type": "forward", "config": {"subjects": ["test.out.low"]}}]
    }));

    // Single worker makes the ordering observable on the output stream.
    let harness = Harness::start(1, vec![low, high]).await;
    let (sub, mut outputs) = harness.collect("test.out.*").await;

    let point = DataPoint::new("dev", "k", Value::Int(5)).unwrap();
    harness.inject(&point).await;

    let first = recv_within(&mut outputs, 2_000).await;
    let second = recv_within(&mut outputs, 2_000).await;
    assert_eq!(first.subject, "test.out.high");
    assert_eq!(second.subject, "test.out.low");

    sub.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn empty_rule_set_produces_no_outputs() {
    let harness = Harness::start(2, Vec::new()).await;
    let (rules_sub, mut rules_rx) = harness.collect("iot.rules.>").await;
    let (alerts_sub, mut alerts_rx) = harness.collect("iot.alerts.>").await;

    let point = DataPoint::new("dev", "k", Value::Float(99.0)).unwrap();
    harness.inject(&point).await;

    let metrics = Arc::clone(&harness.metrics);
    assert!(wait_until(move || metrics.points_total.load(Ordering::Relaxed) == 1, 2_000).await);
    assert!(tokio::time::timeout(Duration::from_millis(300), rules_rx.recv())
        .await
        .is_err());
    assert!(tokio::time::timeout(Duration::from_millis(100), alerts_rx.recv())
        .await
        .is_err());

    rules_sub.release().await;
    alerts_sub.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_counted_not_fatal() {
    let harness = Harness::start(2, vec![threshold_alert_rule(0)]).await;
    let (sub, mut alerts) = harness.collect("iot.alerts.triggered").await;

    harness
        .client
        .publish("iot.data.dev.k", b"{definitely not json")
        .await
        .unwrap();
    let metrics = Arc::clone(&harness.metrics);
    assert!(
        wait_until(move || metrics.malformed_payloads.load(Ordering::Relaxed) == 1, 2_000).await,
        "malformed payload must be counted"
    );

    // The engine keeps processing valid points afterwards.
    let point = DataPoint::new("dev", "k", Value::Float(50.0)).unwrap();
    harness.inject(&point).await;
    recv_within(&mut alerts, 2_000).await;

    sub.release().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn metrics_conservation_holds() {
    let harness = Harness::start(4, vec![threshold_alert_rule(0)]).await;

    for i in 0..20 {
        let point = DataPoint::new("dev", "k", Value::Float(30.0 + f64::from(i))).unwrap();
        harness.inject(&point).await;
    }
    let metrics = Arc::clone(&harness.metrics);
    assert!(wait_until(move || metrics.points_total.load(Ordering::Relaxed) == 20, 3_000).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let matched = harness.metrics.rules_matched.load(Ordering::Relaxed);
    let succeeded = harness.metrics.actions_succeeded.load(Ordering::Relaxed);
    let failed = harness.metrics.actions_failed.load(Ordering::Relaxed);
    let retries = harness.metrics.action_retries.load(Ordering::Relaxed);
    assert!(matched >= succeeded + failed - retries);
    // Values 41..49 exceed the threshold.
    assert_eq!(matched, 9);

    harness.shutdown().await;
}
