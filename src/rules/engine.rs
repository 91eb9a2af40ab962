//! Rule engine service: bus subscription, worker pool, per-point dispatch.
//!
//! The bus handler only enqueues raw messages onto a bounded channel; N
//! workers decode, snapshot the rule index and evaluate. Backlog beyond the
//! channel bound drops the point (counted - at-most-once holds end to end)
//! and chronic backlog optionally sheds rules below a priority floor.
//! Nothing thrown inside evaluation ever reaches the bus subscriber: every
//! failure becomes a counter and a log line.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::actions::ActionRegistry;
use crate::bus::{BusClient, BusMessage, Subscription};
use crate::metrics::GatewayMetrics;
use crate::runtime::Service;
use crate::types::{DataPoint, Rule};

use super::condition::evaluate_condition;
use super::expr::ExprCache;
use super::history::SeriesHistory;
use super::store::RuleStore;
use super::RegexCache;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Telemetry subscription pattern
    pub subject: String,
    pub worker_pool_size: usize,
    /// Bound of the worker feed channel
    pub queue_capacity: usize,
    /// Shed rules below the floor when backlog passes the watermark
    pub shed_low_priority: bool,
    pub shed_priority_floor: u8,
    pub shed_watermark: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subject: "iot.data.>".to_string(),
            worker_pool_size: 8,
            queue_capacity: 1_024,
            shed_low_priority: false,
            shed_priority_floor: 50,
            shed_watermark: 512,
        }
    }
}

struct EngineState {
    subscription: Option<Subscription>,
    tracker: Option<TaskTracker>,
}

/// Everything a worker touches, shared once.
struct WorkerCtx {
    store: Arc<RuleStore>,
    registry: Arc<ActionRegistry>,
    metrics: Arc<GatewayMetrics>,
    series: Arc<SeriesHistory>,
    regexes: Arc<RegexCache>,
    exprs: Arc<ExprCache>,
    config: EngineConfig,
}

pub struct RuleEngine {
    bus: BusClient,
    ctx: Arc<WorkerCtx>,
    cancel: CancellationToken,
    state: Mutex<EngineState>,
}

impl RuleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        bus: BusClient,
        store: Arc<RuleStore>,
        registry: Arc<ActionRegistry>,
        metrics: Arc<GatewayMetrics>,
        series: Arc<SeriesHistory>,
        regexes: Arc<RegexCache>,
        exprs: Arc<ExprCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            ctx: Arc::new(WorkerCtx {
                store,
                registry,
                metrics,
                series,
                regexes,
                exprs,
                config,
            }),
            cancel,
            state: Mutex::new(EngineState {
                subscription: None,
                tracker: None,
            }),
        }
    }

    pub fn store(&self) -> Arc<RuleStore> {
        Arc::clone(&self.ctx.store)
    }
}

#[async_trait]
impl Service for RuleEngine {
    fn name(&self) -> &'static str {
        "rule-engine"
    }

    async fn init(&self) -> anyhow::Result<()> {
        let report = self.ctx.store.load_dir()?;
        for (file, reason) in &report.rejected {
            self.ctx.metrics.record_error("rule_parse", "warning");
            warn!(file = %file, reason = %reason, "Rule rejected at load");
        }
        info!(
            rules = self.ctx.store.list().len(),
            rejected = report.rejected.len(),
            "Rule engine initialized"
        );
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel::<BusMessage>(self.ctx.config.queue_capacity);
        let shared_rx = Arc::new(Mutex::new(rx));
        let tracker = TaskTracker::new();

        for worker_id in 0..self.ctx.config.worker_pool_size.max(1) {
            let ctx = Arc::clone(&self.ctx);
            let rx = Arc::clone(&shared_rx);
            let cancel = self.cancel.clone();
            tracker.spawn(async move {
                worker_loop(worker_id, ctx, rx, cancel).await;
            });
        }

        // Handlers with background work (aggregate sweeper).
        self.ctx.registry.start_background(&self.cancel);

        let metrics = Arc::clone(&self.ctx.metrics);
        let handler: crate::bus::MessageHandler = Arc::new(move |msg: BusMessage| {
            match tx.try_send(msg) {
                Ok(()) => {
                    metrics.rule_queue_length.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics.points_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics.record_error("backlog", "error");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        });
        let subscription = self.bus.subscribe(&self.ctx.config.subject, handler).await?;

        let mut state = self.state.lock().await;
        state.subscription = Some(subscription);
        state.tracker = Some(tracker);
        info!(
            subject = %self.ctx.config.subject,
            workers = self.ctx.config.worker_pool_size,
            "Rule engine started"
        );
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let (subscription, tracker) = {
            let mut state = self.state.lock().await;
            (state.subscription.take(), state.tracker.take())
        };
        if let Some(sub) = subscription {
            // Releasing drops the handler and with it the channel sender;
            // workers drain what is queued and exit.
            sub.release().await;
        }
        if let Some(tracker) = tracker {
            tracker.close();
            tracker.wait().await;
        }
        info!("Rule engine stopped");
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerCtx>,
    rx: Arc<Mutex<mpsc::Receiver<BusMessage>>>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Rule worker up");
    loop {
        let msg = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = cancelled_forever(&cancel) => None,
                msg = rx.recv() => msg,
            }
        };
        let Some(msg) = msg else { break };
        ctx.metrics.rule_queue_length.fetch_sub(1, Ordering::Relaxed);
        process_message(&ctx, msg).await;
    }
    debug!(worker_id, "Rule worker down");
}

/// Cancellation that still lets queued work drain: workers only observe the
/// token while idle on the channel.
async fn cancelled_forever(cancel: &CancellationToken) {
    cancel.cancelled().await;
    // Give recv a chance to win the race for already-queued messages.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

async fn process_message(ctx: &WorkerCtx, msg: BusMessage) {
    let started = Instant::now();
    ctx.metrics
        .bytes_total
        .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);

    let point = match decode_point(&msg.payload) {
        Ok(p) => p,
        Err(reason) => {
            ctx.metrics.malformed_payloads.fetch_add(1, Ordering::Relaxed);
            ctx.metrics.record_error("malformed_payload", "warning");
            debug!(subject = %msg.subject, reason = %reason, "Discarding malformed point");
            return;
        }
    };
    ctx.metrics.points_total.fetch_add(1, Ordering::Relaxed);

    let snapshot = ctx.store.snapshot();
    let series = ctx.series.values(&point.device_id, &point.key);
    // Shedding can be toggled by config hot-reload without a restart.
    let shed_enabled = crate::config::overrides()
        .shed_low_priority
        .unwrap_or(ctx.config.shed_low_priority);
    let shed = shed_enabled
        && ctx.metrics.rule_queue_length.load(Ordering::Relaxed) > ctx.config.shed_watermark;

    for rule in &snapshot.ordered {
        if !rule.enabled {
            continue;
        }
        if shed && rule.priority < ctx.config.shed_priority_floor {
            ctx.metrics.rules_shed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if let Some(expected) = rule.data_type {
            if expected != point.data_type() {
                continue;
            }
        }
        evaluate_rule(ctx, rule, &point, series.as_deref()).await;
    }

    // Record into the expression history after the pass, so `last_values`
    // never includes the point being evaluated.
    if let Some(v) = point.value.as_f64() {
        ctx.series.record(&point.device_id, &point.key, v);
    }
    ctx.metrics.point_latency.record(started.elapsed());
}

async fn evaluate_rule(ctx: &WorkerCtx, rule: &Arc<Rule>, point: &DataPoint, series: Option<&[f64]>) {
    ctx.metrics.rules_evaluated.fetch_add(1, Ordering::Relaxed);
    let exec_started = Instant::now();

    let matched = match evaluate_condition(
        &rule.conditions,
        point,
        series,
        &ctx.regexes,
        &ctx.exprs,
    ) {
        Ok(m) => m,
        Err(e) => {
            // Per-point skip of this rule; the point is not dropped and
            // later rules still run.
            ctx.metrics.condition_errors.fetch_add(1, Ordering::Relaxed);
            ctx.metrics.record_error("condition", "warning");
            debug!(rule = %rule.id, error = %e, "Condition error");
            return;
        }
    };
    if !matched {
        return;
    }

    ctx.metrics.rules_matched.fetch_add(1, Ordering::Relaxed);
    ctx.registry.run_pipeline(rule, point).await;
    ctx.metrics.rule_exec_time.record(exec_started.elapsed());
}

fn decode_point(payload: &[u8]) -> Result<DataPoint, String> {
    let point: DataPoint = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
    if point.key.is_empty() {
        return Err("empty key".to_string());
    }
    if point.device_id.is_empty() {
        return Err("empty device_id".to_string());
    }
    point.value.validate().map_err(|e| e.to_string())?;
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn decode_rejects_malformed() {
        assert!(decode_point(b"{not json").is_err());
        assert!(decode_point(br#"{"key":"","device_id":"d","timestamp":"2026-01-01T00:00:00Z","type":"int","value":1}"#).is_err());
        assert!(decode_point(
            br#"{"key":"k","device_id":"d","timestamp":"2026-01-01T00:00:00Z","type":"location","value":{"latitude":95.0,"longitude":0.0}}"#
        )
        .is_err());
    }

    #[test]
    fn decode_accepts_wire_point() {
        let point = DataPoint::new("dev", "temp", Value::Float(21.5)).unwrap();
        let bytes = serde_json::to_vec(&point).unwrap();
        let back = decode_point(&bytes).unwrap();
        assert_eq!(back.key, "temp");
        assert_eq!(back.value, Value::Float(21.5));
    }
}
