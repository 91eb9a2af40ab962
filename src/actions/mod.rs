//! Action pipeline: uniform handler dispatch, timeouts, retries.
//!
//! Handlers form an open set registered by type string. For each matching
//! rule the pipeline runs the declared actions in order; `async` actions are
//! handed to a detached task and do not block the next action. Every action
//! observes its own timeout and retry policy, and reports an
//! [`ActionOutcome`] - a failing action never aborts the rest of the list.

pub mod aggregate;
pub mod alert;
pub mod filter;
pub mod forward;
pub mod transform;

pub use aggregate::AggregateAction;
pub use alert::AlertAction;
pub use filter::FilterAction;
pub use forward::ForwardAction;
pub use transform::TransformAction;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BatchPublisher, BusClient};
use crate::metrics::GatewayMetrics;
use crate::notify::NotifierRegistry;
use crate::rules::expr::ExprCache;
use crate::rules::RegexCache;
use crate::types::{ActionSpec, DataPoint, Rule};

/// Result of one action execution. `throttled` is a normal outcome, not a
/// failure.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub throttled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn ok_with(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn throttled() -> Self {
        Self {
            success: true,
            throttled: true,
            output: Some(serde_json::json!({"throttled": true})),
            ..Self::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Uniform action interface. Implementations are stateless per call; keyed
/// state (throttle windows, aggregation windows, filter state) lives inside
/// the handler behind sharded maps.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn execute(&self, point: &DataPoint, rule: &Rule, spec: &ActionSpec) -> ActionOutcome;

    /// Hook for handlers with background work (sweepers, timers).
    fn start_background(&self, _cancel: CancellationToken) {}
}

/// Everything handlers need from the rest of the gateway.
pub struct ActionEnv {
    pub bus: BusClient,
    pub publisher: BatchPublisher,
    pub metrics: Arc<GatewayMetrics>,
    pub notifier: Arc<NotifierRegistry>,
    pub exprs: Arc<ExprCache>,
    pub regexes: Arc<RegexCache>,
}

/// Registry keyed by action type string.
pub struct ActionRegistry {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
    metrics: Arc<GatewayMetrics>,
}

impl ActionRegistry {
    /// Build the standard handler set (alert, transform, filter, aggregate,
    /// forward).
    pub fn standard(env: &ActionEnv) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            metrics: Arc::clone(&env.metrics),
        };
        registry.register(Arc::new(AlertAction::new(env)));
        registry.register(Arc::new(TransformAction::new(env)));
        registry.register(Arc::new(FilterAction::new(env)));
        registry.register(Arc::new(AggregateAction::new(env)));
        registry.register(Arc::new(ForwardAction::new(env)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(kind).map(Arc::clone)
    }

    /// Start background work on every handler.
    pub fn start_background(&self, cancel: &CancellationToken) {
        for handler in self.handlers.values() {
            handler.start_background(cancel.clone());
        }
    }

    /// Run a rule's actions against one point. Returns the synchronous
    /// outcomes in declaration order (async actions report through metrics
    /// only).
    pub async fn run_pipeline(&self, rule: &Arc<Rule>, point: &DataPoint) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(rule.actions.len());
        for (idx, spec) in rule.actions.iter().enumerate() {
            let Some(handler) = self.get(&spec.action_type) else {
                // Validation keeps this from happening for loaded rules.
                self.metrics.actions_failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error("action", "error");
                outcomes.push(ActionOutcome::fail(format!(
                    "no handler for '{}'",
                    spec.action_type
                )));
                continue;
            };

            if spec.run_async {
                let handler = Arc::clone(&handler);
                let rule = Arc::clone(rule);
                let point = point.clone();
                let spec = spec.clone();
                let metrics = Arc::clone(&self.metrics);
                tokio::spawn(async move {
                    let outcome =
                        execute_with_retry(handler.as_ref(), &point, &rule, &spec, &metrics).await;
                    record_outcome(&metrics, &rule.id, idx, &outcome);
                });
                continue;
            }

            let outcome = execute_with_retry(handler.as_ref(), point, rule, spec, &self.metrics).await;
            record_outcome(&self.metrics, &rule.id, idx, &outcome);
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn record_outcome(metrics: &GatewayMetrics, rule_id: &str, idx: usize, outcome: &ActionOutcome) {
    if outcome.success {
        metrics.actions_succeeded.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.actions_failed.fetch_add(1, Ordering::Relaxed);
        metrics.record_error("action", "error");
        warn!(
            rule = rule_id,
            action = idx,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Action failed"
        );
    }
}

/// One action with its timeout and capped-exponential retry policy.
async fn execute_with_retry(
    handler: &dyn ActionHandler,
    point: &DataPoint,
    rule: &Rule,
    spec: &ActionSpec,
    metrics: &GatewayMetrics,
) -> ActionOutcome {
    let attempts = spec.retry.max_attempts.max(1);
    let mut backoff = Duration::from_millis(spec.retry.backoff_ms.max(1));
    let cap = Duration::from_millis(spec.retry.backoff_cap_ms.max(1));

    let mut last = ActionOutcome::fail("not executed");
    for attempt in 1..=attempts {
        if attempt > 1 {
            metrics.action_retries.fetch_add(1, Ordering::Relaxed);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
            tokio::time::sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(cap);
        }

        let outcome = match tokio::time::timeout(
            spec.timeout(),
            handler.execute(point, rule, spec),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_elapsed) => ActionOutcome::fail(format!(
                "timeout after {} ms",
                spec.timeout_ms
            )),
        };

        if outcome.success {
            return outcome;
        }
        debug!(
            rule = %rule.id,
            kind = handler.kind(),
            attempt,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Action attempt failed"
        );
        last = outcome;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RetryPolicy, Value};
    use std::sync::atomic::AtomicU64;

    struct FlakyAction {
        calls: AtomicU64,
        succeed_on: u64,
    }

    #[async_trait]
    impl ActionHandler for FlakyAction {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn execute(
            &self,
            _point: &DataPoint,
            _rule: &Rule,
            _spec: &ActionSpec,
        ) -> ActionOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                ActionOutcome::ok()
            } else {
                ActionOutcome::fail("not yet")
            }
        }
    }

    struct SlowAction;

    #[async_trait]
    impl ActionHandler for SlowAction {
        fn kind(&self) -> &'static str {
            "slow"
        }

        async fn execute(
            &self,
            _point: &DataPoint,
            _rule: &Rule,
            _spec: &ActionSpec,
        ) -> ActionOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ActionOutcome::ok()
        }
    }

    fn rule_with(spec: ActionSpec) -> Rule {
        Rule {
            id: "r".to_string(),
            name: "r".to_string(),
            description: String::new(),
            enabled: true,
            priority: 50,
            version: 1,
            data_type: None,
            conditions: crate::types::Condition::Simple {
                field: "value".to_string(),
                operator: crate::types::Operator::Exists,
                value: serde_json::Value::Null,
            },
            actions: vec![spec],
            tags: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn point() -> DataPoint {
        DataPoint::new("dev", "k", Value::Float(1.0)).unwrap()
    }

    #[tokio::test]
    async fn retry_until_success() {
        let handler = FlakyAction {
            calls: AtomicU64::new(0),
            succeed_on: 3,
        };
        let spec = ActionSpec {
            action_type: "flaky".to_string(),
            config: serde_json::Value::Null,
            run_async: false,
            timeout_ms: 1_000,
            retry: RetryPolicy {
                max_attempts: 5,
                backoff_ms: 1,
                backoff_cap_ms: 4,
            },
        };
        let rule = rule_with(spec.clone());
        let metrics = GatewayMetrics::new();
        let outcome = execute_with_retry(&handler, &point(), &rule, &spec, &metrics).await;
        assert!(outcome.success);
        assert_eq!(metrics.action_retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let handler = FlakyAction {
            calls: AtomicU64::new(0),
            succeed_on: 100,
        };
        let spec = ActionSpec {
            action_type: "flaky".to_string(),
            config: serde_json::Value::Null,
            run_async: false,
            timeout_ms: 1_000,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_ms: 1,
                backoff_cap_ms: 2,
            },
        };
        let rule = rule_with(spec.clone());
        let metrics = GatewayMetrics::new();
        let outcome = execute_with_retry(&handler, &point(), &rule, &spec, &metrics).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("not yet"));
    }

    #[tokio::test]
    async fn timeout_is_a_typed_failure() {
        let spec = ActionSpec {
            action_type: "slow".to_string(),
            config: serde_json::Value::Null,
            run_async: false,
            timeout_ms: 20,
            retry: RetryPolicy::default(),
        };
        let rule = rule_with(spec.clone());
        let metrics = GatewayMetrics::new();
        let outcome = execute_with_retry(&SlowAction, &point(), &rule, &spec, &metrics).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("timeout"));
    }
}
