//! Forward action: re-publish a point to named subjects.
//!
//! Optionally rewrites key/device/tags before publishing, or substitutes a
//! templated text payload for the point JSON.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::bus::BatchPublisher;
use crate::metrics::GatewayMetrics;
use crate::types::{ActionSpec, DataPoint, Rule};

use super::alert::render_template;
use super::{ActionEnv, ActionHandler, ActionOutcome};

#[derive(Debug, Deserialize)]
struct ForwardConfig {
    subjects: Vec<String>,
    #[serde(default)]
    new_key: Option<String>,
    #[serde(default)]
    new_device_id: Option<String>,
    #[serde(default)]
    add_tags: BTreeMap<String, String>,
    /// When set, the rendered template text is the payload instead of the
    /// point JSON
    #[serde(default)]
    template: Option<String>,
}

pub struct ForwardAction {
    publisher: BatchPublisher,
    metrics: Arc<GatewayMetrics>,
}

impl ForwardAction {
    pub fn new(env: &ActionEnv) -> Self {
        Self {
            publisher: env.publisher.clone(),
            metrics: Arc::clone(&env.metrics),
        }
    }
}

#[async_trait]
impl ActionHandler for ForwardAction {
    fn kind(&self) -> &'static str {
        "forward"
    }

    async fn execute(&self, point: &DataPoint, rule: &Rule, spec: &ActionSpec) -> ActionOutcome {
        let config: ForwardConfig = match serde_json::from_value(spec.config.clone()) {
            Ok(c) => c,
            Err(e) => return ActionOutcome::fail(format!("forward config: {e}")),
        };
        if config.subjects.is_empty() {
            return ActionOutcome::fail("forward: no subjects configured");
        }

        let mut out = point.clone();
        out.tags = point.tags.deep_clone();
        if let Some(key) = &config.new_key {
            out.key = key.clone();
        }
        if let Some(device) = &config.new_device_id {
            out.device_id = device.clone();
        }
        for (tag, value) in &config.add_tags {
            out.tags.insert(tag.clone(), value.clone());
        }

        let payload = match &config.template {
            Some(template) => render_template(template, &out, rule).into_bytes(),
            None => match serde_json::to_vec(&out) {
                Ok(p) => p,
                Err(e) => return ActionOutcome::fail(format!("forward encode: {e}")),
            },
        };

        for subject in &config.subjects {
            if let Err(e) = self.publisher.publish_async(subject, &payload).await {
                return ActionOutcome::fail(format!("forward to {subject}: {e}"));
            }
        }
        self.metrics
            .forwards_emitted
            .fetch_add(config.subjects.len() as u64, Ordering::Relaxed);

        ActionOutcome::ok_with(serde_json::json!({ "subjects": config.subjects }))
    }
}
