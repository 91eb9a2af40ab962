//! Incremental aggregation: accumulators, windows and the keyed store.
//!
//! Shared utility used by the aggregate action. One [`WindowStore`] holds
//! window state per (rule, group-by tuple) in a sharded map; entry access
//! serialises updates per key, which is the per-key ordering guarantee the
//! concurrency model promises for grouped aggregation. A periodic sweep
//! closes elapsed windows and evicts state idle past its TTL.

pub mod accumulator;
pub mod histogram;
pub mod window;

pub use accumulator::{AggregateFunction, Accumulator, Thresholds, DEFAULT_OUTLIER_SIGMA};
pub use histogram::StreamingHistogram;
pub use window::{WindowEmit, WindowError, WindowKind, WindowSpec, WindowState};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

struct Entry {
    state: WindowState,
    spec: WindowSpec,
    last_update: DateTime<Utc>,
}

/// Keyed window state, sharded by group key.
#[derive(Default)]
pub struct WindowStore {
    entries: DashMap<String, Entry>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feed one sample into the window for `key`, creating state on first
    /// sight. Returns summaries that became due. The dashmap entry guard
    /// makes each key single-writer.
    pub fn update(
        &self,
        key: &str,
        spec: &WindowSpec,
        thresholds: &Thresholds,
        ts: DateTime<Utc>,
        value: Option<f64>,
    ) -> Vec<WindowEmit> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            state: WindowState::new(spec.clone(), thresholds.clone()),
            spec: spec.clone(),
            last_update: ts,
        });
        entry.last_update = ts.max(entry.last_update);
        entry.state.update(ts, value)
    }

    /// Time-driven pass: close elapsed windows, evict idle state. Returns
    /// `(key, emission)` pairs.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<(String, WindowEmit)> {
        let mut due = Vec::new();
        let mut evict = Vec::new();

        for mut entry in self.entries.iter_mut() {
            for emit in entry.state.sweep(now) {
                due.push((entry.key().clone(), emit));
            }
            let ttl = chrono::Duration::milliseconds(
                i64::try_from(entry.spec.ttl().as_millis()).unwrap_or(i64::MAX),
            );
            // TTL with no writes drops the state, buffered or not.
            if now - entry.last_update > ttl {
                if !entry.state.is_idle() {
                    debug!(key = %entry.key(), "Evicting window with undelivered partial state");
                }
                evict.push(entry.key().clone());
            }
        }

        for key in evict {
            self.entries.remove(&key);
            debug!(key, "Aggregation state evicted");
        }
        due
    }
}
