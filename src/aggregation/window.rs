//! Window state machines: tumbling, sliding and session.
//!
//! A window consumes timestamped samples and decides when a summary is due.
//! Tumbling windows close on size (duration or point count), sliding windows
//! emit every `step` covering the trailing `size` (implemented as a pane
//! ring of mergeable accumulators), session windows close after an activity
//! gap. All time decisions take explicit timestamps so the state machines
//! are fully testable without a wall clock.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::accumulator::{Accumulator, Thresholds};

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("Window needs either size_secs or size_count")]
    MissingSize,

    #[error("Sliding window needs step_secs")]
    MissingStep,

    #[error("Window size must be positive")]
    ZeroSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Sliding,
    Tumbling,
    Session,
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowKind::Sliding => write!(f, "sliding"),
            WindowKind::Tumbling => write!(f, "tumbling"),
            WindowKind::Session => write!(f, "session"),
        }
    }
}

/// Window configuration as written in the rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSpec {
    pub kind: WindowKind,
    /// Duration-based size, seconds
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "size")]
    pub size_secs: Option<f64>,
    /// Count-based size (tumbling only); takes precedence over duration
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "count")]
    pub size_count: Option<u64>,
    /// Sliding emission period, seconds
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "step")]
    pub step_secs: Option<f64>,
    /// Session gap / idle-state eviction horizon, seconds
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ttl")]
    pub ttl_secs: Option<f64>,
}

impl WindowSpec {
    pub fn size(&self) -> Duration {
        Duration::from_secs_f64(self.size_secs.unwrap_or(60.0).max(0.001))
    }

    pub fn step(&self) -> Duration {
        Duration::from_secs_f64(
            self.step_secs
                .unwrap_or_else(|| self.size_secs.unwrap_or(60.0))
                .max(0.001),
        )
    }

    /// Idle horizon after which state is evicted (and sessions close).
    pub fn ttl(&self) -> Duration {
        match self.ttl_secs {
            Some(t) => Duration::from_secs_f64(t.max(0.001)),
            None => self.size() * 2,
        }
    }

    pub fn validate(&self) -> Result<(), WindowError> {
        if self.size_secs.is_none() && self.size_count.is_none() {
            return Err(WindowError::MissingSize);
        }
        if let Some(s) = self.size_secs {
            if s <= 0.0 {
                return Err(WindowError::ZeroSize);
            }
        }
        if self.size_count == Some(0) {
            return Err(WindowError::ZeroSize);
        }
        if self.kind == WindowKind::Sliding && self.step_secs.is_none() {
            return Err(WindowError::MissingStep);
        }
        Ok(())
    }
}

/// One emitted summary: the accumulator covering [start, end).
#[derive(Debug)]
pub struct WindowEmit {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub acc: Accumulator,
}

// ============================================================================
// State machines
// ============================================================================

#[derive(Debug)]
struct Pane {
    start: DateTime<Utc>,
    acc: Accumulator,
}

#[derive(Debug)]
pub enum WindowState {
    Tumbling {
        spec: WindowSpec,
        thresholds: Thresholds,
        start: Option<DateTime<Utc>>,
        acc: Accumulator,
    },
    Sliding {
        spec: WindowSpec,
        thresholds: Thresholds,
        panes: VecDeque<Pane>,
        /// Next step boundary due to emit
        next_emit: Option<DateTime<Utc>>,
    },
    Session {
        spec: WindowSpec,
        thresholds: Thresholds,
        first: Option<DateTime<Utc>>,
        last_activity: Option<DateTime<Utc>>,
        acc: Accumulator,
    },
}

impl WindowState {
    pub fn new(spec: WindowSpec, thresholds: Thresholds) -> Self {
        match spec.kind {
            WindowKind::Tumbling => WindowState::Tumbling {
                acc: Accumulator::new(thresholds.clone()),
                thresholds,
                start: None,
                spec,
            },
            WindowKind::Sliding => WindowState::Sliding {
                thresholds,
                panes: VecDeque::new(),
                next_emit: None,
                spec,
            },
            WindowKind::Session => WindowState::Session {
                acc: Accumulator::new(thresholds.clone()),
                thresholds,
                first: None,
                last_activity: None,
                spec,
            },
        }
    }

    /// Feed one sample. `value` is `None` for points without a numeric
    /// representation (they count toward the null rate only). Returns any
    /// summaries that became due.
    pub fn update(&mut self, ts: DateTime<Utc>, value: Option<f64>) -> Vec<WindowEmit> {
        match self {
            WindowState::Tumbling {
                spec,
                thresholds,
                start,
                acc,
            } => {
                let mut emits = Vec::new();

                // Count-based close: emit once the Nth point lands.
                if let Some(target) = spec.size_count {
                    apply(acc, ts, value);
                    if start.is_none() {
                        *start = Some(ts);
                    }
                    if acc.count() >= target {
                        let done = std::mem::replace(acc, Accumulator::new(thresholds.clone()));
                        emits.push(WindowEmit {
                            start: start.take().unwrap_or(ts),
                            end: ts,
                            acc: done,
                        });
                    }
                    return emits;
                }

                // Duration-based: close the open window first if this point
                // falls past its end.
                let size = chrono_dur(spec.size());
                if let Some(s) = *start {
                    if ts >= s + size {
                        let done = std::mem::replace(acc, Accumulator::new(thresholds.clone()));
                        if !done.is_empty() {
                            emits.push(WindowEmit {
                                start: s,
                                end: s + size,
                                acc: done,
                            });
                        }
                        // Align the new window so ts falls inside it.
                        let elapsed = ts - s;
                        let periods = elapsed.num_milliseconds() / size.num_milliseconds().max(1);
                        *start = Some(s + size * i32::try_from(periods).unwrap_or(i32::MAX));
                    }
                } else {
                    *start = Some(ts);
                }
                apply(acc, ts, value);
                emits
            }

            WindowState::Sliding {
                spec,
                thresholds,
                panes,
                next_emit,
            } => {
                let step = chrono_dur(spec.step());
                let size = chrono_dur(spec.size());
                let pane_start = align(ts, step);

                let mut emits = Vec::new();
                if next_emit.is_none() {
                    *next_emit = Some(pane_start + step);
                }
                // Emit for every step boundary this sample has crossed.
                while let Some(due) = *next_emit {
                    if ts < due {
                        break;
                    }
                    if let Some(emit) = merge_panes(panes, thresholds, due, size) {
                        emits.push(emit);
                    }
                    *next_emit = Some(due + step);
                }

                // Insert into the pane for this timestamp.
                match panes.back_mut() {
                    Some(last) if last.start == pane_start => apply(&mut last.acc, ts, value),
                    _ => {
                        let mut acc = Accumulator::new(thresholds.clone());
                        apply(&mut acc, ts, value);
                        panes.push_back(Pane {
                            start: pane_start,
                            acc,
                        });
                    }
                }
                // Drop panes fully outside any future window.
                let horizon = pane_start - size;
                while panes.front().is_some_and(|p| p.start + step <= horizon) {
                    panes.pop_front();
                }
                emits
            }

            WindowState::Session {
                spec,
                thresholds,
                first,
                last_activity,
                acc,
            } => {
                let gap = chrono_dur(spec.ttl());
                let mut emits = Vec::new();
                if let Some(last) = *last_activity {
                    if ts - last > gap && !acc.is_empty() {
                        let done = std::mem::replace(acc, Accumulator::new(thresholds.clone()));
                        emits.push(WindowEmit {
                            start: first.take().unwrap_or(last),
                            end: last,
                            acc: done,
                        });
                    }
                }
                if first.is_none() {
                    *first = Some(ts);
                }
                *last_activity = Some((*last_activity).map_or(ts, |l| l.max(ts)));
                apply(acc, ts, value);
                emits
            }
        }
    }

    /// Time-driven pass: close windows that elapsed with no new samples.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<WindowEmit> {
        match self {
            WindowState::Tumbling {
                spec,
                thresholds,
                start,
                acc,
            } => {
                if spec.size_count.is_some() {
                    return Vec::new(); // count windows close on arrival only
                }
                let size = chrono_dur(spec.size());
                match *start {
                    Some(s) if now >= s + size && !acc.is_empty() => {
                        let done = std::mem::replace(acc, Accumulator::new(thresholds.clone()));
                        *start = None;
                        vec![WindowEmit {
                            start: s,
                            end: s + size,
                            acc: done,
                        }]
                    }
                    _ => Vec::new(),
                }
            }

            WindowState::Sliding {
                spec,
                thresholds,
                panes,
                next_emit,
            } => {
                let step = chrono_dur(spec.step());
                let size = chrono_dur(spec.size());
                let mut emits = Vec::new();
                while let Some(due) = *next_emit {
                    if now < due {
                        break;
                    }
                    if let Some(emit) = merge_panes(panes, thresholds, due, size) {
                        emits.push(emit);
                    }
                    *next_emit = if panes.is_empty() {
                        None // nothing pending; re-arm on next sample
                    } else {
                        Some(due + step)
                    };
                }
                emits
            }

            WindowState::Session {
                spec,
                thresholds,
                first,
                last_activity,
                acc,
            } => {
                let gap = chrono_dur(spec.ttl());
                match *last_activity {
                    Some(last) if now - last > gap && !acc.is_empty() => {
                        let done = std::mem::replace(acc, Accumulator::new(thresholds.clone()));
                        let start = first.take().unwrap_or(last);
                        *last_activity = None;
                        vec![WindowEmit {
                            start,
                            end: last,
                            acc: done,
                        }]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    /// True when there is no buffered state left (safe to evict).
    pub fn is_idle(&self) -> bool {
        match self {
            WindowState::Tumbling { acc, .. } => acc.is_empty(),
            WindowState::Sliding { panes, .. } => panes.iter().all(|p| p.acc.is_empty()),
            WindowState::Session { acc, .. } => acc.is_empty(),
        }
    }
}

fn apply(acc: &mut Accumulator, ts: DateTime<Utc>, value: Option<f64>) {
    match value {
        Some(v) => acc.update(ts, v),
        None => acc.record_null(),
    }
}

/// Merge the panes overlapping [due - size, due) into one emission.
fn merge_panes(
    panes: &mut VecDeque<Pane>,
    thresholds: &Thresholds,
    due: DateTime<Utc>,
    size: chrono::Duration,
) -> Option<WindowEmit> {
    let window_start = due - size;
    let mut merged = Accumulator::new(thresholds.clone());
    for pane in panes.iter() {
        if pane.start >= window_start && pane.start < due {
            merged.merge(&pane.acc);
        }
    }
    // Retire panes that can never appear in a later window.
    while panes.front().is_some_and(|p| p.start < window_start) {
        panes.pop_front();
    }
    if merged.is_empty() {
        None
    } else {
        Some(WindowEmit {
            start: window_start,
            end: due,
            acc: merged,
        })
    }
}

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Floor `ts` to a multiple of `step` (epoch-aligned).
fn align(ts: DateTime<Utc>, step: chrono::Duration) -> DateTime<Utc> {
    let step_ms = step.num_milliseconds().max(1);
    let ms = ts.timestamp_millis();
    let aligned = ms - ms.rem_euclid(step_ms);
    DateTime::from_timestamp_millis(aligned).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::accumulator::AggregateFunction;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn spec(kind: WindowKind) -> WindowSpec {
        WindowSpec {
            kind,
            size_secs: Some(10.0),
            size_count: None,
            step_secs: Some(5.0),
            ttl_secs: Some(3.0),
        }
    }

    #[test]
    fn count_tumbling_emits_exactly_once_per_n_points() {
        let mut state = WindowState::new(
            WindowSpec {
                kind: WindowKind::Tumbling,
                size_secs: None,
                size_count: Some(5),
                step_secs: None,
                ttl_secs: None,
            },
            Thresholds::default(),
        );
        let mut emitted = Vec::new();
        for (i, v) in [10.0, 20.0, 30.0, 40.0, 50.0].iter().enumerate() {
            emitted.extend(state.update(ts(i as i64), Some(*v)));
        }
        assert_eq!(emitted.len(), 1);
        let acc = &emitted[0].acc;
        let w = Duration::from_secs(5);
        assert_eq!(acc.value_of(AggregateFunction::Count, w), 5.0);
        assert!((acc.value_of(AggregateFunction::Avg, w) - 30.0).abs() < 1e-9);
        assert_eq!(acc.value_of(AggregateFunction::Min, w), 10.0);
        assert_eq!(acc.value_of(AggregateFunction::Max, w), 50.0);
        // A second batch emits exactly one more.
        let mut again = Vec::new();
        for i in 0..5 {
            again.extend(state.update(ts(10 + i), Some(1.0)));
        }
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn duration_tumbling_closes_on_next_window_point() {
        let mut state = WindowState::new(spec(WindowKind::Tumbling), Thresholds::default());
        assert!(state.update(ts(0), Some(1.0)).is_empty());
        assert!(state.update(ts(5), Some(2.0)).is_empty());
        // t=12 is past the 10 s window: the first window closes.
        let emits = state.update(ts(12), Some(3.0));
        assert_eq!(emits.len(), 1);
        assert_eq!(
            emits[0].acc.value_of(AggregateFunction::Count, Duration::from_secs(10)),
            2.0
        );
        assert_eq!(emits[0].start, ts(0));
        assert_eq!(emits[0].end, ts(10));
    }

    #[test]
    fn duration_tumbling_closes_on_sweep() {
        let mut state = WindowState::new(spec(WindowKind::Tumbling), Thresholds::default());
        state.update(ts(0), Some(1.0));
        assert!(state.sweep(ts(9)).is_empty());
        let emits = state.sweep(ts(11));
        assert_eq!(emits.len(), 1);
        // No double emission.
        assert!(state.sweep(ts(20)).is_empty());
    }

    #[test]
    fn sliding_emits_on_step_boundaries() {
        let mut state = WindowState::new(spec(WindowKind::Sliding), Thresholds::default());
        // Aligned timestamps: epoch base is a multiple of 5.
        for i in 0..5 {
            state.update(ts(i), Some(f64::from(i as i32)));
        }
        // Crossing the 5 s boundary emits a window covering [t-10, t).
        let emits = state.update(ts(6), Some(10.0));
        assert_eq!(emits.len(), 1);
        assert_eq!(
            emits[0].acc.value_of(AggregateFunction::Count, Duration::from_secs(10)),
            5.0
        );
        // Next boundary via sweep.
        let emits = state.sweep(ts(10));
        assert_eq!(emits.len(), 1);
        // That window holds all six samples (10 s covers both panes).
        assert_eq!(
            emits[0].acc.value_of(AggregateFunction::Count, Duration::from_secs(10)),
            6.0
        );
    }

    #[test]
    fn session_closes_after_gap() {
        let mut state = WindowState::new(spec(WindowKind::Session), Thresholds::default());
        state.update(ts(0), Some(1.0));
        state.update(ts(1), Some(2.0));
        state.update(ts(2), Some(3.0));
        // Gap of 3 s configured; next point 10 s later closes the session.
        let emits = state.update(ts(12), Some(9.0));
        assert_eq!(emits.len(), 1);
        assert_eq!(
            emits[0].acc.value_of(AggregateFunction::Count, Duration::from_secs(2)),
            3.0
        );
        // Sweep closes the dangling session too.
        let emits = state.sweep(ts(30));
        assert_eq!(emits.len(), 1);
        assert_eq!(
            emits[0].acc.value_of(AggregateFunction::Count, Duration::from_secs(1)),
            1.0
        );
    }

    #[test]
    fn spec_validation() {
        assert!(spec(WindowKind::Sliding).validate().is_ok());
        let bad = WindowSpec {
            kind: WindowKind::Sliding,
            size_secs: Some(10.0),
            size_count: None,
            step_secs: None,
            ttl_secs: None,
        };
        assert!(matches!(bad.validate(), Err(WindowError::MissingStep)));
        let no_size = WindowSpec {
            kind: WindowKind::Tumbling,
            size_secs: None,
            size_count: None,
            step_secs: None,
            ttl_secs: None,
        };
        assert!(matches!(no_size.validate(), Err(WindowError::MissingSize)));
    }
}
