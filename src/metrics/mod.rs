//! Process-wide metrics collector.
//!
//! One [`GatewayMetrics`] instance is owned by the runtime and handed to
//! every service by `Arc`. Hot counters are plain atomics (lock-free
//! writes); composite state takes a short write lock. Reads go through a
//! 3-second snapshot cache so frequent exports do not touch the hot path;
//! a 5-second ticker refreshes system samples, computes real-time rates
//! from counter deltas and aggregates per-plug-in counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{BusStats, BusStatsSnapshot};
use crate::types::{AdapterMetrics, SinkMetrics};

/// Ticker period for system samples and rate computation.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot cache lifetime.
pub const SNAPSHOT_CACHE: Duration = Duration::from_secs(3);

// ============================================================================
// Latency recording
// ============================================================================

/// Lock-free latency recorder: count/sum/min/max plus a log2-bucketed
/// histogram (in microseconds) for quantile reads.
#[derive(Debug)]
pub struct LatencyRecorder {
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; 64],
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl LatencyRecorder {
    pub fn record(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
        let bucket = (64 - us.max(1).leading_zeros() as usize).min(63);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Bucket-resolution quantile (upper bound of the bucket containing q).
    fn quantile_us(&self, q: f64) -> u64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * q).ceil() as u64;
        let mut seen = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return 1u64 << i;
            }
        }
        self.max_us.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_us.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            min_us: if count == 0 {
                0
            } else {
                self.min_us.load(Ordering::Relaxed)
            },
            avg_us: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
            max_us: self.max_us.load(Ordering::Relaxed),
            p50_us: self.quantile_us(0.50),
            p95_us: self.quantile_us(0.95),
            p99_us: self.quantile_us(0.99),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub min_us: u64,
    pub avg_us: f64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

// ============================================================================
// Gauges (f64 stored as atomic bits, written only by the ticker)
// ============================================================================

#[derive(Debug, Default)]
struct GaugeF64(AtomicU64);

impl GaugeF64 {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

// ============================================================================
// GatewayMetrics
// ============================================================================

/// All process-wide counters and gauges.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // --- data plane ---
    pub points_total: AtomicU64,
    pub points_dropped: AtomicU64,
    pub malformed_payloads: AtomicU64,
    pub bytes_total: AtomicU64,
    pub point_latency: LatencyRecorder,

    // --- rule engine ---
    pub rules_evaluated: AtomicU64,
    pub rules_matched: AtomicU64,
    pub actions_succeeded: AtomicU64,
    pub actions_failed: AtomicU64,
    pub action_retries: AtomicU64,
    pub condition_errors: AtomicU64,
    pub rules_shed: AtomicU64,
    pub rule_queue_length: AtomicU64,
    pub rule_exec_time: LatencyRecorder,

    // --- actions ---
    pub alerts_emitted: AtomicU64,
    pub alerts_throttled: AtomicU64,
    pub alerts_resolved: AtomicU64,
    pub transforms_emitted: AtomicU64,
    pub filters_passed: AtomicU64,
    pub filters_suppressed: AtomicU64,
    pub aggregates_emitted: AtomicU64,
    pub forwards_emitted: AtomicU64,
    pub notifications_failed: AtomicU64,

    // --- router ---
    pub router_delivered: AtomicU64,
    pub router_failures: AtomicU64,

    // --- errors ---
    pub errors_total: AtomicU64,
    errors_by_type: DashMap<&'static str, u64>,
    errors_by_level: DashMap<&'static str, u64>,

    // --- gateway / plug-ins (written by the ticker) ---
    pub bus_connected: AtomicBool,
    pub adapters_running: AtomicU64,
    pub sinks_running: AtomicU64,
    pub plugins_errored: AtomicU64,

    // --- rates (written by the ticker) ---
    points_per_second: GaugeF64,
    bytes_per_second: GaugeF64,
    errors_per_second: GaugeF64,

    // --- system sample (written by the ticker) ---
    memory_rss_bytes: AtomicU64,
    cpu_percent: GaugeF64,

    // --- internals ---
    started: RwLock<Option<Instant>>,
    tick_state: RwLock<TickState>,
    snapshot_cache: RwLock<Option<(Instant, Arc<MetricsSnapshot>)>>,
    adapter_totals: RwLock<Vec<AdapterMetrics>>,
    sink_totals: RwLock<Vec<SinkMetrics>>,
}

#[derive(Debug, Default)]
struct TickState {
    last_tick: Option<Instant>,
    last_points: u64,
    last_bytes: u64,
    last_errors: u64,
    last_cpu_ticks: u64,
}

impl GatewayMetrics {
    pub fn new() -> Arc<Self> {
        let metrics = Arc::new(Self::default());
        if let Ok(mut started) = metrics.started.write() {
            *started = Some(Instant::now());
        }
        metrics
    }

    /// Count an error by kind and severity.
    pub fn record_error(&self, kind: &'static str, level: &'static str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        *self.errors_by_type.entry(kind).or_insert(0) += 1;
        *self.errors_by_level.entry(level).or_insert(0) += 1;
    }

    pub fn uptime(&self) -> Duration {
        self.started
            .read()
            .ok()
            .and_then(|s| *s)
            .map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// Cached snapshot for export. Recomputed at most every 3 s.
    pub fn snapshot(&self, bus: Option<&BusStats>) -> Arc<MetricsSnapshot> {
        if let Ok(cache) = self.snapshot_cache.read() {
            if let Some((at, snap)) = cache.as_ref() {
                if at.elapsed() < SNAPSHOT_CACHE {
                    return Arc::clone(snap);
                }
            }
        }
        let snap = Arc::new(self.build_snapshot(bus));
        if let Ok(mut cache) = self.snapshot_cache.write() {
            *cache = Some((Instant::now(), Arc::clone(&snap)));
        }
        snap
    }

    fn build_snapshot(&self, bus: Option<&BusStats>) -> MetricsSnapshot {
        let errors_by_type = self
            .errors_by_type
            .iter()
            .map(|e| ((*e.key()).to_string(), *e.value()))
            .collect();
        let errors_by_level = self
            .errors_by_level
            .iter()
            .map(|e| ((*e.key()).to_string(), *e.value()))
            .collect();
        MetricsSnapshot {
            system: SystemSnapshot {
                uptime_secs: self.uptime().as_secs(),
                memory_rss_bytes: self.memory_rss_bytes.load(Ordering::Relaxed),
                cpu_percent: self.cpu_percent.get(),
            },
            gateway: GatewaySnapshot {
                bus_connected: self.bus_connected.load(Ordering::Relaxed),
                adapters_running: self.adapters_running.load(Ordering::Relaxed),
                sinks_running: self.sinks_running.load(Ordering::Relaxed),
                plugins_errored: self.plugins_errored.load(Ordering::Relaxed),
            },
            data: DataSnapshot {
                points_total: self.points_total.load(Ordering::Relaxed),
                points_dropped: self.points_dropped.load(Ordering::Relaxed),
                malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
                bytes_total: self.bytes_total.load(Ordering::Relaxed),
                points_per_second: self.points_per_second.get(),
                bytes_per_second: self.bytes_per_second.get(),
                latency: self.point_latency.snapshot(),
            },
            rules: RuleSnapshot {
                evaluated: self.rules_evaluated.load(Ordering::Relaxed),
                matched: self.rules_matched.load(Ordering::Relaxed),
                actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
                actions_failed: self.actions_failed.load(Ordering::Relaxed),
                action_retries: self.action_retries.load(Ordering::Relaxed),
                condition_errors: self.condition_errors.load(Ordering::Relaxed),
                shed: self.rules_shed.load(Ordering::Relaxed),
                queue_length: self.rule_queue_length.load(Ordering::Relaxed),
                exec_time: self.rule_exec_time.snapshot(),
            },
            actions: ActionSnapshot {
                alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
                alerts_throttled: self.alerts_throttled.load(Ordering::Relaxed),
                alerts_resolved: self.alerts_resolved.load(Ordering::Relaxed),
                transforms_emitted: self.transforms_emitted.load(Ordering::Relaxed),
                filters_passed: self.filters_passed.load(Ordering::Relaxed),
                filters_suppressed: self.filters_suppressed.load(Ordering::Relaxed),
                aggregates_emitted: self.aggregates_emitted.load(Ordering::Relaxed),
                forwards_emitted: self.forwards_emitted.load(Ordering::Relaxed),
                notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            },
            router: RouterSnapshot {
                delivered: self.router_delivered.load(Ordering::Relaxed),
                failures: self.router_failures.load(Ordering::Relaxed),
            },
            errors: ErrorSnapshot {
                total: self.errors_total.load(Ordering::Relaxed),
                per_second: self.errors_per_second.get(),
                by_type: errors_by_type,
                by_level: errors_by_level,
            },
            bus: bus.map(BusStats::snapshot).unwrap_or_default(),
            adapters: self.adapter_totals.read().map(|v| v.clone()).unwrap_or_default(),
            sinks: self.sink_totals.read().map(|v| v.clone()).unwrap_or_default(),
        }
    }

    /// One ticker pass: system sample, rate deltas, plug-in aggregation.
    pub fn tick(&self, sources: &MetricsSources) {
        let now = Instant::now();

        self.memory_rss_bytes
            .store(read_rss_bytes().unwrap_or(0), Ordering::Relaxed);

        let points = self.points_total.load(Ordering::Relaxed);
        let bytes = self.bytes_total.load(Ordering::Relaxed);
        let errors = self.errors_total.load(Ordering::Relaxed);
        let cpu_ticks = read_cpu_ticks().unwrap_or(0);

        if let Ok(mut state) = self.tick_state.write() {
            if let Some(last) = state.last_tick {
                let dt = now.duration_since(last).as_secs_f64().max(0.001);
                self.points_per_second
                    .set((points.saturating_sub(state.last_points)) as f64 / dt);
                self.bytes_per_second
                    .set((bytes.saturating_sub(state.last_bytes)) as f64 / dt);
                self.errors_per_second
                    .set((errors.saturating_sub(state.last_errors)) as f64 / dt);
                // CLK_TCK is 100 on every platform the gateway targets.
                let tick_delta = cpu_ticks.saturating_sub(state.last_cpu_ticks) as f64;
                self.cpu_percent.set(tick_delta / 100.0 / dt * 100.0);
            }
            state.last_tick = Some(now);
            state.last_points = points;
            state.last_bytes = bytes;
            state.last_errors = errors;
            state.last_cpu_ticks = cpu_ticks;
        }

        if let Some(plugins) = sources.plugins.as_ref() {
            let adapters = plugins.adapter_metrics();
            let sinks = plugins.sink_metrics();
            self.adapters_running
                .store(adapters.len() as u64, Ordering::Relaxed);
            self.sinks_running.store(sinks.len() as u64, Ordering::Relaxed);
            if let Ok(mut totals) = self.adapter_totals.write() {
                *totals = adapters;
            }
            if let Ok(mut totals) = self.sink_totals.write() {
                *totals = sinks;
            }
        }
    }
}

/// What the ticker polls each pass.
#[derive(Default)]
pub struct MetricsSources {
    pub plugins: Option<Arc<dyn InstanceMetricsSource>>,
}

/// Implemented by the plug-in registry: per-instance counters for running
/// adapters and sinks.
pub trait InstanceMetricsSource: Send + Sync {
    fn adapter_metrics(&self) -> Vec<AdapterMetrics>;
    fn sink_metrics(&self) -> Vec<SinkMetrics>;
}

/// Background ticker driving [`GatewayMetrics::tick`].
pub async fn run_updater(
    metrics: Arc<GatewayMetrics>,
    sources: MetricsSources,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(UPDATE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => metrics.tick(&sources),
        }
    }
    debug!("Metrics updater stopped");
}

// ============================================================================
// Snapshot shapes (serialisable for the external admin surface)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub system: SystemSnapshot,
    pub gateway: GatewaySnapshot,
    pub data: DataSnapshot,
    pub rules: RuleSnapshot,
    pub actions: ActionSnapshot,
    pub router: RouterSnapshot,
    pub errors: ErrorSnapshot,
    pub bus: BusStatsSnapshot,
    pub adapters: Vec<AdapterMetrics>,
    pub sinks: Vec<SinkMetrics>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemSnapshot {
    pub uptime_secs: u64,
    pub memory_rss_bytes: u64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewaySnapshot {
    pub bus_connected: bool,
    pub adapters_running: u64,
    pub sinks_running: u64,
    pub plugins_errored: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DataSnapshot {
    pub points_total: u64,
    pub points_dropped: u64,
    pub malformed_payloads: u64,
    pub bytes_total: u64,
    pub points_per_second: f64,
    pub bytes_per_second: f64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RuleSnapshot {
    pub evaluated: u64,
    pub matched: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub action_retries: u64,
    pub condition_errors: u64,
    pub shed: u64,
    pub queue_length: u64,
    pub exec_time: LatencySnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ActionSnapshot {
    pub alerts_emitted: u64,
    pub alerts_throttled: u64,
    pub alerts_resolved: u64,
    pub transforms_emitted: u64,
    pub filters_passed: u64,
    pub filters_suppressed: u64,
    pub aggregates_emitted: u64,
    pub forwards_emitted: u64,
    pub notifications_failed: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RouterSnapshot {
    pub delivered: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSnapshot {
    pub total: u64,
    pub per_second: f64,
    pub by_type: std::collections::BTreeMap<String, u64>,
    pub by_level: std::collections::BTreeMap<String, u64>,
}

// ============================================================================
// System sampling (Linux procfs; zero elsewhere)
// ============================================================================

#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_ascii_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 and 15 (utime, stime) follow the parenthesised command name.
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_ascii_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_snapshot_tracks_extremes() {
        let rec = LatencyRecorder::default();
        rec.record(Duration::from_micros(10));
        rec.record(Duration::from_micros(1_000));
        rec.record(Duration::from_micros(100));
        let snap = rec.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.min_us, 10);
        assert_eq!(snap.max_us, 1_000);
        assert!(snap.avg_us > 0.0);
        assert!(snap.p99_us >= snap.p50_us);
    }

    #[test]
    fn error_counters_accumulate() {
        let metrics = GatewayMetrics::new();
        metrics.record_error("condition", "warning");
        metrics.record_error("condition", "warning");
        metrics.record_error("bus", "error");
        let snap = metrics.snapshot(None);
        assert_eq!(snap.errors.total, 3);
        assert_eq!(snap.errors.by_type["condition"], 2);
        assert_eq!(snap.errors.by_level["error"], 1);
    }

    #[test]
    fn snapshot_is_cached() {
        let metrics = GatewayMetrics::new();
        let a = metrics.snapshot(None);
        metrics.points_total.fetch_add(100, Ordering::Relaxed);
        let b = metrics.snapshot(None);
        // Within the cache window both reads see the same snapshot.
        assert_eq!(a.data.points_total, b.data.points_total);
    }

    #[test]
    fn tick_computes_rates() {
        let metrics = GatewayMetrics::new();
        let sources = MetricsSources::default();
        metrics.tick(&sources);
        metrics.points_total.fetch_add(500, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        metrics.tick(&sources);
        let snap = metrics.build_snapshot(None);
        assert!(snap.data.points_per_second > 0.0);
    }
}
