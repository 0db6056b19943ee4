//! Health and performance supervision
//!
//! Tracks per-signal staleness against expected cycle times, rolls subsystem
//! error ratios up into an overall status, and samples process memory and
//! queue depth to auto-degrade resource usage under load. Degradation is
//! one-directional: the supervisor only ever escalates, and returning to
//! normal requires an explicit external reset.

use crate::catalog::Catalog;
use crate::types::Timestamp;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;

/// Staleness floor applied to every signal regardless of cycle time
const STALENESS_FLOOR: Duration = Duration::from_secs(5);

/// Interval assumed for signals whose message declares no cycle time
const DEFAULT_EXPECTED_INTERVAL: Duration = Duration::from_secs(1);

/// Rolling average memory above which the supervisor degrades, in bytes
pub const MEMORY_DEGRADE_THRESHOLD: u64 = 500 * 1024 * 1024;

/// Rolling average sample-queue depth above which the supervisor degrades;
/// sustained depth at this level means flushing is not keeping up
pub const QUEUE_DEGRADE_THRESHOLD: usize = 10_000;

/// Number of samples in the performance rolling window
const PERF_WINDOW: usize = 30;

/// Global operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PerfMode {
    Normal,
    /// Resource-conserving mode: longer flush interval, smaller broadcast
    /// buffer, coarse-only aggregation
    Low,
}

/// Publishes the global operating mode to interested subsystems
pub struct ModeController {
    tx: watch::Sender<PerfMode>,
}

impl ModeController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PerfMode::Normal);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<PerfMode> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> PerfMode {
        *self.tx.borrow()
    }

    /// Escalate to low-resource mode; a no-op if already there
    pub fn degrade(&self) {
        if self.current() != PerfMode::Low {
            log::warn!("Switching to low-resource mode");
            let _ = self.tx.send(PerfMode::Low);
        }
    }

    /// Explicit operator action; the only way back to normal mode
    pub fn reset_to_normal(&self) {
        if self.current() != PerfMode::Normal {
            log::info!("Resetting to normal mode");
            let _ = self.tx.send(PerfMode::Normal);
        }
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

/// Health state of one subsystem or the whole pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-subsystem health plus the overall rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub source: HealthStatus,
    pub storage: HealthStatus,
    pub broadcast: HealthStatus,
    pub overall: HealthStatus,
}

/// Aggregates success/failure counters from the pipeline's subsystems
#[derive(Debug, Default)]
pub struct HealthMonitor {
    source_ok: u64,
    source_err: u64,
    storage_ok: u64,
    storage_err: u64,
    broadcast_ok: u64,
    broadcast_err: u64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_source(&mut self, ok: bool) {
        if ok {
            self.source_ok += 1;
        } else {
            self.source_err += 1;
        }
    }

    pub fn record_storage(&mut self, ok: bool) {
        if ok {
            self.storage_ok += 1;
        } else {
            self.storage_err += 1;
        }
    }

    /// Record the outcome of one broadcast fan-out
    pub fn record_broadcast(&mut self, delivered: u64, failed: u64) {
        self.broadcast_ok += delivered;
        self.broadcast_err += failed;
    }

    pub fn report(&self) -> HealthReport {
        let source = match ratio(self.source_err, self.source_ok + self.source_err) {
            r if r > 0.10 => HealthStatus::Unhealthy,
            _ => HealthStatus::Healthy,
        };

        let storage = match ratio(self.storage_err, self.storage_ok + self.storage_err) {
            r if r > 0.05 => HealthStatus::Unhealthy,
            r if r > 0.01 => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        let delivered = self.broadcast_ok + self.broadcast_err;
        let broadcast = match ratio(self.broadcast_ok, delivered) {
            _ if delivered == 0 => HealthStatus::Healthy,
            r if r < 0.90 => HealthStatus::Unhealthy,
            r if r < 0.95 => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        HealthReport {
            source,
            storage,
            broadcast,
            overall: source.max(storage).max(broadcast),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Freshness bookkeeping for one signal
#[derive(Debug, Clone)]
struct SignalFreshness {
    last_update: Timestamp,
    last_value: f64,
    expected_interval: Duration,
}

/// Description of a stale signal in a staleness report
#[derive(Debug, Clone, Serialize)]
pub struct StaleSignal {
    pub name: String,
    pub last_value: f64,
    pub age_ms: i64,
}

/// Tracks when each signal was last updated and flags the stale ones
///
/// A signal is stale once its age exceeds max(2x its expected interval, a
/// fixed 5 second floor). Expected intervals come from the owning message's
/// cycle time in the catalog.
pub struct StalenessTracker {
    expected: HashMap<String, Duration>,
    freshness: HashMap<String, SignalFreshness>,
}

impl StalenessTracker {
    pub fn new(catalog: &Catalog) -> Self {
        let mut expected = HashMap::new();
        for message in catalog.messages() {
            let interval = message
                .cycle_time_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_EXPECTED_INTERVAL);
            for signal in &message.signals {
                expected.insert(signal.name.clone(), interval);
            }
        }
        Self {
            expected,
            freshness: HashMap::new(),
        }
    }

    /// Record an observed value for a signal
    pub fn observe(&mut self, name: &str, value: f64, timestamp: Timestamp) {
        let expected_interval = self
            .expected
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_EXPECTED_INTERVAL);
        self.freshness.insert(
            name.to_string(),
            SignalFreshness {
                last_update: timestamp,
                last_value: value,
                expected_interval,
            },
        );
    }

    /// Whether a signal is stale at `now`; signals never observed are not
    /// reported (there is nothing to be stale relative to)
    pub fn is_stale(&self, name: &str, now: Timestamp) -> bool {
        match self.freshness.get(name) {
            Some(f) => age(f, now) > allowance(f),
            None => false,
        }
    }

    /// All signals currently stale, with their last value and age
    pub fn stale_signals(&self, now: Timestamp) -> Vec<StaleSignal> {
        self.freshness
            .iter()
            .filter(|(_, f)| age(f, now) > allowance(f))
            .map(|(name, f)| StaleSignal {
                name: name.clone(),
                last_value: f.last_value,
                age_ms: (now - f.last_update).num_milliseconds(),
            })
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.freshness.len()
    }
}

fn age(f: &SignalFreshness, now: Timestamp) -> Duration {
    (now - f.last_update).to_std().unwrap_or(Duration::ZERO)
}

fn allowance(f: &SignalFreshness) -> Duration {
    (f.expected_interval * 2).max(STALENESS_FLOOR)
}

/// Source of resident-set-size readings, swappable for tests
pub trait MemoryProbe: Send + Sync {
    fn rss_bytes(&self) -> Option<u64>;
}

/// Reads RSS from /proc/self/statm
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn rss_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
}

#[derive(Debug, Clone, Copy)]
struct PerfSample {
    rss_bytes: u64,
    queue_depth: usize,
}

/// Samples memory and queue metrics into a bounded rolling window and
/// escalates the global mode when the rolling averages exceed thresholds
pub struct PerformanceMonitor {
    probe: Box<dyn MemoryProbe>,
    window: VecDeque<PerfSample>,
    memory_threshold: u64,
    queue_threshold: usize,
}

impl PerformanceMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            window: VecDeque::with_capacity(PERF_WINDOW),
            memory_threshold: MEMORY_DEGRADE_THRESHOLD,
            queue_threshold: QUEUE_DEGRADE_THRESHOLD,
        }
    }

    /// Take one sample; returns true if a rolling average crossed its degrade
    /// threshold on this sample
    pub fn sample(&mut self, queue_depth: usize, controller: &ModeController) -> bool {
        let rss_bytes = self.probe.rss_bytes().unwrap_or(0);
        if self.window.len() >= PERF_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(PerfSample {
            rss_bytes,
            queue_depth,
        });

        let avg_rss =
            self.window.iter().map(|s| s.rss_bytes).sum::<u64>() / self.window.len() as u64;
        let avg_depth =
            self.window.iter().map(|s| s.queue_depth).sum::<usize>() / self.window.len();

        if avg_rss > self.memory_threshold || avg_depth > self.queue_threshold {
            log::warn!(
                "Performance over threshold: avg RSS {} MB, avg queue depth {}",
                avg_rss / (1024 * 1024),
                avg_depth
            );
            controller.degrade();
            return true;
        }
        false
    }
}

/// Point-in-time health snapshot published by the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub report: HealthReport,
    pub mode: PerfMode,
    pub stale_signals: Vec<StaleSignal>,
    pub connected_clients: usize,
    /// Cumulative hub delivery totals, replay sends included
    pub delivery: crate::hub::BroadcastStats,
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Endianness, MessageDefinition, SignalDefinition};
    use crate::types::from_epoch_ms;
    use chrono::Utc;

    struct FixedProbe(u64);

    impl MemoryProbe for FixedProbe {
        fn rss_bytes(&self) -> Option<u64> {
            Some(self.0)
        }
    }

    fn catalog() -> Catalog {
        Catalog::new(vec![MessageDefinition {
            id: 0x100,
            name: "VCU_Info1".to_string(),
            length: 8,
            cycle_time_ms: Some(100),
            sender: None,
            signals: vec![SignalDefinition {
                name: "VehicleSpeed".to_string(),
                start_bit: 0,
                length: 16,
                factor: 1.0,
                offset: 0.0,
                min: None,
                max: None,
                endianness: Endianness::Little,
                signed: false,
                unit: None,
                val_table: None,
            }],
        }])
        .unwrap()
    }

    #[test]
    fn test_rollup_is_worst_component() {
        let mut monitor = HealthMonitor::new();
        for _ in 0..100 {
            monitor.record_source(true);
            monitor.record_storage(true);
        }
        monitor.record_broadcast(89, 11);

        let report = monitor.report();
        assert_eq!(report.source, HealthStatus::Healthy);
        assert_eq!(report.storage, HealthStatus::Healthy);
        assert_eq!(report.broadcast, HealthStatus::Unhealthy);
        assert_eq!(report.overall, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_storage_thresholds() {
        let mut monitor = HealthMonitor::new();
        for _ in 0..97 {
            monitor.record_storage(true);
        }
        monitor.record_storage(false);
        monitor.record_storage(false);
        // 2/99 ~ 2% -> degraded
        assert_eq!(monitor.report().storage, HealthStatus::Degraded);

        for _ in 0..5 {
            monitor.record_storage(false);
        }
        // 7/104 ~ 6.7% -> unhealthy
        assert_eq!(monitor.report().storage, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_source_error_threshold() {
        let mut monitor = HealthMonitor::new();
        for _ in 0..89 {
            monitor.record_source(true);
        }
        for _ in 0..11 {
            monitor.record_source(false);
        }
        assert_eq!(monitor.report().source, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_no_traffic_is_healthy() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.report().overall, HealthStatus::Healthy);
    }

    #[test]
    fn test_staleness_uses_cycle_time_and_floor() {
        let catalog = catalog();
        let mut tracker = StalenessTracker::new(&catalog);

        let t0 = from_epoch_ms(1_700_000_000_000);
        tracker.observe("VehicleSpeed", 42.0, t0);

        // Expected interval 100ms, but the 5s floor dominates
        assert!(!tracker.is_stale("VehicleSpeed", t0 + chrono::Duration::seconds(4)));
        assert!(tracker.is_stale("VehicleSpeed", t0 + chrono::Duration::seconds(6)));

        let stale = tracker.stale_signals(t0 + chrono::Duration::seconds(6));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "VehicleSpeed");
        assert_eq!(stale[0].last_value, 42.0);
        assert_eq!(stale[0].age_ms, 6000);
    }

    #[test]
    fn test_slow_cycle_doubles_allowance() {
        let catalog = Catalog::new(vec![MessageDefinition {
            id: 0x200,
            name: "Slow".to_string(),
            length: 8,
            cycle_time_ms: Some(4000),
            sender: None,
            signals: vec![SignalDefinition {
                name: "SlowSig".to_string(),
                start_bit: 0,
                length: 8,
                factor: 1.0,
                offset: 0.0,
                min: None,
                max: None,
                endianness: Endianness::Little,
                signed: false,
                unit: None,
                val_table: None,
            }],
        }])
        .unwrap();

        let mut tracker = StalenessTracker::new(&catalog);
        let t0 = from_epoch_ms(1_700_000_000_000);
        tracker.observe("SlowSig", 1.0, t0);

        // Allowance is max(2 * 4s, 5s) = 8s
        assert!(!tracker.is_stale("SlowSig", t0 + chrono::Duration::seconds(7)));
        assert!(tracker.is_stale("SlowSig", t0 + chrono::Duration::seconds(9)));
    }

    #[test]
    fn test_unobserved_signal_not_stale() {
        let tracker = StalenessTracker::new(&catalog());
        assert!(!tracker.is_stale("VehicleSpeed", Utc::now()));
        assert!(tracker.stale_signals(Utc::now()).is_empty());
    }

    #[test]
    fn test_mode_controller_one_way() {
        let controller = ModeController::new();
        let rx = controller.subscribe();
        assert_eq!(controller.current(), PerfMode::Normal);

        controller.degrade();
        assert_eq!(controller.current(), PerfMode::Low);
        assert_eq!(*rx.borrow(), PerfMode::Low);

        // Degrading again is a no-op; only an explicit reset returns
        controller.degrade();
        assert_eq!(controller.current(), PerfMode::Low);
        controller.reset_to_normal();
        assert_eq!(controller.current(), PerfMode::Normal);
    }

    #[test]
    fn test_perf_monitor_degrades_over_threshold() {
        let controller = ModeController::new();
        let mut monitor = PerformanceMonitor::new(Box::new(FixedProbe(600 * 1024 * 1024)));

        assert!(monitor.sample(10, &controller));
        assert_eq!(controller.current(), PerfMode::Low);
    }

    #[test]
    fn test_perf_monitor_stays_normal_under_threshold() {
        let controller = ModeController::new();
        let mut monitor = PerformanceMonitor::new(Box::new(FixedProbe(100 * 1024 * 1024)));

        for _ in 0..50 {
            assert!(!monitor.sample(0, &controller));
        }
        assert_eq!(controller.current(), PerfMode::Normal);
    }

    #[test]
    fn test_perf_monitor_degrades_on_queue_depth() {
        let controller = ModeController::new();
        // Memory stays well under its threshold; the queue alone escalates
        let mut monitor = PerformanceMonitor::new(Box::new(FixedProbe(100 * 1024 * 1024)));

        assert!(!monitor.sample(QUEUE_DEGRADE_THRESHOLD, &controller));
        assert_eq!(controller.current(), PerfMode::Normal);

        assert!(monitor.sample(3 * QUEUE_DEGRADE_THRESHOLD, &controller));
        assert_eq!(controller.current(), PerfMode::Low);
    }
}
