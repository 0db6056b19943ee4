//! Time-windowed aggregation store
//!
//! Buffers per-signal samples in memory and periodically rolls them into
//! fixed time-window aggregates (first/last/min/max/avg) persisted through an
//! [`AggregateRepository`]. Flushes are idempotent upserts keyed on
//! `(bucket timestamp, signal name)`: re-flushing a bucket overwrites rather
//! than double-counts. A sample arriving after its bucket was already flushed
//! causes the bucket to be recomputed from the currently buffered subset
//! only; that is a documented limitation, not a defect.

mod memory;

pub use memory::MemoryAggregateRepository;

use crate::health::PerfMode;
use crate::types::{Result, Timestamp};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Aggregation window granularities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    OneSecond,
    TenSeconds,
}

impl Window {
    pub fn millis(&self) -> i64 {
        match self {
            Window::OneSecond => 1_000,
            Window::TenSeconds => 10_000,
        }
    }

    /// Floor-align a millisecond timestamp to this window
    pub fn align(&self, timestamp_ms: i64) -> i64 {
        let w = self.millis();
        timestamp_ms.div_euclid(w) * w
    }
}

/// One persisted aggregate bucket
///
/// Column shape is fixed for compatibility with the aggregate tables:
/// `(timestamp:int-ms, signal_name, last, first, avg, max, min)`, unique on
/// `(timestamp, signal_name)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub timestamp: i64,
    pub signal_name: String,
    pub last_value: f64,
    pub first_value: f64,
    pub avg_value: f64,
    pub max_value: f64,
    pub min_value: f64,
}

/// Storage seam for aggregate rows
///
/// The in-memory implementation is the only one in-tree; the trait is where a
/// database-backed table would slot in.
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    /// Upsert a batch of rows in one atomic operation
    async fn upsert_batch(&self, rows: Vec<(Window, AggregateRow)>) -> Result<()>;

    /// Rows for the given signals with `from <= timestamp <= to`, ordered by
    /// (timestamp asc, signal asc)
    async fn range_query(
        &self,
        window: Window,
        signals: &[String],
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<AggregateRow>>;

    /// The row with the globally latest timestamp for a signal, across all
    /// windows
    async fn latest(&self, signal: &str) -> Result<Option<AggregateRow>>;

    /// Delete rows older than the cutoff from all tables; returns rows removed
    async fn delete_older_than(&self, cutoff_ms: i64) -> Result<u64>;

    /// Reclaim storage space after deletions
    async fn reclaim(&self) -> Result<()>;
}

/// Tuning knobs for the aggregation store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Buffer size that triggers an early flush
    pub batch_size: usize,
    /// Periodic flush interval in normal mode
    pub flush_interval: Duration,
    /// Periodic flush interval in low-resource mode
    pub degraded_flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(5),
            degraded_flush_interval: Duration::from_secs(15),
        }
    }
}

/// A buffered sample awaiting aggregation
#[derive(Debug, Clone)]
struct Sample {
    timestamp_ms: i64,
    signal: String,
    value: f64,
}

/// The aggregation store
pub struct AggregationStore {
    repository: Arc<dyn AggregateRepository>,
    buffer: Mutex<Vec<Sample>>,
    config: StoreConfig,
    mode: watch::Receiver<PerfMode>,
}

impl AggregationStore {
    pub fn new(
        repository: Arc<dyn AggregateRepository>,
        config: StoreConfig,
        mode: watch::Receiver<PerfMode>,
    ) -> Self {
        Self {
            repository,
            buffer: Mutex::new(Vec::new()),
            config,
            mode,
        }
    }

    /// Append a sample to the buffer, flushing early once the batch size is
    /// reached
    pub async fn record_sample(&self, timestamp: Timestamp, signal: &str, value: f64) -> Result<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(Sample {
                timestamp_ms: timestamp.timestamp_millis(),
                signal: signal.to_string(),
                value,
            });
            buffer.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Drain the buffer and upsert the window aggregates it produces
    ///
    /// In low-resource mode only the coarse window is computed. Returns the
    /// number of rows written.
    pub async fn flush(&self) -> Result<usize> {
        let samples = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if samples.is_empty() {
            return Ok(0);
        }

        let degraded = *self.mode.borrow() == PerfMode::Low;
        let windows: &[Window] = if degraded {
            &[Window::TenSeconds]
        } else {
            &[Window::OneSecond, Window::TenSeconds]
        };

        let mut rows = Vec::new();
        for &window in windows {
            rows.extend(
                aggregate(&samples, window)
                    .into_iter()
                    .map(|row| (window, row)),
            );
        }

        let count = rows.len();
        log::debug!(
            "Flushing {} samples into {} aggregate rows (degraded={})",
            samples.len(),
            count,
            degraded
        );
        self.repository.upsert_batch(rows).await?;
        Ok(count)
    }

    /// Aggregate rows for the given signals in `[from, to]` at the requested
    /// granularity, ordered by (timestamp asc, signal asc)
    pub async fn range_query(
        &self,
        signals: &[String],
        from: Timestamp,
        to: Timestamp,
        window: Window,
    ) -> Result<Vec<AggregateRow>> {
        self.repository
            .range_query(
                window,
                signals,
                from.timestamp_millis(),
                to.timestamp_millis(),
            )
            .await
    }

    /// Latest known value per signal, taken from the row with the globally
    /// latest timestamp for that signal (not bounded by any query window)
    pub async fn snapshot(&self, signals: &[String]) -> Result<HashMap<String, f64>> {
        let mut values = HashMap::new();
        for signal in signals {
            if let Some(row) = self.repository.latest(signal).await? {
                values.insert(signal.clone(), row.last_value);
            }
        }
        Ok(values)
    }

    /// Delete aggregates older than `age` across all tables; roughly one in
    /// ten runs also reclaims storage space
    pub async fn prune_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp_millis() - age.as_millis() as i64;
        let removed = self.repository.delete_older_than(cutoff).await?;
        if removed > 0 {
            log::info!("Pruned {} aggregate rows older than {:?}", removed, age);
        }

        if rand::random::<f64>() < 0.1 {
            log::debug!("Running storage reclaim pass");
            self.repository.reclaim().await?;
        }
        Ok(removed)
    }

    /// Number of samples currently buffered (queue depth for the supervisor)
    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// The flush interval appropriate for the current mode
    pub fn flush_interval(&self) -> Duration {
        if *self.mode.borrow() == PerfMode::Low {
            self.config.degraded_flush_interval
        } else {
            self.config.flush_interval
        }
    }
}

/// Roll a set of samples into per-(bucket, signal) aggregates for one window
fn aggregate(samples: &[Sample], window: Window) -> Vec<AggregateRow> {
    struct Acc {
        first_ts: i64,
        first: f64,
        last_ts: i64,
        last: f64,
        min: f64,
        max: f64,
        sum: f64,
        count: u64,
    }

    let mut buckets: HashMap<(i64, &str), Acc> = HashMap::new();
    for sample in samples {
        let bucket = window.align(sample.timestamp_ms);
        buckets
            .entry((bucket, sample.signal.as_str()))
            .and_modify(|acc| {
                if sample.timestamp_ms < acc.first_ts {
                    acc.first_ts = sample.timestamp_ms;
                    acc.first = sample.value;
                }
                if sample.timestamp_ms >= acc.last_ts {
                    acc.last_ts = sample.timestamp_ms;
                    acc.last = sample.value;
                }
                acc.min = acc.min.min(sample.value);
                acc.max = acc.max.max(sample.value);
                acc.sum += sample.value;
                acc.count += 1;
            })
            .or_insert(Acc {
                first_ts: sample.timestamp_ms,
                first: sample.value,
                last_ts: sample.timestamp_ms,
                last: sample.value,
                min: sample.value,
                max: sample.value,
                sum: sample.value,
                count: 1,
            });
    }

    buckets
        .into_iter()
        .map(|((timestamp, signal), acc)| AggregateRow {
            timestamp,
            signal_name: signal.to_string(),
            last_value: acc.last,
            first_value: acc.first,
            avg_value: acc.sum / acc.count as f64,
            max_value: acc.max,
            min_value: acc.min,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ModeController;
    use crate::types::from_epoch_ms;

    fn store() -> (AggregationStore, ModeController) {
        let controller = ModeController::new();
        let store = AggregationStore::new(
            Arc::new(MemoryAggregateRepository::new()),
            StoreConfig::default(),
            controller.subscribe(),
        );
        (store, controller)
    }

    #[test]
    fn test_window_alignment() {
        assert_eq!(Window::OneSecond.align(1234), 1000);
        assert_eq!(Window::OneSecond.align(999), 0);
        assert_eq!(Window::TenSeconds.align(123_456), 120_000);
        assert_eq!(Window::TenSeconds.align(-5_000), -10_000);
    }

    #[tokio::test]
    async fn test_basic_aggregation() {
        let (store, _controller) = store();
        let base = from_epoch_ms(1_700_000_000_000);

        // Samples 1, 2, 3 within one 1s window
        for (i, value) in [1.0, 2.0, 3.0].iter().enumerate() {
            store
                .record_sample(base + chrono::Duration::milliseconds(i as i64 * 100), "Speed", *value)
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        let rows = store
            .range_query(
                &["Speed".to_string()],
                base - chrono::Duration::seconds(1),
                base + chrono::Duration::seconds(1),
                Window::OneSecond,
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.timestamp, 1_700_000_000_000);
        assert_eq!(row.first_value, 1.0);
        assert_eq!(row.last_value, 3.0);
        assert_eq!(row.min_value, 1.0);
        assert_eq!(row.max_value, 3.0);
        assert_eq!(row.avg_value, 2.0);
    }

    #[tokio::test]
    async fn test_double_flush_no_duplicates() {
        let (store, _controller) = store();
        let base = from_epoch_ms(1_700_000_000_000);

        store.record_sample(base, "Speed", 1.0).await.unwrap();
        store.flush().await.unwrap();
        // Second flush of the same bucket overwrites, never duplicates
        store.record_sample(base, "Speed", 9.0).await.unwrap();
        store.flush().await.unwrap();

        let rows = store
            .range_query(
                &["Speed".to_string()],
                base,
                base + chrono::Duration::seconds(1),
                Window::OneSecond,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        // Recomputed from the newly buffered subset only
        assert_eq!(rows[0].first_value, 9.0);
        assert_eq!(rows[0].avg_value, 9.0);
    }

    #[tokio::test]
    async fn test_flush_empty_buffer_is_noop() {
        let (store, _controller) = store();
        assert_eq!(store.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_range_query_ordering() {
        let (store, _controller) = store();
        let base = from_epoch_ms(1_700_000_000_000);

        store.record_sample(base + chrono::Duration::seconds(1), "B", 2.0).await.unwrap();
        store.record_sample(base, "B", 1.0).await.unwrap();
        store.record_sample(base, "A", 1.0).await.unwrap();
        store.flush().await.unwrap();

        let rows = store
            .range_query(
                &["A".to_string(), "B".to_string()],
                base,
                base + chrono::Duration::seconds(5),
                Window::OneSecond,
            )
            .await
            .unwrap();

        let keys: Vec<(i64, &str)> = rows
            .iter()
            .map(|r| (r.timestamp, r.signal_name.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (1_700_000_000_000, "A"),
                (1_700_000_000_000, "B"),
                (1_700_000_001_000, "B"),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_takes_globally_latest() {
        let (store, _controller) = store();
        let base = from_epoch_ms(1_700_000_000_000);

        store.record_sample(base, "Speed", 10.0).await.unwrap();
        store.flush().await.unwrap();
        store
            .record_sample(base + chrono::Duration::seconds(60), "Speed", 20.0)
            .await
            .unwrap();
        store.flush().await.unwrap();

        let snapshot = store.snapshot(&["Speed".to_string(), "Missing".to_string()]).await.unwrap();
        assert_eq!(snapshot["Speed"], 20.0);
        assert!(!snapshot.contains_key("Missing"));
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let controller = ModeController::new();
        let store = AggregationStore::new(
            Arc::new(MemoryAggregateRepository::new()),
            StoreConfig {
                batch_size: 3,
                ..StoreConfig::default()
            },
            controller.subscribe(),
        );
        let base = from_epoch_ms(1_700_000_000_000);

        store.record_sample(base, "Speed", 1.0).await.unwrap();
        store.record_sample(base, "Speed", 2.0).await.unwrap();
        assert_eq!(store.buffered_len().await, 2);
        // Third sample reaches the batch size and flushes
        store.record_sample(base, "Speed", 3.0).await.unwrap();
        assert_eq!(store.buffered_len().await, 0);

        let snapshot = store.snapshot(&["Speed".to_string()]).await.unwrap();
        assert_eq!(snapshot["Speed"], 3.0);
    }

    #[tokio::test]
    async fn test_degraded_mode_drops_fine_window() {
        let (store, controller) = store();
        controller.degrade();
        let base = from_epoch_ms(1_700_000_000_000);

        store.record_sample(base, "Speed", 1.0).await.unwrap();
        store.flush().await.unwrap();

        let fine = store
            .range_query(
                &["Speed".to_string()],
                base - chrono::Duration::seconds(60),
                base + chrono::Duration::seconds(60),
                Window::OneSecond,
            )
            .await
            .unwrap();
        assert!(fine.is_empty());

        let coarse = store
            .range_query(
                &["Speed".to_string()],
                base - chrono::Duration::seconds(60),
                base + chrono::Duration::seconds(60),
                Window::TenSeconds,
            )
            .await
            .unwrap();
        assert_eq!(coarse.len(), 1);

        assert_eq!(store.flush_interval(), Duration::from_secs(15));
        controller.reset_to_normal();
        assert_eq!(store.flush_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_prune_deletes_both_tables() {
        let (store, _controller) = store();
        let old = chrono::Utc::now() - chrono::Duration::hours(2);
        let fresh = chrono::Utc::now();

        store.record_sample(old, "Speed", 1.0).await.unwrap();
        store.record_sample(fresh, "Speed", 2.0).await.unwrap();
        store.flush().await.unwrap();

        // Old bucket exists in the 1s and 10s tables -> 2 rows removed
        let removed = store.prune_older_than(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 2);

        let snapshot = store.snapshot(&["Speed".to_string()]).await.unwrap();
        assert_eq!(snapshot["Speed"], 2.0);
    }

    #[test]
    fn test_aggregate_tie_breaking() {
        // Equal timestamps: first keeps the earliest buffered, last the latest
        let samples = vec![
            Sample { timestamp_ms: 1000, signal: "S".into(), value: 1.0 },
            Sample { timestamp_ms: 1000, signal: "S".into(), value: 2.0 },
        ];
        let rows = aggregate(&samples, Window::OneSecond);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_value, 1.0);
        assert_eq!(rows[0].last_value, 2.0);
    }
}
