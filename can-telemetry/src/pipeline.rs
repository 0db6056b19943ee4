//! Pipeline wiring and lifecycle
//!
//! Connects the normalizer to the aggregation store and the distribution hub,
//! runs the independent periodic tasks (flush, prune, liveness, performance
//! sampling) under one cancellation token, and owns the shutdown ordering:
//! timers stop first, then buffered samples are flushed exactly once, then
//! connections and storage handles are released.

use crate::catalog::Catalog;
use crate::diagnostics::DiagnosticsRecorder;
use crate::health::{
    HealthMonitor, HealthSnapshot, ModeController, PerformanceMonitor, ProcMemoryProbe,
    StalenessTracker,
};
use crate::hub::{DistributionHub, HubConfig, HEARTBEAT_INTERVAL};
use crate::normalizer::FrameNormalizer;
use crate::store::{AggregationStore, MemoryAggregateRepository, StoreConfig};
use crate::types::{RawFrame, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pipeline-level configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub hub: HubConfig,
    /// Aggregates older than this are pruned
    pub retention: Duration,
    /// How often the prune task runs
    pub prune_interval: Duration,
    /// How often the performance monitor samples
    pub perf_sample_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            hub: HubConfig::default(),
            retention: Duration::from_secs(24 * 3600),
            prune_interval: Duration::from_secs(60),
            perf_sample_interval: Duration::from_secs(10),
        }
    }
}

/// The assembled telemetry pipeline
pub struct TelemetryPipeline {
    normalizer: Mutex<FrameNormalizer>,
    diagnostics: Arc<StdMutex<DiagnosticsRecorder>>,
    store: Arc<AggregationStore>,
    hub: Arc<DistributionHub>,
    health: Arc<StdMutex<HealthMonitor>>,
    staleness: Arc<StdMutex<StalenessTracker>>,
    mode: Arc<ModeController>,
    config: PipelineConfig,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    final_flush_done: AtomicBool,
}

impl TelemetryPipeline {
    pub fn new(catalog: Arc<Catalog>, config: PipelineConfig) -> Self {
        let mode = Arc::new(ModeController::new());
        let store = Arc::new(AggregationStore::new(
            Arc::new(MemoryAggregateRepository::new()),
            config.store.clone(),
            mode.subscribe(),
        ));
        let hub = Arc::new(DistributionHub::new(config.hub.clone(), mode.subscribe()));
        let staleness = Arc::new(StdMutex::new(StalenessTracker::new(&catalog)));

        Self {
            normalizer: Mutex::new(FrameNormalizer::new(catalog)),
            diagnostics: Arc::new(StdMutex::new(DiagnosticsRecorder::new())),
            store,
            hub,
            health: Arc::new(StdMutex::new(HealthMonitor::new())),
            staleness,
            mode,
            config,
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            final_flush_done: AtomicBool::new(false),
        }
    }

    /// Process one raw frame end to end: normalize, record samples, fan out
    ///
    /// Unknown frame ids are a no-op; per-signal failures are already
    /// isolated by the normalizer and only affect the health flag.
    pub async fn ingest_frame(&self, frame: RawFrame) -> Result<()> {
        let decoded = {
            let mut normalizer = self.normalizer.lock().await;
            let mut diagnostics = self.diagnostics.lock().unwrap();
            normalizer.normalize(&frame, &mut diagnostics)
        };

        let Some(message) = decoded else {
            return Ok(());
        };

        {
            let mut staleness = self.staleness.lock().unwrap();
            for (name, value) in &message.signals {
                staleness.observe(name, *value, message.timestamp);
            }
        }

        for (name, value) in &message.signals {
            let result = self.store.record_sample(message.timestamp, name, *value).await;
            let ok = result.is_ok();
            self.health.lock().unwrap().record_storage(ok);
            if let Err(e) = result {
                log::error!("Failed to record sample for '{}': {}", name, e);
            }
        }

        let stats = self.hub.broadcast(&message).await;
        self.health
            .lock()
            .unwrap()
            .record_broadcast(stats.delivered, stats.failed);

        Ok(())
    }

    /// Record the outcome of a source-level frame delivery (called by the
    /// frame source adapter)
    pub fn record_source_outcome(&self, ok: bool) {
        self.health.lock().unwrap().record_source(ok);
    }

    /// Spawn the periodic tasks: aggregation flush, TTL pruning, connection
    /// liveness, performance sampling. Each runs on its own timer and none
    /// blocks another.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        // Aggregation flush; the interval is re-read every cycle so a mode
        // switch takes effect on the next tick
        {
            let store = self.store.clone();
            let health = self.health.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let interval = store.flush_interval();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            let result = store.flush().await;
                            health.lock().unwrap().record_storage(result.is_ok());
                            if let Err(e) = result {
                                log::error!("Periodic flush failed: {}", e);
                            }
                        }
                    }
                }
            }));
        }

        // TTL pruning
        {
            let store = self.store.clone();
            let retention = self.config.retention;
            let prune_interval = self.config.prune_interval;
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(prune_interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {
                            if let Err(e) = store.prune_older_than(retention).await {
                                log::error!("Prune failed: {}", e);
                            }
                        }
                    }
                }
            }));
        }

        // Connection liveness
        {
            let hub = self.hub.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(HEARTBEAT_INTERVAL);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {
                            let closed = hub.run_liveness_check(Utc::now()).await;
                            if !closed.is_empty() {
                                log::info!("Liveness check closed {} connections", closed.len());
                            }
                        }
                    }
                }
            }));
        }

        // Performance sampling
        {
            let store = self.store.clone();
            let mode = self.mode.clone();
            let sample_interval = self.config.perf_sample_interval;
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut monitor = PerformanceMonitor::new(Box::new(ProcMemoryProbe));
                let mut timer = tokio::time::interval(sample_interval);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {
                            let depth = store.buffered_len().await;
                            monitor.sample(depth, &mode);
                        }
                    }
                }
            }));
        }
    }

    /// Stop all timers, flush buffered samples exactly once, release
    /// connections
    ///
    /// Safe to call more than once; the final flush happens only on the
    /// first call.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let tasks = {
            let mut tasks = self.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }

        if !self.final_flush_done.swap(true, Ordering::SeqCst) {
            let flushed = self.store.flush().await?;
            log::info!("Final flush wrote {} aggregate rows", flushed);
        }
        Ok(())
    }

    /// Point-in-time health snapshot
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let report = self.health.lock().unwrap().report();
        let stale_signals = self.staleness.lock().unwrap().stale_signals(Utc::now());
        HealthSnapshot {
            report,
            mode: self.mode.current(),
            stale_signals,
            connected_clients: self.hub.connected_count().await,
            delivery: self.hub.delivery_stats().await,
            timestamp: Utc::now(),
        }
    }

    pub fn hub(&self) -> Arc<DistributionHub> {
        self.hub.clone()
    }

    pub fn store(&self) -> Arc<AggregationStore> {
        self.store.clone()
    }

    pub fn mode_controller(&self) -> Arc<ModeController> {
        self.mode.clone()
    }

    pub fn diagnostics(&self) -> Arc<StdMutex<DiagnosticsRecorder>> {
        self.diagnostics.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Endianness, MessageDefinition, SignalDefinition};
    use crate::hub::WILDCARD_PATTERN;
    use crate::store::Window;
    use crate::types::from_epoch_ms;
    use tokio::sync::mpsc;

    fn catalog() -> Arc<Catalog> {
        Arc::new(
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
                    factor: 0.05,
                    offset: 0.0,
                    min: Some(0.0),
                    max: Some(300.0),
                    endianness: Endianness::Big,
                    signed: false,
                    unit: Some("km/h".to_string()),
                    val_table: None,
                }],
            }])
            .unwrap(),
        )
    }

    fn frame(raw_speed: u16) -> RawFrame {
        let mut data = vec![0u8; 8];
        data[0] = (raw_speed >> 8) as u8;
        data[1] = (raw_speed & 0xFF) as u8;
        RawFrame {
            id: 0x100,
            data,
            timestamp: from_epoch_ms(1_700_000_000_000),
        }
    }

    #[tokio::test]
    async fn test_ingest_reaches_store_and_hub() {
        let pipeline = TelemetryPipeline::new(catalog(), PipelineConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        let hub = pipeline.hub();
        let id = hub.register(tx).await;
        hub.subscribe(id, &[WILDCARD_PATTERN.to_string()]).await;

        pipeline.ingest_frame(frame(2000)).await.unwrap();

        // Hub saw the decoded message
        let payload = rx.recv().await.unwrap();
        assert!(payload.contains("\"topic\":\"realtime/VCU_Info1\""));

        // Store saw the sample
        let store = pipeline.store();
        store.flush().await.unwrap();
        let snapshot = store.snapshot(&["VehicleSpeed".to_string()]).await.unwrap();
        assert_eq!(snapshot["VehicleSpeed"], 100.0);
    }

    #[tokio::test]
    async fn test_unknown_frame_is_noop() {
        let pipeline = TelemetryPipeline::new(catalog(), PipelineConfig::default());
        pipeline
            .ingest_frame(RawFrame::new(0x7FF, vec![0; 8]))
            .await
            .unwrap();

        let diagnostics = pipeline.diagnostics();
        let diag = diagnostics.lock().unwrap();
        assert_eq!(diag.unknown_frames().len(), 1);
        assert_eq!(diag.total_errors(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_exactly_once() {
        let pipeline = TelemetryPipeline::new(catalog(), PipelineConfig::default());
        pipeline.start();
        pipeline.ingest_frame(frame(2000)).await.unwrap();

        pipeline.shutdown().await.unwrap();

        let store = pipeline.store();
        assert_eq!(store.buffered_len().await, 0);
        let rows = store
            .range_query(
                &["VehicleSpeed".to_string()],
                from_epoch_ms(0),
                from_epoch_ms(2_000_000_000_000),
                Window::OneSecond,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        // Second shutdown is a no-op, not a second flush
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_snapshot_shape() {
        let pipeline = TelemetryPipeline::new(catalog(), PipelineConfig::default());
        pipeline.record_source_outcome(true);
        pipeline.ingest_frame(frame(100)).await.unwrap();

        let snapshot = pipeline.health_snapshot().await;
        assert_eq!(snapshot.connected_clients, 0);
        assert_eq!(snapshot.mode, crate::health::PerfMode::Normal);
        // No subscribers yet: nothing delivered, nothing failed
        assert_eq!(snapshot.delivery.delivered, 0);
        assert_eq!(snapshot.delivery.failed, 0);
    }

    #[tokio::test]
    async fn test_health_snapshot_counts_deliveries() {
        let pipeline = TelemetryPipeline::new(catalog(), PipelineConfig::default());

        // First frame is broadcast before the client exists; subscribing
        // replays it, so the totals include the replay send
        pipeline.ingest_frame(frame(1000)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let hub = pipeline.hub();
        let id = hub.register(tx).await;
        hub.subscribe(id, &[WILDCARD_PATTERN.to_string()]).await;
        pipeline.ingest_frame(frame(2000)).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        let snapshot = pipeline.health_snapshot().await;
        assert_eq!(snapshot.delivery.delivered, 2);
        assert_eq!(snapshot.delivery.failed, 0);
        assert_eq!(snapshot.connected_clients, 1);
    }
}
