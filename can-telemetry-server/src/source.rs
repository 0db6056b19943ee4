//! Frame sources
//!
//! One source type with tagged variants selected by configuration instead of
//! a subclass ladder. Sources emit frames into a bounded channel toward the
//! normalizer, so a slow pipeline applies backpressure to the source rather
//! than growing an unbounded callback chain.

use can_telemetry::catalog::Catalog;
use can_telemetry::codec;
use can_telemetry::pipeline::TelemetryPipeline;
use can_telemetry::types::RawFrame;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which source implementation to run
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Generates plausible frames from the catalog on a fixed interval
    Simulated { interval: Duration },
    /// Replays frames from a JSON capture file
    Replay { path: PathBuf, repeat: bool },
}

/// Counters exposed by a running source
#[derive(Debug, Default)]
pub struct SourceStats {
    pub frames: AtomicU64,
    pub errors: AtomicU64,
}

/// What a source puts on the frame channel
///
/// Faults travel the same channel as frames so the consumer sees them in
/// order and can fold them into the source health dimension.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame(RawFrame),
    Fault(String),
}

/// A frame in a replay capture file
#[derive(Debug, Deserialize)]
struct ReplayFrame {
    id: u32,
    data: Vec<u8>,
    #[serde(default = "default_delay_ms", rename = "delayMs")]
    delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    100
}

/// The frame source
pub struct FrameSource {
    kind: SourceKind,
    catalog: Arc<Catalog>,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(kind: SourceKind, catalog: Arc<Catalog>) -> Self {
        Self {
            kind,
            catalog,
            stats: Arc::new(SourceStats::default()),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start emitting events into `tx`; a full channel blocks the source
    pub fn start(&mut self, tx: mpsc::Sender<SourceEvent>) {
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();

        let task = match &self.kind {
            SourceKind::Simulated { interval } => {
                log::info!("Starting simulated source, interval {:?}", interval);
                let catalog = self.catalog.clone();
                let interval = *interval;
                tokio::spawn(async move {
                    run_simulated(catalog, interval, tx, stats, cancel).await;
                })
            }
            SourceKind::Replay { path, repeat } => {
                log::info!("Starting replay source from {:?}", path);
                let path = path.clone();
                let repeat = *repeat;
                tokio::spawn(async move {
                    run_replay(path, repeat, tx, stats, cancel).await;
                })
            }
        };
        self.task = Some(task);
    }

    /// Stop the source and wait for its task to finish
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// (frames emitted, errors) so far
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.frames.load(Ordering::Relaxed),
            self.stats.errors.load(Ordering::Relaxed),
        )
    }
}

struct SimulatedMessageState {
    life_counter: i64,
    tick: u64,
}

/// Drain source events into the pipeline until the channel closes or the
/// token fires, recording each frame or fault as a source health outcome
pub async fn pump(
    mut rx: mpsc::Receiver<SourceEvent>,
    pipeline: Arc<TelemetryPipeline>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(SourceEvent::Frame(frame)) => {
                        pipeline.record_source_outcome(true);
                        if let Err(e) = pipeline.ingest_frame(frame).await {
                            log::error!("Frame ingest failed: {}", e);
                        }
                    }
                    Some(SourceEvent::Fault(reason)) => {
                        pipeline.record_source_outcome(false);
                        log::error!("Frame source fault: {}", reason);
                    }
                    None => break,
                }
            }
        }
    }
}

async fn run_simulated(
    catalog: Arc<Catalog>,
    interval: Duration,
    tx: mpsc::Sender<SourceEvent>,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
) {
    let mut ids: Vec<u32> = catalog.messages().map(|m| m.id).collect();
    ids.sort_unstable();
    let mut states: HashMap<u32, SimulatedMessageState> = HashMap::new();

    let mut timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                for &id in &ids {
                    let Some(message) = catalog.message(id) else { continue };
                    let state = states.entry(id).or_insert(SimulatedMessageState {
                        life_counter: -1,
                        tick: 0,
                    });
                    state.life_counter = (state.life_counter + 1) % 16;
                    state.tick += 1;

                    let frame = build_frame(message, state);
                    if tx.send(SourceEvent::Frame(frame)).await.is_err() {
                        // Pipeline gone; nothing left to feed
                        return;
                    }
                    stats.frames.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Build one plausible frame: drifting values within each signal's bounds,
/// a correct life counter and a correct XOR checksum
fn build_frame(
    message: &can_telemetry::catalog::MessageDefinition,
    state: &SimulatedMessageState,
) -> RawFrame {
    let mut data = vec![0u8; message.length];
    let mut rng = rand::thread_rng();

    let mut checksum_signal = None;
    for signal in &message.signals {
        if signal.length > codec::MAX_ENCODE_BITS {
            continue;
        }
        if signal.is_checksum() {
            checksum_signal = Some(signal);
            continue;
        }

        let raw = if signal.is_life_counter() {
            state.life_counter
        } else {
            let (lo, hi) = (signal.min.unwrap_or(0.0), signal.max.unwrap_or(100.0));
            let phase = state.tick as f64 * 0.1;
            let jitter: f64 = rng.gen_range(-0.02..0.02);
            let physical = lo + (hi - lo) * (0.5 + 0.45 * phase.sin() + jitter).clamp(0.0, 1.0);
            codec::inverse_scale(physical, signal.factor, signal.offset).unwrap_or(0)
        };

        let big = signal.endianness == can_telemetry::catalog::Endianness::Big;
        let _ = codec::encode_bits(&mut data, signal.start_bit, signal.length, big, signal.signed, raw);
    }

    // Checksum covers the first seven bytes, written after everything else
    if let Some(signal) = checksum_signal {
        let span = data.len().min(7);
        let checksum = data[..span].iter().fold(0u8, |acc, b| acc ^ b) as i64;
        let big = signal.endianness == can_telemetry::catalog::Endianness::Big;
        let _ = codec::encode_bits(&mut data, signal.start_bit, signal.length, big, signal.signed, checksum);
    }

    RawFrame::new(message.id, data)
}

async fn run_replay(
    path: PathBuf,
    repeat: bool,
    tx: mpsc::Sender<SourceEvent>,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
) {
    let frames: Vec<ReplayFrame> = match std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(frames) => frames,
        Err(e) => {
            let reason = format!("failed to load replay file {:?}: {}", path, e);
            log::error!("{}", reason);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(SourceEvent::Fault(reason)).await;
            return;
        }
    };
    if frames.is_empty() {
        log::warn!("Replay file {:?} contains no frames", path);
        return;
    }

    loop {
        for frame in &frames {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(frame.delay_ms)) => {}
            }
            if tx
                .send(SourceEvent::Frame(RawFrame::new(frame.id, frame.data.clone())))
                .await
                .is_err()
            {
                return;
            }
            stats.frames.fetch_add(1, Ordering::Relaxed);
        }
        if !repeat {
            break;
        }
    }
    log::info!("Replay finished: {} frames", frames.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::from_json_str(
                r#"{"messages":[{"id":256,"name":"VCU_Info1","length":8,"cycleTime":100,
                "signals":[
                    {"name":"VehicleSpeed","startBit":0,"length":16,"factor":0.05,
                     "endianness":"big","min":0,"max":300},
                    {"name":"VCU_LifeCnt","startBit":48,"length":4},
                    {"name":"VCU_CheckSum","startBit":56,"length":8}
                ]}]}"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_build_frame_has_valid_checksum_and_counter() {
        let catalog = catalog();
        let message = catalog.message(256).unwrap();
        let state = SimulatedMessageState {
            life_counter: 7,
            tick: 3,
        };

        let frame = build_frame(message, &state);
        assert_eq!(frame.data.len(), 8);

        let expected = frame.data[..7].iter().fold(0u8, |acc, b| acc ^ b);
        let checksum =
            codec::extract_bits(&frame.data, 56, 8, false, false).unwrap();
        assert_eq!(checksum, expected as i64);

        let life = codec::extract_bits(&frame.data, 48, 4, false, false).unwrap();
        assert_eq!(life, 7);

        let raw_speed = codec::extract_bits(&frame.data, 0, 16, true, false).unwrap();
        let speed = raw_speed as f64 * 0.05;
        assert!((0.0..=300.0).contains(&speed));
    }

    #[tokio::test]
    async fn test_simulated_source_emits_and_stops() {
        let mut source = FrameSource::new(
            SourceKind::Simulated {
                interval: Duration::from_millis(5),
            },
            catalog(),
        );
        let (tx, mut rx) = mpsc::channel(64);
        source.start(tx);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let SourceEvent::Frame(frame) = event else {
            panic!("expected a frame event");
        };
        assert_eq!(frame.id, 256);

        source.stop().await;
        let (frames, errors) = source.stats();
        assert!(frames >= 1);
        assert_eq!(errors, 0);
    }

    #[tokio::test]
    async fn test_replay_source_reports_missing_file() {
        let mut source = FrameSource::new(
            SourceKind::Replay {
                path: PathBuf::from("/nonexistent/capture.json"),
                repeat: false,
            },
            catalog(),
        );
        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx);
        source.stop().await;

        let (frames, errors) = source.stats();
        assert_eq!(frames, 0);
        assert_eq!(errors, 1);
        // The fault is also on the channel for the consumer
        assert!(matches!(rx.recv().await, Some(SourceEvent::Fault(_))));
    }

    #[tokio::test]
    async fn test_source_fault_degrades_health() {
        use can_telemetry::health::HealthStatus;
        use can_telemetry::pipeline::PipelineConfig;

        let catalog = catalog();
        let pipeline = Arc::new(TelemetryPipeline::new(
            catalog.clone(),
            PipelineConfig::default(),
        ));

        let mut source = FrameSource::new(
            SourceKind::Replay {
                path: PathBuf::from("/nonexistent/capture.json"),
                repeat: false,
            },
            catalog,
        );
        let (tx, rx) = mpsc::channel(8);
        source.start(tx);
        source.stop().await;

        // The channel closed after the fault, so the pump drains and returns
        pump(rx, pipeline.clone(), CancellationToken::new()).await;

        let snapshot = pipeline.health_snapshot().await;
        assert_eq!(snapshot.report.source, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_pump_feeds_frames_through() {
        use can_telemetry::health::HealthStatus;
        use can_telemetry::pipeline::PipelineConfig;

        let catalog = catalog();
        let pipeline = Arc::new(TelemetryPipeline::new(
            catalog.clone(),
            PipelineConfig::default(),
        ));

        let message = catalog.message(256).unwrap();
        let state = SimulatedMessageState {
            life_counter: 0,
            tick: 1,
        };
        let (tx, rx) = mpsc::channel(8);
        tx.send(SourceEvent::Frame(build_frame(message, &state)))
            .await
            .unwrap();
        drop(tx);

        pump(rx, pipeline.clone(), CancellationToken::new()).await;

        let snapshot = pipeline.health_snapshot().await;
        assert_eq!(snapshot.report.source, HealthStatus::Healthy);
        // The frame reached the store, not just the counter
        assert!(pipeline.store().buffered_len().await > 0);
    }
}
