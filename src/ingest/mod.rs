//! Sensor ingestion adapters: normalize device output into canonical
//! samples and push them at the sync engine.
//!
//! Adapters own device lifecycle (start/stop) but never own synchronization.
//! The gaze and face adapters here drive deterministic synthetic devices —
//! real capture hardware plugs in at the same seam; the telemetry adapter
//! bridges a live simulator connector.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{now_us, FaceDetection, Sample, SamplePayload, StreamKind, TelemetryFrame};
use crate::sync::{StreamBufferConfig, SyncEngine};

#[derive(Debug, Default)]
pub struct AdapterStats {
    pub samples_emitted: AtomicU64,
    pub samples_rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatsSnapshot {
    pub samples_emitted: u64,
    pub samples_rejected: u64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Device-facing lifecycle every adapter implements.
#[async_trait]
pub trait SensorAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> StreamKind;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn stats(&self) -> AdapterStatsSnapshot;
}

/// Shared plumbing: sequence numbers, engine push, counters.
struct AdapterCore {
    source_id: String,
    engine: Arc<SyncEngine>,
    seq: AtomicU64,
    stats: AdapterStats,
    running: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AdapterCore {
    fn new(source_id: String, engine: Arc<SyncEngine>) -> Self {
        Self {
            source_id,
            engine,
            seq: AtomicU64::new(1),
            stats: AdapterStats::default(),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    fn push(&self, payload: SamplePayload, confidence: Option<f64>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut sample = Sample::new(self.source_id.clone(), now_us(), seq, payload);
        if let Some(c) = confidence {
            sample = sample.with_confidence(c);
        }
        match self.engine.process_sample(&self.source_id, sample) {
            Ok(()) => {
                self.stats.samples_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.samples_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(source = %self.source_id, error = %e, "sample rejected");
            }
        }
    }

    fn begin(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    async fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let _ = self.engine.remove_stream(&self.source_id);
    }
}

/// Synthetic eye tracker: ~200 Hz gaze points wandering around the display.
pub struct GazeAdapter {
    core: Arc<AdapterCore>,
    rate_hz: f64,
    seed: u64,
}

impl GazeAdapter {
    pub fn new(source_id: impl Into<String>, engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(AdapterCore::new(source_id.into(), engine)),
            rate_hz: 200.0,
            seed: 0x6A5E,
        })
    }

}

#[async_trait]
impl SensorAdapter for GazeAdapter {
    fn source_id(&self) -> &str {
        &self.core.source_id
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Gaze
    }

    async fn start(&self) -> Result<()> {
        if !self.core.begin() {
            return Ok(());
        }
        // 200 Hz for 10 s of history.
        self.core.engine.add_stream(
            self.core.source_id.clone(),
            StreamBufferConfig { capacity: 2048, ..Default::default() },
        )?;
        info!(source = %self.core.source_id, rate_hz = self.rate_hz, "gaze adapter started");

        let core = Arc::clone(&self.core);
        let rate = self.rate_hz.max(1.0);
        let seed = self.seed;
        let task = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs_f64(1.0 / rate));
            let (mut x, mut y) = (0.5f64, 0.5f64);
            while core.running.load(Ordering::Relaxed) {
                ticker.tick().await;
                // Random walk with saccade jumps.
                if rng.gen_bool(0.02) {
                    x = rng.gen_range(0.1..0.9);
                    y = rng.gen_range(0.1..0.9);
                } else {
                    x = (x + rng.gen_range(-0.004..0.004)).clamp(0.0, 1.0);
                    y = (y + rng.gen_range(-0.004..0.004)).clamp(0.0, 1.0);
                }
                let confidence = rng.gen_range(0.85..1.0);
                core.push(
                    SamplePayload::Gaze {
                        x,
                        y,
                        pupil_diameter: Some(rng.gen_range(2.5..4.5)),
                    },
                    Some(confidence),
                );
            }
        });
        *self.core.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.core.end().await;
        Ok(())
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.core.stats.snapshot()
    }
}

/// Synthetic face detector: ~30 Hz single-face detections.
pub struct FaceAdapter {
    core: Arc<AdapterCore>,
    rate_hz: f64,
    seed: u64,
}

impl FaceAdapter {
    pub fn new(source_id: impl Into<String>, engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(AdapterCore::new(source_id.into(), engine)),
            rate_hz: 30.0,
            seed: 0xFACE,
        })
    }
}

#[async_trait]
impl SensorAdapter for FaceAdapter {
    fn source_id(&self) -> &str {
        &self.core.source_id
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Face
    }

    async fn start(&self) -> Result<()> {
        if !self.core.begin() {
            return Ok(());
        }
        self.core.engine.add_stream(
            self.core.source_id.clone(),
            StreamBufferConfig { capacity: 512, ..Default::default() },
        )?;
        info!(source = %self.core.source_id, rate_hz = self.rate_hz, "face adapter started");

        let core = Arc::clone(&self.core);
        let rate = self.rate_hz.max(1.0);
        let seed = self.seed;
        let task = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs_f64(1.0 / rate));
            while core.running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let cx = 0.5 + rng.gen_range(-0.05..0.05);
                let cy = 0.45 + rng.gen_range(-0.05..0.05);
                let confidence = rng.gen_range(0.7..0.99);
                core.push(
                    SamplePayload::Face {
                        faces: vec![FaceDetection {
                            bbox: [cx - 0.12, cy - 0.16, 0.24, 0.32],
                            confidence,
                            landmarks: None,
                        }],
                    },
                    Some(confidence),
                );
            }
        });
        *self.core.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.core.end().await;
        Ok(())
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.core.stats.snapshot()
    }
}

/// Bridges a simulator connector's frame broadcast into telemetry samples.
pub struct TelemetryAdapter {
    core: Arc<AdapterCore>,
    frames: Mutex<Option<broadcast::Receiver<TelemetryFrame>>>,
}

impl TelemetryAdapter {
    pub fn new(
        source_id: impl Into<String>,
        engine: Arc<SyncEngine>,
        frames: broadcast::Receiver<TelemetryFrame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(AdapterCore::new(source_id.into(), engine)),
            frames: Mutex::new(Some(frames)),
        })
    }
}

#[async_trait]
impl SensorAdapter for TelemetryAdapter {
    fn source_id(&self) -> &str {
        &self.core.source_id
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Telemetry
    }

    async fn start(&self) -> Result<()> {
        if !self.core.begin() {
            return Ok(());
        }
        self.core.engine.add_stream(
            self.core.source_id.clone(),
            StreamBufferConfig { capacity: 1024, ..Default::default() },
        )?;
        let Some(mut frames) = self.frames.lock().take() else {
            warn!(source = %self.core.source_id, "telemetry adapter restarted without a frame source");
            return Ok(());
        };
        info!(source = %self.core.source_id, "telemetry adapter started");

        let core = Arc::clone(&self.core);
        let task = tokio::spawn(async move {
            while core.running.load(Ordering::Relaxed) {
                match frames.recv().await {
                    Ok(frame) => {
                        // The frame timestamp is already on our monotonic
                        // clock; reuse it as the capture instant.
                        let seq = core.seq.fetch_add(1, Ordering::Relaxed);
                        let capture = frame.timestamp;
                        let sample = Sample::new(
                            core.source_id.clone(),
                            capture,
                            seq,
                            SamplePayload::Telemetry(frame),
                        );
                        match core.engine.process_sample(&core.source_id, sample) {
                            Ok(()) => {
                                core.stats.samples_emitted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                core.stats.samples_rejected.fetch_add(1, Ordering::Relaxed);
                                debug!(source = %core.source_id, error = %e, "telemetry sample rejected");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        core.stats.samples_rejected.fetch_add(skipped, Ordering::Relaxed);
                        warn!(source = %core.source_id, skipped, "telemetry adapter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.core.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.core.end().await;
        Ok(())
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.core.stats.snapshot()
    }
}

/// Application events injected by callers (stimulus markers, annotations).
pub struct EventAdapter {
    core: Arc<AdapterCore>,
}

impl EventAdapter {
    pub fn new(source_id: impl Into<String>, engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(AdapterCore::new(source_id.into(), engine)),
        })
    }

    /// Push one named event; also feeds the event-driven aligner's ring.
    pub fn push_event(&self, name: impl Into<String>, data: serde_json::Value) {
        let name = name.into();
        let ts = now_us();
        self.core.engine.record_event(name.clone(), ts);
        self.core.push(SamplePayload::Event { name, data }, None);
    }
}

#[async_trait]
impl SensorAdapter for EventAdapter {
    fn source_id(&self) -> &str {
        &self.core.source_id
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Event
    }

    async fn start(&self) -> Result<()> {
        if !self.core.begin() {
            return Ok(());
        }
        self.core.engine.add_stream(
            self.core.source_id.clone(),
            StreamBufferConfig { capacity: 256, ..Default::default() },
        )?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.core.end().await;
        Ok(())
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.core.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncEngineConfig;

    #[tokio::test]
    async fn gaze_adapter_feeds_engine() {
        let engine = SyncEngine::new(SyncEngineConfig::default());
        let adapter = GazeAdapter::new("gaze-0", Arc::clone(&engine));
        adapter.start().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        adapter.stop().await.unwrap();

        assert!(adapter.stats().samples_emitted > 0);
    }

    #[tokio::test]
    async fn telemetry_adapter_bridges_frames() {
        let engine = SyncEngine::new(SyncEngineConfig::default());
        let (tx, rx) = broadcast::channel(16);
        let adapter = TelemetryAdapter::new("sim-0", Arc::clone(&engine), rx);
        adapter.start().await.unwrap();

        let frame = TelemetryFrame {
            timestamp: now_us(),
            sequence: 1,
            source_id: "sim-0".to_string(),
            simulator: "beamng".to_string(),
            ..Default::default()
        };
        tx.send(frame).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(adapter.stats().samples_emitted, 1);
        assert_eq!(engine.stream_stats().get("sim-0").unwrap().count, 1);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn event_adapter_pushes_named_events() {
        let engine = SyncEngine::new(SyncEngineConfig::default());
        let adapter = EventAdapter::new("events", Arc::clone(&engine));
        adapter.start().await.unwrap();

        adapter.push_event("stimulus-on", serde_json::json!({"id": 3}));
        assert_eq!(adapter.stats().samples_emitted, 1);
        assert_eq!(engine.stream_stats().get("events").unwrap().count, 1);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_removes_stream() {
        let engine = SyncEngine::new(SyncEngineConfig::default());
        let adapter = FaceAdapter::new("face-0", Arc::clone(&engine));
        adapter.start().await.unwrap();
        assert!(engine.stream_ids().contains(&"face-0".to_string()));
        adapter.stop().await.unwrap();
        assert!(!engine.stream_ids().contains(&"face-0".to_string()));
    }
}
