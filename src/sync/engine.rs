//! Synchronization engine: owns the stream buffers and one aligner, produces
//! aligned tuples and fans them out to subscribers.
//!
//! Safe to call from multiple producer threads. Fan-out goes through a
//! bounded broadcast channel so a slow subscriber lags (and is counted)
//! instead of blocking the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{now_us, AlignedSample, AlignedTuple, Sample, SyncMetrics};
use crate::sync::aligner::{Aligner, AlignmentStrategy};
use crate::sync::buffer::{BufferStats, StreamBuffer, StreamBufferConfig};

/// When an alignment pass is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Every `process_sample` call while running (and ≥2 streams registered).
    OnArrival,
    /// A fixed-cadence pass at the current monotonic instant.
    Interval(Duration),
}

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub strategy: AlignmentStrategy,
    pub tolerance: Duration,
    /// Passes below this confidence still emit, but force quality = 0.
    pub min_confidence: f64,
    pub trigger: SyncTrigger,
    /// Broadcast fan-out capacity; laggards are counted, not waited on.
    pub channel_capacity: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            strategy: AlignmentStrategy::BufferBased,
            tolerance: Duration::from_millis(50),
            min_confidence: 0.3,
            trigger: SyncTrigger::OnArrival,
            channel_capacity: 256,
        }
    }
}

/// Legacy subscriber payload: flat source → sample map.
#[derive(Debug, Clone, Serialize)]
pub struct LegacySyncEvent {
    pub timestamp: u64,
    pub streams: HashMap<String, Sample>,
    pub quality: f64,
}

type LegacyCallback = Box<dyn Fn(LegacySyncEvent) + Send + Sync>;

#[derive(Debug, Default)]
pub struct SyncEngineStats {
    pub passes: AtomicU64,
    pub dropped_samples: AtomicU64,
    pub subscriber_lag_events: AtomicU64,
    pub low_confidence_passes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncEngineStatsSnapshot {
    pub passes: u64,
    pub dropped_samples: u64,
    pub subscriber_lag_events: u64,
    pub low_confidence_passes: u64,
}

impl SyncEngineStats {
    pub fn snapshot(&self) -> SyncEngineStatsSnapshot {
        SyncEngineStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            subscriber_lag_events: self.subscriber_lag_events.load(Ordering::Relaxed),
            low_confidence_passes: self.low_confidence_passes.load(Ordering::Relaxed),
        }
    }
}

pub struct SyncEngine {
    config: SyncEngineConfig,
    /// BTreeMap so the sync pass always visits buffers in source_id order.
    streams: RwLock<BTreeMap<String, Arc<Mutex<StreamBuffer>>>>,
    aligner: Mutex<Aligner>,
    metrics: RwLock<SyncMetrics>,
    running: AtomicBool,
    tuple_tx: broadcast::Sender<AlignedTuple>,
    legacy_callbacks: Arc<RwLock<Vec<LegacyCallback>>>,
    stats: SyncEngineStats,
    /// Previous pass instant and interval, for jitter estimation.
    pacing: Mutex<(Option<u64>, Option<f64>)>,
    interval_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(config: SyncEngineConfig) -> Arc<Self> {
        let (tuple_tx, _) = broadcast::channel(config.channel_capacity);
        let aligner = Aligner::new(config.strategy);
        let metrics = aligner.quality();
        Arc::new(Self {
            config,
            streams: RwLock::new(BTreeMap::new()),
            aligner: Mutex::new(aligner),
            metrics: RwLock::new(metrics),
            running: AtomicBool::new(false),
            tuple_tx,
            legacy_callbacks: Arc::new(RwLock::new(Vec::new())),
            stats: SyncEngineStats::default(),
            pacing: Mutex::new((None, None)),
            interval_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &SyncEngineStats {
        &self.stats
    }

    /// Allocate a buffer for a new stream. Replacing an existing source is a
    /// validation error; remove it first.
    pub fn add_stream(&self, source_id: impl Into<String>, config: StreamBufferConfig) -> Result<()> {
        let source_id = source_id.into();
        let mut streams = self.streams.write();
        if streams.contains_key(&source_id) {
            return Err(Error::validation(format!("stream {source_id} already registered")));
        }
        streams.insert(source_id, Arc::new(Mutex::new(StreamBuffer::new(config))));
        Ok(())
    }

    /// Drain and drop a stream.
    pub fn remove_stream(&self, source_id: &str) -> Result<()> {
        let removed = self.streams.write().remove(source_id);
        match removed {
            Some(buffer) => {
                buffer.lock().clear();
                self.aligner.lock().remove_source(source_id);
                Ok(())
            }
            None => Err(Error::not_found(format!("stream {source_id}"))),
        }
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn stream_stats(&self) -> BTreeMap<String, BufferStats> {
        self.streams
            .read()
            .iter()
            .map(|(id, buf)| (id.clone(), buf.lock().stats()))
            .collect()
    }

    /// Ingest one sample. Non-blocking for the producer; an on-arrival
    /// trigger runs the alignment pass inline but fans out through channels.
    pub fn process_sample(&self, source_id: &str, sample: Sample) -> Result<()> {
        let buffer = self
            .streams
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("stream {source_id}")))?;

        let capture_ts = sample.capture_ts_us;
        {
            let mut buf = buffer.lock();
            let before = buf.overflow_count();
            buf.add(sample)?;
            let evicted = buf.overflow_count() - before;
            if evicted > 0 {
                self.stats.dropped_samples.fetch_add(evicted, Ordering::Relaxed);
            }
        }

        if self.running.load(Ordering::Relaxed)
            && self.config.trigger == SyncTrigger::OnArrival
            && self.stream_count() >= 2
        {
            if let Err(e) = self.synchronize_at(capture_ts) {
                debug!(source = source_id, error = %e, "sync pass skipped");
            }
        }
        Ok(())
    }

    /// Produce an aligned tuple at `target_ts_us`, update metrics, fan out.
    pub fn synchronize_at(&self, target_ts_us: u64) -> Result<AlignedTuple> {
        let streams = self.streams.read();
        if streams.is_empty() {
            return Err(Error::NoStreams);
        }

        let tolerance_us = self.config.tolerance.as_micros() as u64;

        // Fixed acquisition order: BTreeMap iterates by source_id.
        let mut candidates: Vec<(String, Sample)> = Vec::with_capacity(streams.len());
        for (id, buffer) in streams.iter() {
            let buf = buffer.lock();
            if let Some(sample) = buf.get_closest(target_ts_us, tolerance_us) {
                candidates.push((id.clone(), sample.clone()));
            }
        }
        drop(streams);

        let mut sources = HashMap::with_capacity(candidates.len());
        let mut confidence: f64 = 1.0;
        let mut accuracy_accum_us: f64 = 0.0;
        {
            let mut aligner = self.aligner.lock();
            for (id, sample) in candidates {
                // Candidates came from get_closest(target, tolerance), so the
                // tuple invariant |capture − aligned| ≤ tolerance already
                // holds; the strategy contributes the per-source correction.
                let alignment = aligner.align(&sample, target_ts_us, tolerance_us, None);
                confidence = confidence.min(alignment.confidence);
                accuracy_accum_us += alignment.offset_us.unsigned_abs() as f64;
                sources.insert(
                    id,
                    AlignedSample {
                        sample,
                        offset_us: alignment.offset_us,
                        drift_estimate: alignment.drift_estimate,
                        confidence: alignment.confidence,
                    },
                );
            }
        }

        if sources.is_empty() {
            confidence = 0.0;
        }

        let tuple = AlignedTuple {
            aligned_ts_us: target_ts_us,
            confidence,
            sources,
        };

        self.update_metrics(&tuple, accuracy_accum_us);
        self.stats.passes.fetch_add(1, Ordering::Relaxed);
        self.fan_out(&tuple);
        Ok(tuple)
    }

    fn update_metrics(&self, tuple: &AlignedTuple, accuracy_accum_us: f64) {
        let now = now_us();
        let latency_ms = now.saturating_sub(tuple.aligned_ts_us) as f64 / 1000.0;

        let jitter_ms = {
            let mut pacing = self.pacing.lock();
            let (last_ts, last_interval) = *pacing;
            let interval = last_ts.map(|t| now.saturating_sub(t) as f64 / 1000.0);
            let jitter = match (interval, last_interval) {
                (Some(i), Some(li)) => (i - li).abs(),
                _ => 0.0,
            };
            *pacing = (Some(now), interval);
            jitter
        };

        let mut metrics = self.metrics.write();
        metrics.latency_ms = latency_ms;
        metrics.jitter_ms = jitter_ms;
        metrics.dropped_samples = self.stats.dropped_samples.load(Ordering::Relaxed);
        metrics.alignment_accuracy_ms = if tuple.is_empty() {
            metrics.alignment_accuracy_ms
        } else {
            accuracy_accum_us / tuple.len() as f64 / 1000.0
        };
        metrics.recompute_quality();

        if tuple.confidence < self.config.min_confidence {
            metrics.quality = 0.0;
            self.stats.low_confidence_passes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fan_out(&self, tuple: &AlignedTuple) {
        // No receivers is fine; broadcast laggards surface on their side.
        let _ = self.tuple_tx.send(tuple.clone());

        if self.legacy_callbacks.read().is_empty() {
            return;
        }
        let event = LegacySyncEvent {
            timestamp: tuple.aligned_ts_us,
            streams: tuple
                .sources
                .iter()
                .map(|(id, a)| (id.clone(), a.sample.clone()))
                .collect(),
            quality: self.metrics.read().quality,
        };
        // Legacy callbacks run on the engine's execution context, not the
        // producer thread, whenever a runtime is available.
        let callbacks = Arc::clone(&self.legacy_callbacks);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for cb in callbacks.read().iter() {
                        cb(event.clone());
                    }
                });
            }
            Err(_) => {
                for cb in callbacks.read().iter() {
                    cb(event.clone());
                }
            }
        }
    }

    /// Typed subscription. Dropped/lagging receivers never block the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<AlignedTuple> {
        self.tuple_tx.subscribe()
    }

    /// Legacy-shaped subscription for callers expecting the flat
    /// source → sample map. Callbacks must not block.
    pub fn subscribe_sync(&self, callback: impl Fn(LegacySyncEvent) + Send + Sync + 'static) {
        self.legacy_callbacks.write().push(Box::new(callback));
    }

    /// Count a lagged subscriber; called by receiver tasks on RecvError::Lagged.
    pub fn note_subscriber_lag(&self, skipped: u64) {
        self.stats.subscriber_lag_events.fetch_add(skipped.max(1), Ordering::Relaxed);
        warn!(skipped, "slow sync subscriber skipped");
    }

    /// Start emitting. Samples accumulate while stopped, but no tuples are
    /// produced until start.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let SyncTrigger::Interval(period) = self.config.trigger {
            let engine = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                while engine.running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    if engine.stream_count() < 2 {
                        continue;
                    }
                    if let Err(e) = engine.synchronize_at(now_us()) {
                        debug!(error = %e, "interval sync pass skipped");
                    }
                }
            });
            *self.interval_task.lock() = Some(handle);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.interval_task.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> SyncMetrics {
        *self.metrics.read()
    }

    /// Software-strategy clock sync passthrough.
    pub fn update_clock_sync(&self, source_id: &str, server_time_us: u64, client_time_us: u64) {
        self.aligner.lock().update_clock_sync(source_id, server_time_us, client_time_us);
    }

    /// Event-driven strategy passthrough.
    pub fn record_event(&self, kind: impl Into<String>, ts_us: u64) {
        self.aligner.lock().record_event(kind, ts_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SamplePayload;

    fn gaze(source: &str, ts: u64, seq: u64) -> Sample {
        Sample::new(source, ts, seq, SamplePayload::Gaze { x: 0.5, y: 0.5, pupil_diameter: None })
    }

    fn engine() -> Arc<SyncEngine> {
        SyncEngine::new(SyncEngineConfig::default())
    }

    #[test]
    fn synchronize_without_streams_fails() {
        let e = engine();
        assert!(matches!(e.synchronize_at(1000), Err(Error::NoStreams)));
    }

    #[test]
    fn two_stream_buffer_alignment_scenario() {
        let e = engine();
        e.add_stream("face", StreamBufferConfig::default()).unwrap();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();

        e.process_sample("gaze", gaze("gaze", 1_000_000, 1)).unwrap();
        e.process_sample("face", gaze("face", 1_030_000, 1)).unwrap();

        let tuple = e.synchronize_at(1_000_000).unwrap();
        assert_eq!(tuple.len(), 2);

        let g = tuple.get("gaze").unwrap();
        assert_eq!(g.offset_us, 0);
        assert!((g.confidence - 1.0).abs() < 1e-9);

        let f = tuple.get("face").unwrap();
        assert_eq!(f.offset_us.abs(), 30_000);
        assert!((f.confidence - 0.4).abs() < 1e-9);

        // Tuple confidence is the minimum across sources.
        assert!((tuple.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn tolerance_omits_distant_sources() {
        let e = engine();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        e.add_stream("face", StreamBufferConfig::default()).unwrap();

        e.process_sample("gaze", gaze("gaze", 1_000_000, 1)).unwrap();
        e.process_sample("face", gaze("face", 2_000_000, 1)).unwrap();

        let tuple = e.synchronize_at(1_000_000).unwrap();
        assert!(tuple.get("gaze").is_some());
        assert!(tuple.get("face").is_none());

        for aligned in tuple.sources.values() {
            let dist = aligned.sample.capture_ts_us.abs_diff(tuple.aligned_ts_us);
            assert!(dist <= e.config().tolerance.as_micros() as u64);
        }
    }

    #[test]
    fn ordering_preserved_per_source() {
        let e = engine();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        for i in 1..=10u64 {
            e.process_sample("gaze", gaze("gaze", i * 1000, i)).unwrap();
        }
        let streams = e.streams.read();
        let buf = streams.get("gaze").unwrap().lock();
        let seqs: Vec<u64> = buf.get_latest(100).iter().map(|s| s.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn low_confidence_pass_zeroes_quality() {
        let e = SyncEngine::new(SyncEngineConfig {
            min_confidence: 0.5,
            ..Default::default()
        });
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        e.add_stream("face", StreamBufferConfig::default()).unwrap();
        e.process_sample("gaze", gaze("gaze", 1_000_000, 1)).unwrap();
        // 49 ms away → confidence 0.02, below the 0.5 floor.
        e.process_sample("face", gaze("face", 1_049_000, 1)).unwrap();

        let tuple = e.synchronize_at(1_000_000).unwrap();
        assert!(tuple.confidence < 0.5);
        assert_eq!(e.metrics().quality, 0.0);
        assert_eq!(e.stats().snapshot().low_confidence_passes, 1);
    }

    #[test]
    fn remove_stream_then_not_found() {
        let e = engine();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        e.remove_stream("gaze").unwrap();
        assert!(matches!(e.remove_stream("gaze"), Err(Error::NotFound(_))));
        assert!(matches!(
            e.process_sample("gaze", gaze("gaze", 1, 1)),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn on_arrival_trigger_fans_out_to_subscribers() {
        let e = engine();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        e.add_stream("face", StreamBufferConfig::default()).unwrap();
        e.start();

        let mut rx = e.subscribe();
        e.process_sample("gaze", gaze("gaze", 1_000_000, 1)).unwrap();
        e.process_sample("face", gaze("face", 1_000_010, 1)).unwrap();

        let tuple = rx.try_recv().expect("tuple emitted on arrival");
        assert!(tuple.len() >= 1);
        e.stop();
    }

    #[test]
    fn stopped_engine_accumulates_but_does_not_emit() {
        let e = engine();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        e.add_stream("face", StreamBufferConfig::default()).unwrap();

        let mut rx = e.subscribe();
        e.process_sample("gaze", gaze("gaze", 1_000_000, 1)).unwrap();
        e.process_sample("face", gaze("face", 1_000_010, 1)).unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(e.stream_stats().get("gaze").unwrap().count, 1);
    }

    #[test]
    fn legacy_subscriber_receives_flat_shape() {
        let e = engine();
        e.add_stream("gaze", StreamBufferConfig::default()).unwrap();
        e.add_stream("face", StreamBufferConfig::default()).unwrap();
        e.process_sample("gaze", gaze("gaze", 1_000_000, 1)).unwrap();
        e.process_sample("face", gaze("face", 1_000_010, 1)).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        e.subscribe_sync(move |event| {
            seen_cb.lock().push(event);
        });

        e.synchronize_at(1_000_000).unwrap();
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].streams.contains_key("gaze"));
        assert!(events[0].streams.contains_key("face"));
    }
}
