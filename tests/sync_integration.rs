//! End-to-end synchronization tests: buffer-based alignment across live
//! streams and drift compensation under the hardware strategy.

use synopticon_backend::models::{Sample, SamplePayload};
use synopticon_backend::sync::{
    AlignmentStrategy, StreamBufferConfig, SyncEngine, SyncEngineConfig,
};

fn gaze_sample(source: &str, capture_us: u64, seq: u64, x: f64, y: f64) -> Sample {
    Sample::new(source, capture_us, seq, SamplePayload::Gaze { x, y, pupil_diameter: None })
}

#[tokio::test]
async fn two_stream_alignment_with_offsets_and_confidence() {
    let engine = SyncEngine::new(SyncEngineConfig::default());
    engine.add_stream("gaze", StreamBufferConfig::default()).unwrap();
    engine.add_stream("face", StreamBufferConfig::default()).unwrap();

    engine
        .process_sample("gaze", gaze_sample("gaze", 1_000_000, 1, 0.5, 0.5))
        .unwrap();
    engine
        .process_sample("face", gaze_sample("face", 1_030_000, 1, 0.0, 0.0))
        .unwrap();

    let tuple = engine.synchronize_at(1_000_000).unwrap();

    assert_eq!(tuple.len(), 2);
    assert_eq!(tuple.aligned_ts_us, 1_000_000);

    let gaze = tuple.get("gaze").unwrap();
    assert_eq!(gaze.offset_us, 0);
    assert!((gaze.confidence - 1.0).abs() < 1e-9);

    let face = tuple.get("face").unwrap();
    assert_eq!(face.offset_us.abs(), 30_000);
    assert!((face.confidence - 0.4).abs() < 1e-9);

    // Tolerance invariant: every member within 50 ms of the target.
    for aligned in tuple.sources.values() {
        assert!(aligned.sample.capture_ts_us.abs_diff(tuple.aligned_ts_us) <= 50_000);
    }
}

#[tokio::test]
async fn hardware_strategy_extrapolates_drift() {
    let engine = SyncEngine::new(SyncEngineConfig {
        strategy: AlignmentStrategy::HardwareTimestamp,
        ..Default::default()
    });
    engine.add_stream("tracker", StreamBufferConfig::default()).unwrap();
    engine.add_stream("anchor", StreamBufferConfig::default()).unwrap();

    // Anchor stream so each pass has two participants.
    let base = 1_000_000u64;

    // Feed 50 tracker samples whose ingest offset climbs 0, 1, …, 49 µs,
    // running an alignment pass per sample so the offset history builds.
    let mut tuple = None;
    for i in 0..50u64 {
        let capture = base + i * 5_000;
        let mut sample = gaze_sample("tracker", capture, i + 1, 0.5, 0.5);
        sample.ingest_ts_us = capture + i;
        engine.process_sample("tracker", sample).unwrap();

        let mut anchor = gaze_sample("anchor", capture, i + 1, 0.1, 0.1);
        anchor.ingest_ts_us = capture;
        engine.process_sample("anchor", anchor).unwrap();

        tuple = Some(engine.synchronize_at(capture).unwrap());
    }

    let tuple = tuple.unwrap();
    let tracker = tuple.get("tracker").unwrap();

    // Predicted offset ≈ 49 µs, applied as a negative correction.
    assert!(
        (tracker.offset_us + 49).abs() <= 2,
        "offset {} should be ≈ -49",
        tracker.offset_us
    );
    assert!((tracker.drift_estimate - 1.0).abs() < 0.2);
    assert!((tracker.confidence - 0.95).abs() < 1e-9);
}

#[tokio::test]
async fn subscribers_observe_ordered_subsequence_per_source() {
    let engine = SyncEngine::new(SyncEngineConfig::default());
    engine.add_stream("gaze", StreamBufferConfig::default()).unwrap();
    engine.add_stream("face", StreamBufferConfig::default()).unwrap();
    engine.start();

    let mut rx = engine.subscribe();

    for i in 1..=20u64 {
        let ts = 1_000_000 + i * 5_000;
        engine.process_sample("gaze", gaze_sample("gaze", ts, i, 0.5, 0.5)).unwrap();
        engine.process_sample("face", gaze_sample("face", ts + 100, i, 0.0, 0.0)).unwrap();
    }
    engine.stop();

    let mut last_gaze_seq = 0u64;
    while let Ok(tuple) = rx.try_recv() {
        if let Some(gaze) = tuple.get("gaze") {
            assert!(gaze.sample.seq >= last_gaze_seq, "per-source order violated");
            last_gaze_seq = gaze.sample.seq;
        }
    }
    assert!(last_gaze_seq > 0, "expected at least one emitted tuple");
}

#[tokio::test]
async fn dropped_samples_feed_metrics() {
    let engine = SyncEngine::new(SyncEngineConfig::default());
    engine
        .add_stream("gaze", StreamBufferConfig { capacity: 5, ..Default::default() })
        .unwrap();
    engine.add_stream("face", StreamBufferConfig::default()).unwrap();

    for i in 1..=20u64 {
        engine
            .process_sample("gaze", gaze_sample("gaze", 1_000_000 + i * 1_000, i, 0.5, 0.5))
            .unwrap();
    }
    engine
        .process_sample("face", gaze_sample("face", 1_020_000, 1, 0.0, 0.0))
        .unwrap();

    engine.synchronize_at(1_020_000).unwrap();
    let metrics = engine.metrics();
    assert!(metrics.dropped_samples >= 15, "evictions should be counted");
}
