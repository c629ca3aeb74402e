//! Temporal alignment strategies.
//!
//! A strategy maps a raw sample to an aligned timestamp plus a confidence.
//! The variant is picked at engine construction and holds all per-source
//! state (offset histories, clock-sync parameters, event rings) explicitly.

use std::collections::{HashMap, VecDeque};

use crate::models::{now_us, Sample, SyncMetrics};

/// Strategy selector, used in engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStrategy {
    /// Source clocks are trusted; compensate their drift. ~1 ms precision.
    HardwareTimestamp,
    /// Producer and ingestor clocks differ; apply offset + drift model.
    SoftwareTimestamp,
    /// Closest-match lookup against each stream buffer at a target instant.
    BufferBased,
    /// Snap samples to nearby discrete events.
    EventDriven,
}

/// Result of aligning one sample.
#[derive(Debug, Clone, Copy)]
pub struct SourceAlignment {
    pub aligned_ts_us: u64,
    /// aligned − capture, microseconds.
    pub offset_us: i64,
    /// Estimated drift (µs per observation for hardware, µs/µs for software).
    pub drift_estimate: f64,
    pub confidence: f64,
}

const OFFSET_HISTORY: usize = 100;
const DRIFT_REGRESSION_WINDOW: usize = 10;
const EVENT_RETENTION_US: u64 = 60_000_000;
const EVENT_SNAP_WINDOW_US: u64 = 100_000;

const HARDWARE_CONFIDENCE: f64 = 0.95;
const SOFTWARE_CONFIDENCE: f64 = 0.8;
const EVENT_SNAP_CONFIDENCE: f64 = 0.9;
const EVENT_MISS_CONFIDENCE: f64 = 0.1;

/// Per-source state for the hardware-timestamp strategy.
#[derive(Debug, Default)]
struct HardwareState {
    /// ingest − capture observations, newest last.
    offsets: VecDeque<f64>,
}

impl HardwareState {
    fn observe(&mut self, offset_us: f64) {
        self.offsets.push_back(offset_us);
        while self.offsets.len() > OFFSET_HISTORY {
            self.offsets.pop_front();
        }
    }

    /// Least-squares slope of offset vs. index over the regression window.
    fn drift(&self) -> f64 {
        let n = self.offsets.len().min(DRIFT_REGRESSION_WINDOW);
        if n < 2 {
            return 0.0;
        }
        let window = self.offsets.iter().rev().take(n).rev();
        let mean_x = (n as f64 - 1.0) / 2.0;
        let mean_y: f64 = window.clone().sum::<f64>() / n as f64;
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, y) in window.enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den == 0.0 {
            0.0
        } else {
            num / den
        }
    }

    /// Regression value at the newest observation — the offset the source
    /// clock is expected to be showing right now.
    fn predicted_offset(&self) -> f64 {
        let n = self.offsets.len().min(DRIFT_REGRESSION_WINDOW);
        if n == 0 {
            return 0.0;
        }
        let window = self.offsets.iter().rev().take(n).rev();
        let mean_y: f64 = window.sum::<f64>() / n as f64;
        let mean_x = (n as f64 - 1.0) / 2.0;
        mean_y + self.drift() * ((n as f64 - 1.0) - mean_x)
    }
}

/// Per-source clock-sync parameters for the software-timestamp strategy.
#[derive(Debug, Default, Clone, Copy)]
struct SoftwareState {
    offset_us: f64,
    /// µs of divergence per µs of elapsed time.
    drift: f64,
    last_sync_us: u64,
}

pub struct Aligner {
    strategy: AlignmentStrategy,
    hardware: HashMap<String, HardwareState>,
    software: HashMap<String, SoftwareState>,
    /// (kind, capture_ts_us), newest last, 60 s retention.
    events: VecDeque<(String, u64)>,
}

impl Aligner {
    pub fn new(strategy: AlignmentStrategy) -> Self {
        Self {
            strategy,
            hardware: HashMap::new(),
            software: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn strategy(&self) -> AlignmentStrategy {
        self.strategy
    }

    pub fn remove_source(&mut self, source_id: &str) {
        self.hardware.remove(source_id);
        self.software.remove(source_id);
    }

    /// Feed the clock-sync observation for one source (software strategy).
    ///
    /// Recomputes drift from the change in offset over the change in client
    /// time since the previous sync.
    pub fn update_clock_sync(&mut self, source_id: &str, server_time_us: u64, client_time_us: u64) {
        let state = self.software.entry(source_id.to_string()).or_default();
        let new_offset = server_time_us as f64 - client_time_us as f64;
        if state.last_sync_us > 0 {
            let dt = client_time_us.saturating_sub(state.last_sync_us) as f64;
            if dt > 0.0 {
                state.drift = (new_offset - state.offset_us) / dt;
            }
        }
        state.offset_us = new_offset;
        state.last_sync_us = client_time_us;
    }

    /// Record a discrete event for the event-driven strategy.
    pub fn record_event(&mut self, kind: impl Into<String>, ts_us: u64) {
        self.events.push_back((kind.into(), ts_us));
        let horizon = ts_us.saturating_sub(EVENT_RETENTION_US);
        while self.events.front().is_some_and(|(_, t)| *t < horizon) {
            self.events.pop_front();
        }
    }

    /// Align one sample under the configured strategy.
    ///
    /// `target_ts_us` is the tuple's reference instant; the buffer-based
    /// strategy aligns onto it directly, the others derive their own
    /// corrected timestamp per source.
    pub fn align(
        &mut self,
        sample: &Sample,
        target_ts_us: u64,
        tolerance_us: u64,
        event_kind: Option<&str>,
    ) -> SourceAlignment {
        match self.strategy {
            AlignmentStrategy::HardwareTimestamp => self.align_hardware(sample),
            AlignmentStrategy::SoftwareTimestamp => self.align_software(sample),
            AlignmentStrategy::BufferBased => {
                Self::align_buffer(sample, target_ts_us, tolerance_us)
            }
            AlignmentStrategy::EventDriven => self.align_event(sample, event_kind),
        }
    }

    fn align_hardware(&mut self, sample: &Sample) -> SourceAlignment {
        let state = self.hardware.entry(sample.source_id.clone()).or_default();
        let ingest = if sample.ingest_ts_us > 0 { sample.ingest_ts_us } else { now_us() };
        state.observe(ingest as f64 - sample.capture_ts_us as f64);

        let drift = state.drift();
        let predicted = state.predicted_offset();
        let aligned = (sample.capture_ts_us as f64 - predicted).max(0.0) as u64;
        SourceAlignment {
            aligned_ts_us: aligned,
            offset_us: aligned as i64 - sample.capture_ts_us as i64,
            drift_estimate: drift,
            confidence: HARDWARE_CONFIDENCE,
        }
    }

    fn align_software(&mut self, sample: &Sample) -> SourceAlignment {
        let state = self.software.entry(sample.source_id.clone()).or_default();
        let elapsed = now_us().saturating_sub(state.last_sync_us) as f64;
        let correction = state.offset_us + elapsed * state.drift;
        let aligned = (sample.capture_ts_us as f64 + correction).max(0.0) as u64;
        SourceAlignment {
            aligned_ts_us: aligned,
            offset_us: aligned as i64 - sample.capture_ts_us as i64,
            drift_estimate: state.drift,
            confidence: SOFTWARE_CONFIDENCE,
        }
    }

    fn align_buffer(sample: &Sample, target_ts_us: u64, tolerance_us: u64) -> SourceAlignment {
        let distance = sample.capture_ts_us.abs_diff(target_ts_us);
        let confidence = if tolerance_us == 0 {
            if distance == 0 { 1.0 } else { 0.0 }
        } else {
            (1.0 - distance as f64 / tolerance_us as f64).max(0.0)
        };
        SourceAlignment {
            aligned_ts_us: target_ts_us,
            offset_us: target_ts_us as i64 - sample.capture_ts_us as i64,
            drift_estimate: 0.0,
            confidence,
        }
    }

    fn align_event(&mut self, sample: &Sample, kind: Option<&str>) -> SourceAlignment {
        let nearest = self
            .events
            .iter()
            .filter(|(k, _)| kind.is_none_or(|want| k == want))
            .map(|(_, t)| *t)
            .min_by_key(|t| t.abs_diff(sample.capture_ts_us))
            .filter(|t| t.abs_diff(sample.capture_ts_us) <= EVENT_SNAP_WINDOW_US);

        match nearest {
            Some(event_ts) => SourceAlignment {
                aligned_ts_us: event_ts,
                offset_us: event_ts as i64 - sample.capture_ts_us as i64,
                drift_estimate: 0.0,
                confidence: EVENT_SNAP_CONFIDENCE,
            },
            None => SourceAlignment {
                aligned_ts_us: sample.capture_ts_us,
                offset_us: 0,
                drift_estimate: 0.0,
                confidence: EVENT_MISS_CONFIDENCE,
            },
        }
    }

    /// Strategy-typical baseline metrics, before any pass has run.
    pub fn quality(&self) -> SyncMetrics {
        let (quality, accuracy_ms) = match self.strategy {
            AlignmentStrategy::HardwareTimestamp => (0.95, 1.0),
            AlignmentStrategy::SoftwareTimestamp => (0.8, 5.0),
            AlignmentStrategy::BufferBased => (0.85, 10.0),
            AlignmentStrategy::EventDriven => (0.5, 100.0),
        };
        SyncMetrics {
            quality,
            alignment_accuracy_ms: accuracy_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SamplePayload;

    fn sample(source: &str, capture: u64, ingest: u64, seq: u64) -> Sample {
        let mut s = Sample::new(
            source,
            capture,
            seq,
            SamplePayload::Gaze { x: 0.0, y: 0.0, pupil_diameter: None },
        );
        s.ingest_ts_us = ingest;
        s
    }

    #[test]
    fn hardware_drift_extrapolates_linear_offsets() {
        let mut aligner = Aligner::new(AlignmentStrategy::HardwareTimestamp);
        // Offsets 0, 1, 2, …, 49 µs: ingest runs ahead of capture linearly.
        for i in 0..50u64 {
            let capture = 1_000_000 + i * 5_000;
            let s = sample("tracker", capture, capture + i, i + 1);
            aligner.align(&s, capture, 50_000, None);
        }
        let capture = 2_000_000;
        let s = sample("tracker", capture, capture + 49, 51);
        let a = aligner.align(&s, capture, 50_000, None);
        // Predicted offset ≈ 49 µs, so aligned ≈ capture − 49.
        let corrected = capture as i64 + a.offset_us;
        assert!((corrected - (capture as i64 - 49)).abs() <= 2, "corrected={corrected}");
        assert!((a.drift_estimate - 1.0).abs() < 0.2);
        assert!((a.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn software_clock_sync_recomputes_drift() {
        let mut aligner = Aligner::new(AlignmentStrategy::SoftwareTimestamp);
        // Two syncs 1 s apart; offset grows by 100 µs → drift 1e-4.
        aligner.update_clock_sync("sim", 2_000_000, 1_000_000);
        aligner.update_clock_sync("sim", 3_000_100, 2_000_000);
        let state = aligner.software.get("sim").copied().unwrap();
        assert!((state.drift - 1e-4).abs() < 1e-9);
        assert!((state.offset_us - 1_000_100.0).abs() < 1e-6);

        let s = sample("sim", 5_000_000, 0, 1);
        let a = aligner.align(&s, 5_000_000, 50_000, None);
        assert!(a.aligned_ts_us > s.capture_ts_us);
        assert!((a.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn buffer_confidence_scales_with_distance() {
        let s = sample("face", 1_030_000, 0, 1);
        let a = Aligner::align_buffer(&s, 1_000_000, 50_000);
        assert_eq!(a.aligned_ts_us, 1_000_000);
        assert_eq!(a.offset_us.abs(), 30_000);
        assert!((a.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn event_driven_snaps_within_window() {
        let mut aligner = Aligner::new(AlignmentStrategy::EventDriven);
        aligner.record_event("stimulus", 1_000_000);

        let near = sample("gaze", 1_040_000, 0, 1);
        let a = aligner.align(&near, 0, 0, Some("stimulus"));
        assert_eq!(a.aligned_ts_us, 1_000_000);
        assert!((a.confidence - 0.9).abs() < f64::EPSILON);

        let far = sample("gaze", 2_000_000, 0, 2);
        let b = aligner.align(&far, 0, 0, Some("stimulus"));
        assert_eq!(b.aligned_ts_us, far.capture_ts_us);
        assert!((b.confidence - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn event_ring_expires_after_retention() {
        let mut aligner = Aligner::new(AlignmentStrategy::EventDriven);
        aligner.record_event("old", 1_000_000);
        aligner.record_event("new", 1_000_000 + EVENT_RETENTION_US + 1);
        assert_eq!(aligner.events.len(), 1);
        assert_eq!(aligner.events.front().unwrap().0, "new");
    }

    #[test]
    fn quality_reports_strategy_defaults() {
        let hw = Aligner::new(AlignmentStrategy::HardwareTimestamp).quality();
        assert!((hw.alignment_accuracy_ms - 1.0).abs() < f64::EPSILON);
        let ev = Aligner::new(AlignmentStrategy::EventDriven).quality();
        assert!((ev.quality - 0.5).abs() < f64::EPSILON);
    }
}
