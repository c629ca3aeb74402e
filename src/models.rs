//! Canonical data model shared by every subsystem: samples, aligned tuples,
//! telemetry frames, commands.
//!
//! Payload internals are opaque to the core; the `StreamKind` tag is what
//! routing and alignment decisions are made on.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Monotonic microsecond timestamp measured from process start.
///
/// Used for all ordering and window bookkeeping. Wall-clock time only ever
/// appears at ingest/egress boundaries and in human-readable API responses.
#[inline]
pub fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// Stream kinds — closed enumeration, doubles as the event-routing key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Gaze,
    Face,
    Telemetry,
    Event,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Gaze => "gaze",
            StreamKind::Face => "face",
            StreamKind::Telemetry => "telemetry",
            StreamKind::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gaze" => Some(StreamKind::Gaze),
            "face" => Some(StreamKind::Face),
            "telemetry" => Some(StreamKind::Telemetry),
            "event" => Some(StreamKind::Event),
            _ => None,
        }
    }
}

/// A single detected face within a video frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    /// Normalized [x, y, width, height] in frame coordinates.
    pub bbox: [f64; 4],
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<[f64; 2]>>,
}

/// Typed payload sum over stream kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplePayload {
    Gaze {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pupil_diameter: Option<f64>,
    },
    Face {
        faces: Vec<FaceDetection>,
    },
    Telemetry(TelemetryFrame),
    Event {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl SamplePayload {
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            SamplePayload::Gaze { .. } => StreamKind::Gaze,
            SamplePayload::Face { .. } => StreamKind::Face,
            SamplePayload::Telemetry(_) => StreamKind::Telemetry,
            SamplePayload::Event { .. } => StreamKind::Event,
        }
    }
}

/// The atomic stream element.
///
/// Invariants (enforced at the buffer boundary): within one source,
/// `seq` is strictly increasing and `capture_ts_us` is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub source_id: String,
    pub kind: StreamKind,
    /// Monotonic microseconds from the producer; may be hardware-generated.
    pub capture_ts_us: u64,
    /// Monotonic microseconds assigned on arrival; 0 = not yet ingested.
    #[serde(default)]
    pub ingest_ts_us: u64,
    pub payload: SamplePayload,
    /// Higher is better, 0 = unusable. Absent when the device has no notion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub seq: u64,
}

impl Sample {
    pub fn new(
        source_id: impl Into<String>,
        capture_ts_us: u64,
        seq: u64,
        payload: SamplePayload,
    ) -> Self {
        let kind = payload.stream_kind();
        Self {
            source_id: source_id.into(),
            kind,
            capture_ts_us,
            ingest_ts_us: 0,
            payload,
            confidence: None,
            seq,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// One source's contribution to an aligned tuple.
#[derive(Debug, Clone, Serialize)]
pub struct AlignedSample {
    pub sample: Sample,
    /// aligned_ts_us − capture_ts_us, in microseconds (signed).
    pub offset_us: i64,
    /// Estimated clock drift for this source, µs per sample.
    pub drift_estimate: f64,
    /// Alignment confidence for this source alone.
    pub confidence: f64,
}

/// One sample per participating source, mapped to a common timestamp.
///
/// Every member satisfies |capture_ts − aligned_ts| ≤ tolerance; sources
/// without a sample inside the tolerance window are omitted.
#[derive(Debug, Clone, Serialize)]
pub struct AlignedTuple {
    pub aligned_ts_us: u64,
    /// Overall tuple confidence (minimum over participating sources).
    pub confidence: f64,
    pub sources: HashMap<String, AlignedSample>,
}

impl AlignedTuple {
    pub fn get(&self, source_id: &str) -> Option<&AlignedSample> {
        self.sources.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Synchronization quality metrics, mutated only by the sync engine at the
/// end of each alignment pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub quality: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub dropped_samples: u64,
    pub alignment_accuracy_ms: f64,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            quality: 1.0,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            dropped_samples: 0,
            alignment_accuracy_ms: 0.0,
        }
    }
}

impl SyncMetrics {
    /// quality = max(0, 1 − min(jitter/100, 0.3) − min(dropped/1000, 0.4)
    ///                  − min(latency/1000, 0.2))
    pub fn recompute_quality(&mut self) {
        let jitter_penalty = (self.jitter_ms / 100.0).min(0.3);
        let drop_penalty = (self.dropped_samples as f64 / 1000.0).min(0.4);
        let latency_penalty = (self.latency_ms / 1000.0).min(0.2);
        self.quality = (1.0 - jitter_penalty - drop_penalty - latency_penalty).max(0.0);
    }
}

/// Simulator kinds supported by the connector framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulatorKind {
    Msfs,
    XPlane,
    Vatsim,
    BeamNg,
}

impl SimulatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulatorKind::Msfs => "msfs",
            SimulatorKind::XPlane => "x-plane",
            SimulatorKind::Vatsim => "vatsim",
            SimulatorKind::BeamNg => "beamng",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msfs" | "simconnect" => Some(SimulatorKind::Msfs),
            "x-plane" | "xplane" => Some(SimulatorKind::XPlane),
            "vatsim" => Some(SimulatorKind::Vatsim),
            "beamng" | "beamng-drive" => Some(SimulatorKind::BeamNg),
            _ => None,
        }
    }
}

/// Vehicle kinematic state within a telemetry frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleState {
    /// [x, y, z] — latitude/longitude/altitude for flight sims, world
    /// coordinates for driving sims.
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    /// Quaternion [x, y, z, w].
    pub rotation: [f64; 4],
    /// Degrees, 0–360.
    pub heading: f64,
}

/// Control inputs within a telemetry frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlState {
    pub throttle: f64,
    pub brake: f64,
    pub steering: f64,
    pub gear: i32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, f64>,
}

/// Performance readouts within a telemetry frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceState {
    pub speed: f64,
    pub fuel: f64,
    pub engine_rpm: f64,
    pub damage: f64,
}

/// Canonical normalized frame emitted by every simulator connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Monotonic microseconds at normalization time.
    pub timestamp: u64,
    pub sequence: u64,
    pub source_id: String,
    pub simulator: String,
    pub vehicle: VehicleState,
    pub controls: ControlState,
    pub performance: PerformanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Command priority for the connector command path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// A typed command shipped to a simulator over its native transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    /// Command family, e.g. "flight-controls", "simulation".
    pub kind: String,
    /// Concrete action within the family, e.g. "set-throttle".
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub priority: CommandPriority,
}

impl Command {
    pub fn new(
        kind: impl Into<String>,
        action: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            action: action.into(),
            parameters,
            priority: CommandPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of a command delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    /// RFC 3339 wall-clock time of execution (egress boundary).
    pub executed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            executed_at: chrono::Utc::now().to_rfc3339(),
            error: None,
        }
    }

    pub fn failed(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            executed_at: chrono::Utc::now().to_rfc3339(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[test]
    fn payload_kind_matches_sample_kind() {
        let s = Sample::new(
            "gaze-0",
            1000,
            1,
            SamplePayload::Gaze { x: 0.5, y: 0.5, pupil_diameter: None },
        );
        assert_eq!(s.kind, StreamKind::Gaze);
        assert_eq!(s.kind.as_str(), "gaze");
    }

    #[test]
    fn quality_formula_penalties_cap() {
        let mut m = SyncMetrics {
            quality: 1.0,
            latency_ms: 10_000.0,
            jitter_ms: 10_000.0,
            dropped_samples: 1_000_000,
            alignment_accuracy_ms: 0.0,
        };
        m.recompute_quality();
        // Penalties cap at 0.3 + 0.4 + 0.2 = 0.9.
        assert!((m.quality - 0.1).abs() < 1e-9);
    }

    #[test]
    fn stream_kind_round_trips_through_str() {
        for kind in [StreamKind::Gaze, StreamKind::Face, StreamKind::Telemetry, StreamKind::Event] {
            assert_eq!(StreamKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn confidence_is_clamped() {
        let s = Sample::new("g", 0, 1, SamplePayload::Gaze { x: 0.0, y: 0.0, pupil_diameter: None })
            .with_confidence(1.7);
        assert_eq!(s.confidence, Some(1.0));
    }
}
