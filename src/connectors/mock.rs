//! Deterministic synthetic telemetry generator.
//!
//! Used when a connector's native transport is unavailable and
//! `fallback_to_mock` is enabled. Frames follow a smooth circular path with
//! seeded jitter so repeated runs produce identical streams.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::models::{
    now_us, ControlState, PerformanceState, SimulatorKind, TelemetryFrame, VehicleState,
};

use super::{ConnectionState, ConnectorCore, DataMode};

pub struct MockTelemetry {
    simulator: SimulatorKind,
    source_id: String,
    rng: StdRng,
    tick: u64,
}

impl MockTelemetry {
    pub fn new(simulator: SimulatorKind, source_id: impl Into<String>, seed: u64) -> Self {
        Self {
            simulator,
            source_id: source_id.into(),
            rng: StdRng::seed_from_u64(seed),
            tick: 0,
        }
    }

    /// Produce the next frame along the synthetic path.
    pub fn next_frame(&mut self, sequence: u64) -> TelemetryFrame {
        self.tick += 1;
        let t = self.tick as f64 / 30.0;
        let jitter = self.rng.gen_range(-0.05..0.05);

        // A lazy circle: plausible coordinates for flight sims, reused as
        // world units for driving sims.
        let (cx, cy, altitude, speed) = match self.simulator {
            SimulatorKind::Msfs | SimulatorKind::XPlane | SimulatorKind::Vatsim => {
                (47.43, -122.3, 1500.0 + 50.0 * (t / 10.0).sin(), 120.0)
            }
            SimulatorKind::BeamNg => (0.0, 0.0, 0.2, 27.0),
        };
        let radius = 0.02;
        let heading = (t * 6.0) % 360.0;

        TelemetryFrame {
            timestamp: now_us(),
            sequence,
            source_id: self.source_id.clone(),
            simulator: self.simulator.as_str().to_string(),
            vehicle: VehicleState {
                position: [
                    cx + radius * (t / 10.0).cos(),
                    cy + radius * (t / 10.0).sin(),
                    altitude,
                ],
                velocity: [
                    speed * heading.to_radians().cos(),
                    speed * heading.to_radians().sin(),
                    0.0,
                ],
                rotation: [0.0, 0.0, (heading.to_radians() / 2.0).sin(), (heading.to_radians() / 2.0).cos()],
                heading,
            },
            controls: ControlState {
                throttle: 0.65 + jitter,
                brake: 0.0,
                steering: (t / 5.0).sin() * 0.1,
                gear: 1,
                custom: HashMap::new(),
            },
            performance: PerformanceState {
                speed: speed + jitter * 10.0,
                fuel: (100.0 - t * 0.01).max(0.0),
                engine_rpm: 2200.0 + 300.0 * (t / 3.0).sin(),
                damage: 0.0,
            },
            environment: None,
            metadata: HashMap::from([("data_mode".to_string(), "mock".to_string())]),
        }
    }
}

/// Drive a connector core from the mock generator until it stops running.
///
/// Marks the connector connected in mock mode, emits frames at the configured
/// update rate, and returns when `stop_running` is observed.
pub async fn run_mock_loop(core: Arc<ConnectorCore>, mut mock: MockTelemetry) {
    info!(
        connector = %core.config.id,
        simulator = core.simulator.as_str(),
        rate_hz = core.config.update_rate_hz,
        "📡 Mock telemetry active"
    );
    core.set_data_mode(DataMode::Mock);
    core.set_state(ConnectionState::Connected);

    let mut ticker = tokio::time::interval(core.frame_interval());
    while core.is_running() {
        ticker.tick().await;
        if !core.is_running() {
            break;
        }
        let seq = core.next_seq();
        core.emit_frame(mock.next_frame(seq));
    }
    core.set_state(ConnectionState::Disconnected);
}
