//! VATSIM network connector: polls the public v3 data feed over HTTPS.
//!
//! The feed updates server-side every 15 s, so the poll interval is clamped
//! to never exceed 1/15 Hz. VATSIM is read-only; the command path reports
//! every command as unsupported.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{
    now_us, Command, CommandResult, ControlState, PerformanceState, SimulatorKind, TelemetryFrame,
    VehicleState,
};

use super::mock::{run_mock_loop, MockTelemetry};
use super::{
    CapabilityDescriptor, ConnectionState, ConnectorConfig, ConnectorCore, ConnectorEvent,
    ConnectorStatus, DataMode, SimulatorConnector,
};

pub const VATSIM_DATA_URL: &str = "https://data.vatsim.net/v3/vatsim-data.json";
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize)]
pub struct VatsimFlightPlan {
    #[serde(default)]
    pub departure: String,
    #[serde(default)]
    pub arrival: String,
    #[serde(default)]
    pub aircraft: String,
    #[serde(default)]
    pub cruise_altitude: String,
    #[serde(default)]
    pub route: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VatsimPilot {
    pub cid: u64,
    pub callsign: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i64,
    pub groundspeed: i64,
    pub heading: i64,
    #[serde(default)]
    pub transponder: String,
    #[serde(default)]
    pub flight_plan: Option<VatsimFlightPlan>,
    #[serde(default)]
    pub last_updated: String,
}

#[derive(Debug, Deserialize)]
struct VatsimData {
    pilots: Vec<VatsimPilot>,
}

#[derive(Debug, Clone)]
pub struct VatsimConfig {
    pub url: String,
    pub poll_interval: Duration,
    /// When set, only this callsign is emitted; otherwise the busiest
    /// `max_pilots` are.
    pub callsign: Option<String>,
    pub max_pilots: usize,
    pub connector: ConnectorConfig,
}

impl Default for VatsimConfig {
    fn default() -> Self {
        Self {
            url: VATSIM_DATA_URL.to_string(),
            poll_interval: MIN_POLL_INTERVAL,
            callsign: None,
            max_pilots: 10,
            connector: ConnectorConfig {
                update_rate_hz: 1.0 / 15.0,
                ..Default::default()
            },
        }
    }
}

pub struct VatsimConnector {
    config: VatsimConfig,
    core: Arc<ConnectorCore>,
    client: reqwest::Client,
}

impl VatsimConnector {
    pub fn new(config: VatsimConfig) -> Arc<Self> {
        let core = Arc::new(ConnectorCore::new(SimulatorKind::Vatsim, config.connector.clone()));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Self { config, core, client })
    }

    fn pilot_frame(&self, pilot: &VatsimPilot, sequence: u64) -> TelemetryFrame {
        let mut metadata = HashMap::new();
        metadata.insert("callsign".to_string(), pilot.callsign.clone());
        metadata.insert("cid".to_string(), pilot.cid.to_string());
        metadata.insert("transponder".to_string(), pilot.transponder.clone());
        if let Some(fp) = &pilot.flight_plan {
            metadata.insert("departure".to_string(), fp.departure.clone());
            metadata.insert("arrival".to_string(), fp.arrival.clone());
            metadata.insert("aircraft".to_string(), fp.aircraft.clone());
        }

        let heading = pilot.heading as f64;
        let speed = pilot.groundspeed as f64;
        TelemetryFrame {
            timestamp: now_us(),
            sequence,
            source_id: format!("{}:{}", self.core.config.id, pilot.callsign),
            simulator: SimulatorKind::Vatsim.as_str().to_string(),
            vehicle: VehicleState {
                position: [pilot.latitude, pilot.longitude, pilot.altitude as f64],
                velocity: [
                    speed * heading.to_radians().cos(),
                    speed * heading.to_radians().sin(),
                    0.0,
                ],
                rotation: [0.0, 0.0, 0.0, 1.0],
                heading: heading.rem_euclid(360.0),
            },
            controls: ControlState::default(),
            performance: PerformanceState {
                speed,
                fuel: 0.0,
                engine_rpm: 0.0,
                damage: 0.0,
            },
            environment: None,
            metadata,
        }
    }

    fn select_pilots<'a>(&self, pilots: &'a [VatsimPilot]) -> Vec<&'a VatsimPilot> {
        match &self.config.callsign {
            Some(callsign) => pilots
                .iter()
                .filter(|p| p.callsign.eq_ignore_ascii_case(callsign))
                .collect(),
            None => pilots.iter().take(self.config.max_pilots).collect(),
        }
    }

    async fn poll_once(&self) -> Result<usize> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .map_err(|e| Error::transport(format!("vatsim fetch: {e}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::permanent("vatsim feed refused the request"));
        }
        if !response.status().is_success() {
            return Err(Error::transport(format!("vatsim status {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(format!("vatsim body: {e}")))?;
        self.core.stats.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let data: VatsimData = serde_json::from_slice(&bytes)?;
        let selected = self.select_pilots(&data.pilots);
        let emitted = selected.len();
        for pilot in selected {
            let seq = self.core.next_seq();
            self.core.emit_frame(self.pilot_frame(pilot, seq));
        }
        Ok(emitted)
    }

    async fn run(self: Arc<Self>) {
        let interval = self.config.poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(interval);
        let mut consecutive_failures = 0u32;

        self.core.set_state(ConnectionState::Connecting);

        while self.core.is_running() {
            ticker.tick().await;
            if !self.core.is_running() {
                break;
            }
            match self.poll_once().await {
                Ok(count) => {
                    consecutive_failures = 0;
                    if self.core.state() != ConnectionState::Connected {
                        self.core.set_data_mode(DataMode::Native);
                        self.core.set_state(ConnectionState::Connected);
                    }
                    debug!(pilots = count, "vatsim poll complete");
                }
                Err(Error::Permanent(msg)) => {
                    warn!(%msg, "vatsim permanent failure, stopping");
                    break;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "vatsim poll failed");
                    if consecutive_failures == 1 && self.core.state() == ConnectionState::Connected {
                        self.core.set_state(ConnectionState::Reconnecting);
                        self.core.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    if consecutive_failures >= 3
                        && self.core.stats.frames_emitted.load(Ordering::Relaxed) == 0
                        && self.core.config.fallback_to_mock
                    {
                        warn!("vatsim unreachable, falling back to mock");
                        let mock = MockTelemetry::new(
                            SimulatorKind::Vatsim,
                            self.core.config.id.clone(),
                            0x7A75,
                        );
                        run_mock_loop(Arc::clone(&self.core), mock).await;
                        return;
                    }
                    if !self.core.config.auto_reconnect && consecutive_failures >= 3 {
                        break;
                    }
                }
            }
        }

        self.core.stop_running();
        self.core.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl SimulatorConnector for VatsimConnector {
    fn id(&self) -> &str {
        &self.core.config.id
    }

    fn simulator(&self) -> SimulatorKind {
        SimulatorKind::Vatsim
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        if !self.core.start_running() {
            return Ok(());
        }
        if !self.core.config.use_native_protocol {
            if !self.core.config.fallback_to_mock {
                self.core.stop_running();
                return Err(Error::validation("native protocol disabled and mock fallback off"));
            }
            let mock = MockTelemetry::new(SimulatorKind::Vatsim, self.core.config.id.clone(), 0x7A75);
            tokio::spawn(run_mock_loop(Arc::clone(&self.core), mock));
            return Ok(());
        }
        tokio::spawn(Arc::clone(&self).run());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.core.stop_running();
        self.core.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.core.state() == ConnectionState::Connected
    }

    fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.core.subscribe_frames()
    }

    fn subscribe_to_events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.core.subscribe_events()
    }

    fn get_status(&self) -> ConnectorStatus {
        self.core.status()
    }

    fn get_capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            simulator: SimulatorKind::Vatsim,
            telemetry: true,
            bidirectional: false,
            commands: Vec::new(),
        }
    }

    async fn send_command(&self, command: Command) -> Result<CommandResult> {
        self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
        let result = CommandResult::failed(command.id, "vatsim is a read-only feed");
        self.core.emit_command_event(&result);
        Ok(result)
    }

    fn queue_command(&self, command: Command) {
        // Queued commands can never be delivered; drop with a counter.
        debug!(command = %command.id, "dropping command queued for read-only vatsim");
        self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn clear_command_queue(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pilot_json() -> &'static str {
        r#"{
            "pilots": [
                {
                    "cid": 1234567,
                    "callsign": "BAW123",
                    "latitude": 51.47,
                    "longitude": -0.45,
                    "altitude": 37000,
                    "groundspeed": 460,
                    "heading": 275,
                    "transponder": "2200",
                    "flight_plan": {
                        "departure": "EGLL",
                        "arrival": "KJFK",
                        "aircraft": "B77W",
                        "cruise_altitude": "FL370",
                        "route": "CPT L9 KENET"
                    },
                    "last_updated": "2026-01-01T12:00:00Z"
                },
                {
                    "cid": 7654321,
                    "callsign": "DLH9A",
                    "latitude": 50.03,
                    "longitude": 8.57,
                    "altitude": 0,
                    "groundspeed": 0,
                    "heading": 70,
                    "transponder": "2000",
                    "flight_plan": null,
                    "last_updated": "2026-01-01T12:00:00Z"
                }
            ]
        }"#
    }

    #[test]
    fn parses_pilot_feed() {
        let data: VatsimData = serde_json::from_str(pilot_json()).unwrap();
        assert_eq!(data.pilots.len(), 2);
        let p = &data.pilots[0];
        assert_eq!(p.callsign, "BAW123");
        assert_eq!(p.altitude, 37000);
        assert_eq!(p.flight_plan.as_ref().unwrap().arrival, "KJFK");
    }

    #[test]
    fn callsign_filter_selects_one() {
        let data: VatsimData = serde_json::from_str(pilot_json()).unwrap();
        let connector = VatsimConnector::new(VatsimConfig {
            callsign: Some("baw123".to_string()),
            ..Default::default()
        });
        let selected = connector.select_pilots(&data.pilots);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].callsign, "BAW123");
    }

    #[test]
    fn frame_carries_flight_plan_metadata() {
        let data: VatsimData = serde_json::from_str(pilot_json()).unwrap();
        let connector = VatsimConnector::new(VatsimConfig::default());
        let frame = connector.pilot_frame(&data.pilots[0], 1);
        assert_eq!(frame.metadata.get("departure").map(String::as_str), Some("EGLL"));
        assert_eq!(frame.vehicle.position[2], 37000.0);
        assert!((frame.performance.speed - 460.0).abs() < 1e-9);
        assert!(frame.source_id.ends_with("BAW123"));
    }

    #[test]
    fn poll_interval_clamped_to_feed_cadence() {
        let cfg = VatsimConfig {
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(cfg.poll_interval.max(MIN_POLL_INTERVAL), MIN_POLL_INTERVAL);
    }
}
