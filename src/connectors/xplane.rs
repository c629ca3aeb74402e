//! X-Plane connector over its UDP DataRef interface (default port 49000).
//!
//! Subscriptions go out as RREF packets: `"RREF\0"` + freq(u32 LE) +
//! index(u32 LE) + dataref name + NUL. The sim answers with `"RREF"`-tagged
//! datagrams carrying (index, f32) pairs. Writes use DREF packets.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{
    now_us, Command, CommandResult, ControlState, PerformanceState, SimulatorKind, TelemetryFrame,
    VehicleState,
};

use super::mock::{run_mock_loop, MockTelemetry};
use super::{
    CapabilityDescriptor, CapabilityEntry, ConnectionState, ConnectorConfig, ConnectorCore,
    ConnectorEvent, ConnectorStatus, DataMode, SimulatorConnector,
};

/// Default DataRef subscription set, in index order.
pub const DATAREFS: &[&str] = &[
    "sim/flightmodel/position/latitude",
    "sim/flightmodel/position/longitude",
    "sim/flightmodel/position/elevation",
    "sim/flightmodel/position/psi",
    "sim/flightmodel/position/indicated_airspeed",
    "sim/flightmodel/position/vh_ind",
    "sim/flightmodel/controls/throttle_ratio",
    "sim/flightmodel/controls/rudder_deflection_aero",
];

/// Build an RREF subscription packet.
pub fn rref_packet(freq_hz: u32, index: u32, dataref: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + 8 + dataref.len() + 1);
    buf.extend_from_slice(b"RREF\0");
    buf.extend_from_slice(&freq_hz.to_le_bytes());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(dataref.as_bytes());
    buf.push(0);
    buf
}

/// Build a DREF write packet: value then the 500-byte padded dataref name.
pub fn dref_packet(value: f32, dataref: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + 4 + 500);
    buf.extend_from_slice(b"DREF\0");
    buf.extend_from_slice(&value.to_le_bytes());
    let bytes = dataref.as_bytes();
    let n = bytes.len().min(499);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(5 + 4 + 500, 0);
    buf
}

/// Parse an RREF response: `"RREF"` + 1 pad byte, then (u32 index, f32 value)
/// pairs.
pub fn parse_rref_response(datagram: &[u8]) -> Option<Vec<(u32, f32)>> {
    if datagram.len() < 5 || &datagram[..4] != b"RREF" {
        return None;
    }
    let mut pairs = Vec::new();
    let mut at = 5;
    while at + 8 <= datagram.len() {
        let index = u32::from_le_bytes(datagram[at..at + 4].try_into().unwrap());
        let value = f32::from_le_bytes(datagram[at + 4..at + 8].try_into().unwrap());
        pairs.push((index, value));
        at += 8;
    }
    Some(pairs)
}

#[derive(Debug, Clone)]
pub struct XPlaneConfig {
    pub host: String,
    pub port: u16,
    /// Subscription frequency requested from the sim.
    pub rref_frequency_hz: u32,
    pub connector: ConnectorConfig,
}

impl Default for XPlaneConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 49000,
            rref_frequency_hz: 30,
            connector: ConnectorConfig::default(),
        }
    }
}

pub struct XPlaneConnector {
    config: XPlaneConfig,
    core: Arc<ConnectorCore>,
    /// Latest value per dataref index.
    values: RwLock<HashMap<u32, f32>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl XPlaneConnector {
    pub fn new(config: XPlaneConfig) -> Arc<Self> {
        let core = Arc::new(ConnectorCore::new(SimulatorKind::XPlane, config.connector.clone()));
        Arc::new(Self {
            config,
            core,
            values: RwLock::new(HashMap::new()),
            socket: Mutex::new(None),
        })
    }

    fn build_frame(&self, sequence: u64) -> TelemetryFrame {
        let values = self.values.read();
        let get = |i: u32| values.get(&i).copied().unwrap_or(0.0) as f64;
        let mut custom = HashMap::new();
        custom.insert("rudder_deflection".to_string(), get(7));
        TelemetryFrame {
            timestamp: now_us(),
            sequence,
            source_id: self.core.config.id.clone(),
            simulator: SimulatorKind::XPlane.as_str().to_string(),
            vehicle: VehicleState {
                position: [get(0), get(1), get(2)],
                velocity: [0.0, 0.0, get(5)],
                rotation: [0.0, 0.0, 0.0, 1.0],
                heading: get(3).rem_euclid(360.0),
            },
            controls: ControlState {
                throttle: get(6),
                brake: 0.0,
                steering: 0.0,
                gear: 0,
                custom,
            },
            performance: PerformanceState {
                speed: get(4),
                fuel: 0.0,
                engine_rpm: 0.0,
                damage: 0.0,
            },
            environment: None,
            metadata: HashMap::new(),
        }
    }

    async fn subscribe_datarefs(&self, socket: &UdpSocket) -> Result<()> {
        for (index, dataref) in DATAREFS.iter().enumerate() {
            let pkt = rref_packet(self.config.rref_frequency_hz, index as u32, dataref);
            socket.send(&pkt).await?;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let bind = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect((self.config.host.as_str(), self.config.port)).await?;
            Ok::<_, std::io::Error>(socket)
        };

        let socket = match bind.await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "x-plane udp bind failed");
                if self.core.config.fallback_to_mock {
                    let mock =
                        MockTelemetry::new(SimulatorKind::XPlane, self.core.config.id.clone(), 0xA11);
                    run_mock_loop(Arc::clone(&self.core), mock).await;
                } else {
                    self.core.set_state(ConnectionState::Disconnected);
                    self.core.stop_running();
                }
                return;
            }
        };

        self.core.set_state(ConnectionState::Connecting);
        if let Err(e) = self.subscribe_datarefs(&socket).await {
            warn!(error = %e, "x-plane subscription failed");
            if self.core.config.fallback_to_mock {
                let mock = MockTelemetry::new(SimulatorKind::XPlane, self.core.config.id.clone(), 0xA11);
                run_mock_loop(Arc::clone(&self.core), mock).await;
            } else {
                self.core.set_state(ConnectionState::Disconnected);
                self.core.stop_running();
            }
            return;
        }

        *self.socket.lock() = Some(Arc::clone(&socket));
        self.core.set_data_mode(DataMode::Native);

        // UDP has no session; consider ourselves connected on first datagram
        // and stale after a missed interval budget. A sim that never answers
        // within the connect timeout counts as a failed native init.
        let mut buf = vec![0u8; 2048];
        let mut ticker = tokio::time::interval(self.core.frame_interval());
        let mut last_datagram_us: Option<u64> = None;
        let stale_after_us = 10 * self.core.frame_interval().as_micros() as u64;
        let started_us = now_us();
        let first_datagram_deadline_us = self.core.config.connect_timeout.as_micros() as u64;

        while self.core.is_running() {
            tokio::select! {
                received = socket.recv(&mut buf) => {
                    match received {
                        Ok(n) => {
                            self.core.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                            match parse_rref_response(&buf[..n]) {
                                Some(pairs) => {
                                    last_datagram_us = Some(now_us());
                                    if self.core.state() != ConnectionState::Connected {
                                        self.core.set_state(ConnectionState::Connected);
                                    }
                                    let mut values = self.values.write();
                                    for (index, value) in pairs {
                                        values.insert(index, value);
                                    }
                                }
                                None => {
                                    self.core.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "x-plane recv error");
                        }
                    }
                }
                _ = ticker.tick() => {
                    match last_datagram_us {
                        Some(at) if now_us().saturating_sub(at) < stale_after_us => {
                            let seq = self.core.next_seq();
                            self.core.emit_frame(self.build_frame(seq));
                        }
                        Some(_) => {
                            // Data dried up; resubscribe.
                            if self.core.state() == ConnectionState::Connected {
                                self.core.set_state(ConnectionState::Reconnecting);
                                self.core.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            }
                            let _ = self.subscribe_datarefs(&socket).await;
                        }
                        None => {
                            if now_us().saturating_sub(started_us) > first_datagram_deadline_us {
                                warn!("x-plane never answered the subscription");
                                *self.socket.lock() = None;
                                if self.core.config.fallback_to_mock {
                                    let mock = MockTelemetry::new(
                                        SimulatorKind::XPlane,
                                        self.core.config.id.clone(),
                                        0xA11,
                                    );
                                    run_mock_loop(Arc::clone(&self.core), mock).await;
                                } else {
                                    self.core.set_state(ConnectionState::Disconnected);
                                    self.core.stop_running();
                                }
                                return;
                            }
                        }
                    }
                }
            }
        }

        *self.socket.lock() = None;
        self.core.set_state(ConnectionState::Disconnected);
    }

    fn command_dataref(command: &Command) -> Result<&'static str> {
        match (command.kind.as_str(), command.action.as_str()) {
            ("flight-controls", "set-throttle") => Ok("sim/flightmodel/controls/throttle_ratio"),
            ("flight-controls", "set-rudder") => {
                Ok("sim/flightmodel/controls/rudder_deflection_aero")
            }
            _ => Err(Error::validation(format!(
                "unsupported x-plane command {}:{}",
                command.kind, command.action
            ))),
        }
    }
}

#[async_trait]
impl SimulatorConnector for XPlaneConnector {
    fn id(&self) -> &str {
        &self.core.config.id
    }

    fn simulator(&self) -> SimulatorKind {
        SimulatorKind::XPlane
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
            let mock = MockTelemetry::new(SimulatorKind::XPlane, self.core.config.id.clone(), 0xA11);
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
            simulator: SimulatorKind::XPlane,
            telemetry: true,
            bidirectional: true,
            commands: vec![
                CapabilityEntry { kind: "flight-controls".into(), action: "set-throttle".into() },
                CapabilityEntry { kind: "flight-controls".into(), action: "set-rudder".into() },
            ],
        }
    }

    async fn send_command(&self, command: Command) -> Result<CommandResult> {
        let socket = self.socket.lock().clone();
        let result = match socket {
            Some(socket) => {
                let dataref = match Self::command_dataref(&command) {
                    Ok(d) => d,
                    Err(e) => {
                        self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
                        let result = CommandResult::failed(command.id.clone(), e.to_string());
                        self.core.emit_command_event(&result);
                        return Ok(result);
                    }
                };
                let value = command
                    .parameters
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as f32;
                match socket.send(&dref_packet(value, dataref)).await {
                    Ok(_) => {
                        self.core.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
                        CommandResult::ok(command.id.clone())
                    }
                    Err(e) => {
                        self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
                        CommandResult::failed(command.id.clone(), e.to_string())
                    }
                }
            }
            None => {
                self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
                CommandResult::failed(command.id.clone(), "not connected")
            }
        };
        self.core.emit_command_event(&result);
        Ok(result)
    }

    fn queue_command(&self, command: Command) {
        self.core.queue_command(command);
    }

    fn clear_command_queue(&self) -> usize {
        self.core.clear_commands()
    }
}
