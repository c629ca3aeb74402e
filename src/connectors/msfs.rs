//! MSFS connector speaking the SimConnect binary protocol over TCP.
//!
//! Frame layout: a 16-byte little-endian header `{size, version, id,
//! call_index}` followed by the message body. Protocol version 4
//! (SP2/Acceleration). Only the subset needed for flight telemetry and
//! basic commands is implemented: data definitions, sim-object data
//! requests, system event subscription, and set-data writes.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{
    now_us, Command, CommandResult, ControlState, PerformanceState, SimulatorKind, TelemetryFrame,
    VehicleState,
};

use super::mock::{run_mock_loop, MockTelemetry};
use super::{
    Backoff, CapabilityDescriptor, CapabilityEntry, ConnectionState, ConnectorConfig,
    ConnectorCore, ConnectorEvent, ConnectorStatus, DataMode, SimulatorConnector,
};

/// SP2/Acceleration protocol version.
pub const PROTOCOL_VERSION: u32 = 4;
pub const HEADER_SIZE: usize = 16;

/// Server → client message ids.
pub mod recv_id {
    pub const NULL: u32 = 0;
    pub const EXCEPTION: u32 = 1;
    pub const OPEN: u32 = 2;
    pub const QUIT: u32 = 3;
    pub const EVENT: u32 = 4;
    pub const SIMOBJECT_DATA: u32 = 5;
    pub const SIMOBJECT_DATA_BYTYPE: u32 = 6;
    pub const CLIENT_DATA: u32 = 7;
}

/// Client → server request ids.
pub mod request_id {
    pub const REQUEST_DATA_ON_SIM_OBJECT: u32 = 1;
    pub const SET_DATA_ON_SIM_OBJECT: u32 = 2;
    pub const ADD_TO_DATA_DEFINITION: u32 = 6;
    pub const CLEAR_DATA_DEFINITION: u32 = 7;
    pub const SUBSCRIBE_TO_SYSTEM_EVENT: u32 = 8;
}

/// SimConnect data types used by the default flight definition.
pub mod data_type {
    pub const FLOAT64: u32 = 4;
    pub const STRING260: u32 = 10;
    pub const LATLONALT: u32 = 15;
    pub const XYZ: u32 = 16;
}

/// Human-readable names for SimConnect exception codes.
pub fn exception_name(code: u32) -> &'static str {
    match code {
        0 => "NONE",
        1 => "ERROR",
        2 => "SIZE_MISMATCH",
        3 => "UNRECOGNIZED_ID",
        4 => "UNOPENED",
        5 => "VERSION_MISMATCH",
        6 => "TOO_MANY_GROUPS",
        7 => "NAME_UNRECOGNIZED",
        8 => "TOO_MANY_EVENT_NAMES",
        9 => "EVENT_ID_DUPLICATE",
        10 => "TOO_MANY_MAPS",
        11 => "TOO_MANY_OBJECTS",
        12 => "TOO_MANY_REQUESTS",
        13 => "WEATHER_INVALID_PORT",
        14 => "WEATHER_INVALID_METAR",
        _ => "UNKNOWN",
    }
}

/// Default flight data definition, in wire order.
///
/// (SimVar name, units, data type). All FLOAT64.
pub const FLIGHT_DEFINITION: &[(&str, &str)] = &[
    ("PLANE LATITUDE", "degrees"),
    ("PLANE LONGITUDE", "degrees"),
    ("PLANE ALTITUDE", "feet"),
    ("PLANE HEADING DEGREES TRUE", "degrees"),
    ("AIRSPEED INDICATED", "knots"),
    ("VERTICAL SPEED", "feet per minute"),
    ("GENERAL ENG RPM:1", "rpm"),
    ("FUEL TOTAL QUANTITY", "gallons"),
];

const FLIGHT_DEFINE_ID: u32 = 1;
const FLIGHT_REQUEST_ID: u32 = 1;

/// 16-byte message header, little-endian throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub version: u32,
    pub id: u32,
    pub call_index: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.call_index.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::transport(format!("simconnect header truncated: {} bytes", buf.len())));
        }
        Ok(Self {
            size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            call_index: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Build a full message: header + body.
fn message(id: u32, call_index: u32, body: &[u8]) -> Vec<u8> {
    let header = Header {
        size: (HEADER_SIZE + body.len()) as u32,
        version: PROTOCOL_VERSION,
        id,
        call_index,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    out
}

/// Fixed-size 256-byte name field, NUL-padded.
fn name_field(name: &str) -> [u8; 256] {
    let mut field = [0u8; 256];
    let bytes = name.as_bytes();
    let n = bytes.len().min(255);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

/// ADD_TO_DATA_DEFINITION: define_id + datum name + units + type + epsilon.
pub fn add_to_data_definition(call_index: u32, define_id: u32, datum: &str, units: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + 256 + 256 + 8);
    body.extend_from_slice(&define_id.to_le_bytes());
    body.extend_from_slice(&name_field(datum));
    body.extend_from_slice(&name_field(units));
    body.extend_from_slice(&data_type::FLOAT64.to_le_bytes());
    body.extend_from_slice(&0f32.to_le_bytes()); // epsilon
    message(request_id::ADD_TO_DATA_DEFINITION, call_index, &body)
}

/// REQUEST_DATA_ON_SIM_OBJECT for the user aircraft at sim-frame period.
pub fn request_data_on_sim_object(call_index: u32, req: u32, define_id: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(20);
    body.extend_from_slice(&req.to_le_bytes());
    body.extend_from_slice(&define_id.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // object: user aircraft
    body.extend_from_slice(&3u32.to_le_bytes()); // period: sim frame
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    message(request_id::REQUEST_DATA_ON_SIM_OBJECT, call_index, &body)
}

/// SET_DATA_ON_SIM_OBJECT carrying one FLOAT64 datum.
pub fn set_data_on_sim_object(call_index: u32, define_id: u32, value: f64) -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    body.extend_from_slice(&define_id.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // object: user aircraft
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.extend_from_slice(&1u32.to_le_bytes()); // array count
    body.extend_from_slice(&8u32.to_le_bytes()); // unit size
    body.extend_from_slice(&value.to_le_bytes());
    message(request_id::SET_DATA_ON_SIM_OBJECT, call_index, &body)
}

pub fn subscribe_to_system_event(call_index: u32, event_id: u32, event_name: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + 256);
    body.extend_from_slice(&event_id.to_le_bytes());
    body.extend_from_slice(&name_field(event_name));
    message(request_id::SUBSCRIBE_TO_SYSTEM_EVENT, call_index, &body)
}

/// SIMOBJECT_DATA body: request id, object id, define id, count, then the
/// f64 datum block in definition order.
pub fn parse_simobject_data(body: &[u8], expected_datums: usize) -> Result<Vec<f64>> {
    const PREFIX: usize = 16;
    let need = PREFIX + expected_datums * 8;
    if body.len() < need {
        return Err(Error::transport(format!(
            "simobject data truncated: {} < {need}",
            body.len()
        )));
    }
    let mut values = Vec::with_capacity(expected_datums);
    for i in 0..expected_datums {
        let at = PREFIX + i * 8;
        values.push(f64::from_le_bytes(body[at..at + 8].try_into().unwrap()));
    }
    Ok(values)
}

#[derive(Debug, Clone)]
pub struct MsfsConfig {
    pub host: String,
    pub port: u16,
    pub connector: ConnectorConfig,
}

impl Default for MsfsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4504,
            connector: ConnectorConfig::default(),
        }
    }
}

pub struct MsfsConnector {
    config: MsfsConfig,
    core: Arc<ConnectorCore>,
    command_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    call_index: std::sync::atomic::AtomicU32,
}

impl MsfsConnector {
    pub fn new(config: MsfsConfig) -> Arc<Self> {
        let core = Arc::new(ConnectorCore::new(SimulatorKind::Msfs, config.connector.clone()));
        Arc::new(Self {
            config,
            core,
            command_tx: Mutex::new(None),
            call_index: std::sync::atomic::AtomicU32::new(1),
        })
    }

    fn next_call_index(&self) -> u32 {
        self.call_index.fetch_add(1, Ordering::Relaxed)
    }

    fn normalize(&self, values: &[f64], sequence: u64) -> TelemetryFrame {
        let get = |i: usize| values.get(i).copied().unwrap_or(0.0);
        TelemetryFrame {
            timestamp: now_us(),
            sequence,
            source_id: self.core.config.id.clone(),
            simulator: SimulatorKind::Msfs.as_str().to_string(),
            vehicle: VehicleState {
                position: [get(0), get(1), get(2)],
                // Vertical speed arrives in ft/min; expose ft/s on the z axis.
                velocity: [0.0, 0.0, get(5) / 60.0],
                rotation: [0.0, 0.0, 0.0, 1.0],
                heading: get(3).rem_euclid(360.0),
            },
            controls: ControlState::default(),
            performance: PerformanceState {
                speed: get(4),
                fuel: get(7),
                engine_rpm: get(6),
                damage: 0.0,
            },
            environment: None,
            metadata: HashMap::new(),
        }
    }

    /// Send the data definition and subscribe to sim-object updates.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        for (datum, units) in FLIGHT_DEFINITION {
            let msg = add_to_data_definition(self.next_call_index(), FLIGHT_DEFINE_ID, datum, units);
            stream.write_all(&msg).await?;
        }
        let req = request_data_on_sim_object(self.next_call_index(), FLIGHT_REQUEST_ID, FLIGHT_DEFINE_ID);
        stream.write_all(&req).await?;
        let sub = subscribe_to_system_event(self.next_call_index(), 1, "SimStart");
        stream.write_all(&sub).await?;
        Ok(())
    }

    async fn stream_session(&self, mut stream: TcpStream) -> Result<()> {
        self.handshake(&mut stream).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Vec<u8>>(64);
        *self.command_tx.lock() = Some(cmd_tx);
        self.drain_queued_commands().await;

        let mut header_buf = [0u8; HEADER_SIZE];
        loop {
            tokio::select! {
                read = read_half.read_exact(&mut header_buf) => {
                    if read.is_err() {
                        break;
                    }
                    let header = Header::decode(&header_buf)?;
                    if header.size < HEADER_SIZE as u32 || header.size > 1 << 20 {
                        return Err(Error::transport(format!("bad simconnect frame size {}", header.size)));
                    }
                    let mut body = vec![0u8; header.size as usize - HEADER_SIZE];
                    read_half.read_exact(&mut body).await?;
                    self.core.stats.bytes_received.fetch_add(header.size as u64, Ordering::Relaxed);
                    self.handle_message(header, &body);
                    if header.id == recv_id::QUIT {
                        info!("simconnect peer quit");
                        break;
                    }
                }
                Some(payload) = cmd_rx.recv() => {
                    if let Err(e) = write_half.write_all(&payload).await {
                        warn!(error = %e, "simconnect write error");
                        break;
                    }
                }
            }
            if !self.core.is_running() {
                break;
            }
        }
        *self.command_tx.lock() = None;
        Ok(())
    }

    fn handle_message(&self, header: Header, body: &[u8]) {
        match header.id {
            recv_id::OPEN => info!("simconnect open acknowledged"),
            recv_id::EXCEPTION => {
                let code = body
                    .get(0..4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .unwrap_or(0);
                warn!(code, name = exception_name(code), "simconnect exception");
                self.core.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            }
            recv_id::SIMOBJECT_DATA | recv_id::SIMOBJECT_DATA_BYTYPE => {
                match parse_simobject_data(body, FLIGHT_DEFINITION.len()) {
                    Ok(values) => {
                        let seq = self.core.next_seq();
                        self.core.emit_frame(self.normalize(&values, seq));
                    }
                    Err(e) => {
                        self.core.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %e, "simobject data parse error");
                    }
                }
            }
            recv_id::EVENT | recv_id::CLIENT_DATA | recv_id::NULL => {}
            other => debug!(id = other, "unhandled simconnect message"),
        }
    }

    async fn drain_queued_commands(&self) {
        for command in self.core.drain_commands() {
            let _ = self.send_command(command).await;
        }
    }

    /// Map a typed command to SET_DATA_ON_SIM_OBJECT wire bytes.
    fn encode_command(&self, command: &Command) -> Result<Vec<u8>> {
        let value = command
            .parameters
            .get("value")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::validation("command requires numeric 'value' parameter"))?;
        // One define id per writable datum, allocated after the flight block.
        let define_id = match (command.kind.as_str(), command.action.as_str()) {
            ("flight-controls", "set-throttle") => 10,
            ("flight-controls", "set-heading") => 11,
            ("simulation", "set-altitude") => 12,
            _ => {
                return Err(Error::validation(format!(
                    "unsupported msfs command {}:{}",
                    command.kind, command.action
                )))
            }
        };
        Ok(set_data_on_sim_object(self.next_call_index(), define_id, value))
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(
            self.core.config.reconnect_delay,
            self.core.config.max_reconnect_delay,
        );
        let mut ever_connected = false;

        while self.core.is_running() {
            self.core.set_state(ConnectionState::Connecting);

            let addr = format!("{}:{}", self.config.host, self.config.port);
            let attempt = self
                .core
                .with_connect_timeout(async {
                    TcpStream::connect(&addr)
                        .await
                        .map_err(|e| Error::transport(format!("simconnect connect: {e}")))
                })
                .await;

            match attempt {
                Ok(stream) => {
                    ever_connected = true;
                    backoff.reset();
                    self.core.set_data_mode(DataMode::Native);
                    self.core.set_state(ConnectionState::Connected);
                    if let Err(e) = self.stream_session(stream).await {
                        warn!(error = %e, "simconnect session ended");
                    }
                }
                Err(e) => warn!(error = %e, "simconnect connect failed"),
            }

            if !self.core.is_running() {
                break;
            }

            if !ever_connected {
                if self.core.config.fallback_to_mock {
                    warn!("simconnect unavailable, falling back to mock");
                    let mock =
                        MockTelemetry::new(SimulatorKind::Msfs, self.core.config.id.clone(), 0x5151);
                    run_mock_loop(Arc::clone(&self.core), mock).await;
                    return;
                }
                self.core.set_state(ConnectionState::Disconnected);
                self.core.stop_running();
                return;
            }

            if !self.core.config.auto_reconnect {
                self.core.set_state(ConnectionState::Disconnected);
                self.core.stop_running();
                return;
            }

            self.core.set_state(ConnectionState::Reconnecting);
            self.core.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(backoff.next_delay()).await;
        }

        self.core.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl SimulatorConnector for MsfsConnector {
    fn id(&self) -> &str {
        &self.core.config.id
    }

    fn simulator(&self) -> SimulatorKind {
        SimulatorKind::Msfs
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
            let mock = MockTelemetry::new(SimulatorKind::Msfs, self.core.config.id.clone(), 0x5151);
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
            simulator: SimulatorKind::Msfs,
            telemetry: true,
            bidirectional: true,
            commands: vec![
                CapabilityEntry { kind: "flight-controls".into(), action: "set-throttle".into() },
                CapabilityEntry { kind: "flight-controls".into(), action: "set-heading".into() },
                CapabilityEntry { kind: "simulation".into(), action: "set-altitude".into() },
            ],
        }
    }

    async fn send_command(&self, command: Command) -> Result<CommandResult> {
        let payload = match self.encode_command(&command) {
            Ok(p) => p,
            Err(e) => {
                self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
                let result = CommandResult::failed(command.id.clone(), e.to_string());
                self.core.emit_command_event(&result);
                return Ok(result);
            }
        };

        let tx = self.command_tx.lock().clone();
        let result = match tx {
            Some(tx) if self.is_connected() => match tx.send(payload).await {
                Ok(()) => {
                    self.core.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
                    CommandResult::ok(command.id.clone())
                }
                Err(_) => {
                    self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
                    CommandResult::failed(command.id.clone(), "command channel closed")
                }
            },
            _ => {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = Header {
            size: 1234,
            version: PROTOCOL_VERSION,
            id: recv_id::SIMOBJECT_DATA,
            call_index: 42,
        };
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn add_to_data_definition_layout() {
        let msg = add_to_data_definition(7, FLIGHT_DEFINE_ID, "PLANE LATITUDE", "degrees");
        let header = Header::decode(&msg).unwrap();
        assert_eq!(header.id, request_id::ADD_TO_DATA_DEFINITION);
        assert_eq!(header.version, 4);
        assert_eq!(header.size as usize, msg.len());
        // define id immediately after the header
        assert_eq!(
            u32::from_le_bytes(msg[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap()),
            FLIGHT_DEFINE_ID
        );
        // datum name is NUL-padded at a fixed offset
        assert!(msg[HEADER_SIZE + 4..].starts_with(b"PLANE LATITUDE\0"));
    }

    #[test]
    fn simobject_data_parses_datum_block() {
        let mut body = Vec::new();
        body.extend_from_slice(&FLIGHT_REQUEST_ID.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&FLIGHT_DEFINE_ID.to_le_bytes());
        body.extend_from_slice(&(FLIGHT_DEFINITION.len() as u32).to_le_bytes());
        let expect: [f64; 8] = [47.43, -122.3, 1500.0, 270.0, 120.0, -300.0, 2300.0, 42.0];
        for v in expect {
            body.extend_from_slice(&v.to_le_bytes());
        }
        let values = parse_simobject_data(&body, FLIGHT_DEFINITION.len()).unwrap();
        assert_eq!(values, expect);
    }

    #[test]
    fn truncated_simobject_data_is_transport_error() {
        let body = vec![0u8; 20];
        assert!(parse_simobject_data(&body, FLIGHT_DEFINITION.len()).is_err());
    }

    #[test]
    fn normalize_maps_definition_order() {
        let connector = MsfsConnector::new(MsfsConfig::default());
        let values = [47.43, -122.3, 1500.0, 361.0, 120.0, -300.0, 2300.0, 42.0];
        let frame = connector.normalize(&values, 5);
        assert_eq!(frame.vehicle.position, [47.43, -122.3, 1500.0]);
        assert!((frame.vehicle.heading - 1.0).abs() < 1e-9);
        assert_eq!(frame.performance.speed, 120.0);
        assert_eq!(frame.performance.fuel, 42.0);
        assert!((frame.vehicle.velocity[2] + 5.0).abs() < 1e-9);
    }

    #[test]
    fn exception_table_covers_known_codes() {
        assert_eq!(exception_name(5), "VERSION_MISMATCH");
        assert_eq!(exception_name(999), "UNKNOWN");
    }

    #[test]
    fn unsupported_command_is_validation_error() {
        let connector = MsfsConnector::new(MsfsConfig::default());
        let cmd = Command::new("weather", "make-rain", serde_json::json!({"value": 1.0}));
        assert!(matches!(connector.encode_command(&cmd), Err(Error::Validation(_))));
    }
}
