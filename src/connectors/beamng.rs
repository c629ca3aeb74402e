//! BeamNG.drive connector: newline-delimited JSON vehicle state over TCP
//! (default port 64256) or UDP datagrams.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeamNgTransport {
    Tcp,
    Udp,
}

#[derive(Debug, Clone)]
pub struct BeamNgConfig {
    pub host: String,
    pub port: u16,
    pub transport: BeamNgTransport,
    pub connector: ConnectorConfig,
}

impl Default for BeamNgConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 64256,
            transport: BeamNgTransport::Tcp,
            connector: ConnectorConfig::default(),
        }
    }
}

/// Raw vehicle-state frame as BeamNG ships it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVehicleState {
    position: [f64; 3],
    velocity: [f64; 3],
    #[serde(default)]
    acceleration: [f64; 3],
    rotation: [f64; 4],
    #[serde(default)]
    wheel_speed: [f64; 4],
    engine_rpm: f64,
    throttle_input: f64,
    brake_input: f64,
    steering_input: f64,
    #[serde(default)]
    clutch_input: f64,
    gear: i32,
    fuel: f64,
    damage: f64,
    #[serde(default)]
    engine_temp: f64,
    #[serde(default)]
    wheel_temp: [f64; 4],
    #[serde(default)]
    tire_pressure: [f64; 4],
}

pub struct BeamNgConnector {
    config: BeamNgConfig,
    core: Arc<ConnectorCore>,
    command_tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl BeamNgConnector {
    pub fn new(config: BeamNgConfig) -> Arc<Self> {
        let core = Arc::new(ConnectorCore::new(SimulatorKind::BeamNg, config.connector.clone()));
        Arc::new(Self {
            config,
            core,
            command_tx: Mutex::new(None),
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn normalize(&self, raw: RawVehicleState, sequence: u64) -> TelemetryFrame {
        let [qx, qy, qz, qw] = raw.rotation;
        // Yaw about the vertical axis, degrees 0–360.
        let yaw = (2.0 * (qw * qz + qx * qy))
            .atan2(1.0 - 2.0 * (qy * qy + qz * qz))
            .to_degrees()
            .rem_euclid(360.0);
        let speed = (raw.velocity[0].powi(2) + raw.velocity[1].powi(2) + raw.velocity[2].powi(2)).sqrt();

        let mut custom = HashMap::new();
        custom.insert("clutch".to_string(), raw.clutch_input);
        for (i, w) in raw.wheel_speed.iter().enumerate() {
            custom.insert(format!("wheel_speed_{i}"), *w);
        }

        let mut environment = HashMap::new();
        environment.insert("engine_temp".to_string(), raw.engine_temp);
        for (i, t) in raw.wheel_temp.iter().enumerate() {
            environment.insert(format!("wheel_temp_{i}"), *t);
        }
        for (i, p) in raw.tire_pressure.iter().enumerate() {
            environment.insert(format!("tire_pressure_{i}"), *p);
        }
        environment.insert("accel_x".to_string(), raw.acceleration[0]);
        environment.insert("accel_y".to_string(), raw.acceleration[1]);
        environment.insert("accel_z".to_string(), raw.acceleration[2]);

        TelemetryFrame {
            timestamp: now_us(),
            sequence,
            source_id: self.core.config.id.clone(),
            simulator: SimulatorKind::BeamNg.as_str().to_string(),
            vehicle: VehicleState {
                position: raw.position,
                velocity: raw.velocity,
                rotation: raw.rotation,
                heading: yaw,
            },
            controls: ControlState {
                throttle: raw.throttle_input,
                brake: raw.brake_input,
                steering: raw.steering_input,
                gear: raw.gear,
                custom,
            },
            performance: PerformanceState {
                speed,
                fuel: raw.fuel,
                engine_rpm: raw.engine_rpm,
                damage: raw.damage,
            },
            environment: Some(environment),
            metadata: HashMap::new(),
        }
    }

    fn handle_line(&self, line: &str) {
        self.core.stats.bytes_received.fetch_add(line.len() as u64, Ordering::Relaxed);
        match serde_json::from_str::<RawVehicleState>(line) {
            Ok(raw) => {
                let seq = self.core.next_seq();
                self.core.emit_frame(self.normalize(raw, seq));
            }
            Err(e) => {
                self.core.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "beamng frame parse error");
            }
        }
    }

    /// One connected TCP session: read frames, write commands, until EOF.
    async fn stream_tcp(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(64);
        *self.command_tx.lock() = Some(cmd_tx);
        self.drain_queued_commands().await;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_line(&line),
                        Ok(None) => {
                            info!("beamng closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "beamng read error");
                            break;
                        }
                    }
                }
                Some(payload) = cmd_rx.recv() => {
                    if let Err(e) = write_half.write_all(payload.as_bytes()).await {
                        warn!(error = %e, "beamng command write error");
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

    async fn stream_udp(&self, socket: UdpSocket) -> Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        while self.core.is_running() {
            let n = socket.recv(&mut buf).await?;
            if let Ok(text) = std::str::from_utf8(&buf[..n]) {
                self.handle_line(text.trim_end());
            }
        }
        Ok(())
    }

    async fn connect_native(&self) -> Result<Option<TcpStream>> {
        match self.config.transport {
            BeamNgTransport::Tcp => {
                let stream = self
                    .core
                    .with_connect_timeout(async {
                        TcpStream::connect(self.addr())
                            .await
                            .map_err(|e| Error::transport(format!("beamng connect: {e}")))
                    })
                    .await?;
                stream.set_nodelay(true).ok();
                Ok(Some(stream))
            }
            BeamNgTransport::Udp => Ok(None),
        }
    }

    async fn drain_queued_commands(&self) {
        let queued = self.core.drain_commands();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "draining queued beamng commands");
        for command in queued {
            let _ = self.send_command(command).await;
        }
    }

    /// Supervisor: connect, stream, and on loss either back off and retry or
    /// terminate, per `auto_reconnect`. A native init that never connects
    /// falls back to the mock generator when enabled.
    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(
            self.core.config.reconnect_delay,
            self.core.config.max_reconnect_delay,
        );
        let mut ever_connected = false;

        while self.core.is_running() {
            self.core.set_state(ConnectionState::Connecting);

            let connected = match self.config.transport {
                BeamNgTransport::Tcp => match self.connect_native().await {
                    Ok(Some(stream)) => {
                        backoff.reset();
                        self.core.set_data_mode(DataMode::Native);
                        self.core.set_state(ConnectionState::Connected);
                        if let Err(e) = self.stream_tcp(stream).await {
                            warn!(error = %e, "beamng session ended");
                        }
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        warn!(error = %e, "beamng connect failed");
                        false
                    }
                },
                BeamNgTransport::Udp => match UdpSocket::bind(("0.0.0.0", self.config.port)).await {
                    Ok(socket) => {
                        backoff.reset();
                        self.core.set_data_mode(DataMode::Native);
                        self.core.set_state(ConnectionState::Connected);
                        if let Err(e) = self.stream_udp(socket).await {
                            warn!(error = %e, "beamng udp session ended");
                        }
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "beamng udp bind failed");
                        false
                    }
                },
            };
            ever_connected |= connected;

            if !self.core.is_running() {
                break;
            }

            if !ever_connected {
                // Native init failed outright.
                if self.core.config.fallback_to_mock {
                    warn!("beamng native init failed, falling back to mock");
                    let mock = MockTelemetry::new(
                        SimulatorKind::BeamNg,
                        self.core.config.id.clone(),
                        0xBEA0,
                    );
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
            let delay = backoff.next_delay();
            debug!(?delay, "beamng reconnecting");
            tokio::time::sleep(delay).await;
        }

        self.core.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl SimulatorConnector for BeamNgConnector {
    fn id(&self) -> &str {
        &self.core.config.id
    }

    fn simulator(&self) -> SimulatorKind {
        SimulatorKind::BeamNg
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        if !self.core.start_running() {
            return Ok(());
        }
        if !self.core.config.use_native_protocol {
            if !self.core.config.fallback_to_mock {
                self.core.stop_running();
                return Err(Error::validation(
                    "native protocol disabled and mock fallback off",
                ));
            }
            let core = Arc::clone(&self.core);
            let mock = MockTelemetry::new(SimulatorKind::BeamNg, self.core.config.id.clone(), 0xBEA0);
            tokio::spawn(run_mock_loop(core, mock));
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
            simulator: SimulatorKind::BeamNg,
            telemetry: true,
            bidirectional: self.config.transport == BeamNgTransport::Tcp,
            commands: vec![
                CapabilityEntry { kind: "vehicle".into(), action: "set-throttle".into() },
                CapabilityEntry { kind: "vehicle".into(), action: "set-brake".into() },
                CapabilityEntry { kind: "vehicle".into(), action: "set-steering".into() },
                CapabilityEntry { kind: "simulation".into(), action: "reset".into() },
            ],
        }
    }

    async fn send_command(&self, command: Command) -> Result<CommandResult> {
        let tx = self.command_tx.lock().clone();
        let result = match tx {
            Some(tx) if self.is_connected() => {
                let mut payload = serde_json::to_string(&command)?;
                payload.push('\n');
                match tx.send(payload).await {
                    Ok(()) => {
                        self.core.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
                        CommandResult::ok(command.id.clone())
                    }
                    Err(_) => {
                        self.core.stats.command_errors.fetch_add(1, Ordering::Relaxed);
                        CommandResult::failed(command.id.clone(), "command channel closed")
                    }
                }
            }
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
