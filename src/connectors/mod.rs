//! Simulator connector framework.
//!
//! Every connector speaks one simulator's wire protocol and exposes the same
//! contract: connect/disconnect lifecycle with auto-reconnect, a broadcast of
//! normalized telemetry frames, a bidirectional command channel, and a
//! capability descriptor for negotiation. A connector whose native transport
//! fails can fall back to a deterministic mock generator so downstream
//! consumers keep receiving realistic frames.

pub mod beamng;
pub mod mock;
pub mod msfs;
pub mod vatsim;
pub mod xplane;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{Command, CommandResult, SimulatorKind, TelemetryFrame};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Whether frames come from the native protocol or the mock generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    Native,
    Mock,
}

/// Events observable via `subscribe_to_events`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorEvent {
    ConnectionChange {
        #[serde(rename = "oldState")]
        old_state: ConnectionState,
        #[serde(rename = "newState")]
        new_state: ConnectionState,
    },
    DataModeChange {
        mode: DataMode,
    },
    CommandExecuted {
        command_id: String,
        success: bool,
    },
}

/// A supported (kind, action) pair.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityEntry {
    pub kind: String,
    pub action: String,
}

/// What a connector can do, for client-side negotiation.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDescriptor {
    pub simulator: SimulatorKind,
    pub telemetry: bool,
    pub bidirectional: bool,
    pub commands: Vec<CapabilityEntry>,
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub id: String,
    /// Frames per second the connector aims to emit.
    pub update_rate_hz: f64,
    pub use_native_protocol: bool,
    pub fallback_to_mock: bool,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            update_rate_hz: 30.0,
            use_native_protocol: true,
            fallback_to_mock: true,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectorStats {
    pub frames_emitted: AtomicU64,
    pub bytes_received: AtomicU64,
    pub commands_sent: AtomicU64,
    pub command_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub parse_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatsSnapshot {
    pub frames_emitted: u64,
    pub bytes_received: u64,
    pub commands_sent: u64,
    pub command_errors: u64,
    pub reconnects: u64,
    pub parse_errors: u64,
}

impl ConnectorStats {
    pub fn snapshot(&self) -> ConnectorStatsSnapshot {
        ConnectorStatsSnapshot {
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate status returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub id: String,
    pub simulator: SimulatorKind,
    pub state: ConnectionState,
    pub data_mode: DataMode,
    pub queued_commands: usize,
    pub stats: ConnectorStatsSnapshot,
}

/// The uniform contract every simulator connector implements.
#[async_trait]
pub trait SimulatorConnector: Send + Sync {
    fn id(&self) -> &str;
    fn simulator(&self) -> SimulatorKind;

    async fn connect(self: Arc<Self>) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Telemetry frame subscription. Laggards are dropped by the channel.
    fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame>;
    fn subscribe_to_events(&self) -> broadcast::Receiver<ConnectorEvent>;

    fn get_status(&self) -> ConnectorStatus;
    fn get_capabilities(&self) -> CapabilityDescriptor;

    async fn send_command(&self, command: Command) -> Result<CommandResult>;

    async fn send_commands(&self, commands: Vec<Command>) -> Result<Vec<CommandResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.send_command(command).await?);
        }
        Ok(results)
    }

    /// Park a command for delivery once connected.
    fn queue_command(&self, command: Command);
    fn clear_command_queue(&self) -> usize;
}

/// Shared connector state: lifecycle, fan-out channels, command queue, stats.
///
/// Each concrete connector embeds one of these and drives it from its own
/// run loop; the trait methods mostly delegate here.
pub struct ConnectorCore {
    pub config: ConnectorConfig,
    pub simulator: SimulatorKind,
    state: RwLock<ConnectionState>,
    data_mode: RwLock<DataMode>,
    frame_tx: broadcast::Sender<TelemetryFrame>,
    event_tx: broadcast::Sender<ConnectorEvent>,
    command_queue: Mutex<VecDeque<Command>>,
    seq: AtomicU64,
    pub stats: ConnectorStats,
    running: AtomicBool,
}

impl ConnectorCore {
    pub fn new(simulator: SimulatorKind, config: ConnectorConfig) -> Self {
        let (frame_tx, _) = broadcast::channel(1024);
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            simulator,
            state: RwLock::new(ConnectionState::Disconnected),
            data_mode: RwLock::new(DataMode::Native),
            frame_tx,
            event_tx,
            command_queue: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(1),
            stats: ConnectorStats::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Transition the lifecycle state, emitting a connection_change event.
    pub fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state != new_state {
            info!(
                connector = %self.config.id,
                simulator = self.simulator.as_str(),
                old = old_state.as_str(),
                new = new_state.as_str(),
                "connector state change"
            );
            let _ = self.event_tx.send(ConnectorEvent::ConnectionChange { old_state, new_state });
        }
    }

    pub fn data_mode(&self) -> DataMode {
        *self.data_mode.read()
    }

    pub fn set_data_mode(&self, mode: DataMode) {
        let changed = {
            let mut current = self.data_mode.write();
            let changed = *current != mode;
            *current = mode;
            changed
        };
        if changed {
            let _ = self.event_tx.send(ConnectorEvent::DataModeChange { mode });
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns false when the connector was already running.
    pub fn start_running(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit_frame(&self, frame: TelemetryFrame) {
        self.stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.frame_tx.send(frame);
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.frame_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit_command_event(&self, result: &CommandResult) {
        let _ = self.event_tx.send(ConnectorEvent::CommandExecuted {
            command_id: result.command_id.clone(),
            success: result.success,
        });
    }

    pub fn queue_command(&self, command: Command) {
        self.command_queue.lock().push_back(command);
    }

    /// Take all queued commands, highest priority first.
    pub fn drain_commands(&self) -> Vec<Command> {
        let mut queue = self.command_queue.lock();
        let mut commands: Vec<Command> = queue.drain(..).collect();
        commands.sort_by(|a, b| b.priority.cmp(&a.priority));
        commands
    }

    pub fn clear_commands(&self) -> usize {
        let mut queue = self.command_queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn queued_command_count(&self) -> usize {
        self.command_queue.lock().len()
    }

    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            id: self.config.id.clone(),
            simulator: self.simulator,
            state: self.state(),
            data_mode: self.data_mode(),
            queued_commands: self.queued_command_count(),
            stats: self.stats.snapshot(),
        }
    }

    /// Interval between frames at the configured update rate.
    pub fn frame_interval(&self) -> Duration {
        let hz = self.config.update_rate_hz.max(0.1);
        Duration::from_secs_f64(1.0 / hz)
    }

    /// Guard a connect attempt with the configured timeout.
    pub async fn with_connect_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.connect_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.connect_timeout)),
        }
    }
}

/// Exponential reconnect backoff between the configured base and cap.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { current: base, base, max }
    }

    /// Current delay, doubling for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
