//! Telemetry endpoints: simulator connector lifecycle, buffered telemetry
//! streams, and the command path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::info;

use crate::connectors::beamng::{BeamNgConfig, BeamNgConnector};
use crate::connectors::msfs::{MsfsConfig, MsfsConnector};
use crate::connectors::vatsim::{VatsimConfig, VatsimConnector};
use crate::connectors::xplane::{XPlaneConfig, XPlaneConnector};
use crate::connectors::{
    CapabilityDescriptor, ConnectorConfig, ConnectorStatus, SimulatorConnector,
};
use crate::error::Error;
use crate::models::{Command, CommandPriority, CommandResult, SimulatorKind, TelemetryFrame};

use super::{ok, ApiResult, AppState};

/// A buffered view over one connector's frame broadcast, readable over HTTP.
pub struct TelemetryStream {
    pub id: String,
    pub simulator: SimulatorKind,
    frames: Arc<RwLock<VecDeque<TelemetryFrame>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TelemetryStream {
    fn read(&self, limit: usize, since: Option<u64>) -> Vec<TelemetryFrame> {
        let frames = self.frames.read();
        let filtered: Vec<&TelemetryFrame> = frames
            .iter()
            .filter(|f| since.is_none_or(|s| f.timestamp > s))
            .collect();
        filtered
            .into_iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Owns the live connectors (one per simulator kind) and telemetry streams.
#[derive(Default)]
pub struct ConnectorManager {
    connectors: RwLock<HashMap<SimulatorKind, Arc<dyn SimulatorConnector>>>,
    streams: RwLock<HashMap<String, Arc<TelemetryStream>>>,
}

impl ConnectorManager {
    pub fn known_kinds(&self) -> Vec<&'static str> {
        vec!["msfs", "x-plane", "vatsim", "beamng"]
    }

    pub fn get(&self, kind: SimulatorKind) -> Option<Arc<dyn SimulatorConnector>> {
        self.connectors.read().get(&kind).cloned()
    }

    pub fn statuses(&self) -> Vec<ConnectorStatus> {
        self.connectors.read().values().map(|c| c.get_status()).collect()
    }

    pub async fn connect(
        &self,
        kind: SimulatorKind,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn SimulatorConnector>, Error> {
        if let Some(existing) = self.get(kind) {
            return Ok(existing);
        }

        let connector_config = ConnectorConfig {
            id: format!("{}-0", kind.as_str()),
            use_native_protocol: request.use_native_protocol.unwrap_or(true),
            fallback_to_mock: request.fallback_to_mock.unwrap_or(true),
            auto_reconnect: request.auto_reconnect.unwrap_or(true),
            ..Default::default()
        };

        let connector: Arc<dyn SimulatorConnector> = match kind {
            SimulatorKind::Msfs => {
                let mut config = MsfsConfig { connector: connector_config, ..Default::default() };
                if let Some(host) = &request.host {
                    config.host = host.clone();
                }
                if let Some(port) = request.port {
                    config.port = port;
                }
                let c = MsfsConnector::new(config);
                Arc::clone(&c).connect().await?;
                c
            }
            SimulatorKind::XPlane => {
                let mut config = XPlaneConfig { connector: connector_config, ..Default::default() };
                if let Some(host) = &request.host {
                    config.host = host.clone();
                }
                if let Some(port) = request.port {
                    config.port = port;
                }
                let c = XPlaneConnector::new(config);
                Arc::clone(&c).connect().await?;
                c
            }
            SimulatorKind::Vatsim => {
                let config = VatsimConfig {
                    callsign: request.callsign.clone(),
                    connector: connector_config,
                    ..Default::default()
                };
                let c = VatsimConnector::new(config);
                Arc::clone(&c).connect().await?;
                c
            }
            SimulatorKind::BeamNg => {
                let mut config = BeamNgConfig { connector: connector_config, ..Default::default() };
                if let Some(host) = &request.host {
                    config.host = host.clone();
                }
                if let Some(port) = request.port {
                    config.port = port;
                }
                let c = BeamNgConnector::new(config);
                Arc::clone(&c).connect().await?;
                c
            }
        };

        self.connectors.write().insert(kind, Arc::clone(&connector));
        info!(simulator = kind.as_str(), "connector started");
        Ok(connector)
    }

    pub async fn disconnect(&self, kind: SimulatorKind) -> Result<(), Error> {
        let connector = self
            .connectors
            .write()
            .remove(&kind)
            .ok_or_else(|| Error::not_found(format!("connector {}", kind.as_str())))?;
        connector.disconnect().await?;
        // Streams over a gone connector stop filling but stay readable.
        Ok(())
    }

    pub fn start_stream(&self, kind: SimulatorKind, buffer_size: usize) -> Result<String, Error> {
        let connector = self
            .get(kind)
            .ok_or_else(|| Error::not_found(format!("connector {}", kind.as_str())))?;

        let id = uuid::Uuid::new_v4().to_string();
        let frames: Arc<RwLock<VecDeque<TelemetryFrame>>> =
            Arc::new(RwLock::new(VecDeque::with_capacity(buffer_size.min(4096))));
        let mut rx = connector.subscribe();
        let task_frames = Arc::clone(&frames);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let mut buf = task_frames.write();
                        buf.push_back(frame);
                        while buf.len() > buffer_size {
                            buf.pop_front();
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.streams.write().insert(
            id.clone(),
            Arc::new(TelemetryStream {
                id: id.clone(),
                simulator: kind,
                frames,
                task: Mutex::new(Some(task)),
            }),
        );
        Ok(id)
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<TelemetryStream>> {
        self.streams.read().get(id).cloned()
    }

    pub fn delete_stream(&self, id: &str) -> Result<(), Error> {
        let stream = self
            .streams
            .write()
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("telemetry stream {id}")))?;
        stream.stop();
        Ok(())
    }
}

fn parse_kind(s: &str) -> Result<SimulatorKind, Error> {
    SimulatorKind::parse(s).ok_or_else(|| Error::validation(format!("unknown simulator type {s}")))
}

pub async fn list_simulators(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    Ok(ok(serde_json::json!({
        "available": state.connectors.known_kinds(),
        "connected": state.connectors.statuses(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub use_native_protocol: Option<bool>,
    #[serde(default)]
    pub fallback_to_mock: Option<bool>,
    #[serde(default)]
    pub auto_reconnect: Option<bool>,
    /// VATSIM only: restrict the feed to one callsign.
    #[serde(default)]
    pub callsign: Option<String>,
}

pub async fn connect_simulator(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<ConnectorStatus> {
    let kind = parse_kind(&request.kind)?;
    let connector = state.connectors.connect(kind, &request).await?;
    Ok(ok(connector.get_status()))
}

pub async fn get_simulator_status(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<ConnectorStatus> {
    let kind = parse_kind(&kind)?;
    let connector = state
        .connectors
        .get(kind)
        .ok_or_else(|| Error::not_found(format!("connector {}", kind.as_str())))?;
    Ok(ok(connector.get_status()))
}

pub async fn disconnect_simulator(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<serde_json::Value> {
    let kind = parse_kind(&kind)?;
    state.connectors.disconnect(kind).await?;
    Ok(ok(serde_json::json!({"disconnected": kind.as_str()})))
}

#[derive(Debug, Deserialize)]
pub struct StartStreamRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    1000
}

pub async fn start_stream(
    State(state): State<AppState>,
    Json(request): Json<StartStreamRequest>,
) -> ApiResult<serde_json::Value> {
    let kind = parse_kind(&request.kind)?;
    let stream_id = state.connectors.start_stream(kind, request.buffer_size)?;
    Ok(ok(serde_json::json!({"stream_id": stream_id})))
}

#[derive(Debug, Deserialize)]
pub struct ReadStreamQuery {
    #[serde(default = "default_read_limit")]
    pub limit: usize,
    #[serde(default)]
    pub since: Option<u64>,
}

fn default_read_limit() -> usize {
    100
}

pub async fn read_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<ReadStreamQuery>,
) -> ApiResult<serde_json::Value> {
    let stream = state
        .connectors
        .get_stream(&stream_id)
        .ok_or_else(|| Error::not_found(format!("telemetry stream {stream_id}")))?;
    let frames = stream.read(query.limit, query.since);
    Ok(ok(serde_json::json!({
        "stream_id": stream.id,
        "simulator": stream.simulator.as_str(),
        "count": frames.len(),
        "frames": frames,
    })))
}

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.connectors.delete_stream(&stream_id)?;
    Ok(ok(serde_json::json!({"deleted": stream_id})))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub simulator: String,
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub priority: Option<CommandPriority>,
    /// Park the command for delivery on (re)connect instead of sending now.
    #[serde(default)]
    pub queue: bool,
}

pub async fn send_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<serde_json::Value> {
    let kind = parse_kind(&request.simulator)?;
    let connector = state
        .connectors
        .get(kind)
        .ok_or_else(|| Error::not_found(format!("connector {}", kind.as_str())))?;

    let mut command = Command::new(request.kind, request.action, request.parameters);
    if let Some(priority) = request.priority {
        command = command.with_priority(priority);
    }

    if request.queue {
        let id = command.id.clone();
        connector.queue_command(command);
        return Ok(ok(serde_json::json!({"queued": true, "command_id": id})));
    }

    let result = connector.send_command(command).await?;
    Ok(ok(serde_json::to_value(result).map_err(Error::from)?))
}

#[derive(Debug, Deserialize)]
pub struct CommandBatchRequest {
    #[serde(rename = "type")]
    pub simulator: String,
    pub commands: Vec<BatchEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BatchEntry {
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

pub async fn send_command_batch(
    State(state): State<AppState>,
    Json(request): Json<CommandBatchRequest>,
) -> ApiResult<Vec<CommandResult>> {
    let kind = parse_kind(&request.simulator)?;
    let connector = state
        .connectors
        .get(kind)
        .ok_or_else(|| Error::not_found(format!("connector {}", kind.as_str())))?;

    let commands: Vec<Command> = request
        .commands
        .into_iter()
        .map(|c| Command::new(c.kind, c.action, c.parameters))
        .collect();
    if commands.is_empty() {
        return Err(Error::validation("command batch must be non-empty").into());
    }
    let results = connector.send_commands(commands).await?;
    Ok(ok(results))
}

pub async fn get_capabilities(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<CapabilityDescriptor> {
    let kind = parse_kind(&kind)?;
    let connector = state
        .connectors
        .get(kind)
        .ok_or_else(|| Error::not_found(format!("connector {}", kind.as_str())))?;
    Ok(ok(connector.get_capabilities()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_accepts_aliases() {
        assert_eq!(parse_kind("msfs").unwrap(), SimulatorKind::Msfs);
        assert_eq!(parse_kind("xplane").unwrap(), SimulatorKind::XPlane);
        assert!(parse_kind("flightgear").is_err());
    }

    #[tokio::test]
    async fn stream_read_respects_limit_and_since() {
        let frames = Arc::new(RwLock::new(VecDeque::new()));
        for i in 1..=5u64 {
            frames.write().push_back(TelemetryFrame {
                timestamp: i * 1000,
                sequence: i,
                ..Default::default()
            });
        }
        let stream = TelemetryStream {
            id: "s".to_string(),
            simulator: SimulatorKind::BeamNg,
            frames,
            task: Mutex::new(None),
        };

        let latest = stream.read(2, None);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].sequence, 4);
        assert_eq!(latest[1].sequence, 5);

        let since = stream.read(10, Some(3000));
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].sequence, 4);
    }

    #[tokio::test]
    async fn manager_stream_requires_connector() {
        let manager = ConnectorManager::default();
        assert!(matches!(
            manager.start_stream(SimulatorKind::BeamNg, 10),
            Err(Error::NotFound(_))
        ));
    }
}
