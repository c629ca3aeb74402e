//! Distribution endpoints: stream CRUD, clients, templates, recording,
//! discovery.
//!
//! An API "stream" is one outbound distributor wrapped in its own session;
//! a "client" is a registered consumer identity that may own streams across
//! sessions.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::distribution::recording::RecordingFormat;
use crate::distribution::session::SessionConfig;
use crate::distribution::{
    Destination, DistributorConfig, DistributorFilter, DistributorKind, OverflowMode,
};
use crate::error::Error;
use crate::models::StreamKind;

use super::{ok, ApiResult, AppState};

/// One configured outbound stream.
#[derive(Debug, Clone, Serialize)]
pub struct ApiStream {
    pub id: String,
    /// Transport kind.
    pub kind: DistributorKind,
    /// Event kind this stream carries.
    pub source: StreamKind,
    pub session_id: String,
    pub distributor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: String,
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, ApiStream>>,
}

impl StreamRegistry {
    pub fn insert(&self, stream: ApiStream) {
        self.streams.write().insert(stream.id.clone(), stream);
    }

    pub fn get(&self, id: &str) -> Option<ApiStream> {
        self.streams.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<ApiStream> {
        self.streams.write().remove(id)
    }

    pub fn list(&self) -> Vec<ApiStream> {
        let mut streams: Vec<ApiStream> = self.streams.read().values().cloned().collect();
        streams.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        streams
    }

    pub fn count(&self) -> usize {
        self.streams.read().len()
    }
}

/// A registered consumer identity.
#[derive(Debug, Clone, Serialize)]
pub struct ApiClient {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub stream_ids: Vec<String>,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ApiClient>>,
}

impl ClientRegistry {
    pub fn create(&self, name: String) -> ApiClient {
        let client = ApiClient {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            created_at: chrono::Utc::now().to_rfc3339(),
            stream_ids: Vec::new(),
        };
        self.clients.write().insert(client.id.clone(), client.clone());
        client
    }

    pub fn get(&self, id: &str) -> Option<ApiClient> {
        self.clients.read().get(id).cloned()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }

    pub fn attach_stream(&self, client_id: &str, stream_id: &str) {
        if let Some(client) = self.clients.write().get_mut(client_id) {
            client.stream_ids.push(stream_id.to_string());
        }
    }

    pub fn detach_stream(&self, stream_id: &str) {
        for client in self.clients.write().values_mut() {
            client.stream_ids.retain(|s| s != stream_id);
        }
    }

    pub fn list(&self) -> Vec<ApiClient> {
        self.clients.read().values().cloned().collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    /// Transport: udp | mqtt | websocket | http.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event kind to carry: gaze | face | telemetry | event.
    pub source: String,
    pub destination: serde_json::Value,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub filter: Option<DistributorFilter>,
}

fn parse_destination(kind: DistributorKind, value: &serde_json::Value) -> Result<Destination, Error> {
    let str_field = |name: &str| -> Result<String, Error> {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::validation(format!("destination.{name} is required")))
    };
    let port_field = || -> Result<u16, Error> {
        value
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| Error::validation("destination.port is required"))
    };

    match kind {
        DistributorKind::Udp => Ok(Destination::Udp {
            host: str_field("host")?,
            port: port_field()?,
        }),
        DistributorKind::Websocket => Ok(Destination::Websocket { bind: str_field("bind")? }),
        DistributorKind::Mqtt => {
            let topics = value
                .get("topics")
                .and_then(|t| {
                    serde_json::from_value::<HashMap<String, String>>(t.clone()).ok()
                })
                .unwrap_or_default();
            Ok(Destination::Mqtt {
                host: str_field("host")?,
                port: value
                    .get("port")
                    .and_then(|v| v.as_u64())
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(1883),
                client_id: value.get("client_id").and_then(|v| v.as_str()).map(String::from),
                topics,
                topic_prefix: value
                    .get("topic_prefix")
                    .and_then(|v| v.as_str())
                    .unwrap_or("eyetracking")
                    .to_string(),
                qos: value.get("qos").and_then(|v| v.as_u64()).unwrap_or(0) as u8,
                retain: value.get("retain").and_then(|v| v.as_bool()).unwrap_or(false),
            })
        }
        DistributorKind::Http => Ok(Destination::Http {
            base_url: str_field("base_url").or_else(|_| str_field("baseUrl"))?,
            paths: HashMap::new(),
        }),
    }
}

#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    pub stream_id: String,
    pub websocket_status_url: String,
    pub data: ApiStream,
}

pub async fn create_stream(
    State(state): State<AppState>,
    Json(request): Json<CreateStreamRequest>,
) -> ApiResult<CreateStreamResponse> {
    let kind = DistributorKind::parse(&request.kind)
        .ok_or_else(|| Error::validation(format!("unknown stream type {}", request.kind)))?;
    let source = StreamKind::parse(&request.source)
        .ok_or_else(|| Error::validation(format!("unknown source kind {}", request.source)))?;
    if let Some(client_id) = &request.client_id {
        if !state.clients.exists(client_id) {
            return Err(Error::not_found(format!("client {client_id}")).into());
        }
    }
    let destination = parse_destination(kind, &request.destination)?;

    let stream_id = uuid::Uuid::new_v4().to_string();
    let distributor_name = format!("{}-primary", kind.as_str());
    let config = SessionConfig {
        distributors: vec![DistributorConfig {
            name: distributor_name.clone(),
            destination,
            filter: request.filter,
            queue_capacity: 1024,
            overflow: OverflowMode::DropHead,
            degraded_threshold: state.config.degraded_threshold,
        }],
        event_routing: HashMap::from([(source, vec![distributor_name.clone()])]),
    };
    state.sessions.create_session(stream_id.clone(), config).await?;

    let stream = ApiStream {
        id: stream_id.clone(),
        kind,
        source,
        session_id: stream_id.clone(),
        distributor_name,
        client_id: request.client_id.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    state.streams.insert(stream.clone());
    if let Some(client_id) = &request.client_id {
        state.clients.attach_stream(client_id, &stream_id);
    }

    Ok(ok(CreateStreamResponse {
        websocket_status_url: "/api/distribution/events".to_string(),
        stream_id,
        data: stream,
    }))
}

pub async fn list_streams(State(state): State<AppState>) -> ApiResult<Vec<ApiStream>> {
    Ok(ok(state.streams.list()))
}

pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let stream = state
        .streams
        .get(&id)
        .ok_or_else(|| Error::not_found(format!("stream {id}")))?;
    let status = state.sessions.get_session_status(&stream.session_id)?;
    Ok(ok(serde_json::json!({
        "stream": stream,
        "session": status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStreamRequest {
    #[serde(default)]
    pub destination: Option<serde_json::Value>,
    #[serde(default)]
    pub filter: Option<DistributorFilter>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub async fn update_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateStreamRequest>,
) -> ApiResult<ApiStream> {
    let stream = state
        .streams
        .get(&id)
        .ok_or_else(|| Error::not_found(format!("stream {id}")))?;

    let destination = match &request.destination {
        Some(value) => Some(parse_destination(stream.kind, value)?),
        None => None,
    };
    if destination.is_some() || request.filter.is_some() {
        state
            .sessions
            .reconfigure_distributor(
                &stream.session_id,
                &stream.distributor_name,
                destination,
                request.filter.clone(),
            )
            .await?;
    }
    if let Some(enabled) = request.enabled {
        if enabled {
            state
                .sessions
                .enable_distributor(&stream.session_id, &stream.distributor_name)?;
        } else {
            state
                .sessions
                .disable_distributor(&stream.session_id, &stream.distributor_name)?;
        }
    }
    Ok(ok(stream))
}

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let stream = state
        .streams
        .remove(&id)
        .ok_or_else(|| Error::not_found(format!("stream {id}")))?;
    state.sessions.end_session(&stream.session_id).await?;
    state.clients.detach_stream(&id);
    Ok(ok(serde_json::json!({"deleted": id})))
}

pub async fn get_status(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let sessions = state.sessions.all_statuses();
    let active = sessions
        .iter()
        .flat_map(|s| &s.distributors)
        .filter(|d| d.state == crate::distribution::DistributorState::Active)
        .count();
    let total: usize = sessions.iter().map(|s| s.distributors.len()).sum();
    Ok(ok(serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": (chrono::Utc::now() - state.started_at).num_seconds(),
        "streams": {"total": state.streams.count(), "active": active, "distributors": total},
        "clients": {"total": state.clients.list().len()},
        "data_sources": {
            "sync_streams": state.engine.stream_ids(),
            "sync_metrics": state.engine.metrics(),
            "connectors": state.connectors.statuses(),
        },
    })))
}

pub async fn get_discovery(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    Ok(ok(serde_json::json!({
        "service": "synopticon",
        "transports": ["udp", "websocket", "mqtt", "http"],
        "event_kinds": ["gaze", "face", "telemetry", "event"],
        "simulators": state.connectors.known_kinds(),
        "endpoints": {
            "streams": "/api/distribution/streams",
            "clients": "/api/distribution/clients",
            "templates": "/api/distribution/templates",
            "events": "/api/distribution/events",
            "telemetry": "/api/telemetry/simulators",
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
}

pub async fn create_client(
    State(state): State<AppState>,
    Json(request): Json<CreateClientRequest>,
) -> ApiResult<ApiClient> {
    if request.name.trim().is_empty() {
        return Err(Error::validation("client name must be non-empty").into());
    }
    Ok(ok(state.clients.create(request.name)))
}

pub async fn list_clients(State(state): State<AppState>) -> ApiResult<Vec<ApiClient>> {
    Ok(ok(state.clients.list()))
}

pub async fn get_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApiClient> {
    state
        .clients
        .get(&id)
        .map(ok)
        .ok_or_else(|| Error::not_found(format!("client {id}")).into())
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamTemplate {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub destination: serde_json::Value,
}

fn templates() -> Vec<StreamTemplate> {
    vec![
        StreamTemplate {
            id: "gaze-udp-local".to_string(),
            description: "Gaze samples to a local UDP consumer".to_string(),
            kind: "udp".to_string(),
            source: "gaze".to_string(),
            destination: serde_json::json!({"host": "127.0.0.1", "port": 9999}),
        },
        StreamTemplate {
            id: "gaze-mqtt".to_string(),
            description: "Gaze samples to an MQTT broker under eyetracking/gaze".to_string(),
            kind: "mqtt".to_string(),
            source: "gaze".to_string(),
            destination: serde_json::json!({"host": "127.0.0.1", "port": 1883}),
        },
        StreamTemplate {
            id: "telemetry-websocket".to_string(),
            description: "Simulator telemetry pushed to WebSocket clients".to_string(),
            kind: "websocket".to_string(),
            source: "telemetry".to_string(),
            destination: serde_json::json!({"bind": "0.0.0.0:8765"}),
        },
    ]
}

pub async fn list_templates(State(_state): State<AppState>) -> ApiResult<Vec<StreamTemplate>> {
    Ok(ok(templates()))
}

pub async fn instantiate_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CreateStreamResponse> {
    let template = templates()
        .into_iter()
        .find(|t| t.id == id)
        .ok_or_else(|| Error::not_found(format!("template {id}")))?;
    create_stream(
        State(state),
        Json(CreateStreamRequest {
            kind: template.kind,
            source: template.source,
            destination: template.destination,
            client_id: None,
            filter: None,
        }),
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct StartRecordingRequest {
    pub format: String,
    pub file_path: String,
}

pub async fn start_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StartRecordingRequest>,
) -> ApiResult<serde_json::Value> {
    if state.streams.get(&id).is_none() {
        return Err(Error::not_found(format!("stream {id}")).into());
    }
    let format = RecordingFormat::parse(&request.format)?;
    let recording_id = state.recordings.start(&id, format, &request.file_path).await?;
    Ok(ok(serde_json::json!({"recording_id": recording_id, "stream_id": id})))
}

pub async fn stop_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let written = state.recordings.stop(&id).await?;
    Ok(ok(serde_json::json!({"recording_id": id, "events_written": written})))
}

pub async fn share_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let stream = state
        .streams
        .get(&id)
        .ok_or_else(|| Error::not_found(format!("stream {id}")))?;
    // A share descriptor is enough for another consumer to attach.
    Ok(ok(serde_json::json!({
        "stream_id": stream.id,
        "type": stream.kind.as_str(),
        "source": stream.source.as_str(),
        "events_url": "/api/distribution/events",
        "status_url": format!("/api/distribution/streams/{}", stream.id),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_parsing_per_kind() {
        let udp = parse_destination(
            DistributorKind::Udp,
            &serde_json::json!({"host": "127.0.0.1", "port": 9999}),
        )
        .unwrap();
        assert!(matches!(udp, Destination::Udp { port: 9999, .. }));

        let mqtt = parse_destination(
            DistributorKind::Mqtt,
            &serde_json::json!({"host": "broker", "qos": 1, "retain": true}),
        )
        .unwrap();
        match mqtt {
            Destination::Mqtt { port, qos, retain, topic_prefix, .. } => {
                assert_eq!(port, 1883);
                assert_eq!(qos, 1);
                assert!(retain);
                assert_eq!(topic_prefix, "eyetracking");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(parse_destination(DistributorKind::Udp, &serde_json::json!({"host": "x"})).is_err());

        let http = parse_destination(
            DistributorKind::Http,
            &serde_json::json!({"baseUrl": "http://sink:8080"}),
        )
        .unwrap();
        assert!(matches!(http, Destination::Http { .. }));
    }

    #[test]
    fn client_registry_attach_detach() {
        let registry = ClientRegistry::default();
        let client = registry.create("viewer".to_string());
        registry.attach_stream(&client.id, "s1");
        assert_eq!(registry.get(&client.id).unwrap().stream_ids, vec!["s1"]);
        registry.detach_stream("s1");
        assert!(registry.get(&client.id).unwrap().stream_ids.is_empty());
    }

    #[test]
    fn templates_are_instantiable_shapes() {
        for t in templates() {
            let kind = DistributorKind::parse(&t.kind).unwrap();
            assert!(StreamKind::parse(&t.source).is_some());
            assert!(parse_destination(kind, &t.destination).is_ok());
        }
    }
}
