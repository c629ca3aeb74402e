//! HTTP/WebSocket API surface: a thin shell over the session manager,
//! pipeline registry, and connector manager.

pub mod distribution;
pub mod events_ws;
pub mod telemetry;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::Config;
use crate::distribution::recording::RecordingRegistry;
use crate::distribution::session::SessionManager;
use crate::error::Error;
use crate::pipeline::{Orchestrator, PipelineRegistry};
use crate::sync::SyncEngine;

use self::distribution::{ClientRegistry, StreamRegistry};
use self::telemetry::ConnectorManager;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<SyncEngine>,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<PipelineRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub connectors: Arc<ConnectorManager>,
    pub streams: Arc<StreamRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub recordings: Arc<RecordingRegistry>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Error half of the envelope, carrying the mapped status code.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

/// X-API-Key gate, active only when a key is configured.
pub async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.api_key {
        let presented = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            let body = Json(Envelope::<()> {
                success: false,
                data: None,
                error: Some("missing or invalid API key".to_string()),
            });
            return (StatusCode::UNAUTHORIZED, body).into_response();
        }
    }
    next.run(request).await
}

async fn health() -> &'static str {
    "synopticon operational"
}

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Distribution
        .route("/distribution/status", get(distribution::get_status))
        .route(
            "/distribution/streams",
            get(distribution::list_streams).post(distribution::create_stream),
        )
        .route(
            "/distribution/streams/:id",
            get(distribution::get_stream)
                .put(distribution::update_stream)
                .delete(distribution::delete_stream),
        )
        .route("/distribution/discovery", get(distribution::get_discovery))
        .route(
            "/distribution/clients",
            get(distribution::list_clients).post(distribution::create_client),
        )
        .route("/distribution/clients/:id", get(distribution::get_client))
        .route("/distribution/templates", get(distribution::list_templates))
        .route(
            "/distribution/templates/:id/instantiate",
            post(distribution::instantiate_template),
        )
        .route(
            "/distribution/streams/:id/record",
            post(distribution::start_recording),
        )
        .route(
            "/distribution/recordings/:id/stop",
            post(distribution::stop_recording),
        )
        .route("/distribution/streams/:id/share", post(distribution::share_stream))
        .route("/distribution/events", get(events_ws::events_handler))
        // Telemetry / simulators
        .route("/telemetry/simulators", get(telemetry::list_simulators))
        .route("/telemetry/connect", post(telemetry::connect_simulator))
        .route("/telemetry/status/:type", get(telemetry::get_simulator_status))
        .route("/telemetry/stream/start", post(telemetry::start_stream))
        .route(
            "/telemetry/stream/:stream_id",
            get(telemetry::read_stream).delete(telemetry::delete_stream),
        )
        .route("/telemetry/command", post(telemetry::send_command))
        .route("/telemetry/commands/:type", get(telemetry::get_capabilities))
        .route("/telemetry/commands/batch", post(telemetry::send_command_batch))
        .route(
            "/telemetry/disconnect/:type",
            delete(telemetry::disconnect_simulator),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(tower_http::cors::CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        let body = serde_json::to_value(&Envelope {
            success: true,
            data: Some(serde_json::json!({"n": 1})),
            error: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"success": true, "data": {"n": 1}}));

        let err = serde_json::to_value(&Envelope::<()> {
            success: false,
            data: None,
            error: Some("boom".to_string()),
        })
        .unwrap();
        assert_eq!(err, serde_json::json!({"success": false, "error": "boom"}));
    }
}
