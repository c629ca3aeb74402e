//! Synopticon backend server: stream ingestion, temporal synchronization,
//! pipeline orchestration, and multi-transport distribution behind one
//! HTTP/WebSocket API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synopticon_backend::api::distribution::{ClientRegistry, StreamRegistry};
use synopticon_backend::api::telemetry::ConnectorManager;
use synopticon_backend::api::{router, AppState};
use synopticon_backend::config::{env_flag, Config};
use synopticon_backend::distribution::recording::RecordingRegistry;
use synopticon_backend::distribution::session::SessionManager;
use synopticon_backend::ingest::{FaceAdapter, GazeAdapter, SensorAdapter};
use synopticon_backend::models::SamplePayload;
use synopticon_backend::pipeline::{
    ExecuteOptions, FnPipeline, Orchestrator, PipelineMetadata, PipelineRegistry, Requirements,
    Strategy,
};
use synopticon_backend::sync::{AlignmentStrategy, SyncEngine, SyncEngineConfig, SyncTrigger};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synopticon_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn alignment_strategy_from_env() -> AlignmentStrategy {
    match std::env::var("SYNC_STRATEGY").as_deref() {
        Ok("hardware") => AlignmentStrategy::HardwareTimestamp,
        Ok("software") => AlignmentStrategy::SoftwareTimestamp,
        Ok("event") => AlignmentStrategy::EventDriven,
        _ => AlignmentStrategy::BufferBased,
    }
}

fn sync_trigger_from_env() -> SyncTrigger {
    match std::env::var("SYNC_INTERVAL_MS").ok().and_then(|v| v.parse::<u64>().ok()) {
        Some(ms) if ms > 0 => SyncTrigger::Interval(std::time::Duration::from_millis(ms)),
        _ => SyncTrigger::OnArrival,
    }
}

/// Built-in processing pipelines, registered statically at startup.
fn register_builtin_pipelines(registry: &PipelineRegistry) -> synopticon_backend::Result<()> {
    registry.register_pipeline(
        "gaze-normalizer",
        FnPipeline::new(
            "gaze-normalizer",
            vec!["gaze".to_string()],
            10,
            |mut input: serde_json::Value| async move {
                if let Some(obj) = input.as_object_mut() {
                    for key in ["x", "y"] {
                        if let Some(v) = obj.get(key).and_then(|v| v.as_f64()) {
                            obj.insert(key.to_string(), serde_json::json!(v.clamp(0.0, 1.0)));
                        }
                    }
                }
                Ok(input)
            },
        ),
        PipelineMetadata {
            category: "signal".to_string(),
            description: "Clamps gaze coordinates into display space".to_string(),
            capabilities: vec!["gaze".to_string()],
            tags: vec!["normalize".to_string()],
            ..Default::default()
        },
    )?;

    registry.register_pipeline(
        "face-presence",
        FnPipeline::new(
            "face-presence",
            vec!["face".to_string()],
            5,
            |mut input: serde_json::Value| async move {
                let count = input
                    .get("faces")
                    .and_then(|f| f.as_array())
                    .map(|f| f.len())
                    .unwrap_or(0);
                if let Some(obj) = input.as_object_mut() {
                    obj.insert("face_count".to_string(), serde_json::json!(count));
                    obj.insert("present".to_string(), serde_json::json!(count > 0));
                }
                Ok(input)
            },
        ),
        PipelineMetadata {
            category: "vision".to_string(),
            description: "Annotates detections with presence and count".to_string(),
            capabilities: vec!["face".to_string()],
            tags: vec!["annotate".to_string()],
            ..Default::default()
        },
    )?;

    Ok(())
}

/// Bridges the sync engine into the distribution layer: every aligned
/// sample is (optionally) run through a matching pipeline, then routed into
/// every session that maps its event kind.
fn spawn_distribution_bridge(state: AppState) {
    let mut tuples = state.engine.subscribe();
    tokio::spawn(async move {
        loop {
            let tuple = match tuples.recv().await {
                Ok(tuple) => tuple,
                Err(RecvError::Lagged(skipped)) => {
                    state.engine.note_subscriber_lag(skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            for aligned in tuple.sources.values() {
                let sample = &aligned.sample;
                let mut payload = match &sample.payload {
                    SamplePayload::Gaze { x, y, pupil_diameter } => serde_json::json!({
                        "x": x,
                        "y": y,
                        "pupil_diameter": pupil_diameter,
                        "confidence": sample.confidence,
                        "timestamp": tuple.aligned_ts_us,
                    }),
                    SamplePayload::Face { faces } => serde_json::json!({
                        "faces": faces,
                        "confidence": sample.confidence,
                        "timestamp": tuple.aligned_ts_us,
                    }),
                    SamplePayload::Telemetry(frame) => {
                        serde_json::to_value(frame).unwrap_or_default()
                    }
                    SamplePayload::Event { name, data } => serde_json::json!({
                        "name": name,
                        "data": data,
                        "timestamp": tuple.aligned_ts_us,
                    }),
                };

                // Optional processing hop before distribution.
                let requirements = Requirements {
                    capabilities: vec![sample.kind.as_str().to_string()],
                };
                if !state.orchestrator.find_pipelines(&requirements).is_empty() {
                    let opts = ExecuteOptions {
                        strategy: Strategy::First,
                        timeout: std::time::Duration::from_millis(250),
                        ..Default::default()
                    };
                    match state.orchestrator.execute(&requirements, payload.clone(), &opts).await {
                        Ok(report) if report.success => {
                            if let Some(output) = report.output {
                                payload = output;
                            }
                        }
                        Ok(report) => {
                            debug!(error = ?report.error, "processing hop failed, distributing raw");
                        }
                        Err(e) => debug!(error = %e, "processing hop unavailable"),
                    }
                }

                for session_id in state.sessions.session_ids() {
                    match state.sessions.route_event(&session_id, sample.kind, payload.clone()) {
                        Ok(_) => {}
                        // Sessions without routing for this kind just skip it.
                        Err(synopticon_backend::Error::Validation(_)) => {}
                        Err(e) => debug!(session = %session_id, error = %e, "route failed"),
                    }
                }

                let event = synopticon_backend::distribution::OutboundEvent::new(
                    sample.kind,
                    payload.clone(),
                )
                .with_source(sample.source_id.clone());
                for stream in state.streams.list() {
                    if stream.source == sample.kind {
                        state.recordings.record_for_stream(&stream.id, &event);
                    }
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Synopticon backend starting");

    let config = Config::from_env().context("Failed to load configuration")?;

    // Synchronization engine.
    let engine = SyncEngine::new(SyncEngineConfig {
        strategy: alignment_strategy_from_env(),
        tolerance: config.sync_tolerance,
        trigger: sync_trigger_from_env(),
        ..Default::default()
    });
    engine.start();
    info!(
        strategy = ?engine.config().strategy,
        tolerance_ms = config.sync_tolerance.as_millis() as u64,
        "⏱️ Sync engine running"
    );

    // Pipeline registry + orchestrator.
    let registry = Arc::new(PipelineRegistry::new());
    register_builtin_pipelines(&registry).context("Failed to register built-in pipelines")?;
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&registry)));
    info!(pipelines = registry.list().len(), "🧩 Pipeline registry ready");

    // Distribution.
    let sessions = Arc::new(SessionManager::default());

    let state = AppState {
        config: config.clone(),
        engine: Arc::clone(&engine),
        sessions,
        registry,
        orchestrator,
        connectors: Arc::new(ConnectorManager::default()),
        streams: Arc::new(StreamRegistry::default()),
        clients: Arc::new(ClientRegistry::default()),
        recordings: Arc::new(RecordingRegistry::default()),
        started_at: chrono::Utc::now(),
    };

    spawn_distribution_bridge(state.clone());

    // Synthetic sensors for demo and bring-up; real devices attach through
    // the same adapter seam.
    if env_flag("SYNTHETIC_SENSORS", true) {
        let gaze = GazeAdapter::new("gaze-0", Arc::clone(&engine));
        let face = FaceAdapter::new("face-0", Arc::clone(&engine));
        if let Err(e) = gaze.start().await {
            warn!(error = %e, "gaze adapter failed to start");
        }
        if let Err(e) = face.start().await {
            warn!(error = %e, "face adapter failed to start");
        }
        info!("🧪 Synthetic gaze + face sensors active (SYNTHETIC_SENSORS=0 to disable)");
    }

    // HTTP/WS API.
    let app = router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {addr}");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
