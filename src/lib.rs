//! Synopticon backend library.
//!
//! High-rate sensor streams in, temporally aligned tuples out, fanned across
//! UDP / WebSocket / MQTT / HTTP distributors, with simulator connectors and
//! a capability-indexed pipeline orchestrator in between.

pub mod api;
pub mod config;
pub mod connectors;
pub mod distribution;
pub mod error;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{AlignedTuple, Sample, SamplePayload, StreamKind, SyncMetrics, TelemetryFrame};
