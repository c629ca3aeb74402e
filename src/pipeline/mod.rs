//! Pipeline registry and orchestration: capability-indexed processing units
//! selected and executed by strategy, with retry and per-pipeline stats.

pub mod orchestrator;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use orchestrator::{
    ExecuteOptions, ExecutionMetadata, ExecutionReport, Orchestrator, Requirements, RetryPolicy,
    Strategy,
};
pub use registry::{PipelineInfo, PipelineRegistry, RegistrationEntry};

/// Inputs and outputs stay opaque JSON; pipelines own their own schemas.
pub type PipelineInput = serde_json::Value;
pub type PipelineOutput = serde_json::Value;

/// A unit of processing, registered under capability tags.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> &[String];
    fn priority(&self) -> i32;

    async fn process(&self, input: PipelineInput) -> Result<PipelineOutput>;

    /// Called when the owning registration is unregistered. Best effort.
    async fn cleanup(&self) {}
}

/// Registry-held metadata for a registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetadata {
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Stamped by the registry at registration time.
    #[serde(default)]
    pub registered_at: String,
}

fn default_category() -> String {
    "general".to_string()
}

impl Default for PipelineMetadata {
    fn default() -> Self {
        Self {
            category: default_category(),
            version: String::new(),
            description: String::new(),
            author: String::new(),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            tags: Vec::new(),
            registered_at: String::new(),
        }
    }
}

/// Execution counters kept per registration.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub success_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub executions: AtomicU64,
    pub total_execution_us: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatsSnapshot {
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_execution_time_ms: f64,
}

impl PipelineStats {
    pub fn record_success(&self, elapsed_us: u64) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_execution_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed_us: u64) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_execution_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.executions.load(Ordering::Relaxed);
        if total == 0 {
            // Untested pipelines get the benefit of the doubt.
            return 1.0;
        }
        self.success_count.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn avg_execution_time_ms(&self) -> f64 {
        let total = self.executions.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.total_execution_us.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_execution_time_ms: self.avg_execution_time_ms(),
        }
    }
}

/// A pipeline built from a closure — the common case for statically
/// registered processing steps.
pub struct FnPipeline<F> {
    id: String,
    capabilities: Vec<String>,
    priority: i32,
    f: F,
}

impl<F, Fut> FnPipeline<F>
where
    F: Fn(PipelineInput) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<PipelineOutput>> + Send,
{
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, priority: i32, f: F) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            capabilities,
            priority,
            f,
        })
    }
}

#[async_trait]
impl<F, Fut> Pipeline for FnPipeline<F>
where
    F: Fn(PipelineInput) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<PipelineOutput>> + Send,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, input: PipelineInput) -> Result<PipelineOutput> {
        (self.f)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_rates_and_averages() {
        let stats = PipelineStats::default();
        assert_eq!(stats.success_rate(), 1.0);

        stats.record_success(2_000);
        stats.record_failure(4_000);
        assert_eq!(stats.success_rate(), 0.5);
        assert!((stats.avg_execution_time_ms() - 3.0).abs() < 1e-9);

        let snap = stats.snapshot();
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 1);
    }

    #[tokio::test]
    async fn fn_pipeline_processes() {
        let p = FnPipeline::new("doubler", vec!["math".to_string()], 1, |input: PipelineInput| async move {
            let n = input.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!({"n": n * 2}))
        });
        let out = p.process(serde_json::json!({"n": 21})).await.unwrap();
        assert_eq!(out, serde_json::json!({"n": 42}));
        assert_eq!(p.priority(), 1);
    }
}
