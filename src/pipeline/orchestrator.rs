//! Capability-based dispatch over registered pipelines: scoring, execution
//! strategies (first / fallback / parallel), timeouts, and retry backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::now_us;

use super::registry::{PipelineRegistry, RegistrationEntry};
use super::{PipelineInput, PipelineOutput};

/// What the caller needs from a pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Call the highest-scored matching pipeline.
    #[default]
    First,
    /// Try in score order, stop on first success.
    Fallback,
    /// Dispatch up to `max_concurrent` at once; first success wins.
    Parallel,
}

/// Backoff policy applied around a single pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Permanent and validation failures are never retried; transport and
    /// timeout failures are.
    pub fn should_retry(&self, error: &Error) -> bool {
        error.is_retryable()
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub strategy: Strategy,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_concurrent: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::First,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetadata {
    #[serde(rename = "pipelineId", skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: f64,
    pub timestamp: String,
    pub attempts: u32,
}

/// What the orchestrator hands back: success with output, or an error shape
/// with the same metadata envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PipelineOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ExecutionMetadata,
}

impl ExecutionReport {
    fn ok(pipeline_id: &str, output: PipelineOutput, elapsed_ms: f64, attempts: u32) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            metadata: ExecutionMetadata {
                pipeline_id: Some(pipeline_id.to_string()),
                execution_time_ms: elapsed_ms,
                timestamp: chrono::Utc::now().to_rfc3339(),
                attempts,
            },
        }
    }

    fn failed(pipeline_id: Option<&str>, error: String, elapsed_ms: f64, attempts: u32) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            metadata: ExecutionMetadata {
                pipeline_id: pipeline_id.map(|s| s.to_string()),
                execution_time_ms: elapsed_ms,
                timestamp: chrono::Utc::now().to_rfc3339(),
                attempts,
            },
        }
    }
}

pub struct Orchestrator {
    registry: Arc<PipelineRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<PipelineRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    fn score(entry: &RegistrationEntry) -> f64 {
        let priority = entry
            .instance()
            .map(|p| p.priority() as f64)
            .unwrap_or(0.0);
        let success_rate = entry.stats.success_rate();
        let avg_ms = entry.stats.avg_execution_time_ms();
        let time_term = if avg_ms > 0.0 { 1.0 / avg_ms } else { 1.0 };
        priority * 0.5 + success_rate * 0.3 + time_term * 0.2
    }

    /// Pipelines whose capability set covers the requirements, best first.
    pub fn find_pipelines(&self, requirements: &Requirements) -> Vec<Arc<RegistrationEntry>> {
        let mut matches: Vec<(f64, Arc<RegistrationEntry>)> = self
            .registry
            .entries_snapshot()
            .into_iter()
            .filter(|entry| {
                requirements
                    .capabilities
                    .iter()
                    .all(|cap| entry.metadata.capabilities.iter().any(|have| have == cap))
            })
            .map(|entry| (Self::score(&entry), entry))
            .collect();
        matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        matches.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Execute one registered pipeline by name, with timeout and retry.
    pub async fn execute_pipeline(
        &self,
        name: &str,
        input: PipelineInput,
        opts: &ExecuteOptions,
    ) -> Result<ExecutionReport> {
        let entry = self.registry.get_entry(name)?;
        Ok(self.execute_entry(&entry, input, opts).await)
    }

    async fn execute_entry(
        &self,
        entry: &Arc<RegistrationEntry>,
        input: PipelineInput,
        opts: &ExecuteOptions,
    ) -> ExecutionReport {
        let started = now_us();
        let mut attempts = 0u32;
        let mut delay = Duration::from_millis(opts.retry.initial_delay_ms);
        let max_delay = Duration::from_millis(opts.retry.max_delay_ms);

        loop {
            attempts += 1;
            let attempt_started = now_us();
            let outcome = self.run_once(entry, input.clone(), opts.timeout).await;
            let attempt_us = now_us().saturating_sub(attempt_started);

            match outcome {
                Ok(output) => {
                    entry.stats.record_success(attempt_us);
                    let elapsed_ms = now_us().saturating_sub(started) as f64 / 1000.0;
                    return ExecutionReport::ok(&entry.name, output, elapsed_ms, attempts);
                }
                Err(e) => {
                    entry.stats.record_failure(attempt_us);
                    let retryable =
                        attempts <= opts.retry.max_retries && opts.retry.should_retry(&e);
                    if !retryable {
                        let elapsed_ms = now_us().saturating_sub(started) as f64 / 1000.0;
                        return ExecutionReport::failed(
                            Some(&entry.name),
                            e.to_string(),
                            elapsed_ms,
                            attempts,
                        );
                    }
                    debug!(
                        pipeline = %entry.name,
                        attempt = attempts,
                        ?delay,
                        error = %e,
                        "retrying pipeline"
                    );
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * opts.retry.backoff_multiplier)
                            .min(max_delay.as_secs_f64()),
                    );
                }
            }
        }
    }

    async fn run_once(
        &self,
        entry: &Arc<RegistrationEntry>,
        input: PipelineInput,
        timeout: Duration,
    ) -> Result<PipelineOutput> {
        let pipeline = entry.instance()?;
        match tokio::time::timeout(timeout, pipeline.process(input)).await {
            Ok(result) => result,
            // Orchestrator-level timeouts behave like retryable errors.
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Execute against whatever matches the requirements, per strategy.
    pub async fn execute(
        &self,
        requirements: &Requirements,
        input: PipelineInput,
        opts: &ExecuteOptions,
    ) -> Result<ExecutionReport> {
        let candidates = self.find_pipelines(requirements);
        if candidates.is_empty() {
            return Err(Error::not_found(format!(
                "no pipeline matches capabilities {:?}",
                requirements.capabilities
            )));
        }

        match opts.strategy {
            Strategy::First => Ok(self.execute_entry(&candidates[0], input, opts).await),
            Strategy::Fallback => Ok(self.execute_fallback(&candidates, input, opts).await),
            Strategy::Parallel => Ok(self.execute_parallel(&candidates, input, opts).await),
        }
    }

    async fn execute_fallback(
        &self,
        candidates: &[Arc<RegistrationEntry>],
        input: PipelineInput,
        opts: &ExecuteOptions,
    ) -> ExecutionReport {
        let started = now_us();
        let mut errors: Vec<String> = Vec::new();
        let mut attempts = 0u32;

        for entry in candidates {
            let report = self.execute_entry(entry, input.clone(), opts).await;
            attempts += report.metadata.attempts;
            if report.success {
                return report;
            }
            warn!(
                pipeline = %entry.name,
                error = report.error.as_deref().unwrap_or("unknown"),
                "fallback candidate failed"
            );
            errors.push(format!(
                "{}: {}",
                entry.name,
                report.error.unwrap_or_else(|| "unknown".to_string())
            ));
        }

        let elapsed_ms = now_us().saturating_sub(started) as f64 / 1000.0;
        ExecutionReport::failed(
            None,
            format!("all candidates failed: [{}]", errors.join("; ")),
            elapsed_ms,
            attempts,
        )
    }

    async fn execute_parallel(
        &self,
        candidates: &[Arc<RegistrationEntry>],
        input: PipelineInput,
        opts: &ExecuteOptions,
    ) -> ExecutionReport {
        let started = now_us();
        let batch: Vec<_> = candidates.iter().take(opts.max_concurrent.max(1)).collect();

        let mut tasks = FuturesUnordered::new();
        let mut handles = Vec::with_capacity(batch.len());
        for entry in batch {
            let entry = Arc::clone(entry);
            let input = input.clone();
            let opts = ExecuteOptions {
                // Inner executions run bare; parallel handles selection.
                strategy: Strategy::First,
                ..opts.clone()
            };
            let registry = Arc::clone(&self.registry);
            let handle = tokio::spawn(async move {
                Orchestrator::new(registry).execute_entry(&entry, input, &opts).await
            });
            handles.push(handle.abort_handle());
            tasks.push(handle);
        }

        let mut errors: Vec<String> = Vec::new();
        let mut attempts = 0u32;
        while let Some(joined) = tasks.next().await {
            let report = match joined {
                Ok(report) => report,
                Err(_) => continue, // aborted sibling
            };
            attempts += report.metadata.attempts;
            if report.success {
                // First success wins; the rest are cancelled.
                for handle in &handles {
                    handle.abort();
                }
                return report;
            }
            errors.push(report.error.unwrap_or_else(|| "unknown".to_string()));
        }

        let elapsed_ms = now_us().saturating_sub(started) as f64 / 1000.0;
        ExecutionReport::failed(
            None,
            format!("all parallel candidates failed: [{}]", errors.join("; ")),
            elapsed_ms,
            attempts,
        )
    }
}
