//! Capability-indexed pipeline store.
//!
//! Reads vastly outnumber writes, so the whole registry sits behind one
//! read-write lock. Registration is static (build-time wiring); there is no
//! runtime plugin loader.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::{Pipeline, PipelineMetadata, PipelineStats, PipelineStatsSnapshot};

/// A factory produces instances from a JSON config.
pub type PipelineFactory =
    Arc<dyn Fn(serde_json::Value) -> Result<Arc<dyn Pipeline>> + Send + Sync>;

pub struct RegistrationEntry {
    pub name: String,
    pub metadata: PipelineMetadata,
    pub stats: PipelineStats,
    factory: PipelineFactory,
    instances: RwLock<Vec<Arc<dyn Pipeline>>>,
    /// Lazily created default instance used by execute-by-name.
    default_instance: RwLock<Option<Arc<dyn Pipeline>>>,
}

impl RegistrationEntry {
    /// The shared default instance, created on first use with empty config.
    pub fn instance(&self) -> Result<Arc<dyn Pipeline>> {
        if let Some(instance) = self.default_instance.read().clone() {
            return Ok(instance);
        }
        let instance = (self.factory)(serde_json::json!({}))?;
        *self.default_instance.write() = Some(Arc::clone(&instance));
        Ok(instance)
    }

    pub fn live_instances(&self) -> usize {
        self.instances.read().len() + usize::from(self.default_instance.read().is_some())
    }
}

/// Queryable summary of a registration.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineInfo {
    pub name: String,
    pub metadata: PipelineMetadata,
    pub stats: PipelineStatsSnapshot,
    pub live_instances: usize,
}

#[derive(Default)]
pub struct PipelineRegistry {
    entries: RwLock<HashMap<String, Arc<RegistrationEntry>>>,
    categories: RwLock<HashMap<String, HashSet<String>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate_metadata(name: &str, metadata: &PipelineMetadata) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::validation("pipeline name must be non-empty"));
        }
        if metadata.capabilities.is_empty() {
            return Err(Error::validation(format!(
                "pipeline {name} must declare at least one capability"
            )));
        }
        Ok(())
    }

    /// Register a factory under `name`. The metadata is merged with defaults
    /// and stamped with the registration time.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: PipelineFactory,
        mut metadata: PipelineMetadata,
    ) -> Result<()> {
        let name = name.into();
        Self::validate_metadata(&name, &metadata)?;
        if metadata.category.trim().is_empty() {
            metadata.category = "general".to_string();
        }
        metadata.registered_at = chrono::Utc::now().to_rfc3339();

        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(Error::validation(format!("pipeline {name} already registered")));
        }
        self.categories
            .write()
            .entry(metadata.category.clone())
            .or_default()
            .insert(name.clone());
        entries.insert(
            name.clone(),
            Arc::new(RegistrationEntry {
                name: name.clone(),
                metadata,
                stats: PipelineStats::default(),
                factory,
                instances: RwLock::new(Vec::new()),
                default_instance: RwLock::new(None),
            }),
        );
        info!(pipeline = %name, "pipeline registered");
        Ok(())
    }

    /// Register an already-built pipeline; the factory just hands out the
    /// shared instance.
    pub fn register_pipeline(
        &self,
        name: impl Into<String>,
        pipeline: Arc<dyn Pipeline>,
        metadata: PipelineMetadata,
    ) -> Result<()> {
        let shared = Arc::clone(&pipeline);
        self.register(name, Arc::new(move |_config| Ok(Arc::clone(&shared))), metadata)
    }

    /// Remove a registration. Returns whether anything was removed; the
    /// second call for a name is `false` with no other state change.
    pub fn unregister(&self, name: &str) -> bool {
        let entry = match self.entries.write().remove(name) {
            Some(entry) => entry,
            None => return false,
        };
        if let Some(members) = self.categories.write().get_mut(&entry.metadata.category) {
            members.remove(name);
        }

        // Ask live instances to clean up: fire-and-forget with a deadline.
        let mut instances: Vec<Arc<dyn Pipeline>> = entry.instances.write().drain(..).collect();
        if let Some(default) = entry.default_instance.write().take() {
            instances.push(default);
        }
        if !instances.is_empty() {
            let name = name.to_string();
            tokio::spawn(async move {
                for instance in instances {
                    if tokio::time::timeout(Duration::from_secs(5), instance.cleanup())
                        .await
                        .is_err()
                    {
                        warn!(pipeline = %name, "instance cleanup timed out");
                    }
                }
            });
        }
        info!(pipeline = %name, "pipeline unregistered");
        true
    }

    /// Instantiate a pipeline from its factory and keep the instance live.
    pub fn create(&self, name: &str, config: serde_json::Value) -> Result<Arc<dyn Pipeline>> {
        let entry = self.get_entry(name)?;
        let instance = (entry.factory)(config)?;
        if instance.id().trim().is_empty() {
            return Err(Error::validation(format!(
                "factory for {name} produced a pipeline without an id"
            )));
        }
        entry.instances.write().push(Arc::clone(&instance));
        debug!(pipeline = %name, "pipeline instance created");
        Ok(instance)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn get_entry(&self, name: &str) -> Result<Arc<RegistrationEntry>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pipeline {name}")))
    }

    pub fn get_info(&self, name: &str) -> Result<PipelineInfo> {
        let entry = self.get_entry(name)?;
        Ok(Self::info(&entry))
    }

    fn info(entry: &RegistrationEntry) -> PipelineInfo {
        PipelineInfo {
            name: entry.name.clone(),
            metadata: entry.metadata.clone(),
            stats: entry.stats.snapshot(),
            live_instances: entry.live_instances(),
        }
    }

    pub fn list(&self) -> Vec<PipelineInfo> {
        let mut infos: Vec<PipelineInfo> =
            self.entries.read().values().map(|e| Self::info(e)).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn entries_snapshot(&self) -> Vec<Arc<RegistrationEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<PipelineInfo> {
        self.entries
            .read()
            .values()
            .filter(|e| e.metadata.capabilities.iter().any(|c| c == capability))
            .map(|e| Self::info(e))
            .collect()
    }

    pub fn find_by_category(&self, category: &str) -> Vec<PipelineInfo> {
        let names = match self.categories.read().get(category) {
            Some(names) => names.clone(),
            None => return Vec::new(),
        };
        let entries = self.entries.read();
        names
            .iter()
            .filter_map(|n| entries.get(n))
            .map(|e| Self::info(e))
            .collect()
    }

    pub fn find_by_tags(&self, tags: &[&str]) -> Vec<PipelineInfo> {
        self.entries
            .read()
            .values()
            .filter(|e| tags.iter().all(|t| e.metadata.tags.iter().any(|have| have == t)))
            .map(|e| Self::info(e))
            .collect()
    }

    /// Free-text search: exact-name bonus + word hits across the metadata +
    /// fuzzy prefix, ranked descending.
    pub fn search(&self, text: &str) -> Vec<PipelineInfo> {
        let needle = text.to_lowercase();
        let words: Vec<&str> = needle.split_whitespace().collect();

        let mut scored: Vec<(f64, PipelineInfo)> = self
            .entries
            .read()
            .values()
            .filter_map(|e| {
                let mut score = 0.0;
                let name = e.name.to_lowercase();
                if name == needle {
                    score += 10.0;
                }
                if name.starts_with(&needle) {
                    score += 3.0;
                }
                let haystack = format!(
                    "{} {} {} {}",
                    name,
                    e.metadata.description.to_lowercase(),
                    e.metadata.capabilities.join(" ").to_lowercase(),
                    e.metadata.tags.join(" ").to_lowercase()
                );
                for word in &words {
                    if haystack.contains(word) {
                        score += 1.0;
                    }
                }
                (score > 0.0).then(|| (score, Self::info(e)))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, info)| info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FnPipeline, PipelineInput};

    fn meta(category: &str, capabilities: &[&str], tags: &[&str]) -> PipelineMetadata {
        PipelineMetadata {
            category: category.to_string(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            description: "test pipeline".to_string(),
            ..Default::default()
        }
    }

    fn noop(name: &str) -> Arc<dyn Pipeline> {
        FnPipeline::new(name.to_string(), vec!["x".to_string()], 1, |input: PipelineInput| async move {
            Ok(input)
        })
    }

    #[test]
    fn register_round_trip_merges_defaults() {
        let registry = PipelineRegistry::new();
        registry
            .register_pipeline("gaze-smoother", noop("gaze-smoother"), meta("", &["gaze"], &[]))
            .unwrap();

        let info = registry.get_info("gaze-smoother").unwrap();
        assert_eq!(info.metadata.category, "general");
        assert_eq!(info.metadata.capabilities, vec!["gaze"]);
        assert!(!info.metadata.registered_at.is_empty());
        assert!(registry.is_registered("gaze-smoother"));
    }

    #[test]
    fn register_requires_capabilities() {
        let registry = PipelineRegistry::new();
        let err = registry
            .register_pipeline("bad", noop("bad"), meta("general", &[], &[]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = PipelineRegistry::new();
        registry
            .register_pipeline("p", noop("p"), meta("general", &["x"], &[]))
            .unwrap();
        assert!(registry
            .register_pipeline("p", noop("p"), meta("general", &["x"], &[]))
            .is_err());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = PipelineRegistry::new();
        registry
            .register_pipeline("p", noop("p"), meta("general", &["x"], &[]))
            .unwrap();
        assert!(registry.unregister("p"));
        assert!(!registry.is_registered("p"));
        assert!(!registry.unregister("p"));
    }

    #[test]
    fn category_and_capability_and_tag_queries() {
        let registry = PipelineRegistry::new();
        registry
            .register_pipeline(
                "face-landmarks",
                noop("face-landmarks"),
                meta("vision", &["face", "landmarks"], &["ml"]),
            )
            .unwrap();
        registry
            .register_pipeline(
                "gaze-filter",
                noop("gaze-filter"),
                meta("signal", &["gaze"], &["filter", "ml"]),
            )
            .unwrap();

        assert_eq!(registry.find_by_category("vision").len(), 1);
        assert_eq!(registry.find_by_capability("gaze").len(), 1);
        assert_eq!(registry.find_by_tags(&["ml"]).len(), 2);
        assert_eq!(registry.find_by_tags(&["ml", "filter"]).len(), 1);
        assert!(registry.find_by_category("nope").is_empty());
    }

    #[test]
    fn search_ranks_exact_match_first() {
        let registry = PipelineRegistry::new();
        registry
            .register_pipeline("gaze", noop("gaze"), meta("general", &["gaze"], &[]))
            .unwrap();
        registry
            .register_pipeline(
                "gaze-smoother",
                noop("gaze-smoother"),
                meta("general", &["gaze"], &[]),
            )
            .unwrap();

        let results = registry.search("gaze");
        assert_eq!(results[0].name, "gaze");
        assert_eq!(results.len(), 2);
        assert!(registry.search("nonexistent-thing").is_empty());
    }

    #[test]
    fn create_keeps_live_instances() {
        let registry = PipelineRegistry::new();
        let factory: PipelineFactory = Arc::new(|_config| {
            let pipeline: Arc<dyn Pipeline> = FnPipeline::new(
                "counter".to_string(),
                vec!["count".to_string()],
                1,
                |input: PipelineInput| async move { Ok(input) },
            );
            Ok(pipeline)
        });
        registry
            .register("counter", factory, meta("general", &["count"], &[]))
            .unwrap();

        registry.create("counter", serde_json::json!({})).unwrap();
        registry.create("counter", serde_json::json!({})).unwrap();
        assert_eq!(registry.get_info("counter").unwrap().live_instances, 2);
    }
}
