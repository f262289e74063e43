//! Durable-store collaborator seam
//!
//! The engine treats persistence as a collaborator behind `TunerStore`:
//! typed row reads/writes for configurations, experiments, and metrics.
//! Schema and transport are the implementation's concern. All engine
//! write-throughs are best-effort with a timeout; on failure the engine
//! logs and keeps serving from memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use llm_tuner_types::{ExperimentConfig, Objective, OptimizationConfig, PerformanceMetric};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;

/// Typed persistence operations the engine needs from a durable store
#[async_trait]
pub trait TunerStore: Send + Sync {
    /// Persist an optimization configuration, superseding any previous
    /// row for the same (model, objective)
    async fn save_config(&self, config: &OptimizationConfig) -> Result<()>;

    /// Load the most recent configuration for (model, objective)
    async fn load_config(
        &self,
        model: &str,
        objective: Objective,
    ) -> Result<Option<OptimizationConfig>>;

    /// Persist an experiment record, including its result when present
    async fn save_experiment(&self, experiment: &ExperimentConfig) -> Result<()>;

    /// Load an experiment record by id
    async fn load_experiment(&self, id: Uuid) -> Result<Option<ExperimentConfig>>;

    /// Persist a performance observation
    async fn save_metric(&self, metric: &PerformanceMetric) -> Result<()>;

    /// Load observations for a model recorded at or after `since`
    async fn load_metrics_since(
        &self,
        model: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceMetric>>;
}

/// Run a persistence operation best-effort: a failure or timeout is
/// logged and turned into `None`, never an error for the caller.
pub async fn best_effort<T, F>(op_name: &str, op_timeout: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(op_timeout, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(op = op_name, error = %e, "persistence operation failed; continuing from memory");
            None
        }
        Err(_) => {
            warn!(op = op_name, timeout_ms = op_timeout.as_millis() as u64, "persistence operation timed out; continuing from memory");
            None
        }
    }
}

/// In-memory reference implementation of `TunerStore`.
///
/// Used in tests and in standalone deployments without a database; all
/// rows live in concurrent maps and vanish with the process.
#[derive(Default)]
pub struct MemoryTunerStore {
    configs: DashMap<(String, Objective), OptimizationConfig>,
    experiments: DashMap<Uuid, ExperimentConfig>,
    metrics: DashMap<String, Vec<PerformanceMetric>>,
}

impl MemoryTunerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored configuration rows
    pub fn config_rows(&self) -> usize {
        self.configs.len()
    }

    /// Number of stored experiment rows
    pub fn experiment_rows(&self) -> usize {
        self.experiments.len()
    }

    /// Number of stored observation rows across all models
    pub fn metric_rows(&self) -> usize {
        self.metrics.iter().map(|e| e.len()).sum()
    }
}

#[async_trait]
impl TunerStore for MemoryTunerStore {
    async fn save_config(&self, config: &OptimizationConfig) -> Result<()> {
        self.configs
            .insert((config.model.clone(), config.objective), config.clone());
        Ok(())
    }

    async fn load_config(
        &self,
        model: &str,
        objective: Objective,
    ) -> Result<Option<OptimizationConfig>> {
        Ok(self
            .configs
            .get(&(model.to_string(), objective))
            .map(|entry| entry.clone()))
    }

    async fn save_experiment(&self, experiment: &ExperimentConfig) -> Result<()> {
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn load_experiment(&self, id: Uuid) -> Result<Option<ExperimentConfig>> {
        Ok(self.experiments.get(&id).map(|entry| entry.clone()))
    }

    async fn save_metric(&self, metric: &PerformanceMetric) -> Result<()> {
        self.metrics
            .entry(metric.model.clone())
            .or_default()
            .push(metric.clone());
        Ok(())
    }

    async fn load_metrics_since(
        &self,
        model: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceMetric>> {
        Ok(self
            .metrics
            .get(model)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|m| m.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
