//! Engine facade
//!
//! `ModelOptimizer` wires the metric store, configuration cache,
//! experiment manager, and controller together behind the two inbound
//! boundary operations the request-serving layer uses: record a metric,
//! and fetch the configuration to serve with. Constructed once at
//! startup with an injected durable store; no global state.

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use llm_tuner_config::TunerConfig;
use llm_tuner_types::{
    Arm, ExperimentConfig, ExperimentResult, ExperimentStatus, Objective, OptimizationConfig,
    PerformanceMetric,
};

use crate::cache::{CacheSettings, ConfigurationCache};
use crate::controller::{ControllerHandle, ControllerSettings, OptimizationController};
use crate::errors::Result;
use crate::experiment::ExperimentManager;
use crate::metric_store::MetricStore;
use crate::scoring::{HeuristicScorer, QualityScorer};
use crate::storage::{best_effort, TunerStore};

/// Aggregate view of the engine's state
#[derive(Debug, Clone)]
pub struct OptimizerStatistics {
    /// Observations currently retained in memory
    pub retained_metrics: usize,
    /// Models with any history
    pub models: usize,
    /// Experiments by status
    pub experiments_total: usize,
    pub experiments_running: usize,
    pub experiments_completed: usize,
    pub experiments_stopped: usize,
    /// Winner tallies across finalized experiments
    pub arm_a_wins: usize,
    pub arm_b_wins: usize,
    /// Live configuration cache entries
    pub cached_configs: u64,
}

/// Top-level tuner engine
pub struct ModelOptimizer {
    metrics: Arc<MetricStore>,
    cache: Arc<ConfigurationCache>,
    experiments: Arc<ExperimentManager>,
    controller: Arc<OptimizationController>,
    store: Arc<dyn TunerStore>,
    scorer: Arc<dyn QualityScorer>,
    default_objective: Objective,
    op_timeout: std::time::Duration,
}

impl ModelOptimizer {
    /// Build the engine from configuration and an injected durable store
    pub fn new(config: &TunerConfig, store: Arc<dyn TunerStore>) -> Self {
        Self::with_scorer(config, store, Arc::new(HeuristicScorer::new()))
    }

    /// Build with a custom quality scorer collaborator
    pub fn with_scorer(
        config: &TunerConfig,
        store: Arc<dyn TunerStore>,
        scorer: Arc<dyn QualityScorer>,
    ) -> Self {
        let metrics = Arc::new(MetricStore::with_capacity(
            config.storage.max_metrics_per_model,
        ));

        let cache_settings = CacheSettings {
            ttl: std::time::Duration::from_secs(config.cache.ttl_secs),
            capacity: config.cache.capacity,
            history_window: chrono::Duration::hours(config.controller.window_hours as i64),
            history_limit: config.cache.search_history_limit,
            op_timeout: std::time::Duration::from_secs(config.storage.op_timeout_secs),
        };
        let cache = Arc::new(ConfigurationCache::new(
            metrics.clone(),
            store.clone(),
            cache_settings,
        ));

        let experiments = Arc::new(ExperimentManager::new());

        let controller = Arc::new(OptimizationController::new(
            ControllerSettings::from(config),
            metrics.clone(),
            cache.clone(),
            experiments.clone(),
            store.clone(),
            config.controller.rng_seed,
        ));

        Self {
            metrics,
            cache,
            experiments,
            controller,
            store,
            scorer,
            default_objective: Objective::default(),
            op_timeout: std::time::Duration::from_secs(config.storage.op_timeout_secs),
        }
    }

    /// Record a performance observation for a served request.
    ///
    /// Appends to the in-memory log and writes through to the durable
    /// store best-effort; never fails the caller.
    pub async fn record_metric(&self, metric: PerformanceMetric) {
        self.metrics.record(metric.clone());
        best_effort(
            "save_metric",
            self.op_timeout,
            self.store.save_metric(&metric),
        )
        .await;
    }

    /// Record an observation under an experiment arm
    pub fn record_experiment_metric(
        &self,
        experiment_id: &Uuid,
        arm: Arm,
        metric: PerformanceMetric,
    ) -> Result<()> {
        self.experiments.record(experiment_id, arm, metric)
    }

    /// The configuration a request for `model` should be served with.
    ///
    /// While an experiment runs for the model, callers are routed
    /// through its deterministic arm assignment (the arm comes back so
    /// the resulting metric can be attributed). Otherwise the cached
    /// default for the standing objective is returned. This path never
    /// errors: every fallback ends in a usable configuration.
    pub async fn active_or_default_config(
        &self,
        model: &str,
        caller_key: Option<&str>,
    ) -> (Option<(Uuid, Arm)>, OptimizationConfig) {
        if let Some(id) = self.experiments.active_for_model(model) {
            match self.experiments.assign_arm(&id, caller_key) {
                Ok((arm, config)) => return (Some((id, arm)), config),
                Err(e) => {
                    // Raced with finalization; fall through to the default
                    warn!(model, error = %e, "experiment assignment failed; serving default");
                }
            }
        }

        (None, self.cache.get(model, self.default_objective).await)
    }

    /// Current default configuration for a model and objective
    pub async fn optimized_config(&self, model: &str, objective: Objective) -> OptimizationConfig {
        self.cache.get(model, objective).await
    }

    /// Score a response against its prompt via the quality collaborator
    pub fn score_response(&self, prompt: &str, response: &str) -> f64 {
        self.scorer.score(prompt, response).clamp(0.0, 1.0)
    }

    /// Create an experiment manually (operator path)
    pub fn create_experiment(
        &self,
        model: &str,
        config_a: OptimizationConfig,
        config_b: OptimizationConfig,
        traffic_split: f64,
        duration_hours: f64,
    ) -> Result<Uuid> {
        self.experiments
            .create(model, config_a, config_b, traffic_split, duration_hours)
    }

    /// Finalize an experiment explicitly (operator path)
    pub fn finalize_experiment(&self, id: &Uuid) -> Result<ExperimentResult> {
        self.experiments.finalize(id)
    }

    /// Stop an experiment without statistical finalization
    pub fn stop_experiment(&self, id: &Uuid) -> Result<ExperimentResult> {
        self.experiments.stop(id)
    }

    /// Experiment record by id
    pub fn experiment(&self, id: &Uuid) -> Option<ExperimentConfig> {
        self.experiments.get(id)
    }

    /// Start the background optimization loop
    pub fn spawn_controller(&self) -> ControllerHandle {
        self.controller.clone().spawn()
    }

    /// Drive one controller cycle synchronously (hosts without the
    /// background loop, and tests)
    pub async fn run_optimization_cycle(&self) -> Result<crate::controller::CycleReport> {
        self.controller.run_cycle().await
    }

    /// Aggregate engine statistics
    pub fn statistics(&self) -> OptimizerStatistics {
        let experiments = self.experiments.list();

        let mut stats = OptimizerStatistics {
            retained_metrics: self.metrics.total(),
            models: self.metrics.models().len(),
            experiments_total: experiments.len(),
            experiments_running: 0,
            experiments_completed: 0,
            experiments_stopped: 0,
            arm_a_wins: 0,
            arm_b_wins: 0,
            cached_configs: self.cache.entry_count(),
        };

        for experiment in &experiments {
            match experiment.status {
                ExperimentStatus::Running => stats.experiments_running += 1,
                ExperimentStatus::Completed => stats.experiments_completed += 1,
                ExperimentStatus::Stopped => stats.experiments_stopped += 1,
            }
            if let Some(result) = &experiment.result {
                match result.winner {
                    Some(Arm::A) => stats.arm_a_wins += 1,
                    Some(Arm::B) => stats.arm_b_wins += 1,
                    None => {}
                }
            }
        }

        stats
    }
}
