//! Self-driving optimization control loop
//!
//! Wakes on a fixed interval, finalizes experiments whose duration has
//! elapsed (promoting winners to the cached default), scans the metric
//! store for degraded models, and launches candidate experiments for
//! them. One model's failure never aborts the cycle for the others, and
//! a failed cycle retries after a shorter backoff instead of stopping
//! the loop.

use chrono::Duration as ChronoDuration;
use chrono::Utc;
use llm_tuner_config::TunerConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use llm_tuner_types::{Arm, Objective, OptimizationConfig, ParameterBounds, PerformanceMetric};

use crate::cache::ConfigurationCache;
use crate::errors::Result;
use crate::experiment::ExperimentManager;
use crate::metric_store::MetricStore;
use crate::storage::{best_effort, TunerStore};

/// A perturbation is worth an experiment only inside these bands:
/// bigger than noise, smaller than a wild jump.
const PROMISING_TEMP_BAND: (f64, f64) = (0.05, 0.3);
const PROMISING_TOP_P_BAND: (f64, f64) = (0.02, 0.2);

/// Controller tuning knobs, extracted from `TunerConfig`
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Time between successful cycles
    pub interval: Duration,
    /// Time before retrying after a failed cycle
    pub retry_backoff: Duration,
    /// Trailing window scanned for degradation
    pub window: ChronoDuration,
    /// Mean quality below this flags a model
    pub quality_floor: f64,
    /// Mean latency above this (seconds) flags a model
    pub latency_ceiling_secs: f64,
    /// Mean error rate above this flags a model
    pub error_rate_ceiling: f64,
    /// Perturbation deltas
    pub temperature_delta: f64,
    pub top_p_delta: f64,
    pub max_tokens_delta: u32,
    pub penalty_delta: f64,
    /// Objective used when fetching and promoting defaults
    pub objective: Objective,
    /// Launched experiment duration, in hours
    pub experiment_duration_hours: f64,
    /// Launched experiment traffic split
    pub traffic_split: f64,
    /// Advisory metric retention horizon
    pub retention: ChronoDuration,
    /// Timeout for persistence write-throughs
    pub op_timeout: Duration,
}

impl From<&TunerConfig> for ControllerSettings {
    fn from(config: &TunerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.service.optimization_interval_secs),
            retry_backoff: Duration::from_secs(config.service.retry_backoff_secs),
            window: ChronoDuration::hours(config.controller.window_hours as i64),
            quality_floor: config.controller.quality_floor,
            latency_ceiling_secs: config.controller.latency_ceiling_secs,
            error_rate_ceiling: config.controller.error_rate_ceiling,
            temperature_delta: config.controller.temperature_delta,
            top_p_delta: config.controller.top_p_delta,
            max_tokens_delta: config.controller.max_tokens_delta,
            penalty_delta: config.controller.penalty_delta,
            objective: Objective::default(),
            experiment_duration_hours: config.experiments.default_duration_hours,
            traffic_split: config.experiments.default_traffic_split,
            retention: ChronoDuration::days(config.storage.retention_days as i64),
            op_timeout: Duration::from_secs(config.storage.op_timeout_secs),
        }
    }
}

/// Outcome summary of one controller cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Models flagged as degraded this cycle
    pub flagged: Vec<String>,
    /// Experiments launched this cycle
    pub launched: Vec<Uuid>,
    /// Experiments finalized by the sweep
    pub finalized: Vec<Uuid>,
    /// Winners promoted to cached defaults
    pub promoted: Vec<String>,
    /// Observations dropped by retention pruning
    pub pruned: usize,
}

/// Background optimization controller
pub struct OptimizationController {
    settings: ControllerSettings,
    metrics: Arc<MetricStore>,
    cache: Arc<ConfigurationCache>,
    experiments: Arc<ExperimentManager>,
    store: Arc<dyn TunerStore>,
    bounds: ParameterBounds,
    /// Seedable so perturbations are reproducible in tests
    rng: Mutex<StdRng>,
}

impl OptimizationController {
    pub fn new(
        settings: ControllerSettings,
        metrics: Arc<MetricStore>,
        cache: Arc<ConfigurationCache>,
        experiments: Arc<ExperimentManager>,
        store: Arc<dyn TunerStore>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            settings,
            metrics,
            cache,
            experiments,
            store,
            bounds: ParameterBounds::default(),
            rng: Mutex::new(rng),
        }
    }

    /// Run one optimization cycle.
    ///
    /// Public so hosts and tests can drive cycles directly instead of
    /// waiting on the background interval.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.sweep_experiments(&mut report).await;

        report.flagged = self.scan_degraded();
        for model in report.flagged.clone() {
            match self.consider_model(&model).await {
                Ok(Some(id)) => report.launched.push(id),
                Ok(None) => {}
                // One model's failure must not abort the cycle
                Err(e) => warn!(%model, error = %e, "skipping model this cycle"),
            }
        }

        report.pruned = self.metrics.prune(self.settings.retention);

        info!(
            flagged = report.flagged.len(),
            launched = report.launched.len(),
            finalized = report.finalized.len(),
            promoted = report.promoted.len(),
            "optimization cycle complete"
        );
        Ok(report)
    }

    /// Finalize due experiments and promote winners as new defaults
    async fn sweep_experiments(&self, report: &mut CycleReport) {
        for (id, result) in self.experiments.finalize_due(Utc::now()) {
            report.finalized.push(id);

            let Some(experiment) = self.experiments.get(&id) else {
                continue;
            };

            best_effort(
                "save_experiment",
                self.settings.op_timeout,
                self.store.save_experiment(&experiment),
            )
            .await;

            if let Some(winner) = result.winner {
                let winning_config = match winner {
                    Arm::A => experiment.config_a.clone(),
                    Arm::B => experiment.config_b.clone(),
                };
                info!(
                    %id,
                    model = %experiment.model,
                    %winner,
                    recommendation = %result.recommendation,
                    "promoting experiment winner"
                );
                self.cache.promote(winning_config).await;
                report.promoted.push(experiment.model.clone());
            }
        }
    }

    /// Models whose trailing window shows degraded health
    fn scan_degraded(&self) -> Vec<String> {
        let mut degraded = Vec::new();

        for model in self.metrics.models() {
            let window = self.metrics.window(&model, self.settings.window);
            if window.is_empty() {
                continue;
            }

            let n = window.len() as f64;
            let mean_quality = window.iter().map(|m| m.quality_score).sum::<f64>() / n;
            let mean_latency = window.iter().map(|m| m.response_time_secs).sum::<f64>() / n;
            let mean_error_rate = window.iter().map(PerformanceMetric::error_rate).sum::<f64>() / n;

            if mean_quality < self.settings.quality_floor
                || mean_latency > self.settings.latency_ceiling_secs
                || mean_error_rate > self.settings.error_rate_ceiling
            {
                debug!(
                    %model,
                    mean_quality, mean_latency, mean_error_rate, "model flagged as degraded"
                );
                degraded.push(model);
            }
        }

        degraded
    }

    /// Perturb the model's default and launch an experiment when the
    /// change looks promising
    async fn consider_model(&self, model: &str) -> Result<Option<Uuid>> {
        if self.experiments.active_for_model(model).is_some() {
            debug!(model, "experiment already running; skipping");
            return Ok(None);
        }

        let current = self.cache.get(model, self.settings.objective).await;
        let candidate = self.perturb(&current);

        if !is_promising(&current, &candidate) {
            debug!(model, "perturbation not promising; skipping");
            return Ok(None);
        }

        let id = self.experiments.create(
            model,
            current,
            candidate,
            self.settings.traffic_split,
            self.settings.experiment_duration_hours,
        )?;

        if let Some(experiment) = self.experiments.get(&id) {
            best_effort(
                "save_experiment",
                self.settings.op_timeout,
                self.store.save_experiment(&experiment),
            )
            .await;
        }

        info!(model, experiment_id = %id, "launched automatic experiment");
        Ok(Some(id))
    }

    /// Candidate configuration: each numeric field moved by a small
    /// bounded random delta, re-clamped into the parameter bounds
    fn perturb(&self, base: &OptimizationConfig) -> OptimizationConfig {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let s = &self.settings;

        let mut candidate = base.clone();
        candidate.temperature += rng.gen_range(-s.temperature_delta..=s.temperature_delta);
        candidate.top_p += rng.gen_range(-s.top_p_delta..=s.top_p_delta);
        let token_delta = rng.gen_range(-(s.max_tokens_delta as i64)..=(s.max_tokens_delta as i64));
        candidate.max_tokens = (candidate.max_tokens as i64 + token_delta).max(0) as u32;
        candidate.frequency_penalty += rng.gen_range(-s.penalty_delta..=s.penalty_delta);
        candidate.presence_penalty += rng.gen_range(-s.penalty_delta..=s.penalty_delta);
        candidate.last_updated = Utc::now();

        self.bounds.clamp(&candidate)
    }

    /// Spawn the background loop. A successful cycle sleeps the full
    /// interval; a failed one retries after the shorter backoff. The
    /// loop only exits through the returned handle's shutdown.
    pub fn spawn(self: Arc<Self>) -> ControllerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let controller = self;
        let handle = tokio::spawn(async move {
            info!(
                interval_secs = controller.settings.interval.as_secs(),
                "optimization controller started"
            );

            loop {
                let delay = match controller.run_cycle().await {
                    Ok(_) => controller.settings.interval,
                    Err(e) => {
                        error!(error = %e, "optimization cycle failed; retrying after backoff");
                        controller.settings.retry_backoff
                    }
                };

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("optimization controller stopping");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        ControllerHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running controller loop
pub struct ControllerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ControllerHandle {
    /// Signal the loop to stop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// The promising band: a meaningful but not extreme move on temperature
/// or the nucleus cutoff
fn is_promising(current: &OptimizationConfig, candidate: &OptimizationConfig) -> bool {
    let temp_diff = (candidate.temperature - current.temperature).abs();
    let top_p_diff = (candidate.top_p - current.top_p).abs();

    (temp_diff > PROMISING_TEMP_BAND.0 && temp_diff < PROMISING_TEMP_BAND.1)
        || (top_p_diff > PROMISING_TOP_P_BAND.0 && top_p_diff < PROMISING_TOP_P_BAND.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promising_band() {
        let current = OptimizationConfig::default_for("m");

        let mut noise = current.clone();
        noise.temperature += 0.01;
        assert!(!is_promising(&current, &noise));

        let mut meaningful = current.clone();
        meaningful.temperature += 0.12;
        assert!(is_promising(&current, &meaningful));

        let mut wild = current.clone();
        wild.temperature += 0.5;
        assert!(!is_promising(&current, &wild));

        let mut cutoff_move = current.clone();
        cutoff_move.top_p -= 0.04;
        assert!(is_promising(&current, &cutoff_move));
    }
}
