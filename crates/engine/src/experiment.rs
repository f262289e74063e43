//! A/B experiment lifecycle management
//!
//! Owns experiment creation, deterministic arm assignment, per-arm
//! result recording, and finalization. A model has at most one running
//! experiment at a time; status moves one way (running to completed or
//! stopped) and finalization is idempotent: the first transition stores
//! the result, every later call returns it unchanged.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use statrs::distribution::{ContinuousCDF, Normal};
use std::hash::Hasher;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use llm_tuner_types::{
    Arm, ArmStats, Confidence, ExperimentConfig, ExperimentResult, ExperimentStatus,
    OptimizationConfig, PerformanceMetric,
};

use crate::errors::{Result, TunerError};

/// Winner composite weights: latency 0.3, quality 0.4, error rate 0.3.
/// Fixed independently of the balanced search objective by design.
const COMPOSITE_LATENCY_WEIGHT: f64 = 0.3;
const COMPOSITE_QUALITY_WEIGHT: f64 = 0.4;
const COMPOSITE_ERROR_WEIGHT: f64 = 0.3;
/// Keeps the latency term bounded for near-zero means
const LATENCY_EPSILON: f64 = 0.1;

/// Experiment lifecycle manager
pub struct ExperimentManager {
    /// All experiments, live and historical
    experiments: Arc<DashMap<Uuid, ExperimentConfig>>,
    /// Per-arm observation buckets
    samples: Arc<DashMap<(Uuid, Arm), Vec<PerformanceMetric>>>,
    /// Running experiment per model (at most one)
    active_by_model: Arc<DashMap<String, Uuid>>,
}

impl ExperimentManager {
    pub fn new() -> Self {
        Self {
            experiments: Arc::new(DashMap::new()),
            samples: Arc::new(DashMap::new()),
            active_by_model: Arc::new(DashMap::new()),
        }
    }

    /// Create a new experiment for a model and start it immediately.
    ///
    /// Validates the traffic split and duration; rejects a second
    /// concurrent experiment for the same model.
    pub fn create(
        &self,
        model: impl Into<String>,
        config_a: OptimizationConfig,
        config_b: OptimizationConfig,
        traffic_split: f64,
        duration_hours: f64,
    ) -> Result<Uuid> {
        let model = model.into();

        if !(0.0..=1.0).contains(&traffic_split) {
            return Err(TunerError::InvalidParameter(format!(
                "Traffic split must be in [0, 1], got {traffic_split}"
            )));
        }
        if duration_hours <= 0.0 {
            return Err(TunerError::InvalidParameter(format!(
                "Duration must be positive, got {duration_hours}"
            )));
        }

        let experiment =
            ExperimentConfig::new(model.clone(), config_a, config_b, traffic_split, duration_hours);
        let id = experiment.id;

        self.samples.insert((id, Arm::A), Vec::new());
        self.samples.insert((id, Arm::B), Vec::new());
        self.experiments.insert(id, experiment);

        // Claiming the per-model slot under its entry lock keeps two
        // concurrent creates from both passing an is-active check
        match self.active_by_model.entry(model.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                let still_running = self
                    .experiments
                    .get(&existing)
                    .map(|e| e.status == ExperimentStatus::Running)
                    .unwrap_or(false);
                if still_running {
                    self.experiments.remove(&id);
                    self.samples.remove(&(id, Arm::A));
                    self.samples.remove(&(id, Arm::B));
                    return Err(TunerError::InvalidState(format!(
                        "Model {model} already has an active experiment: {existing}"
                    )));
                }
                occupied.insert(id);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }

        info!(%id, %model, traffic_split, duration_hours, "created experiment");
        Ok(id)
    }

    /// Configuration a caller should use while the experiment runs.
    ///
    /// Keyed callers are bucketed deterministically: the same key always
    /// lands on the same arm for a given experiment. Anonymous callers
    /// get a uniform random draw. Once the experiment is terminal this
    /// keeps returning arm A so in-flight callers are never disrupted.
    pub fn assign(&self, id: &Uuid, caller_key: Option<&str>) -> Result<OptimizationConfig> {
        self.assign_arm(id, caller_key).map(|(_, config)| config)
    }

    /// Like `assign`, also reporting which arm was chosen so the caller
    /// can attribute the resulting metric
    pub fn assign_arm(
        &self,
        id: &Uuid,
        caller_key: Option<&str>,
    ) -> Result<(Arm, OptimizationConfig)> {
        let experiment = self
            .experiments
            .get(id)
            .ok_or_else(|| TunerError::ExperimentNotFound(id.to_string()))?;

        if experiment.status.is_terminal() {
            return Ok((Arm::A, experiment.config_a.clone()));
        }

        let bucket = match caller_key {
            Some(key) => stable_unit_hash(id, key),
            None => rand::random::<f64>(),
        };

        if bucket < experiment.traffic_split {
            Ok((Arm::A, experiment.config_a.clone()))
        } else {
            Ok((Arm::B, experiment.config_b.clone()))
        }
    }

    /// Record an observation under an arm. Safe for concurrent callers.
    /// Recording against a terminal experiment is a no-op so stragglers
    /// from in-flight requests are absorbed silently.
    pub fn record(&self, id: &Uuid, arm: Arm, metric: PerformanceMetric) -> Result<()> {
        let experiment = self
            .experiments
            .get(id)
            .ok_or_else(|| TunerError::ExperimentNotFound(id.to_string()))?;

        if experiment.status.is_terminal() {
            debug!(%id, %arm, "dropping observation for terminal experiment");
            return Ok(());
        }
        drop(experiment);

        self.samples
            .entry((*id, arm))
            .or_default()
            .push(metric);
        Ok(())
    }

    /// Finalize an experiment and return its result.
    ///
    /// Idempotent: the first caller to move the experiment out of
    /// Running computes and stores the result; every later call (manual
    /// or sweep-driven) returns the stored value unchanged.
    pub fn finalize(&self, id: &Uuid) -> Result<ExperimentResult> {
        // The exclusive entry lock makes the status check-and-set atomic
        let mut experiment = self
            .experiments
            .get_mut(id)
            .ok_or_else(|| TunerError::ExperimentNotFound(id.to_string()))?;

        if let Some(result) = &experiment.result {
            return Ok(result.clone());
        }

        let result = self.compute_result(id);

        if experiment.status == ExperimentStatus::Running {
            experiment.status = ExperimentStatus::Completed;
        }
        experiment.result = Some(result.clone());
        let model = experiment.model.clone();
        drop(experiment);

        self.clear_active(&model, id);

        info!(
            %id,
            %model,
            winner = result.winner.map(|w| w.to_string()).unwrap_or_else(|| "none".to_string()),
            confidence = ?result.confidence,
            "finalized experiment"
        );
        Ok(result)
    }

    /// Stop an experiment without waiting for its duration.
    ///
    /// Transitions Running to Stopped and stores a result computed from
    /// whatever data exists (the insufficient-data shape when an arm is
    /// empty). Assignment stops branching immediately; later `finalize`
    /// calls return this stored result and the status stays Stopped.
    pub fn stop(&self, id: &Uuid) -> Result<ExperimentResult> {
        let mut experiment = self
            .experiments
            .get_mut(id)
            .ok_or_else(|| TunerError::ExperimentNotFound(id.to_string()))?;

        if let Some(result) = &experiment.result {
            return Ok(result.clone());
        }

        experiment.status = ExperimentStatus::Stopped;
        let result = self.compute_result(id);
        experiment.result = Some(result.clone());
        let model = experiment.model.clone();
        drop(experiment);

        self.clear_active(&model, id);

        info!(%id, %model, "stopped experiment");
        Ok(result)
    }

    /// Finalize every running experiment whose duration has elapsed.
    /// Returns the finalized (id, result) pairs.
    pub fn finalize_due(&self, now: DateTime<Utc>) -> Vec<(Uuid, ExperimentResult)> {
        let due: Vec<Uuid> = self
            .experiments
            .iter()
            .filter(|e| e.status == ExperimentStatus::Running && e.is_due(now))
            .map(|e| e.id)
            .collect();

        let mut finalized = Vec::new();
        for id in due {
            match self.finalize(&id) {
                Ok(result) => finalized.push((id, result)),
                Err(e) => warn!(%id, error = %e, "failed to finalize due experiment"),
            }
        }
        finalized
    }

    /// The running experiment for a model, if any
    pub fn active_for_model(&self, model: &str) -> Option<Uuid> {
        let id = *self.active_by_model.get(model)?;
        let running = self
            .experiments
            .get(&id)
            .map(|e| e.status == ExperimentStatus::Running)
            .unwrap_or(false);
        if running {
            Some(id)
        } else {
            None
        }
    }

    /// Experiment record by id
    pub fn get(&self, id: &Uuid) -> Option<ExperimentConfig> {
        self.experiments.get(id).map(|e| e.clone())
    }

    /// All experiments
    pub fn list(&self) -> Vec<ExperimentConfig> {
        self.experiments.iter().map(|e| e.clone()).collect()
    }

    /// Currently running experiments
    pub fn running(&self) -> Vec<ExperimentConfig> {
        self.experiments
            .iter()
            .filter(|e| e.status == ExperimentStatus::Running)
            .map(|e| e.clone())
            .collect()
    }

    /// Samples recorded under an arm so far
    pub fn sample_count(&self, id: &Uuid, arm: Arm) -> usize {
        self.samples.get(&(*id, arm)).map(|s| s.len()).unwrap_or(0)
    }

    fn clear_active(&self, model: &str, id: &Uuid) {
        self.active_by_model
            .remove_if(model, |_, active_id| active_id == id);
    }

    /// Compute a result from the current per-arm snapshots
    fn compute_result(&self, id: &Uuid) -> ExperimentResult {
        let snapshot = |arm: Arm| {
            self.samples
                .get(&(*id, arm))
                .map(|s| s.clone())
                .unwrap_or_default()
        };
        let observations_a = snapshot(Arm::A);
        let observations_b = snapshot(Arm::B);

        let arm_a = ArmStats::from_observations(&observations_a);
        let arm_b = ArmStats::from_observations(&observations_b);

        if arm_a.sample_size == 0 || arm_b.sample_size == 0 {
            return ExperimentResult {
                winner: None,
                confidence: Confidence::Low,
                recommendation: format!(
                    "Insufficient data: arm A has {} samples, arm B has {}. No winner declared.",
                    arm_a.sample_size, arm_b.sample_size
                ),
                insufficient_data: true,
                quality_p_value: None,
                arm_a,
                arm_b,
                concluded_at: Utc::now(),
            };
        }

        let score_a = composite_score(&arm_a);
        let score_b = composite_score(&arm_b);
        let winner = if score_a > score_b { Arm::A } else { Arm::B };

        let confidence =
            Confidence::from_min_samples(arm_a.sample_size.min(arm_b.sample_size));

        let (winning, losing) = match winner {
            Arm::A => (&arm_a, &arm_b),
            Arm::B => (&arm_b, &arm_a),
        };
        let quality_gain = (winning.mean_quality - losing.mean_quality) * 100.0;
        let latency_gain = if losing.mean_latency_secs > 0.0 {
            (losing.mean_latency_secs - winning.mean_latency_secs) / losing.mean_latency_secs
                * 100.0
        } else {
            0.0
        };
        let recommendation = format!(
            "Configuration {winner} won with {quality_gain:.1}% quality improvement and {latency_gain:.1}% latency improvement."
        );

        ExperimentResult {
            winner: Some(winner),
            confidence,
            quality_p_value: quality_comparison_p_value(&arm_a, &arm_b),
            arm_a,
            arm_b,
            recommendation,
            insufficient_data: false,
            concluded_at: Utc::now(),
        }
    }
}

impl Default for ExperimentManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Composite winner score for one arm
fn composite_score(stats: &ArmStats) -> f64 {
    COMPOSITE_LATENCY_WEIGHT * (1.0 / (stats.mean_latency_secs + LATENCY_EPSILON))
        + COMPOSITE_QUALITY_WEIGHT * stats.mean_quality
        + COMPOSITE_ERROR_WEIGHT * (1.0 - stats.mean_error_rate)
}

/// Map (experiment id, caller key) onto a stable value in [0, 1).
///
/// FxHash over the id and key; the id is mixed in so one caller can land
/// on different arms across different experiments.
fn stable_unit_hash(id: &Uuid, key: &str) -> f64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(id.as_bytes());
    hasher.write(key.as_bytes());
    let hash = hasher.finish();

    // Top 53 bits give a uniform double in [0, 1)
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

/// Advisory two-sample z comparison of mean quality between the arms.
/// None when the pooled standard error degenerates.
fn quality_comparison_p_value(arm_a: &ArmStats, arm_b: &ArmStats) -> Option<f64> {
    if arm_a.sample_size < 2 || arm_b.sample_size < 2 {
        return None;
    }

    let var_a = arm_a.stddev_quality.powi(2) / arm_a.sample_size as f64;
    let var_b = arm_b.stddev_quality.powi(2) / arm_b.sample_size as f64;
    let se = (var_a + var_b).sqrt();
    if se == 0.0 || !se.is_finite() {
        return None;
    }

    let z = (arm_a.mean_quality - arm_b.mean_quality) / se;
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some(2.0 * (1.0 - normal.cdf(z.abs())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_configs(model: &str) -> (OptimizationConfig, OptimizationConfig) {
        let a = OptimizationConfig::default_for(model);
        let mut b = a.clone();
        b.temperature = (a.temperature + 0.15).min(1.0);
        (a, b)
    }

    fn manager_with_experiment() -> (ExperimentManager, Uuid) {
        let manager = ExperimentManager::new();
        let (a, b) = two_configs("m1");
        let id = manager.create("m1", a, b, 0.5, 6.0).unwrap();
        (manager, id)
    }

    #[test]
    fn test_create_validates_split() {
        let manager = ExperimentManager::new();
        let (a, b) = two_configs("m1");
        assert!(manager.create("m1", a, b, 1.5, 6.0).is_err());
    }

    #[test]
    fn test_create_validates_duration() {
        let manager = ExperimentManager::new();
        let (a, b) = two_configs("m1");
        assert!(manager.create("m1", a, b, 0.5, 0.0).is_err());
    }

    #[test]
    fn test_one_active_experiment_per_model() {
        let (manager, _) = manager_with_experiment();
        let (a, b) = two_configs("m1");
        assert!(manager.create("m1", a.clone(), b.clone(), 0.5, 6.0).is_err());

        // A different model is fine
        assert!(manager.create("m2", a, b, 0.5, 6.0).is_ok());
    }

    #[test]
    fn test_keyed_assignment_is_deterministic() {
        let (manager, id) = manager_with_experiment();

        let (first_arm, first_config) = manager.assign_arm(&id, Some("user-42")).unwrap();
        for _ in 0..50 {
            let (arm, config) = manager.assign_arm(&id, Some("user-42")).unwrap();
            assert_eq!(arm, first_arm);
            assert_eq!(config, first_config);
        }
    }

    #[test]
    fn test_keyless_assignment_approximates_split() {
        let (manager, id) = manager_with_experiment();

        let mut arm_a = 0;
        for _ in 0..1000 {
            let (arm, _) = manager.assign_arm(&id, None).unwrap();
            if arm == Arm::A {
                arm_a += 1;
            }
        }

        // Statistical: within a few points of the 0.5 split
        assert!((400..=600).contains(&arm_a), "observed {arm_a}/1000 on arm A");
    }

    #[test]
    fn test_keyed_assignment_covers_both_arms() {
        let (manager, id) = manager_with_experiment();

        let mut arm_a = 0;
        for i in 0..200 {
            let key = format!("caller-{i}");
            let (arm, _) = manager.assign_arm(&id, Some(&key)).unwrap();
            if arm == Arm::A {
                arm_a += 1;
            }
        }
        assert!(arm_a > 0 && arm_a < 200);
    }

    #[test]
    fn test_assign_after_terminal_returns_arm_a() {
        let (manager, id) = manager_with_experiment();
        manager.record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.8)).unwrap();
        manager.record(&id, Arm::B, PerformanceMetric::new("m1", 1.0, 0.8)).unwrap();
        manager.finalize(&id).unwrap();

        for key in [Some("anyone"), None] {
            let (arm, _) = manager.assign_arm(&id, key).unwrap();
            assert_eq!(arm, Arm::A);
        }
    }

    #[test]
    fn test_record_after_terminal_is_noop() {
        let (manager, id) = manager_with_experiment();
        manager.record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.8)).unwrap();
        manager.record(&id, Arm::B, PerformanceMetric::new("m1", 1.0, 0.8)).unwrap();
        manager.finalize(&id).unwrap();

        let before = manager.sample_count(&id, Arm::A);
        manager.record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.8)).unwrap();
        assert_eq!(manager.sample_count(&id, Arm::A), before);
    }

    #[test]
    fn test_finalize_picks_composite_winner() {
        let (manager, id) = manager_with_experiment();

        for _ in 0..200 {
            manager
                .record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.82))
                .unwrap();
            manager
                .record(&id, Arm::B, PerformanceMetric::new("m1", 1.4, 0.78))
                .unwrap();
        }

        let result = manager.finalize(&id).unwrap();
        assert_eq!(result.winner, Some(Arm::A));
        assert_eq!(result.confidence, Confidence::High);
        assert!(!result.insufficient_data);
        assert!(result.recommendation.contains("Configuration A"));
        assert_eq!(result.arm_a.sample_size, 200);

        let experiment = manager.get(&id).unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Completed);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let (manager, id) = manager_with_experiment();
        for _ in 0..10 {
            manager
                .record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.9))
                .unwrap();
            manager
                .record(&id, Arm::B, PerformanceMetric::new("m1", 2.0, 0.6))
                .unwrap();
        }

        let first = manager.finalize(&id).unwrap();
        let second = manager.finalize(&id).unwrap();
        assert_eq!(first, second);

        // Even with more data arriving, the stored result never changes
        manager
            .record(&id, Arm::B, PerformanceMetric::new("m1", 0.1, 1.0))
            .unwrap();
        let third = manager.finalize(&id).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_finalize_with_empty_arm_is_insufficient_data() {
        let (manager, id) = manager_with_experiment();
        for _ in 0..5 {
            manager
                .record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.9))
                .unwrap();
        }

        let result = manager.finalize(&id).unwrap();
        assert!(result.insufficient_data);
        assert_eq!(result.winner, None);
        assert_eq!(result.arm_b.sample_size, 0);

        // Still transitions to completed
        let experiment = manager.get(&id).unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Completed);
    }

    #[test]
    fn test_stop_then_finalize_keeps_stopped_status() {
        let (manager, id) = manager_with_experiment();
        for _ in 0..3 {
            manager
                .record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.9))
                .unwrap();
            manager
                .record(&id, Arm::B, PerformanceMetric::new("m1", 1.2, 0.8))
                .unwrap();
        }

        let stopped = manager.stop(&id).unwrap();
        let finalized = manager.finalize(&id).unwrap();
        assert_eq!(stopped, finalized);

        let experiment = manager.get(&id).unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Stopped);

        // The model is free for a new experiment
        assert!(manager.active_for_model("m1").is_none());
    }

    #[test]
    fn test_finalize_due_sweeps_elapsed_experiments() {
        let (manager, id) = manager_with_experiment();
        manager
            .record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.9))
            .unwrap();
        manager
            .record(&id, Arm::B, PerformanceMetric::new("m1", 1.1, 0.8))
            .unwrap();

        // Not yet due
        assert!(manager.finalize_due(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::hours(7);
        let finalized = manager.finalize_due(later);
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].0, id);
    }

    #[test]
    fn test_concurrent_finalize_single_result() {
        use std::thread;

        let (manager, id) = manager_with_experiment();
        for _ in 0..50 {
            manager
                .record(&id, Arm::A, PerformanceMetric::new("m1", 1.0, 0.9))
                .unwrap();
            manager
                .record(&id, Arm::B, PerformanceMetric::new("m1", 1.5, 0.7))
                .unwrap();
        }

        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let id = id;
            handles.push(thread::spawn(move || manager.finalize(&id).unwrap()));
        }

        let results: Vec<ExperimentResult> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
    }

    #[test]
    fn test_stable_unit_hash_range_and_stability() {
        let id = Uuid::new_v4();
        for i in 0..1000 {
            let key = format!("key-{i}");
            let value = stable_unit_hash(&id, &key);
            assert!((0.0..1.0).contains(&value));
            assert_eq!(value, stable_unit_hash(&id, &key));
        }
    }

    #[test]
    fn test_composite_score_favors_quality_weighting() {
        let fast_poor = ArmStats {
            sample_size: 100,
            mean_latency_secs: 0.5,
            stddev_latency_secs: 0.0,
            mean_quality: 0.2,
            stddev_quality: 0.0,
            mean_error_rate: 0.5,
            throughput_rps: 1.0,
        };
        let slow_good = ArmStats {
            mean_latency_secs: 1.5,
            mean_quality: 0.95,
            mean_error_rate: 0.0,
            ..fast_poor.clone()
        };

        // 0.3/0.6 + 0.08 + 0.15 = 0.73 vs 0.3/1.6 + 0.38 + 0.3 = 0.867
        assert!(composite_score(&slow_good) > composite_score(&fast_poor));
    }
}
