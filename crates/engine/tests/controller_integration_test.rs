//! Integration tests for the optimization control loop
//!
//! Drives controller cycles directly against an in-memory store:
//! degraded-model detection, automatic experiment launch, perturbation
//! bounds, and winner promotion after the sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use llm_tuner_config::TunerConfig;
use llm_tuner_engine::{
    CacheSettings, ConfigurationCache, ControllerSettings, ExperimentManager, MemoryTunerStore,
    MetricStore, ModelOptimizer, OptimizationController,
};
use llm_tuner_types::{Arm, ParameterBounds, PerformanceMetric};

struct Harness {
    metrics: Arc<MetricStore>,
    cache: Arc<ConfigurationCache>,
    experiments: Arc<ExperimentManager>,
    controller: OptimizationController,
}

fn build_harness(seed: u64) -> Harness {
    let config = TunerConfig::default();
    let metrics = Arc::new(MetricStore::new());
    let store = Arc::new(MemoryTunerStore::new());
    let cache = Arc::new(ConfigurationCache::new(
        metrics.clone(),
        store.clone(),
        CacheSettings::default(),
    ));
    let experiments = Arc::new(ExperimentManager::new());
    let controller = OptimizationController::new(
        ControllerSettings::from(&config),
        metrics.clone(),
        cache.clone(),
        experiments.clone(),
        store,
        Some(seed),
    );

    Harness {
        metrics,
        cache,
        experiments,
        controller,
    }
}

/// 24 hourly observations with the given means
fn record_hourly_history(metrics: &MetricStore, model: &str, latency: f64, quality: f64) {
    let now = Utc::now();
    for hour in 0..24 {
        metrics.record(
            PerformanceMetric::new(model, latency, quality)
                .with_timestamp(now - Duration::hours(hour)),
        );
    }
}

#[tokio::test]
async fn test_degraded_model_gets_an_experiment() {
    let harness = build_harness(7);

    // Mean quality 0.55 is under the 0.7 floor; latency is healthy
    record_hourly_history(&harness.metrics, "m1", 1.2, 0.55);

    // The perturbation draw may land outside the promising band on a
    // given cycle; a degraded model without an experiment is re-examined
    // every cycle until one launches.
    let mut launched = false;
    for _ in 0..20 {
        let report = harness.controller.run_cycle().await.unwrap();
        assert!(report.flagged.contains(&"m1".to_string()));
        if !report.launched.is_empty() {
            launched = true;
            break;
        }
    }
    assert!(launched, "no experiment launched for a degraded model");

    let running = harness.experiments.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].model, "m1");
}

#[tokio::test]
async fn test_healthy_model_is_left_alone() {
    let harness = build_harness(7);
    record_hourly_history(&harness.metrics, "m1", 1.0, 0.9);

    for _ in 0..5 {
        let report = harness.controller.run_cycle().await.unwrap();
        assert!(report.flagged.is_empty());
        assert!(report.launched.is_empty());
    }
    assert!(harness.experiments.running().is_empty());
}

#[tokio::test]
async fn test_high_latency_and_error_rate_also_flag() {
    let harness = build_harness(3);

    // Good quality but mean latency over the 3s ceiling
    record_hourly_history(&harness.metrics, "slow-model", 4.5, 0.9);

    // Good quality and latency, but a third of requests fail
    let now = Utc::now();
    for i in 0..24 {
        harness.metrics.record(
            PerformanceMetric::new("flaky-model", 1.0, 0.9)
                .with_error(i % 3 == 0)
                .with_timestamp(now - Duration::hours(i)),
        );
    }

    let report = harness.controller.run_cycle().await.unwrap();
    assert!(report.flagged.contains(&"slow-model".to_string()));
    assert!(report.flagged.contains(&"flaky-model".to_string()));
}

#[tokio::test]
async fn test_no_second_experiment_while_one_runs() {
    let harness = build_harness(11);
    record_hourly_history(&harness.metrics, "m1", 1.2, 0.5);

    let mut total_launched = 0;
    for _ in 0..20 {
        let report = harness.controller.run_cycle().await.unwrap();
        total_launched += report.launched.len();
    }

    // However many cycles run, the model never carries more than one
    // live experiment
    assert!(total_launched <= 1);
    assert!(harness.experiments.running().len() <= 1);
}

#[tokio::test]
async fn test_launched_arms_stay_inside_bounds() {
    let bounds = ParameterBounds::default();

    // Different seeds exercise different perturbation draws
    for seed in [1, 2, 3, 4, 5] {
        let harness = build_harness(seed);
        record_hourly_history(&harness.metrics, "m1", 1.2, 0.5);

        for _ in 0..20 {
            harness.controller.run_cycle().await.unwrap();
            if let Some(experiment) = harness.experiments.running().pop() {
                assert!(bounds.contains(&experiment.config_a));
                assert!(bounds.contains(&experiment.config_b));
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_sweep_finalizes_and_promotes_winner() {
    let harness = build_harness(5);

    // A short experiment whose arm B clearly wins
    let config_a = llm_tuner_types::OptimizationConfig::default_for("m1");
    let mut config_b = config_a.clone();
    config_b.temperature = 0.55;
    let id = harness
        .experiments
        .create("m1", config_a.clone(), config_b.clone(), 0.5, 0.000001)
        .unwrap();

    for _ in 0..50 {
        harness
            .experiments
            .record(&id, Arm::A, PerformanceMetric::new("m1", 2.0, 0.6))
            .unwrap();
        harness
            .experiments
            .record(&id, Arm::B, PerformanceMetric::new("m1", 0.9, 0.9))
            .unwrap();
    }

    // Let the tiny duration elapse, then sweep
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let report = harness.controller.run_cycle().await.unwrap();

    assert_eq!(report.finalized, vec![id]);
    assert_eq!(report.promoted, vec!["m1".to_string()]);

    let result = harness.experiments.get(&id).unwrap().result.unwrap();
    assert_eq!(result.winner, Some(Arm::B));

    // The promoted winner is now the served default
    let default = harness
        .cache
        .get("m1", llm_tuner_types::Objective::Balanced)
        .await;
    assert_eq!(default.temperature, config_b.temperature);
}

#[tokio::test]
async fn test_background_loop_runs_and_shuts_down() {
    let config = TunerConfig::default();
    let optimizer = ModelOptimizer::new(&config, Arc::new(MemoryTunerStore::new()));

    optimizer
        .record_metric(PerformanceMetric::new("m1", 1.2, 0.5))
        .await;

    let handle = optimizer.spawn_controller();
    // The first cycle runs immediately on spawn
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    handle.shutdown().await;

    // One observation is not degraded-window silence: the model was
    // scanned; whether an experiment launched depends on the draw. The
    // loop exiting cleanly is the property under test.
    assert!(optimizer.statistics().models >= 1);
}
