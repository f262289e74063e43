//! A/B experiment records and results

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::configs::OptimizationConfig;
use crate::metrics::PerformanceMetric;

/// Status of an experiment. Transitions are one-way: `Running` moves to
/// exactly one of the terminal states and never back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Stopped,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExperimentStatus::Running)
    }
}

/// One of the two candidate configurations under comparison
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Arm {
    A,
    B,
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arm::A => f.write_str("A"),
            Arm::B => f.write_str("B"),
        }
    }
}

/// A live or historical A/B experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Unique experiment identifier
    pub id: Uuid,
    /// Model under test
    pub model: String,
    /// Arm A configuration (the incumbent)
    pub config_a: OptimizationConfig,
    /// Arm B configuration (the challenger)
    pub config_b: OptimizationConfig,
    /// Fraction of keyed traffic routed to arm A
    pub traffic_split: f64,
    /// Intended duration in hours
    pub duration_hours: f64,
    /// When the experiment started
    pub started_at: DateTime<Utc>,
    /// Current status
    pub status: ExperimentStatus,
    /// Result, present once the experiment reached a terminal state
    pub result: Option<ExperimentResult>,
}

impl ExperimentConfig {
    pub fn new(
        model: impl Into<String>,
        config_a: OptimizationConfig,
        config_b: OptimizationConfig,
        traffic_split: f64,
        duration_hours: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            config_a,
            config_b,
            traffic_split,
            duration_hours,
            started_at: Utc::now(),
            status: ExperimentStatus::Running,
            result: None,
        }
    }

    /// When the intended duration elapses
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::milliseconds((self.duration_hours * 3_600_000.0) as i64)
    }

    /// Whether the intended duration has elapsed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at()
    }
}

/// Aggregate statistics over the observations recorded under one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub sample_size: usize,
    pub mean_latency_secs: f64,
    pub stddev_latency_secs: f64,
    pub mean_quality: f64,
    pub stddev_quality: f64,
    pub mean_error_rate: f64,
    /// Observed requests per second over the arm's recording span
    pub throughput_rps: f64,
}

impl ArmStats {
    /// Statistics for an arm with no recorded observations
    pub fn empty() -> Self {
        Self {
            sample_size: 0,
            mean_latency_secs: 0.0,
            stddev_latency_secs: 0.0,
            mean_quality: 0.0,
            stddev_quality: 0.0,
            mean_error_rate: 0.0,
            throughput_rps: 0.0,
        }
    }

    /// Aggregate a snapshot of observations into arm statistics
    pub fn from_observations(observations: &[PerformanceMetric]) -> Self {
        if observations.is_empty() {
            return Self::empty();
        }

        let n = observations.len() as f64;
        let latencies: Vec<f64> = observations.iter().map(|m| m.response_time_secs).collect();
        let qualities: Vec<f64> = observations.iter().map(|m| m.quality_score).collect();

        let mean_latency = latencies.iter().sum::<f64>() / n;
        let mean_quality = qualities.iter().sum::<f64>() / n;
        let mean_error_rate = observations.iter().map(|m| m.error_rate()).sum::<f64>() / n;

        let stddev = |values: &[f64], mean: f64| {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
        };

        let throughput = if observations.len() > 1 {
            let first = observations.iter().map(|m| m.timestamp).min().unwrap();
            let last = observations.iter().map(|m| m.timestamp).max().unwrap();
            let span_secs = (last - first).num_milliseconds() as f64 / 1000.0;
            if span_secs > 0.0 {
                n / span_secs
            } else {
                0.0
            }
        } else {
            0.0
        };

        Self {
            sample_size: observations.len(),
            mean_latency_secs: mean_latency,
            stddev_latency_secs: stddev(&latencies, mean_latency),
            mean_quality,
            stddev_quality: stddev(&qualities, mean_quality),
            mean_error_rate,
            throughput_rps: throughput,
        }
    }
}

/// Sample-size-derived trust in a winner determination.
///
/// A coarse heuristic, not a significance test; callers needing rigor
/// should treat it as advisory.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Moderate,
    High,
}

impl Confidence {
    /// Derive confidence from the smaller of the two arm sample sizes
    pub fn from_min_samples(min_samples: usize) -> Self {
        match min_samples {
            0..=29 => Confidence::Low,
            30..=99 => Confidence::Moderate,
            _ => Confidence::High,
        }
    }

    /// Numeric confidence level
    pub fn level(&self) -> f64 {
        match self {
            Confidence::Low => 0.5,
            Confidence::Moderate => 0.7,
            Confidence::High => 0.9,
        }
    }
}

/// Outcome of a finalized experiment. Computed once from the immutable
/// per-arm observation snapshots and never recomputed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Winning arm, absent when either arm had no data
    pub winner: Option<Arm>,
    /// Sample-size-derived confidence
    pub confidence: Confidence,
    /// Arm A aggregates
    pub arm_a: ArmStats,
    /// Arm B aggregates
    pub arm_b: ArmStats,
    /// Human-readable summary of the winning arm's improvements
    pub recommendation: String,
    /// True when an arm had zero samples at finalization
    pub insufficient_data: bool,
    /// Advisory two-sample comparison of mean quality; never drives the
    /// winner or confidence
    pub quality_p_value: Option<f64>,
    /// When the result was produced
    pub concluded_at: DateTime<Utc>,
}

impl ExperimentResult {
    /// Stats for the given arm
    pub fn stats(&self, arm: Arm) -> &ArmStats {
        match arm {
            Arm::A => &self.arm_a,
            Arm::B => &self.arm_b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_terminality() {
        assert!(!ExperimentStatus::Running.is_terminal());
        assert!(ExperimentStatus::Completed.is_terminal());
        assert!(ExperimentStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_experiment_due() {
        let config = OptimizationConfig::default_for("m");
        let mut experiment =
            ExperimentConfig::new("m", config.clone(), config, 0.5, 6.0);

        let now = Utc::now();
        assert!(!experiment.is_due(now));

        experiment.started_at = now - Duration::hours(7);
        assert!(experiment.is_due(now));
    }

    #[test]
    fn test_arm_stats_aggregation() {
        let base = Utc::now();
        let observations: Vec<PerformanceMetric> = (0..10)
            .map(|i| {
                PerformanceMetric::new("m", 1.0 + i as f64 * 0.1, 0.8)
                    .with_error(i == 0)
                    .with_timestamp(base + Duration::seconds(i))
            })
            .collect();

        let stats = ArmStats::from_observations(&observations);
        assert_eq!(stats.sample_size, 10);
        assert!((stats.mean_latency_secs - 1.45).abs() < 1e-9);
        assert!((stats.mean_quality - 0.8).abs() < 1e-9);
        assert!((stats.mean_error_rate - 0.1).abs() < 1e-9);
        assert!(stats.throughput_rps > 0.0);
    }

    #[test]
    fn test_arm_stats_empty() {
        let stats = ArmStats::from_observations(&[]);
        assert_eq!(stats.sample_size, 0);
        assert_eq!(stats.mean_latency_secs, 0.0);
    }

    #[test]
    fn test_confidence_steps() {
        assert_eq!(Confidence::from_min_samples(10), Confidence::Low);
        assert_eq!(Confidence::from_min_samples(30), Confidence::Moderate);
        assert_eq!(Confidence::from_min_samples(99), Confidence::Moderate);
        assert_eq!(Confidence::from_min_samples(150), Confidence::High);
    }

    #[test]
    fn test_confidence_is_monotonic() {
        assert!(Confidence::from_min_samples(10) <= Confidence::from_min_samples(50));
        assert!(Confidence::from_min_samples(50) <= Confidence::from_min_samples(150));
        assert!(Confidence::Low.level() < Confidence::Moderate.level());
        assert!(Confidence::Moderate.level() < Confidence::High.level());
    }
}
