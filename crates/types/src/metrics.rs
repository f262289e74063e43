//! Per-request performance observations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single performance observation for one served request.
///
/// Created once after a model invocation and never mutated. The metric
/// store retains these for a rolling window; everything downstream
/// (search summaries, experiment arm statistics, degradation scans) is
/// computed from immutable snapshots of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    /// Model identifier the request was served with
    pub model: String,
    /// Response latency in seconds
    pub response_time_secs: f64,
    /// Resident memory attributed to the request, in megabytes
    pub memory_mb: f64,
    /// CPU usage during the request (percent)
    pub cpu_percent: f64,
    /// Quality score in [0.0, 1.0]
    pub quality_score: f64,
    /// Whether the request errored
    pub error: bool,
    /// Observed throughput at record time (requests per second)
    pub throughput_rps: f64,
    /// User satisfaction signal in [0.0, 1.0], when available
    pub user_satisfaction: f64,
    /// Context-retention sub-score in [0.0, 1.0]
    pub context_retention: f64,
    /// Coherence sub-score in [0.0, 1.0]
    pub coherence_score: f64,
    /// When the observation was made
    pub timestamp: DateTime<Utc>,
}

impl PerformanceMetric {
    /// Create a new observation with the required fields; resource and
    /// sub-score fields default to zero and can be filled via `with_*`.
    pub fn new(model: impl Into<String>, response_time_secs: f64, quality_score: f64) -> Self {
        Self {
            model: model.into(),
            response_time_secs,
            memory_mb: 0.0,
            cpu_percent: 0.0,
            quality_score: quality_score.clamp(0.0, 1.0),
            error: false,
            throughput_rps: 0.0,
            user_satisfaction: 0.0,
            context_retention: 0.0,
            coherence_score: 0.0,
            timestamp: Utc::now(),
        }
    }

    /// Mark the observation as a failed request
    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    /// Attach resource usage
    pub fn with_resources(mut self, memory_mb: f64, cpu_percent: f64) -> Self {
        self.memory_mb = memory_mb;
        self.cpu_percent = cpu_percent;
        self
    }

    /// Attach throughput observed at record time
    pub fn with_throughput(mut self, throughput_rps: f64) -> Self {
        self.throughput_rps = throughput_rps;
        self
    }

    /// Attach quality sub-scores (clamped to [0, 1])
    pub fn with_sub_scores(
        mut self,
        user_satisfaction: f64,
        context_retention: f64,
        coherence_score: f64,
    ) -> Self {
        self.user_satisfaction = user_satisfaction.clamp(0.0, 1.0);
        self.context_retention = context_retention.clamp(0.0, 1.0);
        self.coherence_score = coherence_score.clamp(0.0, 1.0);
        self
    }

    /// Override the observation timestamp (backfill, tests)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Error contribution of this observation: 1.0 for a failed request
    pub fn error_rate(&self) -> f64 {
        if self.error {
            1.0
        } else {
            0.0
        }
    }
}
