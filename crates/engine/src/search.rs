//! Bounded parameter search over the serving-parameter space
//!
//! Summarizes a window of performance history, then runs a deterministic
//! coordinate descent over {temperature, top_p, max_tokens,
//! frequency_penalty, presence_penalty}, maximizing the scoring function
//! selected by the objective. The search always terminates (fixed pass
//! and evaluation caps) and always returns a point inside the declared
//! bounds; on any numerical trouble it falls back to the starting
//! configuration.

use chrono::Timelike;
use llm_tuner_types::{Objective, OptimizationConfig, ParameterBounds, PerformanceMetric};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

/// Balanced-objective blend: 40% performance, 60% quality. Distinct from
/// the experiment winner composite by design.
const BALANCED_PERFORMANCE_WEIGHT: f64 = 0.4;
const BALANCED_QUALITY_WEIGHT: f64 = 0.6;

/// Aggregate view of a performance history window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub samples: usize,
    pub mean_latency_secs: f64,
    pub stddev_latency_secs: f64,
    pub mean_quality: f64,
    pub stddev_quality: f64,
    pub mean_memory_mb: f64,
    pub mean_error_rate: f64,
    /// Least-squares slope of latency over the window (positive = rising)
    pub latency_trend: f64,
    /// Least-squares slope of quality over the window
    pub quality_trend: f64,
    /// Hours of day with request volume above 1.2x the hourly mean.
    /// Descriptive output only; not part of the search objective.
    pub peak_hours: Vec<u32>,
}

impl MetricSummary {
    /// Summarize a window of observations
    pub fn from_history(history: &[PerformanceMetric]) -> Self {
        if history.is_empty() {
            return Self {
                samples: 0,
                mean_latency_secs: 0.0,
                stddev_latency_secs: 0.0,
                mean_quality: 0.0,
                stddev_quality: 0.0,
                mean_memory_mb: 0.0,
                mean_error_rate: 0.0,
                latency_trend: 0.0,
                quality_trend: 0.0,
                peak_hours: Vec::new(),
            };
        }

        let n = history.len() as f64;
        let latencies: Vec<f64> = history.iter().map(|m| m.response_time_secs).collect();
        let qualities: Vec<f64> = history.iter().map(|m| m.quality_score).collect();

        let mean = |values: &[f64]| values.iter().sum::<f64>() / n;
        let mean_latency = mean(&latencies);
        let mean_quality = mean(&qualities);
        let stddev = |values: &[f64], m: f64| {
            (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n).sqrt()
        };

        Self {
            samples: history.len(),
            mean_latency_secs: mean_latency,
            stddev_latency_secs: stddev(&latencies, mean_latency),
            mean_quality,
            stddev_quality: stddev(&qualities, mean_quality),
            mean_memory_mb: mean(&history.iter().map(|m| m.memory_mb).collect::<Vec<_>>()),
            mean_error_rate: mean(&history.iter().map(|m| m.error_rate()).collect::<Vec<_>>()),
            latency_trend: linear_trend(&latencies),
            quality_trend: linear_trend(&qualities),
            peak_hours: peak_hours(history),
        }
    }
}

/// Least-squares slope of `values` against their index
fn linear_trend(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Hours of day with request counts above 1.2x the mean hourly count
fn peak_hours(history: &[PerformanceMetric]) -> Vec<u32> {
    let mut counts = [0usize; 24];
    for metric in history {
        counts[metric.timestamp.hour() as usize] += 1;
    }

    let active: Vec<(u32, usize)> = counts
        .iter()
        .enumerate()
        .filter(|(_, &c)| c > 0)
        .map(|(h, &c)| (h as u32, c))
        .collect();
    if active.is_empty() {
        return Vec::new();
    }

    let mean = active.iter().map(|(_, c)| *c).sum::<usize>() as f64 / active.len() as f64;
    active
        .into_iter()
        .filter(|(_, c)| *c as f64 > mean * 1.2)
        .map(|(h, _)| h)
        .collect()
}

/// Search axes, in fixed order: temperature, top_p, max_tokens,
/// frequency_penalty, presence_penalty
type Params = [f64; 5];

/// Per-axis iteration cap within one descent pass
const MAX_LINE_STEPS: usize = 64;

/// Deterministic bounded optimizer for serving parameters
pub struct ParameterSearchEngine {
    bounds: ParameterBounds,
    /// Coordinate-descent passes; the step schedule halves each pass
    passes: usize,
}

impl ParameterSearchEngine {
    pub fn new() -> Self {
        Self {
            bounds: ParameterBounds::default(),
            passes: 4,
        }
    }

    pub fn with_bounds(bounds: ParameterBounds) -> Self {
        Self { bounds, passes: 4 }
    }

    /// Produce a candidate configuration for `model` from its history.
    ///
    /// Empty history returns the model's fixed default so callers always
    /// have a usable configuration. The result is deterministic for a
    /// given (model, history, objective).
    pub fn search(
        &self,
        model: &str,
        history: &[PerformanceMetric],
        objective: Objective,
    ) -> OptimizationConfig {
        let start = OptimizationConfig::default_for(model).with_objective(objective);

        if history.is_empty() {
            debug!(model, %objective, "no history; returning default configuration");
            return start;
        }

        let summary = MetricSummary::from_history(history);
        let optimized = match self.optimize(&start, objective) {
            Some(config) => config,
            None => {
                warn!(model, %objective, "parameter search failed to converge; keeping starting configuration");
                self.bounds.clamp(&start)
            }
        };

        let mut config =
            optimized.with_targets(summary.mean_latency_secs, summary.mean_quality);
        // Peak hours are descriptive output; they ride along in the
        // extension map, never in the numeric fields.
        config
            .extensions
            .insert("peak_hours".to_string(), json!(summary.peak_hours));
        config
    }

    /// Coordinate descent from the starting configuration. Returns None
    /// when scoring goes non-finite.
    fn optimize(&self, start: &OptimizationConfig, objective: Objective) -> Option<OptimizationConfig> {
        let mut params = self.clamp_params([
            start.temperature,
            start.top_p,
            start.max_tokens as f64,
            start.frequency_penalty,
            start.presence_penalty,
        ]);
        let mut best = score(&params, objective);
        if !best.is_finite() {
            return None;
        }

        let mut steps: Params = [0.1, 0.05, 256.0, 0.1, 0.1];

        for _ in 0..self.passes {
            for axis in 0..params.len() {
                // Line search along the axis in both directions; keep
                // stepping while the score strictly improves.
                for direction in [1.0, -1.0] {
                    for _ in 0..MAX_LINE_STEPS {
                        let mut candidate = params;
                        candidate[axis] += direction * steps[axis];
                        let candidate = self.clamp_params(candidate);
                        if candidate == params {
                            break;
                        }

                        let candidate_score = score(&candidate, objective);
                        if !candidate_score.is_finite() {
                            return None;
                        }
                        if candidate_score > best {
                            best = candidate_score;
                            params = candidate;
                        } else {
                            break;
                        }
                    }
                }
            }

            for step in steps.iter_mut() {
                *step /= 2.0;
            }
        }

        let mut config = start.clone();
        config.temperature = params[0];
        config.top_p = params[1];
        config.max_tokens = params[2].round() as u32;
        config.frequency_penalty = params[3];
        config.presence_penalty = params[4];
        config.last_updated = chrono::Utc::now();
        Some(self.bounds.clamp(&config))
    }

    fn clamp_params(&self, params: Params) -> Params {
        [
            params[0].clamp(self.bounds.temp_min, self.bounds.temp_max),
            params[1].clamp(self.bounds.top_p_min, self.bounds.top_p_max),
            params[2].clamp(
                self.bounds.max_tokens_min as f64,
                self.bounds.max_tokens_max as f64,
            ),
            params[3].clamp(self.bounds.penalty_min, self.bounds.penalty_max),
            params[4].clamp(self.bounds.penalty_min, self.bounds.penalty_max),
        ]
    }
}

impl Default for ParameterSearchEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Score a parameter point under the given objective (higher is better)
fn score(params: &Params, objective: Objective) -> f64 {
    match objective {
        Objective::Performance => performance_score(params),
        Objective::Quality => quality_score(params),
        Objective::Balanced => {
            BALANCED_PERFORMANCE_WEIGHT * performance_score(params)
                + BALANCED_QUALITY_WEIGHT * quality_score(params)
        }
    }
}

/// Latency proxy: rewards low temperature, low cutoff, small budgets,
/// and low penalties
fn performance_score(params: &Params) -> f64 {
    let [temperature, top_p, max_tokens, frequency_penalty, presence_penalty] = *params;

    1.0 - temperature * 0.3
        + (1.0 - top_p) * 0.2
        + (1.0 - max_tokens / 4096.0) * 0.3
        - (frequency_penalty + presence_penalty) * 0.1
}

/// Richness proxy: rewards temperature near 0.7, cutoff near 0.9, a
/// budget of at least 1000 tokens, and penalties near 0.5
fn quality_score(params: &Params) -> f64 {
    let [temperature, top_p, max_tokens, frequency_penalty, presence_penalty] = *params;

    let mut score = 1.0 - (temperature - 0.7).abs() * 2.0;
    score += 1.0 - (top_p - 0.9).abs() * 2.0;
    if max_tokens >= 1000.0 {
        score += 0.3;
    }
    score
        + (1.0 - (frequency_penalty - 0.5).abs() - (presence_penalty - 0.5).abs()) * 0.2
}
