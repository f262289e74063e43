//! Serving parameter configurations, bounds, and per-model defaults

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Optimization goal a configuration was tuned for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Favor low latency and small outputs
    Performance,
    /// Favor rich, coherent answers
    Quality,
    /// Weighted blend of the two
    Balanced,
}

impl Objective {
    /// All objectives, in a fixed order (used for cache invalidation)
    pub const ALL: [Objective; 3] = [
        Objective::Performance,
        Objective::Quality,
        Objective::Balanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Objective::Performance => "performance",
            Objective::Quality => "quality",
            Objective::Balanced => "balanced",
        }
    }
}

impl Default for Objective {
    fn default() -> Self {
        Objective::Balanced
    }
}

impl std::fmt::Display for Objective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed search box for serving parameters.
///
/// Every configuration the tuner produces, whether from a search or a
/// perturbation step, is clamped into these bounds before it is returned
/// or persisted. Bounds violations are never surfaced as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterBounds {
    pub temp_min: f64,
    pub temp_max: f64,
    pub top_p_min: f64,
    pub top_p_max: f64,
    pub max_tokens_min: u32,
    pub max_tokens_max: u32,
    pub penalty_min: f64,
    pub penalty_max: f64,
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            temp_min: 0.1,
            temp_max: 1.0,
            top_p_min: 0.1,
            top_p_max: 1.0,
            max_tokens_min: 100,
            max_tokens_max: 4096,
            penalty_min: 0.0,
            penalty_max: 2.0,
        }
    }
}

impl ParameterBounds {
    /// Check whether every numeric field of a configuration lies inside
    /// the box
    pub fn contains(&self, config: &OptimizationConfig) -> bool {
        config.temperature >= self.temp_min
            && config.temperature <= self.temp_max
            && config.top_p >= self.top_p_min
            && config.top_p <= self.top_p_max
            && config.max_tokens >= self.max_tokens_min
            && config.max_tokens <= self.max_tokens_max
            && config.frequency_penalty >= self.penalty_min
            && config.frequency_penalty <= self.penalty_max
            && config.presence_penalty >= self.penalty_min
            && config.presence_penalty <= self.penalty_max
    }

    /// Clamp every numeric field of a configuration into the box
    pub fn clamp(&self, config: &OptimizationConfig) -> OptimizationConfig {
        let mut clamped = config.clone();
        clamped.temperature = config.temperature.clamp(self.temp_min, self.temp_max);
        clamped.top_p = config.top_p.clamp(self.top_p_min, self.top_p_max);
        clamped.max_tokens = config.max_tokens.clamp(self.max_tokens_min, self.max_tokens_max);
        clamped.frequency_penalty = config
            .frequency_penalty
            .clamp(self.penalty_min, self.penalty_max);
        clamped.presence_penalty = config
            .presence_penalty
            .clamp(self.penalty_min, self.penalty_max);
        clamped
    }
}

/// A serving parameter set for one model.
///
/// Superseded by replacement whenever an optimization run or a winning
/// experiment arm produces a better one; individual fields are never
/// edited in place. Free-form metadata lives in `extensions`, kept
/// strictly apart from the validated numeric fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Model identifier this configuration applies to
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling cutoff
    pub top_p: f64,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Frequency penalty
    pub frequency_penalty: f64,
    /// Presence penalty
    pub presence_penalty: f64,
    /// Stop sequences
    pub stop_sequences: Vec<String>,
    /// Objective this configuration was optimized for
    pub objective: Objective,
    /// Mean latency anchor from the history the search ran over (seconds)
    pub performance_target: f64,
    /// Mean quality anchor from the history the search ran over
    pub quality_target: f64,
    /// When this configuration was produced
    pub last_updated: DateTime<Utc>,
    /// Free-form metadata, never mixed into the numeric fields
    #[serde(default)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl OptimizationConfig {
    /// Fixed default configuration for a model.
    ///
    /// Known models get tuned starting points; anything else falls back
    /// to the llama3.1 values. This is the guaranteed answer when no
    /// history exists yet.
    pub fn default_for(model: &str) -> Self {
        let (temperature, top_p, max_tokens, frequency_penalty, presence_penalty) = match model {
            "mistral" => (0.6, 0.95, 1024, 0.1, 0.1),
            "codellama" => (0.3, 0.8, 3072, 0.2, 0.0),
            // llama3.1 and the global fallback
            _ => (0.7, 0.9, 2048, 0.0, 0.0),
        };

        Self {
            model: model.to_string(),
            temperature,
            top_p,
            max_tokens,
            frequency_penalty,
            presence_penalty,
            stop_sequences: Vec::new(),
            objective: Objective::default(),
            performance_target: 2.0,
            quality_target: 0.7,
            last_updated: Utc::now(),
            extensions: HashMap::new(),
        }
    }

    /// Set the objective label
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    /// Set the search anchors
    pub fn with_targets(mut self, performance_target: f64, quality_target: f64) -> Self {
        self.performance_target = performance_target;
        self.quality_target = quality_target;
        self
    }
}
