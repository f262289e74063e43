//! Configuration management for the LLM configuration tuner

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main tuner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Service identity and cadence
    pub service: ServiceConfig,

    /// Controller thresholds and perturbation deltas
    pub controller: ControllerConfig,

    /// Experiment defaults
    pub experiments: ExperimentsConfig,

    /// Configuration cache settings
    pub cache: CacheConfig,

    /// Durable store settings
    pub storage: StorageConfig,

    /// Observability settings
    pub observability: ObservabilityConfig,
}

impl TunerConfig {
    /// Load configuration from an optional YAML file, then override with
    /// environment variables prefixed with `TUNER_`.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(
            TunerConfig::default(),
        ));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("TUNER_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.optimization_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Optimization interval must be greater than zero".to_string(),
            ));
        }

        if self.service.retry_backoff_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Retry backoff must be greater than zero".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.experiments.default_traffic_split) {
            return Err(ConfigError::ValidationError(format!(
                "Traffic split must be in [0, 1], got {}",
                self.experiments.default_traffic_split
            )));
        }

        if self.experiments.default_duration_hours <= 0.0 {
            return Err(ConfigError::ValidationError(
                "Experiment duration must be positive".to_string(),
            ));
        }

        if self.controller.window_hours == 0 {
            return Err(ConfigError::ValidationError(
                "Controller window must be at least one hour".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Cache TTL must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            controller: ControllerConfig::default(),
            experiments: ExperimentsConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Service identity and cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Optimization loop interval in seconds
    pub optimization_interval_secs: u64,

    /// Backoff before retrying after a failed cycle, in seconds
    pub retry_backoff_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "llm-config-tuner".to_string(),
            optimization_interval_secs: 3600,
            retry_backoff_secs: 300,
        }
    }
}

/// Degradation thresholds and perturbation deltas for the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Trailing window scanned for degradation, in hours
    pub window_hours: u64,

    /// Mean quality below this flags a model
    pub quality_floor: f64,

    /// Mean latency above this (seconds) flags a model
    pub latency_ceiling_secs: f64,

    /// Mean error rate above this flags a model
    pub error_rate_ceiling: f64,

    /// Perturbation delta for temperature
    pub temperature_delta: f64,

    /// Perturbation delta for the nucleus cutoff
    pub top_p_delta: f64,

    /// Perturbation delta for the token budget
    pub max_tokens_delta: u32,

    /// Perturbation delta for both penalties
    pub penalty_delta: f64,

    /// Seed for the perturbation generator; unset means entropy-seeded
    pub rng_seed: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            quality_floor: 0.7,
            latency_ceiling_secs: 3.0,
            error_rate_ceiling: 0.1,
            temperature_delta: 0.1,
            top_p_delta: 0.05,
            max_tokens_delta: 200,
            penalty_delta: 0.1,
            rng_seed: None,
        }
    }
}

/// Experiment defaults used by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentsConfig {
    /// Default experiment duration in hours
    pub default_duration_hours: f64,

    /// Default fraction of keyed traffic routed to arm A
    pub default_traffic_split: f64,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            default_duration_hours: 6.0,
            default_traffic_split: 0.5,
        }
    }
}

/// Configuration cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time a computed configuration stays fresh, in seconds
    pub ttl_secs: u64,

    /// Maximum cached (model, objective) entries
    pub capacity: u64,

    /// Maximum history rows fed into one search
    pub search_history_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            capacity: 1024,
            search_history_limit: 1000,
        }
    }
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Timeout for a single persistence operation, in seconds
    pub op_timeout_secs: u64,

    /// Advisory retention horizon for performance metrics, in days
    pub retention_days: u64,

    /// In-memory cap on retained observations per model
    pub max_metrics_per_model: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            op_timeout_secs: 5,
            retention_days: 30,
            max_metrics_per_model: 10_000,
        }
    }
}

/// Observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (overridden by RUST_LOG when set)
    pub log_level: String,

    /// Enable structured JSON logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

/// Initialize the global tracing subscriber from the observability
/// settings. Safe to call once per process; later calls are ignored.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // A subscriber installed by the host process wins
    if config.json_logging {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
