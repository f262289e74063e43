//! Time-bounded cache of optimal configurations
//!
//! Keyed by (model, objective) with a TTL (one hour by default).
//! Population goes through moka's `get_with`, so concurrent callers for
//! the same key coalesce onto a single search instead of racing
//! duplicate ones. Computed configurations are written through to the
//! durable store best-effort.

use chrono::Duration as ChronoDuration;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use llm_tuner_types::{Objective, OptimizationConfig};

use crate::metric_store::MetricStore;
use crate::search::ParameterSearchEngine;
use crate::storage::{best_effort, TunerStore};

type CacheKey = (String, Objective);

/// Cache construction settings
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Freshness window for a computed configuration
    pub ttl: Duration,
    /// Maximum cached (model, objective) entries
    pub capacity: u64,
    /// History window fed into a search
    pub history_window: ChronoDuration,
    /// Cap on history rows fed into one search
    pub history_limit: usize,
    /// Timeout for write-through persistence
    pub op_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            capacity: 1024,
            history_window: ChronoDuration::hours(24),
            history_limit: 1000,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// TTL cache over the parameter search engine
pub struct ConfigurationCache {
    cache: Cache<CacheKey, OptimizationConfig>,
    search: ParameterSearchEngine,
    metrics: Arc<MetricStore>,
    store: Arc<dyn TunerStore>,
    settings: CacheSettings,
}

impl ConfigurationCache {
    pub fn new(
        metrics: Arc<MetricStore>,
        store: Arc<dyn TunerStore>,
        settings: CacheSettings,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.capacity)
            .time_to_live(settings.ttl)
            .build();

        Self {
            cache,
            search: ParameterSearchEngine::new(),
            metrics,
            store,
            settings,
        }
    }

    /// Current optimal configuration for (model, objective).
    ///
    /// Returns the cached value while it is fresh; otherwise runs the
    /// search over recent history, persists the result best-effort, and
    /// caches it. Concurrent callers for the same key await a single
    /// computation. Never fails: with no history the model's default
    /// configuration comes back.
    pub async fn get(&self, model: &str, objective: Objective) -> OptimizationConfig {
        let key = (model.to_string(), objective);
        self.cache
            .get_with(key, self.compute(model, objective))
            .await
    }

    async fn compute(&self, model: &str, objective: Objective) -> OptimizationConfig {
        let mut history = self.metrics.window(model, self.settings.history_window);
        if history.len() > self.settings.history_limit {
            let excess = history.len() - self.settings.history_limit;
            history.drain(..excess);
        }

        debug!(
            model,
            %objective,
            samples = history.len(),
            "computing optimal configuration"
        );
        let config = self.search.search(model, &history, objective);

        best_effort(
            "save_config",
            self.settings.op_timeout,
            self.store.save_config(&config),
        )
        .await;

        config
    }

    /// Drop all cached entries for a model (every objective)
    pub async fn invalidate(&self, model: &str) {
        for objective in Objective::ALL {
            self.cache
                .invalidate(&(model.to_string(), objective))
                .await;
        }
    }

    /// Install a configuration as the model's new default for its
    /// objective, replacing whatever the cache held, and persist it.
    /// Used when an experiment's winning arm is promoted.
    pub async fn promote(&self, config: OptimizationConfig) {
        info!(
            model = %config.model,
            objective = %config.objective,
            temperature = config.temperature,
            top_p = config.top_p,
            "promoting configuration to default"
        );

        self.invalidate(&config.model).await;
        best_effort(
            "save_config",
            self.settings.op_timeout,
            self.store.save_config(&config),
        )
        .await;
        self.cache
            .insert((config.model.clone(), config.objective), config)
            .await;
    }

    /// Number of live cache entries
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
