//! Append-only per-model performance observation log
//!
//! Request-serving paths append observations concurrently; the search
//! engine and the controller read time-windowed slices. Retention is
//! advisory: a per-model cap bounds memory, and the controller prunes
//! past the configured horizon opportunistically.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use llm_tuner_types::PerformanceMetric;
use tracing::debug;

/// Default in-memory cap on retained observations per model
pub const DEFAULT_MAX_PER_MODEL: usize = 10_000;

/// Concurrent in-memory observation log
pub struct MetricStore {
    metrics: DashMap<String, Vec<PerformanceMetric>>,
    max_per_model: usize,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PER_MODEL)
    }

    /// Create a store with a custom per-model observation cap
    pub fn with_capacity(max_per_model: usize) -> Self {
        Self {
            metrics: DashMap::new(),
            max_per_model: max_per_model.max(1),
        }
    }

    /// Append an observation. Never rejects valid input; safe to call
    /// from many request-serving paths at once.
    pub fn record(&self, metric: PerformanceMetric) {
        let mut entry = self.metrics.entry(metric.model.clone()).or_default();
        entry.push(metric);

        // Past the cap, drop the oldest observations
        if entry.len() > self.max_per_model {
            let excess = entry.len() - self.max_per_model;
            entry.drain(..excess);
        }
    }

    /// All observations for a model within the trailing `window`, in
    /// insertion order. Empty when the model has no recent history.
    pub fn window(&self, model: &str, window: Duration) -> Vec<PerformanceMetric> {
        let cutoff = Utc::now() - window;
        self.window_since(model, cutoff)
    }

    /// All observations for a model at or after `cutoff`, in insertion
    /// order
    pub fn window_since(&self, model: &str, cutoff: DateTime<Utc>) -> Vec<PerformanceMetric> {
        self.metrics
            .get(model)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|m| m.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Models with any recorded history
    pub fn models(&self) -> Vec<String> {
        self.metrics.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of retained observations for a model
    pub fn len(&self, model: &str) -> usize {
        self.metrics.get(model).map(|e| e.len()).unwrap_or(0)
    }

    /// Total retained observations across all models
    pub fn total(&self) -> usize {
        self.metrics.iter().map(|e| e.len()).sum()
    }

    /// Drop observations older than `horizon`. Advisory; returns the
    /// number of observations removed.
    pub fn prune(&self, horizon: Duration) -> usize {
        let cutoff = Utc::now() - horizon;
        let mut removed = 0;

        for mut entry in self.metrics.iter_mut() {
            let before = entry.len();
            entry.retain(|m| m.timestamp >= cutoff);
            removed += before - entry.len();
        }

        if removed > 0 {
            debug!(removed, "pruned performance metrics past retention horizon");
        }
        removed
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_at(model: &str, hours_ago: i64) -> PerformanceMetric {
        PerformanceMetric::new(model, 1.0, 0.8)
            .with_timestamp(Utc::now() - Duration::hours(hours_ago))
    }

    #[test]
    fn test_record_and_window() {
        let store = MetricStore::new();
        store.record(metric_at("m1", 30));
        store.record(metric_at("m1", 2));
        store.record(metric_at("m1", 1));
        store.record(metric_at("m2", 1));

        let recent = store.window("m1", Duration::hours(24));
        assert_eq!(recent.len(), 2);
        // Insertion order is preserved
        assert!(recent[0].timestamp < recent[1].timestamp);
    }

    #[test]
    fn test_window_unknown_model_is_empty() {
        let store = MetricStore::new();
        assert!(store.window("missing", Duration::hours(24)).is_empty());
    }

    #[test]
    fn test_models_listing() {
        let store = MetricStore::new();
        store.record(metric_at("m1", 1));
        store.record(metric_at("m2", 1));

        let mut models = store.models();
        models.sort();
        assert_eq!(models, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn test_per_model_cap() {
        let store = MetricStore::with_capacity(5);
        for i in 0..10 {
            store.record(
                PerformanceMetric::new("m1", i as f64, 0.5)
                    .with_timestamp(Utc::now() + Duration::seconds(i)),
            );
        }

        assert_eq!(store.len("m1"), 5);
        // Oldest observations were dropped
        let kept = store.window("m1", Duration::hours(1));
        assert_eq!(kept[0].response_time_secs, 5.0);
    }

    #[test]
    fn test_prune() {
        let store = MetricStore::new();
        store.record(metric_at("m1", 24 * 40));
        store.record(metric_at("m1", 1));

        let removed = store.prune(Duration::days(30));
        assert_eq!(removed, 1);
        assert_eq!(store.len("m1"), 1);
    }

    #[test]
    fn test_concurrent_record() {
        use std::sync::Arc;

        let store = Arc::new(MetricStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.record(PerformanceMetric::new("m1", 1.0, 0.8));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len("m1"), 800);
    }
}
