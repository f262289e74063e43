//! Shared types for the LLM configuration tuner
//!
//! This crate defines the data model used across the tuner: per-request
//! performance observations, serving parameter configurations with their
//! bounds and per-model defaults, and A/B experiment records.

pub mod configs;
pub mod experiments;
pub mod metrics;

pub use configs::{Objective, OptimizationConfig, ParameterBounds};
pub use experiments::{
    Arm, ArmStats, Confidence, ExperimentConfig, ExperimentResult, ExperimentStatus,
};
pub use metrics::PerformanceMetric;
