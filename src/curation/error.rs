//! Precondition failures detected before a batch is dispatched.
//!
//! Model-call failures never show up here: they are retried and then
//! degraded inside the dispatcher. Everything in [`EngineError`] means the
//! caller handed the engine inconsistent inputs.

use thiserror::Error;

use super::feature::{Feature, Variant};

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("no features requested")]
    NoFeatures,

    #[error("worker budget must be at least 1")]
    NoWorkers,

    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("feature '{feature}' is not available for {variant}")]
    UnsupportedFeature { feature: Feature, variant: Variant },

    #[error("no instructional context configured for feature '{0}'")]
    MissingPrompt(Feature),

    #[error("prompt set was built for {found}, engine expects {expected}")]
    VariantMismatch { expected: Variant, found: Variant },

    #[error("metrics channel requested but no metrics prompt is configured")]
    MissingMetricsPrompt,

    #[error("metrics channel requested but no metrics table was supplied")]
    MissingMetricsTable,

    #[error("unit '{0}' is not present in the artifact table")]
    UnknownUnit(String),

    #[error("unit or group '{0}' is requested more than once")]
    DuplicateUnit(String),

    #[error("unit '{unit}' has no artifact for feature '{feature}'")]
    MissingArtifact { unit: String, feature: Feature },

    #[error("few-shot example '{0}' is not present in the artifact table")]
    UnknownExample(String),

    #[error("metrics table has no row for unit '{0}'")]
    MissingMetricsRow(String),

    #[error("metrics row for unit '{unit}' has {found} values, expected {expected}")]
    MetricsWidth {
        unit: String,
        expected: usize,
        found: usize,
    },

    #[error("none of the requested metrics {requested:?} are available (available: {available:?})")]
    NoMetricsAvailable {
        requested: Vec<String>,
        available: Vec<String>,
    },

    #[error("merge group '{0}' has no member list")]
    UnknownGroup(String),
}
