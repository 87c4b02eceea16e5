//! Error Types
//!
//! Typed failures for each subsystem. Nothing here reaches the caller of
//! `classify`; the request path converts every error into a policy verdict.

use std::time::Duration;

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("rate-max ({max}) must not exceed rate-flood ({flood})")]
    RateThresholds { max: u32, flood: u32 },

    #[error("anomaly thresholds must satisfy 0 <= warn ({warn}) <= block ({block}) <= 1")]
    AnomalyThresholds { warn: f64, block: f64 },

    #[error("invalid keyword in {list}: {keyword:?}")]
    InvalidKeyword { list: &'static str, keyword: String },

    #[error("exempt path must start with '/': {0:?}")]
    InvalidExemptPath(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Key-value backend failure. Recovered by the configured failure policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// A model artifact was rejected. The previously loaded model stays active.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("malformed model artifact: {0}")]
    Malformed(String),

    #[error("unsupported model format {found:?} (expected {expected:?})")]
    UnsupportedFormat { found: String, expected: &'static str },

    #[error("feature schema mismatch: model has {found:?}, scorer expects {expected:?}")]
    SchemaMismatch {
        found: Vec<String>,
        expected: Vec<&'static str>,
    },

    #[error("artifact checksum mismatch")]
    ChecksumMismatch,

    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Training run failed. Last-known-good keywords and model are kept.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("insufficient training data: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("retrained model was rejected: {0}")]
    Model(#[from] ModelLoadError),

    #[error("failed to persist training output: {0}")]
    Persist(String),

    #[error("training task aborted: {0}")]
    Aborted(String),

    #[error("a training run is already in progress")]
    AlreadyRunning,
}

/// Umbrella error for the administrative surface
#[derive(Debug, thiserror::Error)]
pub enum WafError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelLoadError),

    #[error(transparent)]
    Training(#[from] TrainingError),
}
