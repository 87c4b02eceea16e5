//! Behavioral Anomaly Detection
//!
//! Scores how unusual a client's recent activity looks compared to the
//! traffic the model was trained on.
//!
//! # Modules
//!
//! - `behavior`: per-client behavior windows and the feature schema
//! - `forest`: isolation forest training and scoring
//! - `scorer`: atomically reloadable scorer over a model artifact

pub mod behavior;
pub mod forest;
pub mod scorer;

pub use behavior::{
    BehaviorEvent, BehaviorTracker, BehaviorWindow, FeatureVector, FEATURE_COUNT, FEATURE_NAMES,
};
pub use forest::IsolationForest;
pub use scorer::{AnomalyLevel, AnomalyScorer, ModelArtifact, RiskScorer, MODEL_FORMAT};
