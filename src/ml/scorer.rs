//! Anomaly Scorer
//!
//! Query interface over the currently loaded model. The model sits behind an
//! `Arc` swapped under a short write lock: a scoring call clones the `Arc`
//! and releases the lock before evaluating, so a reload never tears a read
//! and never waits on one.
//!
//! Artifacts are checked completely (format tag, feature schema, checksum,
//! tree structure) before the swap. A rejected artifact leaves the previous
//! model in place.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::behavior::{BehaviorWindow, FeatureVector, FEATURE_NAMES};
use super::forest::IsolationForest;
use crate::config::AnomalyConfig;
use crate::error::ModelLoadError;

/// Format tag written into every artifact
pub const MODEL_FORMAT: &str = "isolation-forest/1";

/// Score band relative to the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyLevel {
    Benign,
    Suspicious,
    Anomalous,
}

impl AnomalyLevel {
    pub fn from_score(score: f64, config: &AnomalyConfig) -> Self {
        if score >= config.block_threshold {
            AnomalyLevel::Anomalous
        } else if score >= config.warn_threshold {
            AnomalyLevel::Suspicious
        } else {
            AnomalyLevel::Benign
        }
    }
}

/// Serialized model artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format: String,
    pub version: u64,
    pub feature_names: Vec<String>,
    /// Unix seconds
    pub trained_at: u64,
    pub sample_count: usize,
    pub forest: IsolationForest,
    /// Hex SHA-256 of the serialized forest
    pub checksum: String,
}

impl ModelArtifact {
    pub fn new(forest: IsolationForest, version: u64, sample_count: usize) -> Self {
        let checksum = forest_checksum(&forest);
        Self {
            format: MODEL_FORMAT.to_string(),
            version,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            trained_at: crate::unix_time_secs() as u64,
            sample_count,
            forest,
            checksum,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelLoadError> {
        serde_json::to_vec(self).map_err(|e| ModelLoadError::Malformed(e.to_string()))
    }

    /// Parse and verify an artifact
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelLoadError> {
        let artifact: ModelArtifact =
            serde_json::from_slice(bytes).map_err(|e| ModelLoadError::Malformed(e.to_string()))?;

        if artifact.format != MODEL_FORMAT {
            return Err(ModelLoadError::UnsupportedFormat {
                found: artifact.format,
                expected: MODEL_FORMAT,
            });
        }
        if artifact.feature_names.len() != FEATURE_NAMES.len()
            || artifact
                .feature_names
                .iter()
                .zip(FEATURE_NAMES.iter())
                .any(|(a, b)| a != b)
        {
            return Err(ModelLoadError::SchemaMismatch {
                found: artifact.feature_names,
                expected: FEATURE_NAMES.to_vec(),
            });
        }
        if forest_checksum(&artifact.forest) != artifact.checksum {
            return Err(ModelLoadError::ChecksumMismatch);
        }
        if !artifact.forest.is_well_formed() {
            return Err(ModelLoadError::Malformed("inconsistent tree structure".to_string()));
        }

        Ok(artifact)
    }
}

fn forest_checksum(forest: &IsolationForest) -> String {
    let bytes = serde_json::to_vec(forest).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Scoring capability consumed by the classifier
pub trait RiskScorer: Send + Sync {
    /// Risk score in [0, 1], or `None` when no model is loaded
    fn score(&self, features: &FeatureVector) -> Option<f64>;

    /// Replace the active model. On error the previous model stays active.
    fn reload(&self, artifact: &[u8]) -> Result<u64, ModelLoadError>;

    /// Version of the active model
    fn version(&self) -> Option<u64>;
}

/// Isolation-forest backed scorer
#[derive(Default)]
pub struct AnomalyScorer {
    model: RwLock<Option<Arc<ModelArtifact>>>,
}

impl AnomalyScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score a behavior window
    pub fn score_window(&self, window: &BehaviorWindow) -> Option<f64> {
        self.score(&window.features())
    }

    /// Install an already verified artifact
    pub fn install(&self, artifact: ModelArtifact) -> u64 {
        let version = artifact.version;
        *self.model.write() = Some(Arc::new(artifact));
        version
    }

    /// Load an artifact from disk
    pub fn reload_from_path(&self, path: &Path) -> Result<u64, ModelLoadError> {
        let bytes = std::fs::read(path)?;
        self.reload(&bytes)
    }

    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.model.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.read().is_some()
    }
}

impl RiskScorer for AnomalyScorer {
    fn score(&self, features: &FeatureVector) -> Option<f64> {
        let model = self.model.read().clone()?;
        Some(model.forest.score(features))
    }

    fn reload(&self, artifact: &[u8]) -> Result<u64, ModelLoadError> {
        match ModelArtifact::from_bytes(artifact) {
            Ok(parsed) => {
                let version = parsed.version;
                let trees = parsed.forest.tree_count();
                self.install(parsed);
                info!(version = version, trees = trees, "Anomaly model loaded");
                Ok(version)
            }
            Err(e) => {
                warn!(error = %e, active_version = ?self.version(), "Rejected model artifact");
                Err(e)
            }
        }
    }

    fn version(&self) -> Option<u64> {
        self.model.read().as_ref().map(|m| m.version)
    }
}
