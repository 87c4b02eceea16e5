//! Zentinel Adaptive WAF
//!
//! Request firewall core that classifies each request as ALLOW, WARN or BLOCK
//! and escalates offending clients to a persistent blacklist.
//!
//! # Features
//!
//! - **Keyword Rules**: exempt, allowed and malicious path keywords, plus a learned set
//! - **Rate Windows**: per-client sliding windows with soft and flood thresholds
//! - **Honeypot Timing**: rejects forms submitted faster than a human could
//! - **Anomaly Scoring**: isolation forest over per-client behavior windows
//! - **Retraining**: batch keyword mining and model refresh from recent traffic
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use zentinel_adaptive_waf::{MemoryBackend, RequestDescriptor, WafAgent, WafConfig};
//!
//! let agent = WafAgent::new(WafConfig::default(), Arc::new(MemoryBackend::new())).await?;
//! let verdict = agent.classify(&RequestDescriptor::new("203.0.113.7", "/wp-admin/")).await;
//! assert!(verdict.is_block());
//! ```

pub mod bot;
pub mod config;
pub mod detection;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod ml;
pub mod rules;
pub mod store;
pub mod training;

// Re-exports for convenience
pub use config::{FailurePolicy, WafConfig, WafConfigJson};
pub use detection::{Decision, Escalation, RequestDescriptor, Step, Verdict};
pub use engine::RequestClassifier;
pub use error::{ConfigError, ModelLoadError, StoreError, TrainingError, WafError};
pub use history::{RequestHistory, RequestRecord};
pub use metrics::WafMetrics;
pub use ml::{AnomalyScorer, RiskScorer};
pub use rules::{KeywordRules, PathClass};
pub use store::{FileBackend, KvBackend, ListEntry, ListKind, ListStore, MemoryBackend};
pub use training::{TrainingPipeline, TrainingReport};

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::detection::reasons;

/// Current wall-clock time as fractional unix seconds
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Health status for the WAF agent
///
/// Used for readiness/liveness probes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStatus {
    /// Overall health - true if all components are functional
    pub healthy: bool,
    /// Whether the list store answered within its deadline
    pub store_ok: bool,
    /// Version of the active anomaly model, if any
    pub model_version: Option<u64>,
    pub static_keywords: usize,
    pub dynamic_keywords: usize,
    /// Identities with a live behavior window
    pub tracked_identities: usize,
    pub history_len: usize,
    /// List of issues encountered
    pub issues: Vec<String>,
}

impl HealthStatus {
    /// Returns true if the agent is healthy and ready to serve requests
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Entries removed by [`WafAgent::reset`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub blacklist: usize,
    pub exemptions: usize,
}

/// Classification plus the administrative surface
pub struct WafAgent {
    classifier: Arc<RequestClassifier>,
    scorer: Arc<AnomalyScorer>,
    training: TrainingPipeline,
}

impl WafAgent {
    /// Create a WAF agent over `backend`.
    ///
    /// Loads the model at `anomaly.model-path` when present and restores the
    /// persisted dynamic keywords. Neither is fatal: failures are logged and
    /// the agent starts without them.
    pub async fn new(config: WafConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate().context("invalid WAF configuration")?;
        let config = Arc::new(config);

        let scorer = Arc::new(AnomalyScorer::new());
        let classifier = Arc::new(RequestClassifier::new(
            Arc::clone(&config),
            Arc::clone(&backend),
            scorer.clone(),
        ));
        let training = TrainingPipeline::new(Arc::clone(&classifier), backend);

        let agent = Self {
            classifier,
            scorer,
            training,
        };

        if config.anomaly.model_path.as_ref().is_some_and(|p| p.exists()) {
            if let Err(e) = agent.reload_model() {
                warn!(error = %e, "Starting without an anomaly model");
            }
        }
        if let Err(e) = agent.training.restore_keywords().await {
            warn!(error = %e, "Starting without dynamic keywords");
        }

        Ok(agent)
    }

    /// Classify one request
    pub async fn classify(&self, request: &RequestDescriptor) -> Verdict {
        self.classifier.classify(request).await
    }

    /// Reload the model from `anomaly.model-path`. On failure the active
    /// model is kept.
    pub fn reload_model(&self) -> Result<u64, ModelLoadError> {
        let Some(path) = &self.classifier.config().anomaly.model_path else {
            return Err(ModelLoadError::Malformed("no model path configured".to_string()));
        };

        let result = self.scorer.reload_from_path(path);
        self.classifier
            .metrics()
            .record_model_reload(result.is_ok());
        match &result {
            Ok(version) => debug!(path = %path.display(), version = version, "Model file applied"),
            Err(e) => warn!(path = %path.display(), error = %e, "Model file rejected; keeping current model"),
        }
        result
    }

    pub async fn blacklist_add(&self, identity: &str, reason: Option<&str>) -> Result<ListEntry, StoreError> {
        self.classifier
            .blacklist()
            .add(identity, reason.unwrap_or(reasons::MANUAL))
            .await
    }

    /// Remove from the blacklist and drop the identity's rate and behavior
    /// state so it starts clean.
    pub async fn blacklist_remove(&self, identity: &str) -> Result<bool, StoreError> {
        let removed = self.classifier.blacklist().remove(identity).await?;
        self.classifier.forget(identity);
        Ok(removed)
    }

    pub async fn blacklist_list(&self) -> Result<Vec<ListEntry>, StoreError> {
        self.classifier.blacklist().list().await
    }

    pub async fn exempt_add(&self, identity: &str, reason: Option<&str>) -> Result<ListEntry, StoreError> {
        self.classifier
            .exemptions()
            .add(identity, reason.unwrap_or("manual exemption"))
            .await
    }

    pub async fn exempt_remove(&self, identity: &str) -> Result<bool, StoreError> {
        self.classifier.exemptions().remove(identity).await
    }

    pub async fn exempt_list(&self) -> Result<Vec<ListEntry>, StoreError> {
        self.classifier.exemptions().list().await
    }

    /// Clear the selected stores
    pub async fn reset(&self, blacklist: bool, exemptions: bool) -> Result<ResetSummary, StoreError> {
        let mut summary = ResetSummary::default();
        if blacklist {
            let cleared = self.classifier.blacklist().list().await?;
            summary.blacklist = self.classifier.blacklist().clear().await?;
            for entry in cleared {
                self.classifier.forget(&entry.identity);
            }
        }
        if exemptions {
            summary.exemptions = self.classifier.exemptions().clear().await?;
        }
        info!(
            blacklist = summary.blacklist,
            exemptions = summary.exemptions,
            "Stores reset"
        );
        Ok(summary)
    }

    /// Retrain on recent history
    pub async fn train(&self) -> Result<TrainingReport, TrainingError> {
        self.training.run().await
    }

    /// Retrain on an explicit record set, e.g. replayed access logs
    pub async fn train_on(&self, records: Vec<RequestRecord>) -> Result<TrainingReport, TrainingError> {
        self.training.run_on(records).await
    }

    /// Append a host-supplied record (typically one carrying a status code)
    pub fn record(&self, record: RequestRecord) {
        self.classifier.history().push(record);
    }

    /// Most recent classification log entries, newest last
    pub fn recent_logs(&self, n: usize) -> Vec<RequestRecord> {
        self.classifier.history().recent(n)
    }

    pub fn metrics(&self) -> &Arc<WafMetrics> {
        self.classifier.metrics()
    }

    pub fn classifier(&self) -> &Arc<RequestClassifier> {
        &self.classifier
    }

    /// Health check for the WAF agent
    ///
    /// Probes the list store with a short deadline and reports model and
    /// keyword state.
    pub async fn health_check(&self) -> HealthStatus {
        let mut status = HealthStatus::default();

        match tokio::time::timeout(
            Duration::from_millis(100),
            self.classifier.blacklist().contains("health-probe"),
        )
        .await
        {
            Ok(Ok(_)) => status.store_ok = true,
            Ok(Err(e)) => status.issues.push(format!("Store error: {}", e)),
            Err(_) => status.issues.push("Store probe timeout".to_string()),
        }

        let rules = self.classifier.rules();
        status.model_version = self.scorer.current().map(|m| m.version);
        status.static_keywords = rules.static_malicious_count();
        status.dynamic_keywords = rules.dynamic_keywords().len();
        status.tracked_identities = self.classifier.behavior().tracked_identities();
        status.history_len = self.classifier.history().len();

        if self.classifier.config().anomaly.enabled && status.model_version.is_none() {
            status.issues.push("No anomaly model loaded".to_string());
        }

        status.healthy = status.store_ok;
        status
    }
}
