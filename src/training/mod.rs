//! Training Pipeline
//!
//! Out-of-band batch job over the request history:
//!
//! 1. Mine dynamic malicious keywords from blocked and 404 requests
//! 2. Replay the records through fresh behavior windows to build feature vectors
//! 3. Fit a new isolation forest off the async runtime
//! 4. Persist the keyword set and the model artifact, both or neither
//! 5. Swap the model into the scorer and publish the new keyword rules
//! 6. Escalate identities with excessive 404s or anomalous windows
//!
//! Nothing is published until the model has been trained, verified and
//! persisted, so a failed run leaves the last-known-good keywords and model
//! active. Live classification is never blocked by a run.

pub mod keywords;

pub use keywords::{mine_keywords, tokenize, RankedKeyword};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::detection::reasons;
use crate::engine::RequestClassifier;
use crate::error::{StoreError, TrainingError};
use crate::history::RequestRecord;
use crate::ml::{
    BehaviorEvent, BehaviorTracker, BehaviorWindow, FeatureVector, IsolationForest, ModelArtifact,
};
use crate::rules::KeywordRules;
use crate::store::KvBackend;

/// Backend key holding the published dynamic keyword list
pub const DYNAMIC_KEYWORDS_KEY: &str = "dynamic-keywords/current";

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Records considered
    pub records: usize,
    /// Feature vectors the model was fitted on
    pub samples: usize,
    pub dynamic_keywords: Vec<String>,
    pub model_version: u64,
    /// (identity, reason) pairs added to the blacklist
    pub escalations: Vec<(String, String)>,
}

/// Feature vectors and per-identity evidence replayed from history
struct Replay {
    samples: Vec<FeatureVector>,
    latest: FxHashMap<String, BehaviorWindow>,
    not_found: FxHashMap<String, usize>,
}

/// Rebuild behavior windows from records, in timestamp order
fn replay(
    records: &[RequestRecord],
    rules: &KeywordRules,
    window_secs: f64,
    min_requests: usize,
) -> Replay {
    let mut ordered: Vec<&RequestRecord> =
        records.iter().filter(|r| !r.is_short_circuit()).collect();
    ordered.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let tracker = BehaviorTracker::new(window_secs);
    let mut samples = Vec::new();
    let mut latest = FxHashMap::default();
    let mut not_found: FxHashMap<String, usize> = FxHashMap::default();

    for record in ordered {
        if record.is_not_found() {
            *not_found.entry(record.identity.clone()).or_default() += 1;
        }
        let window = tracker.observe(
            &record.identity,
            BehaviorEvent {
                timestamp: record.timestamp,
                path: record.path.clone(),
                keyword_hits: rules.keyword_hits(&record.path),
                rate_violation: record.rate_violation,
                honeypot_failure: record.honeypot_failure,
            },
        );
        if window.request_count >= min_requests {
            samples.push(window.features());
        }
        latest.insert(record.identity.clone(), window);
    }

    Replay {
        samples,
        latest,
        not_found,
    }
}

/// Resets the running flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keyword mining and model retraining
pub struct TrainingPipeline {
    classifier: Arc<RequestClassifier>,
    backend: Arc<dyn KvBackend>,
    running: AtomicBool,
}

impl TrainingPipeline {
    pub fn new(classifier: Arc<RequestClassifier>, backend: Arc<dyn KvBackend>) -> Self {
        Self {
            classifier,
            backend,
            running: AtomicBool::new(false),
        }
    }

    /// Publish the dynamic keywords persisted by an earlier run, if any
    pub async fn restore_keywords(&self) -> Result<Vec<String>, StoreError> {
        let Some(raw) = self.backend.get(DYNAMIC_KEYWORDS_KEY).await? else {
            return Ok(Vec::new());
        };
        let keywords: Vec<String> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key: DYNAMIC_KEYWORDS_KEY.to_string(),
                reason: e.to_string(),
            })?;

        let rules = self.classifier.rules().with_dynamic(&keywords);
        let published = rules.dynamic_keywords();
        self.classifier.publish_rules(rules);
        info!(keywords = ?published, "Restored dynamic keywords");
        Ok(published)
    }

    /// Train on the configured history window
    pub async fn run(&self) -> Result<TrainingReport, TrainingError> {
        let config = self.classifier.config();
        let since = crate::unix_time_secs() - config.training.history_window_secs;
        let records = self.classifier.history().since(since);
        self.run_on(records).await
    }

    /// Train on an explicit set of records
    pub async fn run_on(&self, records: Vec<RequestRecord>) -> Result<TrainingReport, TrainingError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TrainingError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let result = self.train(records).await;
        self.classifier
            .metrics()
            .record_training_run(result.is_ok());
        if let Err(e) = &result {
            warn!(error = %e, "Training run failed; keeping current keywords and model");
        }
        result
    }

    async fn train(&self, records: Vec<RequestRecord>) -> Result<TrainingReport, TrainingError> {
        let config = Arc::clone(self.classifier.config());
        let training = &config.training;
        let rules = self.classifier.rules();

        let ranked = mine_keywords(
            &records,
            &rules,
            training.min_keyword_support,
            rules.dynamic_top_n(),
        );
        for keyword in &ranked {
            debug!(
                keyword = %keyword.keyword,
                malicious = keyword.malicious,
                benign = keyword.benign,
                "Mined keyword candidate"
            );
        }

        let replay = replay(
            &records,
            &rules,
            config.anomaly.window_secs,
            config.anomaly.min_requests as usize,
        );
        if replay.samples.len() < training.min_samples {
            return Err(TrainingError::InsufficientData {
                have: replay.samples.len(),
                need: training.min_samples,
            });
        }

        // Fit off the async runtime
        let samples = replay.samples.clone();
        let (trees, subsample, seed) = (training.trees, training.subsample_size, training.seed);
        let forest = tokio::task::spawn_blocking(move || {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            IsolationForest::train(&samples, trees, subsample, &mut rng)
        })
        .await
        .map_err(|e| TrainingError::Aborted(e.to_string()))?;

        let scorer = self.classifier.scorer();
        let version = scorer.version().unwrap_or(0) + 1;
        let artifact = ModelArtifact::new(forest, version, replay.samples.len());
        let bytes = artifact.to_bytes()?;
        // Verify before anything is persisted or published
        ModelArtifact::from_bytes(&bytes)?;

        // Stage the model, persist the keywords, then commit the model. A
        // failure at any point leaves the previous pair on disk.
        let staged = match &config.anomaly.model_path {
            Some(path) => Some(
                StagedFile::write(path, &bytes)
                    .await
                    .map_err(|e| TrainingError::Persist(format!("{}: {}", path.display(), e)))?,
            ),
            None => None,
        };

        let updated = rules.with_dynamic(ranked.iter().map(|k| k.keyword.as_str()));
        let dynamic_keywords = updated.dynamic_keywords();
        self.persist(&dynamic_keywords, staged).await?;

        // Publish: model first, then keywords
        let reload = scorer.reload(&bytes);
        self.classifier.metrics().record_model_reload(reload.is_ok());
        let model_version = reload?;
        self.classifier.publish_rules(updated);

        let mut escalations = self.escalate_not_found(&replay.not_found).await;
        escalations.extend(self.sweep_anomalous(&replay).await);

        info!(
            records = records.len(),
            samples = replay.samples.len(),
            model_version = model_version,
            dynamic_keywords = ?dynamic_keywords,
            escalations = escalations.len(),
            "Training run complete"
        );

        Ok(TrainingReport {
            records: records.len(),
            samples: replay.samples.len(),
            dynamic_keywords,
            model_version,
            escalations,
        })
    }

    /// Store the keyword set and commit the staged model. If the model
    /// cannot be committed the previous keyword set is put back.
    async fn persist(
        &self,
        keywords: &[String],
        staged: Option<StagedFile>,
    ) -> Result<(), TrainingError> {
        let encoded =
            serde_json::to_string(keywords).map_err(|e| TrainingError::Persist(e.to_string()))?;
        let previous = match self.backend.get(DYNAMIC_KEYWORDS_KEY).await {
            Ok(previous) => previous,
            Err(e) => {
                discard(staged).await;
                return Err(TrainingError::Persist(e.to_string()));
            }
        };
        if let Err(e) = self.backend.put(DYNAMIC_KEYWORDS_KEY, encoded).await {
            discard(staged).await;
            return Err(TrainingError::Persist(e.to_string()));
        }

        let Some(staged) = staged else {
            return Ok(());
        };
        let target = staged.target.display().to_string();
        if let Err(e) = staged.commit().await {
            let restored = match previous {
                Some(value) => self.backend.put(DYNAMIC_KEYWORDS_KEY, value).await,
                None => self.backend.delete(DYNAMIC_KEYWORDS_KEY).await,
            };
            if let Err(restore) = restored {
                warn!(error = %restore, "Could not restore previous dynamic keywords");
            }
            return Err(TrainingError::Persist(format!("{}: {}", target, e)));
        }
        Ok(())
    }

    /// Blacklist identities with at least `max-404-per-identity` 404s
    async fn escalate_not_found(&self, not_found: &FxHashMap<String, usize>) -> Vec<(String, String)> {
        let threshold = self.classifier.config().training.max_404_per_identity;
        let mut offenders: Vec<&String> = not_found
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(identity, _)| identity)
            .collect();
        offenders.sort();

        let mut escalated = Vec::new();
        for identity in offenders {
            if self.escalate(identity, reasons::EXCESSIVE_404).await {
                escalated.push((identity.clone(), reasons::EXCESSIVE_404.to_string()));
            }
        }
        escalated
    }

    /// Rescore each identity's latest window with the new model. Anomalous
    /// windows that also show 404s or keyword hits are blacklisted.
    async fn sweep_anomalous(&self, replay: &Replay) -> Vec<(String, String)> {
        let config = self.classifier.config();
        let scorer = self.classifier.scorer();

        let mut suspects: Vec<&BehaviorWindow> = replay
            .latest
            .values()
            .filter(|w| w.request_count >= config.anomaly.min_requests as usize)
            .filter(|w| w.keyword_hits > 0 || replay.not_found.contains_key(&w.identity))
            .filter(|w| {
                scorer
                    .score(&w.features())
                    .map(|s| s >= config.anomaly.block_threshold)
                    .unwrap_or(false)
            })
            .collect();
        suspects.sort_by(|a, b| a.identity.cmp(&b.identity));

        let mut escalated = Vec::new();
        for window in suspects {
            if self.escalate(&window.identity, reasons::ANOMALOUS).await {
                escalated.push((window.identity.clone(), reasons::ANOMALOUS.to_string()));
            }
        }
        escalated
    }

    /// Add to the blacklist unless exempt or already listed
    async fn escalate(&self, identity: &str, reason: &str) -> bool {
        let exemptions = self.classifier.exemptions();
        let blacklist = self.classifier.blacklist();

        let listed = async {
            Ok::<_, StoreError>(
                exemptions.contains(identity).await? || blacklist.contains(identity).await?,
            )
        };
        match listed.await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => {
                warn!(identity = %identity, error = %e, "Skipping escalation; store unavailable");
                return false;
            }
        }

        match blacklist.add(identity, reason).await {
            Ok(_) => {
                self.classifier.metrics().record_escalation(reason);
                true
            }
            Err(e) => {
                warn!(identity = %identity, reason = %reason, error = %e, "Training escalation failed");
                false
            }
        }
    }
}

/// Model bytes written next to their target, not yet visible under it
struct StagedFile {
    tmp: PathBuf,
    target: PathBuf,
}

impl StagedFile {
    async fn write(target: &Path, bytes: &[u8]) -> std::io::Result<Self> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        Ok(Self {
            tmp,
            target: target.to_path_buf(),
        })
    }

    async fn commit(self) -> std::io::Result<()> {
        let result = tokio::fs::rename(&self.tmp, &self.target).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&self.tmp).await;
        }
        result
    }
}

async fn discard(staged: Option<StagedFile>) {
    if let Some(staged) = staged {
        if let Err(e) = tokio::fs::remove_file(&staged.tmp).await {
            debug!(path = %staged.tmp.display(), error = %e, "Could not remove staged model");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WafConfig;
    use crate::detection::Decision;
    use crate::ml::{AnomalyScorer, RiskScorer};
    use crate::store::MemoryBackend;
    use tempfile::TempDir;

    fn record(identity: &str, path: &str, timestamp: f64, status: Option<u16>) -> RequestRecord {
        RequestRecord {
            identity: identity.to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            timestamp,
            decision: Decision::Allow,
            reason: String::new(),
            step: None,
            status,
            rate_violation: false,
            honeypot_failure: false,
        }
    }

    fn config(model_path: Option<std::path::PathBuf>) -> WafConfig {
        let mut config = WafConfig::default();
        config.training.min_samples = 20;
        config.training.trees = 25;
        config.training.subsample_size = 64;
        config.training.seed = Some(11);
        config.anomaly.model_path = model_path;
        config
    }

    fn pipeline(config: WafConfig) -> (Arc<RequestClassifier>, Arc<MemoryBackend>, TrainingPipeline) {
        let backend = Arc::new(MemoryBackend::new());
        let classifier = Arc::new(RequestClassifier::new(
            Arc::new(config),
            backend.clone(),
            Arc::new(AnomalyScorer::new()),
        ));
        let pipeline = TrainingPipeline::new(Arc::clone(&classifier), backend.clone());
        (classifier, backend, pipeline)
    }

    /// Benign browsing from many clients plus one scanner hammering 404s
    fn corpus() -> Vec<RequestRecord> {
        let mut records = Vec::new();
        let t = 1_700_000_000.0;
        for client in 0..10 {
            for i in 0..8 {
                records.push(record(
                    &format!("10.0.0.{}", client),
                    &format!("/catalog/{}", i % 3),
                    t + (client * 100 + i * 7) as f64,
                    Some(200),
                ));
            }
        }
        for i in 0..12 {
            records.push(record(
                "6.6.6.6",
                &format!("/boaform/step{}", i),
                t + 2000.0 + i as f64 * 0.5,
                Some(404),
            ));
        }
        records
    }

    #[tokio::test]
    async fn test_run_publishes_keywords_and_model() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("model.json");
        let (classifier, backend, pipeline) = pipeline(config(Some(model_path.clone())));

        let report = pipeline.run_on(corpus()).await.unwrap();

        assert_eq!(report.model_version, 1);
        assert!(report.dynamic_keywords.contains(&"boaform".to_string()));
        assert!(classifier.rules().dynamic_keywords().contains(&"boaform".to_string()));
        assert_eq!(classifier.scorer().version(), Some(1));
        assert!(model_path.exists());
        assert!(backend.get(DYNAMIC_KEYWORDS_KEY).await.unwrap().is_some());

        // Scanner crossed the 404 threshold
        assert!(report
            .escalations
            .contains(&("6.6.6.6".to_string(), reasons::EXCESSIVE_404.to_string())));
        assert!(classifier.blacklist().contains("6.6.6.6").await.unwrap());
        assert!(!classifier.blacklist().contains("10.0.0.1").await.unwrap());

        // Persisted model loads into a fresh scorer
        let fresh = AnomalyScorer::new();
        assert_eq!(fresh.reload_from_path(&model_path).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_data_keeps_last_known_good() {
        let mut cfg = config(None);
        cfg.training.min_samples = 10_000;
        let (classifier, _backend, pipeline) = pipeline(cfg);
        classifier.publish_rules(classifier.rules().with_dynamic(["oldword"]));

        let err = pipeline.run_on(corpus()).await.unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientData { need: 10_000, .. }));
        assert_eq!(classifier.rules().dynamic_keywords(), vec!["oldword"]);
        assert!(classifier.scorer().version().is_none());
        assert_eq!(classifier.metrics().json()["model"]["training_failed"], 1);
    }

    #[tokio::test]
    async fn test_second_run_bumps_version() {
        let (classifier, _backend, pipeline) = pipeline(config(None));
        pipeline.run_on(corpus()).await.unwrap();
        let report = pipeline.run_on(corpus()).await.unwrap();
        assert_eq!(report.model_version, 2);
        assert_eq!(classifier.scorer().version(), Some(2));
    }

    #[tokio::test]
    async fn test_restore_keywords() {
        let (classifier, backend, pipeline) = pipeline(config(None));
        backend
            .put(DYNAMIC_KEYWORDS_KEY, r#"["luci","boaform"]"#.to_string())
            .await
            .unwrap();

        let restored = pipeline.restore_keywords().await.unwrap();
        assert_eq!(restored, vec!["boaform", "luci"]);
        assert_eq!(classifier.rules().dynamic_keywords(), vec!["boaform", "luci"]);
    }

    #[tokio::test]
    async fn test_exempt_identity_not_escalated() {
        let (classifier, _backend, pipeline) = pipeline(config(None));
        classifier.exemptions().add("6.6.6.6", "scanner we run").await.unwrap();

        let report = pipeline.run_on(corpus()).await.unwrap();
        assert!(report.escalations.iter().all(|(id, _)| id != "6.6.6.6"));
        assert!(!classifier.blacklist().contains("6.6.6.6").await.unwrap());
    }

    /// Memory store that refuses keyword writes
    struct KeywordWriteFails(MemoryBackend);

    #[async_trait::async_trait]
    impl KvBackend for KeywordWriteFails {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }

        async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
            if key == DYNAMIC_KEYWORDS_KEY {
                return Err(StoreError::Unavailable("read-only".to_string()));
            }
            self.0.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }

        async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
            self.0.scan(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_keyword_write_leaves_no_model_file() {
        let dir = TempDir::new().unwrap();
        let model_path = dir.path().join("model.json");
        let backend: Arc<dyn KvBackend> = Arc::new(KeywordWriteFails(MemoryBackend::new()));
        let classifier = Arc::new(RequestClassifier::new(
            Arc::new(config(Some(model_path.clone()))),
            Arc::clone(&backend),
            Arc::new(AnomalyScorer::new()),
        ));
        let pipeline = TrainingPipeline::new(Arc::clone(&classifier), backend);

        let err = pipeline.run_on(corpus()).await.unwrap_err();
        assert!(matches!(err, TrainingError::Persist(_)));
        assert!(!model_path.exists());
        assert!(!model_path.with_extension("tmp").exists());
        assert!(classifier.scorer().version().is_none());
        assert!(classifier.rules().dynamic_keywords().is_empty());
    }

    #[tokio::test]
    async fn test_flooded_page_not_learned() {
        let (classifier, _backend, pipeline) = pipeline(config(None));
        let t = 1_700_000_000.0;
        let mut records = corpus();
        for client in 0..6 {
            records.push(record(
                &format!("10.0.0.{}", client),
                "/checkout/cart",
                t + 900.0 + client as f64,
                Some(200),
            ));
        }
        for i in 0..80 {
            let mut r = record("7.7.7.7", "/checkout/cart", t + 3000.0 + i as f64 * 0.1, None);
            r.decision = Decision::Block;
            r.step = Some(if i < 40 {
                crate::detection::Step::RateCheck
            } else {
                crate::detection::Step::BlacklistCheck
            });
            records.push(r);
        }

        let report = pipeline.run_on(records).await.unwrap();
        assert!(!report.dynamic_keywords.contains(&"cart".to_string()));
        assert!(!report.dynamic_keywords.contains(&"checkout".to_string()));
        assert_ne!(
            classifier.rules().classify("/checkout/cart"),
            crate::rules::PathClass::Malicious
        );
    }

    #[test]
    fn test_replay_skips_short_circuited_records() {
        let rules = KeywordRules::default();
        let mut blocked = record("a", "/x", 1.0, None);
        blocked.step = Some(crate::detection::Step::BlacklistCheck);
        let records = vec![blocked, record("a", "/y", 2.0, Some(404))];

        let replay = replay(&records, &rules, 60.0, 1);
        assert_eq!(replay.samples.len(), 1);
        assert_eq!(replay.not_found.get("a"), Some(&1));
    }
}
