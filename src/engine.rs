//! Request Classifier
//!
//! The per-request decision pipeline. Steps run in a fixed order and the
//! first terminal outcome wins:
//!
//! 1. exempt check against the exemption list
//! 2. blacklist check
//! 3. path check: exempt prefix, then the keyword rules
//! 4. sliding-window rate check
//! 5. form timing honeypot (only when both timestamps are present)
//! 6. anomaly score of the client's behavior window
//!
//! An exempt path or keyword ends the pipeline after the rate check: exempt
//! paths are never screened for keywords, form timing or anomalies, but a
//! client flooding one is still blocked.
//!
//! Non-terminal findings accumulate as flags and turn the final ALLOW into a
//! WARN. A blocking step returns a verdict carrying an
//! [`Escalation`](crate::detection::Escalation); the
//! classifier applies it to the blacklist afterwards, so the next request
//! from that client stops at step 2.
//!
//! Store calls carry a deadline. A failed or late store call is resolved by
//! the configured [`FailurePolicy`] and never reaches the caller.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::bot::{HoneypotResult, HoneypotTimingCheck, RateState, RateWindowTracker};
use crate::config::{FailurePolicy, WafConfig};
use crate::detection::{reasons, Decision, RequestDescriptor, Step, Verdict};
use crate::error::StoreError;
use crate::history::{RequestHistory, RequestRecord};
use crate::metrics::WafMetrics;
use crate::ml::{AnomalyLevel, BehaviorEvent, BehaviorTracker, BehaviorWindow, RiskScorer};
use crate::rules::{KeywordRules, PathClass};
use crate::store::{KvBackend, ListKind, ListStore};

/// Result of a single pipeline step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue,
    /// Non-terminal finding; downgrades the final verdict to WARN
    Flag(String),
    Terminal(Verdict),
}

impl StepOutcome {
    /// Collect a flag, or hand back a terminal verdict
    fn resolve(self, flags: &mut Vec<String>) -> Option<Verdict> {
        match self {
            StepOutcome::Continue => None,
            StepOutcome::Flag(flag) => {
                flags.push(flag);
                None
            }
            StepOutcome::Terminal(verdict) => Some(verdict),
        }
    }
}

/// Per-request signals carried into the behavior window and the history log
#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    keyword_hits: u32,
    rate_violation: bool,
    honeypot_failure: bool,
}

/// Request classifier
pub struct RequestClassifier {
    config: Arc<WafConfig>,
    rules: RwLock<Arc<KeywordRules>>,
    rate: RateWindowTracker,
    honeypot: HoneypotTimingCheck,
    behavior: BehaviorTracker,
    scorer: Arc<dyn RiskScorer>,
    blacklist: ListStore,
    exemptions: ListStore,
    history: Arc<RequestHistory>,
    metrics: Arc<WafMetrics>,
}

impl RequestClassifier {
    /// Create a classifier over one backend holding both lists
    pub fn new(
        config: Arc<WafConfig>,
        backend: Arc<dyn KvBackend>,
        scorer: Arc<dyn RiskScorer>,
    ) -> Self {
        let rules = KeywordRules::from_config(&config.keywords);

        info!(
            malicious_keywords = rules.static_malicious_count(),
            exempt_paths = config.keywords.exempt_paths.len(),
            rate_window_secs = config.rate_limit.window_secs,
            rate_max = config.rate_limit.max,
            rate_flood = config.rate_limit.flood,
            honeypot = config.honeypot.enabled,
            anomaly = config.anomaly.enabled,
            model_loaded = scorer.version().is_some(),
            failure_policy = ?config.store.failure_policy,
            "Request classifier initialized"
        );

        Self {
            rules: RwLock::new(Arc::new(rules)),
            rate: RateWindowTracker::new(&config.rate_limit),
            honeypot: HoneypotTimingCheck::new(&config.honeypot),
            behavior: BehaviorTracker::new(config.anomaly.window_secs),
            scorer,
            blacklist: ListStore::blacklist(Arc::clone(&backend)),
            exemptions: ListStore::exemptions(backend),
            history: Arc::new(RequestHistory::new(config.history.capacity)),
            metrics: Arc::new(WafMetrics::default()),
            config,
        }
    }

    /// Classify one request. Never fails; infrastructure errors become
    /// policy verdicts.
    pub async fn classify(&self, request: &RequestDescriptor) -> Verdict {
        let started = Instant::now();
        let mut signals = Signals::default();

        let verdict = self.evaluate(request, &mut signals).await;
        let verdict = self.escalate(verdict).await;

        self.metrics.record_verdict(&verdict);
        self.metrics.record_latency(started.elapsed());
        self.history.push(RequestRecord {
            identity: request.identity.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            timestamp: request.timestamp,
            decision: verdict.decision,
            reason: verdict.reason.clone(),
            step: Some(verdict.step),
            status: None,
            rate_violation: signals.rate_violation,
            honeypot_failure: signals.honeypot_failure,
        });

        debug!(
            identity = %request.identity,
            path = %request.path,
            decision = %verdict.decision,
            step = %verdict.step,
            reason = %verdict.reason,
            "Request classified"
        );
        verdict
    }

    async fn evaluate(&self, request: &RequestDescriptor, signals: &mut Signals) -> Verdict {
        let rules = self.rules();
        let mut flags = Vec::new();

        if let Some(verdict) = self.exempt_check(request).await.resolve(&mut flags) {
            return with_flags(verdict, flags);
        }
        if let Some(verdict) = self.blacklist_check(request).await.resolve(&mut flags) {
            return with_flags(verdict, flags);
        }

        signals.keyword_hits = rules.keyword_hits(&request.path);
        let screened = self.screen(request, &rules, &mut flags, signals);

        // Every request past the short-circuit steps feeds the behavior window
        let window = self.behavior.observe(
            &request.identity,
            BehaviorEvent {
                timestamp: request.timestamp,
                path: request.path_only().to_string(),
                keyword_hits: signals.keyword_hits,
                rate_violation: signals.rate_violation,
                honeypot_failure: signals.honeypot_failure,
            },
        );
        if let Some(verdict) = screened {
            return with_flags(verdict, flags);
        }

        let (outcome, score) = self.anomaly_check(request, &window);
        let mut verdict = match outcome.resolve(&mut flags) {
            Some(verdict) => with_flags(verdict, flags),
            None => Verdict::from_flags(flags),
        };
        verdict.anomaly_score = score;
        verdict
    }

    /// Steps 3-5, which need no I/O. An exempt path check result is held
    /// back until the rate check has run.
    fn screen(
        &self,
        request: &RequestDescriptor,
        rules: &KeywordRules,
        flags: &mut Vec<String>,
        signals: &mut Signals,
    ) -> Option<Verdict> {
        let exempt = match self.path_check(request, rules) {
            StepOutcome::Terminal(verdict) if verdict.decision == Decision::Allow => Some(verdict),
            outcome => {
                if let Some(verdict) = outcome.resolve(flags) {
                    return Some(verdict);
                }
                None
            }
        };
        if let Some(verdict) = self.rate_check(request, signals).resolve(flags) {
            return Some(verdict);
        }
        if exempt.is_some() {
            return exempt;
        }
        self.honeypot_check(request, signals).resolve(flags)
    }

    async fn exempt_check(&self, request: &RequestDescriptor) -> StepOutcome {
        match self.with_deadline(self.exemptions.contains(&request.identity)).await {
            Ok(true) => StepOutcome::Terminal(Verdict::allow(Step::ExemptCheck, "exempt identity")),
            Ok(false) => StepOutcome::Continue,
            Err(e) => self.store_failure(Step::ExemptCheck, ListKind::Exemption, &request.identity, &e),
        }
    }

    async fn blacklist_check(&self, request: &RequestDescriptor) -> StepOutcome {
        match self.with_deadline(self.blacklist.contains(&request.identity)).await {
            Ok(true) => StepOutcome::Terminal(Verdict::block(Step::BlacklistCheck, "blacklisted")),
            Ok(false) => StepOutcome::Continue,
            Err(e) => self.store_failure(Step::BlacklistCheck, ListKind::Blacklist, &request.identity, &e),
        }
    }

    fn path_check(&self, request: &RequestDescriptor, rules: &KeywordRules) -> StepOutcome {
        if rules.is_exempt_path(&request.path) {
            return StepOutcome::Terminal(Verdict::allow(Step::PathCheck, "exempt path"));
        }
        let matched = rules.classify_detailed(&request.path);
        match matched.class {
            PathClass::Exempt => StepOutcome::Terminal(Verdict::allow(Step::PathCheck, "exempt keyword")),
            PathClass::Malicious => {
                debug!(
                    identity = %request.identity,
                    segment = ?matched.segment,
                    keyword = ?matched.keyword,
                    "Malicious keyword in path"
                );
                StepOutcome::Terminal(Verdict::block_and_escalate(
                    Step::PathCheck,
                    &request.identity,
                    reasons::MALICIOUS_KEYWORD,
                ))
            }
            PathClass::Allowed | PathClass::Unknown => StepOutcome::Continue,
        }
    }

    fn rate_check(&self, request: &RequestDescriptor, signals: &mut Signals) -> StepOutcome {
        match self.rate.record(&request.identity, request.timestamp) {
            RateState::Hard => {
                signals.rate_violation = true;
                StepOutcome::Terminal(Verdict::block_and_escalate(
                    Step::RateCheck,
                    &request.identity,
                    reasons::RATE_FLOOD,
                ))
            }
            RateState::Soft => {
                signals.rate_violation = true;
                StepOutcome::Flag("soft rate limit".to_string())
            }
            RateState::Normal => StepOutcome::Continue,
        }
    }

    fn honeypot_check(&self, request: &RequestDescriptor, signals: &mut Signals) -> StepOutcome {
        if !self.config.honeypot.enabled {
            return StepOutcome::Continue;
        }
        match self
            .honeypot
            .check(request.form_started_at, request.form_submitted_at)
        {
            HoneypotResult::TooFast => {
                signals.honeypot_failure = true;
                StepOutcome::Terminal(Verdict::block_and_escalate(
                    Step::HoneypotCheck,
                    &request.identity,
                    reasons::HONEYPOT,
                ))
            }
            HoneypotResult::Ok => StepOutcome::Continue,
        }
    }

    fn anomaly_check(
        &self,
        request: &RequestDescriptor,
        window: &BehaviorWindow,
    ) -> (StepOutcome, Option<f64>) {
        let anomaly = &self.config.anomaly;
        if !anomaly.enabled || window.request_count < anomaly.min_requests as usize {
            return (StepOutcome::Continue, None);
        }
        let Some(score) = self.scorer.score(&window.features()) else {
            return (StepOutcome::Continue, None);
        };

        let outcome = match AnomalyLevel::from_score(score, anomaly) {
            AnomalyLevel::Anomalous => {
                let mut verdict = Verdict::block_and_escalate(
                    Step::AnomalyCheck,
                    &request.identity,
                    reasons::ANOMALOUS,
                );
                verdict.anomaly_score = Some(score);
                StepOutcome::Terminal(verdict)
            }
            AnomalyLevel::Suspicious => StepOutcome::Flag(format!("anomaly score {:.2}", score)),
            AnomalyLevel::Benign => StepOutcome::Continue,
        };
        (outcome, Some(score))
    }

    /// Apply the blacklist write a blocking verdict asked for
    async fn escalate(&self, mut verdict: Verdict) -> Verdict {
        let Some(escalation) = verdict.escalation.as_mut() else {
            return verdict;
        };

        match self
            .with_deadline(self.blacklist.add(&escalation.identity, &escalation.reason))
            .await
        {
            Ok(_) => {
                escalation.applied = true;
                info!(
                    identity = %escalation.identity,
                    reason = %escalation.reason,
                    step = %verdict.step,
                    "Identity escalated to blacklist"
                );
            }
            Err(e) => {
                self.metrics.record_store_error(store_error_kind(&e));
                warn!(
                    identity = %escalation.identity,
                    reason = %escalation.reason,
                    error = %e,
                    "Blacklist escalation failed; request still blocked"
                );
            }
        }
        verdict
    }

    fn store_failure(
        &self,
        step: Step,
        list: ListKind,
        identity: &str,
        error: &StoreError,
    ) -> StepOutcome {
        self.metrics.record_store_error(store_error_kind(error));
        self.metrics.record_policy_activation();

        let reason = format!("{} store unavailable", list);
        match self.config.store.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(identity = %identity, step = %step, error = %error, "Store check skipped (fail-open)");
                StepOutcome::Flag(reason)
            }
            FailurePolicy::FailClosed => {
                warn!(identity = %identity, step = %step, error = %error, "Request blocked (fail-closed)");
                StepOutcome::Terminal(Verdict::block(Step::FailurePolicy, reason))
            }
        }
    }

    async fn with_deadline<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let deadline = self.config.store.timeout();
        tokio::time::timeout(deadline, operation)
            .await
            .unwrap_or(Err(StoreError::Timeout(deadline)))
    }

    /// Current keyword rules
    pub fn rules(&self) -> Arc<KeywordRules> {
        Arc::clone(&self.rules.read())
    }

    /// Replace the keyword rules wholesale
    pub fn publish_rules(&self, rules: KeywordRules) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Drop rate and behavior state for an identity
    pub fn forget(&self, identity: &str) {
        self.rate.forget(identity);
        self.behavior.forget(identity);
    }

    pub fn config(&self) -> &Arc<WafConfig> {
        &self.config
    }

    pub fn blacklist(&self) -> &ListStore {
        &self.blacklist
    }

    pub fn exemptions(&self) -> &ListStore {
        &self.exemptions
    }

    pub fn scorer(&self) -> &Arc<dyn RiskScorer> {
        &self.scorer
    }

    pub fn behavior(&self) -> &BehaviorTracker {
        &self.behavior
    }

    pub fn history(&self) -> &Arc<RequestHistory> {
        &self.history
    }

    pub fn metrics(&self) -> &Arc<WafMetrics> {
        &self.metrics
    }
}

/// Prepend flags raised before a terminal verdict
fn with_flags(mut verdict: Verdict, mut flags: Vec<String>) -> Verdict {
    flags.append(&mut verdict.flags);
    verdict.flags = flags;
    verdict
}

fn store_error_kind(error: &StoreError) -> &'static str {
    match error {
        StoreError::Io(_) => "io",
        StoreError::Corrupt { .. } => "corrupt",
        StoreError::Timeout(_) => "timeout",
        StoreError::Unavailable(_) => "unavailable",
    }
}
