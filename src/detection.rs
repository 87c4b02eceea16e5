//! Request and Verdict Types
//!
//! The classifier consumes a [`RequestDescriptor`] and produces a [`Verdict`].
//! A verdict that blocks carries the [`Escalation`] it asked for, so the
//! blacklist write is visible to callers and tests instead of hidden in
//! control flow.

use serde::{Deserialize, Serialize};

/// Blacklist reasons written by automatic escalation
pub mod reasons {
    pub const MALICIOUS_KEYWORD: &str = "malicious keyword match";
    pub const RATE_FLOOD: &str = "rate flood";
    pub const HONEYPOT: &str = "honeypot";
    pub const ANOMALOUS: &str = "anomalous behavior";
    pub const EXCESSIVE_404: &str = "excessive 404s";
    pub const MANUAL: &str = "manual block";
}

/// Normalized view of an inbound request, created fresh per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Client identity (address or derived fingerprint)
    pub identity: String,
    /// Request path, optionally with query string
    pub path: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Arrival time, seconds since the Unix epoch
    pub timestamp: f64,
    /// When the form was rendered, if this is a form submission
    #[serde(default)]
    pub form_started_at: Option<f64>,
    /// When the form was submitted, if this is a form submission
    #[serde(default)]
    pub form_submitted_at: Option<f64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestDescriptor {
    /// A GET request arriving now
    pub fn new(identity: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            path: path.into(),
            method: default_method(),
            timestamp: crate::unix_time_secs(),
            form_started_at: None,
            form_submitted_at: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn at(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_form_timing(mut self, started_at: f64, submitted_at: f64) -> Self {
        self.form_started_at = Some(started_at);
        self.form_submitted_at = Some(submitted_at);
        self
    }

    /// Path without the query string
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }
}

/// Classification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    /// Allowed but logged as suspicious
    Warn,
    Block,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Warn => write!(f, "WARN"),
            Decision::Block => write!(f, "BLOCK"),
        }
    }
}

/// Pipeline step that produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    ExemptCheck,
    BlacklistCheck,
    PathCheck,
    RateCheck,
    HoneypotCheck,
    AnomalyCheck,
    /// Every step passed
    Complete,
    /// Infrastructure failure resolved by the configured policy
    FailurePolicy,
}

impl Step {
    /// Every step, in declaration order
    pub const ALL: [Step; 8] = [
        Step::ExemptCheck,
        Step::BlacklistCheck,
        Step::PathCheck,
        Step::RateCheck,
        Step::HoneypotCheck,
        Step::AnomalyCheck,
        Step::Complete,
        Step::FailurePolicy,
    ];

    /// Position in [`Step::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::ExemptCheck => "exempt-check",
            Step::BlacklistCheck => "blacklist-check",
            Step::PathCheck => "path-check",
            Step::RateCheck => "rate-check",
            Step::HoneypotCheck => "honeypot-check",
            Step::AnomalyCheck => "anomaly-check",
            Step::Complete => "complete",
            Step::FailurePolicy => "failure-policy",
        };
        f.write_str(name)
    }
}

/// Blacklist write requested by a blocking step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub identity: String,
    pub reason: String,
    /// Whether the store accepted the write
    pub applied: bool,
}

impl Escalation {
    pub fn new(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            reason: reason.into(),
            applied: false,
        }
    }
}

/// Result of classifying one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    /// Primary reason for the decision
    pub reason: String,
    /// Step that ended classification
    pub step: Step,
    /// Warnings accumulated along the way
    #[serde(default)]
    pub flags: Vec<String>,
    /// Blacklist write requested by this verdict
    #[serde(default)]
    pub escalation: Option<Escalation>,
    /// Anomaly score, when the model was consulted
    #[serde(default)]
    pub anomaly_score: Option<f64>,
}

impl Verdict {
    pub fn allow(step: Step, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
            step,
            flags: Vec::new(),
            escalation: None,
            anomaly_score: None,
        }
    }

    pub fn block(step: Step, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: reason.into(),
            step,
            flags: Vec::new(),
            escalation: None,
            anomaly_score: None,
        }
    }

    /// Block and request a blacklist entry for `identity`
    pub fn block_and_escalate(step: Step, identity: &str, reason: &str) -> Self {
        Self {
            escalation: Some(Escalation::new(identity, reason)),
            ..Self::block(step, reason)
        }
    }

    /// Allow, downgraded to WARN if any flags were raised
    pub fn from_flags(flags: Vec<String>) -> Self {
        if flags.is_empty() {
            return Self::allow(Step::Complete, "no check triggered");
        }
        Self {
            decision: Decision::Warn,
            reason: flags.join("; "),
            step: Step::Complete,
            flags,
            escalation: None,
            anomaly_score: None,
        }
    }

    pub fn is_block(&self) -> bool {
        self.decision == Decision::Block
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn is_warn(&self) -> bool {
        self.decision == Decision::Warn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_only_strips_query() {
        let req = RequestDescriptor::new("1.2.3.4", "/search/?q=.env");
        assert_eq!(req.path_only(), "/search/");
    }

    #[test]
    fn test_from_flags() {
        assert!(Verdict::from_flags(Vec::new()).is_allow());

        let verdict = Verdict::from_flags(vec!["soft rate limit".to_string()]);
        assert!(verdict.is_warn());
        assert_eq!(verdict.reason, "soft rate limit");
        assert_eq!(verdict.step, Step::Complete);
    }

    #[test]
    fn test_block_and_escalate() {
        let verdict =
            Verdict::block_and_escalate(Step::RateCheck, "10.0.0.1", reasons::RATE_FLOOD);
        assert!(verdict.is_block());
        let escalation = verdict.escalation.unwrap();
        assert_eq!(escalation.identity, "10.0.0.1");
        assert_eq!(escalation.reason, "rate flood");
        assert!(!escalation.applied);
    }

    #[test]
    fn test_decision_serializes_uppercase() {
        let json = serde_json::to_string(&Decision::Block).unwrap();
        assert_eq!(json, "\"BLOCK\"");
    }
}
