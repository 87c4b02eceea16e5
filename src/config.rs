//! WAF Configuration Types
//!
//! One immutable configuration object, built and validated once at startup
//! and shared by reference with every component. Defaults mirror the stock
//! deployment settings (10s rate window, soft limit 20, flood 40, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// WAF configuration
#[derive(Debug, Clone, Default)]
pub struct WafConfig {
    /// Keyword lists and exempt paths
    pub keywords: KeywordConfig,
    /// Sliding-window rate limiting
    pub rate_limit: RateLimitConfig,
    /// Form timing honeypot
    pub honeypot: HoneypotConfig,
    /// Behavior-window anomaly scoring
    pub anomaly: AnomalyConfig,
    /// Offline keyword mining and model retraining
    pub training: TrainingConfig,
    /// List store access and failure policy
    pub store: StoreConfig,
    /// Request history (recent classification log)
    pub history: HistoryConfig,
}

impl WafConfig {
    /// Check thresholds and keyword lists. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = &self.rate_limit;
        if rate.window_secs <= 0.0 {
            return Err(ConfigError::NotPositive { field: "rate-window" });
        }
        if rate.max == 0 {
            return Err(ConfigError::NotPositive { field: "rate-max" });
        }
        if rate.flood == 0 {
            return Err(ConfigError::NotPositive { field: "rate-flood" });
        }
        if rate.max > rate.flood {
            return Err(ConfigError::RateThresholds {
                max: rate.max,
                flood: rate.flood,
            });
        }

        if self.honeypot.min_form_time_secs < 0.0 {
            return Err(ConfigError::NotPositive { field: "min-form-time" });
        }

        let anomaly = &self.anomaly;
        if anomaly.window_secs <= 0.0 {
            return Err(ConfigError::NotPositive { field: "anomaly-window-seconds" });
        }
        if !(0.0..=1.0).contains(&anomaly.warn_threshold)
            || !(0.0..=1.0).contains(&anomaly.block_threshold)
            || anomaly.warn_threshold > anomaly.block_threshold
        {
            return Err(ConfigError::AnomalyThresholds {
                warn: anomaly.warn_threshold,
                block: anomaly.block_threshold,
            });
        }

        if self.training.trees == 0 {
            return Err(ConfigError::NotPositive { field: "training.trees" });
        }
        if self.training.subsample_size < 2 {
            return Err(ConfigError::NotPositive { field: "training.subsample-size" });
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::NotPositive { field: "store.timeout-ms" });
        }
        if self.history.capacity == 0 {
            return Err(ConfigError::NotPositive { field: "history.capacity" });
        }

        let kw = &self.keywords;
        for (list, keywords) in [
            ("allowed-path-keywords", &kw.allowed_path_keywords),
            ("exempt-keywords", &kw.exempt_keywords),
            ("malicious-keywords", &kw.malicious_keywords),
        ] {
            if let Some(bad) = keywords.iter().find(|k| k.trim().is_empty()) {
                return Err(ConfigError::InvalidKeyword {
                    list,
                    keyword: bad.clone(),
                });
            }
        }
        // A slash inside an exempt or allowed keyword can never equal a single segment
        for (list, keywords) in [
            ("allowed-path-keywords", &kw.allowed_path_keywords),
            ("exempt-keywords", &kw.exempt_keywords),
        ] {
            if let Some(bad) = keywords.iter().find(|k| k.contains('/')) {
                return Err(ConfigError::InvalidKeyword {
                    list,
                    keyword: bad.clone(),
                });
            }
        }
        if let Some(bad) = kw.exempt_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::InvalidExemptPath(bad.clone()));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let parsed: WafConfigJson = serde_json::from_str(json)?;
        WafConfig::try_from(parsed)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }
}

/// Keyword lists (`ALLOWED_PATH_KEYWORDS`, `EXEMPT_KEYWORDS`, `MALICIOUS_KEYWORDS`,
/// `EXEMPT_PATHS`, `DYNAMIC_TOP_N`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeywordConfig {
    /// Whole path segments that are never treated as malicious
    #[serde(default = "default_allowed_path_keywords")]
    pub allowed_path_keywords: Vec<String>,
    /// Whole path segments that allow the request outright
    #[serde(default = "default_exempt_keywords")]
    pub exempt_keywords: Vec<String>,
    /// Substrings that mark a path segment as malicious
    #[serde(default = "default_malicious_keywords")]
    pub malicious_keywords: Vec<String>,
    /// Path prefixes that bypass every check
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
    /// Upper bound on learned malicious keywords
    #[serde(default = "default_dynamic_top_n")]
    pub dynamic_top_n: usize,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            allowed_path_keywords: default_allowed_path_keywords(),
            exempt_keywords: default_exempt_keywords(),
            malicious_keywords: default_malicious_keywords(),
            exempt_paths: default_exempt_paths(),
            dynamic_top_n: default_dynamic_top_n(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_allowed_path_keywords() -> Vec<String> {
    strings(&[
        "profile", "user", "account", "settings", "dashboard", "admin", "api", "auth", "login",
        "logout", "register", "search", "list", "detail", "edit", "create", "update", "delete",
        "view", "page", "category", "tag", "post", "article", "blog", "news", "contact",
        "about", "help",
    ])
}

// "profile" and "admin" are allowed keywords instead: an exempt segment would
// also wave through "/profile/shell.php"
fn default_exempt_keywords() -> Vec<String> {
    strings(&[
        "api", "webhook", "health", "static", "media", "upload", "download", "backup",
    ])
}

fn default_malicious_keywords() -> Vec<String> {
    strings(&[
        ".php", "xmlrpc", "wp-", ".env", ".git", ".bak", "config", "shell", "filemanager",
        "phpmyadmin", "administrator", "manager", "eval", "system",
    ])
}

fn default_exempt_paths() -> Vec<String> {
    strings(&[
        "/api/webhook/",
        "/health-check/",
        "/static/",
        "/media/",
        "/admin/jsi18n/",
    ])
}

fn default_dynamic_top_n() -> usize {
    5
}

/// Sliding-window rate limits (`RATE_WINDOW`, `RATE_MAX`, `RATE_FLOOD`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Window length in seconds
    #[serde(default = "default_rate_window")]
    pub window_secs: f64,
    /// Soft limit: requests in window that trigger a warning
    #[serde(default = "default_rate_max")]
    pub max: u32,
    /// Hard limit: requests in window that trigger an immediate block
    #[serde(default = "default_rate_flood")]
    pub flood: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window(),
            max: default_rate_max(),
            flood: default_rate_flood(),
        }
    }
}

fn default_rate_window() -> f64 {
    10.0
}

fn default_rate_max() -> u32 {
    20
}

fn default_rate_flood() -> u32 {
    40
}

/// Form timing honeypot (`MIN_FORM_TIME`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HoneypotConfig {
    /// Enable form timing checks
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum plausible seconds between form render and submit
    #[serde(default = "default_min_form_time")]
    pub min_form_time_secs: f64,
}

impl Default for HoneypotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_form_time_secs: default_min_form_time(),
        }
    }
}

fn default_min_form_time() -> f64 {
    1.0
}

/// Anomaly scoring (`ANOMALY_WINDOW_SECONDS`, `MODEL_PATH`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnomalyConfig {
    /// Enable the anomaly check
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Behavior window length in seconds
    #[serde(default = "default_anomaly_window")]
    pub window_secs: f64,
    /// Scores at or above this flag the request (WARN)
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    /// Scores at or above this block and escalate
    #[serde(default = "default_block_threshold")]
    pub block_threshold: f64,
    /// Windows with fewer requests than this are not scored
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    /// Model artifact location, loaded at startup and rewritten by training
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_anomaly_window(),
            warn_threshold: default_warn_threshold(),
            block_threshold: default_block_threshold(),
            min_requests: default_min_requests(),
            model_path: None,
        }
    }
}

fn default_anomaly_window() -> f64 {
    60.0
}

fn default_warn_threshold() -> f64 {
    0.62
}

fn default_block_threshold() -> f64 {
    0.75
}

fn default_min_requests() -> u32 {
    5
}

/// Training pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrainingConfig {
    /// How far back training looks into the request history (seconds)
    #[serde(default = "default_training_window")]
    pub history_window_secs: f64,
    /// Minimum records required to retrain the model
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// 404s per identity within the window that trigger escalation
    #[serde(default = "default_max_404")]
    pub max_404_per_identity: usize,
    /// Minimum malicious occurrences before a token can become a keyword
    #[serde(default = "default_min_keyword_support")]
    pub min_keyword_support: usize,
    /// Number of isolation trees
    #[serde(default = "default_trees")]
    pub trees: usize,
    /// Samples drawn per tree
    #[serde(default = "default_subsample_size")]
    pub subsample_size: usize,
    /// Fixed RNG seed for reproducible models
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            history_window_secs: default_training_window(),
            min_samples: default_min_samples(),
            max_404_per_identity: default_max_404(),
            min_keyword_support: default_min_keyword_support(),
            trees: default_trees(),
            subsample_size: default_subsample_size(),
            seed: None,
        }
    }
}

fn default_training_window() -> f64 {
    86_400.0
}

fn default_min_samples() -> usize {
    100
}

fn default_max_404() -> usize {
    6
}

fn default_min_keyword_support() -> usize {
    2
}

fn default_trees() -> usize {
    100
}

fn default_subsample_size() -> usize {
    256
}

/// What the classifier does when a store or the model cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Continue with degraded accuracy; the verdict is at least WARN
    #[default]
    FailOpen,
    /// Block the request
    FailClosed,
}

/// List store access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Deadline for a single store operation on the request path
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
    /// Behavior on store failure
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_store_timeout() -> u64 {
    250
}

/// Recent classification log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryConfig {
    /// Maximum records retained in memory
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

fn default_history_capacity() -> usize {
    50_000
}

fn default_true() -> bool {
    true
}

/// JSON-serializable config, every section optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WafConfigJson {
    #[serde(default)]
    pub keywords: Option<KeywordConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub honeypot: Option<HoneypotConfig>,
    #[serde(default)]
    pub anomaly: Option<AnomalyConfig>,
    #[serde(default)]
    pub training: Option<TrainingConfig>,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
}

impl TryFrom<WafConfigJson> for WafConfig {
    type Error = ConfigError;

    fn try_from(json: WafConfigJson) -> Result<Self, Self::Error> {
        let config = WafConfig {
            keywords: json.keywords.unwrap_or_default(),
            rate_limit: json.rate_limit.unwrap_or_default(),
            honeypot: json.honeypot.unwrap_or_default(),
            anomaly: json.anomaly.unwrap_or_default(),
            training: json.training.unwrap_or_default(),
            store: json.store.unwrap_or_default(),
            history: json.history.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WafConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.window_secs, 10.0);
        assert_eq!(config.rate_limit.max, 20);
        assert_eq!(config.rate_limit.flood, 40);
        assert_eq!(config.honeypot.min_form_time_secs, 1.0);
        assert_eq!(config.anomaly.window_secs, 60.0);
        assert_eq!(config.keywords.dynamic_top_n, 5);
    }

    #[test]
    fn test_rate_thresholds_rejected() {
        let mut config = WafConfig::default();
        config.rate_limit.max = 50;
        config.rate_limit.flood = 40;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RateThresholds { max: 50, flood: 40 })
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = WafConfig::default();
        config.rate_limit.window_secs = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "rate-window" })
        ));
    }

    #[test]
    fn test_anomaly_thresholds_rejected() {
        let mut config = WafConfig::default();
        config.anomaly.warn_threshold = 0.9;
        config.anomaly.block_threshold = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_keyword_rejected() {
        let mut config = WafConfig::default();
        config.keywords.malicious_keywords.push("  ".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidKeyword { list: "malicious-keywords", .. })
        ));
    }

    #[test]
    fn test_relative_exempt_path_rejected() {
        let mut config = WafConfig::default();
        config.keywords.exempt_paths.push("static/".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidExemptPath(_))
        ));
    }

    #[test]
    fn test_json_partial_sections() {
        let config = WafConfig::from_json(
            r#"{
                "rate-limit": { "window-secs": 5, "max": 10 },
                "store": { "failure-policy": "fail-closed" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.window_secs, 5.0);
        assert_eq!(config.rate_limit.max, 10);
        assert_eq!(config.rate_limit.flood, 40);
        assert_eq!(config.store.failure_policy, FailurePolicy::FailClosed);
        assert!(!config.keywords.malicious_keywords.is_empty());
    }

    #[test]
    fn test_json_invalid_is_config_error() {
        let err = WafConfig::from_json(r#"{ "rate-limit": { "max": 100, "flood": 10 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::RateThresholds { .. }));

        let err = WafConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
