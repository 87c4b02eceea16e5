//! Keyword Rules
//!
//! Static classification of a request path against four keyword sets:
//!
//! - **Exempt**: a whole segment in this set allows the request outright
//! - **Malicious** (static) and **dynamic** (learned by training): a segment
//!   *containing* one of these tokens marks the path malicious
//! - **Allowed path**: a whole segment in this set is never malicious, and
//!   suppresses a malicious match for that segment only
//!
//! Precedence is EXEMPT > MALICIOUS > ALLOWED > UNKNOWN regardless of the
//! order segments appear in the path.
//!
//! `KeywordRules` is immutable. Training publishes new dynamic keywords by
//! building a fresh instance with [`KeywordRules::with_dynamic`].

pub mod keyword;

pub use keyword::{segments, KeywordSet};

use serde::{Deserialize, Serialize};

use crate::config::KeywordConfig;

/// Path classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PathClass {
    Exempt,
    Malicious,
    Allowed,
    Unknown,
}

/// Classification with the evidence behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    pub class: PathClass,
    /// Segment that decided the class
    pub segment: Option<String>,
    /// Keyword that matched inside `segment`
    pub keyword: Option<String>,
}

impl PathMatch {
    fn unknown() -> Self {
        Self {
            class: PathClass::Unknown,
            segment: None,
            keyword: None,
        }
    }
}

/// Immutable keyword rule set
#[derive(Debug, Clone, Default)]
pub struct KeywordRules {
    allowed: KeywordSet,
    exempt: KeywordSet,
    malicious: KeywordSet,
    dynamic: KeywordSet,
    exempt_paths: Vec<String>,
    dynamic_top_n: usize,
}

impl KeywordRules {
    /// Build the static rule set from configuration (no dynamic keywords yet)
    pub fn from_config(config: &KeywordConfig) -> Self {
        Self {
            allowed: KeywordSet::new(&config.allowed_path_keywords),
            exempt: KeywordSet::new(&config.exempt_keywords),
            malicious: KeywordSet::new(&config.malicious_keywords),
            dynamic: KeywordSet::default(),
            exempt_paths: config
                .exempt_paths
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            dynamic_top_n: config.dynamic_top_n,
        }
    }

    /// Copy of these rules with the dynamic set replaced.
    ///
    /// Keywords are taken in the given (ranked) order and truncated to the
    /// configured top-N. Allowed-path keywords are never accepted.
    pub fn with_dynamic<I, S>(&self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let accepted: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty() && !self.allowed.contains(k) && !self.exempt.contains(k))
            .take(self.dynamic_top_n)
            .collect();

        Self {
            dynamic: KeywordSet::new(accepted),
            ..self.clone()
        }
    }

    /// Classify a request path
    pub fn classify(&self, path: &str) -> PathClass {
        self.classify_detailed(path).class
    }

    /// Classify a request path, returning the deciding segment and keyword
    pub fn classify_detailed(&self, path: &str) -> PathMatch {
        let segments = segments(path);

        if let Some(segment) = segments.iter().find(|s| self.exempt.contains(s)) {
            return PathMatch {
                class: PathClass::Exempt,
                segment: Some(segment.clone()),
                keyword: Some(segment.clone()),
            };
        }

        for segment in &segments {
            if self.allowed.contains(segment) {
                continue;
            }
            if let Some(keyword) = self.malicious_token(segment) {
                return PathMatch {
                    class: PathClass::Malicious,
                    segment: Some(segment.clone()),
                    keyword: Some(keyword.to_string()),
                };
            }
        }

        if let Some(segment) = segments.iter().find(|s| self.allowed.contains(s)) {
            return PathMatch {
                class: PathClass::Allowed,
                segment: Some(segment.clone()),
                keyword: Some(segment.clone()),
            };
        }

        PathMatch::unknown()
    }

    /// Segments containing a malicious token, including ones suppressed by
    /// an allowed-path keyword. Used as a behavior signal.
    pub fn keyword_hits(&self, path: &str) -> u32 {
        segments(path)
            .iter()
            .filter(|s| self.malicious_token(s).is_some())
            .count() as u32
    }

    /// Whether the path falls under a configured exempt prefix
    pub fn is_exempt_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path).to_lowercase();
        self.exempt_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn malicious_token(&self, segment: &str) -> Option<&str> {
        self.malicious
            .find_in(segment)
            .or_else(|| self.dynamic.find_in(segment))
    }

    /// Whether a token is already covered by a configured list
    pub fn is_known_keyword(&self, token: &str) -> bool {
        self.allowed.contains(token)
            || self.exempt.contains(token)
            || self.malicious.contains(token)
            || self.malicious.find_in(token).is_some()
    }

    pub fn is_allowed_keyword(&self, token: &str) -> bool {
        self.allowed.contains(token)
    }

    /// Learned keywords, sorted
    pub fn dynamic_keywords(&self) -> Vec<String> {
        self.dynamic.iter().map(str::to_string).collect()
    }

    pub fn dynamic_top_n(&self) -> usize {
        self.dynamic_top_n
    }

    pub fn static_malicious_count(&self) -> usize {
        self.malicious.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> KeywordRules {
        KeywordRules::from_config(&KeywordConfig {
            allowed_path_keywords: vec!["profile".into(), "settings".into(), "user".into()],
            exempt_keywords: vec!["webhook".into(), "health".into()],
            malicious_keywords: vec![".php".into(), "wp-".into(), ".env".into(), "setting".into()],
            exempt_paths: vec!["/static/".into()],
            dynamic_top_n: 3,
        })
    }

    #[test]
    fn test_malicious_static_match() {
        let rules = rules();
        assert_eq!(rules.classify("/wp-admin/"), PathClass::Malicious);
        assert_eq!(rules.classify("/index.php"), PathClass::Malicious);
        assert_eq!(rules.classify("/app/.ENV"), PathClass::Malicious);
    }

    #[test]
    fn test_allowed_suppresses_substring_collision() {
        let rules = rules();
        // "settings" contains the malicious token "setting" but is an allowed segment
        assert_eq!(rules.classify("/profile/settings/"), PathClass::Allowed);
    }

    #[test]
    fn test_default_lists_keep_profile_allowed() {
        let rules = KeywordRules::from_config(&KeywordConfig::default());
        assert_eq!(rules.classify("/profile/settings/"), PathClass::Allowed);
        assert_eq!(rules.classify("/admin/users/"), PathClass::Allowed);
        assert_eq!(rules.classify("/profile/shell.php"), PathClass::Malicious);
        assert_eq!(rules.classify("/api/webhook/"), PathClass::Exempt);
    }

    #[test]
    fn test_allowed_suppression_is_per_segment() {
        let rules = rules();
        // Allowed "profile" does not protect the ".php" segment
        assert_eq!(rules.classify("/profile/shell.php"), PathClass::Malicious);
    }

    #[test]
    fn test_exempt_beats_malicious_regardless_of_order() {
        let rules = rules();
        assert_eq!(rules.classify("/wp-content/webhook/"), PathClass::Exempt);
        assert_eq!(rules.classify("/webhook/x.php"), PathClass::Exempt);
    }

    #[test]
    fn test_exempt_requires_whole_segment() {
        let rules = rules();
        assert_eq!(rules.classify("/healthz/"), PathClass::Unknown);
    }

    #[test]
    fn test_unknown_path() {
        assert_eq!(rules().classify("/products/42/"), PathClass::Unknown);
        assert_eq!(rules().classify("/"), PathClass::Unknown);
    }

    #[test]
    fn test_detailed_reports_keyword() {
        let m = rules().classify_detailed("/blog/wp-login.php");
        assert_eq!(m.class, PathClass::Malicious);
        assert_eq!(m.segment.as_deref(), Some("wp-login.php"));
        assert_eq!(m.keyword.as_deref(), Some(".php"));
    }

    #[test]
    fn test_dynamic_keywords() {
        let rules = rules();
        assert_eq!(rules.classify("/cgi-bin/luci"), PathClass::Unknown);

        let updated = rules.with_dynamic(["luci", "user", "boaform", "vendor", "extra"]);
        // "user" is allowed and never becomes malicious; list truncated to top-3
        assert_eq!(updated.dynamic_keywords(), vec!["boaform", "luci", "vendor"]);
        assert_eq!(updated.classify("/cgi-bin/luci"), PathClass::Malicious);

        // Source rules are untouched
        assert!(rules.dynamic_keywords().is_empty());
    }

    #[test]
    fn test_keyword_hits_counts_suppressed() {
        let rules = rules();
        assert_eq!(rules.keyword_hits("/profile/settings/"), 1);
        assert_eq!(rules.keyword_hits("/a.php/b.env"), 1);
        assert_eq!(rules.keyword_hits("/a.php/.env"), 2);
        assert_eq!(rules.keyword_hits("/products"), 0);
    }

    #[test]
    fn test_exempt_path_prefix() {
        let rules = rules();
        assert!(rules.is_exempt_path("/static/app.js"));
        assert!(rules.is_exempt_path("/STATIC/x.php?v=1"));
        assert!(!rules.is_exempt_path("/assets/static/"));
    }
}
