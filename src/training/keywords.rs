//! Dynamic keyword mining
//!
//! Tokens that show up in paths of blocked or 404 requests, and rarely in
//! benign ones, become candidate malicious keywords. Each token counts at
//! most once per request.

use regex::Regex;
use rustc_hash::FxHashMap;
use std::sync::LazyLock;

use crate::history::RequestRecord;
use crate::rules::{segments, KeywordRules};

const MIN_TOKEN_LEN: usize = 3;

static TOKEN_SPLITTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Distinct path tokens of at least three characters, excluding pure numbers
pub fn tokenize(path: &str) -> Vec<String> {
    let mut tokens: Vec<String> = segments(path)
        .iter()
        .flat_map(|segment| TOKEN_SPLITTER.split(segment))
        .filter(|t| t.len() >= MIN_TOKEN_LEN && !t.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// A mined keyword with its evidence
#[derive(Debug, Clone, PartialEq)]
pub struct RankedKeyword {
    pub keyword: String,
    /// Malicious requests containing the token
    pub malicious: usize,
    /// Benign requests containing the token
    pub benign: usize,
}

impl RankedKeyword {
    /// Discrimination score: malicious support damped by benign support
    pub fn score(&self) -> f64 {
        self.malicious as f64 / (1.0 + self.benign as f64)
    }
}

/// Rank tokens by how strongly they separate malicious from benign requests.
///
/// Tokens already covered by a configured list, or seen in fewer than
/// `min_support` malicious requests, are skipped. At most `top_n` are returned.
pub fn mine_keywords(
    records: &[RequestRecord],
    rules: &KeywordRules,
    min_support: usize,
    top_n: usize,
) -> Vec<RankedKeyword> {
    let mut counts: FxHashMap<String, (usize, usize)> = FxHashMap::default();
    for record in records {
        let malicious = record.is_malicious_evidence();
        for token in tokenize(&record.path) {
            let entry = counts.entry(token).or_insert((0, 0));
            if malicious {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }

    let mut ranked: Vec<RankedKeyword> = counts
        .into_iter()
        .filter(|(token, (malicious, _))| {
            *malicious >= min_support.max(1) && !rules.is_known_keyword(token)
        })
        .map(|(keyword, (malicious, benign))| RankedKeyword {
            keyword,
            malicious,
            benign,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score()
            .total_cmp(&a.score())
            .then_with(|| b.malicious.cmp(&a.malicious))
            .then_with(|| a.keyword.cmp(&b.keyword))
    });
    ranked.truncate(top_n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeywordConfig;
    use crate::detection::Decision;

    fn record(path: &str, decision: Decision, status: Option<u16>) -> RequestRecord {
        RequestRecord {
            identity: "1.2.3.4".to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            timestamp: 0.0,
            decision,
            reason: String::new(),
            step: None,
            status,
            rate_violation: false,
            honeypot_failure: false,
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("/cgi-bin/luci;stok=/locale?form=1"),
            vec!["bin", "cgi", "locale", "luci", "stok"]
        );
        assert_eq!(tokenize("/2024/05/ab"), Vec::<String>::new());
    }

    #[test]
    fn test_mine_ranks_discriminative_tokens() {
        let rules = KeywordRules::from_config(&KeywordConfig::default());
        let mut records = Vec::new();
        for _ in 0..4 {
            records.push(record("/boaform/admin/formlogin", Decision::Allow, Some(404)));
            records.push(record("/cgi-bin/luci", Decision::Block, None));
        }
        for _ in 0..10 {
            records.push(record("/catalog/items", Decision::Allow, Some(200)));
        }
        // "luci" also appears in benign traffic, so it ranks lower
        records.push(record("/docs/luci", Decision::Allow, Some(200)));

        let ranked = mine_keywords(&records, &rules, 2, 10);
        let keywords: Vec<&str> = ranked.iter().map(|k| k.keyword.as_str()).collect();

        assert!(keywords.contains(&"boaform"));
        assert!(keywords.contains(&"formlogin"));
        assert!(!keywords.contains(&"catalog"));
        // "admin" is an allowed keyword and never mined
        assert!(!keywords.contains(&"admin"));

        let luci = ranked.iter().find(|k| k.keyword == "luci").unwrap();
        let boaform = ranked.iter().find(|k| k.keyword == "boaform").unwrap();
        assert!(boaform.score() > luci.score());
    }

    #[test]
    fn test_flooded_page_is_not_mined() {
        use crate::detection::Step;

        let rules = KeywordRules::from_config(&KeywordConfig::default());
        let mut records = Vec::new();
        for _ in 0..6 {
            records.push(record("/catalog/items", Decision::Allow, Some(200)));
            records.push(record("/checkout/cart", Decision::Allow, Some(200)));
        }
        // One client floods the page, then keeps retrying while blacklisted
        for i in 0..80 {
            let mut r = record("/checkout/cart", Decision::Block, None);
            r.step = Some(if i < 40 { Step::RateCheck } else { Step::BlacklistCheck });
            records.push(r);
        }
        let mut fail_closed = record("/checkout/cart", Decision::Block, None);
        fail_closed.step = Some(Step::FailurePolicy);
        records.push(fail_closed);
        for _ in 0..3 {
            let mut r = record("/cgi-bin/luci", Decision::Block, None);
            r.step = Some(Step::PathCheck);
            records.push(r);
        }

        let ranked = mine_keywords(&records, &rules, 2, 10);
        let keywords: Vec<&str> = ranked.iter().map(|k| k.keyword.as_str()).collect();
        assert!(keywords.contains(&"luci"));
        assert!(!keywords.contains(&"cart"));
        assert!(!keywords.contains(&"checkout"));
    }

    #[test]
    fn test_min_support_and_top_n() {
        let rules = KeywordRules::from_config(&KeywordConfig::default());
        let records = vec![
            record("/once", Decision::Block, None),
            record("/twice", Decision::Block, None),
            record("/twice", Decision::Block, None),
            record("/thrice", Decision::Block, None),
            record("/thrice", Decision::Block, None),
            record("/thrice", Decision::Block, None),
        ];
        let ranked = mine_keywords(&records, &rules, 2, 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].keyword, "thrice");
    }
}
