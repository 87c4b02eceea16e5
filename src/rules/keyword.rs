//! Keyword sets and path tokenization

use percent_encoding::percent_decode_str;
use rustc_hash::FxHashSet;

/// Normalized (trimmed, lowercase) keyword set
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    keywords: FxHashSet<String>,
    /// Sorted copy for deterministic substring scans and listing
    ordered: Vec<String>,
}

impl KeywordSet {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords: FxHashSet<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let mut ordered: Vec<String> = keywords.iter().cloned().collect();
        ordered.sort();
        Self { keywords, ordered }
    }

    /// Whole-segment match
    pub fn contains(&self, segment: &str) -> bool {
        self.keywords.contains(segment)
    }

    /// First keyword (in sorted order) occurring inside `segment`
    pub fn find_in(&self, segment: &str) -> Option<&str> {
        self.ordered
            .iter()
            .find(|k| segment.contains(k.as_str()))
            .map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Decode, lowercase and split a request path into non-empty segments.
/// The query string is ignored.
pub fn segments(path: &str) -> Vec<String> {
    let path = path.split('?').next().unwrap_or(path);
    let decoded = percent_decode_str(path).decode_utf8_lossy().to_lowercase();
    decoded
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_set_normalizes() {
        let set = KeywordSet::new([" Admin ", "API", "", "api"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("admin"));
        assert!(set.contains("api"));
    }

    #[test]
    fn test_find_in_substring() {
        let set = KeywordSet::new([".php", "wp-"]);
        assert_eq!(set.find_in("index.php"), Some(".php"));
        assert_eq!(set.find_in("wp-login.php"), Some(".php"));
        assert_eq!(set.find_in("products"), None);
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("/Profile/Settings/"), vec!["profile", "settings"]);
        assert_eq!(segments("/search/?q=/etc/passwd"), vec!["search"]);
        assert_eq!(segments("//a///b"), vec!["a", "b"]);
        assert!(segments("/").is_empty());
    }

    #[test]
    fn test_segments_percent_decoded() {
        assert_eq!(segments("/%2Eenv"), vec![".env"]);
        assert_eq!(segments("/wp%2dadmin/"), vec!["wp-admin"]);
    }
}
