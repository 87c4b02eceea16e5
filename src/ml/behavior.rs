//! Behavior Windows
//!
//! Rolling per-client aggregation used as model input. Every request adds a
//! [`BehaviorEvent`]; events older than the analysis window are evicted, and
//! the remaining ones are summarized into a fixed-order feature vector.
//!
//! # Features
//!
//! | index | name                | meaning                                   |
//! |-------|---------------------|-------------------------------------------|
//! | 0     | `request_rate`      | requests per minute over the window       |
//! | 1     | `distinct_paths`    | distinct paths (query stripped)           |
//! | 2     | `keyword_hits`      | malicious keyword hits, incl. suppressed  |
//! | 3     | `rate_violations`   | requests that reached the soft limit      |
//! | 4     | `honeypot_failures` | form submissions that were too fast       |
//! | 5     | `mean_path_len`     | mean path length in bytes                 |
//!
//! The same extraction runs when serving and when training, so a model is
//! always trained on exactly the vectors it will later score.

use dashmap::DashMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Feature schema, in vector order. Model artifacts must carry the same list.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "request_rate",
    "distinct_paths",
    "keyword_hits",
    "rate_violations",
    "honeypot_failures",
    "mean_path_len",
];

pub const FEATURE_COUNT: usize = 6;

pub type FeatureVector = [f64; FEATURE_COUNT];

const CLEANUP_INTERVAL: u64 = 1000;

/// One request as seen by the behavior window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub timestamp: f64,
    pub path: String,
    pub keyword_hits: u32,
    pub rate_violation: bool,
    pub honeypot_failure: bool,
}

/// Snapshot of one client's recent activity
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorWindow {
    pub identity: String,
    pub request_count: usize,
    pub distinct_paths: usize,
    pub keyword_hits: u32,
    pub rate_violations: u32,
    pub honeypot_failures: u32,
    pub mean_path_len: f64,
    window_secs: f64,
}

impl BehaviorWindow {
    fn summarize(identity: &str, events: &VecDeque<BehaviorEvent>, window_secs: f64) -> Self {
        let mut paths = FxHashSet::default();
        let mut keyword_hits = 0;
        let mut rate_violations = 0;
        let mut honeypot_failures = 0;
        let mut total_len = 0usize;

        for event in events {
            let path = event.path.split('?').next().unwrap_or(&event.path);
            paths.insert(path);
            total_len += path.len();
            keyword_hits += event.keyword_hits;
            rate_violations += u32::from(event.rate_violation);
            honeypot_failures += u32::from(event.honeypot_failure);
        }

        let request_count = events.len();
        Self {
            identity: identity.to_string(),
            request_count,
            distinct_paths: paths.len(),
            keyword_hits,
            rate_violations,
            honeypot_failures,
            mean_path_len: if request_count == 0 {
                0.0
            } else {
                total_len as f64 / request_count as f64
            },
            window_secs,
        }
    }

    /// Requests per minute over the configured window
    pub fn request_rate(&self) -> f64 {
        self.request_count as f64 * 60.0 / self.window_secs
    }

    pub fn features(&self) -> FeatureVector {
        [
            self.request_rate(),
            self.distinct_paths as f64,
            self.keyword_hits as f64,
            self.rate_violations as f64,
            self.honeypot_failures as f64,
            self.mean_path_len,
        ]
    }
}

/// Per-identity behavior windows
pub struct BehaviorTracker {
    window_secs: f64,
    windows: DashMap<String, VecDeque<BehaviorEvent>>,
    calls: AtomicU64,
}

impl BehaviorTracker {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window_secs,
            windows: DashMap::new(),
            calls: AtomicU64::new(0),
        }
    }

    /// Add an event and return the updated window
    pub fn observe(&self, identity: &str, event: BehaviorEvent) -> BehaviorWindow {
        let now = event.timestamp;
        self.maybe_cleanup(now);

        let mut events = self.windows.entry(identity.to_string()).or_default();
        let cutoff = now - self.window_secs;
        events.retain(|e| e.timestamp >= cutoff);
        events.push_back(event);
        BehaviorWindow::summarize(identity, &events, self.window_secs)
    }

    /// Current window without recording anything
    pub fn snapshot(&self, identity: &str, now: f64) -> Option<BehaviorWindow> {
        let cutoff = now - self.window_secs;
        let events = self.windows.get(identity)?;
        let live: VecDeque<BehaviorEvent> = events
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect();
        if live.is_empty() {
            return None;
        }
        Some(BehaviorWindow::summarize(identity, &live, self.window_secs))
    }

    /// Identities with a live window
    pub fn identities(&self) -> Vec<String> {
        self.windows.iter().map(|e| e.key().clone()).collect()
    }

    pub fn forget(&self, identity: &str) {
        self.windows.remove(identity);
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    fn maybe_cleanup(&self, now: f64) {
        let count = self.calls.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 && count > 0 {
            let cutoff = now - self.window_secs;
            self.windows
                .retain(|_, events| events.back().map(|e| e.timestamp >= cutoff).unwrap_or(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: f64, path: &str) -> BehaviorEvent {
        BehaviorEvent {
            timestamp,
            path: path.to_string(),
            keyword_hits: 0,
            rate_violation: false,
            honeypot_failure: false,
        }
    }

    #[test]
    fn test_window_aggregates() {
        let tracker = BehaviorTracker::new(60.0);
        tracker.observe("a", event(100.0, "/home"));
        tracker.observe("a", event(101.0, "/home?x=1"));
        tracker.observe(
            "a",
            BehaviorEvent {
                keyword_hits: 2,
                rate_violation: true,
                ..event(102.0, "/x.php")
            },
        );
        let window = tracker.observe(
            "a",
            BehaviorEvent {
                honeypot_failure: true,
                ..event(103.0, "/contact")
            },
        );

        assert_eq!(window.request_count, 4);
        assert_eq!(window.distinct_paths, 3);
        assert_eq!(window.keyword_hits, 2);
        assert_eq!(window.rate_violations, 1);
        assert_eq!(window.honeypot_failures, 1);
        assert_eq!(window.request_rate(), 4.0);
        assert_eq!(window.features().len(), FEATURE_NAMES.len());
    }

    #[test]
    fn test_window_evicts_old_events() {
        let tracker = BehaviorTracker::new(60.0);
        tracker.observe("a", event(0.0, "/a"));
        tracker.observe("a", event(10.0, "/b"));
        let window = tracker.observe("a", event(65.0, "/c"));
        assert_eq!(window.request_count, 2);
    }

    #[test]
    fn test_snapshot() {
        let tracker = BehaviorTracker::new(60.0);
        assert!(tracker.snapshot("a", 0.0).is_none());
        tracker.observe("a", event(0.0, "/abc"));
        let window = tracker.snapshot("a", 30.0).unwrap();
        assert_eq!(window.mean_path_len, 4.0);
        assert!(tracker.snapshot("a", 120.0).is_none());
    }
}
