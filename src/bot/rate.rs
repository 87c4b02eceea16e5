//! Sliding Window Rate Tracker
//!
//! Per-identity request timestamps over a fixed window:
//! - Timestamps older than the window are evicted on each request
//! - At or above the soft limit the request is flagged
//! - At or above the flood limit the request is blocked
//!
//! Each identity lives in its own `DashMap` entry, so recording for one
//! client never serializes traffic from another, and the entry guard makes
//! the evict-append-compare sequence atomic for a single client.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RateLimitConfig;

/// Calls between sweeps of idle identities
const CLEANUP_INTERVAL: u64 = 1000;

/// Rate state after recording a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateState {
    Normal,
    /// Soft limit reached: warn
    Soft,
    /// Flood limit reached: block
    Hard,
}

/// Per-identity sliding window rate tracker
pub struct RateWindowTracker {
    window_secs: f64,
    max: usize,
    flood: usize,
    windows: DashMap<String, VecDeque<f64>>,
    calls: AtomicU64,
}

impl RateWindowTracker {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window_secs: config.window_secs,
            max: config.max as usize,
            flood: config.flood as usize,
            windows: DashMap::new(),
            calls: AtomicU64::new(0),
        }
    }

    /// Record a request and return the resulting state
    pub fn record(&self, identity: &str, timestamp: f64) -> RateState {
        self.maybe_cleanup(timestamp);

        let count = {
            let mut window = self.windows.entry(identity.to_string()).or_default();
            let cutoff = timestamp - self.window_secs;
            window.retain(|t| *t >= cutoff);
            window.push_back(timestamp);
            // Anything beyond the flood limit would not change the state
            while window.len() > self.flood {
                window.pop_front();
            }
            window.len()
        };

        if count >= self.flood {
            RateState::Hard
        } else if count >= self.max {
            RateState::Soft
        } else {
            RateState::Normal
        }
    }

    /// Requests currently counted for an identity, as of `now`
    pub fn count(&self, identity: &str, now: f64) -> usize {
        let cutoff = now - self.window_secs;
        self.windows
            .get(identity)
            .map(|w| w.iter().filter(|t| **t >= cutoff).count())
            .unwrap_or(0)
    }

    /// Forget an identity, e.g. after a manual unblock
    pub fn forget(&self, identity: &str) {
        self.windows.remove(identity);
    }

    /// Number of identities with a live window
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    fn maybe_cleanup(&self, now: f64) {
        let count = self.calls.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 && count > 0 {
            self.cleanup(now);
        }
    }

    /// Drop identities whose newest timestamp fell out of the window
    pub fn cleanup(&self, now: f64) {
        let cutoff = now - self.window_secs;
        self.windows
            .retain(|_, window| window.back().map(|t| *t >= cutoff).unwrap_or(false));
    }
}
