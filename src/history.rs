//! Request history
//!
//! Bounded in-memory log of classified requests. It backs the "recent
//! classification logs" admin view and is the corpus the training pipeline
//! mines. Host pipelines may also push records of their own, e.g. replayed
//! access-log lines carrying response status codes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::detection::{Decision, Step};

/// One classified (or replayed) request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub identity: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    /// Unix seconds
    pub timestamp: f64,
    pub decision: Decision,
    #[serde(default)]
    pub reason: String,
    /// Step that decided the request; absent for replayed records
    #[serde(default)]
    pub step: Option<Step>,
    /// Response status, when known
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub rate_violation: bool,
    #[serde(default)]
    pub honeypot_failure: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestRecord {
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// Decided before any rule ran (exempt or already blacklisted)
    pub fn is_short_circuit(&self) -> bool {
        matches!(self.step, Some(Step::ExemptCheck) | Some(Step::BlacklistCheck))
    }

    /// Blocked on its path, or answered with 404.
    ///
    /// Blocks decided by identity (blacklist, rate flood, honeypot, anomaly)
    /// or by store failure say nothing about the path and do not count.
    /// Replayed records carry no step and count when blocked.
    pub fn is_malicious_evidence(&self) -> bool {
        let path_block = self.decision == Decision::Block
            && matches!(self.step, None | Some(Step::PathCheck));
        path_block || self.is_not_found()
    }
}

/// Ring buffer of recent records; the oldest record is dropped when full
pub struct RequestHistory {
    capacity: usize,
    records: Mutex<VecDeque<RequestRecord>>,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn push(&self, record: RequestRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn extend<I: IntoIterator<Item = RequestRecord>>(&self, records: I) {
        for record in records {
            self.push(record);
        }
    }

    /// Most recent `n` records, newest last
    pub fn recent(&self, n: usize) -> Vec<RequestRecord> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    /// Records at or after `since`, in arrival order
    pub fn since(&self, since: f64) -> Vec<RequestRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
