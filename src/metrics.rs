//! WAF Metrics
//!
//! Counters and a latency histogram for monitoring and alerting. Everything
//! recorded per request is a plain atomic; only escalations and store errors,
//! which are keyed by free-form strings, go through a map.
//!
//! - Verdicts by decision and by deciding step
//! - Escalations by reason (and escalation writes that failed)
//! - Store errors and failure-policy activations
//! - Model reloads and training runs
//!
//! Export formats:
//! - Prometheus text format
//! - JSON format

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::detection::{Decision, Step, Verdict};

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Enable latency histograms
    pub latency_histograms: bool,
    /// Histogram bucket boundaries (ms)
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_histograms: true,
            histogram_buckets: vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 100.0],
        }
    }
}

/// WAF metrics collector
pub struct WafMetrics {
    config: MetricsConfig,

    // Verdict counters
    requests_total: AtomicU64,
    requests_blocked: AtomicU64,
    requests_warned: AtomicU64,
    requests_allowed: AtomicU64,
    verdicts_by_step: [AtomicU64; Step::ALL.len()],

    // Escalations
    escalations_by_reason: RwLock<HashMap<String, u64>>,
    escalations_failed: AtomicU64,

    // Infrastructure
    store_errors: AtomicU64,
    store_errors_by_kind: RwLock<HashMap<String, u64>>,
    policy_activations: AtomicU64,

    // Model lifecycle
    model_reloads_ok: AtomicU64,
    model_reloads_failed: AtomicU64,
    training_runs_ok: AtomicU64,
    training_runs_failed: AtomicU64,

    latency_histogram: Histogram,

    start_time: Instant,
}

impl WafMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            latency_histogram: Histogram::new(config.histogram_buckets.clone()),
            config,
            requests_total: AtomicU64::new(0),
            requests_blocked: AtomicU64::new(0),
            requests_warned: AtomicU64::new(0),
            requests_allowed: AtomicU64::new(0),
            verdicts_by_step: std::array::from_fn(|_| AtomicU64::new(0)),
            escalations_by_reason: RwLock::new(HashMap::new()),
            escalations_failed: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            store_errors_by_kind: RwLock::new(HashMap::new()),
            policy_activations: AtomicU64::new(0),
            model_reloads_ok: AtomicU64::new(0),
            model_reloads_failed: AtomicU64::new(0),
            training_runs_ok: AtomicU64::new(0),
            training_runs_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a final verdict, including its escalation if any
    pub fn record_verdict(&self, verdict: &Verdict) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        match verdict.decision {
            Decision::Block => self.requests_blocked.fetch_add(1, Ordering::Relaxed),
            Decision::Warn => self.requests_warned.fetch_add(1, Ordering::Relaxed),
            Decision::Allow => self.requests_allowed.fetch_add(1, Ordering::Relaxed),
        };

        self.verdicts_by_step[verdict.step.index()].fetch_add(1, Ordering::Relaxed);

        if let Some(escalation) = &verdict.escalation {
            if escalation.applied {
                *self
                    .escalations_by_reason
                    .write()
                    .entry(escalation.reason.clone())
                    .or_insert(0) += 1;
            } else {
                self.escalations_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record an escalation made outside the request path (training sweeps)
    pub fn record_escalation(&self, reason: &str) {
        *self
            .escalations_by_reason
            .write()
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_store_error(&self, kind: &str) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        *self
            .store_errors_by_kind
            .write()
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    /// A failure policy decided a request
    pub fn record_policy_activation(&self) {
        self.policy_activations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_reload(&self, ok: bool) {
        if ok {
            self.model_reloads_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.model_reloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_training_run(&self, ok: bool) {
        if ok {
            self.training_runs_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.training_runs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record classification latency
    pub fn record_latency(&self, duration: Duration) {
        if self.config.latency_histograms {
            let ms = duration.as_secs_f64() * 1000.0;
            self.latency_histogram.observe(ms);
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("waf_requests_total", "Total number of requests classified", &self.requests_total),
            ("waf_requests_blocked", "Requests blocked", &self.requests_blocked),
            ("waf_requests_warned", "Requests allowed with a warning", &self.requests_warned),
            ("waf_requests_allowed", "Requests allowed", &self.requests_allowed),
            (
                "waf_escalations_failed",
                "Blacklist writes that could not be applied",
                &self.escalations_failed,
            ),
            ("waf_store_errors_total", "List store errors", &self.store_errors),
            (
                "waf_failure_policy_total",
                "Requests decided by the failure policy",
                &self.policy_activations,
            ),
            ("waf_model_reloads_ok", "Accepted model artifacts", &self.model_reloads_ok),
            ("waf_model_reloads_failed", "Rejected model artifacts", &self.model_reloads_failed),
            ("waf_training_runs_ok", "Successful training runs", &self.training_runs_ok),
            ("waf_training_runs_failed", "Failed training runs", &self.training_runs_failed),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value.load(Ordering::Relaxed)));
        }

        output.push_str("# HELP waf_verdicts_by_step Verdicts by the step that decided them\n");
        output.push_str("# TYPE waf_verdicts_by_step counter\n");
        for (step, count) in self.steps() {
            output.push_str(&format!("waf_verdicts_by_step{{step=\"{}\"}} {}\n", step, count));
        }

        output.push_str("# HELP waf_escalations Identities blacklisted automatically, by reason\n");
        output.push_str("# TYPE waf_escalations counter\n");
        for (reason, count) in self.escalations_by_reason.read().iter() {
            output.push_str(&format!("waf_escalations{{reason=\"{}\"}} {}\n", reason, count));
        }

        if self.config.latency_histograms {
            output.push_str(
                "# HELP waf_classification_latency_ms Request classification latency in milliseconds\n",
            );
            output.push_str("# TYPE waf_classification_latency_ms histogram\n");
            let histogram = &self.latency_histogram;
            for (bound, count) in histogram.cumulative_buckets() {
                output.push_str(&format!(
                    "waf_classification_latency_ms_bucket{{le=\"{}\"}} {}\n",
                    bound, count
                ));
            }
            output.push_str(&format!(
                "waf_classification_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
                histogram.count()
            ));
            output.push_str(&format!(
                "waf_classification_latency_ms_sum {}\n",
                histogram.sum()
            ));
            output.push_str(&format!(
                "waf_classification_latency_ms_count {}\n",
                histogram.count()
            ));
        }

        output.push_str("# HELP waf_uptime_seconds Seconds since WAF started\n");
        output.push_str("# TYPE waf_uptime_seconds gauge\n");
        output.push_str(&format!("waf_uptime_seconds {}\n", self.uptime_secs()));

        output
    }

    /// Export metrics as JSON
    pub fn json(&self) -> serde_json::Value {
        let histogram = &self.latency_histogram;
        let by_step: HashMap<String, u64> = self
            .steps()
            .map(|(step, count)| (step.to_string(), count))
            .collect();

        serde_json::json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "blocked": self.requests_blocked.load(Ordering::Relaxed),
                "warned": self.requests_warned.load(Ordering::Relaxed),
                "allowed": self.requests_allowed.load(Ordering::Relaxed),
                "by_step": by_step
            },
            "escalations": {
                "by_reason": self.escalations_by_reason.read().clone(),
                "failed": self.escalations_failed.load(Ordering::Relaxed)
            },
            "store": {
                "errors": self.store_errors.load(Ordering::Relaxed),
                "by_kind": self.store_errors_by_kind.read().clone(),
                "policy_activations": self.policy_activations.load(Ordering::Relaxed)
            },
            "model": {
                "reloads_ok": self.model_reloads_ok.load(Ordering::Relaxed),
                "reloads_failed": self.model_reloads_failed.load(Ordering::Relaxed),
                "training_ok": self.training_runs_ok.load(Ordering::Relaxed),
                "training_failed": self.training_runs_failed.load(Ordering::Relaxed)
            },
            "latency": {
                "p50_ms": histogram.percentile(50.0),
                "p90_ms": histogram.percentile(90.0),
                "p99_ms": histogram.percentile(99.0),
                "mean_ms": histogram.mean(),
                "count": histogram.count()
            },
            "uptime_seconds": self.uptime_secs()
        })
    }

    pub fn summary(&self) -> MetricsSummary {
        let histogram = &self.latency_histogram;

        MetricsSummary {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_blocked: self.requests_blocked.load(Ordering::Relaxed),
            requests_warned: self.requests_warned.load(Ordering::Relaxed),
            requests_allowed: self.requests_allowed.load(Ordering::Relaxed),
            escalations_total: self.escalations_by_reason.read().values().sum(),
            escalations_failed: self.escalations_failed.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            latency_p50_ms: histogram.percentile(50.0),
            latency_p99_ms: histogram.percentile(99.0),
            uptime_secs: self.uptime_secs(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.requests_total,
            &self.requests_blocked,
            &self.requests_warned,
            &self.requests_allowed,
            &self.escalations_failed,
            &self.store_errors,
            &self.policy_activations,
            &self.model_reloads_ok,
            &self.model_reloads_failed,
            &self.training_runs_ok,
            &self.training_runs_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        for counter in &self.verdicts_by_step {
            counter.store(0, Ordering::Relaxed);
        }
        self.escalations_by_reason.write().clear();
        self.store_errors_by_kind.write().clear();
        self.latency_histogram.reset();
    }

    /// Steps that decided at least one verdict, with their counts
    fn steps(&self) -> impl Iterator<Item = (Step, u64)> + '_ {
        Step::ALL
            .iter()
            .zip(&self.verdicts_by_step)
            .map(|(step, counter)| (*step, counter.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
    }
}

impl Default for WafMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// Summary of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub requests_total: u64,
    pub requests_blocked: u64,
    pub requests_warned: u64,
    pub requests_allowed: u64,
    pub escalations_total: u64,
    pub escalations_failed: u64,
    pub store_errors: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub uptime_secs: u64,
}

/// Fixed-bucket histogram over atomics. Percentiles are estimated by
/// interpolating inside the bucket that holds the requested rank.
struct Histogram {
    bounds: Vec<f64>,
    /// Per-bucket (not cumulative) counts; the last slot is the overflow bucket
    counts: Vec<AtomicU64>,
    /// Sum of observations in microseconds
    sum_us: AtomicU64,
    max_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(mut bounds: Vec<f64>) -> Self {
        bounds.retain(|b| b.is_finite() && *b > 0.0);
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let value = value.max(0.0);
        let slot = self.bounds.partition_point(|bound| *bound < value);
        self.counts[slot].fetch_add(1, Ordering::Relaxed);

        let us = (value * 1000.0).round() as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// (upper bound, observations at or below it), Prometheus style
    fn cumulative_buckets(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        let mut running = 0;
        self.bounds.iter().zip(&self.counts).map(move |(bound, count)| {
            running += count.load(Ordering::Relaxed);
            (*bound, running)
        })
    }

    fn sum(&self) -> f64 {
        self.sum_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }

        let max = self.max_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let rank = ((p / 100.0).clamp(0.0, 1.0) * total as f64).max(1.0);
        let mut below = 0u64;
        for (slot, count) in counts.iter().enumerate() {
            if *count == 0 || ((below + count) as f64) < rank {
                below += count;
                continue;
            }
            let lower = if slot == 0 { 0.0 } else { self.bounds[slot - 1] };
            let upper = self.bounds.get(slot).copied().unwrap_or(max).min(max).max(lower);
            let fraction = (rank - below as f64) / *count as f64;
            return lower + (upper - lower) * fraction;
        }
        max
    }

    fn reset(&self) {
        for counter in &self.counts {
            counter.store(0, Ordering::Relaxed);
        }
        self.sum_us.store(0, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}
