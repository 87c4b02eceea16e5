//! Form timing honeypot

use crate::config::HoneypotConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoneypotResult {
    Ok,
    /// Submitted faster than a human could fill the form
    TooFast,
}

/// Elapsed-time check for form submissions. Stateless.
#[derive(Debug, Clone)]
pub struct HoneypotTimingCheck {
    min_form_time_secs: f64,
}

impl HoneypotTimingCheck {
    pub fn new(config: &HoneypotConfig) -> Self {
        Self {
            min_form_time_secs: config.min_form_time_secs,
        }
    }

    /// A submit earlier than the render (negative elapsed) is also too fast.
    pub fn check(&self, form_started_at: Option<f64>, form_submitted_at: Option<f64>) -> HoneypotResult {
        match (form_started_at, form_submitted_at) {
            (Some(start), Some(submit)) if submit - start < self.min_form_time_secs => {
                HoneypotResult::TooFast
            }
            _ => HoneypotResult::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> HoneypotTimingCheck {
        HoneypotTimingCheck::new(&HoneypotConfig {
            enabled: true,
            min_form_time_secs: 1.0,
        })
    }

    #[test]
    fn test_too_fast() {
        let t = 1_700_000_000.0;
        assert_eq!(check().check(Some(t), Some(t + 0.5)), HoneypotResult::TooFast);
        assert_eq!(check().check(Some(t), Some(t - 3.0)), HoneypotResult::TooFast);
    }

    #[test]
    fn test_human_speed() {
        let t = 1_700_000_000.0;
        assert_eq!(check().check(Some(t), Some(t + 2.0)), HoneypotResult::Ok);
        assert_eq!(check().check(Some(t), Some(t + 1.0)), HoneypotResult::Ok);
    }

    #[test]
    fn test_missing_timestamps_not_evaluated() {
        assert_eq!(check().check(None, Some(5.0)), HoneypotResult::Ok);
        assert_eq!(check().check(Some(5.0), None), HoneypotResult::Ok);
        assert_eq!(check().check(None, None), HoneypotResult::Ok);
    }
}
