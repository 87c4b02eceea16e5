//! Bot Detection Module
//!
//! Per-client signals that distinguish automation from humans:
//! - Request rate over a sliding window (soft and flood limits)
//! - Form submission timing (honeypot)

pub mod honeypot;
pub mod rate;

pub use honeypot::{HoneypotResult, HoneypotTimingCheck};
pub use rate::{RateState, RateWindowTracker};
