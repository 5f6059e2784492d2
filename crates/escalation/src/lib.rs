//! Escalation Scheduling
//!
//! Drives each open incident through a policy-defined sequence of timed
//! notification steps. Timers are the engine's only intentional suspension
//! points; acknowledgment and resolution cancel them race-free through a
//! per-incident generation counter checked under the incident lock.

mod policy;
mod scheduler;

pub use policy::{EscalationPolicy, EscalationStep, PolicySelector, PolicySet};
pub use scheduler::{EscalationFailure, EscalationScheduler};

use thiserror::Error;

/// Policy resolution errors
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No selector matched; callers fall back to the mandatory default
    #[error("No escalation policy selector matches severity {severity}")]
    NoMatch { severity: &'static str },
}
