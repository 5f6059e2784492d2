//! Alert Suppression
//!
//! Evaluates explicit suppression rules (maintenance windows) and an
//! independent fatigue check over per-signature observation counts.
//! Suppressed alerts never reach escalation but keep their audit trail.

mod manager;

pub use manager::{SuppressReason, SuppressionRule, Suppressor, SuppressorConfig};
