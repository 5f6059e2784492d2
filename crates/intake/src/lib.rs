//! Event Intake
//!
//! Validates and normalizes incoming raw event reports into canonical alerts,
//! including signature derivation for correlation and dedup.

mod alert;
mod error;
mod normalizer;

pub use alert::{Alert, AlertContext, RawReport, Severity};
pub use error::ValidationError;
pub use normalizer::{normalize, normalize_component, signature_of};
