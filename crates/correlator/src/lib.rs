//! Alert Correlation
//!
//! Groups alerts into an existing or new incident using a time-windowed
//! signature similarity match, with deterministic tie-breaking and an atomic
//! lookup-or-create path so concurrent bursts of one signature produce
//! exactly one incident.

mod engine;
mod similarity;

pub use engine::{CorrelationOutcome, Correlator, CorrelatorConfig};
pub use similarity::{levenshtein, similarity};
