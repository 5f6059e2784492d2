//! Alert Engine Pipeline
//!
//! Wires the full data flow: intake -> classifier -> correlator ->
//! suppressor -> escalation scheduler -> delivery router, with every state
//! transition pushed to broadcast fan-out. Also owns the policy snapshot
//! (hot-reloadable) and the meta-alert feedback queue.

mod config;
mod engine;

pub use config::EngineConfig;
pub use engine::{Engine, IngestOutcome};

use incident_store::StoreError;
use intake::ValidationError;
use thiserror::Error;

/// Engine-level errors surfaced to synchronous callers
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
