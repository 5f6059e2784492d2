//! Incident Store
//!
//! System of record for incidents, the append-only alert audit log, and
//! delivery attempt history. Mutation of a given incident is serialized
//! through a per-incident async mutex (single writer per incident);
//! cross-incident operations proceed in parallel.

mod incident;
mod repository;

pub use incident::{
    AlertRecord, DeliveryAttempt, DeliveryStatus, Incident, IncidentStatus,
};
pub use repository::IncidentStore;

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Incident not found: {0}")]
    NotFound(u64),
    #[error("Lock error: {0}")]
    Lock(String),
}
