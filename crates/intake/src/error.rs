//! Intake Error Types

use thiserror::Error;

/// Errors during raw report validation
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Field present but unusable after normalization
    #[error("Field {field} is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl ValidationError {
    /// Field name for the field-level 4xx response body
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField(f) => f,
            ValidationError::InvalidField { field, .. } => field,
        }
    }
}
