//! Report Normalization and Signature Derivation

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::{Alert, RawReport, ValidationError};

/// Collapse a signature component to a stable token: non-alphanumeric runs
/// become a single '-', leading/trailing separators are trimmed
pub fn normalize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Derive the correlation signature from error type, source service, and
/// optional scope. Signatures are readable composites so similarity matching
/// against them is meaningful.
pub fn signature_of(error_type: &str, source_service: &str, scope: Option<&str>) -> String {
    let mut sig = format!(
        "{}-{}",
        normalize_component(error_type),
        normalize_component(source_service)
    );
    if let Some(scope) = scope {
        let scope = normalize_component(scope);
        if !scope.is_empty() {
            sig.push('-');
            sig.push_str(&scope);
        }
    }
    sig
}

/// Validate a raw report and normalize it into a canonical [`Alert`].
///
/// Required fields: source_service, error_type, message. The alert is pure
/// data; persistence is the caller's concern.
pub fn normalize(raw: RawReport, received_at: DateTime<Utc>) -> Result<Alert, ValidationError> {
    if raw.source_service.trim().is_empty() {
        return Err(ValidationError::MissingField("source_service"));
    }
    if raw.error_type.trim().is_empty() {
        return Err(ValidationError::MissingField("error_type"));
    }
    if raw.message.trim().is_empty() {
        return Err(ValidationError::MissingField("message"));
    }

    let source_service = normalize_component(&raw.source_service);
    if source_service.is_empty() {
        return Err(ValidationError::InvalidField {
            field: "source_service",
            reason: "no usable characters after normalization".to_string(),
        });
    }

    let signature = signature_of(&raw.error_type, &raw.source_service, raw.scope.as_deref());
    debug!("Normalized report from {} as {}", source_service, signature);

    let raw_payload = serde_json::to_value(&raw).unwrap_or(serde_json::Value::Null);

    Ok(Alert {
        id: Uuid::new_v4(),
        signature,
        severity: raw.severity_hint,
        source_service,
        raw_payload,
        context: raw.context,
        received_at,
        exempt: false,
    })
}
