//! Alert Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity, ordered so upgrades are a `max()`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Topic fragment for broadcast routing ("severity.high" etc.)
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Contextual signals attached to a report at ingestion time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertContext {
    /// Report arrived outside business hours
    #[serde(default)]
    pub is_off_hours: bool,
    /// Report arrived during a peak traffic period
    #[serde(default)]
    pub is_peak_period: bool,
    /// Number of affected entities (users, hosts, tenants)
    #[serde(default)]
    pub scope_size: u64,
}

/// Raw event report as submitted by a reporting service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawReport {
    pub source_service: String,
    pub error_type: String,
    /// Reporter-declared severity floor; classification never goes below it
    #[serde(default)]
    pub severity_hint: Severity,
    pub message: String,
    /// Optional affected scope (cluster, region, shard)
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub context: AlertContext,
}

/// One normalized occurrence of a reported problem.
///
/// Immutable once created; repeats of the same signature increment the
/// matched incident's occurrence count instead of producing new alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    /// Correlation fingerprint derived from type + source + scope
    pub signature: String,
    pub severity: Severity,
    pub source_service: String,
    /// Opaque original payload, retained for audit
    pub raw_payload: serde_json::Value,
    pub context: AlertContext,
    pub received_at: DateTime<Utc>,
    /// Internally generated meta-alerts bypass suppression and correlation
    /// matching so delivery-failure reports can never be silenced
    #[serde(default)]
    pub exempt: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::High.max(Severity::Low), Severity::High);
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
    }
}
