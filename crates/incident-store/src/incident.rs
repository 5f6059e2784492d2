//! Incident and Audit Record Types

use chrono::{DateTime, Utc};
use intake::{Alert, Severity};
use serde::{Deserialize, Serialize};

/// Incident lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
    Closed,
}

impl IncidentStatus {
    /// Terminal statuses accept no further escalation
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }
}

/// The aggregated, escalation-managed entity for one or more correlated
/// alerts. Mutated only under its store cell's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Sequential id; "lowest id" tie-breaks mean "oldest created"
    pub id: u64,
    /// Signatures of all contributing alerts, first entry is the opener's
    pub signature_group: Vec<String>,
    /// Max severity over contributing alerts, classifier upgrades included
    pub severity: Severity,
    /// Source service of the opening alert, used for broadcast topics
    pub service: String,
    pub status: IncidentStatus,
    /// Monotonically non-decreasing while status == open
    pub escalation_level: u32,
    /// Total correlated occurrences, suppressed ones included
    pub occurrence_count: u64,
    pub opened_at: DateTime<Utc>,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_created: bool,
    /// Name of the escalation policy bound at creation, fixed for life
    pub policy_name: String,
    /// Bumped under the incident lock at every cancellation point; timer
    /// callbacks compare against it before acting
    pub generation: u64,
}

impl Incident {
    /// Whether a signature is already part of this incident's group
    pub fn contains_signature(&self, signature: &str) -> bool {
        self.signature_group.iter().any(|s| s == signature)
    }
}

/// Delivery attempt terminal/progress status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
    Exhausted,
}

/// One logged try of sending a notification through one channel.
/// Append-only; never mutated after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub incident_id: u64,
    /// Escalation step index this attempt was issued for
    pub step: u32,
    pub channel: String,
    pub address: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Audit row for one ingested alert, suppressed or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert: Alert,
    /// Incident the alert was correlated into, if any
    pub incident_id: Option<u64>,
    pub suppressed: bool,
    pub suppress_reason: Option<String>,
}
