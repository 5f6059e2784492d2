//! Correlation Engine Implementation

use crate::similarity::similarity;
use chrono::{DateTime, Duration, Utc};
use incident_store::{IncidentStore, StoreError};
use intake::{Alert, Severity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Correlator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Correlation window in seconds
    pub window_seconds: i64,
    /// Minimum signature similarity for an attach
    pub similarity_threshold: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window_seconds: 300,
            similarity_threshold: 0.7,
        }
    }
}

/// Index entry for one open incident
#[derive(Debug, Clone)]
struct OpenEntry {
    incident_id: u64,
    opened_at: DateTime<Utc>,
    signatures: Vec<String>,
}

/// Result of correlating one alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// Alert attached to an existing incident
    Attached {
        incident_id: u64,
        /// Incident severity rose because of this alert
        severity_upgraded: bool,
        /// No escalation step has fired yet; the bound policy may still be
        /// re-resolved under the new severity
        may_rebind: bool,
    },
    /// A new incident was opened for this alert
    Created { incident_id: u64 },
}

impl CorrelationOutcome {
    pub fn incident_id(&self) -> u64 {
        match self {
            CorrelationOutcome::Attached { incident_id, .. } => *incident_id,
            CorrelationOutcome::Created { incident_id } => *incident_id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CorrelationOutcome::Created { .. })
    }
}

/// Windowed similarity correlator over the open-incident index.
///
/// Lock ordering: the index mutex is always taken before any incident cell
/// lock, never the other way around.
pub struct Correlator {
    config: CorrelatorConfig,
    store: Arc<IncidentStore>,
    /// Open incidents eligible for correlation. One mutex makes the
    /// lookup-or-create critical section atomic under concurrent bursts.
    index: Mutex<Vec<OpenEntry>>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig, store: Arc<IncidentStore>) -> Self {
        info!("Creating correlator with config: {:?}", config);
        Self {
            config,
            store,
            index: Mutex::new(Vec::new()),
        }
    }

    /// Correlate an active alert: attach to the best open candidate within
    /// the window, or open a new incident bound to `policy_name`.
    ///
    /// Exempt (internally generated) alerts never match existing incidents;
    /// they always open a fresh one.
    pub async fn correlate(
        &self,
        alert: &Alert,
        classified: Severity,
        policy_name: &str,
    ) -> Result<CorrelationOutcome, StoreError> {
        let mut index = self.index.lock().await;

        if !alert.exempt {
            if let Some(outcome) = self.try_attach(&mut index, alert, Some(classified)).await {
                return Ok(outcome);
            }
        }

        let (incident_id, _cell) = self.store.create(
            alert.signature.clone(),
            classified,
            alert.source_service.clone(),
            policy_name.to_string(),
            true,
            alert.received_at,
        )?;
        index.push(OpenEntry {
            incident_id,
            opened_at: alert.received_at,
            signatures: vec![alert.signature.clone()],
        });
        debug!(
            "Opened incident {} for signature {}",
            incident_id, alert.signature
        );
        Ok(CorrelationOutcome::Created { incident_id })
    }

    /// Correlate a suppressed alert: attach to an existing incident if one
    /// matches (occurrence bump only, no severity change), otherwise nothing.
    /// Suppressed alerts never cause incident creation.
    pub async fn attach_only(&self, alert: &Alert) -> Option<u64> {
        let mut index = self.index.lock().await;
        self.try_attach(&mut index, alert, None)
            .await
            .map(|outcome| outcome.incident_id())
    }

    /// Remove an incident from the correlation index once it leaves `open`.
    /// Must not be called while holding that incident's cell lock.
    pub async fn retire(&self, incident_id: u64) {
        let mut index = self.index.lock().await;
        index.retain(|entry| entry.incident_id != incident_id);
    }

    /// Number of incidents currently eligible for correlation
    pub async fn open_count(&self) -> usize {
        self.index.lock().await.len()
    }

    /// Find the best candidate and attach the alert to it. `upgrade` carries
    /// the classified severity for active alerts; suppressed alerts pass
    /// `None` and only bump the occurrence count.
    async fn try_attach(
        &self,
        index: &mut Vec<OpenEntry>,
        alert: &Alert,
        upgrade: Option<Severity>,
    ) -> Option<CorrelationOutcome> {
        loop {
            let entry_pos = self.best_candidate(index, alert)?;
            let incident_id = index[entry_pos].incident_id;

            let Some(cell) = self.store.get(incident_id) else {
                index.remove(entry_pos);
                continue;
            };
            let mut incident = cell.lock().await;
            if incident.status.is_terminal() {
                // Raced with resolution; drop the stale entry and retry
                index.remove(entry_pos);
                continue;
            }

            incident.occurrence_count += 1;
            if !incident.contains_signature(&alert.signature) {
                incident.signature_group.push(alert.signature.clone());
                index[entry_pos].signatures.push(alert.signature.clone());
            }

            let mut severity_upgraded = false;
            if let Some(classified) = upgrade {
                if classified > incident.severity {
                    incident.severity = classified;
                    severity_upgraded = true;
                }
            }
            let may_rebind =
                incident.escalation_level == 0 && incident.last_escalated_at.is_none();

            debug!(
                "Attached alert {} to incident {} (occurrences: {})",
                alert.signature, incident_id, incident.occurrence_count
            );
            return Some(CorrelationOutcome::Attached {
                incident_id,
                severity_upgraded,
                may_rebind,
            });
        }
    }

    /// Deterministic candidate selection: any open incident with a group
    /// signature of similarity >= threshold and opened_at inside the window.
    /// Ties break on closer opened_at, then lowest incident id.
    fn best_candidate(&self, index: &[OpenEntry], alert: &Alert) -> Option<usize> {
        let window = Duration::seconds(self.config.window_seconds);
        let mut best: Option<(i64, u64, usize)> = None;

        for (pos, entry) in index.iter().enumerate() {
            let distance = (alert.received_at - entry.opened_at).num_milliseconds().abs();
            if distance > window.num_milliseconds() {
                continue;
            }
            let matched = entry
                .signatures
                .iter()
                .any(|s| similarity(s, &alert.signature) >= self.config.similarity_threshold);
            if !matched {
                continue;
            }
            let key = (distance, entry.incident_id, pos);
            match best {
                Some((d, id, _)) if (distance, entry.incident_id) >= (d, id) => {}
                _ => best = Some(key),
            }
        }
        best.map(|(_, _, pos)| pos)
    }
}
