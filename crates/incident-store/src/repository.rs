//! Repository Implementation

use crate::{AlertRecord, DeliveryAttempt, Incident, IncidentStatus, StoreError};
use chrono::{DateTime, Utc};
use intake::Severity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// In-memory incident repository.
///
/// The incident map is guarded by a sync RwLock (never held across awaits);
/// each incident lives in its own async mutex cell, giving the per-incident
/// single-writer guarantee. Audit logs are append-only with retention caps.
pub struct IncidentStore {
    /// Incident cells by id
    incidents: RwLock<HashMap<u64, Arc<AsyncMutex<Incident>>>>,
    /// Append-only alert audit log
    alert_log: Mutex<Vec<AlertRecord>>,
    /// Append-only delivery attempt history
    attempts: Mutex<Vec<DeliveryAttempt>>,
    /// Next incident id
    next_id: AtomicU64,
    /// Max retained alert records
    max_alert_records: usize,
    /// Max retained delivery attempts
    max_attempt_records: usize,
}

impl IncidentStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        info!("Creating in-memory incident store");
        Self {
            incidents: RwLock::new(HashMap::new()),
            alert_log: Mutex::new(Vec::with_capacity(1000)),
            attempts: Mutex::new(Vec::with_capacity(1000)),
            next_id: AtomicU64::new(1),
            max_alert_records: 100_000,
            max_attempt_records: 100_000,
        }
    }

    /// Create and register a new open incident, returning its id and cell
    pub fn create(
        &self,
        signature: String,
        severity: Severity,
        service: String,
        policy_name: String,
        auto_created: bool,
        opened_at: DateTime<Utc>,
    ) -> Result<(u64, Arc<AsyncMutex<Incident>>), StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let incident = Incident {
            id,
            signature_group: vec![signature],
            severity,
            service,
            status: IncidentStatus::Open,
            escalation_level: 0,
            occurrence_count: 1,
            opened_at,
            last_escalated_at: None,
            resolved_at: None,
            auto_created,
            policy_name,
            generation: 0,
        };
        let cell = Arc::new(AsyncMutex::new(incident));
        self.incidents
            .write()
            .map_err(|e| StoreError::Lock(e.to_string()))?
            .insert(id, Arc::clone(&cell));
        debug!("Created incident {} ({:?})", id, severity);
        Ok((id, cell))
    }

    /// Get the cell for an incident, if it exists
    pub fn get(&self, id: u64) -> Option<Arc<AsyncMutex<Incident>>> {
        self.incidents.read().ok()?.get(&id).cloned()
    }

    /// Acquire the single-writer lock for an incident
    pub async fn lock(&self, id: u64) -> Result<OwnedMutexGuard<Incident>, StoreError> {
        let cell = self.get(id).ok_or(StoreError::NotFound(id))?;
        Ok(cell.lock_owned().await)
    }

    /// Record one ingested alert in the audit log
    pub fn record_alert(&self, record: AlertRecord) -> Result<(), StoreError> {
        let mut log = self
            .alert_log
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        while log.len() >= self.max_alert_records {
            log.remove(0);
        }
        log.push(record);
        Ok(())
    }

    /// Recent alert records, newest first
    pub fn alerts(&self, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        let log = self
            .alert_log
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(log.iter().rev().take(limit).cloned().collect())
    }

    /// Append delivery attempt rows
    pub fn record_attempts(&self, rows: Vec<DeliveryAttempt>) -> Result<(), StoreError> {
        let mut attempts = self
            .attempts
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        for row in rows {
            while attempts.len() >= self.max_attempt_records {
                attempts.remove(0);
            }
            attempts.push(row);
        }
        Ok(())
    }

    /// Delivery attempts for one incident, in record order
    pub fn attempts_for(&self, incident_id: u64) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let attempts = self
            .attempts
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(attempts
            .iter()
            .filter(|a| a.incident_id == incident_id)
            .cloned()
            .collect())
    }

    /// Snapshot incidents with optional filters, newest first
    pub async fn snapshot(
        &self,
        status: Option<IncidentStatus>,
        severity: Option<Severity>,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        let cells: Vec<_> = {
            let map = self
                .incidents
                .read()
                .map_err(|e| StoreError::Lock(e.to_string()))?;
            map.values().cloned().collect()
        };
        let mut out = Vec::new();
        for cell in cells {
            let incident = cell.lock().await;
            if status.map_or(true, |s| incident.status == s)
                && severity.map_or(true, |s| incident.severity == s)
            {
                out.push(incident.clone());
            }
        }
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out.truncate(limit);
        Ok(out)
    }

    /// Total incident count
    pub fn incident_count(&self) -> usize {
        self.incidents.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Total audit-logged alert count
    pub fn alert_count(&self) -> usize {
        self.alert_log.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Total delivery attempt count
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        if let Ok(mut map) = self.incidents.write() {
            map.clear();
        }
        if let Ok(mut log) = self.alert_log.lock() {
            log.clear();
        }
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.clear();
        }
    }
}

impl Default for IncidentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeliveryStatus;

    #[tokio::test]
    async fn test_create_and_lock() {
        let store = IncidentStore::new();
        let (id, _cell) = store
            .create(
                "db-timeout-svcA".to_string(),
                Severity::High,
                "svcA".to_string(),
                "default".to_string(),
                true,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(id, 1);

        let incident = store.lock(id).await.unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.escalation_level, 0);
        assert_eq!(incident.occurrence_count, 1);
        assert!(incident.contains_signature("db-timeout-svcA"));
    }

    #[tokio::test]
    async fn test_sequential_ids() {
        let store = IncidentStore::new();
        for expected in 1..=3u64 {
            let (id, _) = store
                .create(
                    format!("sig-{expected}"),
                    Severity::Low,
                    "svcA".to_string(),
                    "default".to_string(),
                    true,
                    Utc::now(),
                )
                .unwrap();
            assert_eq!(id, expected);
        }
    }

    #[tokio::test]
    async fn test_lock_unknown_incident() {
        let store = IncidentStore::new();
        assert!(matches!(store.lock(42).await, Err(StoreError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_attempt_history_per_incident() {
        let store = IncidentStore::new();
        let (id, _) = store
            .create(
                "sig".to_string(),
                Severity::Low,
                "svcA".to_string(),
                "default".to_string(),
                true,
                Utc::now(),
            )
            .unwrap();
        store
            .record_attempts(vec![
                DeliveryAttempt {
                    incident_id: id,
                    step: 0,
                    channel: "pager".to_string(),
                    address: "oncall".to_string(),
                    status: DeliveryStatus::Failed,
                    attempt_count: 3,
                    last_error: Some("timeout".to_string()),
                    recorded_at: Utc::now(),
                },
                DeliveryAttempt {
                    incident_id: id,
                    step: 0,
                    channel: "webhook".to_string(),
                    address: "https://ops.example".to_string(),
                    status: DeliveryStatus::Sent,
                    attempt_count: 1,
                    last_error: None,
                    recorded_at: Utc::now(),
                },
            ])
            .unwrap();

        let history = store.attempts_for(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, DeliveryStatus::Failed);
        assert_eq!(history[1].status, DeliveryStatus::Sent);
        assert!(store.attempts_for(999).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_filters() {
        let store = IncidentStore::new();
        store
            .create(
                "a".to_string(),
                Severity::Low,
                "svcA".to_string(),
                "default".to_string(),
                true,
                Utc::now(),
            )
            .unwrap();
        let (id, _) = store
            .create(
                "b".to_string(),
                Severity::Critical,
                "svcB".to_string(),
                "default".to_string(),
                true,
                Utc::now(),
            )
            .unwrap();
        {
            let mut incident = store.lock(id).await.unwrap();
            incident.status = IncidentStatus::Acknowledged;
        }

        let open = store
            .snapshot(Some(IncidentStatus::Open), None, 10)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        let critical = store.snapshot(None, Some(Severity::Critical), 10).await.unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].id, id);
    }
}
