//! Per-Incident Escalation Scheduler

use crate::EscalationPolicy;
use broadcast::{Broadcaster, EngineEvent, EventType};
use chrono::Utc;
use delivery::DeliveryRouter;
use incident_store::{DeliveryStatus, IncidentStatus, IncidentStore};
use intake::Severity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Report of a fully exhausted delivery at the highest escalation step.
/// Fed back into intake as an internally generated critical alert.
#[derive(Debug, Clone)]
pub struct EscalationFailure {
    pub incident_id: u64,
    pub severity: Severity,
    pub step: u32,
}

/// Timer task registered for one incident
struct ScheduledTask {
    /// Generation the task was scheduled under; a schedule call carrying an
    /// older generation must never displace this entry
    generation: u64,
    handle: JoinHandle<()>,
}

/// Drives open incidents through their bound policy's timed steps.
///
/// One task per scheduled incident; a task only acts after re-checking, under
/// the incident lock, that the incident is still open and that its generation
/// matches the one observed at scheduling time. Cancellation bumps the
/// generation first (under the same lock), then aborts the task, so a timer
/// that raced past the abort is still a no-op.
pub struct EscalationScheduler {
    store: Arc<IncidentStore>,
    router: Arc<DeliveryRouter>,
    broadcaster: Arc<Broadcaster>,
    meta_tx: mpsc::Sender<EscalationFailure>,
    tasks: Arc<Mutex<HashMap<u64, ScheduledTask>>>,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<IncidentStore>,
        router: Arc<DeliveryRouter>,
        broadcaster: Arc<Broadcaster>,
        meta_tx: mpsc::Sender<EscalationFailure>,
    ) -> Self {
        Self {
            store,
            router,
            broadcaster,
            meta_tx,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule (or reschedule) escalation for an incident under the given
    /// policy. `generation` is the incident generation observed by the
    /// caller; a reschedule replaces any previous task for the incident.
    /// `allow_meta` is false for incidents opened by exempt meta-alerts, so
    /// delivery-failure alerts can never recurse.
    pub fn schedule(
        &self,
        incident_id: u64,
        policy: Arc<EscalationPolicy>,
        generation: u64,
        service: String,
        allow_meta: bool,
    ) {
        if policy.steps.is_empty() {
            warn!(
                "Policy '{}' has no steps; incident {} will not escalate",
                policy.name, incident_id
            );
            return;
        }
        debug!(
            "Scheduling incident {} on policy '{}' (generation {})",
            incident_id, policy.name, generation
        );

        let store = Arc::clone(&self.store);
        let router = Arc::clone(&self.router);
        let broadcaster = Arc::clone(&self.broadcaster);
        let meta_tx = self.meta_tx.clone();
        let tasks_map = Arc::clone(&self.tasks);

        let handle = tokio::spawn(async move {
            let mut elapsed = 0u64;
            let last_step = policy.steps.len() - 1;

            'steps: for (step_idx, step) in policy.steps.iter().enumerate() {
                let wait = step.delay_seconds.saturating_sub(elapsed);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                elapsed = step.delay_seconds;

                let Some(cell) = store.get(incident_id) else {
                    break 'steps;
                };
                let mut incident = cell.lock().await;
                // Stale timers must never advance escalation
                if incident.status != IncidentStatus::Open || incident.generation != generation {
                    debug!(
                        "Timer for incident {} step {} is stale, exiting",
                        incident_id, step_idx
                    );
                    break 'steps;
                }

                incident.escalation_level = step_idx as u32 + 1;
                incident.last_escalated_at = Some(Utc::now());
                let severity = incident.severity;
                let payload = serde_json::json!({
                    "incident_id": incident_id,
                    "severity": severity,
                    "step": step_idx,
                    "signatures": incident.signature_group,
                    "message": format!("Incident #{incident_id} escalation step {step_idx}"),
                });
                drop(incident);

                info!(
                    "Escalating incident {} to step {} ({} targets)",
                    incident_id,
                    step_idx,
                    step.targets.len()
                );
                broadcaster.publish(
                    EngineEvent {
                        event_type: EventType::Escalated,
                        incident_id,
                        severity,
                        timestamp: Utc::now(),
                    },
                    &service,
                );

                // Dispatch without blocking the next timer; delivery retries
                // run while the following step arms
                let router = Arc::clone(&router);
                let store = Arc::clone(&store);
                let meta_tx = meta_tx.clone();
                let targets = step.targets.clone();
                let is_final = step_idx == last_step;
                tokio::spawn(async move {
                    let rows = router
                        .deliver(incident_id, step_idx as u32, &targets, payload)
                        .await;
                    let fully_exhausted = !rows.is_empty()
                        && rows
                            .iter()
                            .all(|r| r.status != DeliveryStatus::Sent)
                        && rows.iter().any(|r| r.status == DeliveryStatus::Exhausted);
                    if let Err(e) = store.record_attempts(rows) {
                        warn!("Failed to record delivery attempts: {}", e);
                    }
                    if is_final && fully_exhausted && allow_meta {
                        let report = EscalationFailure {
                            incident_id,
                            severity,
                            step: step_idx as u32,
                        };
                        if meta_tx.try_send(report).is_err() {
                            warn!("Meta-alert queue full for incident {}", incident_id);
                        }
                    }
                });
            }
            // Steps exhausted (or the incident went away): hold at the final
            // level and reap our own entry so finished escalations do not
            // linger in the task map
            debug!("Incident {} escalation task finished", incident_id);
            let mut tasks = tasks_map.lock().unwrap_or_else(|e| e.into_inner());
            if tasks
                .get(&incident_id)
                .is_some_and(|t| t.generation == generation)
            {
                tasks.remove(&incident_id);
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // A reschedule under a newer generation may already be registered
        // (attach + rebind racing the creator); an older schedule arriving
        // late must not displace it, or the incident would never escalate
        if tasks
            .get(&incident_id)
            .is_some_and(|t| t.generation > generation)
        {
            debug!(
                "Discarding stale schedule for incident {} (generation {})",
                incident_id, generation
            );
            handle.abort();
            return;
        }
        if let Some(previous) = tasks.insert(incident_id, ScheduledTask { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending timer for an incident. Callers must have bumped the
    /// incident's generation under its lock first.
    pub fn cancel(&self, incident_id: u64) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = tasks.remove(&incident_id) {
            task.handle.abort();
            debug!("Cancelled escalation task for incident {}", incident_id);
        }
    }

    /// Number of incidents with a live escalation task
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|t| t.values().filter(|task| !task.handle.is_finished()).count())
            .unwrap_or(0)
    }
}
