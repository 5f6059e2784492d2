//! Engine Implementation

use crate::{EngineConfig, EngineError};
use broadcast::{Broadcaster, EngineEvent, EventType};
use chrono::Utc;
use classifier::Classifier;
use correlator::{CorrelationOutcome, Correlator};
use delivery::{ChannelAdapter, DeliveryRouter, Target};
use escalation::{EscalationFailure, EscalationPolicy, EscalationScheduler, EscalationStep, PolicySet};
use incident_store::{AlertRecord, DeliveryAttempt, Incident, IncidentStatus, IncidentStore};
use intake::{Alert, RawReport, Severity};
use metrics::counter;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use suppressor::Suppressor;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Synchronous result of one ingestion
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub alert_id: Uuid,
    /// Absent when a suppressed alert matched no open incident
    pub incident_id: Option<u64>,
    pub severity: Severity,
    pub suppressed: bool,
}

/// Built-in fallback policy used when configuration provides none
fn builtin_default_policy() -> EscalationPolicy {
    EscalationPolicy {
        name: "default".to_string(),
        selector: Default::default(),
        steps: vec![EscalationStep {
            delay_seconds: 0,
            targets: vec![Target {
                channel: "log".to_string(),
                address: "operators".to_string(),
            }],
        }],
    }
}

/// The alert classification, correlation, and escalation engine.
///
/// Classification, correlation, and suppression complete synchronously in
/// `ingest`; escalation scheduling is fire-and-forget. The policy snapshot is
/// swapped whole on reload; incidents keep the policy bound at creation.
pub struct Engine {
    store: Arc<IncidentStore>,
    classifier: Classifier,
    correlator: Correlator,
    suppressor: Suppressor,
    scheduler: EscalationScheduler,
    broadcaster: Arc<Broadcaster>,
    policies: RwLock<Arc<PolicySet>>,
}

impl Engine {
    /// Build the engine and its background meta-alert pump. Returns the
    /// operator-facing failure queue receiver alongside the engine.
    pub fn new(
        config: EngineConfig,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> (Arc<Self>, mpsc::Receiver<DeliveryAttempt>) {
        let store = Arc::new(IncidentStore::new());
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast_buffer.max(1)));

        let (failure_tx, failure_rx) = mpsc::channel(256);
        let mut router = DeliveryRouter::new(config.router.clone(), failure_tx);
        for adapter in adapters {
            router.register(adapter);
        }

        let (meta_tx, mut meta_rx) = mpsc::channel::<EscalationFailure>(64);
        let scheduler = EscalationScheduler::new(
            Arc::clone(&store),
            Arc::new(router),
            Arc::clone(&broadcaster),
            meta_tx,
        );

        let suppressor = Suppressor::new(config.suppressor.clone());
        suppressor.set_rules(config.suppression_rules.clone());

        let default_policy = config
            .default_policy
            .clone()
            .unwrap_or_else(builtin_default_policy);
        let policy_set = PolicySet::new(config.policies.clone(), default_policy);

        let engine = Arc::new(Self {
            classifier: Classifier::new(config.classifier.clone()),
            correlator: Correlator::new(config.correlator.clone(), Arc::clone(&store)),
            suppressor,
            scheduler,
            broadcaster,
            policies: RwLock::new(Arc::new(policy_set)),
            store,
        });

        // One-directional feedback: delivery exhaustion at the highest step
        // re-enters intake as an exempt critical alert
        let pump = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(failure) = meta_rx.recv().await {
                if let Err(e) = pump.handle_escalation_failure(failure).await {
                    warn!("Meta-alert ingestion failed: {}", e);
                }
            }
        });

        (engine, failure_rx)
    }

    /// Ingest one raw report: validate, classify, suppress-check, correlate,
    /// and (for active alerts) schedule escalation
    pub async fn ingest(&self, raw: RawReport) -> Result<IngestOutcome, EngineError> {
        let alert = intake::normalize(raw, Utc::now())?;
        self.process(alert).await
    }

    async fn process(&self, alert: Alert) -> Result<IngestOutcome, EngineError> {
        counter!("alerts_ingested_total").increment(1);
        let classified = self.classifier.classify(&alert, &alert.context);
        let now = alert.received_at;

        if !alert.exempt {
            let suppress = self.suppressor.should_suppress(&alert, now);
            self.suppressor.record_observation(&alert.signature, now);

            if let Some(reason) = suppress {
                counter!("alerts_suppressed_total").increment(1);
                let incident_id = self.correlator.attach_only(&alert).await;
                self.store.record_alert(AlertRecord {
                    alert: alert.clone(),
                    incident_id,
                    suppressed: true,
                    suppress_reason: Some(reason.as_string()),
                })?;
                if let Some(id) = incident_id {
                    self.broadcaster.publish(
                        EngineEvent {
                            event_type: EventType::Suppressed,
                            incident_id: id,
                            severity: classified,
                            timestamp: now,
                        },
                        &alert.source_service,
                    );
                }
                debug!(
                    "Alert {} suppressed ({})",
                    alert.signature,
                    reason.as_string()
                );
                return Ok(IngestOutcome {
                    alert_id: alert.id,
                    incident_id,
                    severity: classified,
                    suppressed: true,
                });
            }
        }

        let policy = self.policy_snapshot().resolve(
            classified,
            &alert.source_service,
            &alert.context,
        );
        let outcome = self
            .correlator
            .correlate(&alert, classified, &policy.name)
            .await?;
        let incident_id = outcome.incident_id();

        self.store.record_alert(AlertRecord {
            alert: alert.clone(),
            incident_id: Some(incident_id),
            suppressed: false,
            suppress_reason: None,
        })?;

        match outcome {
            CorrelationOutcome::Created { .. } => {
                counter!("incidents_opened_total").increment(1);
                info!(
                    "Opened incident {} ({:?}) for {}",
                    incident_id, classified, alert.signature
                );
                // Opened must be on every subscriber's channel before the
                // timer task can publish the first Escalated
                self.broadcaster.publish(
                    EngineEvent {
                        event_type: EventType::Opened,
                        incident_id,
                        severity: classified,
                        timestamp: now,
                    },
                    &alert.source_service,
                );
                self.scheduler.schedule(
                    incident_id,
                    policy,
                    0,
                    alert.source_service.clone(),
                    !alert.exempt,
                );
            }
            CorrelationOutcome::Attached {
                severity_upgraded,
                may_rebind,
                ..
            } => {
                // A severity upgrade re-resolves the policy only while no
                // step has fired; afterwards the original policy continues
                if severity_upgraded && may_rebind {
                    self.rebind_policy(incident_id, &alert).await?;
                }
            }
        }

        Ok(IngestOutcome {
            alert_id: alert.id,
            incident_id: Some(incident_id),
            severity: classified,
            suppressed: false,
        })
    }

    /// Re-resolve the policy for an incident whose severity rose before any
    /// step fired, and restart its timers under a fresh generation
    async fn rebind_policy(&self, incident_id: u64, alert: &Alert) -> Result<(), EngineError> {
        let mut incident = self.store.lock(incident_id).await?;
        if incident.status != IncidentStatus::Open || incident.last_escalated_at.is_some() {
            return Ok(());
        }
        let policy = self.policy_snapshot().resolve(
            incident.severity,
            &alert.source_service,
            &alert.context,
        );
        if policy.name == incident.policy_name {
            return Ok(());
        }
        info!(
            "Rebinding incident {} from '{}' to '{}' after severity upgrade",
            incident_id, incident.policy_name, policy.name
        );
        incident.policy_name = policy.name.clone();
        incident.generation += 1;
        let generation = incident.generation;
        drop(incident);

        self.scheduler.schedule(
            incident_id,
            policy,
            generation,
            alert.source_service.clone(),
            true,
        );
        Ok(())
    }

    /// Acknowledge an incident: cancel pending escalation, keep it open for
    /// resolution. Idempotent; repeat calls are no-op successes.
    pub async fn acknowledge(&self, incident_id: u64) -> Result<Incident, EngineError> {
        let mut incident = self.store.lock(incident_id).await?;
        if incident.status != IncidentStatus::Open {
            return Ok(incident.clone());
        }
        incident.status = IncidentStatus::Acknowledged;
        incident.generation += 1;
        let snapshot = incident.clone();
        drop(incident);

        self.scheduler.cancel(incident_id);
        self.correlator.retire(incident_id).await;
        self.broadcaster.publish(
            EngineEvent {
                event_type: EventType::Acknowledged,
                incident_id,
                severity: snapshot.severity,
                timestamp: Utc::now(),
            },
            &snapshot.service,
        );
        info!("Incident {} acknowledged", incident_id);
        Ok(snapshot)
    }

    /// Resolve an incident: cancel pending escalation and close it.
    /// Idempotent; resolving a closed incident is a no-op success.
    pub async fn resolve(&self, incident_id: u64) -> Result<Incident, EngineError> {
        let mut incident = self.store.lock(incident_id).await?;
        if incident.status.is_terminal() {
            return Ok(incident.clone());
        }
        incident.generation += 1;
        incident.resolved_at = Some(Utc::now());
        // Cancellation below tears down the timer, so nothing is pending and
        // the incident closes immediately after resolution
        incident.status = IncidentStatus::Closed;
        let snapshot = incident.clone();
        drop(incident);

        self.scheduler.cancel(incident_id);
        self.correlator.retire(incident_id).await;
        for event_type in [EventType::Resolved, EventType::Closed] {
            self.broadcaster.publish(
                EngineEvent {
                    event_type,
                    incident_id,
                    severity: snapshot.severity,
                    timestamp: Utc::now(),
                },
                &snapshot.service,
            );
        }
        info!("Incident {} resolved and closed", incident_id);
        Ok(snapshot)
    }

    /// Swap in a new policy snapshot. In-flight incidents keep the policy
    /// they were bound to; only new incidents see the new set.
    pub fn reload_policies(
        &self,
        policies: Vec<EscalationPolicy>,
        default_policy: Option<EscalationPolicy>,
    ) {
        let set = PolicySet::new(
            policies,
            default_policy.unwrap_or_else(builtin_default_policy),
        );
        let mut guard = self.policies.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(set);
        info!("Policy snapshot reloaded");
    }

    fn policy_snapshot(&self) -> Arc<PolicySet> {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Turn a final-step delivery exhaustion into an exempt critical alert
    async fn handle_escalation_failure(
        &self,
        failure: EscalationFailure,
    ) -> Result<(), EngineError> {
        counter!("meta_alerts_total").increment(1);
        warn!(
            "Escalation delivery failure for incident {} at step {}",
            failure.incident_id, failure.step
        );
        let raw = RawReport {
            source_service: "alert-engine".to_string(),
            error_type: "escalation-delivery-failure".to_string(),
            severity_hint: Severity::Critical,
            message: format!(
                "All delivery channels exhausted for incident #{} at final step {}",
                failure.incident_id, failure.step
            ),
            scope: Some(format!("incident-{}", failure.incident_id)),
            context: Default::default(),
        };
        let mut alert = intake::normalize(raw, Utc::now())?;
        alert.exempt = true;
        self.process(alert).await?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Incidents currently eligible for correlation
    pub async fn open_incident_count(&self) -> usize {
        self.correlator.open_count().await
    }

    /// Incidents with a live escalation task
    pub fn scheduled_count(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Replace the active suppression rule set
    pub fn set_suppression_rules(&self, rules: Vec<suppressor::SuppressionRule>) {
        self.suppressor.set_rules(rules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use delivery::SendError;
    use incident_store::DeliveryStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use suppressor::SuppressionRule;

    /// Adapter failing its first `fail_first` calls with transient errors
    struct ScriptedChannel {
        name: &'static str,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl ScriptedChannel {
        fn new(name: &'static str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_first,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _address: &str, _payload: &serde_json::Value) -> Result<(), SendError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(SendError::transient("simulated timeout"))
            } else {
                Ok(())
            }
        }
    }

    fn raw(service: &str, error_type: &str, severity: Severity) -> RawReport {
        RawReport {
            source_service: service.to_string(),
            error_type: error_type.to_string(),
            severity_hint: severity,
            message: "something broke".to_string(),
            scope: None,
            context: Default::default(),
        }
    }

    fn policy(name: &str, channel: &str, delays: &[u64]) -> EscalationPolicy {
        EscalationPolicy {
            name: name.to_string(),
            selector: Default::default(),
            steps: delays
                .iter()
                .map(|&delay_seconds| EscalationStep {
                    delay_seconds,
                    targets: vec![Target {
                        channel: channel.to_string(),
                        address: "oncall".to_string(),
                    }],
                })
                .collect(),
        }
    }

    fn config_with_default(default_policy: EscalationPolicy) -> EngineConfig {
        EngineConfig {
            default_policy: Some(default_policy),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_transient_primary_falls_back() {
        let mut config = config_with_default(policy("paging", "pager", &[0]));
        config.router.fallback_channels = vec!["webhook".to_string()];
        let pager = ScriptedChannel::new("pager", 99);
        let webhook = ScriptedChannel::new("webhook", 0);
        let (engine, _failures) = Engine::new(
            config,
            vec![pager as Arc<dyn ChannelAdapter>, webhook as Arc<dyn ChannelAdapter>],
        );
        let (_sid, mut events) = engine.broadcaster().subscribe(vec!["*".to_string()]);

        let outcome = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        assert!(!outcome.suppressed);
        let incident_id = outcome.incident_id.unwrap();

        // Let step 0 fire and the backoff retries drain
        tokio::time::sleep(Duration::from_secs(10)).await;

        let history = engine.store().attempts_for(incident_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].channel, "pager");
        assert_eq!(history[0].status, DeliveryStatus::Failed);
        assert_eq!(history[0].attempt_count, 3);
        assert_eq!(history[1].channel, "webhook");
        assert_eq!(history[1].status, DeliveryStatus::Sent);
        assert_eq!(history[1].attempt_count, 1);

        // Subscriber ordering: opened strictly before escalated
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Opened);
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Escalated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_alert_attaches_without_delivery() {
        let config = config_with_default(policy("paging", "pager", &[0]));
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let active = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        let incident_id = active.incident_id.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let baseline = engine.store().attempts_for(incident_id).unwrap().len();

        let now = Utc::now();
        engine.set_suppression_rules(vec![SuppressionRule {
            service: "svcA".to_string(),
            error_type: String::new(),
            starts_at: now - chrono::Duration::minutes(5),
            ends_at: now + chrono::Duration::minutes(5),
            reason: "maintenance".to_string(),
        }]);

        let suppressed = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        assert!(suppressed.suppressed);
        assert_eq!(suppressed.incident_id, Some(incident_id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        // Occurrence bumped, no new delivery attempts
        let incident = engine.store().lock(incident_id).await.unwrap();
        assert_eq!(incident.occurrence_count, 2);
        drop(incident);
        assert_eq!(
            engine.store().attempts_for(incident_id).unwrap().len(),
            baseline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_unmatched_creates_no_incident() {
        let config = config_with_default(policy("paging", "pager", &[0]));
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let now = Utc::now();
        engine.set_suppression_rules(vec![SuppressionRule {
            service: "svcA".to_string(),
            error_type: String::new(),
            starts_at: now - chrono::Duration::minutes(5),
            ends_at: now + chrono::Duration::minutes(5),
            reason: "maintenance".to_string(),
        }]);

        let outcome = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        assert!(outcome.suppressed);
        assert_eq!(outcome.incident_id, None);
        assert_eq!(engine.store().incident_count(), 0);
        // Still audit-logged
        assert_eq!(engine.store().alert_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatigue_suppression_kicks_in() {
        let mut config = config_with_default(policy("paging", "pager", &[0]));
        config.suppressor.fatigue_threshold = 2;
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let mut last = None;
        for _ in 0..4 {
            last = Some(
                engine
                    .ingest(raw("svcA", "db-timeout", Severity::High))
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last.suppressed);
        // Fatigue-suppressed repeats still count on the incident
        let incident_id = last.incident_id.unwrap();
        let incident = engine.store().lock(incident_id).await.unwrap();
        assert_eq!(incident.occurrence_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_is_idempotent_and_cancels() {
        let config = config_with_default(policy("paging", "pager", &[0, 60]));
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let outcome = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        let incident_id = outcome.incident_id.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let first = engine.acknowledge(incident_id).await.unwrap();
        assert_eq!(first.status, IncidentStatus::Acknowledged);
        let second = engine.acknowledge(incident_id).await.unwrap();
        assert_eq!(second.status, IncidentStatus::Acknowledged);

        // The 60s step never fires
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(engine.store().attempts_for(incident_id).unwrap().len(), 1);
        let incident = engine.store().lock(incident_id).await.unwrap();
        assert_eq!(incident.escalation_level, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_closes_and_is_idempotent() {
        let config = config_with_default(policy("paging", "pager", &[60]));
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let outcome = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        let incident_id = outcome.incident_id.unwrap();

        let resolved = engine.resolve(incident_id).await.unwrap();
        assert_eq!(resolved.status, IncidentStatus::Closed);
        assert!(resolved.resolved_at.is_some());
        let again = engine.resolve(incident_id).await.unwrap();
        assert_eq!(again.status, IncidentStatus::Closed);

        // Pending step cancelled, nothing delivered
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(engine.store().attempts_for(incident_id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_incident_is_not_found() {
        let (engine, _failures) = Engine::new(EngineConfig::default(), vec![]);
        assert!(matches!(
            engine.acknowledge(404).await,
            Err(EngineError::Store(incident_store::StoreError::NotFound(404)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_names_the_field() {
        let (engine, _failures) = Engine::new(EngineConfig::default(), vec![]);
        let err = engine
            .ingest(raw("", "db-timeout", Severity::Low))
            .await
            .unwrap_err();
        match err {
            EngineError::Validation(v) => assert_eq!(v.field(), "source_service"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_similar_alerts_merge_into_one_incident() {
        let config = config_with_default(policy("paging", "pager", &[600]));
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let first = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        let second = engine
            .ingest(raw("svcb", "db-timeout", Severity::High))
            .await
            .unwrap();
        assert_eq!(second.incident_id, first.incident_id);

        let incident = engine
            .store()
            .lock(first.incident_id.unwrap())
            .await
            .unwrap();
        assert_eq!(incident.occurrence_count, 2);
        assert_eq!(incident.signature_group.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_alert_on_exhaustion_does_not_recurse() {
        // No adapters: every delivery exhausts, including the meta-alert's own
        let config = config_with_default(policy("paging", "pager", &[0]));
        let (engine, mut failures) = Engine::new(config, vec![]);

        engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Original incident + exactly one meta incident
        assert_eq!(engine.store().incident_count(), 2);
        let critical = engine
            .store()
            .snapshot(None, Some(Severity::Critical), 10)
            .await
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].service, "alert-engine");

        // The meta incident's own exhaustion produced no further incidents
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.store().incident_count(), 2);
        // Operator failure queue saw both exhausted targets
        assert!(failures.recv().await.is_some());
        assert!(failures.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_reload_only_affects_new_incidents() {
        let config = config_with_default(policy("v1", "pager", &[600]));
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        let old = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        engine.reload_policies(Vec::new(), Some(policy("v2", "pager", &[600])));
        let new = engine
            .ingest(raw("svcZ", "queue-backlog", Severity::High))
            .await
            .unwrap();
        assert_ne!(new.incident_id, old.incident_id);

        let old_incident = engine.store().lock(old.incident_id.unwrap()).await.unwrap();
        assert_eq!(old_incident.policy_name, "v1");
        drop(old_incident);
        let new_incident = engine.store().lock(new.incident_id.unwrap()).await.unwrap();
        assert_eq!(new_incident.policy_name, "v2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opened_always_precedes_escalated() {
        // Zero-delay first step races the timer task against the ingesting
        // task; subscribers must still see the lifecycle in order
        for _ in 0..100 {
            let config = config_with_default(policy("paging", "pager", &[0]));
            let pager = ScriptedChannel::new("pager", 0);
            let (engine, _failures) =
                Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);
            let (_sid, mut events) = engine.broadcaster().subscribe(vec!["*".to_string()]);

            engine
                .ingest(raw("svcA", "db-timeout", Severity::High))
                .await
                .unwrap();

            assert_eq!(events.recv().await.unwrap().event_type, EventType::Opened);
            assert_eq!(events.recv().await.unwrap().event_type, EventType::Escalated);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_rebinds_only_before_first_fire() {
        let mut config = config_with_default(policy("general", "pager", &[120, 600]));
        config.policies = vec![EscalationPolicy {
            selector: escalation::PolicySelector {
                min_severity: Some(Severity::Critical),
                ..Default::default()
            },
            ..policy("critical-path", "pager", &[0, 60])
        }];
        let pager = ScriptedChannel::new("pager", 0);
        let (engine, _failures) = Engine::new(config, vec![pager as Arc<dyn ChannelAdapter>]);

        // Bound to the general policy; no step fires before t=120
        let first = engine
            .ingest(raw("svcA", "db-timeout", Severity::High))
            .await
            .unwrap();
        let incident_id = first.incident_id.unwrap();

        // Critical upgrade before any fire: policy rebinds
        engine
            .ingest(raw("svcA", "db-timeout", Severity::Critical))
            .await
            .unwrap();
        let incident = engine.store().lock(incident_id).await.unwrap();
        assert_eq!(incident.policy_name, "critical-path");
        assert_eq!(incident.severity, Severity::Critical);
        drop(incident);

        // Second incident where a step already fired keeps its policy
        let second = engine
            .ingest(raw("svcB", "cache-stampede", Severity::High))
            .await
            .unwrap();
        let second_id = second.incident_id.unwrap();
        {
            // Simulate a fired step
            let mut incident = engine.store().lock(second_id).await.unwrap();
            incident.last_escalated_at = Some(Utc::now());
            incident.escalation_level = 1;
        }
        engine
            .ingest(raw("svcB", "cache-stampede", Severity::Critical))
            .await
            .unwrap();
        let incident = engine.store().lock(second_id).await.unwrap();
        assert_eq!(incident.policy_name, "general");
        assert_eq!(incident.severity, Severity::Critical);
    }
}
