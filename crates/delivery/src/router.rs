//! Delivery Routing Implementation

use crate::{ChannelAdapter, SendError};
use chrono::Utc;
use incident_store::{DeliveryAttempt, DeliveryStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One notification target: an explicit channel plus an address on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub channel: String,
    pub address: String,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Attempts per channel before falling through
    pub max_retries: u32,
    /// Exponential backoff base in milliseconds
    pub backoff_base_ms: u64,
    /// Concurrent targets per delivery batch
    pub concurrency: usize,
    /// Channels tried after a target's explicit channel, in order
    pub fallback_channels: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            concurrency: 10,
            fallback_channels: Vec::new(),
        }
    }
}

/// Routes notification payloads through registered channel adapters.
///
/// Per target: channels are tried strictly in order (explicit channel, then
/// configured fallbacks); transient failures back off exponentially up to
/// `max_retries`; permanent failures skip straight to the next channel; the
/// first success stops the target. A target whose channels are all exhausted
/// is reported on the operator failure queue, not retried further.
pub struct DeliveryRouter {
    config: RouterConfig,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    pool: Arc<Semaphore>,
    failure_tx: mpsc::Sender<DeliveryAttempt>,
}

impl DeliveryRouter {
    /// Create a router; exhausted attempts are pushed to `failure_tx`
    pub fn new(config: RouterConfig, failure_tx: mpsc::Sender<DeliveryAttempt>) -> Self {
        info!("Creating delivery router with config: {:?}", config);
        let pool = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            adapters: HashMap::new(),
            pool,
            failure_tx,
        }
    }

    /// Register a channel adapter under its name
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        debug!("Registered channel adapter: {}", adapter.name());
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Deliver one payload to all targets of an escalation step, fanning out
    /// concurrently. Returns every attempt row produced, grouped per target.
    pub async fn deliver(
        self: &Arc<Self>,
        incident_id: u64,
        step: u32,
        targets: &[Target],
        payload: serde_json::Value,
    ) -> Vec<DeliveryAttempt> {
        let mut join_set = JoinSet::new();
        for target in targets.iter().cloned() {
            let router = Arc::clone(self);
            let payload = payload.clone();
            join_set.spawn(async move {
                // Permit scopes the bounded worker pool
                let _permit = router.pool.acquire().await;
                router.deliver_target(incident_id, step, &target, &payload).await
            });
        }

        let mut rows = Vec::new();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(target_rows) => rows.extend(target_rows),
                Err(e) => warn!("Delivery task failed: {}", e),
            }
        }
        rows
    }

    /// Ordered channel preference for a target: explicit channel first, then
    /// configured fallbacks, duplicates removed
    fn channel_order(&self, target: &Target) -> Vec<String> {
        let mut order = vec![target.channel.clone()];
        for fallback in &self.config.fallback_channels {
            if !order.contains(fallback) {
                order.push(fallback.clone());
            }
        }
        order
    }

    async fn deliver_target(
        &self,
        incident_id: u64,
        step: u32,
        target: &Target,
        payload: &serde_json::Value,
    ) -> Vec<DeliveryAttempt> {
        let channels = self.channel_order(target);
        let last = channels.len() - 1;
        let mut rows = Vec::new();

        for (pos, channel) in channels.iter().enumerate() {
            let (outcome, attempts, last_error) =
                self.try_channel(channel, &target.address, payload).await;

            if outcome {
                rows.push(DeliveryAttempt {
                    incident_id,
                    step,
                    channel: channel.clone(),
                    address: target.address.clone(),
                    status: DeliveryStatus::Sent,
                    attempt_count: attempts,
                    last_error: None,
                    recorded_at: Utc::now(),
                });
                return rows;
            }

            // Final channel failing means the target is exhausted
            let status = if pos == last {
                DeliveryStatus::Exhausted
            } else {
                DeliveryStatus::Failed
            };
            let row = DeliveryAttempt {
                incident_id,
                step,
                channel: channel.clone(),
                address: target.address.clone(),
                status,
                attempt_count: attempts,
                last_error,
                recorded_at: Utc::now(),
            };
            if status == DeliveryStatus::Exhausted {
                warn!(
                    "All channels exhausted for {}@{} (incident {}, step {})",
                    target.address, target.channel, incident_id, step
                );
                if self.failure_tx.try_send(row.clone()).is_err() {
                    warn!("Operator failure queue full, dropping exhausted attempt");
                }
            }
            rows.push(row);
        }
        rows
    }

    /// Try one channel with bounded exponential backoff. Returns
    /// (success, attempts made, last error).
    async fn try_channel(
        &self,
        channel: &str,
        address: &str,
        payload: &serde_json::Value,
    ) -> (bool, u32, Option<String>) {
        let Some(adapter) = self.adapters.get(channel) else {
            return (false, 0, Some(format!("no adapter for channel {channel}")));
        };

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            match adapter.send(address, payload).await {
                Ok(()) => {
                    debug!("Sent via {} to {} (attempt {})", channel, address, attempt);
                    return (true, attempt, None);
                }
                Err(SendError { retryable: false, message }) => {
                    debug!("Permanent failure on {}: {}", channel, message);
                    return (false, attempt, Some(message));
                }
                Err(SendError { retryable: true, message }) => {
                    warn!(
                        "Transient failure on {} (attempt {}): {}",
                        channel, attempt, message
                    );
                    last_error = Some(message);
                    if attempt < self.config.max_retries {
                        let backoff = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        (false, self.config.max_retries, last_error)
    }
}
