//! Fan-out Implementation

use chrono::{DateTime, Utc};
use intake::Severity;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Incident lifecycle event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Opened,
    Escalated,
    Acknowledged,
    Resolved,
    Closed,
    Suppressed,
}

/// Frame pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: EventType,
    pub incident_id: u64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Opaque subscriber handle
pub type SubscriberId = u64;

struct Subscriber {
    topics: HashSet<String>,
    tx: mpsc::Sender<EngineEvent>,
}

impl Subscriber {
    fn wants(&self, topics: &[String]) -> bool {
        self.topics.contains("*") || topics.iter().any(|t| self.topics.contains(t))
    }
}

/// Topic-based broadcaster.
///
/// Per-subscriber ordering follows from the single mpsc channel; at-most-once
/// is enforced with `try_send` (a full or closed channel drops the event for
/// that subscriber only).
pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    /// Per-subscriber channel capacity
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer,
        }
    }

    /// Register interest in a set of topics ("severity.high", "service.db",
    /// or "*" for everything)
    pub fn subscribe(&self, topics: Vec<String>) -> (SubscriberId, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let topics: HashSet<String> = topics.into_iter().collect();
        info!("Subscriber {} registered for {:?}", id, topics);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, Subscriber { topics, tx });
        }
        (id, rx)
    }

    /// Drop a subscriber
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if subscribers.remove(&id).is_some() {
                debug!("Subscriber {} removed", id);
            }
        }
    }

    /// Publish an event under severity/service topics. Closed subscribers
    /// are pruned; a full buffer drops the event for that subscriber.
    pub fn publish(&self, event: EngineEvent, service: &str) {
        let topics = vec![
            format!("severity.{}", event.severity.as_str()),
            format!("service.{}", service),
        ];
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        let mut closed = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.wants(&topics) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber {} buffer full, dropping event", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            debug!("Pruning disconnected subscriber {}", id);
            subscribers.remove(&id);
        }
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
