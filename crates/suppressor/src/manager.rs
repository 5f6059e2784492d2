//! Suppression Manager Implementation

use chrono::{DateTime, Duration, Utc};
use intake::Alert;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Time-bounded suppression predicate plus a reason string.
///
/// Empty `service` or `error_type` act as wildcards; the time range is
/// inclusive on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionRule {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub error_type: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: String,
}

impl SuppressionRule {
    /// Whether this rule matches the alert at `now`
    pub fn matches(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        if now < self.starts_at || now > self.ends_at {
            return false;
        }
        if !self.service.is_empty() && self.service != alert.source_service {
            return false;
        }
        if !self.error_type.is_empty() && !alert.signature.starts_with(&self.error_type) {
            return false;
        }
        true
    }
}

/// Why an alert was suppressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    /// An explicit rule matched
    Rule(String),
    /// Fatigue threshold crossed for the signature
    Fatigue { seen: usize },
}

impl SuppressReason {
    pub fn as_string(&self) -> String {
        match self {
            SuppressReason::Rule(reason) => reason.clone(),
            SuppressReason::Fatigue { seen } => {
                format!("fatigue: {seen} occurrences within window")
            }
        }
    }
}

/// Suppressor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressorConfig {
    /// Occurrences of one signature within the window before auto-suppression
    pub fatigue_threshold: usize,
    /// Observation window in seconds (matches the correlation window)
    pub window_seconds: i64,
}

impl Default for SuppressorConfig {
    fn default() -> Self {
        Self {
            fatigue_threshold: 10,
            window_seconds: 300,
        }
    }
}

/// Every this many recorded observations, sweep signatures whose whole
/// window has drained so the map does not grow with dead signatures
const SWEEP_INTERVAL: usize = 256;

/// Rule and fatigue evaluation for incoming alerts.
///
/// Observation counters are read-modify-write under one mutex; callers record
/// every non-exempt alert, suppressed or delivered.
pub struct Suppressor {
    config: SuppressorConfig,
    rules: Mutex<Vec<SuppressionRule>>,
    /// Observation timestamps per signature, pruned by window
    observations: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    records: AtomicUsize,
}

impl Suppressor {
    /// Create a suppressor with no explicit rules
    pub fn new(config: SuppressorConfig) -> Self {
        info!("Creating suppressor with config: {:?}", config);
        Self {
            config,
            rules: Mutex::new(Vec::new()),
            observations: Mutex::new(HashMap::new()),
            records: AtomicUsize::new(0),
        }
    }

    /// Replace the active rule set
    pub fn set_rules(&self, rules: Vec<SuppressionRule>) {
        info!("Loaded {} suppression rules", rules.len());
        if let Ok(mut active) = self.rules.lock() {
            *active = rules;
        }
    }

    /// Evaluate all active rules plus the fatigue check.
    ///
    /// Any matching rule suppresses. Independently, more than the configured
    /// number of same-signature observations within the window auto-suppresses
    /// regardless of explicit rules.
    pub fn should_suppress(&self, alert: &Alert, now: DateTime<Utc>) -> Option<SuppressReason> {
        if let Ok(rules) = self.rules.lock() {
            if let Some(rule) = rules.iter().find(|r| r.matches(alert, now)) {
                debug!(
                    "Alert {} suppressed by rule: {}",
                    alert.signature, rule.reason
                );
                return Some(SuppressReason::Rule(rule.reason.clone()));
            }
        }

        let seen = self.observed_in_window(&alert.signature, now);
        if seen > self.config.fatigue_threshold {
            warn!(
                "Alert {} fatigue-suppressed ({} in window)",
                alert.signature, seen
            );
            return Some(SuppressReason::Fatigue { seen });
        }

        None
    }

    /// Record that an alert with this signature was processed (suppressed or
    /// delivered). Feeds the fatigue counter.
    pub fn record_observation(&self, signature: &str, now: DateTime<Utc>) {
        let Ok(mut observations) = self.observations.lock() else {
            return;
        };
        let cutoff = now - Duration::seconds(self.config.window_seconds);
        let window = observations.entry(signature.to_string()).or_default();
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        window.push_back(now);

        // Amortized sweep of signatures that went quiet, otherwise keys
        // accumulate for every signature ever seen
        if self.records.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            observations.retain(|_, window| {
                while window.front().is_some_and(|t| *t < cutoff) {
                    window.pop_front();
                }
                !window.is_empty()
            });
        }
    }

    /// Number of signatures currently holding observations
    pub fn tracked_signatures(&self) -> usize {
        self.observations.lock().map(|o| o.len()).unwrap_or(0)
    }

    /// Count of observations for a signature inside the current window
    fn observed_in_window(&self, signature: &str, now: DateTime<Utc>) -> usize {
        let Ok(observations) = self.observations.lock() else {
            return 0;
        };
        let cutoff = now - Duration::seconds(self.config.window_seconds);
        observations
            .get(signature)
            .map(|w| w.iter().filter(|t| **t >= cutoff).count())
            .unwrap_or(0)
    }

    /// Clear all fatigue counters (for testing)
    pub fn clear(&self) {
        if let Ok(mut observations) = self.observations.lock() {
            observations.clear();
        }
    }
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::new(SuppressorConfig::default())
    }
}
