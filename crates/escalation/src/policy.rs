//! Escalation Policy Model

use crate::PolicyError;
use delivery::Target;
use intake::{AlertContext, Severity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// One timed notification step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Offset from incident open (or reschedule) at which this step fires
    pub delay_seconds: u64,
    pub targets: Vec<Target>,
}

/// Predicate over incident attributes, evaluated once at incident creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySelector {
    /// Minimum severity for this policy to apply
    #[serde(default)]
    pub min_severity: Option<Severity>,
    /// Restrict to these source services (empty = any)
    #[serde(default)]
    pub services: Vec<String>,
    /// Require a specific off-hours flag
    #[serde(default)]
    pub off_hours: Option<bool>,
}

impl PolicySelector {
    pub fn matches(&self, severity: Severity, service: &str, context: &AlertContext) -> bool {
        if let Some(min) = self.min_severity {
            if severity < min {
                return false;
            }
        }
        if !self.services.is_empty() && !self.services.iter().any(|s| s == service) {
            return false;
        }
        if let Some(off_hours) = self.off_hours {
            if context.is_off_hours != off_hours {
                return false;
            }
        }
        true
    }
}

/// Ordered, timed sequence of notification steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub name: String,
    #[serde(default)]
    pub selector: PolicySelector,
    pub steps: Vec<EscalationStep>,
}

/// Immutable policy snapshot. Reloads swap the whole set; incidents keep the
/// `Arc` to the policy they were bound to at creation.
pub struct PolicySet {
    policies: Vec<Arc<EscalationPolicy>>,
    default_policy: Arc<EscalationPolicy>,
}

impl PolicySet {
    /// Build a snapshot from ordered policies plus the mandatory default
    pub fn new(policies: Vec<EscalationPolicy>, default_policy: EscalationPolicy) -> Self {
        info!(
            "Loaded policy set: {} policies + default '{}'",
            policies.len(),
            default_policy.name
        );
        Self {
            policies: policies.into_iter().map(Arc::new).collect(),
            default_policy: Arc::new(default_policy),
        }
    }

    /// First policy whose selector matches, in declaration order
    pub fn resolve_strict(
        &self,
        severity: Severity,
        service: &str,
        context: &AlertContext,
    ) -> Result<Arc<EscalationPolicy>, PolicyError> {
        self.policies
            .iter()
            .find(|p| p.selector.matches(severity, service, context))
            .cloned()
            .ok_or(PolicyError::NoMatch {
                severity: severity.as_str(),
            })
    }

    /// Resolve with fallback to the mandatory default; escalation is never
    /// silently dropped
    pub fn resolve(
        &self,
        severity: Severity,
        service: &str,
        context: &AlertContext,
    ) -> Arc<EscalationPolicy> {
        match self.resolve_strict(severity, service, context) {
            Ok(policy) => policy,
            Err(e) => {
                warn!("{}, using default policy '{}'", e, self.default_policy.name);
                Arc::clone(&self.default_policy)
            }
        }
    }

    pub fn default_policy(&self) -> Arc<EscalationPolicy> {
        Arc::clone(&self.default_policy)
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new(
            Vec::new(),
            EscalationPolicy {
                name: "default".to_string(),
                selector: PolicySelector::default(),
                steps: vec![EscalationStep {
                    delay_seconds: 0,
                    targets: vec![Target {
                        channel: "log".to_string(),
                        address: "operators".to_string(),
                    }],
                }],
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, min_severity: Option<Severity>) -> EscalationPolicy {
        EscalationPolicy {
            name: name.to_string(),
            selector: PolicySelector {
                min_severity,
                ..Default::default()
            },
            steps: Vec::new(),
        }
    }

    #[test]
    fn test_first_matching_selector_wins() {
        let set = PolicySet::new(
            vec![
                policy("critical-path", Some(Severity::Critical)),
                policy("general", Some(Severity::Low)),
            ],
            policy("default", None),
        );
        let ctx = AlertContext::default();
        assert_eq!(
            set.resolve(Severity::Critical, "svcA", &ctx).name,
            "critical-path"
        );
        assert_eq!(set.resolve(Severity::Medium, "svcA", &ctx).name, "general");
    }

    #[test]
    fn test_selector_miss_falls_back_to_default() {
        let set = PolicySet::new(
            vec![policy("critical-path", Some(Severity::Critical))],
            policy("default", None),
        );
        let ctx = AlertContext::default();
        assert!(set
            .resolve_strict(Severity::Low, "svcA", &ctx)
            .is_err());
        assert_eq!(set.resolve(Severity::Low, "svcA", &ctx).name, "default");
    }

    #[test]
    fn test_service_and_off_hours_selectors() {
        let selector = PolicySelector {
            min_severity: Some(Severity::High),
            services: vec!["payments".to_string()],
            off_hours: Some(true),
        };
        let off_hours = AlertContext {
            is_off_hours: true,
            ..Default::default()
        };
        assert!(selector.matches(Severity::High, "payments", &off_hours));
        assert!(!selector.matches(Severity::High, "web", &off_hours));
        assert!(!selector.matches(Severity::High, "payments", &AlertContext::default()));
        assert!(!selector.matches(Severity::Medium, "payments", &off_hours));
    }
}
