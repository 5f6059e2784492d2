//! Classification Rule Engine

use intake::{Alert, AlertContext, Severity};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Predicate over an alert and its context
type Predicate = Box<dyn Fn(&Alert, &AlertContext) -> bool + Send + Sync>;

/// One ordered classification rule
pub struct Rule {
    /// Rule name, surfaced in logs
    pub name: &'static str,
    /// Matching predicate
    pub matches: Predicate,
    /// Severity assigned when the predicate matches
    pub severity: Severity,
}

impl Rule {
    pub fn new(
        name: &'static str,
        severity: Severity,
        matches: impl Fn(&Alert, &AlertContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            matches: Box::new(matches),
            severity,
        }
    }
}

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Affected-scope size treated as a large blast radius
    pub large_scope_threshold: u64,
    /// Services whose failures are always business-critical
    pub critical_services: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            large_scope_threshold: 1000,
            critical_services: Vec::new(),
        }
    }
}

/// Ordered first-match-wins severity classifier.
///
/// Rule order is significant: contextual rules precede generic ones. The
/// result is combined with the alert's declared severity via `max`, so
/// classification can only upgrade.
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    /// Build a classifier from an explicit ordered rule list
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Build the default rule set. Order matters and is preserved:
    /// peak+large scope, critical service, large scope, off-hours, peak.
    pub fn new(config: ClassifierConfig) -> Self {
        let large = config.large_scope_threshold;
        let critical_services = config.critical_services;
        let rules = vec![
            Rule::new("peak-large-scope", Severity::Critical, move |_, ctx| {
                ctx.is_peak_period && ctx.scope_size >= large
            }),
            Rule::new("critical-service-high", Severity::Critical, {
                let services = critical_services;
                move |alert, _| {
                    alert.severity >= Severity::High
                        && services.iter().any(|s| s == &alert.source_service)
                }
            }),
            Rule::new("large-scope", Severity::High, move |_, ctx| {
                ctx.scope_size >= large
            }),
            Rule::new("off-hours-medium", Severity::High, |alert, ctx| {
                ctx.is_off_hours && alert.severity >= Severity::Medium
            }),
            Rule::new("peak-period", Severity::Medium, |_, ctx| ctx.is_peak_period),
        ];
        Self { rules }
    }

    /// Classify an alert. Pure function over (alert, context); the terminal
    /// default is `Low`, lifted by the declared floor.
    pub fn classify(&self, alert: &Alert, context: &AlertContext) -> Severity {
        let matched = self
            .rules
            .iter()
            .find(|rule| (rule.matches)(alert, context));

        let assigned = match matched {
            Some(rule) => {
                debug!("Alert {} matched rule {}", alert.signature, rule.name);
                rule.severity
            }
            None => Severity::Low,
        };

        // Never downgrade below the reporter's declared severity
        assigned.max(alert.severity)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}
