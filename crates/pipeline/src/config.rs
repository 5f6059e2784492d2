//! Engine Configuration

use classifier::ClassifierConfig;
use correlator::CorrelatorConfig;
use delivery::RouterConfig;
use escalation::EscalationPolicy;
use serde::{Deserialize, Serialize};
use suppressor::{SuppressionRule, SuppressorConfig};
use tracing::info;

/// Top-level engine configuration, layered from an optional TOML file plus
/// `ENGINE_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub suppressor: SuppressorConfig,
    #[serde(default)]
    pub router: RouterConfig,
    /// Escalation policies in selector precedence order
    #[serde(default)]
    pub policies: Vec<EscalationPolicy>,
    /// Mandatory fallback policy; a built-in log policy is used when absent
    #[serde(default)]
    pub default_policy: Option<EscalationPolicy>,
    #[serde(default)]
    pub suppression_rules: Vec<SuppressionRule>,
    /// Broadcast buffer per subscriber
    #[serde(default = "default_broadcast_buffer")]
    pub broadcast_buffer: usize,
}

fn default_broadcast_buffer() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            correlator: CorrelatorConfig::default(),
            suppressor: SuppressorConfig::default(),
            router: RouterConfig::default(),
            policies: Vec::new(),
            default_policy: None,
            suppression_rules: Vec::new(),
            broadcast_buffer: default_broadcast_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path` (optional) layered with environment
    /// variables prefixed `ENGINE_` (separator `__`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let loaded = builder
            .add_source(config::Environment::with_prefix("ENGINE").separator("__"))
            .build()?
            .try_deserialize::<EngineConfig>()?;
        info!(
            "Loaded engine config: {} policies, {} suppression rules",
            loaded.policies.len(),
            loaded.suppression_rules.len()
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = EngineConfig::default();
        assert_eq!(config.correlator.window_seconds, 300);
        assert!((config.correlator.similarity_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.suppressor.fatigue_threshold, 10);
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.router.backoff_base_ms, 500);
        assert_eq!(config.router.concurrency, 10);
    }

    #[test]
    fn test_round_trips_through_serde() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correlator.window_seconds, config.correlator.window_seconds);
    }
}
