//! Channel Adapter Contract

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Adapter send failure. `retryable` separates transient classes (timeouts,
/// 5xx-equivalents) from permanent ones (invalid address or format).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SendError {
    pub retryable: bool,
    pub message: String,
}

impl SendError {
    /// Transient failure, eligible for backoff retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// Permanent failure, skips retries and falls through to the next channel
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// One outbound notification channel. Concrete channels (push, paging,
/// webhooks) are external collaborators implementing this single method.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name used in target resolution and attempt records
    fn name(&self) -> &str;

    /// Send a payload to an address on this channel
    async fn send(&self, address: &str, payload: &serde_json::Value) -> Result<(), SendError>;
}

/// Tracing-backed channel for local development wiring
pub struct LogChannel;

#[async_trait]
impl ChannelAdapter for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, address: &str, payload: &serde_json::Value) -> Result<(), SendError> {
        info!("Notification to {}: {}", address, payload);
        Ok(())
    }
}
