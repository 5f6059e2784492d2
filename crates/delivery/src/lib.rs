//! Delivery Router
//!
//! Resolves the destination channels for a notification step and invokes
//! channel adapters with ordered fallback and bounded retry. Targets fan out
//! concurrently under a bounded worker pool; one target's failure never
//! blocks others. Fully exhausted targets surface on an operator-facing
//! failure queue.

mod adapter;
mod router;

pub use adapter::{ChannelAdapter, LogChannel, SendError};
pub use router::{DeliveryRouter, RouterConfig, Target};
