//! Broadcast Fan-out
//!
//! Publishes incident state changes to live subscribers. Topics derive from
//! severity and service name; delivery is at-most-once per subscriber per
//! event, ordered per subscriber through its single bounded channel.
//! Disconnected subscribers get no replay.

mod fanout;

pub use fanout::{Broadcaster, EngineEvent, EventType, SubscriberId};
