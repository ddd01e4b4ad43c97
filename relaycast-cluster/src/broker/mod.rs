//! Publish/subscribe transport
//!
//! The relay only needs three operations from its broker: publish a payload
//! on a channel, open a subscription over a set of channels, and close the
//! handle. Closing must end every subscription still blocked in
//! [`Subscription::receive`] with [`Error::SubscriptionClosed`].
//!
//! [`Error::SubscriptionClosed`]: relaycast_core::Error::SubscriptionClosed

pub mod memory;
pub mod redis_pubsub;

use async_trait::async_trait;
use relaycast_core::Result;

pub use self::memory::MemoryBroker;
pub use self::redis_pubsub::RedisBroker;

/// One message delivered to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Shared broker handle.
///
/// Safe for concurrent use by every relay loop without external locking.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a receive stream bound to `channels`
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>>;

    /// Close the handle, ending open subscriptions
    async fn close(&self) -> Result<()>;
}

/// Receive stream owned by exactly one loop.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message, in broker delivery order
    async fn receive(&mut self) -> Result<BrokerMessage>;

    /// Release the subscription. Idempotent.
    async fn close(&mut self);
}
