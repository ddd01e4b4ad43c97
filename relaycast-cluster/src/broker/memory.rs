use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaycast_core::{Error, Result};

use super::{Broker, BrokerMessage, Subscription};

/// In-process broker for single-node deployments
///
/// All channels share one broadcast bus; each subscription filters for the
/// channels it asked for. Delivery order per subscription is publish order.
/// A subscriber that falls more than `capacity` messages behind loses its
/// subscription, the same way Redis drops clients over their output buffer.
#[derive(Clone)]
pub struct MemoryBroker {
    bus: broadcast::Sender<BrokerMessage>,
    closed: CancellationToken,
    failing: Arc<AtomicBool>,
    publish_attempts: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            bus,
            closed: CancellationToken::new(),
            failing: Arc::new(AtomicBool::new(false)),
            publish_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every subsequent publish fail (or succeed again)
    pub fn set_publish_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of publish calls made, successful or not
    #[must_use]
    pub fn publish_attempts(&self) -> u64 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if self.closed.is_cancelled() {
            return Err(Error::Publication("Broker handle is closed".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Publication("Broker unavailable".to_string()));
        }

        // No receivers is not an error: the message is simply not delivered
        let receivers = self
            .bus
            .send(BrokerMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .unwrap_or(0);

        debug!(channel = %channel, receivers = receivers, "Published to memory bus");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        if self.closed.is_cancelled() {
            return Err(Error::SubscriptionClosed);
        }

        Ok(Box::new(MemorySubscription {
            receiver: Some(self.bus.subscribe()),
            channels: channels.iter().cloned().collect(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing in-process broker");
        self.closed.cancel();
        Ok(())
    }
}

struct MemorySubscription {
    receiver: Option<broadcast::Receiver<BrokerMessage>>,
    channels: HashSet<String>,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&mut self) -> Result<BrokerMessage> {
        let Self {
            receiver,
            channels,
            closed,
        } = self;
        let receiver = receiver.as_mut().ok_or(Error::SubscriptionClosed)?;

        loop {
            let next = tokio::select! {
                () = closed.cancelled() => return Err(Error::SubscriptionClosed),
                next = receiver.recv() => next,
            };

            match next {
                Ok(msg) if channels.contains(&msg.channel) => return Ok(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Memory subscription lagged behind the bus");
                    return Err(Error::Subscription(format!("Subscriber lagged by {n} messages")));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::SubscriptionClosed),
            }
        }
    }

    async fn close(&mut self) {
        self.receiver.take();
    }
}
