use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client as RedisClient};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaycast_core::{Error, Result};

use super::{Broker, BrokerMessage, Subscription};

/// Timeout for individual Redis commands in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Redis Pub/Sub broker
///
/// Publishing goes through one multiplexed [`ConnectionManager`] shared by all
/// callers. Every subscription opens its own Pub/Sub connection, so a slow
/// consumer never holds up delivery to another.
pub struct RedisBroker {
    redis_client: RedisClient,
    publisher: ConnectionManager,
    connect_timeout: Duration,
    closed: CancellationToken,
}

impl RedisBroker {
    /// Connect to Redis and prepare the shared publish connection
    pub async fn connect(redis_url: &str, connect_timeout: Duration) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let publisher = timeout(connect_timeout, redis_client.get_connection_manager())
            .await
            .map_err(|_| Error::Publication("Timed out connecting to Redis".to_string()))?
            .map_err(|e| Error::Publication(format!("Failed to connect to Redis: {e}")))?;

        info!("Redis broker connected");

        Ok(Self {
            redis_client,
            publisher,
            connect_timeout,
            closed: CancellationToken::new(),
        })
    }

    async fn open_pubsub(&self, channels: &[String]) -> Result<PubSub> {
        let mut pubsub = timeout(self.connect_timeout, self.redis_client.get_async_pubsub())
            .await
            .map_err(|_| Error::Subscription("Timed out getting Redis Pub/Sub connection".to_string()))?
            .map_err(|e| Error::Subscription(format!("Failed to get Redis Pub/Sub connection: {e}")))?;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(channels.to_vec()),
        )
        .await
        .map_err(|_| Error::Subscription(format!("Timed out subscribing to {channels:?}")))?
        .map_err(|e| Error::Subscription(format!("Failed to subscribe to {channels:?}: {e}")))?;

        Ok(pubsub)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Publication("Broker handle is closed".to_string()));
        }

        let mut conn = self.publisher.clone();
        let receivers: i64 = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(channel, payload),
        )
        .await
        .map_err(|_| Error::Publication("Timed out publishing to Redis".to_string()))?
        .map_err(|e| Error::Publication(format!("Failed to publish to Redis: {e}")))?;

        debug!(channel = %channel, receivers = receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>> {
        if self.closed.is_cancelled() {
            return Err(Error::SubscriptionClosed);
        }

        let pubsub = tokio::select! {
            () = self.closed.cancelled() => return Err(Error::SubscriptionClosed),
            pubsub = self.open_pubsub(channels) => pubsub?,
        };

        debug!(channels = ?channels, "Redis subscription opened");

        Ok(Box::new(RedisSubscription {
            pubsub: Some(pubsub),
            channels: channels.to_vec(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing Redis broker");
        self.closed.cancel();
        Ok(())
    }
}

struct RedisSubscription {
    pubsub: Option<PubSub>,
    channels: Vec<String>,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn receive(&mut self) -> Result<BrokerMessage> {
        let Self { pubsub, closed, .. } = self;
        let pubsub = pubsub.as_mut().ok_or(Error::SubscriptionClosed)?;
        let mut stream = pubsub.on_message();

        let msg = tokio::select! {
            () = closed.cancelled() => return Err(Error::SubscriptionClosed),
            msg = stream.next() => msg,
        };

        // Stream returned None: the Redis connection was lost
        let msg = msg.ok_or_else(|| Error::Subscription("Redis Pub/Sub stream ended".to_string()))?;

        let channel = msg.get_channel_name().to_string();
        let payload: String = msg
            .get_payload()
            .map_err(|e| Error::Subscription(format!("Invalid payload on {channel}: {e}")))?;

        Ok(BrokerMessage { channel, payload })
    }

    async fn close(&mut self) {
        let Some(mut pubsub) = self.pubsub.take() else {
            return;
        };

        if self.closed.is_cancelled() {
            return;
        }

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.unsubscribe(self.channels.clone()),
        )
        .await
        {
            Ok(Ok(())) => debug!(channels = ?self.channels, "Redis subscription released"),
            Ok(Err(e)) => warn!(error = %e, "Failed to unsubscribe, dropping connection"),
            Err(_) => warn!("Timed out unsubscribing, dropping connection"),
        }
    }
}
