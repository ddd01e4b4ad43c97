use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relaycast_core::{metrics, Error};

use crate::broker::{Broker, BrokerMessage, Subscription};

/// Counters shared between the inbound subscriber and its owner
#[derive(Debug, Default)]
pub struct InboundStats {
    received: AtomicU64,
    errors: AtomicU64,
}

impl InboundStats {
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Internal tap on submission and clock traffic
///
/// Holds one standing subscription and records every message it sees. A
/// receive error releases the subscription, waits out an exponential backoff
/// and subscribes again. Only shutdown or a closed broker end the loop.
pub struct InboundSubscriber {
    broker: Arc<dyn Broker>,
    channels: Vec<String>,
    initial_backoff: Duration,
    max_backoff: Duration,
    stats: Arc<InboundStats>,
}

impl InboundSubscriber {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        channels: Vec<String>,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            broker,
            channels,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            stats: Arc::new(InboundStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<InboundStats> {
        Arc::clone(&self.stats)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(channels = ?self.channels, "Inbound subscriber started");
        let mut backoff = self.initial_backoff;

        loop {
            let subscribed = tokio::select! {
                () = shutdown.cancelled() => break,
                subscribed = self.broker.subscribe(&self.channels) => subscribed,
            };

            let failure = match subscribed {
                Ok(mut subscription) => {
                    let exit = self
                        .receive_loop(subscription.as_mut(), &shutdown, &mut backoff)
                        .await;
                    subscription.close().await;
                    match exit {
                        LoopExit::Shutdown => break,
                        LoopExit::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            if failure.is_closed() {
                info!("Broker closed, inbound subscriber exiting");
                break;
            }

            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            metrics::relay::SUBSCRIPTION_ERRORS_TOTAL
                .with_label_values(&["inbound"])
                .inc();
            warn!(
                error = %failure,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "Inbound subscription failed, retrying after backoff"
            );

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }

        info!(received = self.stats.received(), "Inbound subscriber stopped");
    }

    async fn receive_loop(
        &self,
        subscription: &mut dyn Subscription,
        shutdown: &CancellationToken,
        backoff: &mut Duration,
    ) -> LoopExit {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => return LoopExit::Shutdown,
                received = subscription.receive() => received,
            };

            match received {
                Ok(message) => {
                    *backoff = self.initial_backoff;
                    self.observe(&message);
                }
                Err(e) => return LoopExit::Failed(e),
            }
        }
    }

    fn observe(&self, message: &BrokerMessage) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::relay::INBOUND_MESSAGES_TOTAL
            .with_label_values(&[message.channel.as_str()])
            .inc();
        info!(channel = %message.channel, payload = %message.payload, "Inbound notification");
    }
}

enum LoopExit {
    Shutdown,
    Failed(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relaycast_core::Result;
    use std::collections::VecDeque;

    fn inbound_channels() -> Vec<String> {
        vec!["input_notifications".to_string(), "notifications".to_string()]
    }

    #[tokio::test]
    async fn test_observes_both_channels() {
        let broker = MemoryBroker::new();
        let subscriber = InboundSubscriber::new(
            Arc::new(broker.clone()),
            inbound_channels(),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        let stats = subscriber.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscriber.run(shutdown.clone()));

        while broker.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        broker.publish("input_notifications", "hello").await.unwrap();
        broker.publish("notifications", "tick").await.unwrap();
        broker.publish("elsewhere", "ignored").await.unwrap();

        while stats.received() < 2 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(stats.received(), 2);
        assert_eq!(stats.errors(), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_exits_when_broker_closes() {
        let broker = MemoryBroker::new();
        let subscriber = InboundSubscriber::new(
            Arc::new(broker.clone()),
            inbound_channels(),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        let handle = tokio::spawn(subscriber.run(CancellationToken::new()));

        while broker.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        broker.close().await.unwrap();

        handle.await.unwrap();
    }

    /// Broker whose subscriptions replay a script of receive results
    struct ScriptedBroker {
        scripts: Mutex<VecDeque<Vec<Result<BrokerMessage>>>>,
        subscribes: AtomicU64,
    }

    struct ScriptedSubscription {
        script: VecDeque<Result<BrokerMessage>>,
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _channels: &[String]) -> Result<Box<dyn Subscription>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedSubscription {
                script: script.into(),
            }))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Subscription for ScriptedSubscription {
        async fn receive(&mut self) -> Result<BrokerMessage> {
            match self.script.pop_front() {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_receive_error() {
        let message = BrokerMessage {
            channel: "notifications".to_string(),
            payload: "tick".to_string(),
        };
        let broker = Arc::new(ScriptedBroker {
            scripts: Mutex::new(VecDeque::from([
                vec![Err(Error::Subscription("connection reset".to_string()))],
                vec![Err(Error::Subscription("connection reset".to_string()))],
                vec![Ok(message)],
            ])),
            subscribes: AtomicU64::new(0),
        });

        let subscriber = InboundSubscriber::new(
            broker.clone(),
            inbound_channels(),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        let stats = subscriber.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscriber.run(shutdown.clone()));

        // Backoff of 1s then 2s before the third subscription
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(broker.subscribes.load(Ordering::SeqCst), 3);
        assert_eq!(stats.errors(), 2);
        assert_eq!(stats.received(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
