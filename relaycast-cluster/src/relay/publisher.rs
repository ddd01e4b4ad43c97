use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaycast_core::{metrics, Error, Origin, Result};

use crate::broker::Broker;

/// One publish handed off by a caller that does not wait for the outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub channel: String,
    pub payload: String,
    pub origin: Origin,
}

/// Sending half of the bounded publish queue
///
/// Cloned into every submission path. Enqueueing never waits: a full or
/// closed queue drops the request and reports a [`Error::Publication`].
#[derive(Clone, Debug)]
pub struct PublishQueue {
    tx: mpsc::Sender<PublishRequest>,
}

impl PublishQueue {
    pub fn enqueue(&self, request: PublishRequest) -> Result<()> {
        let origin = request.origin;
        self.tx.try_send(request).map_err(|e| {
            metrics::relay::PUBLISHES_TOTAL
                .with_label_values(&[origin.as_str(), "dropped"])
                .inc();
            match e {
                mpsc::error::TrySendError::Full(req) => Error::Publication(format!(
                    "Publish queue full, dropping message for {}",
                    req.channel
                )),
                mpsc::error::TrySendError::Closed(req) => Error::Publication(format!(
                    "Publish queue closed, dropping message for {}",
                    req.channel
                )),
            }
        })
    }
}

/// Single consumer of the publish queue
///
/// One worker keeps broker publish order equal to enqueue order. Once the
/// drain token fires the queue stops accepting new requests and the worker
/// exits after publishing whatever was already queued.
pub struct PublishWorker {
    broker: Arc<dyn Broker>,
    rx: mpsc::Receiver<PublishRequest>,
    drain: CancellationToken,
}

impl PublishWorker {
    /// Create the queue and spawn its worker
    pub fn spawn(
        broker: Arc<dyn Broker>,
        capacity: usize,
        drain: CancellationToken,
    ) -> (PublishQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self { broker, rx, drain };
        let handle = tokio::spawn(worker.run());
        (PublishQueue { tx }, handle)
    }

    async fn run(mut self) {
        let mut draining = false;
        let mut published: u64 = 0;

        loop {
            let request = tokio::select! {
                biased;
                () = self.drain.cancelled(), if !draining => {
                    draining = true;
                    self.rx.close();
                    debug!(queued = self.rx.len(), "Publish worker draining");
                    continue;
                }
                request = self.rx.recv() => request,
            };

            let Some(request) = request else {
                break;
            };

            publish_one(self.broker.as_ref(), &request).await;
            published += 1;
        }

        info!(published = published, "Publish worker stopped");
    }
}

async fn publish_one(broker: &dyn Broker, request: &PublishRequest) {
    let origin = request.origin.as_str();
    match broker.publish(&request.channel, &request.payload).await {
        Ok(()) => {
            metrics::relay::PUBLISHES_TOTAL
                .with_label_values(&[origin, "ok"])
                .inc();
            debug!(channel = %request.channel, origin = origin, "Notification published");
        }
        Err(e) => {
            metrics::relay::PUBLISHES_TOTAL
                .with_label_values(&[origin, "failed"])
                .inc();
            warn!(
                error = %e,
                channel = %request.channel,
                origin = origin,
                "Failed to publish notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn request(payload: &str) -> PublishRequest {
        PublishRequest {
            channel: "input_notifications".to_string(),
            payload: payload.to_string(),
            origin: Origin::Submission,
        }
    }

    #[tokio::test]
    async fn test_worker_publishes_in_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker
            .subscribe(&["input_notifications".to_string()])
            .await
            .unwrap();
        let drain = CancellationToken::new();
        let (queue, handle) = PublishWorker::spawn(Arc::new(broker.clone()), 8, drain.clone());

        for payload in ["one", "two", "three"] {
            queue.enqueue(request(payload)).unwrap();
        }

        for expected in ["one", "two", "three"] {
            assert_eq!(sub.receive().await.unwrap().payload, expected);
        }

        drain.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_flushes_queued_requests() {
        let broker = MemoryBroker::new();
        let drain = CancellationToken::new();
        let (queue, handle) = PublishWorker::spawn(Arc::new(broker.clone()), 8, drain.clone());

        queue.enqueue(request("a")).unwrap();
        queue.enqueue(request("b")).unwrap();
        drain.cancel();
        handle.await.unwrap();

        assert_eq!(broker.publish_attempts(), 2);
        assert!(matches!(
            queue.enqueue(request("late")),
            Err(Error::Publication(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops_request() {
        let (tx, _rx) = mpsc::channel(1);
        let queue = PublishQueue { tx };

        queue.enqueue(request("first")).unwrap();
        assert!(matches!(
            queue.enqueue(request("second")),
            Err(Error::Publication(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_worker_alive() {
        let broker = MemoryBroker::new();
        broker.set_publish_failing(true);
        let drain = CancellationToken::new();
        let (queue, handle) = PublishWorker::spawn(Arc::new(broker.clone()), 8, drain.clone());

        queue.enqueue(request("lost")).unwrap();
        tokio::task::yield_now().await;
        broker.set_publish_failing(false);
        queue.enqueue(request("kept")).unwrap();

        drain.cancel();
        handle.await.unwrap();
        assert_eq!(broker.publish_attempts(), 2);
    }
}
