use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use relaycast_core::{metrics, Error, Result};

use crate::broker::{Broker, Subscription};

/// Upper bound for releasing a subscription or closing a connection once
/// its loop has ended
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Already-upgraded push connection owned by one fan-out loop
#[async_trait]
pub trait PushConnection: Send + 'static {
    /// Deliver one payload; an error means the connection is gone
    async fn send(&mut self, payload: &str) -> Result<()>;

    async fn close(&mut self);
}

/// Snapshot of one live listener
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub connection_id: String,
    pub connected_for: Duration,
    pub forwarded: u64,
}

struct ListenerEntry {
    connected_at: Instant,
    forwarded: Arc<AtomicU64>,
    abort: AbortHandle,
}

struct RegistryInner {
    broker: Arc<dyn Broker>,
    channel: String,
    listeners: DashMap<String, ListenerEntry>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Supervisor for per-connection fan-out loops
///
/// Every attached connection gets its own broker subscription and its own
/// task, so a slow listener only ever blocks itself. Tasks are tracked so
/// shutdown can cancel and join all of them.
#[derive(Clone)]
pub struct FanoutRegistry {
    inner: Arc<RegistryInner>,
}

impl FanoutRegistry {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, channel: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                broker,
                channel: channel.into(),
                listeners: DashMap::new(),
                tracker: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    /// Start forwarding the broadcast channel to `conn`
    ///
    /// The subscription is opened before this returns, so every message
    /// published afterwards reaches the connection. On failure the connection
    /// is closed and never registered.
    pub async fn attach<C: PushConnection>(&self, mut conn: C) -> Result<String> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() || inner.tracker.is_closed() {
            conn.close().await;
            return Err(Error::Shutdown("Relay is stopping, connection refused".to_string()));
        }

        let mut subscription = match inner.broker.subscribe(std::slice::from_ref(&inner.channel)).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, channel = %inner.channel, "Failed to subscribe listener");
                conn.close().await;
                return Err(e);
            }
        };

        // Shutdown may have started while subscribing
        if inner.shutdown.is_cancelled() || inner.tracker.is_closed() {
            release(subscription.as_mut(), &mut conn).await;
            return Err(Error::Shutdown("Relay is stopping, connection refused".to_string()));
        }

        let connection_id = nanoid::nanoid!(12);
        let forwarded = Arc::new(AtomicU64::new(0));

        // Hold the entry lock until the abort handle is stored so the task
        // cannot remove itself first
        let entry = inner.listeners.entry(connection_id.clone());
        let handle = inner.tracker.spawn(forward(
            Arc::clone(inner),
            connection_id.clone(),
            subscription,
            conn,
            Arc::clone(&forwarded),
        ));
        entry.insert(ListenerEntry {
            connected_at: Instant::now(),
            forwarded,
            abort: handle.abort_handle(),
        });
        metrics::relay::ACTIVE_LISTENERS.inc();

        info!(connection_id = %connection_id, channel = %inner.channel, "Listener attached");
        Ok(connection_id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.listeners.len()
    }

    #[must_use]
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.inner
            .listeners
            .iter()
            .map(|entry| ListenerInfo {
                connection_id: entry.key().clone(),
                connected_for: entry.connected_at.elapsed(),
                forwarded: entry.forwarded.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop accepting connections, signal every loop and wait for them
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        debug!(active = self.inner.tracker.len(), "Waiting for fan-out loops");
        self.inner.tracker.wait().await;
    }

    /// Abort loops still running, used once the shutdown deadline has passed
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        self.inner.listeners.retain(|connection_id, entry| {
            warn!(connection_id = %connection_id, "Aborting fan-out loop");
            entry.abort.abort();
            metrics::relay::ACTIVE_LISTENERS.dec();
            aborted += 1;
            false
        });
        aborted
    }
}

async fn forward<C: PushConnection>(
    inner: Arc<RegistryInner>,
    connection_id: String,
    mut subscription: Box<dyn Subscription>,
    mut conn: C,
    forwarded: Arc<AtomicU64>,
) {
    let reason = loop {
        let received = tokio::select! {
            () = inner.shutdown.cancelled() => break "shutdown",
            received = subscription.receive() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                if !e.is_closed() {
                    metrics::relay::SUBSCRIPTION_ERRORS_TOTAL
                        .with_label_values(&["fanout"])
                        .inc();
                }
                debug!(connection_id = %connection_id, error = %e, "Listener subscription ended");
                break "receive failed";
            }
        };

        let sent = tokio::select! {
            () = inner.shutdown.cancelled() => break "shutdown",
            sent = conn.send(&message.payload) => sent,
        };

        if let Err(e) = sent {
            debug!(connection_id = %connection_id, error = %e, "Listener send failed");
            break "send failed";
        }

        forwarded.fetch_add(1, Ordering::Relaxed);
        metrics::relay::FORWARDED_MESSAGES_TOTAL.inc();
    };

    release(subscription.as_mut(), &mut conn).await;

    if inner.listeners.remove(&connection_id).is_some() {
        metrics::relay::ACTIVE_LISTENERS.dec();
    }

    info!(
        connection_id = %connection_id,
        reason = reason,
        forwarded = forwarded.load(Ordering::Relaxed),
        "Listener detached"
    );
}

/// Release the subscription and close the connection, each bounded by
/// [`CLOSE_TIMEOUT`] so a stalled peer only delays its own loop
async fn release<C: PushConnection>(subscription: &mut dyn Subscription, conn: &mut C) {
    if timeout(CLOSE_TIMEOUT, subscription.close()).await.is_err() {
        warn!("Timed out releasing listener subscription");
    }
    if timeout(CLOSE_TIMEOUT, conn.close()).await.is_err() {
        warn!("Timed out closing listener connection");
    }
}

/// Push connection backed by an in-process channel
///
/// Payloads land on the paired receiver. Dropping the receiver makes the
/// next send fail, like a client that went away.
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl ChannelConnection {
    /// Connection plus its receiving end and a flag set once it is closed
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                closed: Arc::clone(&closed),
            },
            rx,
            closed,
        )
    }
}

#[async_trait]
impl PushConnection for ChannelConnection {
    async fn send(&mut self, payload: &str) -> Result<()> {
        self.tx
            .send(payload.to_string())
            .map_err(|_| Error::Transport("Listener went away".to_string()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
