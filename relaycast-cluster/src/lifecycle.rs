//! Lifecycle coordinator
//!
//! Owns startup of the relay loops and the ordered, deadline-bound shutdown:
//! stop the ingress, stop and join every loop, close the broker, close the
//! store. State moves `Starting -> Running -> Stopping -> Stopped` and never
//! goes back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaycast_core::config::RelayConfig;
use relaycast_core::{ChannelMap, Error, NotificationStore, Origin, Result};

use crate::broker::Broker;
use crate::relay::{
    ClockGenerator, FanoutRegistry, InboundStats, InboundSubscriber, PublishWorker,
    SubmissionIngestor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for the relay loops
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub clock_interval: Duration,
    pub shutdown_timeout: Duration,
    pub publish_queue_capacity: usize,
    pub subscriber_initial_backoff: Duration,
    pub subscriber_max_backoff: Duration,
    pub max_submission_bytes: usize,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            clock_interval: config.clock_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            publish_queue_capacity: config.publish_queue_capacity,
            subscriber_initial_backoff: config.subscriber_initial_backoff(),
            subscriber_max_backoff: config.subscriber_max_backoff(),
            max_submission_bytes: config.max_submission_bytes,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// What the ingress needs from a started relay
#[derive(Clone)]
pub struct RelayHandles {
    pub ingestor: SubmissionIngestor,
    pub fanout: FanoutRegistry,
    /// Fires when the ingress must stop accepting work
    pub ingress_shutdown: CancellationToken,
    pub state: watch::Receiver<LifecycleState>,
    pub inbound: Arc<InboundStats>,
}

pub struct Coordinator {
    broker: Arc<dyn Broker>,
    store: Arc<dyn NotificationStore>,
    channels: ChannelMap,
    settings: RelaySettings,
    state: watch::Sender<LifecycleState>,
    relay_token: CancellationToken,
    ingress_token: CancellationToken,
    drain_token: CancellationToken,
    fanout: FanoutRegistry,
    publisher: Option<JoinHandle<()>>,
    background: Vec<(&'static str, JoinHandle<()>)>,
    ingress: Option<JoinHandle<Result<()>>>,
}

impl Coordinator {
    /// Take ownership of already-open broker and store handles
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn NotificationStore>,
        channels: ChannelMap,
        settings: RelaySettings,
    ) -> Self {
        let relay_token = CancellationToken::new();
        let fanout = FanoutRegistry::new(
            Arc::clone(&broker),
            channels.broadcast.clone(),
            relay_token.child_token(),
        );
        let (state, _) = watch::channel(LifecycleState::Starting);

        Self {
            broker,
            store,
            channels,
            settings,
            state,
            relay_token,
            ingress_token: CancellationToken::new(),
            drain_token: CancellationToken::new(),
            fanout,
            publisher: None,
            background: Vec::new(),
            ingress: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Spawn the publish worker, inbound subscriber and clock generator
    pub fn start(&mut self) -> Result<RelayHandles> {
        if self.state() != LifecycleState::Starting || self.publisher.is_some() {
            return Err(Error::Shutdown(format!(
                "Cannot start relay in state {}",
                self.state()
            )));
        }

        let (queue, publisher) = PublishWorker::spawn(
            Arc::clone(&self.broker),
            self.settings.publish_queue_capacity,
            self.drain_token.clone(),
        );
        self.publisher = Some(publisher);

        let inbound = InboundSubscriber::new(
            Arc::clone(&self.broker),
            self.channels.inbound(),
            self.settings.subscriber_initial_backoff,
            self.settings.subscriber_max_backoff,
        );
        let inbound_stats = inbound.stats();
        self.background.push((
            "inbound subscriber",
            tokio::spawn(inbound.run(self.relay_token.child_token())),
        ));

        let generator = ClockGenerator::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
            self.channels.for_origin(Origin::ClockTick),
            self.settings.clock_interval,
        );
        let generator_token = self.relay_token.child_token();
        self.background.push((
            "clock generator",
            tokio::spawn(async move {
                generator.run(generator_token).await;
            }),
        ));

        let ingestor = SubmissionIngestor::new(
            Arc::clone(&self.store),
            queue,
            self.channels.for_origin(Origin::Submission),
            self.settings.max_submission_bytes,
        );

        info!(
            submission = %self.channels.submission,
            clock = %self.channels.clock,
            broadcast = %self.channels.broadcast,
            "Relay loops started"
        );

        Ok(RelayHandles {
            ingestor,
            fanout: self.fanout.clone(),
            ingress_shutdown: self.ingress_token.clone(),
            state: self.state.subscribe(),
            inbound: inbound_stats,
        })
    }

    /// Register the running ingress server; the relay is now `Running`
    pub fn attach_ingress(&mut self, handle: JoinHandle<Result<()>>) {
        self.ingress = Some(handle);
        self.set_state(LifecycleState::Running);
    }

    /// Wait for `signal`, or for the ingress to exit on its own
    ///
    /// An ingress exit is a fatal internal error and is returned as such. The
    /// caller runs [`Coordinator::shutdown`] either way.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Some(ingress) = self.ingress.as_mut() else {
            signal.await;
            return Ok(());
        };

        let joined = tokio::select! {
            () = signal => return Ok(()),
            joined = ingress => joined,
        };
        self.ingress = None;

        let err = match joined {
            Ok(Ok(())) => Error::Transport("Ingress server exited unexpectedly".to_string()),
            Ok(Err(e)) => e,
            Err(e) => Error::Transport(format!("Ingress task failed: {e}")),
        };
        error!(error = %err, "Ingress stopped, shutting down relay");
        Err(err)
    }

    /// Run the `Stopping` sequence under one overall deadline
    ///
    /// Every step is attempted even after an earlier one failed; any failure
    /// or missed deadline is reported as [`Error::Shutdown`].
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state() == LifecycleState::Stopped {
            return Ok(());
        }
        self.set_state(LifecycleState::Stopping);

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let mut failures = Vec::new();

        // Stop accepting new work at the ingress boundary
        self.ingress_token.cancel();

        // Stop the loops and let in-flight work finish
        self.relay_token.cancel();

        if let Some(ingress) = self.ingress.take() {
            match join_before("ingress", ingress, deadline).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("ingress: {e}")),
                Err(failure) => failures.push(failure),
            }
        }

        // Fan-outs and the publish drain share the remaining budget, so a
        // stalled listener cannot starve queued publishes
        self.drain_token.cancel();
        let publisher = self.publisher.take();
        let (fanout_joined, drained) = tokio::join!(
            timeout_at(deadline, self.fanout.shutdown()),
            async move {
                match publisher {
                    Some(handle) => join_before("publish worker", handle, deadline).await,
                    None => Ok(()),
                }
            },
        );
        if fanout_joined.is_err() {
            let aborted = self.fanout.abort_all();
            failures.push(format!("{aborted} fan-out loops still running at deadline"));
        }
        if let Err(failure) = drained {
            failures.push(failure);
        }

        for (name, handle) in std::mem::take(&mut self.background) {
            if let Err(failure) = join_before(name, handle, deadline).await {
                failures.push(failure);
            }
        }

        // Release the shared handles
        match timeout_at(deadline, self.broker.close()).await {
            Ok(Ok(())) => debug!("Broker closed"),
            Ok(Err(e)) => failures.push(format!("broker close: {e}")),
            Err(_) => failures.push("broker close: deadline exceeded".to_string()),
        }

        match timeout_at(deadline, self.store.close()).await {
            Ok(()) => debug!("Store closed"),
            Err(_) => failures.push("store close: deadline exceeded".to_string()),
        }

        self.set_state(LifecycleState::Stopped);

        if failures.is_empty() {
            info!("Relay stopped cleanly");
            Ok(())
        } else {
            for failure in &failures {
                error!(failure = %failure, "Shutdown step failed");
            }
            Err(Error::Shutdown(failures.join("; ")))
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Lifecycle transition");
        }
    }
}

/// Join `handle` before `deadline`, aborting it when the deadline passes
async fn join_before<T>(
    name: &str,
    mut handle: JoinHandle<T>,
    deadline: Instant,
) -> std::result::Result<T, String> {
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(value)) => {
            debug!(task = name, "Task stopped");
            Ok(value)
        }
        Ok(Err(e)) => Err(format!("{name}: {e}")),
        Err(_) => {
            warn!(task = name, "Task missed the shutdown deadline, aborting");
            handle.abort();
            Err(format!("{name}: deadline exceeded"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::relay::{ChannelConnection, PushConnection};
    use relaycast_core::MemoryStore;
    use std::sync::atomic::Ordering;

    /// Listener whose send and close never complete
    struct StalledConnection;

    #[async_trait::async_trait]
    impl PushConnection for StalledConnection {
        async fn send(&mut self, _payload: &str) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) {
            std::future::pending::<()>().await;
        }
    }

    fn coordinator(broker: &MemoryBroker, store: &MemoryStore) -> Coordinator {
        Coordinator::new(
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            ChannelMap::default(),
            RelaySettings::default(),
        )
    }

    fn idle_ingress(token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            token.cancelled().await;
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let mut coordinator = coordinator(&broker, &store);
        assert_eq!(coordinator.state(), LifecycleState::Starting);

        let handles = coordinator.start().unwrap();
        coordinator.attach_ingress(idle_ingress(handles.ingress_shutdown.clone()));
        assert_eq!(coordinator.state(), LifecycleState::Running);

        let (conn, _rx, closed) = ChannelConnection::pair();
        handles.fanout.attach(conn).await.unwrap();
        handles.ingestor.submit("hello").await.unwrap();

        coordinator.run_until(async {}).await.unwrap();
        coordinator.shutdown().await.unwrap();

        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert_eq!(*handles.state.borrow(), LifecycleState::Stopped);
        assert!(handles.ingress_shutdown.is_cancelled());
        assert_eq!(handles.fanout.active_count(), 0);
        assert!(closed.load(Ordering::SeqCst));
        assert!(broker.is_closed());
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let mut coordinator = coordinator(&broker, &store);

        coordinator.start().unwrap();
        assert!(coordinator.start().is_err());
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ingress_exit_is_fatal() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let mut coordinator = coordinator(&broker, &store);

        coordinator.start().unwrap();
        coordinator.attach_ingress(tokio::spawn(async {
            Err(Error::Transport("address in use".to_string()))
        }));

        let err = coordinator
            .run_until(std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        coordinator.shutdown().await.unwrap();
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_ingress_fails_shutdown() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let mut coordinator = coordinator(&broker, &store);

        coordinator.start().unwrap();
        coordinator.attach_ingress(tokio::spawn(std::future::pending()));

        let err = coordinator.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown(ref msg) if msg.contains("ingress")));
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert!(broker.is_closed());
        assert!(store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_listener_does_not_starve_publish_drain() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let mut coordinator = coordinator(&broker, &store);

        let handles = coordinator.start().unwrap();
        coordinator.attach_ingress(idle_ingress(handles.ingress_shutdown.clone()));

        handles.fanout.attach(StalledConnection).await.unwrap();
        broker.publish("notifications", "stuck").await.unwrap();
        handles.ingestor.submit("queued").await.unwrap();

        coordinator.shutdown().await.unwrap();

        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert_eq!(handles.fanout.active_count(), 0);
        assert_eq!(store.count_by_origin(Origin::Submission), 1);
        // The direct publish plus the drained submission
        assert_eq!(broker.publish_attempts(), 2);
    }
}
