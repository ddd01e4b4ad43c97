use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaycast_core::{metrics, Notification, NotificationStore};

use crate::broker::Broker;

/// Periodic clock event generator
///
/// Emits one clock-origin notification per interval until shutdown. Each
/// tick persists and publishes independently; either failing only shows up
/// in logs and metrics. Missed ticks are skipped, never replayed.
pub struct ClockGenerator {
    broker: Arc<dyn Broker>,
    store: Arc<dyn NotificationStore>,
    channel: String,
    interval: Duration,
}

impl ClockGenerator {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn NotificationStore>,
        channel: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            channel: channel.into(),
            interval,
        }
    }

    /// Run until `shutdown` fires, returning the number of ticks emitted
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        // First tick lands one full interval after start
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            channel = %self.channel,
            interval_secs = self.interval.as_secs_f64(),
            "Clock generator started"
        );

        let mut ticks = 0;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A tick in flight is finished before shutdown is observed
            self.tick(Notification::clock_tick(Utc::now())).await;
            ticks += 1;
        }

        info!(ticks = ticks, "Clock generator stopped");
        ticks
    }

    /// Persist and publish one clock event
    pub async fn tick(&self, notification: Notification) {
        metrics::relay::CLOCK_TICKS_TOTAL.inc();
        let origin = notification.origin.as_str();

        let (persisted, published) = tokio::join!(
            self.store.insert(&notification),
            self.broker.publish(&self.channel, &notification.content),
        );

        match persisted {
            Ok(record) => debug!(record_id = record.id, "Clock event persisted"),
            Err(e) => {
                metrics::relay::PERSISTENCE_FAILURES_TOTAL
                    .with_label_values(&[origin])
                    .inc();
                warn!(error = %e, "Failed to persist clock event");
            }
        }

        match published {
            Ok(()) => {
                metrics::relay::PUBLISHES_TOTAL
                    .with_label_values(&[origin, "ok"])
                    .inc();
                debug!(channel = %self.channel, content = %notification.content, "Clock event published");
            }
            Err(e) => {
                metrics::relay::PUBLISHES_TOTAL
                    .with_label_values(&[origin, "failed"])
                    .inc();
                warn!(error = %e, channel = %self.channel, "Failed to publish clock event");
            }
        }
    }
}
