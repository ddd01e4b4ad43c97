use std::sync::Arc;
use tracing::{debug, warn};

use relaycast_core::{metrics, Acknowledgement, Error, Notification, NotificationStore, Result};

use super::publisher::{PublishQueue, PublishRequest};

/// Submission path
///
/// Persistence is synchronous and decides the caller's outcome. The publish
/// is handed to the [`PublishQueue`] afterwards and never affects the result.
#[derive(Clone)]
pub struct SubmissionIngestor {
    store: Arc<dyn NotificationStore>,
    queue: PublishQueue,
    channel: String,
    max_bytes: usize,
}

impl SubmissionIngestor {
    #[must_use]
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: PublishQueue,
        channel: impl Into<String>,
        max_bytes: usize,
    ) -> Self {
        Self {
            store,
            queue,
            channel: channel.into(),
            max_bytes,
        }
    }

    /// Validate, persist, then enqueue the broadcast of `content`
    pub async fn submit(&self, content: &str) -> Result<Acknowledgement> {
        let content = match self.validate(content) {
            Ok(content) => content,
            Err(e) => {
                metrics::relay::SUBMISSIONS_TOTAL
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(e);
            }
        };

        let notification = Notification::submission(content);
        let record = match self.store.insert(&notification).await {
            Ok(record) => record,
            Err(e) => {
                metrics::relay::SUBMISSIONS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                metrics::relay::PERSISTENCE_FAILURES_TOTAL
                    .with_label_values(&[notification.origin.as_str()])
                    .inc();
                warn!(error = %e, "Failed to persist submission");
                return Err(e);
            }
        };

        metrics::relay::SUBMISSIONS_TOTAL
            .with_label_values(&["accepted"])
            .inc();
        debug!(record_id = record.id, "Submission persisted");

        let request = PublishRequest {
            channel: self.channel.clone(),
            payload: notification.content.clone(),
            origin: notification.origin,
        };
        if let Err(e) = self.queue.enqueue(request) {
            warn!(error = %e, record_id = record.id, "Submission stored but not broadcast");
        }

        Ok(Acknowledgement {
            record_id: record.id,
            content: notification.content,
        })
    }

    fn validate<'a>(&self, content: &'a str) -> Result<&'a str> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation("Content is required".to_string()));
        }
        if content.len() > self.max_bytes {
            return Err(Error::Validation(format!(
                "Content exceeds {} bytes",
                self.max_bytes
            )));
        }
        Ok(content)
    }
}
