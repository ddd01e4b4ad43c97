use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::{
    metrics,
    models::{Notification, Origin, PersistedRecord},
    Error, Result,
};

/// Durable, append-only sink for notifications.
///
/// Implementations must be safe for concurrent use: every relay loop shares
/// one handle and never wraps it in its own lock.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Write one record for `notification`
    async fn insert(&self, notification: &Notification) -> Result<PersistedRecord>;

    /// Release the underlying handle; later inserts fail
    async fn close(&self);
}

/// PostgreSQL-backed store.
///
/// Submission-origin records go to `submissions(content)`, clock-origin
/// records to `events(event)`.
#[derive(Clone, Debug)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    const fn insert_sql(origin: Origin) -> (&'static str, &'static str) {
        match origin {
            Origin::Submission => (
                "submissions",
                "INSERT INTO submissions (content) VALUES ($1) RETURNING id, created_at",
            ),
            Origin::ClockTick => (
                "events",
                "INSERT INTO events (event) VALUES ($1) RETURNING id, created_at",
            ),
        }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<PersistedRecord> {
        let (table, sql) = Self::insert_sql(notification.origin);
        let started = Instant::now();

        let result = sqlx::query(sql)
            .bind(&notification.content)
            .fetch_one(&self.pool)
            .await;

        metrics::database::DB_QUERY_DURATION
            .with_label_values(&["insert", table])
            .observe(started.elapsed().as_secs_f64());

        let row = result.map_err(|e| {
            metrics::database::DB_QUERY_ERRORS
                .with_label_values(&["insert", table])
                .inc();
            Error::from(e)
        })?;

        Ok(PersistedRecord {
            id: row.try_get("id")?,
            content: notification.content.clone(),
            origin: notification.origin,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// In-process store.
///
/// Used by tests and local runs; can be switched into a failing mode to
/// exercise persistence-error paths.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<PersistedRecord>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of all records, in insertion order
    #[must_use]
    pub fn records(&self) -> Vec<PersistedRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn count_by_origin(&self, origin: Origin) -> usize {
        self.records.lock().iter().filter(|r| r.origin == origin).count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<PersistedRecord> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Persistence("Store handle is closed".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Persistence("Store unavailable".to_string()));
        }

        let mut records = self.records.lock();
        let record = PersistedRecord {
            id: i64::try_from(records.len()).unwrap_or(i64::MAX - 1) + 1,
            content: notification.content.clone(),
            origin: notification.origin,
            created_at: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
