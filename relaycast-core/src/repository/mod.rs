pub mod notification;

pub use notification::{MemoryStore, NotificationStore, PgNotificationStore};
