pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod repository;

pub use channels::ChannelMap;
pub use config::Config;
pub use error::{Error, Result};
pub use models::{Acknowledgement, Notification, Origin, PersistedRecord};
pub use repository::{MemoryStore, NotificationStore, PgNotificationStore};
