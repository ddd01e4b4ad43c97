pub mod notification;

pub use notification::{format_clock_message, Acknowledgement, Notification, Origin, PersistedRecord};
