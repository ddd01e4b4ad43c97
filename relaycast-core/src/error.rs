use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Rejected submission (empty, whitespace-only, or oversized content)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Publication error: {0}")]
    Publication(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The broker handle was closed underneath an open subscription
    #[error("Subscription closed")]
    SubscriptionClosed,

    /// Push transport (listener connection) failure
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether a receive failure means the subscription can never yield again
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::SubscriptionClosed)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolClosed => Self::Persistence("Store handle is closed".to_string()),
            sqlx::Error::PoolTimedOut => {
                Self::Persistence("Timed out acquiring a store connection".to_string())
            }
            _ => Self::Persistence(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_errors_map_to_persistence() {
        let err: Error = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(err.to_string().contains("closed"));

        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn test_is_closed() {
        assert!(Error::SubscriptionClosed.is_closed());
        assert!(!Error::Subscription("connection reset".to_string()).is_closed());
    }
}
