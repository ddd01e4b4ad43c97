// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert relay errors to HTTP errors
///
/// Submitters learn whether their content was stored; internal detail is
/// logged, never returned.
impl From<relaycast_core::Error> for AppError {
    fn from(err: relaycast_core::Error) -> Self {
        use relaycast_core::Error;

        match err {
            Error::Validation(msg) => AppError::bad_request(msg),
            Error::Persistence(msg) => {
                tracing::error!("Persistence error: {}", msg);
                AppError::internal_server_error("Failed to insert content")
            }
            Error::Shutdown(msg) => {
                tracing::warn!("Request during shutdown: {}", msg);
                AppError::service_unavailable("Service is shutting down")
            }
            other => {
                tracing::error!("Internal error: {}", other);
                AppError::internal_server_error("Internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_core::Error;

    #[test]
    fn test_relay_error_mapping() {
        let err = AppError::from(Error::Validation("Content is required".to_string()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Content is required");

        let err = AppError::from(Error::Persistence("connection refused".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Failed to insert content");

        let err = AppError::from(Error::Publication("broker down".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("broker"));

        let err = AppError::from(Error::Shutdown("stopping".to_string()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
