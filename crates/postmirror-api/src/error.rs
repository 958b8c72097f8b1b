use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use postmirror_core::{ErrorKind, StoreError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("External dependency error: {0}")]
    External(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(rejection.body_text())
        } else {
            Self::BadRequest(rejection.body_text())
        }
    }
}

impl From<postmirror_core::Error> for AppError {
    fn from(error: postmirror_core::Error) -> Self {
        use postmirror_core::Error;

        let message = error.to_string();
        match error {
            Error::InvalidInput(_) | Error::UnsupportedDirection(_) => Self::BadRequest(message),
            Error::NotFound(_) | Error::Store(StoreError::NotFound(_)) => Self::NotFound(message),
            Error::SyncInProgress | Error::Store(StoreError::UniqueViolation { .. }) => {
                Self::Conflict(message)
            }
            Error::BothOriginsFailed { primary, fallback }
                if primary.kind == ErrorKind::NotFound && fallback.kind == ErrorKind::NotFound =>
            {
                Self::NotFound(message)
            }
            Error::BothOriginsFailed { .. } => Self::Unavailable(message),
            Error::Classified(classified) => match classified.kind {
                ErrorKind::NotFound => Self::NotFound(message),
                ErrorKind::Unavailable | ErrorKind::RateLimit { .. } => Self::Unavailable(message),
                ErrorKind::Authentication | ErrorKind::Generic => Self::External(message),
            },
            Error::Source(_) => Self::External(message),
            Error::Store(_)
            | Error::LibSql(_)
            | Error::Io(_)
            | Error::Serialization(_) => Self::Internal(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
