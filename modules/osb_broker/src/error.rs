use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::platform::PlatformError;

/// Broker error taxonomy. Every variant maps to an OSBAPI error code and an
/// HTTP status; the description travels to the platform verbatim.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("asynchronous operation support is required")]
    AsyncRequired,
    #[error("{0}")]
    Concurrency(String),
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Query(String),
    #[error("{0}")]
    Parameter(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Gone(String),
    #[error("{0}")]
    Internal(String),
}

impl BrokerError {
    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::Parameter(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Prefix the description with the parameter the failure is attributed to.
    pub fn for_parameter(self, name: &str) -> Self {
        let wrap = |msg: String| format!("parameter {name:?}: {msg}");
        match self {
            Self::Configuration(m) => Self::Configuration(wrap(m)),
            Self::Parameter(m) => Self::Parameter(wrap(m)),
            Self::Internal(m) => Self::Internal(wrap(m)),
            other => other,
        }
    }

    /// OSBAPI error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AsyncRequired => "AsyncRequired",
            Self::Concurrency(_) => "ConcurrencyError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Query(_) => "QueryError",
            Self::Parameter(_) => "ParameterError",
            Self::Validation(_) => "ValidationError",
            Self::Conflict(_) => "ResourceConflict",
            Self::NotFound(_) => "ResourceNotFound",
            Self::Gone(_) => "ResourceGone",
            Self::Internal(_) => "InternalServerError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AsyncRequired | Self::Concurrency(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Configuration(_)
            | Self::Query(_)
            | Self::Parameter(_)
            | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PlatformError> for BrokerError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotFound(m) => Self::NotFound(m),
            PlatformError::AlreadyExists(m) => Self::Conflict(m),
            PlatformError::Other(m) => Self::Internal(m),
        }
    }
}

/// Wire shape of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_usable: Option<bool>,
}

/// A broker error on its way out of a handler. `instance_usable` is only set
/// on update/deprovision failures.
#[derive(Debug)]
pub struct ApiError {
    pub error: BrokerError,
    pub instance_usable: Option<bool>,
}

impl ApiError {
    pub fn with_usable(error: BrokerError, usable: bool) -> Self {
        Self {
            error,
            instance_usable: Some(usable),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        Self {
            error,
            instance_usable: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = ErrorBody {
            error: self.error.code(),
            description: self.error.to_string(),
            instance_usable: self.instance_usable,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.error, status = status.as_u16(), "request failed");
        } else {
            tracing::warn!(error = %self.error, status = status.as_u16(), "request failed");
        }

        (status, Json(body)).into_response()
    }
}
