//! Request-level errors and their HTTP rendering

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::prompt::PromptError;
use crate::upstream::UpstreamError;

/// Category of a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Validation,
    UnsupportedMediaType,
    NotFound,
    UpstreamTimeout,
    UpstreamHttp,
    UpstreamProtocol,
    UpstreamNetwork,
    Config,
}

/// Wire name and status for every kind
const ERROR_TABLE: &[(ErrorKind, &str, StatusCode)] = &[
    (ErrorKind::Auth, "AuthError", StatusCode::UNAUTHORIZED),
    (ErrorKind::Validation, "ValidationError", StatusCode::BAD_REQUEST),
    (
        ErrorKind::UnsupportedMediaType,
        "UnsupportedMediaType",
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
    ),
    (ErrorKind::NotFound, "NotFound", StatusCode::NOT_FOUND),
    (ErrorKind::UpstreamTimeout, "UpstreamTimeout", StatusCode::GATEWAY_TIMEOUT),
    (
        ErrorKind::UpstreamHttp,
        "UpstreamHTTPError",
        StatusCode::INTERNAL_SERVER_ERROR,
    ),
    (ErrorKind::UpstreamProtocol, "UpstreamProtocolError", StatusCode::BAD_GATEWAY),
    (ErrorKind::UpstreamNetwork, "UpstreamNetworkError", StatusCode::BAD_GATEWAY),
    (ErrorKind::Config, "ConfigError", StatusCode::INTERNAL_SERVER_ERROR),
];

impl ErrorKind {
    fn entry(self) -> (&'static str, StatusCode) {
        ERROR_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, name, status)| (*name, *status))
            .unwrap_or(("InternalError", StatusCode::INTERNAL_SERVER_ERROR))
    }

    pub fn as_str(self) -> &'static str {
        self.entry().0
    }

    pub fn status(self) -> StatusCode {
        self.entry().1
    }
}

/// The single error type returned by request handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {message}", kind.as_str())]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        let kind = match &e {
            UpstreamError::Timeout(_) => ErrorKind::UpstreamTimeout,
            UpstreamError::Status { .. } | UpstreamError::Provider { .. } => ErrorKind::UpstreamHttp,
            UpstreamError::Protocol(_) => ErrorKind::UpstreamProtocol,
            UpstreamError::Network(_) => ErrorKind::UpstreamNetwork,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<PromptError> for ApiError {
    fn from(e: PromptError) -> Self {
        Self::new(ErrorKind::NotFound, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(
                error_type = self.kind.as_str(),
                error_message = %self.message,
                "Request failed"
            );
        } else {
            tracing::warn!(
                error_type = self.kind.as_str(),
                error_message = %self.message,
                "Request rejected"
            );
        }

        let body = serde_json::json!({
            "error": {
                "kind": self.kind.as_str(),
                "message": self.message,
            }
        });

        (status, Json(body)).into_response()
    }
}
