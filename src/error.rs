use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::deployment::backend::BackendError;

/// Abstract error kinds surfaced to API callers.
///
/// Every component classifies its failures into one of these before the
/// error leaves the component boundary; the HTTP mapping lives here and
/// nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request body or unknown id.
    Validation,
    /// Missing/invalid/expired token.
    Authentication,
    /// Insufficient role.
    Authorization,
    /// Duplicate id, in-flight lifecycle collision, port already bound.
    Conflict,
    /// Capability resolver reports missing configuration keys.
    Unconfigured,
    /// Remote collaborator unreachable; retryable, state unchanged.
    BackendUnavailable,
    /// Backend rejected the operation; deployment marked failed.
    BackendFailed,
    /// Unhandled internal error.
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unconfigured => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BackendFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unconfigured => "unconfigured",
            ErrorKind::BackendUnavailable => "backend-unavailable",
            ErrorKind::BackendFailed => "backend-failed",
            ErrorKind::Internal => "internal",
        }
    }
}

/// API error carrying a user-facing message, an optional source chain for
/// logging, and structured context. Converting to a response logs 5xx
/// errors with their full chain; the client sees only the clean message.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    /// Not-found is a Validation kind with a 404 status; everything else
    /// derives its status from the kind.
    pub status_override: Option<StatusCode>,
    pub message: String,
    pub source: Option<anyhow::Error>,
    pub context: Vec<(&'static str, String)>,
    /// Extra JSON fields merged into the response body (e.g. missing_keys).
    pub extra: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_override: None,
            message: message.into(),
            source: None,
            context: Vec::new(),
            extra: None,
        }
    }

    pub fn from_anyhow(source: anyhow::Error, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_override: None,
            message: message.into(),
            source: Some(source),
            context: Vec::new(),
            extra: None,
        }
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Validation, message);
        err.status_override = Some(StatusCode::NOT_FOUND);
        err
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unconfigured(message: impl Into<String>, missing_keys: serde_json::Value) -> Self {
        Self::new(ErrorKind::Unconfigured, message)
            .with_extra(json!({ "missing_keys": missing_keys }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn internal_anyhow(source: anyhow::Error, message: impl Into<String>) -> Self {
        Self::from_anyhow(source, ErrorKind::Internal, message)
    }

    fn status(&self) -> StatusCode {
        self.status_override.unwrap_or_else(|| self.kind.status())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = status.as_u16(),
                    kind = self.kind.as_str(),
                    message = %self.message,
                    context = ?self.context,
                    error = ?source,
                    "API error"
                );
            } else {
                tracing::error!(
                    status = status.as_u16(),
                    kind = self.kind.as_str(),
                    message = %self.message,
                    context = ?self.context,
                    "API error"
                );
            }
        }

        let mut body = json!({
            "error": self.message,
            "kind": self.kind.as_str(),
        });
        if let Some(serde_json::Value::Object(extra)) = self.extra {
            if let serde_json::Value::Object(ref mut map) = body {
                map.extend(extra);
            }
        }

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::internal_anyhow(err.into(), "Database operation failed")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal_anyhow(err, "Internal server error")
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(source) => {
                Self::from_anyhow(source, ErrorKind::BackendUnavailable, "Backend unavailable")
            }
            BackendError::Failed(source) => {
                Self::from_anyhow(source, ErrorKind::BackendFailed, "Backend operation failed")
            }
        }
    }
}

/// Extension trait for converting Result errors into ApiError with context.
pub trait ApiErrorExt<T> {
    fn api_err(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, ApiError>;
    fn internal_err(self, message: impl Into<String>) -> Result<T, ApiError>;
}

impl<T, E> ApiErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn api_err(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::from_anyhow(e.into(), kind, message))
    }

    fn internal_err(self, message: impl Into<String>) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::internal_anyhow(e.into(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(ErrorKind::Validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorKind::Unconfigured.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorKind::BackendUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found_overrides_status() {
        let err = ApiError::not_found("no such service");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
