// HTTP API Error Types
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::auth::AuthError;
use crate::event::EventError;
use crate::input::InputError;
use crate::permission::PermissionError;
use crate::proxy::ProxyError;
use crate::services::ServiceError;
use crate::storage::StorageError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),

    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict
    Conflict(String),

    // 412 Precondition Failed
    PreconditionFailed(String),

    // 413 Payload Too Large
    PayloadTooLarge(String),

    // 429 Too Many Requests
    TooManyRequests(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 502 Bad Gateway (service back-end unreachable)
    BadGateway(String),

    // Status preserved from a service back end
    Upstream { status: u16, message: String },
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::PreconditionFailed(_) => 412,
            ApiError::PayloadTooLarge(_) => 413,
            ApiError::TooManyRequests(_) => 429,
            ApiError::InternalServerError(_) => 500,
            ApiError::BadGateway(_) => 502,
            ApiError::Upstream { status, .. } => *status,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Unauthorized(msg) => msg,
            ApiError::Forbidden(msg) => msg,
            ApiError::NotFound(msg) => msg,
            ApiError::Conflict(msg) => msg,
            ApiError::PreconditionFailed(msg) => msg,
            ApiError::PayloadTooLarge(msg) => msg,
            ApiError::TooManyRequests(msg) => msg,
            ApiError::InternalServerError(msg) => msg,
            ApiError::BadGateway(msg) => msg,
            ApiError::Upstream { message, .. } => message,
        }
    }

    /// Get error code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::BadGateway(_) => "BAD_GATEWAY",
            ApiError::Upstream { .. } => "UPSTREAM",
        }
    }
}

// Static constructor methods
impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        ApiError::PreconditionFailed(message.into())
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        ApiError::PayloadTooLarge(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        ApiError::BadGateway(message.into())
    }

    /// The permission denial every handler returns for a visible resource.
    pub fn permission_denied() -> Self {
        PermissionError::Unauthorized.into()
    }
}

// Convert domain error types to ApiError
impl From<PermissionError> for ApiError {
    fn from(err: PermissionError) -> Self {
        let message = err.to_string();
        match err {
            PermissionError::Unauthorized => ApiError::forbidden(message),
            PermissionError::RoleNotFound => ApiError::not_found(message),
            PermissionError::RoleAlreadyExists => ApiError::conflict(message),
            PermissionError::RemoveRoleWithUsers => ApiError::precondition_failed(message),
            PermissionError::TooManyTeams
            | PermissionError::InvalidRoleName
            | PermissionError::PermissionNotFound(_)
            | PermissionError::PermissionNotAllowed { .. }
            | PermissionError::InvalidContextType(_)
            | PermissionError::InvalidRoleEvent(_)
            | PermissionError::RoleEventContextMismatch { .. } => ApiError::bad_request(message),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AlreadyExists { .. } => ApiError::conflict(err.to_string()),
            StorageError::NotFound { .. } => ApiError::not_found(err.to_string()),
            StorageError::Backend(msg) => {
                // Log the real error but return generic message
                tracing::error!("storage error: {}", msg);
                ApiError::internal_server_error("storage error occurred")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let message = err.to_string();
        match err {
            AuthError::InvalidToken | AuthError::AuthenticationFailure(_) => {
                ApiError::unauthorized(message)
            }
            AuthError::RegistrationDisabled => ApiError::unauthorized(message),
            AuthError::UserNotFound => ApiError::not_found(message),
            AuthError::UserExists => ApiError::conflict(message),
            AuthError::InvalidEmail
            | AuthError::InvalidPassword
            | AuthError::NotManaged
            | AuthError::InvalidResetToken => ApiError::bad_request(message),
            AuthError::AppTokenMismatch { .. } => ApiError::forbidden(message),
            AuthError::Storage(inner) => inner.into(),
            AuthError::Mail(_) | AuthError::Hash(_) | AuthError::Signing(_) => {
                tracing::error!("auth error: {}", message);
                ApiError::internal_server_error(message)
            }
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        let message = err.to_string();
        match err {
            EventError::Locked(_) => ApiError::conflict(message),
            EventError::Throttled(_) => ApiError::TooManyRequests(message),
            EventError::NotFound => ApiError::not_found(message),
            EventError::NotCancelable | EventError::CancelAlreadyRequested => {
                ApiError::bad_request(message)
            }
            EventError::Permission(inner) => inner.into(),
            _ => {
                tracing::error!("event error: {}", message);
                ApiError::internal_server_error(message)
            }
        }
    }
}

impl From<InputError> for ApiError {
    fn from(err: InputError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::InvalidPath | ProxyError::Forbidden { .. } => ApiError::bad_request(message),
            ProxyError::Transport(_) => ApiError::bad_gateway(message),
            ProxyError::NoEndpoint(_) | ProxyError::InvalidUrl(_) => {
                ApiError::internal_server_error(message)
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::Validation(_)
            | ServiceError::InstanceHasBindings { .. }
            | ServiceError::NotBound => ApiError::bad_request(message),
            ServiceError::NotFound(_) => ApiError::not_found(message),
            ServiceError::Conflict(_) => ApiError::conflict(message),
            ServiceError::Precondition(_) => ApiError::forbidden(message),
            ServiceError::Upstream { status, .. } => ApiError::Upstream { status, message },
            ServiceError::Transport(_) => ApiError::bad_gateway(message),
            ServiceError::Storage(inner) => inner.into(),
            ServiceError::Event(inner) => inner.into(),
            ServiceError::Permission(inner) => inner.into(),
            ServiceError::Canceled
            | ServiceError::InvalidAutoscaleRule(_)
            | ServiceError::Provisioner(_)
            | ServiceError::Aggregate(_) => ApiError::internal_server_error(message),
        }
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum: plain text, one trailing newline
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed with {}: {}", self.error_code(), self.message());
        }
        let body = format!("{}\n", self.message().trim_end_matches('\n'));
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
