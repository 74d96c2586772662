//! HTTP error types for the D-PlaneOS server.
//!
//! Maps domain errors from `dplaneos-core` into the uniform
//! `{ok, error: {code, message}}` response envelope, following the error
//! taxonomy's status table.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use dplaneos_core::error::{
    AuditError, AuthError, CommandError, MutatorError, RateLimitError, RbacError, ReconcileError,
};
use dplaneos_store::StoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Upstream(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct Envelope {
    ok: bool,
    error: ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = Envelope { ok: false, error: ErrorBody { code, message: self.to_string() } };
        (status, axum::Json(body)).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials
            | AuthError::SessionNotFound
            | AuthError::SessionExpired
            | AuthError::ApiTokenInvalid => Self::Unauthenticated,
            AuthError::AccountDisabled | AuthError::CsrfMismatch => Self::Forbidden(err.to_string()),
            AuthError::TotpRequired | AuthError::TotpInvalid | AuthError::TotpNotEnabled => {
                Self::BadRequest(err.to_string())
            }
            AuthError::Store(_) | AuthError::Database(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<RbacError> for AppError {
    fn from(err: RbacError) -> Self {
        match err {
            RbacError::Denied { .. } => Self::Forbidden(err.to_string()),
            RbacError::RoleNotFound { .. } => Self::NotFound(err.to_string()),
            RbacError::SystemRoleImmutable { .. } => Self::Conflict(err.to_string()),
            RbacError::Store(_) | RbacError::Database(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<CommandError> for AppError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::UnknownCommand { .. } | CommandError::InvalidArgument { .. } => {
                Self::BadRequest(err.to_string())
            }
            CommandError::Timeout { .. } => Self::Timeout(err.to_string()),
            CommandError::NonZeroExit { .. } | CommandError::Spawn { .. } => Self::Upstream(err.to_string()),
        }
    }
}

impl From<AuditError> for AppError {
    fn from(err: AuditError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<MutatorError> for AppError {
    fn from(err: MutatorError) -> Self {
        match err {
            MutatorError::SnapshotFailed { .. } | MutatorError::MutationFailed { .. } => {
                Self::Internal(err.to_string())
            }
            MutatorError::HealthCheckFailed { .. } => Self::Conflict(err.to_string()),
            MutatorError::RollbackFailed { .. } => Self::Unavailable(err.to_string()),
            MutatorError::Command(inner) => inner.into(),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::PlanNotFound { .. } => Self::NotFound(err.to_string()),
            ReconcileError::ApprovalRequired => Self::Conflict(err.to_string()),
            ReconcileError::InvalidDocument { .. } => Self::BadRequest(err.to_string()),
            ReconcileError::Store(_) => Self::Internal(err.to_string()),
            ReconcileError::StepFailed(inner) => inner.into(),
        }
    }
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { retry_after_secs } => Self::RateLimited { retry_after_secs },
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
