//! Error types for `dplaneos-core`.
//!
//! Each subsystem gets its own enum so call sites can match on exactly the
//! failures that subsystem can produce; `dplaneos-server` fans all of them
//! into a single `AppError` (see that crate's `error.rs`).

use dplaneos_store::StoreError;

/// Errors from the allow-listed command executor.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("argument {index} failed validation for command '{name}': {reason}")]
    InvalidArgument {
        name: String,
        index: usize,
        reason: String,
    },

    #[error("command '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("command '{name}' exited with status {code}: {stderr}")]
    NonZeroExit {
        name: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn command '{name}': {reason}")]
    Spawn { name: String, reason: String },
}

/// Errors from the tamper-evident audit chain.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Store(#[from] StoreError),

    #[error("audit chain broken at entry {entry_id}")]
    ChainBroken { entry_id: i64 },

    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("audit database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from login, session, and token handling.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("account disabled")]
    AccountDisabled,

    #[error("session not found")]
    SessionNotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("totp verification required")]
    TotpRequired,

    #[error("totp code invalid")]
    TotpInvalid,

    #[error("totp is not enabled for this account")]
    TotpNotEnabled,

    #[error("csrf token mismatch")]
    CsrfMismatch,

    #[error("api token invalid or revoked")]
    ApiTokenInvalid,

    #[error("auth store error: {0}")]
    Store(#[from] StoreError),

    #[error("auth database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from permission evaluation.
#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("permission denied: {resource}/{action}")]
    Denied { resource: String, action: String },

    #[error("role not found: {name}")]
    RoleNotFound { name: String },

    #[error("cannot modify a system role: {name}")]
    SystemRoleImmutable { name: String },

    #[error("rbac store error: {0}")]
    Store(#[from] StoreError),

    #[error("rbac database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from per-IP rate limiting.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    Exceeded { retry_after_secs: u64 },
}

/// Errors from the snapshot/mutate/commit-or-rollback mutator.
#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    #[error("snapshot failed: {reason}")]
    SnapshotFailed { reason: String },

    #[error("mutation failed: {reason}")]
    MutationFailed { reason: String },

    #[error("health check failed after mutation, rolled back to {snapshot}")]
    HealthCheckFailed { snapshot: String },

    #[error("rollback itself failed: {reason} (system may be in a degraded state)")]
    RollbackFailed { reason: String },

    #[error("command error: {0}")]
    Command(#[from] CommandError),
}

/// Errors from the declarative reconciler.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("plan not found: {plan_id}")]
    PlanNotFound { plan_id: String },

    #[error("plan requires approval before it can be applied")]
    ApprovalRequired,

    #[error("desired state document invalid: {reason}")]
    InvalidDocument { reason: String },

    #[error("reconcile store error: {0}")]
    Store(#[from] StoreError),

    #[error("step failed: {0}")]
    StepFailed(#[from] MutatorError),
}
