use thiserror::Error;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("row not found")]
    NotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit key error: {0}")]
    AuditKey(String),
}
