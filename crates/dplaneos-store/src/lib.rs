//! Persistence layer for the D-PlaneOS control-plane orchestrator.
//!
//! A single embedded WAL-mode SQLite database backs the entire control
//! plane: identity, RBAC, audit, and the declarative configuration model.
//! This crate owns the schema, startup sequence (open, checkpoint, migrate,
//! seed, integrity-check), and periodic maintenance (checkpoint, backup).
//! It knows nothing about HTTP, sessions, or policy decisions — those live
//! in `dplaneos-core`.

mod audit_key;
mod error;
mod models;
mod pool;
mod schema;
mod seed;

pub use audit_key::load_or_create as load_or_create_audit_key;
pub use error::StoreError;
pub use models::{
    ApiToken, AuditEntry, DesiredState, DirectoryConfig, IntegrationConfig, Permission, Role,
    RolePermission, Session, SessionKind, ShareDefinition, SnapshotSchedule, User, UserRole,
};
pub use pool::{backup_into, checkpoint_passive, integrity_check};

use std::path::Path;

use sqlx::SqlitePool;

/// Runs the full startup sequence: open, truncate-checkpoint, schema
/// init/migration, default seeding, integrity check. Returns a pool ready
/// for use by every other crate in the workspace.
///
/// # Errors
///
/// Returns [`StoreError`] if any step of the sequence fails.
pub async fn bootstrap(db_path: &Path) -> Result<SqlitePool, StoreError> {
    let pool = pool::open(db_path).await?;
    schema::init_schema(&pool).await?;
    seed::seed_defaults(&pool).await?;
    pool::integrity_check(&pool).await?;
    Ok(pool)
}
