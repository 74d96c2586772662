use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::StoreError;

const SYSTEM_ROLES: &[&str] = &["admin", "operator", "user", "viewer"];

/// Admin gets every permission; operator gets everything but user/role
/// management; user gets read/write on its own resources; viewer is
/// read-only. The exact grants a deployment wants beyond this baseline are
/// expected to be layered on top via the RBAC API, not hand-edited here.
const BASELINE_PERMISSIONS: &[(&str, &str)] = &[
    ("pools", "read"),
    ("pools", "write"),
    ("datasets", "read"),
    ("datasets", "write"),
    ("shares", "read"),
    ("shares", "write"),
    ("containers", "read"),
    ("containers", "write"),
    ("network", "read"),
    ("network", "write"),
    ("users", "read"),
    ("users", "write"),
    ("roles", "read"),
    ("roles", "write"),
    ("audit", "read"),
    ("system", "read"),
    ("system", "write"),
];

/// Idempotent: only inserts roles/permissions that seed the initial
/// install. Safe to call on every startup — existing rows are left alone.
pub async fn seed_defaults(pool: &SqlitePool) -> Result<(), StoreError> {
    let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM roles").fetch_one(pool).await?;
    if existing.0 > 0 {
        return Ok(());
    }

    let mut tx = pool.begin().await?;

    let mut role_ids = std::collections::HashMap::new();
    for name in SYSTEM_ROLES {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO roles (id, name, is_system) VALUES (?, ?, 1)")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        role_ids.insert(*name, id);
    }

    let mut permission_ids = Vec::new();
    for (resource, action) in BASELINE_PERMISSIONS {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO permissions (id, resource, action) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(resource)
            .bind(action)
            .execute(&mut *tx)
            .await?;
        permission_ids.push((id, *resource, *action));
    }

    for (perm_id, resource, action) in &permission_ids {
        let grant_to: &[&str] = match (*resource, *action) {
            ("users", _) | ("roles", _) => &["admin"],
            (_, "write") => &["admin", "operator"],
            _ => &["admin", "operator", "user", "viewer"],
        };
        for role_name in grant_to {
            let role_id = &role_ids[role_name];
            sqlx::query(
                "INSERT INTO role_permissions (role_id, permission_id) VALUES (?, ?)",
            )
            .bind(role_id)
            .bind(perm_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    let now = Utc::now();
    sqlx::query(
        "INSERT INTO desired_state (id, version, document, updated_at) VALUES (1, 0, '{}', ?)",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!("seeded baseline roles, permissions, and desired-state singleton");
    Ok(())
}
