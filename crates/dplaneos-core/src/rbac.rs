//! Role-based access control (C5).
//!
//! Permissions are `(resource, action)` pairs granted to roles; users hold
//! roles, optionally with an expiry. An expired `UserRole` binding is
//! treated as if it didn't exist — no separate "expired" state leaks
//! through to the check. A single permission check is placed at the top
//! of every sensitive route handler.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::RbacError;

/// Returns whether `user_id` holds a non-expired role granting
/// `(resource, action)`. Fails closed — any unexpected database error is
/// treated the same as "not permitted" by the caller mapping it to 403.
///
/// # Errors
///
/// Returns [`RbacError::Database`] if the query fails.
pub async fn has_permission(
    pool: &SqlitePool,
    user_id: &str,
    resource: &str,
    action: &str,
) -> Result<bool, RbacError> {
    let now = Utc::now();
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM user_roles ur
        JOIN role_permissions rp ON rp.role_id = ur.role_id
        JOIN permissions p ON p.id = rp.permission_id
        WHERE ur.user_id = ?
          AND p.resource = ?
          AND p.action = ?
          AND (ur.expires_at IS NULL OR ur.expires_at > ?)
        "#,
    )
    .bind(user_id)
    .bind(resource)
    .bind(action)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(count,)| count > 0).unwrap_or(false))
}

/// Asserts the permission and returns a [`RbacError::Denied`] error
/// otherwise — the single call sites wrap so every route does exactly one
/// thing to gate access.
///
/// # Errors
///
/// Returns [`RbacError::Denied`] if the user lacks the permission, or
/// [`RbacError::Database`] on query failure.
pub async fn require_permission(
    pool: &SqlitePool,
    user_id: &str,
    resource: &str,
    action: &str,
) -> Result<(), RbacError> {
    if has_permission(pool, user_id, resource, action).await? {
        Ok(())
    } else {
        Err(RbacError::Denied { resource: resource.to_string(), action: action.to_string() })
    }
}

/// Rejects attempts to rename, delete, or regrant a system role's
/// permission set outside the seeded baseline.
///
/// # Errors
///
/// Returns [`RbacError::SystemRoleImmutable`].
pub fn assert_role_mutable(role_name: &str, is_system: bool) -> Result<(), RbacError> {
    if is_system {
        Err(RbacError::SystemRoleImmutable { name: role_name.to_string() })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Duration;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE roles (id TEXT PRIMARY KEY, name TEXT, is_system INTEGER);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE permissions (id TEXT PRIMARY KEY, resource TEXT, action TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE role_permissions (role_id TEXT, permission_id TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE user_roles (user_id TEXT, role_id TEXT, expires_at TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn expired_binding_is_treated_as_absent() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO roles VALUES ('r1', 'operator', 0)").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO permissions VALUES ('p1', 'pools', 'write')").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO role_permissions VALUES ('r1', 'p1')").execute(&pool).await.unwrap();

        let expired = Utc::now() - Duration::hours(1);
        sqlx::query("INSERT INTO user_roles VALUES ('u1', 'r1', ?)")
            .bind(expired)
            .execute(&pool)
            .await
            .unwrap();

        let allowed = has_permission(&pool, "u1", "pools", "write").await.unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn active_binding_grants_permission() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO roles VALUES ('r1', 'operator', 0)").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO permissions VALUES ('p1', 'pools', 'write')").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO role_permissions VALUES ('r1', 'p1')").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO user_roles VALUES ('u1', 'r1', NULL)").execute(&pool).await.unwrap();

        let allowed = has_permission(&pool, "u1", "pools", "write").await.unwrap();
        assert!(allowed);
    }

    #[test]
    fn system_role_rejects_mutation() {
        let err = assert_role_mutable("admin", true).unwrap_err();
        assert!(matches!(err, RbacError::SystemRoleImmutable { .. }));
        assert!(assert_role_mutable("custom", false).is_ok());
    }
}
