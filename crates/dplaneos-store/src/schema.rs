use sqlx::SqlitePool;

use crate::error::StoreError;

/// Creates every table if missing and applies additive column migrations.
///
/// Migrations are `ALTER TABLE ... ADD COLUMN` statements; a duplicate-column
/// error means a prior run already applied it, so it's swallowed rather than
/// propagated. Nothing here ever drops or renames a column.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT,
            password_hash TEXT NOT NULL,
            totp_secret TEXT,
            totp_enabled INTEGER NOT NULL DEFAULT 0,
            backup_codes TEXT,
            disabled INTEGER NOT NULL DEFAULT 0,
            must_change_password INTEGER NOT NULL DEFAULT 0,
            source TEXT NOT NULL DEFAULT 'local',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            token_hash TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL DEFAULT 'active',
            csrf_secret TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            absolute_expires_at TEXT NOT NULL,
            client_ip TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS roles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_system INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS permissions (
            id TEXT PRIMARY KEY,
            resource TEXT NOT NULL,
            action TEXT NOT NULL,
            UNIQUE(resource, action)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS role_permissions (
            role_id TEXT NOT NULL REFERENCES roles(id),
            permission_id TEXT NOT NULL REFERENCES permissions(id),
            PRIMARY KEY (role_id, permission_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_roles (
            user_id TEXT NOT NULL REFERENCES users(id),
            role_id TEXT NOT NULL REFERENCES roles(id),
            expires_at TEXT,
            PRIMARY KEY (user_id, role_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            occurred_at TEXT NOT NULL,
            actor TEXT,
            source_ip TEXT,
            action TEXT NOT NULL,
            resource TEXT,
            outcome TEXT NOT NULL,
            detail TEXT,
            prev_hash TEXT NOT NULL,
            row_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS directory_configs (
            dataset TEXT PRIMARY KEY,
            owner_uid INTEGER NOT NULL,
            owner_gid INTEGER NOT NULL,
            mode TEXT NOT NULL,
            quota_bytes INTEGER,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS share_definitions (
            name TEXT PRIMARY KEY,
            dataset TEXT NOT NULL,
            protocol TEXT NOT NULL,
            options TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot_schedules (
            id TEXT PRIMARY KEY,
            dataset TEXT NOT NULL,
            cron_expr TEXT NOT NULL,
            retention_count INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS integration_configs (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS desired_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL DEFAULT 0,
            document TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconcile_plans (
            id TEXT PRIMARY KEY,
            desired_state_version INTEGER NOT NULL,
            steps TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            requires_approval INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            applied_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_tokens (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            token_hash TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT,
            revoked INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    apply_additive_migrations(pool).await?;
    Ok(())
}

/// Best-effort `ALTER TABLE ADD COLUMN` batch for columns introduced after
/// a table's initial `CREATE`. SQLite has no `ADD COLUMN IF NOT EXISTS`, so
/// duplicate-column errors are the expected steady-state outcome here.
async fn apply_additive_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    let statements = [
        "ALTER TABLE sessions ADD COLUMN user_agent TEXT",
    ];
    for stmt in statements {
        if let Err(err) = sqlx::query(stmt).execute(pool).await {
            let msg = err.to_string();
            if !msg.contains("duplicate column name") {
                return Err(StoreError::Migration(msg));
            }
        }
    }
    Ok(())
}
