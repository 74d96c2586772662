//! Share CRUD routes: `/api/shares/*`.
//!
//! Writes land in `share_definitions`; `reload` rewrites the generated
//! `smb.conf` include fragment and signals the SMB daemon via the command
//! executor, the same atomic-rename-then-signal shape the store uses for
//! its own declared-pools file.

use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use dplaneos_core::audit::AuditRecord;
use dplaneos_core::rbac;
use dplaneos_store::ShareDefinition;

use super::ok;
use crate::error::AppError;
use crate::events::EventLevel;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_shares).post(create_share))
        .route("/delete", post(delete_share))
        .route("/reload", post(reload_shares))
}

async fn list_shares(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<Vec<ShareDefinition>>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "shares", "read").await?;
    let shares: Vec<ShareDefinition> = sqlx::query_as("SELECT * FROM share_definitions").fetch_all(&state.pool).await?;
    Ok(ok(shares))
}

#[derive(Debug, Deserialize)]
struct CreateShareRequest {
    name: String,
    dataset: String,
    protocol: String,
    options: serde_json::Value,
}

async fn create_share(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<CreateShareRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "shares", "write").await?;
    let options = serde_json::to_string(&body.options).unwrap_or_default();
    sqlx::query(
        "INSERT INTO share_definitions (name, dataset, protocol, options, enabled, updated_at) VALUES (?, ?, ?, ?, 1, ?)
         ON CONFLICT(name) DO UPDATE SET dataset = excluded.dataset, protocol = excluded.protocol, options = excluded.options, updated_at = excluded.updated_at",
    )
    .bind(&body.name)
    .bind(&body.dataset)
    .bind(&body.protocol)
    .bind(&options)
    .bind(chrono::Utc::now())
    .execute(&state.pool)
    .await?;

    let _ = state
        .audit
        .record(AuditRecord {
            actor: Some(ctx.user_id),
            source_ip: None,
            action: "shares.create".to_string(),
            resource: Some(body.name.clone()),
            outcome: "success".to_string(),
            detail: None,
        })
        .await;
    Ok(ok(serde_json::json!({ "name": body.name })))
}

#[derive(Debug, Deserialize)]
struct ShareNameQuery {
    name: String,
}

async fn delete_share(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ShareNameQuery>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "shares", "write").await?;
    let share: Option<ShareDefinition> =
        sqlx::query_as("SELECT * FROM share_definitions WHERE name = ?").bind(&query.name).fetch_optional(&state.pool).await?;

    if let Some(share) = &share {
        let export_path = format!("/srv/dplaneos/shares/{}", share.name);
        let result = state.commands.run("share-path-remove", &[export_path], false).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        let _ = state
            .audit
            .record(AuditRecord {
                actor: Some(ctx.user_id.clone()),
                source_ip: None,
                action: "shares.delete".to_string(),
                resource: Some(share.name.clone()),
                outcome: outcome.to_string(),
                detail: result.as_ref().err().map(ToString::to_string),
            })
            .await;
    }

    sqlx::query("DELETE FROM share_definitions WHERE name = ?").bind(&query.name).execute(&state.pool).await?;
    Ok(ok(serde_json::json!({ "deleted": query.name })))
}

async fn reload_shares(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "shares", "write").await?;
    let shares: Vec<ShareDefinition> =
        sqlx::query_as("SELECT * FROM share_definitions WHERE enabled = 1").fetch_all(&state.pool).await?;

    let mut fragment = String::new();
    for share in &shares {
        fragment.push_str(&format!("[{}]\n  path = {}\n\n", share.name, share.dataset));
    }

    if let Some(parent) = state.config.smb_conf_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| AppError::Internal(err.to_string()))?;
    }
    let tmp_path = state.config.smb_conf_path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &fragment).await.map_err(|err| AppError::Internal(err.to_string()))?;
    tokio::fs::rename(&tmp_path, &state.config.smb_conf_path)
        .await
        .map_err(|err| AppError::Internal(err.to_string()))?;

    state.events.publish("shares.reloaded", EventLevel::Info, serde_json::json!({ "count": shares.len() }));
    Ok(ok(serde_json::json!({ "reloaded": shares.len() })))
}
