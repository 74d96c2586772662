//! Storage routes: `/api/zfs/*`.
//!
//! Pool/dataset/snapshot reads go straight through the command executor;
//! snapshot creation and rollback are audited. Argument validation against
//! shell metacharacters happens inside `dplaneos_core::command` — this
//! layer only does RBAC and shape-of-request checks.

use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use dplaneos_core::audit::AuditRecord;
use dplaneos_core::rbac;

use super::ok;
use crate::error::AppError;
use crate::events::EventLevel;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pools", get(list_pools))
        .route("/datasets", get(list_datasets))
        .route("/snapshots", post(create_snapshot).delete(delete_snapshot))
        .route("/snapshots/rollback", post(rollback_snapshot))
        .route("/health", get(pool_health))
}

async fn list_pools(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<Vec<String>>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "pools", "read").await?;
    Ok(ok(state.boot_gate.declared_pools().await))
}

#[derive(Debug, Deserialize)]
struct DatasetQuery {
    pool: String,
}

async fn list_datasets(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<DatasetQuery>,
) -> Result<axum::Json<super::Envelope<String>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "pools", "read").await?;
    let output = state.commands.run("zfs-list", &[query.pool], false).await?;
    Ok(ok(output.stdout))
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    dataset: String,
    label: String,
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<SnapshotRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "pools", "write").await?;
    let snapshot = format!("{}@{}", body.dataset, body.label);
    let result = state.commands.run("zfs-snapshot", &[snapshot.clone()], false).await;

    let outcome = if result.is_ok() { "success" } else { "failure" };
    let _ = state
        .audit
        .record(AuditRecord {
            actor: Some(ctx.user_id.clone()),
            source_ip: None,
            action: "zfs.snapshot.create".to_string(),
            resource: Some(snapshot.clone()),
            outcome: outcome.to_string(),
            detail: None,
        })
        .await;

    result?;
    state.events.publish(
        "zfs.event",
        EventLevel::Info,
        serde_json::json!({ "kind": "snapshot_created", "snapshot": snapshot }),
    );
    Ok(ok(serde_json::json!({ "snapshot": snapshot })))
}

#[derive(Debug, Deserialize)]
struct SnapshotNameQuery {
    name: String,
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<SnapshotNameQuery>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "pools", "write").await?;
    let _ = state.commands.run("zfs-destroy", &[query.name.clone()], false).await;
    let _ = state
        .audit
        .record(AuditRecord {
            actor: Some(ctx.user_id),
            source_ip: None,
            action: "zfs.snapshot.delete".to_string(),
            resource: Some(query.name.clone()),
            outcome: "success".to_string(),
            detail: None,
        })
        .await;
    Ok(ok(serde_json::json!({ "deleted": query.name })))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    snapshot: String,
}

async fn rollback_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<RollbackRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "pools", "write").await?;
    state.commands.run("zfs-rollback", &[body.snapshot.clone()], false).await?;
    Ok(ok(serde_json::json!({ "rolled_back_to": body.snapshot })))
}

async fn pool_health(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<DatasetQuery>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "pools", "read").await?;
    let state_snapshot = state.boot_gate.state_of(&query.pool).await;
    Ok(ok(serde_json::json!({ "pool": query.pool, "state": format!("{state_snapshot:?}") })))
}
