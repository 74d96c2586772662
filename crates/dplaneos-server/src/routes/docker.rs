//! Container lifecycle routes: `/api/docker/*`.
//!
//! `update` is the one route that goes through the atomic mutator (C8):
//! a snapshot of the backing dataset is taken, the new image is applied,
//! and a failed health check rolls the dataset back before reporting the
//! failure to the caller.

use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::routing::{get, post};
use axum::Router;
use async_trait::async_trait;
use serde::Deserialize;

use dplaneos_core::command::CommandExecutor;
use dplaneos_core::mutator::{snapshot_mutate_commit, Mutation, MutationReport};
use dplaneos_core::rbac;
use dplaneos_core::error::MutatorError;

use super::ok;
use crate::error::AppError;
use crate::events::EventLevel;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/containers", get(list_containers))
        .route("/action", post(container_action))
        .route("/update", post(update_container))
}

#[derive(Debug, Deserialize)]
struct ContainerQuery {
    container: String,
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ContainerQuery>,
) -> Result<axum::Json<super::Envelope<String>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "containers", "read").await?;
    let output = state.commands.run("container-inspect", &[query.container], false).await?;
    Ok(ok(output.stdout))
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    container: String,
    action: String,
}

async fn container_action(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<ActionRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "containers", "write").await?;
    if body.action != "restart" {
        return Err(AppError::BadRequest(format!("unsupported action: {}", body.action)));
    }
    state.commands.run("container-restart", &[body.container.clone()], false).await?;
    state.events.publish(
        "docker.state",
        EventLevel::Info,
        serde_json::json!({ "container": body.container, "action": body.action }),
    );
    Ok(ok(serde_json::json!({ "restarted": body.container })))
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    container: String,
    dataset: String,
}

/// Snapshots the container's backing dataset, restarts it (standing in for
/// the image swap an external compose/orchestration step performs), then
/// confirms the container is actually running before committing.
struct ContainerUpdate {
    commands: Arc<CommandExecutor>,
    container: String,
    dataset: String,
}

#[async_trait]
impl Mutation for ContainerUpdate {
    async fn snapshot(&self) -> Result<String, MutatorError> {
        let label = format!("{}@pre-update-{}", self.dataset, uuid::Uuid::new_v4());
        self.commands.run("zfs-snapshot", &[label.clone()], false).await?;
        Ok(label)
    }

    async fn apply(&self) -> Result<(), MutatorError> {
        self.commands.run("container-restart", &[self.container.clone()], false).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, MutatorError> {
        let output = self.commands.run("container-inspect", &[self.container.clone()], false).await?;
        Ok(output.stdout.contains("\"Running\":true") || output.stdout.contains("running"))
    }

    async fn rollback(&self, snapshot_id: &str) -> Result<(), MutatorError> {
        self.commands.run("zfs-rollback", &[snapshot_id.to_string()], false).await?;
        Ok(())
    }
}

async fn update_container(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<UpdateRequest>,
) -> Result<axum::Json<super::Envelope<MutationReportBody>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "containers", "write").await?;

    let mutation =
        ContainerUpdate { commands: Arc::clone(&state.commands), container: body.container, dataset: body.dataset };
    let report = snapshot_mutate_commit(&mutation).await;

    let (outcome, response) = match &report {
        Ok(report) => {
            ("success", MutationReportBody { committed: report.committed, rollback_snapshot: None })
        }
        Err(err) => {
            ("failure", MutationReportBody { committed: false, rollback_snapshot: Some(err.to_string()) })
        }
    };

    let _ = state
        .audit
        .record(dplaneos_core::audit::AuditRecord {
            actor: Some(ctx.user_id),
            source_ip: None,
            action: "docker.update".to_string(),
            resource: Some(mutation.container.clone()),
            outcome: outcome.to_string(),
            detail: None,
        })
        .await;

    report?;
    Ok(ok(response))
}

#[derive(Debug, serde::Serialize)]
struct MutationReportBody {
    committed: bool,
    rollback_snapshot: Option<String>,
}
