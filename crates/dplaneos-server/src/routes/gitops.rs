//! Declarative reconciler routes: `/api/gitops/*`.
//!
//! `state` reads/writes the single versioned desired-state document;
//! `plan`/`approve`/`apply` drive the C11 plan lifecycle. Step generation
//! (diffing the document against live system state) is out of this
//! handler's scope — callers supply the step list already computed, since
//! that diff needs ZFS/network knowledge the reconciler core doesn't have.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use dplaneos_core::audit::AuditRecord;
use dplaneos_core::rbac;
use dplaneos_core::reconcile::{self, Plan, PlanStep};
use dplaneos_store::DesiredState;

use super::ok;
use crate::error::AppError;
use crate::events::EventLevel;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/state", get(get_state).put(put_state))
        .route("/plan", post(create_plan))
        .route("/approve", post(approve_plan))
        .route("/apply", post(apply_plan))
}

async fn get_state(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<DesiredState>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "read").await?;
    let desired: DesiredState =
        sqlx::query_as("SELECT * FROM desired_state WHERE id = 1").fetch_one(&state.pool).await?;
    Ok(ok(desired))
}

#[derive(Debug, Deserialize)]
struct PutStateRequest {
    document: serde_json::Value,
}

async fn put_state(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<PutStateRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "write").await?;
    let document = serde_json::to_string(&body.document).map_err(|err| AppError::BadRequest(err.to_string()))?;
    sqlx::query("UPDATE desired_state SET document = ?, version = version + 1, updated_at = ? WHERE id = 1")
        .bind(document)
        .bind(chrono::Utc::now())
        .execute(&state.pool)
        .await?;
    Ok(ok(serde_json::json!({ "updated": true })))
}

#[derive(Debug, Deserialize)]
struct PlanRequest {
    steps: Vec<PlanStep>,
}

async fn create_plan(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<PlanRequest>,
) -> Result<axum::Json<super::Envelope<Plan>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "write").await?;
    let desired: DesiredState =
        sqlx::query_as("SELECT * FROM desired_state WHERE id = 1").fetch_one(&state.pool).await?;
    let document: serde_json::Value =
        serde_json::from_str(&desired.document).unwrap_or(serde_json::Value::Object(Default::default()));

    let plan = reconcile::plan(&document, body.steps, desired.version)?;
    reconcile::save_plan(&state.pool, &plan).await?;
    Ok(ok(plan))
}

#[derive(Debug, Deserialize)]
struct PlanIdRequest {
    plan_id: String,
}

async fn approve_plan(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<PlanIdRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "write").await?;
    reconcile::approve_plan(&state.pool, &body.plan_id).await?;
    Ok(ok(serde_json::json!({ "approved": body.plan_id })))
}

async fn apply_plan(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<PlanIdRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "write").await?;
    reconcile::assert_applyable(&state.pool, &body.plan_id).await?;

    let row: (String,) =
        sqlx::query_as("SELECT steps FROM reconcile_plans WHERE id = ?").bind(&body.plan_id).fetch_one(&state.pool).await?;
    let steps: Vec<PlanStep> =
        serde_json::from_str(&row.0).map_err(|err| AppError::Internal(err.to_string()))?;

    // Steps were ordered by dependency rank at plan time; run them in that
    // order and stop at the first failure rather than leaving the system in
    // a state further from convergence than where it started.
    for step in &steps {
        let result = state.commands.run(&step.command, &step.args, false).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        let _ = state
            .audit
            .record(AuditRecord {
                actor: Some(ctx.user_id.clone()),
                source_ip: None,
                action: "gitops.step".to_string(),
                resource: Some(step.description.clone()),
                outcome: outcome.to_string(),
                detail: result.as_ref().err().map(ToString::to_string),
            })
            .await;

        if let Err(err) = result {
            sqlx::query("UPDATE reconcile_plans SET status = 'failed' WHERE id = ?")
                .bind(&body.plan_id)
                .execute(&state.pool)
                .await?;
            return Err(err.into());
        }
    }

    sqlx::query("UPDATE reconcile_plans SET status = 'applied', applied_at = ? WHERE id = ?")
        .bind(chrono::Utc::now())
        .bind(&body.plan_id)
        .execute(&state.pool)
        .await?;

    state
        .events
        .publish("gitops.applied", EventLevel::Info, serde_json::json!({ "plan_id": body.plan_id, "steps": steps.len() }));
    Ok(ok(serde_json::json!({ "applied": body.plan_id, "steps": steps.len() })))
}
