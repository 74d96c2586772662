//! Operations routes: `/api/system/*`.

use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use dplaneos_core::audit;
use dplaneos_core::rbac;

use super::ok;
use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/preflight", get(preflight))
        .route("/audit/verify-chain", get(verify_chain))
        .route("/audit/rotate", post(rotate_audit))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "read").await?;
    Ok(ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "bind_addr": state.config.bind_addr.to_string(),
    })))
}

async fn preflight(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "system", "read").await?;
    let integrity_ok = dplaneos_store::integrity_check(&state.pool).await.is_ok();
    Ok(ok(serde_json::json!({ "database_integrity_ok": integrity_ok })))
}

#[derive(Debug, Deserialize)]
struct VerifyChainQuery {
    from_id: i64,
    to_id: i64,
}

async fn verify_chain(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<VerifyChainQuery>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "audit", "read").await?;
    let broken_at = audit::verify_chain(&state.pool, &state.audit_hmac_key, query.from_id, query.to_id).await?;
    Ok(ok(serde_json::json!({ "intact": broken_at.is_none(), "broken_at": broken_at })))
}

async fn rotate_audit(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "audit", "write").await?;
    let dest = state.config.backup_path.join(format!("audit-{}.db", chrono::Utc::now().format("%Y%m%dT%H%M%SZ")));
    dplaneos_store::backup_into(&state.pool, &dest).await?;
    Ok(ok(serde_json::json!({ "rotated_to": dest.display().to_string() })))
}
