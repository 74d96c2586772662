//! Identity routes: `/api/auth/*`.
//!
//! Split into three routers because they carry different auth
//! requirements: [`public_router`] (no session at all), [`pending_router`]
//! (a `PendingTotp` session only), and [`router`] (a normal active
//! session). `main.rs` wires each under its own middleware stack.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use dplaneos_core::audit::AuditRecord;
use dplaneos_core::auth;

use super::ok;
use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn public_router() -> Router<Arc<AppState>> {
    Router::new().route("/login", post(login)).route("/logout", post(logout))
}

pub fn pending_router() -> Router<Arc<AppState>> {
    Router::new().route("/totp/verify", post(totp_verify))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/check", get(check))
        .route("/session", get(session_info))
        .route("/change-password", post(change_password))
        .route("/tokens", post(create_api_token))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    session_id: String,
    csrf_token: String,
    totp_required: bool,
    must_change_password: bool,
}

async fn login(
    State(state): State<Arc<AppState>>,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<std::net::SocketAddr>,
    axum::Json(body): axum::Json<LoginRequest>,
) -> Result<axum::Json<super::Envelope<LoginResponse>>, AppError> {
    let client_ip = addr.ip().to_string();
    let result = auth::login(&state.pool, &body.username, &body.password, Some(&client_ip)).await;

    if result.is_ok() {
        state.login_limiter.record_success(&client_ip).await;
    } else {
        state.login_limiter.record_failure(&client_ip).await;
    }

    let outcome = if result.is_ok() { "success" } else { "failure" };
    let _ = state
        .audit
        .record(AuditRecord {
            actor: Some(body.username.clone()),
            source_ip: Some(client_ip),
            action: "auth.login".to_string(),
            resource: None,
            outcome: outcome.to_string(),
            detail: None,
        })
        .await;

    let issued = result?;
    Ok(ok(LoginResponse {
        session_id: issued.token,
        csrf_token: issued.csrf_token,
        totp_required: issued.kind == dplaneos_store::SessionKind::PendingTotp,
        must_change_password: issued.must_change_password,
    }))
}

#[derive(Debug, Deserialize)]
struct TotpVerifyRequest {
    code: String,
}

async fn totp_verify(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<TotpVerifyRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    // This route is only reachable through `pending_totp_auth`, which always
    // populates a session — an API token never lands here.
    let session = ctx.session.ok_or(AppError::Unauthenticated)?;
    auth::verify_totp(&state.pool, &session, &body.code).await?;
    Ok(ok(serde_json::json!({ "verified": true })))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    if let Some(session) = &ctx.session {
        sqlx::query("DELETE FROM sessions WHERE id = ?").bind(&session.id).execute(&state.pool).await?;
    }
    Ok(ok(serde_json::json!({ "logged_out": true })))
}

async fn check(Extension(ctx): Extension<AuthContext>) -> axum::Json<super::Envelope<serde_json::Value>> {
    ok(serde_json::json!({ "user_id": ctx.user_id }))
}

async fn session_info(
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<dplaneos_store::Session>>, AppError> {
    // A bearer-token caller has no session row to report; this endpoint is
    // only meaningful for the cookie/header session path.
    let session = ctx.session.ok_or_else(|| AppError::BadRequest("no session for bearer token".to_string()))?;
    Ok(ok(session))
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<ChangePasswordRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    let user: Option<dplaneos_store::User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&ctx.user_id)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or_else(|| AppError::NotFound("user not found".to_string()))?;

    if !bcrypt::verify(&body.current_password, &user.password_hash).unwrap_or(false) {
        return Err(AppError::Forbidden("current password incorrect".to_string()));
    }

    let new_hash = bcrypt::hash(&body.new_password, bcrypt::DEFAULT_COST)
        .map_err(|err| AppError::Internal(err.to_string()))?;
    sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
        .bind(new_hash)
        .bind(chrono::Utc::now())
        .bind(&ctx.user_id)
        .execute(&state.pool)
        .await?;
    Ok(ok(serde_json::json!({ "changed": true })))
}

#[derive(Debug, Deserialize)]
struct CreateApiTokenRequest {
    scope: String,
}

#[derive(Debug, Serialize)]
struct ApiTokenResponse {
    token: String,
}

async fn create_api_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<CreateApiTokenRequest>,
) -> Result<axum::Json<super::Envelope<ApiTokenResponse>>, AppError> {
    let token = auth::create_api_token(&state.pool, &ctx.user_id, &body.scope).await?;
    Ok(ok(ApiTokenResponse { token }))
}
