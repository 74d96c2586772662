//! Axum middleware: session authentication, CSRF, and rate limiting.
//!
//! Extract a header, authenticate, stash the result as a request extension,
//! and let routes read it via `Extension<T>`. RBAC itself is NOT a
//! middleware layer here; it's a single call at the top of each handler
//! body (see `routes/`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use dplaneos_core::auth::verify_csrf;
use dplaneos_store::{Session, SessionKind};

use crate::error::AppError;
use crate::state::AppState;

/// Identity attached to a request once authentication succeeds, whether via
/// session cookie/header or bearer API token. `session` is `None` for the
/// latter — an API token has no session row, only a user id and scope.
#[derive(Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub session: Option<Session>,
    pub token_scope: Option<String>,
}

const SESSION_HEADER: &str = "x-session-token";
const CSRF_HEADER: &str = "x-csrf-token";
const API_TOKEN_PREFIX: &str = "dpl_";

const STATE_CHANGING_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

/// Looks up a session and fails closed: a missing/expired session and a
/// storage error underneath the lookup are indistinguishable to the
/// caller, both surfacing as a plain 401 rather than leaking a 500 that
/// would tell an attacker the difference between "no session" and
/// "database is unhappy".
async fn authenticate_session_fail_closed(state: &AppState, token: &str) -> Result<Session, AppError> {
    dplaneos_core::auth::authenticate_session(&state.pool, token)
        .await
        .map_err(|_| AppError::Unauthenticated)
}

/// Same fail-closed treatment as [`authenticate_session_fail_closed`], for
/// the bearer API token path.
async fn authenticate_api_token_fail_closed(state: &AppState, token: &str) -> Result<AuthContext, AppError> {
    let record = dplaneos_core::auth::authenticate_api_token(&state.pool, token)
        .await
        .map_err(|_| AppError::Unauthenticated)?;
    Ok(AuthContext { user_id: record.user_id, session: None, token_scope: Some(record.scope) })
}

fn bearer_token(request: &Request<axum::body::Body>) -> Option<&str> {
    let header = request.headers().get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    token.starts_with(API_TOKEN_PREFIX).then_some(token)
}

/// Authenticates every request under the nest this layer wraps. Pending-
/// TOTP sessions are rejected here except for the one route that promotes
/// them — that route is mounted outside this middleware's nest instead of
/// being special-cased inline, keeping this function a single uniform gate.
///
/// Two credential forms are accepted: a session token in `x-session-token`
/// (cookie-adjacent, CSRF-checked on state-changing methods) or a bearer API
/// token in `Authorization`. A bearer token has no CSRF exposure — it's never
/// sent implicitly by a browser — so the CSRF check only applies to the
/// session path.
pub async fn session_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(token) = bearer_token(&request) {
        let ctx = authenticate_api_token_fail_closed(&state, token).await?;
        request.extensions_mut().insert(ctx);
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthenticated)?
        .to_string();

    let session = authenticate_session_fail_closed(&state, &token).await?;

    if matches!(session.kind.as_str(), "pending_totp") {
        return Err(AppError::Unauthenticated);
    }

    if STATE_CHANGING_METHODS.contains(&request.method().as_str()) {
        let csrf = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Forbidden("missing csrf token".to_string()))?;
        verify_csrf(&session, csrf)?;
    }

    request
        .extensions_mut()
        .insert(AuthContext { user_id: session.user_id.clone(), session: Some(session), token_scope: None });
    Ok(next.run(request).await)
}

/// Separate gate for the TOTP-verification route: accepts only
/// `PendingTotp` sessions, the mirror image of [`session_auth`].
pub async fn pending_totp_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthenticated)?
        .to_string();

    let session = authenticate_session_fail_closed(&state, &token).await?;
    if session.kind.as_str() != SessionKind::PendingTotp.as_str() {
        return Err(AppError::Unauthenticated);
    }

    request
        .extensions_mut()
        .insert(AuthContext { user_id: session.user_id.clone(), session: Some(session), token_scope: None });
    Ok(next.run(request).await)
}

/// Per-IP rate limiting, applied ahead of authentication so anonymous
/// flooding (including the login endpoint itself) is bounded too.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let key = addr.ip().to_string();
    let limiter = if request.uri().path().starts_with("/api/auth/login") {
        &state.login_limiter
    } else {
        &state.general_limiter
    };
    limiter.check(&key).await?;
    Ok(next.run(request).await)
}
