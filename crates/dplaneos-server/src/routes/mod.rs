//! HTTP route families (C12): one module per endpoint group named in the
//! representative endpoint table. Every handler validates its inputs,
//! gates on a single RBAC permission check, and returns the uniform
//! `{ok, data}` envelope — errors are handled uniformly by `AppError`'s
//! `IntoResponse` impl instead.

pub mod auth;
pub mod docker;
pub mod gitops;
pub mod network;
pub mod shares;
pub mod system;
pub mod ws;
pub mod zfs;

use std::sync::Arc;

use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { ok: true, data })
}

/// Routes reachable without a session: `/health` and friends live outside
/// this nest in `main.rs`; everything mounted here still goes through the
/// rate-limit and session-auth middleware layers applied by the caller,
/// except the handful of paths `auth::public_router` carves back out.
pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .nest("/zfs", zfs::router())
        .nest("/docker", docker::router())
        .nest("/shares", shares::router())
        .nest("/network", network::router())
        .nest("/gitops", gitops::router())
        .nest("/system", system::router())
        .nest("/ws", ws::router())
}
