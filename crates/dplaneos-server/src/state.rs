//! Shared application state for the D-PlaneOS server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use std::sync::Arc;

use sqlx::SqlitePool;

use dplaneos_core::audit::AuditSink;
use dplaneos_core::command::CommandExecutor;
use dplaneos_core::rate_limit::RateLimiter;

use crate::bootgate::BootGate;
use crate::config::ServerConfig;
use crate::events::EventHub;
use crate::routes::network::NetworkChangeRegistry;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub pool: SqlitePool,
    pub audit: AuditSink,
    pub commands: Arc<CommandExecutor>,
    pub general_limiter: Arc<RateLimiter>,
    pub login_limiter: Arc<RateLimiter>,
    pub events: Arc<EventHub>,
    pub boot_gate: Arc<BootGate>,
    pub audit_hmac_key: [u8; 32],
    pub config: ServerConfig,
    pub network_changes: Arc<NetworkChangeRegistry>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
