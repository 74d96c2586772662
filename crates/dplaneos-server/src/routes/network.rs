//! Two-phase network routes: `/api/network/*`.
//!
//! `apply` stages an interface address change through the atomic mutator
//! (C8) the same way `docker::update_container` does, then opens a bounded
//! 120s confirm window watched by a spawned task. `confirm` is the
//! health-check acknowledgement a caller sends once it has verified
//! connectivity survived the change from its own vantage point, guarding
//! against a change that looks healthy to the daemon's own health check but
//! actually severed the path the caller used to reach it. An unconfirmed
//! change is automatically reverted when the window elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Extension, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, warn};

use dplaneos_core::audit::{AuditRecord, AuditSink};
use dplaneos_core::command::CommandExecutor;
use dplaneos_core::error::MutatorError;
use dplaneos_core::mutator::{snapshot_mutate_commit, Mutation};
use dplaneos_core::rbac;

use super::ok;
use crate::error::AppError;
use crate::events::{EventHub, EventLevel};
use crate::middleware::AuthContext;
use crate::state::AppState;

/// How long an applied-but-unconfirmed network change is allowed to stand
/// before the watchdog reverts it automatically.
const CONFIRM_WINDOW: Duration = Duration::from_secs(120);

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/interfaces", get(list_interfaces))
        .route("/apply", post(apply_network_change))
        .route("/confirm", post(confirm_network_change))
}

async fn list_interfaces(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "network", "read").await?;
    Ok(ok(serde_json::json!({ "interfaces": [] })))
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    interface: String,
    address: String,
    description: String,
}

struct NetworkChange {
    commands: Arc<CommandExecutor>,
    interface: String,
    address: String,
    description: String,
}

#[async_trait]
impl Mutation for NetworkChange {
    async fn snapshot(&self) -> Result<String, MutatorError> {
        let output = self.commands.run("net-addr-show", &[self.interface.clone()], true).await?;
        Ok(output.stdout)
    }

    async fn apply(&self) -> Result<(), MutatorError> {
        tracing::info!(interface = %self.interface, change = %self.description, "applying staged network change");
        self.commands.run("net-addr-set", &[self.interface.clone(), self.address.clone()], false).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, MutatorError> {
        // The caller's own `confirm` call is the real health signal for a
        // network change; this check only catches an immediate failure
        // (address never took) before handing control back.
        let output = self.commands.run("net-addr-show", &[self.interface.clone()], true).await?;
        Ok(output.stdout.contains(&self.address))
    }

    async fn rollback(&self, snapshot_id: &str) -> Result<(), MutatorError> {
        tracing::warn!(interface = %self.interface, "reverting staged network change");
        self.commands.run("net-addr-set", &[self.interface.clone(), snapshot_id.to_string()], false).await?;
        Ok(())
    }
}

/// One change staged past `apply` and awaiting `confirm` or expiry.
struct PendingChange {
    interface: String,
    previous_address: String,
    cancel: oneshot::Sender<()>,
}

/// Tracks network changes that have been applied but not yet confirmed,
/// keyed by snapshot id, so `confirm` can cancel the matching auto-revert
/// watchdog.
#[derive(Default)]
pub struct NetworkChangeRegistry {
    pending: Mutex<HashMap<String, PendingChange>>,
}

impl NetworkChangeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, snapshot_id: String, interface: String, previous_address: String, cancel: oneshot::Sender<()>) {
        self.pending.lock().await.insert(snapshot_id, PendingChange { interface, previous_address, cancel });
    }

    /// Removes and fires the cancel signal for a pending change, returning
    /// whether one was found. Used by `confirm`.
    async fn confirm(&self, snapshot_id: &str) -> bool {
        match self.pending.lock().await.remove(snapshot_id) {
            Some(pending) => {
                let _ = pending.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Removes a pending change unconditionally, for the watchdog to call
    /// once the confirm window has elapsed. Returns `None` if `confirm`
    /// already raced it to removal.
    async fn expire(&self, snapshot_id: &str) -> Option<(String, String)> {
        self.pending.lock().await.remove(snapshot_id).map(|p| (p.interface, p.previous_address))
    }
}

async fn apply_network_change(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<ApplyRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "network", "write").await?;
    let mutation = NetworkChange {
        commands: Arc::clone(&state.commands),
        interface: body.interface.clone(),
        address: body.address.clone(),
        description: body.description.clone(),
    };
    let report = snapshot_mutate_commit(&mutation).await?;

    if report.committed {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        state
            .network_changes
            .insert(report.snapshot_id.clone(), body.interface.clone(), report.snapshot_id.clone(), cancel_tx)
            .await;

        tokio::spawn(watch_confirm_window(
            Arc::clone(&state.network_changes),
            Arc::clone(&state.commands),
            state.audit.clone(),
            Arc::clone(&state.events),
            report.snapshot_id.clone(),
            cancel_rx,
        ));
    }

    Ok(ok(serde_json::json!({ "snapshot_id": report.snapshot_id, "committed": report.committed })))
}

/// Races the confirm window against the caller's `confirm` signal. On
/// timeout, reverts the interface to its pre-change address and records the
/// auto-revert to the audit chain.
async fn watch_confirm_window(
    registry: Arc<NetworkChangeRegistry>,
    commands: Arc<CommandExecutor>,
    audit: AuditSink,
    events: Arc<EventHub>,
    snapshot_id: String,
    cancel: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = tokio::time::sleep(CONFIRM_WINDOW) => {
            let Some((interface, previous_address)) = registry.expire(&snapshot_id).await else {
                return;
            };
            warn!(interface, snapshot = %snapshot_id, "network change confirm window elapsed, auto-reverting");
            let result = commands.run("net-addr-set", &[interface.clone(), previous_address], false).await;
            let outcome = if result.is_ok() { "success" } else { "failure" };
            if let Err(err) = &result {
                error!(interface, error = %err, "auto-revert of unconfirmed network change failed");
            }
            let _ = audit
                .record(AuditRecord {
                    actor: None,
                    source_ip: None,
                    action: "network.auto_revert".to_string(),
                    resource: Some(interface.clone()),
                    outcome: outcome.to_string(),
                    detail: None,
                })
                .await;
            events.publish(
                "network.auto_reverted",
                EventLevel::Warning,
                serde_json::json!({ "interface": interface, "snapshot_id": snapshot_id }),
            );
        }
        _ = cancel => {}
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    snapshot_id: String,
}

async fn confirm_network_change(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    axum::Json(body): axum::Json<ConfirmRequest>,
) -> Result<axum::Json<super::Envelope<serde_json::Value>>, AppError> {
    rbac::require_permission(&state.pool, &ctx.user_id, "network", "write").await?;
    let confirmed = state.network_changes.confirm(&body.snapshot_id).await;
    state.events.publish(
        "network.confirmed",
        EventLevel::Info,
        serde_json::json!({ "snapshot_id": body.snapshot_id, "was_pending": confirmed }),
    );
    Ok(ok(serde_json::json!({ "confirmed": body.snapshot_id })))
}
