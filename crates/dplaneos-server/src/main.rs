//! D-PlaneOS daemon entry point.
//!
//! Bootstraps the store, audit chain, and every background worker, then
//! starts the Axum HTTP/WebSocket server with graceful shutdown. One
//! `watch::channel` is cloned into each spawned task and the server's own
//! graceful-shutdown future, fanning a single shutdown signal out to every
//! worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use dplaneos_core::audit::AuditChain;
use dplaneos_core::command::CommandExecutor;
use dplaneos_core::rate_limit::RateLimiter;

use dplaneos_server::bootgate::{BootGate, PoolProbe};
use dplaneos_server::config::ServerConfig;
use dplaneos_server::events::EventHub;
use dplaneos_server::hardening;
use dplaneos_server::middleware::{pending_totp_auth, rate_limit, session_auth};
use dplaneos_server::monitors::{self, CapacitySource};
use dplaneos_server::routes;
use dplaneos_server::routes::network::NetworkChangeRegistry;
use dplaneos_server::state::AppState;

use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    apply_hardening();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(bind_addr = %config.bind_addr, "D-PlaneOS starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = build_app_state(&config, shutdown_rx.clone()).await?;

    let worker_handles = spawn_background_workers(&state, &config, shutdown_rx);

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "D-PlaneOS listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    for handle in worker_handles {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("D-PlaneOS stopped");
    Ok(())
}

async fn build_app_state(config: &ServerConfig, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Arc<AppState>> {
    let pool = dplaneos_store::bootstrap(&config.db_path).await.context("store bootstrap failed")?;
    let hmac_key = dplaneos_store::load_or_create_audit_key(&config.db_path.with_extension("audit-key"))
        .await
        .context("failed to load or create audit HMAC key")?;

    let (audit_sink, _audit_handle) = AuditChain::spawn(pool.clone(), hmac_key, shutdown_rx.clone());

    let boot_gate = Arc::new(BootGate::new(&config.config_dir));
    boot_gate.declare_pools(&config.declared_pools).await.context("failed to persist declared pools")?;

    let commands = Arc::new(CommandExecutor::new().with_audit(audit_sink.clone()));

    Ok(Arc::new(AppState {
        pool,
        audit: audit_sink,
        commands,
        general_limiter: Arc::new(RateLimiter::default_general()),
        login_limiter: Arc::new(RateLimiter::default_login()),
        events: Arc::new(EventHub::new()),
        boot_gate,
        audit_hmac_key: hmac_key,
        config: config.clone(),
        network_changes: Arc::new(NetworkChangeRegistry::new()),
    }))
}

/// Probes a pool via `zpool status` and reports healthy when the output
/// contains no line reporting a degraded or faulted vdev.
struct CommandPoolProbe {
    commands: Arc<CommandExecutor>,
}

#[async_trait]
impl PoolProbe for CommandPoolProbe {
    async fn probe(&self, pool: &str) -> bool {
        match self.commands.run("zpool-status", &[pool.to_string()], true).await {
            Ok(output) => !output.stdout.contains("DEGRADED") && !output.stdout.contains("FAULTED"),
            Err(err) => {
                warn!(pool, error = %err, "pool probe failed");
                false
            }
        }
    }
}

/// Reads used-percent out of `zpool status` capacity accounting. Parsing
/// is deliberately lenient — a malformed line yields `None` rather than a
/// spurious alert.
struct CommandCapacitySource {
    commands: Arc<CommandExecutor>,
}

#[async_trait]
impl CapacitySource for CommandCapacitySource {
    async fn used_percent(&self, pool: &str) -> Option<u8> {
        let output = self.commands.run("zpool-status", &[pool.to_string()], true).await.ok()?;
        output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix("capacity").map(str::trim))
            .and_then(|value| value.trim_end_matches('%').parse().ok())
    }
}

fn spawn_background_workers(
    state: &Arc<AppState>,
    config: &ServerConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    let probe = Arc::new(CommandPoolProbe { commands: Arc::clone(&state.commands) });
    handles.push(tokio::spawn(dplaneos_server::bootgate::heartbeat_worker(
        Arc::clone(&state.boot_gate),
        Arc::clone(&state.events),
        probe,
        Arc::clone(&state.commands),
        state.audit.clone(),
        config.heartbeat_interval_secs,
        shutdown_rx.clone(),
    )));

    // The declared pool set is fixed at startup; the sender is dropped
    // immediately after creating the receiver since nothing changes it
    // after boot, and a `watch::Receiver` keeps serving its last value
    // once its sender is gone.
    let capacity = Arc::new(CommandCapacitySource { commands: Arc::clone(&state.commands) }) as Arc<dyn CapacitySource>;
    let (_declared_tx, declared_rx) = watch::channel(config.declared_pools.clone());
    handles.push(tokio::spawn(monitors::capacity_guardian(
        capacity,
        Arc::new(declared_rx),
        Arc::clone(&state.events),
        shutdown_rx.clone(),
    )));

    handles.push(tokio::spawn(monitors::session_reaper(state.pool.clone(), shutdown_rx.clone())));
    handles.push(tokio::spawn(monitors::wal_checkpointer(state.pool.clone(), shutdown_rx.clone())));
    handles.push(tokio::spawn(monitors::backup_worker(
        state.pool.clone(),
        config.backup_path.clone(),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(dplaneos_server::events::drop_dir_watcher(
        config.drop_dir.clone(),
        Arc::clone(&state.events),
        shutdown_rx,
    )));

    handles
}

fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new().nest("/api/auth", routes::auth::public_router());

    let pending = Router::new()
        .nest("/api/auth", routes::auth::pending_router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), pending_totp_auth));

    let authenticated = Router::new()
        .nest("/api/auth", routes::auth::router())
        .nest("/api", routes::router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), session_auth));

    // Closed by default: no `allow_origin` means no cross-origin requests
    // are permitted at all. Add specific origins here if a future browser
    // client is ever served from a different origin than the API.
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-session-token"),
            axum::http::HeaderName::from_static("x-csrf-token"),
        ]);

    Router::new()
        .route("/health", axum::routing::get(health))
        .merge(public)
        .merge(pending)
        .merge(authenticated)
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Apply production hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening() {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }
    if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e}");
    }
}
