//! Server configuration for the D-PlaneOS control-plane daemon.
//!
//! Loaded from environment variables with sensible local defaults, all
//! namespaced under a `D_PLANEOS_*` prefix.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener to. Loopback-only by
    /// default — the reverse proxy terminating TLS is expected to run on
    /// the same host.
    pub bind_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory `VACUUM INTO` backups are written to.
    pub backup_path: PathBuf,
    /// Directory holding declarative configuration artifacts
    /// (expected-pools file, SMB include fragment, etc.).
    pub config_dir: PathBuf,
    /// Path to the generated `smb.conf` include fragment.
    pub smb_conf_path: PathBuf,
    /// Log level filter (e.g. `info`, `debug`, `warn`).
    pub log_level: String,
    /// Heartbeat poll interval for the boot gate (C7), in seconds.
    pub heartbeat_interval_secs: u64,
    /// Background monitor tick interval, in seconds.
    pub monitor_interval_secs: u64,
    /// Notifier webhook token for external alert delivery, if configured.
    pub notifier_token: Option<String>,
    /// Pools declared at startup for the boot gate (C7) to track.
    pub declared_pools: Vec<String>,
    /// Directory external hooks drop `zfs-event-<epoch>.json` files into.
    pub drop_dir: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `D_PLANEOS_BIND_ADDR` — full bind address (default: `127.0.0.1:8900`)
    /// - `D_PLANEOS_DB` — path to the SQLite database (default: `./data/d-planeos.db`)
    /// - `D_PLANEOS_BACKUP_PATH` — directory for `VACUUM INTO` backups (default: `./data/backups`)
    /// - `D_PLANEOS_CONFIG_DIR` — directory for declarative config artifacts (default: `./data/config`)
    /// - `D_PLANEOS_SMB_CONF` — path to the generated SMB include fragment (default: `<config_dir>/smb-shares.conf`)
    /// - `D_PLANEOS_LOG_LEVEL` — log filter (default: `info`)
    /// - `D_PLANEOS_HEARTBEAT_INTERVAL` — seconds between pool heartbeats (default: `30`)
    /// - `D_PLANEOS_MONITOR_INTERVAL` — seconds between background monitor ticks (default: `300`)
    /// - `D_PLANEOS_NOTIFIER_TOKEN` — webhook token for external alert delivery (optional)
    /// - `D_PLANEOS_POOLS` — comma-separated pool names for the boot gate to track (default: none)
    /// - `D_PLANEOS_DROP_DIR` — directory watched for external `zfs-event-*.json` files (default: `<config_dir>/drop`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("D_PLANEOS_BIND_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8900)));

        let db_path = std::env::var("D_PLANEOS_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/d-planeos.db"));

        let config_dir = std::env::var("D_PLANEOS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/config"));

        let backup_path = std::env::var("D_PLANEOS_BACKUP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/backups"));

        let smb_conf_path = std::env::var("D_PLANEOS_SMB_CONF")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir.join("smb-shares.conf"));

        let log_level = std::env::var("D_PLANEOS_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let heartbeat_interval_secs = std::env::var("D_PLANEOS_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let monitor_interval_secs = std::env::var("D_PLANEOS_MONITOR_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        let notifier_token = std::env::var("D_PLANEOS_NOTIFIER_TOKEN").ok();

        let declared_pools = std::env::var("D_PLANEOS_POOLS")
            .ok()
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let drop_dir =
            std::env::var("D_PLANEOS_DROP_DIR").map(PathBuf::from).unwrap_or_else(|_| config_dir.join("drop"));

        Self {
            bind_addr,
            db_path,
            backup_path,
            config_dir,
            smb_conf_path,
            log_level,
            heartbeat_interval_secs,
            monitor_interval_secs,
            notifier_token,
            declared_pools,
            drop_dir,
        }
    }
}
