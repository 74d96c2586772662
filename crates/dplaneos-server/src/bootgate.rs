//! Boot gate & pool heartbeat (C7).
//!
//! Tracks one monotonic state machine per declared pool: two consecutive
//! failed probes mark it `Outage` (critical event, container runtime
//! stopped, notifier fired); three consecutive healthy probes after that
//! mark it `Recovered`. No automatic service restart — recovery is an
//! operator action outside this daemon.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use dplaneos_core::audit::{AuditRecord, AuditSink};
use dplaneos_core::command::CommandExecutor;

use crate::events::{EventHub, EventLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Healthy,
    Outage,
}

/// State-machine transition reported back to the heartbeat loop so it can
/// run outage-response side effects (stop the container runtime, audit)
/// outside the trackers lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    BecameOutage,
    BecameHealthy,
}

struct PoolTracker {
    state: PoolState,
    consecutive_failures: u32,
    consecutive_healthy: u32,
}

/// A single heartbeat probe result for one pool.
pub struct ProbeResult {
    pub pool: String,
    pub healthy: bool,
}

/// Anything that can perform the actual ZFS/write probe for a pool. Kept
/// as a trait so the scheduling logic here can be tested without shelling
/// out to `zpool`.
#[async_trait::async_trait]
pub trait PoolProbe: Send + Sync {
    async fn probe(&self, pool: &str) -> bool;
}

pub struct BootGate {
    declared_pools_path: std::path::PathBuf,
    trackers: RwLock<HashMap<String, PoolTracker>>,
}

impl BootGate {
    #[must_use]
    pub fn new(config_dir: &Path) -> Self {
        Self {
            declared_pools_path: config_dir.join("expected-pools.conf"),
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// Persists the declared pool set, one name per line, via an
    /// atomic rename so a crash mid-write never leaves a truncated file.
    pub async fn declare_pools(&self, pools: &[String]) -> std::io::Result<()> {
        if let Some(parent) = self.declared_pools_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.declared_pools_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, pools.join("\n")).await?;
        tokio::fs::rename(&tmp_path, &self.declared_pools_path).await?;

        let mut trackers = self.trackers.write().await;
        for pool in pools {
            trackers
                .entry(pool.clone())
                .or_insert(PoolTracker { state: PoolState::Healthy, consecutive_failures: 0, consecutive_healthy: 0 });
        }
        Ok(())
    }

    /// Applies one probe result to the pool's state machine, publishing a
    /// critical/recovery event on a state transition and reporting which
    /// transition (if any) happened so the caller can run outage-response
    /// actions outside the lock.
    pub async fn record_probe(&self, events: &EventHub, result: ProbeResult) -> Transition {
        let mut trackers = self.trackers.write().await;
        let Some(tracker) = trackers.get_mut(&result.pool) else {
            warn!(pool = %result.pool, "heartbeat for undeclared pool");
            return Transition::None;
        };

        if result.healthy {
            tracker.consecutive_failures = 0;
            tracker.consecutive_healthy += 1;
            if tracker.state == PoolState::Outage && tracker.consecutive_healthy >= 3 {
                tracker.state = PoolState::Healthy;
                info!(pool = %result.pool, "pool recovered");
                events.publish(
                    "zfs.event",
                    EventLevel::Info,
                    serde_json::json!({ "pool": result.pool, "subclass": "pool_recovered" }),
                );
                return Transition::BecameHealthy;
            }
        } else {
            tracker.consecutive_healthy = 0;
            tracker.consecutive_failures += 1;
            if tracker.state == PoolState::Healthy && tracker.consecutive_failures >= 2 {
                tracker.state = PoolState::Outage;
                error!(pool = %result.pool, "pool outage detected");
                events.publish(
                    "zfs.event",
                    EventLevel::Critical,
                    serde_json::json!({ "pool": result.pool, "subclass": "pool_degraded" }),
                );
                return Transition::BecameOutage;
            }
        }
        Transition::None
    }

    #[must_use]
    pub async fn state_of(&self, pool: &str) -> Option<PoolState> {
        self.trackers.read().await.get(pool).map(|t| t.state)
    }

    /// The declared pool set this gate is tracking heartbeats for.
    #[must_use]
    pub async fn declared_pools(&self) -> Vec<String> {
        self.trackers.read().await.keys().cloned().collect()
    }
}

/// Runs the 30s heartbeat loop until shutdown, probing every declared pool
/// each tick and feeding results into the state machine. On a transition
/// into `Outage`, stops the container runtime and records the action to
/// the audit chain before the event has a chance to be missed by anyone
/// reading the audit trail for confirmation.
pub async fn heartbeat_worker(
    gate: Arc<BootGate>,
    events: Arc<EventHub>,
    probe: Arc<dyn PoolProbe>,
    commands: Arc<CommandExecutor>,
    audit: AuditSink,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pools: Vec<String> = gate.trackers.read().await.keys().cloned().collect();
                for pool in pools {
                    let healthy = probe.probe(&pool).await;
                    let transition = gate.record_probe(&events, ProbeResult { pool: pool.clone(), healthy }).await;
                    if transition == Transition::BecameOutage {
                        respond_to_outage(&commands, &audit, &pool).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("pool heartbeat worker shutting down");
                    return;
                }
            }
        }
    }
}

/// Stops the container runtime and records the action to the audit chain.
/// Recovery is left to an operator; this daemon never restarts the runtime
/// on its own.
async fn respond_to_outage(commands: &CommandExecutor, audit: &AuditSink, pool: &str) {
    let result = commands
        .run("container-runtime-stop", &["stop".to_string(), "docker".to_string()], false)
        .await;
    let outcome = if result.is_ok() { "success" } else { "failure" };
    if let Err(err) = &result {
        error!(pool, error = %err, "failed to stop container runtime after pool outage");
    }

    let _ = audit
        .record(AuditRecord {
            actor: None,
            source_ip: None,
            action: "bootgate.container_runtime_stop".to_string(),
            resource: Some(pool.to_string()),
            outcome: outcome.to_string(),
            detail: None,
        })
        .await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn two_failures_trigger_outage_three_healthy_recover() {
        let dir = tempfile::tempdir().unwrap();
        let gate = BootGate::new(dir.path());
        let events = EventHub::new();
        gate.declare_pools(&["tank".to_string()]).await.unwrap();

        gate.record_probe(&events, ProbeResult { pool: "tank".to_string(), healthy: false }).await;
        assert_eq!(gate.state_of("tank").await, Some(PoolState::Healthy));

        gate.record_probe(&events, ProbeResult { pool: "tank".to_string(), healthy: false }).await;
        assert_eq!(gate.state_of("tank").await, Some(PoolState::Outage));

        gate.record_probe(&events, ProbeResult { pool: "tank".to_string(), healthy: true }).await;
        gate.record_probe(&events, ProbeResult { pool: "tank".to_string(), healthy: true }).await;
        assert_eq!(gate.state_of("tank").await, Some(PoolState::Outage));

        gate.record_probe(&events, ProbeResult { pool: "tank".to_string(), healthy: true }).await;
        assert_eq!(gate.state_of("tank").await, Some(PoolState::Healthy));
    }
}
