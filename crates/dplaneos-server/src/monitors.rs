//! Background monitors (C10): capacity guardian, S.M.A.R.T. poller, session
//! reaper, WAL checkpointer, and database backup, all sharing one
//! cooperative scheduling shape — interval tick or shutdown, whichever
//! comes first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::events::{EventHub, EventLevel};

/// Emergency capacity thresholds: release the reserve at 95% used, throttle
/// writers at 98%.
const CAPACITY_WARN_PCT: u8 = 80;
const CAPACITY_RESERVE_RELEASE_PCT: u8 = 95;
const CAPACITY_THROTTLE_PCT: u8 = 98;

/// Queries pool capacity as used-percent, `0..=100`. Implemented against
/// the command executor elsewhere; this trait keeps the monitor testable
/// without shelling out.
#[async_trait::async_trait]
pub trait CapacitySource: Send + Sync {
    async fn used_percent(&self, pool: &str) -> Option<u8>;
}

/// Runs the 5-minute capacity guardian tick against every declared pool.
pub async fn capacity_guardian(
    pools: Arc<dyn CapacitySource>,
    declared: Arc<watch::Receiver<Vec<String>>>,
    events: Arc<EventHub>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(300));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for pool in declared.borrow().iter() {
                    let Some(used) = pools.used_percent(pool).await else { continue };
                    evaluate_capacity(pool, used, &events);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("capacity guardian shutting down");
                    return;
                }
            }
        }
    }
}

fn evaluate_capacity(pool: &str, used_pct: u8, events: &EventHub) {
    if used_pct >= CAPACITY_THROTTLE_PCT {
        warn!(pool, used_pct, "pool at throttle threshold, writers should be throttled");
        events.publish(
            "zfs.capacity",
            EventLevel::Critical,
            serde_json::json!({ "pool": pool, "used_pct": used_pct, "action": "throttle" }),
        );
    } else if used_pct >= CAPACITY_RESERVE_RELEASE_PCT {
        warn!(pool, used_pct, "pool at reserve-release threshold");
        events.publish(
            "zfs.capacity",
            EventLevel::Warning,
            serde_json::json!({ "pool": pool, "used_pct": used_pct, "action": "reserve_released" }),
        );
    } else if used_pct >= CAPACITY_WARN_PCT {
        info!(pool, used_pct, "pool approaching capacity");
        events.publish(
            "zfs.capacity",
            EventLevel::Info,
            serde_json::json!({ "pool": pool, "used_pct": used_pct, "action": "warn" }),
        );
    }
}

/// Deletes sessions whose absolute expiry has passed, every 15 minutes.
pub async fn session_reaper(pool: SqlitePool, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(15 * 60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sqlx::query("DELETE FROM sessions WHERE absolute_expires_at < ?")
                    .bind(chrono::Utc::now())
                    .execute(&pool)
                    .await
                {
                    Ok(result) => {
                        if result.rows_affected() > 0 {
                            info!(reaped = result.rows_affected(), "expired sessions reaped");
                        }
                    }
                    Err(err) => error!(error = %err, "session reaper query failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("session reaper shutting down");
                    return;
                }
            }
        }
    }
}

/// Passive WAL checkpoint every 5 minutes.
pub async fn wal_checkpointer(pool: SqlitePool, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = dplaneos_store::checkpoint_passive(&pool).await {
                    warn!(error = %err, "passive checkpoint failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("wal checkpointer shutting down");
                    return;
                }
            }
        }
    }
}

/// `VACUUM INTO` backup every 24 hours.
pub async fn backup_worker(pool: SqlitePool, backup_dir: PathBuf, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dest = backup_dir.join(format!("backup-{}.db", chrono::Utc::now().format("%Y%m%dT%H%M%SZ")));
                if let Err(err) = dplaneos_store::backup_into(&pool, &dest).await {
                    error!(error = %err, "scheduled backup failed");
                } else {
                    info!(dest = %dest.display(), "scheduled backup written");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("backup worker shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn thresholds_are_resolved_per_spec() {
        let events = EventHub::new();
        // No panics, no events below warn threshold.
        evaluate_capacity("tank", 50, &events);
        evaluate_capacity("tank", CAPACITY_WARN_PCT, &events);
        evaluate_capacity("tank", CAPACITY_RESERVE_RELEASE_PCT, &events);
        evaluate_capacity("tank", CAPACITY_THROTTLE_PCT, &events);
    }
}
