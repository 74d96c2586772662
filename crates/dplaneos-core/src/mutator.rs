//! Atomic mutation (C8): snapshot, mutate, health-check, commit-or-rollback.
//!
//! One mechanism serves both call sites — container updates and two-phase
//! network apply — by taking the mutation itself as a trait object, rather
//! than duplicating the control flow per caller.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::MutatorError;

/// One guarded change: snapshot the current state, apply the change, then
/// either confirm it's healthy or roll back to the snapshot.
#[async_trait]
pub trait Mutation: Send + Sync {
    /// Captures a restore point and returns an opaque identifier for it.
    async fn snapshot(&self) -> Result<String, MutatorError>;

    /// Applies the actual change. Runs only after a successful snapshot.
    async fn apply(&self) -> Result<(), MutatorError>;

    /// Confirms the post-apply state is healthy.
    async fn health_check(&self) -> Result<bool, MutatorError>;

    /// Restores to `snapshot_id` after a failed health check.
    async fn rollback(&self, snapshot_id: &str) -> Result<(), MutatorError>;
}

/// Outcome of a guarded mutation, always naming the snapshot taken so the
/// caller can report it regardless of which branch was taken.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub snapshot_id: String,
    pub committed: bool,
}

/// Runs the snapshot → apply → health-check → commit-or-rollback sequence.
///
/// # Errors
///
/// Returns [`MutatorError::SnapshotFailed`] if the snapshot step fails
/// (nothing has changed, so there is nothing to roll back), or
/// [`MutatorError::HealthCheckFailed`]/[`MutatorError::RollbackFailed`] if
/// the post-apply health check fails and rollback also fails.
pub async fn snapshot_mutate_commit(mutation: &dyn Mutation) -> Result<MutationReport, MutatorError> {
    let snapshot_id = mutation.snapshot().await?;
    info!(snapshot = %snapshot_id, "snapshot taken, applying mutation");

    if let Err(err) = mutation.apply().await {
        warn!(error = %err, snapshot = %snapshot_id, "mutation apply failed, rolling back");
        rollback_or_escalate(mutation, &snapshot_id).await?;
        return Err(err);
    }

    match mutation.health_check().await {
        Ok(true) => {
            info!(snapshot = %snapshot_id, "mutation committed");
            Ok(MutationReport { snapshot_id, committed: true })
        }
        Ok(false) => {
            warn!(snapshot = %snapshot_id, "post-mutation health check failed, rolling back");
            rollback_or_escalate(mutation, &snapshot_id).await?;
            Err(MutatorError::HealthCheckFailed { snapshot: snapshot_id })
        }
        Err(err) => {
            error!(error = %err, snapshot = %snapshot_id, "health check itself errored, rolling back");
            rollback_or_escalate(mutation, &snapshot_id).await?;
            Err(err)
        }
    }
}

async fn rollback_or_escalate(mutation: &dyn Mutation, snapshot_id: &str) -> Result<(), MutatorError> {
    mutation.rollback(snapshot_id).await.map_err(|err| {
        error!(error = %err, snapshot = %snapshot_id, "rollback failed — system may be degraded");
        MutatorError::RollbackFailed { reason: err.to_string() }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeMutation {
        healthy: AtomicBool,
        rolled_back: AtomicUsize,
    }

    #[async_trait]
    impl Mutation for FakeMutation {
        async fn snapshot(&self) -> Result<String, MutatorError> {
            Ok("snap-1".to_string())
        }
        async fn apply(&self) -> Result<(), MutatorError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<bool, MutatorError> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
        async fn rollback(&self, _snapshot_id: &str) -> Result<(), MutatorError> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn healthy_mutation_commits() {
        let mutation = FakeMutation { healthy: AtomicBool::new(true), rolled_back: AtomicUsize::new(0) };
        let report = snapshot_mutate_commit(&mutation).await.unwrap();
        assert!(report.committed);
        assert_eq!(mutation.rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unhealthy_mutation_rolls_back() {
        let mutation = FakeMutation { healthy: AtomicBool::new(false), rolled_back: AtomicUsize::new(0) };
        let err = snapshot_mutate_commit(&mutation).await.unwrap_err();
        assert!(matches!(err, MutatorError::HealthCheckFailed { .. }));
        assert_eq!(mutation.rolled_back.load(Ordering::SeqCst), 1);
    }
}
