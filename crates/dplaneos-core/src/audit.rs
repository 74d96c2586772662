//! Tamper-evident audit chain (C3).
//!
//! Every entry's `row_hash` covers the previous entry's hash plus its own
//! canonical fields, so altering or deleting a row breaks the chain from
//! that point forward. Writes are buffered and flushed in batches of 100 or
//! every 5 seconds, whichever comes first, with a synchronous flush on
//! shutdown. The HMAC key lives in a file beside the database
//! (`dplaneos-store::load_or_create_audit_key`), never in a row.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, warn};

use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// One fact to be appended to the audit chain.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: Option<String>,
    pub source_ip: Option<String>,
    pub action: String,
    pub resource: Option<String>,
    pub outcome: String,
    pub detail: Option<String>,
}

/// Handle used by the rest of the system to submit audit records. Cloning
/// is cheap — it's just a channel sender.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    /// Enqueues a record. Never blocks on disk I/O; back-pressure only
    /// occurs if the flusher task itself has died, at which point the
    /// channel is full and this returns an error rather than hanging the
    /// caller indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] if the flusher task has shut
    /// down and the channel is closed.
    pub async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.tx.send(record).await.map_err(|_| AuditError::Serialization {
            reason: "audit flusher task is not running".to_string(),
        })
    }
}

/// Owns the flush task and the HMAC key. Call [`AuditChain::spawn`] once at
/// startup; it returns a cheap-to-clone [`AuditSink`] plus the background
/// task's join handle.
pub struct AuditChain;

impl AuditChain {
    #[must_use]
    pub fn spawn(
        pool: SqlitePool,
        hmac_key: [u8; 32],
        mut shutdown: watch::Receiver<bool>,
    ) -> (AuditSink, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(1024);
        let last_hash = Arc::new(Mutex::new(None::<String>));

        let handle = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    maybe_record = rx.recv() => {
                        match maybe_record {
                            Some(record) => {
                                batch.push(record);
                                if batch.len() >= BATCH_SIZE {
                                    flush(&pool, &hmac_key, &last_hash, &mut batch).await;
                                }
                            }
                            None => {
                                flush(&pool, &hmac_key, &last_hash, &mut batch).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        flush(&pool, &hmac_key, &last_hash, &mut batch).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            flush(&pool, &hmac_key, &last_hash, &mut batch).await;
                            break;
                        }
                    }
                }
            }
        });

        (AuditSink { tx }, handle)
    }
}

async fn flush(
    pool: &SqlitePool,
    hmac_key: &[u8; 32],
    last_hash: &Arc<Mutex<Option<String>>>,
    batch: &mut Vec<AuditRecord>,
) {
    if batch.is_empty() {
        return;
    }
    let mut guard = last_hash.lock().await;
    for record in batch.drain(..) {
        let prev_hash = match guard.clone() {
            Some(hash) => hash,
            None => last_persisted_hash(pool).await.unwrap_or_else(|| "0".repeat(64)),
        };
        let occurred_at = Utc::now();
        let canonical = format!(
            "{}|{:?}|{:?}|{}|{:?}|{}|{:?}",
            occurred_at.to_rfc3339(),
            record.actor,
            record.source_ip,
            record.action,
            record.resource,
            record.outcome,
            record.detail
        );
        let row_hash = compute_hash(hmac_key, &prev_hash, &canonical);

        if let Err(err) = sqlx::query(
            "INSERT INTO audit_log (occurred_at, actor, source_ip, action, resource, outcome, detail, prev_hash, row_hash) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(occurred_at)
        .bind(&record.actor)
        .bind(&record.source_ip)
        .bind(&record.action)
        .bind(&record.resource)
        .bind(&record.outcome)
        .bind(&record.detail)
        .bind(&prev_hash)
        .bind(&row_hash)
        .execute(pool)
        .await
        {
            error!(error = %err, "failed to persist audit entry, entry dropped");
            continue;
        }
        *guard = Some(row_hash);
    }
}

async fn last_persisted_hash(pool: &SqlitePool) -> Option<String> {
    sqlx::query_as::<_, (String,)>("SELECT row_hash FROM audit_log ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
        .map(|(hash,)| hash)
}

fn compute_hash(key: &[u8; 32], prev_hash: &str, canonical: &str) -> String {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(prev_hash.as_bytes());
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Recomputes the chain from `from_id` to `to_id` inclusive and returns the
/// id of the first entry whose stored hash doesn't match, if any.
///
/// # Errors
///
/// Returns [`AuditError::Store`] if the entries can't be read.
pub async fn verify_chain(
    pool: &SqlitePool,
    hmac_key: &[u8; 32],
    from_id: i64,
    to_id: i64,
) -> Result<Option<i64>, AuditError> {
    let rows: Vec<dplaneos_store::AuditEntry> = sqlx::query_as(
        "SELECT * FROM audit_log WHERE id >= ? AND id <= ? ORDER BY id ASC",
    )
    .bind(from_id)
    .bind(to_id)
    .fetch_all(pool)
    .await?;

    for entry in rows {
        let canonical = format!(
            "{}|{:?}|{:?}|{}|{:?}|{}|{:?}",
            entry.occurred_at.to_rfc3339(),
            entry.actor,
            entry.source_ip,
            entry.action,
            entry.resource,
            entry.outcome,
            entry.detail
        );
        let expected = compute_hash(hmac_key, &entry.prev_hash, &canonical);
        if expected != entry.row_hash {
            warn!(entry_id = entry.id, "audit chain verification failed");
            return Ok(Some(entry.id));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                occurred_at TEXT NOT NULL,
                actor TEXT,
                source_ip TEXT,
                action TEXT NOT NULL,
                resource TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                prev_hash TEXT NOT NULL,
                row_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn record_and_flush_roundtrip() {
        let pool = test_pool().await;

        let (tx, rx) = watch::channel(false);
        let key = [7u8; 32];
        let (sink, handle) = AuditChain::spawn(pool.clone(), key, rx.clone());

        sink.record(AuditRecord {
            actor: Some("alice".to_string()),
            source_ip: Some("127.0.0.1".to_string()),
            action: "login".to_string(),
            resource: None,
            outcome: "success".to_string(),
            detail: None,
        })
        .await
        .unwrap();

        drop(sink);
        tx.send(true).unwrap();
        let _ = handle.await;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log").fetch_one(&pool).await.unwrap();
        assert_eq!(count.0, 1);
    }
}
