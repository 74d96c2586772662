//! Event fan-out (C9): in-process topic bus plus the WebSocket hub that
//! republishes it to connected clients.
//!
//! Publishers never await on a subscriber's queue — each client gets its
//! own bounded `mpsc` sender, and a client that can't keep up is dropped
//! rather than allowed to back-pressure the publisher.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::{Config as NotifyConfig, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 256;
const TOPIC_CAPACITY: usize = 1024;

/// Severity attached to a broadcast event, surfaced verbatim to WebSocket
/// clients as the `level` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub level: EventLevel,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

pub struct EventHub {
    tx: broadcast::Sender<Event>,
    next_client_id: AtomicU64,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(TOPIC_CAPACITY);
        Self { tx, next_client_id: AtomicU64::new(1) }
    }

    /// Publishes an event to every current subscriber. Never blocks — a
    /// full channel simply means the slowest subscriber misses the oldest
    /// backlog entry, which `broadcast` handles by returning a lag error
    /// to that subscriber next time it reads.
    pub fn publish(&self, topic: impl Into<String>, level: EventLevel, payload: serde_json::Value) {
        let event = Event { topic: topic.into(), level, ts: Utc::now(), payload };
        let _ = self.tx.send(event);
    }

    /// Registers a new WebSocket client and returns a bounded receiver fed
    /// by a forwarding task. If the client's own queue fills up (it's not
    /// reading fast enough), the forwarding task exits and the connection
    /// should be closed by the caller.
    pub fn subscribe_client(self: &Arc<Self>) -> (u64, mpsc::Receiver<Event>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let mut topic_rx = self.tx.subscribe();
        let (client_tx, client_rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            loop {
                match topic_rx.recv().await {
                    Ok(event) => {
                        if client_tx.try_send(event).is_err() {
                            warn!(client_id, "websocket client too slow, disconnecting");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "websocket client lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        (client_id, client_rx)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches the external-hook drop directory (spec: `zfs-event-<epoch>.json`
/// dropped by a ZFS event script outside this daemon's control) and
/// republishes each file's contents on `zfs.event` before deleting it.
///
/// Existing files are swept once before the watch begins, so a file dropped
/// while the daemon was down isn't missed.
pub async fn drop_dir_watcher(dir: PathBuf, hub: Arc<EventHub>, mut shutdown: watch::Receiver<bool>) {
    if let Err(err) = tokio::fs::create_dir_all(&dir).await {
        error!(error = %err, dir = %dir.display(), "failed to create zfs-event drop directory");
        return;
    }

    sweep_drop_dir(&dir, &hub).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<NotifyEvent>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(watcher) => watcher,
        Err(err) => {
            error!(error = %err, "failed to start zfs-event drop directory watcher");
            return;
        }
    };

    if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        error!(error = %err, dir = %dir.display(), "failed to watch zfs-event drop directory");
        return;
    }

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if matches!(event.kind, notify::EventKind::Create(_) | notify::EventKind::Modify(_)) {
                    for path in &event.paths {
                        process_drop_file(path, &hub).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("zfs-event drop directory watcher shutting down");
                    return;
                }
            }
        }
    }
}

async fn sweep_drop_dir(dir: &Path, hub: &EventHub) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
    while let Ok(Some(entry)) = entries.next_entry().await {
        process_drop_file(&entry.path(), hub).await;
    }
}

/// Reads, republishes, and deletes one `zfs-event-<epoch>.json` file. Any
/// other file in the drop directory is left alone.
async fn process_drop_file(path: &Path, hub: &EventHub) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return };
    if !name.starts_with("zfs-event-") || !name.ends_with(".json") {
        return;
    }

    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to read zfs-event drop file");
            return;
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&content) {
        Ok(payload) => hub.publish("zfs.event", EventLevel::Warning, payload),
        Err(err) => warn!(error = %err, path = %path.display(), "zfs-event drop file was not valid JSON"),
    }

    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(error = %err, path = %path.display(), "failed to delete processed zfs-event drop file");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = Arc::new(EventHub::new());
        let (_id, mut rx) = hub.subscribe_client();

        hub.publish("pool.status", EventLevel::Info, serde_json::json!({"pool": "tank", "state": "online"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "pool.status");
    }

    #[tokio::test]
    async fn slow_client_is_disconnected_not_blocked() {
        let hub = Arc::new(EventHub::new());
        let (_id, mut rx) = hub.subscribe_client();

        for i in 0..(CLIENT_QUEUE_CAPACITY + 10) {
            hub.publish("flood", EventLevel::Info, serde_json::json!({ "n": i }));
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The forwarding task should have exited; the channel drains what
        // made it through before that happened, then closes.
        while rx.recv().await.is_some() {}
    }
}
