//! Sync lifecycle events (spec §6), broadcast so the SMB dispatch layer (or
//! tests) can observe progress without polling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::queue::RqMethod;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    FileStart { path: String, method: RqMethod },
    FileProgress { path: String, read: u64, total: u64, rate_bps: f64, elapsed: Duration },
    FileEnd { path: String, method: RqMethod },
    FileErr { path: String, method: RqMethod, err: String },
    FileAbort { path: String },
    SyncConflict { path: String },
    Purged { path: String, name: String, reason: String },
}

impl SyncEvent {
    /// The `(event, description)` key used for rate-limiting noisy events
    /// (spec §6: "managed described").
    fn rate_limit_key(&self) -> Option<(&'static str, String)> {
        match self {
            SyncEvent::FileProgress { path, .. } => Some(("progress", path.clone())),
            _ => None,
        }
    }
}

/// Publishes `SyncEvent`s to subscribers, rate-limiting per `(event,
/// description)` key so a fast RQProcessor tick loop cannot flood listeners.
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    last_sent: Mutex<HashMap<(&'static str, String), Instant>>,
    rate_limit: Duration,
}

impl EventBus {
    pub fn new(rate_limit: Duration) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender, last_sent: Mutex::new(HashMap::new()), rate_limit }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(key) = event.rate_limit_key() {
            let mut last_sent = self.last_sent.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = last_sent.get(&key) {
                if now.duration_since(*prev) < self.rate_limit {
                    return;
                }
            }
            last_sent.insert(key, now);
        }
        match &event {
            SyncEvent::FileErr { path, method, err } => {
                tracing::warn!(%path, ?method, %err, "syncfileerr");
            }
            SyncEvent::SyncConflict { path } => {
                tracing::warn!(%path, "syncconflict");
            }
            SyncEvent::Purged { path, name, reason } => {
                tracing::warn!(%path, %name, %reason, "purged");
            }
            SyncEvent::FileAbort { path } => {
                tracing::debug!(%path, "syncfileabort");
            }
            _ => tracing::trace!(?event, "sync event"),
        }
        // A full channel with no subscribers is a normal, not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}
