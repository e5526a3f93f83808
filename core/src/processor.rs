//! Background RQ drainer (spec §4.E): pops entries, applies them to the
//! remote, and emits sync lifecycle events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::caching_tree::CachingTree;
use crate::error::{ShareError, ShareResult};
use crate::events::SyncEvent;
use crate::path::is_temp_file;
use crate::queue::{now_ms, RqEntry, RqMethod};

enum ExecOutcome {
    Completed { remote_mtime: i64 },
    Swallowed,
}

/// Drives one `CachingTree`'s `RequestQueue` to completion in the
/// background. `start`/`stop` launch and cancel the tick loop; `sync_path`
/// runs a single pass against one path on demand.
pub struct RqProcessor {
    tree: CachingTree,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Notify,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Per-path cancel flags for attempts currently executing a remote
    /// call; checked by `execute` before issuing the call and flipped by
    /// `stop()` so in-flight uploads/downloads abort rather than run to
    /// completion (spec §5 "Cancellation").
    inflight: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl RqProcessor {
    pub fn new(tree: CachingTree) -> Self {
        Self {
            tree,
            stop_flag: Arc::new(AtomicBool::new(false)),
            stop_notify: Notify::new(),
            handle: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Launches the tick loop as a background task.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run().await });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Signals the tick loop to stop, flips every in-flight attempt's
    /// cancel flag so the current remote call aborts instead of running to
    /// completion, and waits for the loop task to actually exit (spec §5:
    /// "`stop()` cancels in-flight network I/O and waits for lock
    /// release").
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        for flag in self.inflight.lock().unwrap().values() {
            flag.store(true, Ordering::SeqCst);
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(&self) {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let now = now_ms();
            let cfg = &self.tree.config;
            let next =
                self.tree.rq.get_process_request(now, cfg.expiration_ms as i64, cfg.max_retries);
            match next {
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(cfg.frequency_ms)) => {}
                        _ = self.stop_notify.notified() => {}
                    }
                }
                Some(entry) => {
                    self.process_entry(entry).await;
                }
            }
        }
    }

    /// Runs a single pass against one path, outside the regular tick loop.
    pub async fn sync_path(&self, path: &str) {
        if let Some(entry) = self.tree.rq.get(path) {
            self.process_entry(entry).await;
        }
    }

    async fn process_entry(&self, entry: RqEntry) {
        let name = entry.name.rsplit('/').next().unwrap_or(&entry.name).to_string();
        if is_temp_file(&entry.path) || name.starts_with('.') {
            let _ = self.tree.rq.purge(&entry.path, &entry.name, "unsyncable");
            self.tree.events.emit(SyncEvent::Purged {
                path: entry.path.clone(),
                name: entry.name.clone(),
                reason: "unsyncable".to_string(),
            });
            return;
        }

        let mut guard = self.tree.locks.write_lock(&entry.path).await;

        // Re-validate (spec §4.E step 3): the entry may have changed method
        // or vanished while we waited for the write lock.
        let current = match self.tree.rq.get(&entry.path) {
            Some(e) => e,
            None => return,
        };
        if current.method != entry.method {
            // A newer mutation superseded this one; let the next tick pick
            // up the fresh entry rather than acting on stale data.
            self.tree.rq.release_lease(&entry.path);
            return;
        }

        self.tree
            .events
            .emit(SyncEvent::FileStart { path: current.path.clone(), method: current.method });

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.inflight.lock().unwrap().insert(current.path.clone(), cancel_flag.clone());

        // Abort detection (spec §4.E "Additional rules"): release the write
        // lock for the duration of the network call so a concurrent write
        // can actually acquire it. `current.version` is snapshotted now and
        // compared after the call; coalescing keeps the RQ entry's `id`, so
        // `version` (bumped on every `queue()`) is what actually reveals a
        // write raced the upload.
        guard.release();
        let original_version = current.version;

        let result = self.execute(&current, &cancel_flag).await;

        guard = self.tree.locks.write_lock(&entry.path).await;
        self.inflight.lock().unwrap().remove(&current.path);

        let superseded = match self.tree.rq.get(&current.path) {
            Some(fresh) => fresh.version != original_version,
            None => false,
        };
        if superseded {
            // A write landed on this path while we were uploading; the
            // content we just sent (if it even succeeded) is stale. Abort
            // and let the next tick pick up the newer data.
            self.tree.rq.release_lease(&current.path);
            self.tree.events.emit(SyncEvent::FileAbort { path: current.path.clone() });
            drop(guard);
            return;
        }

        self.handle_result(&current, result).await;
        drop(guard);
    }

    async fn handle_result(&self, entry: &RqEntry, result: ShareResult<ExecOutcome>) {
        let cfg = &self.tree.config;
        match result {
            Ok(ExecOutcome::Completed { remote_mtime }) => {
                let _ = self.tree.rq.complete(&entry.path, &entry.name);
                let now = now_ms();
                self.tree.cache.mark_synced(&entry.path, now, remote_mtime);
                let _ = self.tree.cache.persist(&*self.tree.local, &entry.path).await;
                self.tree
                    .events
                    .emit(SyncEvent::FileEnd { path: entry.path.clone(), method: entry.method });
            }
            Ok(ExecOutcome::Swallowed) => {
                let _ = self.tree.rq.complete(&entry.path, &entry.name);
                self.tree
                    .events
                    .emit(SyncEvent::FileEnd { path: entry.path.clone(), method: entry.method });
            }
            Err(ShareError::Cancelled) => {
                // Leave the RQ entry intact; it retries on next start (§5).
                self.tree.rq.release_lease(&entry.path);
                self.tree.events.emit(SyncEvent::FileAbort { path: entry.path.clone() });
            }
            Err(e) if e.is_conflict() => {
                self.tree.events.emit(SyncEvent::FileErr {
                    path: entry.path.clone(),
                    method: entry.method,
                    err: e.to_string(),
                });
                let _ = self.tree.rq.increment_retry_count(
                    &entry.path,
                    &entry.name,
                    cfg.retry_delay_ms as i64,
                );
                self.maybe_emit_conflict(entry, cfg.max_retries);
            }
            Err(e) if e.is_retryable() => {
                self.tree.events.emit(SyncEvent::FileErr {
                    path: entry.path.clone(),
                    method: entry.method,
                    err: e.to_string(),
                });
                let _ = self.tree.rq.increment_retry_count(
                    &entry.path,
                    &entry.name,
                    cfg.retry_delay_ms as i64,
                );
                self.maybe_purge_exhausted(entry, cfg.max_retries);
            }
            Err(e) => {
                self.tree.events.emit(SyncEvent::FileErr {
                    path: entry.path.clone(),
                    method: entry.method,
                    err: e.to_string(),
                });
                let _ = self.tree.rq.increment_retry_count(
                    &entry.path,
                    &entry.name,
                    cfg.retry_delay_ms as i64,
                );
            }
        }
    }

    /// Spec §4.E step 6: on a checkout/locked status, a crossed retry
    /// ceiling together with a user edit since the failed attempt surfaces
    /// as a conflict rather than a silent purge.
    fn maybe_emit_conflict(&self, entry: &RqEntry, max_retries: u32) {
        let Some(updated) = self.tree.rq.get(&entry.path) else { return };
        if updated.retries <= max_retries {
            return;
        }
        if self.tree.cache.peek(&entry.path).map(|c| c.dirty).unwrap_or(false) {
            self.tree.events.emit(SyncEvent::SyncConflict { path: entry.path.clone() });
        }
    }

    fn maybe_purge_exhausted(&self, entry: &RqEntry, max_retries: u32) {
        let Some(updated) = self.tree.rq.get(&entry.path) else { return };
        if updated.retries <= max_retries {
            return;
        }
        let reason = "max retries exceeded";
        let _ = self.tree.rq.purge(&entry.path, &entry.name, reason);
        self.tree.events.emit(SyncEvent::Purged {
            path: entry.path.clone(),
            name: entry.name.clone(),
            reason: reason.to_string(),
        });
    }

    async fn execute(
        &self,
        entry: &RqEntry,
        cancel_flag: &Arc<AtomicBool>,
    ) -> ShareResult<ExecOutcome> {
        if cancel_flag.load(Ordering::SeqCst) {
            return Err(ShareError::Cancelled);
        }
        match entry.method {
            RqMethod::Put => self.execute_put(entry).await,
            RqMethod::Post => self.execute_post(entry).await,
            RqMethod::Delete => self.execute_delete(entry).await,
            RqMethod::Move => self.execute_move(entry).await,
        }
    }

    async fn stat_mtime_or_now(&self, path: &str) -> i64 {
        self.tree.remote.stat(path).await.map(|s| s.last_modified).unwrap_or_else(|_| now_ms())
    }

    async fn execute_put(&self, entry: &RqEntry) -> ShareResult<ExecOutcome> {
        let local_path = self.tree.local.local_file_path(&entry.path);
        match self.tree.remote.create_file_resource(&entry.path, &local_path).await {
            Ok(()) => {
                Ok(ExecOutcome::Completed { remote_mtime: self.stat_mtime_or_now(&entry.path).await })
            }
            // Already exists on the remote: convert to an update (§4.E step 5).
            Err(ShareError::Conflict(_)) => {
                self.tree.remote.update_resource(&entry.path, &local_path).await?;
                Ok(ExecOutcome::Completed { remote_mtime: self.stat_mtime_or_now(&entry.path).await })
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_post(&self, entry: &RqEntry) -> ShareResult<ExecOutcome> {
        let local_path = self.tree.local.local_file_path(&entry.path);
        match self.tree.remote.update_resource(&entry.path, &local_path).await {
            Ok(()) => {
                Ok(ExecOutcome::Completed { remote_mtime: self.stat_mtime_or_now(&entry.path).await })
            }
            // Vanished on the remote: convert to a create (§4.E step 5).
            Err(e) if e.is_not_found() => {
                self.tree.remote.create_file_resource(&entry.path, &local_path).await?;
                Ok(ExecOutcome::Completed { remote_mtime: self.stat_mtime_or_now(&entry.path).await })
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_delete(&self, entry: &RqEntry) -> ShareResult<ExecOutcome> {
        let is_file = !self.tree.local.is_dir(&entry.path).await.unwrap_or(true);
        match self.tree.remote.delete_resource(&entry.path, is_file).await {
            Ok(()) => Ok(ExecOutcome::Swallowed),
            // Never existed remotely: 404 is swallowed as success (§4.E/§7).
            Err(e) if e.is_not_found() => Ok(ExecOutcome::Swallowed),
            Err(e) => Err(e),
        }
    }

    async fn execute_move(&self, entry: &RqEntry) -> ShareResult<ExecOutcome> {
        let source = entry.destination.clone().unwrap_or_default();
        if self.tree.remote.supports_native_rename() {
            match self.tree.remote.rename_resource(&source, &entry.path).await {
                Ok(()) => {
                    return Ok(ExecOutcome::Completed {
                        remote_mtime: self.stat_mtime_or_now(&entry.path).await,
                    })
                }
                Err(_) => {
                    // Fall back to create-at-dest + delete-at-source within
                    // the same tick (resolved Open Question, see DESIGN.md).
                }
            }
        }
        let local_path = self.tree.local.local_file_path(&entry.path);
        self.tree.remote.create_file_resource(&entry.path, &local_path).await?;
        let _ = self.tree.remote.delete_resource(&source, true).await;
        Ok(ExecOutcome::Completed { remote_mtime: self.stat_mtime_or_now(&entry.path).await })
    }
}
