//! De-duplicates concurrent downloads of the same remote path and stages
//! them into the cache tree (spec §4.D).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, SyncEvent};
use crate::local::LocalTree;
use crate::remote::RemoteTree;

const CHUNK_SIZE: u64 = 65536;

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub size: u64,
    pub remote_mtime: i64,
}

type Waiter = oneshot::Sender<ShareResult<DownloadOutcome>>;

#[derive(Default)]
struct DownloadSlot {
    waiters: Vec<Waiter>,
}

/// A per-destination latch distinct from `PathLock`: the first arrival
/// performs the rename, later arrivals share its result (spec §4.D step 3).
#[derive(Default)]
struct RenameLock {
    waiters: Vec<Waiter>,
}

pub struct DownloadCoordinator {
    remote: Arc<dyn RemoteTree>,
    local: Arc<dyn LocalTree>,
    events: Arc<EventBus>,
    slots: Mutex<HashMap<String, DownloadSlot>>,
    rename_locks: Mutex<HashMap<String, RenameLock>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl DownloadCoordinator {
    pub fn new(remote: Arc<dyn RemoteTree>, local: Arc<dyn LocalTree>, events: Arc<EventBus>) -> Self {
        Self {
            remote,
            local,
            events,
            slots: Mutex::new(HashMap::new()),
            rename_locks: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `path` as cancelled; the in-flight fetch (if any) aborts on
    /// its next chunk check and the partial temp file is removed.
    pub fn cancel(&self, path: &str) {
        if let Some(flag) = self.cancel_flags.lock().unwrap().get(path) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Fetches `path` from the remote into the cache, de-duplicating
    /// concurrent callers. Returns the same outcome to every waiter.
    pub async fn fetch(&self, path: &str) -> ShareResult<DownloadOutcome> {
        let rx = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(path) {
                Some(slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push(tx);
                    Some(rx)
                }
                None => {
                    slots.insert(path.to_string(), DownloadSlot::default());
                    None
                }
            }
        };
        if let Some(rx) = rx {
            return rx.await.unwrap_or(Err(ShareError::Cancelled));
        }

        let result = self.drive_fetch(path).await;

        let waiters = {
            let mut slots = self.slots.lock().unwrap();
            slots.remove(path).map(|s| s.waiters).unwrap_or_default()
        };
        self.cancel_flags.lock().unwrap().remove(path);
        for tx in waiters {
            let _ = tx.send(clone_outcome(&result));
        }
        result
    }

    async fn drive_fetch(&self, path: &str) -> ShareResult<DownloadOutcome> {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.lock().unwrap().insert(path.to_string(), cancel_flag.clone());

        let stat = self.remote.stat(path).await?;
        let total = stat.size;

        let mut temp = tempfile::NamedTempFile::new()
            .map_err(|e| ShareError::Corrupted(format!("cannot create staging temp file: {e}")))?;

        let started = Instant::now();
        let mut read: u64 = 0;
        use std::io::Write;
        while read < total {
            if cancel_flag.load(Ordering::SeqCst) {
                return Err(ShareError::Cancelled);
            }
            let len = CHUNK_SIZE.min(total - read);
            let chunk = self.remote.read_range(path, read, len).await?;
            temp.write_all(&chunk)
                .map_err(|e| ShareError::Corrupted(format!("staging write failed: {e}")))?;
            read += chunk.len() as u64;
            let elapsed = started.elapsed();
            let rate_bps = if elapsed.as_secs_f64() > 0.0 { read as f64 / elapsed.as_secs_f64() } else { 0.0 };
            self.events.emit(SyncEvent::FileProgress {
                path: path.to_string(),
                read,
                total,
                rate_bps,
                elapsed,
            });
            if chunk.is_empty() {
                break;
            }
        }

        self.stage_into_cache(path, temp).await?;
        Ok(DownloadOutcome { size: total, remote_mtime: stat.last_modified })
    }

    /// Renames the staged temp file into the cache tree under the
    /// destination's rename lock (spec §4.D steps 3–5).
    async fn stage_into_cache(&self, path: &str, temp: tempfile::NamedTempFile) -> ShareResult<()> {
        let owns_lock = {
            let mut locks = self.rename_locks.lock().unwrap();
            if locks.contains_key(path) {
                false
            } else {
                locks.insert(path.to_string(), RenameLock::default());
                true
            }
        };
        if !owns_lock {
            // Another staging operation for this destination is in flight;
            // wait for it instead of racing the rename ourselves.
            let (tx, rx) = oneshot::channel();
            {
                let mut locks = self.rename_locks.lock().unwrap();
                locks.entry(path.to_string()).or_default().waiters.push(tx);
            }
            return rx.await.unwrap_or(Err(ShareError::Cancelled)).map(|_| ());
        }

        let final_path = self.local.local_file_path(path);
        let rename_result = self.commit_rename(temp, &final_path);

        let waiters = {
            let mut locks = self.rename_locks.lock().unwrap();
            locks.remove(path).map(|l| l.waiters).unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(rename_result.clone().map(|_| DownloadOutcome { size: 0, remote_mtime: 0 }));
        }
        rename_result
    }

    fn commit_rename(&self, temp: tempfile::NamedTempFile, final_path: &std::path::Path) -> ShareResult<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ShareError::Corrupted(format!("cannot create cache dir: {e}")))?;
        }
        match temp.persist(final_path) {
            Ok(_) => Ok(()),
            Err(err) => {
                // Cross-device rename: fall back to copy+unlink.
                let path = err.file.path().to_path_buf();
                std::fs::copy(&path, final_path)
                    .map_err(|e| ShareError::Corrupted(format!("staging copy failed: {e}")))?;
                std::fs::remove_file(&path).ok();
                Ok(())
            }
        }
    }
}

fn clone_outcome(result: &ShareResult<DownloadOutcome>) -> ShareResult<DownloadOutcome> {
    match result {
        Ok(outcome) => Ok(outcome.clone()),
        Err(e) => Err(e.clone()),
    }
}
