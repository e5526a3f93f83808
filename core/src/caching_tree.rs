//! The user-facing tree (spec §4.C): routes reads/writes through the local
//! cache, schedules remote mutations, and implements the `cacheFile`
//! double-checked-locking protocol.

use std::sync::Arc;

use crate::cache::LocalCache;
use crate::config::ShareConfig;
use crate::download::DownloadCoordinator;
use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, SyncEvent};
use crate::list_cache::ListCache;
use crate::local::LocalTree;
use crate::path::{is_temp_file, normalize_path, split_parent};
use crate::path_lock::{LockMode, PathLock};
use crate::queue::{now_ms, NewRqEntry, RequestQueue, RqMethod};
use crate::remote::RemoteTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Clone)]
pub struct CachingTree {
    pub(crate) local: Arc<dyn LocalTree>,
    pub(crate) remote: Arc<dyn RemoteTree>,
    pub(crate) cache: Arc<LocalCache>,
    pub(crate) locks: Arc<PathLock>,
    pub(crate) rq: Arc<RequestQueue>,
    pub(crate) downloads: Arc<DownloadCoordinator>,
    pub(crate) list_cache: Arc<ListCache>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) config: ShareConfig,
}

impl CachingTree {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<dyn LocalTree>,
        remote: Arc<dyn RemoteTree>,
        cache: Arc<LocalCache>,
        locks: Arc<PathLock>,
        rq: Arc<RequestQueue>,
        downloads: Arc<DownloadCoordinator>,
        list_cache: Arc<ListCache>,
        events: Arc<EventBus>,
        config: ShareConfig,
    ) -> Self {
        Self { local, remote, cache, locks, rq, downloads, list_cache, events, config }
    }

    fn normalize(&self, path: &str) -> String {
        normalize_path(path, !self.config.no_unicode_normalize)
    }

    /// §7 propagation policy: the user-facing read/write surface never
    /// exposes a raw network-transient/fatal kind; it reads as a temporary
    /// `AccessDenied` while the cache remains otherwise usable.
    fn translate_surface_error(path: &str, err: ShareError) -> ShareError {
        match err {
            ShareError::NetworkTransient { .. } | ShareError::NetworkFatal { .. } => {
                ShareError::AccessDenied(path.to_string())
            }
            other => other,
        }
    }

    /// Read-only access to the underlying queue, for callers (the `smb`
    /// dispatch shim, tests) that need to inspect RQ state directly rather
    /// than through a file operation.
    pub fn rq(&self) -> &RequestQueue {
        &self.rq
    }

    pub async fn exists(&self, path: &str) -> bool {
        let path = self.normalize(path);
        if self.local.exists(&path).await {
            return true;
        }
        self.remote.stat(&path).await.is_ok()
    }

    /// The central flow of spec §4.C: double-checked locking across a
    /// read-then-maybe-write-lock cycle, ending with the file guaranteed
    /// present locally (unless it is a temp-file, which short-circuits).
    async fn cache_file(&self, path: &str) -> ShareResult<()> {
        if is_temp_file(path) {
            return Ok(());
        }

        let mut guard = self.locks.read_lock(path).await;
        loop {
            let local_present = self.local.exists(path).await;

            if !local_present {
                if guard.mode() == LockMode::Read {
                    drop(guard);
                    guard = self.locks.write_lock(path).await;
                    if self.local.exists(path).await {
                        continue;
                    }
                }
                // Initial fetch of a non-present file: errors surface to the
                // caller (§4.C), but network-transient kinds are translated
                // to AccessDenied at this user-facing boundary (§7 propagation
                // policy) rather than leaking transport-specific error kinds.
                let outcome = self
                    .downloads
                    .fetch(path)
                    .await
                    .map_err(|e| Self::translate_surface_error(path, e))?;
                self.cache.mark_downloaded(path, outcome.remote_mtime);
                self.cache.persist(&*self.local, path).await?;
                return Ok(());
            }

            let entry = self.cache.load(&*self.local, path).await?;
            let needs_update = if entry.created_locally {
                false
            } else {
                match self.remote.stat(path).await {
                    Ok(stat) => stat.last_modified != entry.downloaded_remote_mtime,
                    Err(e) => {
                        tracing::warn!(%path, error = %e, "stat failed during cacheFile, keeping cached copy");
                        false
                    }
                }
            };

            if needs_update && guard.mode() == LockMode::Read {
                drop(guard);
                guard = self.locks.write_lock(path).await;
                continue;
            }

            if needs_update {
                let entry = self.cache.load(&*self.local, path).await?;
                if entry.can_delete() {
                    match self.downloads.fetch(path).await {
                        Ok(outcome) => {
                            self.cache.mark_downloaded(path, outcome.remote_mtime);
                            self.cache.persist(&*self.local, path).await?;
                        }
                        Err(e) => {
                            tracing::warn!(%path, error = %e, "refresh download failed, keeping cached copy");
                        }
                    }
                } else if !self.rq.exists(path) {
                    self.events.emit(SyncEvent::SyncConflict { path: path.to_string() });
                }
            }
            return Ok(());
        }
    }

    pub async fn open(&self, path: &str, mode: OpenMode) -> ShareResult<FileHandle> {
        let path = self.normalize(path);
        if mode == OpenMode::Read {
            self.cache_file(&path).await?;
        }
        Ok(FileHandle { tree: self.clone(), path })
    }

    pub async fn list(&self, path: &str, now: i64) -> ShareResult<Vec<String>> {
        let path = self.normalize(path);
        if let Some(names) = self.list_cache.get(&path, now) {
            return Ok(names);
        }
        let remote_entries = self.remote.list(&path).await?;
        let mut names: Vec<String> = remote_entries.into_iter().map(|s| s.path).collect();
        if let Ok(local_names) = self.local.list(&path).await {
            for name in local_names {
                if names.contains(&name) {
                    continue;
                }
                if let Some(entry) = self.cache.peek(&name) {
                    if entry.created_locally {
                        names.push(name);
                    }
                }
            }
        }
        self.list_cache.put(&path, names.clone(), now);
        Ok(names)
    }

    pub async fn create_file(&self, path: &str) -> ShareResult<FileHandle> {
        let path = self.normalize(path);
        let _guard = self.locks.write_lock(&path).await;
        self.local.write(&path, 0, &[]).await?;
        self.cache.set_created_locally(&path);
        self.cache.persist(&*self.local, &path).await?;
        self.bust_parent_listing(&path);
        Ok(FileHandle { tree: self.clone(), path })
    }

    pub async fn create_directory(&self, path: &str) -> ShareResult<()> {
        let path = self.normalize(path);
        let _guard = self.locks.write_lock(&path).await;
        self.local.create_dir(&path).await?;
        self.rq.queue(NewRqEntry {
            path: path.clone(),
            name: split_parent(&path).1.to_string(),
            method: RqMethod::Put,
            remote_prefix: String::new(),
            local_prefix: String::new(),
            destination: None,
        })?;
        self.bust_parent_listing(&path);
        Ok(())
    }

    /// Recursive only for empty directories (spec §4.C); deletion of a
    /// non-empty directory is a caller error, matching local-tree semantics.
    pub async fn delete_directory(&self, path: &str) -> ShareResult<()> {
        let path = self.normalize(path);
        let _guard = self.locks.write_lock(&path).await;
        let children = self.local.list(&path).await.unwrap_or_default();
        if !children.is_empty() {
            return Err(ShareError::AccessDenied(format!("directory not empty: {path}")));
        }
        self.delete_inner(&path, false).await
    }

    pub async fn delete(&self, path: &str) -> ShareResult<()> {
        let path = self.normalize(path);
        let _guard = self.locks.write_lock(&path).await;
        self.delete_inner(&path, true).await
    }

    async fn delete_inner(&self, path: &str, is_file: bool) -> ShareResult<()> {
        self.rq.queue(NewRqEntry {
            path: path.to_string(),
            name: split_parent(path).1.to_string(),
            method: RqMethod::Delete,
            remote_prefix: String::new(),
            local_prefix: String::new(),
            destination: None,
        })?;
        let _ = is_file;
        if self.local.exists(path).await {
            self.local.delete(path).await?;
        }
        self.cache.remove(path);
        self.local.remove_meta(path).await.ok();
        self.bust_parent_listing(path);
        Ok(())
    }

    /// Atomic at the cache layer: rename locally, drop RQ entries keyed on
    /// `old`'s subtree, enqueue an equivalent remote mutation (spec §4.C).
    pub async fn rename(&self, old: &str, new: &str) -> ShareResult<()> {
        let old = self.normalize(old);
        let new = self.normalize(new);
        let _old_guard = self.locks.write_lock(&old).await;
        let _new_guard = self.locks.write_lock(&new).await;

        self.local.rename(&old, &new).await?;
        self.cache.rename(&old, &new);
        self.rq.remove_path(&old)?;

        if self.remote.supports_native_rename() {
            self.rq.queue(NewRqEntry {
                path: new.clone(),
                name: split_parent(&new).1.to_string(),
                method: RqMethod::Move,
                remote_prefix: String::new(),
                local_prefix: String::new(),
                destination: Some(old.clone()),
            })?;
        } else {
            self.rq.queue(NewRqEntry {
                path: new.clone(),
                name: split_parent(&new).1.to_string(),
                method: RqMethod::Put,
                remote_prefix: String::new(),
                local_prefix: String::new(),
                destination: None,
            })?;
            self.rq.queue(NewRqEntry {
                path: old.clone(),
                name: split_parent(&old).1.to_string(),
                method: RqMethod::Delete,
                remote_prefix: String::new(),
                local_prefix: String::new(),
                destination: None,
            })?;
        }

        self.bust_parent_listing(&old);
        self.bust_parent_listing(&new);
        Ok(())
    }

    /// Invalidates `ListCache` for `path` (recursively if `deep`) and forces
    /// the next `cacheFile` pass to re-compare mtimes (spec §8 property 6).
    pub fn refresh(&self, path: &str, deep: bool) -> ShareResult<()> {
        let path = self.normalize(path);
        self.list_cache.invalidate(&path, deep);
        self.cache.invalidate(&path, deep);
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        self.list_cache.clear();
    }

    fn bust_parent_listing(&self, path: &str) {
        let (parent, _) = split_parent(path);
        self.list_cache.invalidate(parent, false);
    }
}

/// A handle returned by `open`/`create_file` (spec §6): read, write,
/// set_length, flush, close, plus attribute accessors.
pub struct FileHandle {
    tree: CachingTree,
    path: String,
}

impl FileHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn read(&self, offset: u64, len: u64) -> ShareResult<bytes::Bytes> {
        self.tree.cache_file(&self.path).await?;
        self.tree.local.read(&self.path, offset, len).await
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> ShareResult<()> {
        self.tree.cache_file(&self.path).await?;
        self.tree.local.write(&self.path, offset, data).await?;
        self.tree.cache.mark_dirty(&self.path);
        Ok(())
    }

    pub async fn set_length(&self, len: u64) -> ShareResult<()> {
        self.tree.cache_file(&self.path).await?;
        self.tree.local.set_length(&self.path, len).await?;
        self.tree.cache.mark_dirty(&self.path);
        Ok(())
    }

    pub async fn flush(&self) -> ShareResult<()> {
        self.tree.cache.persist(&*self.tree.local, &self.path).await
    }

    /// If dirty, enqueues the sync mutation and clears `dirty` (spec §4.C).
    pub async fn close(&self) -> ShareResult<()> {
        let entry = self.tree.cache.load(&*self.tree.local, &self.path).await?;
        if entry.dirty {
            let method = if entry.created_locally { RqMethod::Put } else { RqMethod::Post };
            self.tree.rq.queue(NewRqEntry {
                path: self.path.clone(),
                name: split_parent(&self.path).1.to_string(),
                method,
                remote_prefix: String::new(),
                local_prefix: String::new(),
                destination: None,
            })?;
            self.tree.cache.clear_dirty(&self.path);
        }
        self.tree.cache.persist(&*self.tree.local, &self.path).await?;
        Ok(())
    }

    pub async fn size(&self) -> ShareResult<u64> {
        self.tree.local.size(&self.path).await
    }

    pub async fn last_modified(&self) -> ShareResult<i64> {
        self.tree.local.last_modified(&self.path).await
    }

    pub async fn set_last_modified(&self, mtime: i64) -> ShareResult<()> {
        self.tree.local.set_last_modified(&self.path, mtime).await
    }

    pub async fn allocation_size(&self) -> ShareResult<u64> {
        const BLOCK: u64 = 4096;
        let size = self.size().await?;
        Ok(size.div_ceil(BLOCK) * BLOCK)
    }

    pub async fn is_dir(&self) -> ShareResult<bool> {
        self.tree.local.is_dir(&self.path).await
    }

    pub async fn is_file(&self) -> ShareResult<bool> {
        Ok(!self.is_dir().await?)
    }

    pub fn is_read_only(&self) -> bool {
        false
    }
}

pub fn now() -> i64 {
    now_ms()
}
