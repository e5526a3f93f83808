//! The local cache overlay (spec §3/§4.C): in-memory `CacheEntry` index
//! backed by the `LocalTree`'s metadata sidecar.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::local::{CacheMeta, LocalTree};
use crate::path::is_under_prefix;

/// One per cached file. `downloaded_remote_mtime` is `-1` until the first
/// successful download (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub path: String,
    pub created_locally: bool,
    pub downloaded_remote_mtime: i64,
    pub dirty: bool,
    pub last_sync: i64,
}

impl CacheEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            created_locally: false,
            downloaded_remote_mtime: -1,
            dirty: false,
            last_sync: 0,
        }
    }

    fn from_meta(path: &str, meta: CacheMeta) -> Self {
        Self {
            path: path.to_string(),
            created_locally: meta.created_locally,
            downloaded_remote_mtime: meta.downloaded_remote_mtime,
            dirty: meta.dirty,
            last_sync: meta.last_sync,
        }
    }

    fn to_meta(&self) -> CacheMeta {
        CacheMeta {
            created_locally: self.created_locally,
            downloaded_remote_mtime: self.downloaded_remote_mtime,
            dirty: self.dirty,
            last_sync: self.last_sync,
        }
    }

    /// `can_delete` in spec §4.C step 5: no local uncommitted changes, so the
    /// cached copy may be replaced by a fresh download without data loss.
    pub fn can_delete(&self) -> bool {
        !self.dirty
    }
}

/// In-memory index of `CacheEntry`s, mirrored to the `LocalTree`'s sidecar
/// for durability across restart. Callers hold `PathLock` around the
/// mutating sequences described in spec §4.C; this struct itself only
/// guards map consistency.
#[derive(Default)]
pub struct LocalCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn peek(&self, path: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    /// Returns the in-memory entry if present, else loads the sidecar via
    /// `tree`, populating the index (creating a fresh entry if no sidecar
    /// exists either — the file has never been cached).
    pub async fn load(&self, tree: &dyn LocalTree, path: &str) -> crate::error::ShareResult<CacheEntry> {
        if let Some(entry) = self.peek(path) {
            return Ok(entry);
        }
        let entry = match tree.read_meta(path).await? {
            Some(meta) => CacheEntry::from_meta(path, meta),
            None => CacheEntry::new(path),
        };
        self.entries.lock().unwrap().insert(path.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(entry.path.clone(), entry);
    }

    /// Writes the in-memory entry's metadata to the sidecar (spec §3:
    /// "metadata lives in a sidecar keyed by path").
    pub async fn persist(&self, tree: &dyn LocalTree, path: &str) -> crate::error::ShareResult<()> {
        let meta = {
            let entries = self.entries.lock().unwrap();
            entries.get(path).map(CacheEntry::to_meta)
        };
        if let Some(meta) = meta {
            tree.write_meta(path, &meta).await?;
        }
        Ok(())
    }

    pub fn mark_dirty(&self, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(path.to_string()).or_insert_with(|| CacheEntry::new(path)).dirty = true;
    }

    pub fn set_created_locally(&self, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(path.to_string()).or_insert_with(|| CacheEntry::new(path));
        entry.created_locally = true;
        entry.dirty = true;
    }

    /// Applies spec §3 invariant 4: `created_locally` can only ever flip
    /// true→false, recorded after the first successful upload.
    pub fn mark_synced(&self, path: &str, now: i64, remote_mtime: i64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(path.to_string()).or_insert_with(|| CacheEntry::new(path));
        entry.created_locally = false;
        entry.dirty = false;
        entry.last_sync = now;
        entry.downloaded_remote_mtime = remote_mtime;
    }

    /// Clears `dirty` once the mutation has been durably enqueued into the
    /// RQ (spec §4.C `close`: "enqueue ... and clear dirty").
    pub fn clear_dirty(&self, path: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(path) {
            entry.dirty = false;
        }
    }

    pub fn mark_downloaded(&self, path: &str, remote_mtime: i64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(path.to_string()).or_insert_with(|| CacheEntry::new(path));
        entry.downloaded_remote_mtime = remote_mtime;
        entry.dirty = false;
        entry.created_locally = false;
    }

    pub fn remove(&self, path: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().remove(path)
    }

    pub fn remove_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|p, _| !is_under_prefix(p, prefix) && p != prefix);
    }

    /// Forces the next `cacheFile` pass to re-compare against the remote by
    /// invalidating the recorded mtime, unless the file is a local-only
    /// creation (for which there is nothing remote to compare against yet).
    pub fn invalidate(&self, path: &str, deep: bool) {
        let mut entries = self.entries.lock().unwrap();
        for (p, entry) in entries.iter_mut() {
            let matches = p == path || (deep && is_under_prefix(p, path));
            if matches && !entry.created_locally {
                entry.downloaded_remote_mtime = -1;
            }
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Moves an entry (and any descendant entries, for a directory rename)
    /// from `old` to `new`, rewriting their stored path.
    pub fn rename(&self, old: &str, new: &str) {
        let mut entries = self.entries.lock().unwrap();
        let to_move: Vec<String> = entries
            .keys()
            .filter(|p| p.as_str() == old || is_under_prefix(p, old))
            .cloned()
            .collect();
        for old_path in to_move {
            if let Some(mut entry) = entries.remove(&old_path) {
                let new_path = if old_path == old {
                    new.to_string()
                } else {
                    format!("{new}{}", &old_path[old.len()..])
                };
                entry.path = new_path.clone();
                entries.insert(new_path, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_rewrites_subtree_paths() {
        let cache = LocalCache::new();
        cache.insert(CacheEntry::new("/dir/a.jpg"));
        cache.insert(CacheEntry::new("/dir/sub/b.jpg"));
        cache.insert(CacheEntry::new("/other.jpg"));

        cache.rename("/dir", "/moved");

        assert!(cache.peek("/dir/a.jpg").is_none());
        assert!(cache.peek("/moved/a.jpg").is_some());
        assert!(cache.peek("/moved/sub/b.jpg").is_some());
        assert!(cache.peek("/other.jpg").is_some());
    }

    #[test]
    fn mark_synced_flips_created_locally_to_false() {
        let cache = LocalCache::new();
        cache.set_created_locally("/a.jpg");
        assert!(cache.peek("/a.jpg").unwrap().created_locally);
        cache.mark_synced("/a.jpg", 1000, 999);
        let entry = cache.peek("/a.jpg").unwrap();
        assert!(!entry.created_locally);
        assert!(!entry.dirty);
        assert_eq!(entry.last_sync, 1000);
    }

    #[test]
    fn remove_prefix_drops_subtree_only() {
        let cache = LocalCache::new();
        cache.insert(CacheEntry::new("/dir/a.jpg"));
        cache.insert(CacheEntry::new("/dir2/a.jpg"));
        cache.remove_prefix("/dir");
        assert!(cache.peek("/dir/a.jpg").is_none());
        assert!(cache.peek("/dir2/a.jpg").is_some());
    }
}
