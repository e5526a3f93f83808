//! TTL-bounded memoization of directory listings (spec §4.F), keyed by
//! normalized path. Grounded on the pack's `ReaddirCache` shape (TTL
//! get/put/invalidate over an `RwLock<HashMap<...>>`).

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone)]
struct ListEntry {
    timestamp: i64,
    names: Vec<String>,
}

#[derive(Default)]
pub struct ListCache {
    entries: RwLock<HashMap<String, ListEntry>>,
    ttl_ms: i64,
}

impl ListCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl_ms }
    }

    /// Returns the cached listing if `now - timestamp < ttl_ms`; otherwise
    /// evicts the stale entry and returns `None`.
    pub fn get(&self, path: &str, now: i64) -> Option<Vec<String>> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(path) {
                if now - entry.timestamp < self.ttl_ms {
                    return Some(entry.names.clone());
                }
            } else {
                return None;
            }
        }
        self.entries.write().unwrap().remove(path);
        None
    }

    pub fn put(&self, path: &str, names: Vec<String>, now: i64) {
        self.entries
            .write()
            .unwrap()
            .insert(path.to_string(), ListEntry { timestamp: now, names });
    }

    /// Removes `path`; if `deep`, also removes every cached path whose
    /// normalized form begins with `path + "/"` (spec §4.F).
    pub fn invalidate(&self, path: &str, deep: bool) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(path);
        if deep {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            entries.retain(|p, _| !p.starts_with(&prefix));
        }
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_ttl() {
        let cache = ListCache::new(100);
        cache.put("/a", vec!["x".into()], 1000);
        assert_eq!(cache.get("/a", 1050), Some(vec!["x".to_string()]));
        assert_eq!(cache.get("/a", 1200), None);
    }

    #[test]
    fn deep_invalidate_clears_subtree() {
        let cache = ListCache::new(10_000);
        cache.put("/dir", vec!["a".into()], 0);
        cache.put("/dir/sub", vec!["b".into()], 0);
        cache.put("/other", vec!["c".into()], 0);
        cache.invalidate("/dir", true);
        assert!(cache.get("/dir", 0).is_none());
        assert!(cache.get("/dir/sub", 0).is_none());
        assert!(cache.get("/other", 0).is_some());
    }

    #[test]
    fn shallow_invalidate_keeps_subtree() {
        let cache = ListCache::new(10_000);
        cache.put("/dir", vec!["a".into()], 0);
        cache.put("/dir/sub", vec!["b".into()], 0);
        cache.invalidate("/dir", false);
        assert!(cache.get("/dir", 0).is_none());
        assert!(cache.get("/dir/sub", 0).is_some());
    }
}
