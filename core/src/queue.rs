//! The persistent Request Queue (spec §4.B): per-`(path,name)` pending
//! mutations, coalesced on insert, drained with retry/backoff and an
//! expiration floor.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ShareError, ShareResult};
use crate::path::is_under_prefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RqMethod {
    Put,
    Post,
    Delete,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RqEntry {
    pub id: u64,
    pub path: String,
    pub name: String,
    pub method: RqMethod,
    pub remote_prefix: String,
    pub local_prefix: String,
    pub timestamp: i64,
    pub retries: u32,
    pub destination: Option<String>,
    /// Entries become eligible for processing again only once `now >=
    /// next_eligible_at`; set by `increment_retry_count`'s backoff delay.
    #[serde(default)]
    pub next_eligible_at: i64,
    /// Bumped on every `queue()` call that touches this `(path,name)`,
    /// including no-op coalescing. `RqProcessor` snapshots this before
    /// releasing the write lock for the network call and compares it after
    /// re-acquiring to detect a write that raced the in-flight upload (§4.E
    /// "Abort detection"), since coalescing keeps the same `id`.
    #[serde(default)]
    pub version: u64,
}

/// The parameters a caller supplies when enqueuing a new mutation; `queue`
/// fills in `id`/`timestamp`/`retries` and applies the coalescing rule.
#[derive(Debug, Clone)]
pub struct NewRqEntry {
    pub path: String,
    pub name: String,
    pub method: RqMethod,
    pub remote_prefix: String,
    pub local_prefix: String,
    pub destination: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
enum RqRecord {
    Queued(RqEntry),
    Completed { path: String, name: String },
    Purged { path: String, name: String, reason: String },
    RetryIncremented { path: String, name: String, retries: u32, next_eligible_at: i64 },
}

pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// Applies spec §3 rule 5: `CREATE(PUT) + UPDATE(POST) = CREATE(PUT)`;
/// `* + DELETE = DELETE`; `DELETE + CREATE = UPDATE(POST)`.
fn coalesce_method(old: RqMethod, new: RqMethod) -> RqMethod {
    use RqMethod::*;
    match (old, new) {
        (_, Delete) => Delete,
        (Delete, Put) | (Delete, Post) => Post,
        (Put, Post) => Put,
        _ => new,
    }
}

struct QueueState {
    entries: HashMap<String, RqEntry>,
    next_id: u64,
    leases: HashMap<String, i64>,
}

/// Per-share persistent mutation backlog.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    log_path: PathBuf,
    lease_duration_ms: i64,
}

impl RequestQueue {
    /// Opens (or creates) the append-only log at `log_path` and replays it
    /// to reconstruct the in-memory index.
    pub fn open(log_path: impl Into<PathBuf>) -> ShareResult<Self> {
        let log_path = log_path.into();
        let entries = if log_path.exists() {
            Self::replay(&log_path)?
        } else {
            HashMap::new()
        };
        let next_id = entries.values().map(|e| e.id).max().unwrap_or(0) + 1;
        Ok(Self {
            state: Mutex::new(QueueState { entries, next_id, leases: HashMap::new() }),
            log_path,
            lease_duration_ms: 30_000,
        })
    }

    fn replay(log_path: &Path) -> ShareResult<HashMap<String, RqEntry>> {
        let file = File::open(log_path)
            .map_err(|e| ShareError::Corrupted(format!("cannot open RQ log: {e}")))?;
        let mut entries = HashMap::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ShareError::Corrupted(format!("RQ log read error: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RqRecord = serde_json::from_str(&line).map_err(|e| {
                ShareError::Corrupted(format!("RQ log line {lineno} unparseable: {e}"))
            })?;
            match record {
                RqRecord::Queued(entry) => {
                    entries.insert(entry.path.clone(), entry);
                }
                RqRecord::Completed { path, .. } | RqRecord::Purged { path, .. } => {
                    entries.remove(&path);
                }
                RqRecord::RetryIncremented { path, retries, next_eligible_at, .. } => {
                    if let Some(entry) = entries.get_mut(&path) {
                        entry.retries = retries;
                        entry.next_eligible_at = next_eligible_at;
                    }
                }
            }
        }
        Ok(entries)
    }

    fn append(&self, record: &RqRecord) -> ShareResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| ShareError::Corrupted(format!("cannot open RQ log for append: {e}")))?;
        let line = serde_json::to_string(record)
            .map_err(|e| ShareError::Corrupted(format!("cannot serialize RQ record: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| ShareError::Corrupted(format!("cannot write RQ log: {e}")))?;
        file.sync_all().map_err(|e| ShareError::Corrupted(format!("cannot fsync RQ log: {e}")))?;
        Ok(())
    }

    /// Inserts a new mutation, coalescing with any existing entry for the
    /// same path per spec §3 rule 5.
    pub fn queue(&self, new_entry: NewRqEntry) -> ShareResult<RqEntry> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            let timestamp = now_ms();
            let entry = match state.entries.get(&new_entry.path) {
                Some(existing) => RqEntry {
                    id: existing.id,
                    path: new_entry.path.clone(),
                    name: new_entry.name,
                    method: coalesce_method(existing.method, new_entry.method),
                    remote_prefix: new_entry.remote_prefix,
                    local_prefix: new_entry.local_prefix,
                    timestamp: existing.timestamp.min(timestamp),
                    retries: existing.retries,
                    destination: new_entry.destination.or_else(|| existing.destination.clone()),
                    next_eligible_at: existing.next_eligible_at,
                    version: existing.version + 1,
                },
                None => RqEntry {
                    id,
                    path: new_entry.path.clone(),
                    name: new_entry.name,
                    method: new_entry.method,
                    remote_prefix: new_entry.remote_prefix,
                    local_prefix: new_entry.local_prefix,
                    timestamp,
                    retries: 0,
                    destination: new_entry.destination,
                    next_eligible_at: 0,
                    version: 0,
                },
            };
            state.entries.insert(new_entry.path.clone(), entry.clone());
            entry
        };
        self.append(&RqRecord::Queued(entry.clone()))?;
        Ok(entry)
    }

    pub fn remove(&self, path: &str) -> ShareResult<()> {
        let name = {
            let mut state = self.state.lock().unwrap();
            state.entries.remove(path).map(|e| e.name)
        };
        if let Some(name) = name {
            self.append(&RqRecord::Purged {
                path: path.to_string(),
                name,
                reason: "removed".to_string(),
            })?;
        }
        Ok(())
    }

    /// Drops all entries whose path is `prefix` or nested under it — used
    /// when a containing directory is renamed (spec §9: "descendant RQ
    /// entries are purged by prefix on parent rename").
    pub fn remove_path(&self, prefix: &str) -> ShareResult<()> {
        let removed: Vec<(String, String)> = {
            let mut state = self.state.lock().unwrap();
            let to_remove: Vec<String> = state
                .entries
                .keys()
                .filter(|p| is_under_prefix(p, prefix))
                .cloned()
                .collect();
            to_remove
                .into_iter()
                .filter_map(|p| state.entries.remove(&p).map(|e| (p, e.name)))
                .collect()
        };
        for (path, name) in removed {
            self.append(&RqRecord::Purged { path, name, reason: "parent renamed".to_string() })?;
        }
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(path)
    }

    /// Returns the oldest eligible entry (age `>= expiration`, `retries <=
    /// max_retries`, not currently leased to another processor, and past
    /// its backoff deadline), leasing it to the caller.
    pub fn get_process_request(
        &self,
        now: i64,
        expiration_ms: i64,
        max_retries: u32,
    ) -> Option<RqEntry> {
        let mut state = self.state.lock().unwrap();
        state.leases.retain(|_, expiry| *expiry > now);
        let leases = state.leases.clone();
        let candidate = state
            .entries
            .values()
            .filter(|e| {
                now - e.timestamp >= expiration_ms
                    && e.retries <= max_retries
                    && now >= e.next_eligible_at
                    && !leases.contains_key(&e.path)
            })
            .min_by_key(|e| (e.timestamp, e.id))
            .cloned();
        if let Some(entry) = &candidate {
            state.leases.insert(entry.path.clone(), now + self.lease_duration_ms);
        }
        candidate
    }

    /// Releases a lease early (e.g. the processor aborted this path) so a
    /// later `get_process_request` call can pick it up again immediately.
    pub fn release_lease(&self, path: &str) {
        self.state.lock().unwrap().leases.remove(path);
    }

    pub fn increment_retry_count(&self, path: &str, name: &str, delay_ms: i64) -> ShareResult<()> {
        let retries = {
            let mut state = self.state.lock().unwrap();
            state.leases.remove(path);
            match state.entries.get_mut(path) {
                Some(entry) => {
                    entry.retries += 1;
                    entry.next_eligible_at = now_ms() + delay_ms;
                    Some(entry.retries)
                }
                None => None,
            }
        };
        if let Some(retries) = retries {
            let next_eligible_at = now_ms() + delay_ms;
            self.append(&RqRecord::RetryIncremented {
                path: path.to_string(),
                name: name.to_string(),
                retries,
                next_eligible_at,
            })?;
        }
        Ok(())
    }

    pub fn complete(&self, path: &str, name: &str) -> ShareResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.entries.remove(path);
            state.leases.remove(path);
        }
        self.append(&RqRecord::Completed { path: path.to_string(), name: name.to_string() })
    }

    pub fn purge(&self, path: &str, name: &str, reason: &str) -> ShareResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.entries.remove(path);
            state.leases.remove(path);
        }
        self.append(&RqRecord::Purged {
            path: path.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn get(&self, path: &str) -> Option<RqEntry> {
        self.state.lock().unwrap().entries.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(path: &str, method: RqMethod) -> NewRqEntry {
        NewRqEntry {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            method,
            remote_prefix: String::new(),
            local_prefix: String::new(),
            destination: None,
        }
    }

    #[test]
    fn coalescing_law_put_post_delete_yields_delete() {
        let dir = tempfile::tempdir().unwrap();
        let rq = RequestQueue::open(dir.path().join("rq.log")).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Put)).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Post)).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Delete)).unwrap();
        assert_eq!(rq.len(), 1);
        assert_eq!(rq.get("/a.jpg").unwrap().method, RqMethod::Delete);
    }

    #[test]
    fn put_then_post_stays_put() {
        let dir = tempfile::tempdir().unwrap();
        let rq = RequestQueue::open(dir.path().join("rq.log")).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Put)).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Post)).unwrap();
        assert_eq!(rq.get("/a.jpg").unwrap().method, RqMethod::Put);
    }

    #[test]
    fn delete_then_create_becomes_update() {
        let dir = tempfile::tempdir().unwrap();
        let rq = RequestQueue::open(dir.path().join("rq.log")).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Delete)).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Put)).unwrap();
        assert_eq!(rq.get("/a.jpg").unwrap().method, RqMethod::Post);
    }

    #[test]
    fn remove_path_drops_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let rq = RequestQueue::open(dir.path().join("rq.log")).unwrap();
        rq.queue(new_entry("/e/f.jpg", RqMethod::Post)).unwrap();
        rq.queue(new_entry("/e/g/h.jpg", RqMethod::Post)).unwrap();
        rq.queue(new_entry("/other.jpg", RqMethod::Post)).unwrap();
        rq.remove_path("/e").unwrap();
        assert!(!rq.exists("/e/f.jpg"));
        assert!(!rq.exists("/e/g/h.jpg"));
        assert!(rq.exists("/other.jpg"));
    }

    #[test]
    fn persists_and_replays_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("rq.log");
        {
            let rq = RequestQueue::open(&log_path).unwrap();
            rq.queue(new_entry("/a.jpg", RqMethod::Put)).unwrap();
            rq.queue(new_entry("/b.jpg", RqMethod::Post)).unwrap();
            rq.complete("/b.jpg", "b.jpg").unwrap();
        }
        let rq = RequestQueue::open(&log_path).unwrap();
        assert!(rq.exists("/a.jpg"));
        assert!(!rq.exists("/b.jpg"));
    }

    #[test]
    fn get_process_request_respects_expiration_and_retry_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let rq = RequestQueue::open(dir.path().join("rq.log")).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Put)).unwrap();
        let now = now_ms();
        assert!(rq.get_process_request(now, 10_000, 3).is_none());
        assert!(rq.get_process_request(now, 0, 3).is_some());
    }

    #[test]
    fn leased_entry_is_skipped_until_lease_expires() {
        let dir = tempfile::tempdir().unwrap();
        let rq = RequestQueue::open(dir.path().join("rq.log")).unwrap();
        rq.queue(new_entry("/a.jpg", RqMethod::Put)).unwrap();
        let now = now_ms();
        let first = rq.get_process_request(now, 0, 3);
        assert!(first.is_some());
        assert!(rq.get_process_request(now, 0, 3).is_none());
        rq.release_lease("/a.jpg");
        assert!(rq.get_process_request(now, 0, 3).is_some());
    }
}
