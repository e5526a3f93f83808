//! A thin SMB2 dispatch shim (spec §1 Non-goals: "the core does not
//! implement SMB itself"). Session/tree-connect/file-handle bookkeeping and
//! command routing live here; actual wire framing, negotiation, and
//! authentication are out of scope and not implemented — this crate exists
//! to prove `damshare_core::caching_tree::CachingTree` integrates behind
//! SMB2-shaped verbs, not to decode PDUs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use damshare_core::caching_tree::{CachingTree, FileHandle, OpenMode};
use damshare_core::error::{ShareError, ShareResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

struct TreeConnect {
    share_name: String,
}

/// Routes SMB2-shaped verbs (`CREATE`, `READ`, `WRITE`, `CLOSE`,
/// `QUERY_DIRECTORY`, rename-by-`SET_INFO`) to one `CachingTree`, keyed by
/// session/tree-connect/file-id the way a real SMB2 server would track
/// them, minus the wire protocol itself.
pub struct Dispatcher {
    tree: CachingTree,
    sessions: Mutex<HashMap<SessionId, ()>>,
    trees: Mutex<HashMap<TreeId, TreeConnect>>,
    opens: Mutex<HashMap<FileId, FileHandle>>,
    next_session: AtomicU64,
    next_tree: AtomicU64,
    next_file: AtomicU64,
}

impl Dispatcher {
    pub fn new(tree: CachingTree) -> Self {
        Self {
            tree,
            sessions: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_tree: AtomicU64::new(1),
            next_file: AtomicU64::new(1),
        }
    }

    pub fn session_setup(&self) -> SessionId {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().unwrap().insert(id, ());
        id
    }

    pub fn logoff(&self, session: SessionId) {
        self.sessions.lock().unwrap().remove(&session);
    }

    pub fn tree_connect(&self, session: SessionId, share_name: &str) -> ShareResult<TreeId> {
        if !self.sessions.lock().unwrap().contains_key(&session) {
            return Err(ShareError::AccessDenied("no such session".to_string()));
        }
        let id = TreeId(self.next_tree.fetch_add(1, Ordering::SeqCst));
        self.trees.lock().unwrap().insert(id, TreeConnect { share_name: share_name.to_string() });
        Ok(id)
    }

    pub fn tree_disconnect(&self, tree: TreeId) {
        self.trees.lock().unwrap().remove(&tree);
    }

    fn require_tree(&self, tree: TreeId) -> ShareResult<()> {
        if self.trees.lock().unwrap().contains_key(&tree) {
            Ok(())
        } else {
            Err(ShareError::AccessDenied("no such tree connect".to_string()))
        }
    }

    /// SMB2 `CREATE`: opens (or creates) a file and returns its handle id.
    pub async fn create(&self, tree: TreeId, path: &str, create_new: bool, write: bool) -> ShareResult<FileId> {
        self.require_tree(tree)?;
        let handle = if create_new {
            self.tree.create_file(path).await?
        } else {
            let mode = if write { OpenMode::Write } else { OpenMode::Read };
            self.tree.open(path, mode).await?
        };
        let id = FileId(self.next_file.fetch_add(1, Ordering::SeqCst));
        self.opens.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    fn require_open(&self, file: FileId) -> ShareResult<()> {
        if self.opens.lock().unwrap().contains_key(&file) {
            Ok(())
        } else {
            Err(ShareError::NotFound("no such open file".to_string()))
        }
    }

    pub async fn read(&self, file: FileId, offset: u64, len: u64) -> ShareResult<Bytes> {
        let path = {
            self.require_open(file)?;
            let opens = self.opens.lock().unwrap();
            opens.get(&file).unwrap().path().to_string()
        };
        let handle = self.tree.open(&path, OpenMode::Read).await?;
        handle.read(offset, len).await
    }

    pub async fn write(&self, file: FileId, offset: u64, data: &[u8]) -> ShareResult<()> {
        let path = {
            self.require_open(file)?;
            let opens = self.opens.lock().unwrap();
            opens.get(&file).unwrap().path().to_string()
        };
        let handle = self.tree.open(&path, OpenMode::Write).await?;
        handle.write(offset, data).await
    }

    pub async fn close(&self, file: FileId) -> ShareResult<()> {
        let handle = self.opens.lock().unwrap().remove(&file);
        match handle {
            Some(handle) => handle.close().await,
            None => Err(ShareError::NotFound("no such open file".to_string())),
        }
    }

    pub async fn query_directory(&self, tree: TreeId, path: &str, now: i64) -> ShareResult<Vec<String>> {
        self.require_tree(tree)?;
        self.tree.list(path, now).await
    }

    pub async fn rename(&self, tree: TreeId, old: &str, new: &str) -> ShareResult<()> {
        self.require_tree(tree)?;
        self.tree.rename(old, new).await
    }

    pub async fn delete(&self, tree: TreeId, path: &str, is_dir: bool) -> ShareResult<()> {
        self.require_tree(tree)?;
        if is_dir {
            self.tree.delete_directory(path).await
        } else {
            self.tree.delete(path).await
        }
    }

    pub fn share_name(&self, tree: TreeId) -> Option<String> {
        self.trees.lock().unwrap().get(&tree).map(|t| t.share_name.clone())
    }
}
