//! The `LocalTree` collaborator (spec §6): an opaque local filesystem with
//! path-addressed file CRUD plus a companion metadata sidecar. Concrete
//! implementations live outside this crate (see `localtree/`); `core` only
//! depends on the trait.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ShareResult;

/// The cache metadata sidecar persisted alongside each cached file's bytes
/// (spec §6: "an object `{created_locally, downloaded_remote_mtime,
/// last_sync}`", extended here with `dirty` so a crash-restart does not
/// lose track of unflushed writes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheMeta {
    pub created_locally: bool,
    pub downloaded_remote_mtime: i64,
    pub dirty: bool,
    pub last_sync: i64,
}

#[async_trait]
pub trait LocalTree: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
    async fn is_dir(&self, path: &str) -> ShareResult<bool>;
    async fn read(&self, path: &str, offset: u64, len: u64) -> ShareResult<Bytes>;
    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> ShareResult<()>;
    async fn set_length(&self, path: &str, len: u64) -> ShareResult<()>;
    async fn size(&self, path: &str) -> ShareResult<u64>;
    async fn last_modified(&self, path: &str) -> ShareResult<i64>;
    async fn set_last_modified(&self, path: &str, mtime: i64) -> ShareResult<()>;
    async fn delete(&self, path: &str) -> ShareResult<()>;
    async fn rename(&self, old: &str, new: &str) -> ShareResult<()>;
    async fn list(&self, path: &str) -> ShareResult<Vec<String>>;
    async fn create_dir(&self, path: &str) -> ShareResult<()>;
    async fn read_meta(&self, path: &str) -> ShareResult<Option<CacheMeta>>;
    async fn write_meta(&self, path: &str, meta: &CacheMeta) -> ShareResult<()>;
    async fn remove_meta(&self, path: &str) -> ShareResult<()>;
    /// Absolute filesystem path of the cached bytes, for streaming upload
    /// (`create_file_resource`/`update_resource` take a path, not a buffer).
    fn local_file_path(&self, path: &str) -> PathBuf;
}
