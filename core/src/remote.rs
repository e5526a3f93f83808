//! The `RemoteTree` collaborator (spec §6): the opaque HTTP-backed content
//! repository. Concrete implementations live outside this crate (see
//! `remotetree/`); `core` only depends on the trait.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ShareResult;

#[derive(Debug, Clone)]
pub struct RemoteStat {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub last_modified: i64,
}

#[async_trait]
pub trait RemoteTree: Send + Sync {
    async fn list(&self, path: &str) -> ShareResult<Vec<RemoteStat>>;
    async fn stat(&self, path: &str) -> ShareResult<RemoteStat>;
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> ShareResult<Bytes>;
    async fn create_file_resource(
        &self,
        remote_path: &str,
        local_bytes_path: &std::path::Path,
    ) -> ShareResult<()>;
    async fn update_resource(
        &self,
        remote_path: &str,
        local_bytes_path: &std::path::Path,
    ) -> ShareResult<()>;
    async fn delete_resource(&self, path: &str, is_file: bool) -> ShareResult<()>;
    async fn rename_resource(&self, old: &str, new: &str) -> ShareResult<()>;
    async fn create_directory_resource(&self, path: &str) -> ShareResult<()>;
    /// Whether `rename_resource` is natively supported; RQProcessor falls
    /// back to create-at-dest + delete-at-source when it is not (§4.E).
    fn supports_native_rename(&self) -> bool {
        true
    }
}
