//! Concrete `LocalTree` over the real filesystem (spec §6), playing the
//! role the teacher's raw `std::fs` calls play in `server/src/handlers.rs`:
//! content mirrors the share's path tree under `root`; metadata lives in a
//! parallel `.meta` sidecar tree.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;

use damshare_core::error::{ShareError, ShareResult};
use damshare_core::local::{CacheMeta, LocalTree};

fn map_io_err(path: &str, e: std::io::Error) -> ShareError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ShareError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => ShareError::AccessDenied(path.to_string()),
        _ => ShareError::Corrupted(format!("local I/O error on {path}: {e}")),
    }
}

pub struct FsLocalTree {
    root: PathBuf,
}

impl FsLocalTree {
    pub fn new(root: impl Into<PathBuf>) -> ShareResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| ShareError::Corrupted(format!("cannot create cache root: {e}")))?;
        std::fs::create_dir_all(root.join(".meta"))
            .map_err(|e| ShareError::Corrupted(format!("cannot create meta root: {e}")))?;
        Ok(Self { root })
    }

    fn content_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn meta_path(&self, path: &str) -> PathBuf {
        self.root.join(".meta").join(format!("{}.json", path.trim_start_matches('/')))
    }
}

#[async_trait]
impl LocalTree for FsLocalTree {
    async fn exists(&self, path: &str) -> bool {
        self.content_path(path).exists()
    }

    async fn is_dir(&self, path: &str) -> ShareResult<bool> {
        Ok(self.content_path(path).is_dir())
    }

    async fn read(&self, path: &str, offset: u64, len: u64) -> ShareResult<Bytes> {
        let content_path = self.content_path(path);
        let mut file = std::fs::File::open(&content_path).map_err(|e| map_io_err(path, e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| map_io_err(path, e))?;
        let mut buf = vec![0u8; len as usize];
        let read = file.read(&mut buf).map_err(|e| map_io_err(path, e))?;
        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> ShareResult<()> {
        let content_path = self.content_path(path);
        if let Some(parent) = content_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_io_err(path, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(&content_path)
            .map_err(|e| map_io_err(path, e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| map_io_err(path, e))?;
        file.write_all(data).map_err(|e| map_io_err(path, e))?;
        Ok(())
    }

    async fn set_length(&self, path: &str, len: u64) -> ShareResult<()> {
        let content_path = self.content_path(path);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&content_path)
            .map_err(|e| map_io_err(path, e))?;
        file.set_len(len).map_err(|e| map_io_err(path, e))?;
        Ok(())
    }

    async fn size(&self, path: &str) -> ShareResult<u64> {
        std::fs::metadata(self.content_path(path)).map(|m| m.len()).map_err(|e| map_io_err(path, e))
    }

    async fn last_modified(&self, path: &str) -> ShareResult<i64> {
        let meta = std::fs::metadata(self.content_path(path)).map_err(|e| map_io_err(path, e))?;
        let mtime = meta.modified().map_err(|e| map_io_err(path, e))?;
        let millis = mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        Ok(millis as i64)
    }

    async fn set_last_modified(&self, path: &str, mtime_ms: i64) -> ShareResult<()> {
        let secs = mtime_ms / 1000;
        let nanos = ((mtime_ms % 1000) * 1_000_000) as u32;
        let ft = filetime::FileTime::from_unix_time(secs, nanos);
        filetime::set_file_mtime(self.content_path(path), ft).map_err(|e| map_io_err(path, e))
    }

    async fn delete(&self, path: &str) -> ShareResult<()> {
        let content_path = self.content_path(path);
        if content_path.is_dir() {
            std::fs::remove_dir(&content_path).map_err(|e| map_io_err(path, e))?;
        } else {
            std::fs::remove_file(&content_path).map_err(|e| map_io_err(path, e))?;
        }
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> ShareResult<()> {
        let old_path = self.content_path(old);
        let new_path = self.content_path(new);
        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_io_err(new, e))?;
        }
        match std::fs::rename(&old_path, &new_path) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                copy_then_remove(&old_path, &new_path).map_err(|e| map_io_err(old, e))
            }
            Err(e) => Err(map_io_err(old, e)),
        }
    }

    async fn list(&self, path: &str) -> ShareResult<Vec<String>> {
        let dir = self.content_path(path);
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| map_io_err(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| map_io_err(path, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            names.push(if path.is_empty() { name } else { format!("{path}/{name}") });
        }
        Ok(names)
    }

    async fn create_dir(&self, path: &str) -> ShareResult<()> {
        std::fs::create_dir_all(self.content_path(path)).map_err(|e| map_io_err(path, e))
    }

    async fn read_meta(&self, path: &str) -> ShareResult<Option<CacheMeta>> {
        let meta_path = self.meta_path(path);
        if !meta_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&meta_path).map_err(|e| map_io_err(path, e))?;
        let meta: CacheMeta = serde_json::from_str(&content)
            .map_err(|e| ShareError::Corrupted(format!("cache sidecar unreadable for {path}: {e}")))?;
        Ok(Some(meta))
    }

    async fn write_meta(&self, path: &str, meta: &CacheMeta) -> ShareResult<()> {
        let meta_path = self.meta_path(path);
        if let Some(parent) = meta_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_io_err(path, e))?;
        }
        let content = serde_json::to_string(meta)
            .map_err(|e| ShareError::Corrupted(format!("cannot serialize sidecar for {path}: {e}")))?;
        std::fs::write(&meta_path, content).map_err(|e| map_io_err(path, e))
    }

    async fn remove_meta(&self, path: &str) -> ShareResult<()> {
        let meta_path = self.meta_path(path);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path).map_err(|e| map_io_err(path, e))?;
        }
        Ok(())
    }

    fn local_file_path(&self, path: &str) -> PathBuf {
        self.content_path(path)
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    -1
}

fn copy_then_remove(old: &Path, new: &Path) -> std::io::Result<()> {
    std::fs::copy(old, new)?;
    std::fs::remove_file(old)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FsLocalTree::new(dir.path()).unwrap();
        tree.write("a.txt", 0, b"hello").await.unwrap();
        let data = tree.read("a.txt", 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn meta_sidecar_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FsLocalTree::new(dir.path()).unwrap();
        let meta = CacheMeta { created_locally: true, downloaded_remote_mtime: -1, dirty: true, last_sync: 0 };
        tree.write_meta("a.txt", &meta).await.unwrap();
        let loaded = tree.read_meta("a.txt").await.unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[tokio::test]
    async fn rename_moves_content() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FsLocalTree::new(dir.path()).unwrap();
        tree.write("a.txt", 0, b"hi").await.unwrap();
        tree.rename("a.txt", "b.txt").await.unwrap();
        assert!(!tree.exists("a.txt").await);
        assert!(tree.exists("b.txt").await);
    }
}
