//! Bridges the synchronous `fuser::Filesystem` trait to the async
//! `CachingTree`, the way the teacher's `fs/mod.rs` bridges to its
//! `reqwest`-based API client: one `tokio::runtime::Runtime::block_on` call
//! per kernel request, inode numbers minted lazily as paths are discovered.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use damshare_core::caching_tree::{FileHandle, OpenMode};
use damshare_core::Share;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::{EIO, ENOENT, ENOTEMPTY};

use crate::attr_cache::AttributeCache;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

const ROOT_ATTR: FileAttr = FileAttr {
    ino: ROOT_INO,
    size: 0,
    blocks: 0,
    atime: UNIX_EPOCH,
    mtime: UNIX_EPOCH,
    ctime: UNIX_EPOCH,
    crtime: UNIX_EPOCH,
    kind: FileType::Directory,
    perm: 0o755,
    nlink: 2,
    uid: 501,
    gid: 20,
    rdev: 0,
    flags: 0,
    blksize: 4096,
};

struct Inodes {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

impl Inodes {
    fn new() -> Self {
        let mut ino_to_path = HashMap::new();
        let mut path_to_ino = HashMap::new();
        ino_to_path.insert(ROOT_INO, String::new());
        path_to_ino.insert(String::new(), ROOT_INO);
        Self { path_to_ino, ino_to_path, next_ino: 2 }
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.path_to_ino.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn file_attr(ino: u64, is_dir: bool, size: u64, mtime_ms: i64) -> FileAttr {
    let mtime = UNIX_EPOCH + Duration::from_millis(mtime_ms.max(0) as u64);
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: if is_dir { FileType::Directory } else { FileType::RegularFile },
        perm: if is_dir { 0o755 } else { 0o644 },
        nlink: if is_dir { 2 } else { 1 },
        uid: 501,
        gid: 20,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

/// Owns the mounted `Share` and the inode bookkeeping `fuser` requires but
/// `CachingTree` (path-addressed) doesn't need.
pub struct FsWrapper {
    share: Share,
    runtime: tokio::runtime::Runtime,
    inodes: Mutex<Inodes>,
    open_files: Mutex<HashMap<u64, FileHandle>>,
    next_fh: Mutex<u64>,
    attr_cache: Mutex<AttributeCache>,
    attr_ttl: Duration,
}

impl FsWrapper {
    pub fn new(share: Share, runtime: tokio::runtime::Runtime) -> Self {
        let attr_cache = AttributeCache::new(&share.config);
        let attr_ttl = Duration::from_secs(share.config.attribute_cache_ttl_seconds);
        Self {
            share,
            runtime,
            inodes: Mutex::new(Inodes::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: Mutex::new(1),
            attr_cache: Mutex::new(attr_cache),
            attr_ttl,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.lock().unwrap().path_of(ino)
    }

    fn ino_for(&self, path: &str) -> u64 {
        self.inodes.lock().unwrap().ino_for(path)
    }

    fn attr_for(&self, ino: u64, path: &str) -> Option<FileAttr> {
        if ino == ROOT_INO {
            return Some(ROOT_ATTR);
        }
        if let Some(attr) = self.attr_cache.lock().unwrap().get(ino) {
            return Some(attr);
        }
        let attr = self.runtime.block_on(async {
            let handle = self.share.tree.open(path, OpenMode::Read).await.ok()?;
            let is_dir = handle.is_dir().await.unwrap_or(false);
            let size = if is_dir { 0 } else { handle.size().await.unwrap_or(0) };
            let mtime = handle.last_modified().await.unwrap_or(0);
            Some(file_attr(ino, is_dir, size, mtime))
        })?;
        self.attr_cache.lock().unwrap().put(ino, attr.clone(), self.attr_ttl);
        Some(attr)
    }

    fn invalidate_attr(&self, ino: u64) {
        self.attr_cache.lock().unwrap().remove(ino);
    }

    fn next_handle_id(&self) -> u64 {
        let mut guard = self.next_fh.lock().unwrap();
        let id = *guard;
        *guard += 1;
        id
    }
}

impl Filesystem for FsWrapper {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join(&parent_path, name_str);
        if !self.runtime.block_on(self.share.tree.exists(&full_path)) {
            reply.error(ENOENT);
            return;
        }
        let ino = self.ino_for(&full_path);
        match self.attr_for(ino, &full_path) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_for(ino, &path) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(dir_path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::new();
        if offset == 0 {
            entries.push((ino, FileType::Directory, ".".to_string()));
            let parent_path = dir_path.rsplit_once('/').map_or("", |(p, _)| p);
            let parent_ino = if ino == ROOT_INO { ROOT_INO } else { self.ino_for(parent_path) };
            entries.push((parent_ino, FileType::Directory, "..".to_string()));
        }

        let now = damshare_core::caching_tree::now();
        let names = match self.runtime.block_on(self.share.tree.list(&dir_path, now)) {
            Ok(names) => names,
            Err(_) => {
                reply.ok();
                return;
            }
        };

        for name in names {
            let full_path = join(&dir_path, &name);
            let child_ino = self.ino_for(&full_path);
            let is_dir = self
                .runtime
                .block_on(async {
                    let handle = self.share.tree.open(&full_path, OpenMode::Read).await.ok()?;
                    handle.is_dir().await.ok()
                })
                .unwrap_or(false);
            let kind = if is_dir { FileType::Directory } else { FileType::RegularFile };
            entries.push((child_ino, kind, name));
        }

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let write_access = (flags & libc::O_WRONLY != 0) || (flags & libc::O_RDWR != 0);
        let mode = if write_access { OpenMode::Write } else { OpenMode::Read };
        match self.runtime.block_on(self.share.tree.open(&path, mode)) {
            Ok(handle) => {
                let fh = self.next_handle_id();
                self.open_files.lock().unwrap().insert(fh, handle);
                reply.opened(fh, 0);
            }
            Err(_) => reply.error(ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let handle = self.open_files.lock().unwrap().get(&fh).map(|h| h.path().to_string());
        let Some(path) = handle else {
            reply.error(libc::EBADF);
            return;
        };
        let result = self.runtime.block_on(async {
            let handle = self.share.tree.open(&path, OpenMode::Read).await?;
            handle.read(offset as u64, size as u64).await
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(_) => reply.error(EIO),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = self.open_files.lock().unwrap().get(&fh).map(|h| h.path().to_string());
        let Some(path) = path else {
            reply.error(libc::EBADF);
            return;
        };
        let result = self.runtime.block_on(async {
            let handle = self.share.tree.open(&path, OpenMode::Write).await?;
            handle.write(offset as u64, data).await
        });
        match result {
            Ok(()) => {
                self.invalidate_attr(_ino);
                reply.written(data.len() as u32)
            }
            Err(_) => reply.error(EIO),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.open_files.lock().unwrap().remove(&fh) {
            let _ = self.runtime.block_on(handle.close());
            self.invalidate_attr(ino);
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join(&parent_path, name_str);
        match self.runtime.block_on(self.share.tree.create_file(&full_path)) {
            Ok(handle) => {
                let ino = self.ino_for(&full_path);
                let attr = file_attr(ino, false, 0, damshare_core::caching_tree::now());
                let fh = self.next_handle_id();
                self.open_files.lock().unwrap().insert(fh, handle);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(_) => reply.error(EIO),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join(&parent_path, name_str);
        match self.runtime.block_on(self.share.tree.create_directory(&full_path)) {
            Ok(()) => {
                let ino = self.ino_for(&full_path);
                let attr = file_attr(ino, true, 0, damshare_core::caching_tree::now());
                reply.entry(&TTL, &attr, 0);
            }
            Err(_) => reply.error(EIO),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join(&parent_path, name_str);
        let ino = self.ino_for(&full_path);
        match self.runtime.block_on(self.share.tree.delete(&full_path)) {
            Ok(()) => {
                self.invalidate_attr(ino);
                reply.ok();
            }
            Err(e) if e.is_not_found() => reply.error(ENOENT),
            Err(_) => reply.error(EIO),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let full_path = join(&parent_path, name_str);
        match self.runtime.block_on(self.share.tree.delete_directory(&full_path)) {
            Ok(()) => reply.ok(),
            Err(e) if e.is_not_found() => reply.error(ENOENT),
            Err(_) => reply.error(ENOTEMPTY),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(new_parent_path)) = (self.path_of(parent), self.path_of(newparent)) else {
            reply.error(ENOENT);
            return;
        };
        let (Some(name_str), Some(new_name_str)) = (name.to_str(), newname.to_str()) else {
            reply.error(ENOENT);
            return;
        };
        let old_path = join(&parent_path, name_str);
        let new_path = join(&new_parent_path, new_name_str);
        match self.runtime.block_on(self.share.tree.rename(&old_path, &new_path)) {
            Ok(()) => {
                let ino = {
                    let mut inodes = self.inodes.lock().unwrap();
                    let ino = inodes.path_to_ino.remove(&old_path);
                    if let Some(ino) = ino {
                        inodes.path_to_ino.insert(new_path.clone(), ino);
                        inodes.ino_to_path.insert(ino, new_path);
                    }
                    ino
                };
                if let Some(ino) = ino {
                    self.invalidate_attr(ino);
                }
                reply.ok();
            }
            Err(e) if e.is_not_found() => reply.error(ENOENT),
            Err(_) => reply.error(EIO),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        let result: Result<(), damshare_core::error::ShareError> = self.runtime.block_on(async {
            let handle = self.share.tree.open(&path, OpenMode::Write).await?;
            if let Some(new_size) = size {
                handle.set_length(new_size).await?;
            }
            if let Some(new_mtime) = mtime {
                let millis = match new_mtime {
                    fuser::TimeOrNow::SpecificTime(t) => {
                        t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
                    }
                    fuser::TimeOrNow::Now => damshare_core::caching_tree::now(),
                };
                handle.set_last_modified(millis).await?;
            }
            handle.close().await
        });

        self.invalidate_attr(ino);

        if result.is_err() {
            reply.error(EIO);
            return;
        }
        match self.attr_for(ino, &path) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }
}
