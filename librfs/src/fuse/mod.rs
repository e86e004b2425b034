//! FUSE adaptor.
//!
//! Exposes a [`Resolver`] through rfuse3: every directory is virtual, every
//! terminal path is a file resolved on first lookup, and the control directory
//! `/:c` (alias `/:config`) carries the flush file plus front-end settings.
//!
//! Main components:
//! - `inode`: inode and open handle tables.
//! - `mount`: mount helpers over the rfuse3 session API.
pub mod inode;
pub mod mount;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::control::{CONTROL_DIR_NAMES, ControlDir};
use crate::error::RfsError;
use crate::resolver::{Attr, OpenMode, Resolver};
use inode::{CONTROL_INO, HandleTable, InodeTable, Node, OpenFile, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;
// resolved contents may change size between opens
const FOPEN_DIRECT_IO: u32 = 1;

const DIR_PERM: u16 = 0o755;
const ROOT_PERM: u16 = 0o555;
const FILE_PERM: u16 = 0o644;

pub struct ResolvingFs {
    resolver: Arc<Resolver>,
    control: ControlDir,
    inodes: InodeTable,
    handles: HandleTable,
}

impl ResolvingFs {
    pub fn new(resolver: Arc<Resolver>, control: ControlDir) -> Self {
        let inodes = InodeTable::new(control.files().len());
        Self {
            resolver,
            control,
            inodes,
            handles: HandleTable::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    async fn node(&self, ino: u64) -> FuseResult<Node> {
        self.inodes
            .node(ino)
            .await
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    async fn handle(&self, fh: u64) -> FuseResult<Arc<Mutex<OpenFile>>> {
        self.handles
            .get(fh)
            .await
            .ok_or_else(|| Errno::from(libc::EBADF))
    }

    async fn intern(&self, raw: &str) -> (u64, Node) {
        let handle = self.resolver.lookup(raw).await;
        let ino = self.inodes.intern(handle.clone()).await;
        (ino, Node::Path(handle))
    }

    async fn attr_of(&self, ino: u64, node: &Node, req: &Request) -> FuseResult<FileAttr> {
        let attr = match node {
            Node::Root => file_attr(ino, FileType::Directory, ROOT_PERM, 0, req),
            Node::ControlDir => file_attr(ino, FileType::Directory, DIR_PERM, 0, req),
            Node::ControlFile(index) => {
                let size = match self.control.files()[*index].read().await {
                    Ok(contents) => contents.len() as u64,
                    Err(_) => 0,
                };
                file_attr(ino, FileType::RegularFile, FILE_PERM, size, req)
            }
            Node::Path(path) => match self.resolver.stat(path, req.pid).await.map_err(errno)? {
                Attr::Directory => file_attr(ino, FileType::Directory, DIR_PERM, 0, req),
                Attr::Resource { size } => {
                    file_attr(ino, FileType::RegularFile, FILE_PERM, size, req)
                }
            },
        };
        Ok(attr)
    }

    /// Directory listing of `ino` including `.` and `..`.
    async fn list(&self, ino: u64) -> FuseResult<Vec<(u64, Node, String)>> {
        let node = self.node(ino).await?;
        if !node.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        let mut all = vec![
            (ino, node.clone(), ".".to_string()),
            (ROOT_INO, Node::Root, "..".to_string()),
        ];
        match node {
            Node::Root => all.push((
                CONTROL_INO,
                Node::ControlDir,
                CONTROL_DIR_NAMES[0].to_string(),
            )),
            Node::ControlDir => {
                for (index, file) in self.control.files().iter().enumerate() {
                    all.push((
                        InodeTable::control_file_ino(index),
                        Node::ControlFile(index),
                        file.name().to_string(),
                    ));
                }
            }
            // resolvable paths are only known once looked up
            Node::Path(_) | Node::ControlFile(_) => {}
        }
        Ok(all)
    }
}

impl Filesystem for ResolvingFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        let open_handles = self.handles.len().await;
        debug!(open_handles, "filesystem destroyed");
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let lossy = name.to_string_lossy();
        let name: &str = &lossy;
        let (ino, node) = match self.node(parent).await? {
            Node::Root if CONTROL_DIR_NAMES.contains(&name) => (CONTROL_INO, Node::ControlDir),
            Node::Root => self.intern(name).await,
            Node::ControlDir => match self.control.find(name) {
                Some((index, _)) => (
                    InodeTable::control_file_ino(index),
                    Node::ControlFile(index),
                ),
                None => return Err(libc::ENOENT.into()),
            },
            Node::Path(dir) if !dir.is_terminal() => self.intern(&dir.child(name)).await,
            Node::Path(_) | Node::ControlFile(_) => return Err(libc::ENOTDIR.into()),
        };
        let attr = match self.attr_of(ino, &node, &req).await {
            Ok(attr) => attr,
            Err(e) => {
                // the kernel only counts lookups it got an entry for
                if matches!(node, Node::Path(_)) {
                    self.inodes.forget(ino, 1).await;
                }
                return Err(e);
            }
        };
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let node = self.node(ino).await?;
        let mut attr = self.attr_of(ino, &node, &req).await?;
        // an open writer sees its own buffer
        let open = match fh {
            Some(fh) => self.handles.get(fh).await,
            None => None,
        };
        if let Some(file) = open {
            if let OpenFile::Resource(handle) = &*file.lock().await {
                attr.size = handle.len() as u64;
                attr.blocks = attr.size.div_ceil(512);
            }
        }
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let node = self.node(ino).await?;
        let mut attr = self.attr_of(ino, &node, &req).await?;
        if let (Some(size), Some(fh)) = (set_attr.size, fh) {
            let file = self.handle(fh).await?;
            match &mut *file.lock().await {
                OpenFile::Resource(handle) => {
                    self.resolver.truncate(handle, size).map_err(errno)?;
                }
                OpenFile::Control {
                    buffer,
                    writable,
                    dirty,
                    ..
                } => {
                    if !*writable {
                        return Err(libc::EBADF.into());
                    }
                    let len = self
                        .resolver
                        .buffer_len(Some(size))
                        .ok_or_else(|| Errno::from(libc::EFBIG))?;
                    buffer.resize(len, 0);
                    *dirty = true;
                }
            }
            attr.size = size;
            attr.blocks = size.div_ceil(512);
        }
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn open(&self, req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let mode = OpenMode::from_flags(flags);
        let file = match self.node(ino).await? {
            Node::Path(path) => {
                let handle = self
                    .resolver
                    .open(&path, req.pid, mode)
                    .await
                    .map_err(|err| match err {
                        // a directory, not a missing file
                        RfsError::NotFound(_) => Errno::from(libc::EISDIR),
                        err => errno(err),
                    })?;
                OpenFile::Resource(handle)
            }
            Node::ControlFile(index) => {
                let file = self.control.files()[index].clone();
                let buffer = if mode.starts_empty() {
                    Vec::new()
                } else {
                    file.read().await.unwrap_or_else(|e| {
                        warn!(name = file.name(), "reading control file failed: {e:#}");
                        Vec::new()
                    })
                };
                OpenFile::Control {
                    file,
                    buffer,
                    writable: mode.write,
                    dirty: false,
                }
            }
            Node::Root | Node::ControlDir => return Err(libc::EISDIR.into()),
        };
        let fh = self.handles.insert(file).await;
        Ok(ReplyOpen {
            fh,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        if !self.node(ino).await?.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let file = self.handle(fh).await?;
        let data = match &*file.lock().await {
            OpenFile::Resource(handle) => self.resolver.read(handle, offset, size),
            OpenFile::Control { buffer, .. } => {
                let start = usize::try_from(offset)
                    .unwrap_or(usize::MAX)
                    .min(buffer.len());
                let end = start.saturating_add(size as usize).min(buffer.len());
                Bytes::copy_from_slice(&buffer[start..end])
            }
        };
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let file = self.handle(fh).await?;
        let written = match &mut *file.lock().await {
            OpenFile::Resource(handle) => {
                self.resolver.write(handle, offset, data).map_err(errno)?
            }
            OpenFile::Control {
                buffer,
                writable,
                dirty,
                ..
            } => {
                if !*writable {
                    return Err(libc::EBADF.into());
                }
                let end = self
                    .resolver
                    .buffer_len(offset.checked_add(data.len() as u64))
                    .ok_or_else(|| Errno::from(libc::EFBIG))?;
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[end - data.len()..end].copy_from_slice(data);
                *dirty = true;
                data.len()
            }
        };
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn flush(&self, req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        let file = self.handle(fh).await?;
        match &mut *file.lock().await {
            OpenFile::Resource(handle) => {
                self.resolver
                    .commit_write(handle, req.pid)
                    .await
                    .map_err(errno)?;
            }
            OpenFile::Control {
                file,
                buffer,
                writable,
                dirty,
            } => {
                if *writable && *dirty && !buffer.is_empty() {
                    *dirty = false;
                    if let Err(e) = file.write(buffer).await {
                        warn!(name = file.name(), "control write failed: {e:#}");
                        return Err(libc::EIO.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.handles.remove(fh).await;
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let all = self.list(ino).await?;
        let start = usize::try_from(offset).unwrap_or(0);
        let entries: Vec<DirectoryEntry> = all
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, (inode, node, name))| DirectoryEntry {
                inode,
                kind: kind_of(&node),
                name: OsString::from(name),
                offset: i as i64 + 1,
            })
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let all = self.list(ino).await?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut entries = Vec::with_capacity(all.len().saturating_sub(start));
        for (i, (inode, node, name)) in all.into_iter().enumerate().skip(start) {
            let attr = self.attr_of(inode, &node, &req).await?;
            entries.push(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: kind_of(&node),
                name: OsString::from(name),
                offset: i as i64 + 1,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.resolver.entries().len().await as u64,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        if self.inodes.forget(inode, nlookup).await {
            debug!(inode, "released path inode");
        }
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        let mut released = 0;
        for &(inode, nlookup) in inodes {
            if self.inodes.forget(inode, nlookup).await {
                released += 1;
            }
        }
        debug!(count = inodes.len(), released, "batch forget");
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn errno(err: RfsError) -> Errno {
    match &err {
        RfsError::AlreadyFailed { .. } => warn!("{err}"),
        _ => debug!("{err}"),
    }
    err.errno().into()
}

fn kind_of(node: &Node) -> FileType {
    if node.is_dir() {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

fn file_attr(ino: u64, kind: FileType, perm: u16, size: u64, req: &Request) -> FileAttr {
    let now = Timestamp::from(SystemTime::now());
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind,
        perm,
        nlink: if matches!(kind, FileType::Directory) { 2 } else { 1 },
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::RfsConfig;
    use crate::fuse::mount::mount_unprivileged;
    use async_trait::async_trait;
    use std::fs;
    use std::io::Write;

    struct Upper;

    #[async_trait]
    impl Backend for Upper {
        async fn fetch(&self, address: &str, modifiers: &[String]) -> anyhow::Result<Vec<u8>> {
            if address.starts_with("missing") {
                anyhow::bail!("no such thing");
            }
            let body = format!("{address} {modifiers:?}");
            Ok(body.to_uppercase().into_bytes())
        }

        async fn store(
            &self,
            _address: &str,
            _modifiers: &[String],
            data: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            Ok(data.to_ascii_uppercase())
        }
    }

    // Mount smoke test, gated by RFS_FUSE_TEST=1
    #[tokio::test(flavor = "multi_thread")]
    async fn smoke_mount_and_resolve() {
        if std::env::var("RFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set RFS_FUSE_TEST=1 to enable");
            return;
        }

        let config = RfsConfig::default();
        let resolver = Arc::new(Resolver::new(Arc::new(Upper), &config));
        let control = ControlDir::new(resolver.clone(), Vec::new());
        let fs = ResolvingFs::new(resolver.clone(), control);

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let handle = match mount_unprivileged(fs, &mnt_path, &config).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let root = mnt_path.clone();
        tokio::task::spawn_blocking(move || {
            let page = root.join("host").join("page:");
            assert_eq!(fs::read(&page).expect("read page"), b"HOST/PAGE []");
            assert!(root.join("host").is_dir());
            assert!(fs::read(root.join("missing:")).is_err());

            let mut f = fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&page)
                .expect("open for write");
            f.write_all(b"hello").expect("write");
            drop(f);

            let flush = root.join(":c").join("flush");
            assert!(fs::read_to_string(&flush).expect("read flush").contains(":all"));
            fs::write(&flush, ":all\n").expect("flush all");
        })
        .await
        .expect("blocking ops");

        handle.unmount().await.expect("unmount");
    }
}
