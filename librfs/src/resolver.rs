//! Resolution coordinator.
//!
//! Turns lookups of terminal paths into at most one backend fetch per cache
//! key, lets accessors wait for that fetch, and stages write-backs in the
//! shadow store of the writing process.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::address::{self, ResourceAddress};
use crate::backend::Backend;
use crate::config::RfsConfig;
use crate::control::Invalidation;
use crate::entry::CacheEntry;
use crate::error::{BackendFailure, Result, RfsError};
use crate::store::{self, EntryStore, Pid, Removal, ShadowStore, SweepStats};

/// Result of a lookup: a normalized path and whether it resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHandle {
    path: String,
    terminal: bool,
}

impl PathHandle {
    pub fn root() -> Self {
        Self {
            path: String::new(),
            terminal: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Raw path of `name` inside this directory.
    pub fn child(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}{}{name}", self.path, address::SEPARATOR)
        }
    }

    fn key(&self) -> String {
        address::cache_key(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    Directory,
    Resource { size: u64 },
}

/// Access mode of an open request, decoded from `open(2)` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenMode {
    pub const READ_ONLY: OpenMode = OpenMode {
        read: true,
        write: false,
        append: false,
        truncate: false,
    };

    pub fn from_flags(flags: u32) -> Self {
        let flags = flags as libc::c_int;
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access != libc::O_WRONLY,
            write: access != libc::O_RDONLY,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }

    /// Whether the handle starts from an empty buffer instead of the resolved contents.
    pub fn starts_empty(&self) -> bool {
        (self.write && !self.read && !self.append) || self.truncate
    }
}

#[derive(Debug)]
enum Buffer {
    Shared(Bytes),
    Owned(Vec<u8>),
}

/// Per-open buffer. Read-only handles share the resolved bytes, writable
/// handles work on their own copy until it is committed.
#[derive(Debug)]
pub struct OpenHandle {
    key: String,
    origin: Arc<CacheEntry>,
    buffer: Buffer,
    dirty: bool,
}

impl OpenHandle {
    pub fn path(&self) -> &str {
        &self.key
    }

    pub fn contents(&self) -> &[u8] {
        match &self.buffer {
            Buffer::Shared(bytes) => bytes,
            Buffer::Owned(vec) => vec,
        }
    }

    pub fn len(&self) -> usize {
        self.contents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents().is_empty()
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.buffer, Buffer::Owned(_))
    }

    fn writable_buffer(&mut self) -> Result<&mut Vec<u8>> {
        match &mut self.buffer {
            Buffer::Owned(vec) => {
                self.dirty = true;
                Ok(vec)
            }
            Buffer::Shared(_) => Err(RfsError::NotWritable(self.key.clone())),
        }
    }
}

struct Observed {
    entry: Arc<CacheEntry>,
    shadow: bool,
    outcome: std::result::Result<Bytes, BackendFailure>,
}

pub struct Resolver {
    backend: Arc<dyn Backend>,
    entries: Arc<EntryStore>,
    shadows: Arc<ShadowStore>,
    default_ttl: i64,
    fetch_timeout: Option<Duration>,
    max_buffer: usize,
}

impl Resolver {
    pub fn new(backend: Arc<dyn Backend>, config: &RfsConfig) -> Self {
        Self {
            backend,
            entries: Arc::new(EntryStore::new(config.default_ttl)),
            shadows: Arc::new(ShadowStore::new(config.default_ttl)),
            default_ttl: config.default_ttl,
            fetch_timeout: config.fetch_timeout(),
            max_buffer: config.max_buffer(),
        }
    }

    pub fn entries(&self) -> &EntryStore {
        &self.entries
    }

    pub fn shadows(&self) -> &ShadowStore {
        &self.shadows
    }

    /// Checks a requested buffer length against the limit. `None` stands for
    /// a length that overflowed while being computed.
    pub fn buffer_len(&self, len: Option<u64>) -> Option<usize> {
        len.and_then(|len| usize::try_from(len).ok())
            .filter(|&len| len <= self.max_buffer)
    }

    /// Looks up `raw`. A terminal path starts resolving in the background
    /// unless an entry already exists; this call never waits for the backend.
    pub async fn lookup(&self, raw: &str) -> PathHandle {
        let path = address::normalize(raw).to_string();
        let mut terminal = address::is_terminal(&path);
        if terminal {
            if let Err(err) = self.resolve(&address::cache_key(&path)).await {
                // not resolvable, falls back to directory semantics
                debug!(%path, "{err}");
                terminal = false;
            }
        }
        PathHandle { path, terminal }
    }

    /// Attributes of `path` as seen by `pid`, waiting for an in-flight fetch.
    pub async fn stat(&self, path: &PathHandle, pid: Pid) -> Result<Attr> {
        if !path.terminal {
            return Ok(Attr::Directory);
        }
        let observed = self.observe(path, pid).await?;
        match observed.outcome {
            Ok(contents) => {
                observed.entry.touch(self.default_ttl);
                Ok(Attr::Resource {
                    size: contents.len() as u64,
                })
            }
            Err(source) => Err(RfsError::AlreadyFailed {
                path: path.path.clone(),
                source,
            }),
        }
    }

    /// Opens `path` for `pid`. A pending write-back result of the same
    /// process takes precedence over the shared entry and is consumed.
    pub async fn open(&self, path: &PathHandle, pid: Pid, mode: OpenMode) -> Result<OpenHandle> {
        if !path.terminal {
            return Err(RfsError::NotFound(path.path.clone()));
        }
        let key = path.key();
        let observed = self.observe(path, pid).await?;
        if observed.shadow {
            self.shadows.consume(pid, &key, &observed.entry).await;
        }
        let contents = observed.outcome.map_err(|source| RfsError::AlreadyFailed {
            path: path.path.clone(),
            source,
        })?;
        observed.entry.touch(self.default_ttl);

        let buffer = match (mode.write, mode.starts_empty()) {
            (false, _) => Buffer::Shared(contents),
            (true, true) => Buffer::Owned(Vec::new()),
            (true, false) => Buffer::Owned(contents.to_vec()),
        };
        Ok(OpenHandle {
            key,
            origin: observed.entry,
            buffer,
            dirty: false,
        })
    }

    pub fn read(&self, handle: &OpenHandle, offset: u64, size: u32) -> Bytes {
        let len = handle.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size as usize).min(len);
        handle.origin.touch(self.default_ttl);
        match &handle.buffer {
            Buffer::Shared(bytes) => bytes.slice(start..end),
            Buffer::Owned(vec) => Bytes::copy_from_slice(&vec[start..end]),
        }
    }

    pub fn write(&self, handle: &mut OpenHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let end = self
            .buffer_len(offset.checked_add(data.len() as u64))
            .ok_or_else(|| RfsError::OutOfRange(handle.key.clone()))?;
        let start = end - data.len();
        let buffer = handle.writable_buffer()?;
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    pub fn truncate(&self, handle: &mut OpenHandle, len: u64) -> Result<()> {
        let len = self
            .buffer_len(Some(len))
            .ok_or_else(|| RfsError::OutOfRange(handle.key.clone()))?;
        handle.writable_buffer()?.resize(len, 0);
        Ok(())
    }

    /// Hands the buffered bytes of `handle` to the backend without waiting
    /// for it. The outcome is only visible to `pid`, on its next access.
    ///
    /// Returns false when there was nothing to write.
    pub async fn commit_write(&self, handle: &mut OpenHandle, pid: Pid) -> Result<bool> {
        if !handle.dirty || handle.is_empty() {
            return Ok(false);
        }
        let address = ResourceAddress::parse(&handle.key)?;
        let data = handle.contents().to_vec();
        handle.dirty = false;

        let entry = self.shadows.stage(pid, &handle.key).await;
        let backend = self.backend.clone();
        let timeout = self.fetch_timeout;
        let key = handle.key.clone();
        tokio::spawn(async move {
            let outcome = bounded(
                timeout,
                backend.store(&address.address, &address.modifiers, &data),
            )
            .await;
            match &outcome {
                Ok(reply) => debug!(%key, pid, bytes = reply.len(), "write-back stored"),
                Err(failure) => warn!(%key, pid, "write-back failed: {failure}"),
            }
            entry.settle(outcome.map(Bytes::from));
        });
        Ok(true)
    }

    pub async fn invalidate(&self, what: Invalidation) -> Result<()> {
        match what {
            Invalidation::All => {
                self.flush_all().await;
                Ok(())
            }
            Invalidation::Path(raw) => self.flush_one(&raw).await.map(|_| ()),
        }
    }

    /// Drops every settled entry; entries still being filled are dropped as
    /// soon as they settle.
    pub async fn flush_all(&self) {
        let (removed, deferred) = self.entries.remove_all().await;
        info!(removed, deferred, "flushed cache");
        self.backend.flush_all().await;
    }

    pub async fn flush_one(&self, raw: &str) -> Result<Removal> {
        let address = ResourceAddress::parse(raw)?;
        let key = address::cache_key(raw);
        let removal = self.entries.remove(&key).await;
        info!(%key, ?removal, "flushed resource");
        self.backend
            .flush_resource(&address.address, &address.modifiers)
            .await;
        Ok(removal)
    }

    /// One sweeper tick over both stores.
    pub async fn sweep(&self) -> SweepStats {
        store::sweep_all(&self.entries, &self.shadows).await
    }

    async fn resolve(&self, key: &str) -> Result<Arc<CacheEntry>> {
        let address = ResourceAddress::parse(key)?;
        let (entry, created) = self.entries.get_or_create(key).await;
        if created {
            self.spawn_fetch(key.to_string(), address, entry.clone());
        }
        Ok(entry)
    }

    fn spawn_fetch(&self, key: String, address: ResourceAddress, entry: Arc<CacheEntry>) {
        let backend = self.backend.clone();
        let entries = self.entries.clone();
        let timeout = self.fetch_timeout;
        debug!(%key, address = %address.address, modifiers = ?address.modifiers, "resolving");
        tokio::spawn(async move {
            let outcome = bounded(timeout, backend.fetch(&address.address, &address.modifiers)).await;
            match &outcome {
                Ok(contents) => debug!(%key, bytes = contents.len(), "resolved"),
                Err(failure) => warn!(%key, "resolution failed: {failure}"),
            }
            entry.settle(outcome.map(Bytes::from));
            if entries.evict_if_flagged(&key, &entry).await {
                debug!(%key, "evicted after deferred flush");
            }
        });
    }

    async fn observe(&self, path: &PathHandle, pid: Pid) -> Result<Observed> {
        let key = path.key();
        if let Some(entry) = self.shadows.get(pid, &key).await {
            let outcome = entry.settled().await;
            return Ok(Observed {
                entry,
                shadow: true,
                outcome,
            });
        }
        // re-resolves when the entry was evicted since the lookup
        let entry = self.resolve(&key).await?;
        let outcome = entry.settled().await;
        Ok(Observed {
            entry,
            shadow: false,
            outcome,
        })
    }
}

async fn bounded<F>(
    timeout: Option<Duration>,
    call: F,
) -> std::result::Result<Vec<u8>, BackendFailure>
where
    F: Future<Output = anyhow::Result<Vec<u8>>>,
{
    let result = match timeout {
        Some(after) => tokio::time::timeout(after, call)
            .await
            .map_err(|_| BackendFailure::TimedOut { after })?,
        None => call.await,
    };
    result.map_err(BackendFailure::from_anyhow)
}
