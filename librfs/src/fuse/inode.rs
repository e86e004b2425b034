//! Inode and file handle bookkeeping for the FUSE adaptor.
//!
//! The kernel talks in inode numbers and file handles, the resolver in paths
//! and [`OpenHandle`]s; these tables translate between the two.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::control::ControlFile;
use crate::resolver::{OpenHandle, PathHandle};

pub const ROOT_INO: u64 = 1;
pub const CONTROL_INO: u64 = 2;
const FIRST_CONTROL_FILE_INO: u64 = 3;
// leaves room for front-end control files
const FIRST_PATH_INO: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Root,
    ControlDir,
    ControlFile(usize),
    Path(PathHandle),
}

impl Node {
    pub fn is_dir(&self) -> bool {
        match self {
            Node::Root | Node::ControlDir => true,
            Node::ControlFile(_) => false,
            Node::Path(path) => !path.is_terminal(),
        }
    }
}

#[derive(Debug)]
struct Interned {
    handle: PathHandle,
    // kernel lookup count, the mapping goes away when it drops to zero
    lookups: u64,
}

#[derive(Debug)]
struct Paths {
    by_ino: HashMap<u64, Interned>,
    by_path: HashMap<String, u64>,
    next: u64,
}

/// Path inodes live as long as the kernel holds a lookup reference to them.
/// Numbers are never reused: a forgotten path gets a fresh inode on its next
/// lookup.
#[derive(Debug)]
pub struct InodeTable {
    control_files: usize,
    paths: Mutex<Paths>,
}

impl InodeTable {
    pub fn new(control_files: usize) -> Self {
        Self {
            control_files,
            paths: Mutex::new(Paths {
                by_ino: HashMap::new(),
                by_path: HashMap::new(),
                next: FIRST_PATH_INO,
            }),
        }
    }

    pub fn control_file_ino(index: usize) -> u64 {
        FIRST_CONTROL_FILE_INO + index as u64
    }

    pub async fn node(&self, ino: u64) -> Option<Node> {
        match ino {
            ROOT_INO => Some(Node::Root),
            CONTROL_INO => Some(Node::ControlDir),
            ino if ino < FIRST_PATH_INO => {
                let index = (ino.checked_sub(FIRST_CONTROL_FILE_INO)?) as usize;
                (index < self.control_files).then_some(Node::ControlFile(index))
            }
            ino => self
                .paths
                .lock()
                .await
                .by_ino
                .get(&ino)
                .map(|interned| Node::Path(interned.handle.clone())),
        }
    }

    /// Maps `handle` to its inode and counts one kernel lookup on it.
    pub async fn intern(&self, handle: PathHandle) -> u64 {
        let mut paths = self.paths.lock().await;
        if let Some(&ino) = paths.by_path.get(handle.path()) {
            if let Some(interned) = paths.by_ino.get_mut(&ino) {
                interned.handle = handle;
                interned.lookups += 1;
                return ino;
            }
        }
        let ino = paths.next;
        paths.next += 1;
        paths.by_path.insert(handle.path().to_string(), ino);
        paths.by_ino.insert(ino, Interned { handle, lookups: 1 });
        ino
    }

    /// Drops `nlookup` kernel references to `ino`. Returns true when the
    /// path mapping was released. Fixed inodes are never released.
    pub async fn forget(&self, ino: u64, nlookup: u64) -> bool {
        let mut paths = self.paths.lock().await;
        let Some(interned) = paths.by_ino.get_mut(&ino) else {
            return false;
        };
        interned.lookups = interned.lookups.saturating_sub(nlookup);
        if interned.lookups > 0 {
            return false;
        }
        if let Some(interned) = paths.by_ino.remove(&ino) {
            paths.by_path.remove(interned.handle.path());
        }
        true
    }

    pub async fn path_count(&self) -> usize {
        self.paths.lock().await.by_ino.len()
    }
}

pub enum OpenFile {
    Resource(OpenHandle),
    Control {
        file: Arc<dyn ControlFile>,
        buffer: Vec<u8>,
        writable: bool,
        dirty: bool,
    },
}

pub struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Arc<Mutex<OpenFile>>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, file: OpenFile) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .await
            .insert(fh, Arc::new(Mutex::new(file)));
        fh
    }

    pub async fn get(&self, fh: u64) -> Option<Arc<Mutex<OpenFile>>> {
        self.open.lock().await.get(&fh).cloned()
    }

    pub async fn remove(&self, fh: u64) -> bool {
        self.open.lock().await.remove(&fh).is_some()
    }

    pub async fn len(&self) -> usize {
        self.open.lock().await.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::RfsConfig;
    use crate::resolver::Resolver;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        async fn fetch(&self, address: &str, _modifiers: &[String]) -> anyhow::Result<Vec<u8>> {
            Ok(address.as_bytes().to_vec())
        }

        async fn store(
            &self,
            _address: &str,
            _modifiers: &[String],
            data: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    #[tokio::test]
    async fn test_fixed_inodes() {
        let table = InodeTable::new(2);
        assert_eq!(table.node(ROOT_INO).await, Some(Node::Root));
        assert_eq!(table.node(CONTROL_INO).await, Some(Node::ControlDir));
        assert_eq!(
            table.node(InodeTable::control_file_ino(1)).await,
            Some(Node::ControlFile(1))
        );
        assert_eq!(table.node(InodeTable::control_file_ino(2)).await, None);
        assert_eq!(table.node(0).await, None);
        assert_eq!(table.node(FIRST_PATH_INO).await, None);
    }

    #[tokio::test]
    async fn test_intern_is_stable_per_path() {
        let resolver = Resolver::new(Arc::new(Echo), &RfsConfig::default());
        let table = InodeTable::new(1);

        let dir = resolver.lookup("host").await;
        let page = resolver.lookup("host/page:").await;
        let a = table.intern(dir.clone()).await;
        let b = table.intern(page.clone()).await;
        assert_ne!(a, b);
        assert_eq!(table.intern(resolver.lookup("/host").await).await, a);
        assert_eq!(table.node(b).await, Some(Node::Path(page)));
        assert!(table.node(a).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_forget_releases_path_inodes() {
        let resolver = Resolver::new(Arc::new(Echo), &RfsConfig::default());
        let table = InodeTable::new(1);

        let page = resolver.lookup("host/page:").await;
        let ino = table.intern(page.clone()).await;
        assert_eq!(table.intern(page.clone()).await, ino);
        assert_eq!(table.path_count().await, 1);

        assert!(!table.forget(ino, 1).await);
        assert_eq!(table.node(ino).await, Some(Node::Path(page.clone())));
        assert!(table.forget(ino, 1).await);
        assert_eq!(table.node(ino).await, None);
        assert_eq!(table.path_count().await, 0);

        // a forgotten path comes back under a new number
        let again = table.intern(page).await;
        assert_ne!(again, ino);
        assert!(table.forget(again, 5).await);

        assert!(!table.forget(ino, 1).await);
        assert!(!table.forget(ROOT_INO, 1).await);
        assert_eq!(table.node(ROOT_INO).await, Some(Node::Root));
    }

    #[tokio::test]
    async fn test_handle_table() {
        let resolver = Arc::new(Resolver::new(Arc::new(Echo), &RfsConfig::default()));
        let handles = HandleTable::new();
        let flush: Arc<dyn ControlFile> = Arc::new(crate::control::FlushFile::new(resolver));
        let fh = handles
            .insert(OpenFile::Control {
                file: flush,
                buffer: Vec::new(),
                writable: true,
                dirty: false,
            })
            .await;
        assert!(handles.get(fh).await.is_some());
        assert!(handles.remove(fh).await);
        assert!(!handles.remove(fh).await);
        assert_eq!(handles.len().await, 0);
    }
}
