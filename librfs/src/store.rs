//! Entry tables shared between the resolver, the control surface and the
//! sweeper.
//!
//! Both stores wrap the same [`TtlTable`]; they only differ in their key.
//! All mutation goes through the methods below, each of which runs under a
//! single lock acquisition.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::entry::CacheEntry;

/// Operating system process id of the requester.
pub type Pid = u32;

/// What happened to an entry on an explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The entry is still being filled; it goes away once it settles.
    Deferred,
    Missing,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub decayed: usize,
    pub evicted: usize,
    pub skipped: usize,
}

impl SweepStats {
    fn merge(self, other: SweepStats) -> SweepStats {
        SweepStats {
            decayed: self.decayed + other.decayed,
            evicted: self.evicted + other.evicted,
            skipped: self.skipped + other.skipped,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TtlTable<K> {
    entries: Mutex<HashMap<K, Arc<CacheEntry>>>,
}

impl<K: Eq + Hash + Clone> TtlTable<K> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, key: K, ttl: i64) -> (Arc<CacheEntry>, bool) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&key) {
            return (entry.clone(), false);
        }
        let entry = Arc::new(CacheEntry::processing(ttl));
        entries.insert(key, entry.clone());
        (entry, true)
    }

    async fn get(&self, key: &K) -> Option<Arc<CacheEntry>> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn insert(&self, key: K, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        self.entries.lock().await.insert(key, entry)
    }

    async fn remove(&self, key: &K) -> Removal {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            None => Removal::Missing,
            Some(entry) if entry.is_processing() => {
                entry.mark_evict_on_settle();
                Removal::Deferred
            }
            Some(_) => {
                entries.remove(key);
                Removal::Removed
            }
        }
    }

    /// Returns (removed, deferred).
    async fn remove_all(&self) -> (usize, usize) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.is_processing() {
                entry.mark_evict_on_settle();
                true
            } else {
                false
            }
        });
        (before - entries.len(), entries.len())
    }

    /// Removes `key` only if it still maps to `entry` and `entry` has settled.
    async fn remove_if_same(&self, key: &K, entry: &Arc<CacheEntry>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) && !current.is_processing() => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Same as [`TtlTable::remove_if_same`], but only for entries a flush
    /// asked to drop while they were still being filled.
    async fn evict_if_flagged(&self, key: &K, entry: &Arc<CacheEntry>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(current)
                if Arc::ptr_eq(current, entry)
                    && current.evict_on_settle()
                    && !current.is_processing() =>
            {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| {
            if entry.is_processing() {
                stats.skipped += 1;
                return true;
            }
            stats.decayed += 1;
            if entry.decay() <= 0 {
                stats.evicted += 1;
                false
            } else {
                true
            }
        });
        stats
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn keys(&self) -> Vec<K> {
        self.entries.lock().await.keys().cloned().collect()
    }
}

/// Shared cache of resolved resources, keyed by cache key
/// (see [`crate::address::cache_key`]).
#[derive(Debug)]
pub struct EntryStore {
    table: TtlTable<String>,
    default_ttl: i64,
}

impl EntryStore {
    pub fn new(default_ttl: i64) -> Self {
        Self {
            table: TtlTable::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> i64 {
        self.default_ttl
    }

    /// Returns the entry for `key`, inserting a fresh `Processing` one if
    /// there is none. `created` is true for exactly one of any number of
    /// concurrent callers; that caller owns the fill.
    pub(crate) async fn get_or_create(&self, key: &str) -> (Arc<CacheEntry>, bool) {
        self.table
            .get_or_create(key.to_string(), self.default_ttl)
            .await
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.table.get(&key.to_string()).await
    }

    pub(crate) async fn remove(&self, key: &str) -> Removal {
        self.table.remove(&key.to_string()).await
    }

    pub(crate) async fn remove_all(&self) -> (usize, usize) {
        self.table.remove_all().await
    }

    pub(crate) async fn evict_if_flagged(&self, key: &str, entry: &Arc<CacheEntry>) -> bool {
        self.table.evict_if_flagged(&key.to_string(), entry).await
    }

    pub async fn sweep(&self) -> SweepStats {
        self.table.sweep().await
    }

    pub async fn len(&self) -> usize {
        self.table.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<String> {
        self.table.keys().await
    }
}

/// Requester-private results of write-backs, keyed by (pid, cache key).
#[derive(Debug)]
pub struct ShadowStore {
    table: TtlTable<(Pid, String)>,
    default_ttl: i64,
}

impl ShadowStore {
    pub fn new(default_ttl: i64) -> Self {
        Self {
            table: TtlTable::new(),
            default_ttl,
        }
    }

    /// Stages a new, `Processing` shadow entry, replacing any earlier one for
    /// the same requester and key.
    pub(crate) async fn stage(&self, pid: Pid, key: &str) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::processing(self.default_ttl));
        self.table
            .insert((pid, key.to_string()), entry.clone())
            .await;
        entry
    }

    pub async fn get(&self, pid: Pid, key: &str) -> Option<Arc<CacheEntry>> {
        self.table.get(&(pid, key.to_string())).await
    }

    /// Consumes the shadow entry once it has been observed. A newer write
    /// staged in the meantime is left alone.
    pub(crate) async fn consume(&self, pid: Pid, key: &str, entry: &Arc<CacheEntry>) -> bool {
        self.table
            .remove_if_same(&(pid, key.to_string()), entry)
            .await
    }

    pub async fn sweep(&self) -> SweepStats {
        self.table.sweep().await
    }

    pub async fn len(&self) -> usize {
        self.table.len().await
    }
}

/// Sweeps both stores once.
pub async fn sweep_all(entries: &EntryStore, shadows: &ShadowStore) -> SweepStats {
    entries.sweep().await.merge(shadows.sweep().await)
}
