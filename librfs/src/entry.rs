//! A single resolved (or resolving) resource.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::watch;

use crate::error::BackendFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Processing,
    Ready(Bytes),
    Failed(BackendFailure),
}

impl EntryState {
    pub fn is_processing(&self) -> bool {
        matches!(self, EntryState::Processing)
    }
}

/// Cache slot shared between the owning store, the task filling it and any
/// accessor waiting on it.
///
/// The state only ever moves out of `Processing` once; waiters subscribe to
/// the watch channel instead of polling.
#[derive(Debug)]
pub struct CacheEntry {
    state: watch::Sender<EntryState>,
    ttl: AtomicI64,
    evict_on_settle: AtomicBool,
}

impl CacheEntry {
    pub(crate) fn processing(ttl: i64) -> Self {
        let (state, _) = watch::channel(EntryState::Processing);
        Self {
            state,
            ttl: AtomicI64::new(ttl),
            evict_on_settle: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> EntryState {
        self.state.borrow().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.state.borrow().is_processing()
    }

    pub fn ttl(&self) -> i64 {
        self.ttl.load(Ordering::Acquire)
    }

    /// Waits until the entry has left `Processing` and returns the outcome
    /// of its fill.
    pub async fn settled(&self) -> std::result::Result<Bytes, BackendFailure> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| !state.is_processing()).await {
            Ok(state) => state.clone(),
            // the sender lives inside `self`, so the channel cannot close
            // while we are borrowed
            Err(_) => self.state(),
        };
        match state {
            EntryState::Ready(contents) => Ok(contents),
            EntryState::Failed(failure) => Err(failure),
            EntryState::Processing => Err(BackendFailure::Backend {
                message: "entry abandoned while processing".to_string(),
            }),
        }
    }

    /// Publishes the outcome of the fill. Returns false if the entry had
    /// already settled, in which case nothing changes.
    pub(crate) fn settle(&self, outcome: std::result::Result<Bytes, BackendFailure>) -> bool {
        self.state.send_if_modified(move |state| {
            if !state.is_processing() {
                return false;
            }
            *state = match outcome {
                Ok(contents) => EntryState::Ready(contents),
                Err(failure) => EntryState::Failed(failure),
            };
            true
        })
    }

    pub(crate) fn touch(&self, ttl: i64) {
        self.ttl.store(ttl, Ordering::Release);
    }

    /// Decrements the TTL by one tick and returns what is left.
    pub(crate) fn decay(&self) -> i64 {
        self.ttl.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mark_evict_on_settle(&self) {
        self.evict_on_settle.store(true, Ordering::Release);
    }

    pub(crate) fn evict_on_settle(&self) -> bool {
        self.evict_on_settle.load(Ordering::Acquire)
    }
}
