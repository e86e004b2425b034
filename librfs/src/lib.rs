//! A filesystem whose paths resolve to remote or computed resources.
//!
//! A path ending in `:` is terminal: looking it up asks a [`Backend`] for its
//! contents once, caches the result with a TTL, and serves every concurrent
//! and later access from that entry. Leading `:name/` segments are modifiers
//! passed along to the backend.

pub mod address;
pub mod backend;
pub mod config;
pub mod control;
pub mod entry;
pub mod error;
pub mod fuse;
pub mod resolver;
pub mod store;
pub mod sweeper;

pub use backend::Backend;
pub use config::{RfsConfig, load_config};
pub use control::{ControlDir, ControlFile, Invalidation};
pub use error::{BackendFailure, Result, RfsError};
pub use fuse::ResolvingFs;
pub use resolver::{Attr, OpenHandle, OpenMode, PathHandle, Resolver};
pub use sweeper::{SweeperHandle, spawn_sweeper};
