//! Protocol backend seam.
//!
//! A front-end (web, gopher, ...) implements [`Backend`]; the engine calls it
//! from background tasks and never from inside a filesystem request.

use async_trait::async_trait;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolves `address` with the given modifiers.
    async fn fetch(&self, address: &str, modifiers: &[String]) -> anyhow::Result<Vec<u8>>;

    /// Writes `data` to `address`. The returned bytes are what a subsequent
    /// read of the same path by the writer shows.
    async fn store(
        &self,
        address: &str,
        modifiers: &[String],
        data: &[u8],
    ) -> anyhow::Result<Vec<u8>>;

    /// Hook for backends keeping a cache of their own.
    async fn flush_all(&self) {}

    /// Hook for backends keeping a cache of their own.
    async fn flush_resource(&self, _address: &str, _modifiers: &[String]) {}
}
