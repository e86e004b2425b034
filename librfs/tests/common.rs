use async_trait::async_trait;
use librfs::{Backend, OpenMode, Resolver, RfsConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub address: String,
    pub modifiers: Vec<String>,
    pub data: Vec<u8>,
}

/// Backend double. Fetches answer with the address itself unless a reply or
/// failure was scripted; stores answer `ack` unless a failure was scripted.
pub struct MockBackend {
    fetches: AtomicUsize,
    fetch_calls: Mutex<Vec<(String, Vec<String>)>>,
    store_calls: Mutex<Vec<StoreCall>>,
    replies: Mutex<HashMap<String, Result<Vec<u8>, String>>>,
    store_failures: Mutex<HashMap<String, String>>,
    gate: Option<Semaphore>,
    store_gate: Option<Semaphore>,
}

#[allow(dead_code)]
impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, None))
    }

    /// Fetches block until [`MockBackend::release`] lets them through.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0)), None))
    }

    /// Stores block until [`MockBackend::release_stores`] lets them through.
    pub fn store_gated() -> Arc<Self> {
        Arc::new(Self::build(None, Some(Semaphore::new(0))))
    }

    fn build(gate: Option<Semaphore>, store_gate: Option<Semaphore>) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            fetch_calls: Mutex::new(Vec::new()),
            store_calls: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            store_failures: Mutex::new(HashMap::new()),
            gate,
            store_gate,
        }
    }

    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub fn release_stores(&self, stores: usize) {
        if let Some(gate) = &self.store_gate {
            gate.add_permits(stores);
        }
    }

    pub fn reply(&self, address: &str, contents: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(address.to_string(), Ok(contents.as_bytes().to_vec()));
    }

    pub fn fail(&self, address: &str, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(address.to_string(), Err(message.to_string()));
    }

    pub fn fail_store(&self, address: &str, message: &str) {
        self.store_failures
            .lock()
            .unwrap()
            .insert(address.to_string(), message.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> Vec<(String, Vec<String>)> {
        self.fetch_calls.lock().unwrap().clone()
    }

    pub fn store_calls(&self) -> Vec<StoreCall> {
        self.store_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn fetch(&self, address: &str, modifiers: &[String]) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetch_calls
            .lock()
            .unwrap()
            .push((address.to_string(), modifiers.to_vec()));
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        let scripted = self.replies.lock().unwrap().get(address).cloned();
        match scripted {
            Some(Ok(contents)) => Ok(contents),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(address.as_bytes().to_vec()),
        }
    }

    async fn store(
        &self,
        address: &str,
        modifiers: &[String],
        data: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        self.store_calls.lock().unwrap().push(StoreCall {
            address: address.to_string(),
            modifiers: modifiers.to_vec(),
            data: data.to_vec(),
        });
        if let Some(gate) = &self.store_gate {
            gate.acquire().await?.forget();
        }
        let failure = self.store_failures.lock().unwrap().get(address).cloned();
        match failure {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(b"ack".to_vec()),
        }
    }
}

#[allow(dead_code)]
pub fn config(default_ttl: i64) -> RfsConfig {
    RfsConfig {
        default_ttl,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn resolver(backend: Arc<MockBackend>, config: &RfsConfig) -> Arc<Resolver> {
    Arc::new(Resolver::new(backend, config))
}

/// Looks up `raw` and reads it whole through a read-only handle.
#[allow(dead_code)]
pub async fn read_all(resolver: &Resolver, raw: &str, pid: u32) -> librfs::Result<Vec<u8>> {
    let path = resolver.lookup(raw).await;
    let handle = resolver.open(&path, pid, OpenMode::READ_ONLY).await?;
    Ok(resolver.read(&handle, 0, u32::MAX).to_vec())
}

/// Polls `check` until it holds, failing the test after a few seconds.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
