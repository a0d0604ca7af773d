//! Common test utilities for kvmq integration tests
//!
//! This module provides:
//! - Client constructors over a shared in-memory store
//! - A recording store double with failure injection
//! - A store double that runs a reclaim sweep in the middle of a read sequence

use async_trait::async_trait;
use kvmq_core::{
    Batch, BatchOutcome, InMemoryStore, KeyValueStore, QueueClient, QueueClientFactory,
    QueueConfig, QueueSettings, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Client Fixtures
// ============================================================================

/// Client over a fresh store with default configuration
#[allow(dead_code)]
pub fn client() -> Arc<dyn QueueClient> {
    client_with(QueueConfig::default()).0
}

/// Client over a fresh store, returning the store for inspection
#[allow(dead_code)]
pub fn client_with(config: QueueConfig) -> (Arc<dyn QueueClient>, InMemoryStore) {
    let store = InMemoryStore::new();
    let client = QueueClientFactory::create_client(Arc::new(store.clone()), config)
        .expect("valid test configuration");
    (client, store)
}

/// Configuration that only reclaims when asked to
#[allow(dead_code)]
pub fn manual_reclaim_config() -> QueueConfig {
    QueueConfig {
        reclaim_on_receive: false,
        ..Default::default()
    }
}

/// Create the `orders` queue used by most scenarios
#[allow(dead_code)]
pub async fn create_orders(client: &Arc<dyn QueueClient>) {
    client
        .create_queue("orders", QueueSettings::new(30, 0, 65536))
        .await
        .expect("Setup: create_queue should succeed");
}

// ============================================================================
// Recording Store
// ============================================================================

/// Store double that records submitted batches and can be told to fail them
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingStore {
    inner: InMemoryStore,
    executed: Arc<Mutex<Vec<usize>>>,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl RecordingStore {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Fail every following batch with `error`
    #[allow(dead_code)]
    pub fn fail_with(&self, error: StoreError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    #[allow(dead_code)]
    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Number of commands in each batch submitted so far
    #[allow(dead_code)]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyValueStore for RecordingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hget_all(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.llen(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn execute(&self, batch: Batch) -> Result<BatchOutcome, StoreError> {
        self.executed.lock().unwrap().push(batch.commands().len());

        let failure = self.failure.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.inner.execute(batch).await
    }
}

// ============================================================================
// Sweeping Store
// ============================================================================

/// Store double that runs one reclaim sweep just before an in-flight hash is read
///
/// The sweep goes through a separate client over the same keyspace, so it
/// lands between two reads made by whichever caller triggered it.
#[allow(dead_code)]
pub struct SweepingStore {
    inner: InMemoryStore,
    sweeper: Arc<dyn QueueClient>,
    queue: String,
    armed: AtomicBool,
    swept: Mutex<Option<usize>>,
}

impl SweepingStore {
    #[allow(dead_code)]
    pub fn new(queue: &str) -> Self {
        let inner = InMemoryStore::new();
        let sweeper = QueueClientFactory::create_client(
            Arc::new(inner.clone()),
            manual_reclaim_config(),
        )
        .expect("valid test configuration");
        Self {
            inner,
            sweeper,
            queue: queue.to_string(),
            armed: AtomicBool::new(false),
            swept: Mutex::new(None),
        }
    }

    #[allow(dead_code)]
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Run the sweep on the next in-flight hash read
    #[allow(dead_code)]
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Messages requeued by the sweep, once it has run
    #[allow(dead_code)]
    pub fn swept(&self) -> Option<usize> {
        *self.swept.lock().unwrap()
    }
}

#[async_trait]
impl KeyValueStore for SweepingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        if key.ends_with(":F") && self.armed.swap(false, Ordering::SeqCst) {
            let reclaimed = self
                .sweeper
                .reclaim_expired(&self.queue)
                .await
                .expect("sweep should succeed");
            *self.swept.lock().unwrap() = Some(reclaimed);
        }
        self.inner.hget_all(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.llen(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn execute(&self, batch: Batch) -> Result<BatchOutcome, StoreError> {
        self.inner.execute(batch).await
    }
}
