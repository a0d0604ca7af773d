//! Client trait and implementation for queue operations.
//!
//! [`QueueClient`] is the surface producers and consumers program against.
//! It accepts raw strings, validates them into the typed identifiers of
//! [`crate::message`] and hands off to the registry and the engine.

use crate::config::QueueConfig;
use crate::engine::MessageEngine;
use crate::error::QueueError;
use crate::message::{
    Message, MessageId, QueueName, ReceiptToken, ReceiveOptions, ReceivedMessage, SendOptions,
    Timestamp,
};
use crate::registry::{QueueAttributes, QueueRegistry, QueueSettings};
use crate::store::KeyValueStore;
use crate::stores::InMemoryStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Main interface for queue operations
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Register a new queue
    async fn create_queue(&self, queue: &str, settings: QueueSettings) -> Result<(), QueueError>;

    /// Remove a queue and every message it holds
    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Settings, counters and timestamps of a queue
    async fn get_queue_attributes(&self, queue: &str) -> Result<QueueAttributes, QueueError>;

    /// Replace the settings of an existing queue
    async fn set_queue_attributes(
        &self,
        queue: &str,
        settings: QueueSettings,
    ) -> Result<(), QueueError>;

    /// Number of pending messages, in-flight ones excluded
    async fn get_queue_message_count(&self, queue: &str) -> Result<u64, QueueError>;

    /// Names of all queues in the namespace
    async fn list_queues(&self) -> Result<Vec<String>, QueueError>;

    /// Send a message using the queue's delay
    async fn send_message(&self, queue: &str, body: &str) -> Result<MessageId, QueueError> {
        self.send_message_with(queue, body, SendOptions::default())
            .await
    }

    /// Send a message with per-message options
    async fn send_message_with(
        &self,
        queue: &str,
        body: &str,
        options: SendOptions,
    ) -> Result<MessageId, QueueError>;

    /// Send a raw payload, which must be valid UTF-8
    async fn send_message_bytes(&self, queue: &str, body: Bytes) -> Result<MessageId, QueueError> {
        let body = std::str::from_utf8(&body).map_err(|_| QueueError::MessageNotString)?;
        self.send_message(queue, body).await
    }

    /// Lock the oldest eligible message for the queue's visibility timeout
    async fn receive_message(&self, queue: &str) -> Result<ReceivedMessage, QueueError> {
        self.receive_message_with(queue, ReceiveOptions::default())
            .await
    }

    /// Lock the oldest eligible message with per-receive options
    async fn receive_message_with(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<ReceivedMessage, QueueError>;

    /// Receive and delete the oldest eligible message
    async fn pop_message(&self, queue: &str) -> Result<Message, QueueError>;

    /// Delete a message, optionally proving ownership with its receipt
    async fn delete_message(
        &self,
        queue: &str,
        message_id: &str,
        receipt: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Extend or shorten the lock held under `receipt`
    async fn change_message_visibility(
        &self,
        queue: &str,
        message_id: &str,
        receipt: &str,
        visibility_timeout: u32,
    ) -> Result<Timestamp, QueueError>;

    /// Requeue expired in-flight messages of one queue
    async fn reclaim_expired(&self, queue: &str) -> Result<usize, QueueError>;

    /// Requeue expired in-flight messages of every queue in the namespace
    async fn reclaim_all(&self) -> Result<usize, QueueError>;
}

/// Factory for creating queue clients
pub struct QueueClientFactory;

impl QueueClientFactory {
    /// Create a client over the given store
    pub fn create_client(
        store: Arc<dyn KeyValueStore>,
        config: QueueConfig,
    ) -> Result<Arc<dyn QueueClient>, QueueError> {
        Ok(Arc::new(StandardQueueClient::new(store, config)?))
    }

    /// Create a client backed by a fresh in-memory store
    pub fn create_in_memory_client() -> Arc<dyn QueueClient> {
        Arc::new(StandardQueueClient::from_parts(
            Arc::new(InMemoryStore::new()),
            Arc::new(QueueConfig::default()),
        ))
    }
}

/// Standard queue client implementation
#[derive(Clone)]
pub struct StandardQueueClient {
    registry: QueueRegistry,
    engine: MessageEngine,
}

impl StandardQueueClient {
    /// Create a client after validating the configuration
    pub fn new(store: Arc<dyn KeyValueStore>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self::from_parts(store, Arc::new(config)))
    }

    fn from_parts(store: Arc<dyn KeyValueStore>, config: Arc<QueueConfig>) -> Self {
        let registry = QueueRegistry::new(store.clone(), config.clone());
        let engine = MessageEngine::new(store, config, registry.clone());
        Self { registry, engine }
    }
}

#[async_trait]
impl QueueClient for StandardQueueClient {
    async fn create_queue(&self, queue: &str, settings: QueueSettings) -> Result<(), QueueError> {
        let queue = QueueName::new(queue)?;
        self.registry.create(&queue, &settings).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        let queue = QueueName::new(queue)?;
        self.registry.delete(&queue).await
    }

    async fn get_queue_attributes(&self, queue: &str) -> Result<QueueAttributes, QueueError> {
        let queue = QueueName::new(queue)?;
        self.registry.attributes(&queue).await
    }

    async fn set_queue_attributes(
        &self,
        queue: &str,
        settings: QueueSettings,
    ) -> Result<(), QueueError> {
        let queue = QueueName::new(queue)?;
        self.registry.update(&queue, &settings).await
    }

    async fn get_queue_message_count(&self, queue: &str) -> Result<u64, QueueError> {
        let queue = QueueName::new(queue)?;
        self.registry.message_count(&queue).await
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        self.registry.list().await
    }

    async fn send_message_with(
        &self,
        queue: &str,
        body: &str,
        options: SendOptions,
    ) -> Result<MessageId, QueueError> {
        let queue = QueueName::new(queue)?;
        self.engine.send(&queue, body, &options).await
    }

    async fn receive_message_with(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<ReceivedMessage, QueueError> {
        let queue = QueueName::new(queue)?;
        self.engine.receive(&queue, &options).await
    }

    async fn pop_message(&self, queue: &str) -> Result<Message, QueueError> {
        let queue = QueueName::new(queue)?;
        self.engine.pop(&queue).await
    }

    async fn delete_message(
        &self,
        queue: &str,
        message_id: &str,
        receipt: Option<&str>,
    ) -> Result<(), QueueError> {
        let queue = QueueName::new(queue)?;
        let message_id: MessageId = message_id.parse()?;
        let receipt = receipt.map(ReceiptToken::parse).transpose()?;
        self.engine
            .delete(&queue, &message_id, receipt.as_ref())
            .await
    }

    async fn change_message_visibility(
        &self,
        queue: &str,
        message_id: &str,
        receipt: &str,
        visibility_timeout: u32,
    ) -> Result<Timestamp, QueueError> {
        let queue = QueueName::new(queue)?;
        let message_id: MessageId = message_id.parse()?;
        let receipt = ReceiptToken::parse(receipt)?;
        self.engine
            .change_visibility(&queue, &message_id, &receipt, visibility_timeout)
            .await
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<usize, QueueError> {
        let queue = QueueName::new(queue)?;
        self.registry.attributes(&queue).await?;
        self.engine.reclaim(&queue).await
    }

    async fn reclaim_all(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for name in self.registry.list().await? {
            let queue = QueueName::new(name)?;
            match self.engine.reclaim(&queue).await {
                Ok(count) => total += count,
                Err(QueueError::QueueNotFound { .. }) => {
                    debug!(queue = %queue, "Queue deleted during sweep");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }
}
