//! # kvmq
//!
//! At-least-once message queue whose state lives in a key-value store that
//! only offers atomic single-key operations plus a guarded batch primitive.
//!
//! This library provides:
//! - Queue registry with per-queue settings and counters
//! - Visibility-timeout locking with receipt tokens
//! - Delayed delivery and a per-queue capacity ceiling
//! - Lazy and background reclamation of expired locks
//! - An in-memory store for tests and embedded use
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for all queue operations
//! - [`message`] - Identifiers, timestamps and message structures
//! - [`store`] - Key-value store capability and batch model
//! - [`stores`] - Store implementations
//! - [`registry`] - Queue metadata management
//! - [`engine`] - Message state transitions
//! - [`client`] - Public client trait and implementation
//! - [`reclaimer`] - Background sweep task
//! - [`config`] - Runtime configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use kvmq_core::{QueueClientFactory, QueueSettings};
//!
//! # async fn example() -> Result<(), kvmq_core::QueueError> {
//! let client = QueueClientFactory::create_in_memory_client();
//! client.create_queue("orders", QueueSettings::default()).await?;
//!
//! let id = client.send_message("orders", "A").await?;
//! let received = client.receive_message("orders").await?;
//! client
//!     .delete_message("orders", &id.to_string(), Some(received.receipt.as_str()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
mod keys;
pub mod message;
pub mod reclaimer;
pub mod registry;
pub mod store;
pub mod stores;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueClient, QueueClientFactory, StandardQueueClient};
pub use config::QueueConfig;
pub use engine::MessageEngine;
pub use error::{ConfigurationError, ErrorKind, QueueError, StoreError};
pub use message::{
    Message, MessageId, QueueName, ReceiptToken, ReceiveOptions, ReceivedMessage, SendOptions,
    Timestamp,
};
pub use reclaimer::Reclaimer;
pub use registry::{QueueAttributes, QueueRegistry, QueueSettings};
pub use store::{Batch, BatchOutcome, Command, Condition, KeyValueStore, Reply};
pub use stores::InMemoryStore;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
