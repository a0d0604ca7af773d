//! Key-value store implementations.
//!
//! This module contains concrete implementations of the `KeyValueStore`
//! trait. Network-backed stores live in their own crates and only need to
//! honour the batch contract described in [`crate::store`].

pub mod memory;

pub use memory::InMemoryStore;
