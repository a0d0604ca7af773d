//! # Key-Value Store Adapter
//!
//! Capability interface over an external key-value store offering atomic
//! single-key hash, list and set operations.
//!
//! Multi-key consistency is obtained exclusively through [`KeyValueStore::execute`]:
//! a [`Batch`] carries preconditions and commands that the store checks and
//! applies as one unit. A backend maps this onto WATCH/MULTI/EXEC, a
//! server-side script, or a lock around its own state. Queue code never issues
//! unguarded sequences of writes.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;

// ============================================================================
// Batch Model
// ============================================================================

/// Precondition evaluated before any command of a batch is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Key holds any value
    KeyExists { key: String },
    /// Key holds nothing
    KeyMissing { key: String },
    /// Hash field is present and equal to `value`
    FieldEquals {
        key: String,
        field: String,
        value: String,
    },
    /// Hash field is present with any value
    FieldPresent { key: String, field: String },
    /// List contains `value` at least once
    ListContains { key: String, value: String },
    /// Sum of the integer hash fields is strictly below `limit` (absent fields count as 0)
    FieldSumBelow {
        key: String,
        fields: Vec<String>,
        limit: i64,
    },
}

/// Single-key mutation applied as part of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Set the field only if it is absent; replies 1 when written
    HSetNx {
        key: String,
        field: String,
        value: String,
    },
    /// Replies with the new value
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    /// Replies with the number of fields removed
    HDel { key: String, fields: Vec<String> },
    /// Replies 1 if the key existed
    Del { key: String },
    /// Replies with the new list length
    LPush { key: String, value: String },
    /// Replies with the new list length
    RPush { key: String, value: String },
    LPop { key: String },
    /// Removes every occurrence; replies with the count removed
    LRem { key: String, value: String },
    /// Replies 1 if the member was added
    SAdd { key: String, member: String },
    /// Replies 1 if the member was removed
    SRem { key: String, member: String },
}

/// Result of one command in an applied batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Integer(i64),
    Value(Option<String>),
}

impl Reply {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// Outcome of submitting a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every condition held and every command was applied, replies in order
    Applied(Vec<Reply>),
    /// The condition at this index failed; nothing was applied
    Aborted { condition: usize },
}

/// Guarded group of commands applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    conditions: Vec<Condition>,
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition; indices follow insertion order
    pub fn require(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_parts(self) -> (Vec<Condition>, Vec<Command>) {
        (self.conditions, self.commands)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ============================================================================
// Core Trait
// ============================================================================

/// Interface for the backing key-value store
///
/// Implementations must be safe for concurrent use; the queue runtime shares
/// one handle between every producer and consumer.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Check whether the key holds any value
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Read one hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Read a whole hash; a missing key yields an empty map
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Read list elements between two inclusive indices (negative counts from the tail)
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    /// Length of a list; a missing key has length zero
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    /// Members of a set in no particular order
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Check every condition of the batch and apply all its commands as one unit
    async fn execute(&self, batch: Batch) -> Result<BatchOutcome, StoreError>;

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        let fields = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        self.execute_one(Command::HSet {
            key: key.to_string(),
            fields,
        })
        .await
        .map(|_| ())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let reply = self
            .execute_one(Command::HIncrBy {
                key: key.to_string(),
                field: field.to_string(),
                delta,
            })
            .await?;
        integer_reply(key, reply)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let reply = self
            .execute_one(Command::HDel {
                key: key.to_string(),
                fields: vec![field.to_string()],
            })
            .await?;
        Ok(integer_reply(key, reply)? > 0)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let reply = self
            .execute_one(Command::Del {
                key: key.to_string(),
            })
            .await?;
        Ok(integer_reply(key, reply)? > 0)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let reply = self
            .execute_one(Command::LPush {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(integer_reply(key, reply)?.max(0) as u64)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let reply = self
            .execute_one(Command::RPush {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(integer_reply(key, reply)?.max(0) as u64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self
            .execute_one(Command::LPop {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected_reply(key, &other)),
        }
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let reply = self
            .execute_one(Command::LRem {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(integer_reply(key, reply)?.max(0) as u64)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let reply = self
            .execute_one(Command::SAdd {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?;
        Ok(integer_reply(key, reply)? > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let reply = self
            .execute_one(Command::SRem {
                key: key.to_string(),
                member: member.to_string(),
            })
            .await?;
        Ok(integer_reply(key, reply)? > 0)
    }

    /// Submit a single unguarded command
    async fn execute_one(&self, command: Command) -> Result<Reply, StoreError> {
        match self.execute(Batch::new().command(command)).await? {
            BatchOutcome::Applied(mut replies) => replies.pop().ok_or(StoreError::Unavailable {
                message: "store returned no reply for command".to_string(),
            }),
            BatchOutcome::Aborted { condition } => Err(StoreError::Unavailable {
                message: format!("unguarded command aborted on condition {}", condition),
            }),
        }
    }
}

fn integer_reply(key: &str, reply: Reply) -> Result<i64, StoreError> {
    reply.as_integer().ok_or_else(|| unexpected_reply(key, &reply))
}

fn unexpected_reply(key: &str, reply: &Reply) -> StoreError {
    StoreError::Corrupted {
        key: key.to_string(),
        field: String::new(),
        message: format!("unexpected reply {:?}", reply),
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
