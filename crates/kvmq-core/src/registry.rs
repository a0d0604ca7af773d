//! # Queue Registry
//!
//! Owns queue metadata: settings, counters and timestamps, plus the
//! namespace-wide set of queue names. Message placement is owned by the
//! [`crate::engine::MessageEngine`]; the registry only touches message
//! records when a whole queue is purged.

use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};
use crate::keys::{meta, QueueKeys};
use crate::message::{MessageId, QueueName, Timestamp};
use crate::store::{Batch, BatchOutcome, Command, Condition, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound for visibility timeouts and delays, in seconds
pub const MAX_TIMEOUT_SECONDS: u32 = 9_999_999;

/// Smallest accepted per-queue message size limit, in bytes
pub const MIN_MESSAGE_SIZE: usize = 1024;

/// Largest accepted per-queue message size limit, in bytes
pub const MAX_MESSAGE_SIZE: usize = 65536;

pub(crate) fn validate_timeout(field: &str, seconds: u32) -> Result<(), QueueError> {
    if seconds > MAX_TIMEOUT_SECONDS {
        return Err(QueueError::invalid_value(
            field,
            format!("{} exceeds the maximum of {} seconds", seconds, MAX_TIMEOUT_SECONDS),
        ));
    }
    Ok(())
}

// ============================================================================
// Queue Settings and Attributes
// ============================================================================

/// Caller-supplied queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Default lock duration of received messages, in seconds
    pub visibility_timeout: u32,
    /// Seconds before a newly sent message becomes receivable
    pub delay: u32,
    /// Largest accepted message body, in bytes
    pub max_size: usize,
    /// Capacity ceiling; the configured default applies when absent
    pub max_messages: Option<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            delay: 0,
            max_size: MAX_MESSAGE_SIZE,
            max_messages: None,
        }
    }
}

impl QueueSettings {
    pub fn new(visibility_timeout: u32, delay: u32, max_size: usize) -> Self {
        Self {
            visibility_timeout,
            delay,
            max_size,
            max_messages: None,
        }
    }

    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = Some(max_messages);
        self
    }

    /// Check every numeric setting against its allowed range
    pub fn validate(&self) -> Result<(), QueueError> {
        validate_timeout("visibility_timeout", self.visibility_timeout)?;
        validate_timeout("delay", self.delay)?;

        if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&self.max_size) {
            return Err(QueueError::invalid_value(
                "max_size",
                format!(
                    "{} is outside {}..={}",
                    self.max_size, MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE
                ),
            ));
        }

        if self.max_messages == Some(0) {
            return Err(QueueError::invalid_value(
                "max_messages",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

/// Snapshot of a queue's metadata hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    pub name: QueueName,
    pub visibility_timeout: u32,
    pub delay: u32,
    pub max_size: usize,
    pub max_messages: u64,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
    pub total_sent: u64,
    pub total_received: u64,
    pub total_changed: u64,
    /// Messages waiting to be received, delayed ones included
    pub pending_messages: u64,
    /// Messages currently locked by a consumer
    pub hidden_messages: u64,
}

impl QueueAttributes {
    /// Pending plus in-flight messages
    pub fn live_messages(&self) -> u64 {
        self.pending_messages + self.hidden_messages
    }

    fn from_hash(
        name: &QueueName,
        key: &str,
        hash: &HashMap<String, String>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            name: name.clone(),
            visibility_timeout: parse_field(key, hash, meta::VT)?,
            delay: parse_field(key, hash, meta::DELAY)?,
            max_size: parse_field(key, hash, meta::MAXSIZE)?,
            max_messages: parse_field(key, hash, meta::MAXMSGS)?,
            created_at: parse_timestamp(key, hash, meta::CREATED)?,
            modified_at: parse_timestamp(key, hash, meta::MODIFIED)?,
            total_sent: parse_field(key, hash, meta::TOTALSENT)?,
            total_received: parse_field(key, hash, meta::TOTALRECEIVED)?,
            total_changed: parse_field(key, hash, meta::TOTALCHANGED)?,
            pending_messages: parse_counter(key, hash, meta::MSGS)?,
            hidden_messages: parse_counter(key, hash, meta::HIDDENMSGS)?,
        })
    }
}

pub(crate) fn parse_field<T: FromStr>(
    key: &str,
    hash: &HashMap<String, String>,
    field: &str,
) -> Result<T, StoreError> {
    let raw = hash.get(field).ok_or_else(|| StoreError::Corrupted {
        key: key.to_string(),
        field: field.to_string(),
        message: "field is missing".to_string(),
    })?;

    raw.parse::<T>().map_err(|_| StoreError::Corrupted {
        key: key.to_string(),
        field: field.to_string(),
        message: format!("cannot parse '{}'", raw),
    })
}

pub(crate) fn parse_timestamp(
    key: &str,
    hash: &HashMap<String, String>,
    field: &str,
) -> Result<Timestamp, StoreError> {
    let millis: i64 = parse_field(key, hash, field)?;
    Timestamp::from_millis(millis).ok_or_else(|| StoreError::Corrupted {
        key: key.to_string(),
        field: field.to_string(),
        message: format!("{} is not a valid timestamp", millis),
    })
}

/// Counters are signed in the store; a negative value means the counters drifted
fn parse_counter(
    key: &str,
    hash: &HashMap<String, String>,
    field: &str,
) -> Result<u64, StoreError> {
    let value: i64 = parse_field(key, hash, field)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupted {
        key: key.to_string(),
        field: field.to_string(),
        message: format!("counter is negative ({})", value),
    })
}

// ============================================================================
// Registry
// ============================================================================

/// Queue metadata and membership management
#[derive(Clone)]
pub struct QueueRegistry {
    store: Arc<dyn KeyValueStore>,
    config: Arc<QueueConfig>,
}

impl QueueRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, config: Arc<QueueConfig>) -> Self {
        Self { store, config }
    }

    pub(crate) fn keys(&self, queue: &QueueName) -> QueueKeys {
        QueueKeys::new(&self.config.namespace, queue)
    }

    /// Register a queue and initialise its counters
    pub async fn create(
        &self,
        queue: &QueueName,
        settings: &QueueSettings,
    ) -> Result<(), QueueError> {
        settings.validate()?;

        let keys = self.keys(queue);
        let now = Timestamp::now().as_millis().to_string();
        let max_messages = settings
            .max_messages
            .unwrap_or(self.config.default_max_messages);

        let fields = vec![
            (meta::VT, settings.visibility_timeout.to_string()),
            (meta::DELAY, settings.delay.to_string()),
            (meta::MAXSIZE, settings.max_size.to_string()),
            (meta::MAXMSGS, max_messages.to_string()),
            (meta::CREATED, now.clone()),
            (meta::MODIFIED, now),
            (meta::TOTALSENT, "0".to_string()),
            (meta::TOTALRECEIVED, "0".to_string()),
            (meta::TOTALCHANGED, "0".to_string()),
            (meta::MSGS, "0".to_string()),
            (meta::HIDDENMSGS, "0".to_string()),
        ];

        let batch = Batch::new()
            .require(Condition::KeyMissing { key: keys.meta() })
            .command(Command::HSet {
                key: keys.meta(),
                fields: fields
                    .into_iter()
                    .map(|(f, v)| (f.to_string(), v))
                    .collect(),
            })
            .command(Command::SAdd {
                key: keys.registry().to_string(),
                member: queue.to_string(),
            });

        match self.store.execute(batch).await? {
            BatchOutcome::Applied(_) => {
                info!(
                    queue = %queue,
                    visibility_timeout = settings.visibility_timeout,
                    delay = settings.delay,
                    max_size = settings.max_size,
                    "Created queue"
                );
                Ok(())
            }
            BatchOutcome::Aborted { .. } => Err(QueueError::QueueExists {
                queue_name: queue.to_string(),
            }),
        }
    }

    /// Read the full metadata snapshot of a queue
    pub async fn attributes(&self, queue: &QueueName) -> Result<QueueAttributes, QueueError> {
        let key = self.keys(queue).meta();
        let hash = self.store.hget_all(&key).await?;
        if hash.is_empty() {
            return Err(QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        }

        Ok(QueueAttributes::from_hash(queue, &key, &hash)?)
    }

    /// Replace the settings of an existing queue
    ///
    /// The capacity ceiling is left untouched unless the settings carry one.
    pub async fn update(
        &self,
        queue: &QueueName,
        settings: &QueueSettings,
    ) -> Result<(), QueueError> {
        settings.validate()?;

        let keys = self.keys(queue);
        let mut fields = vec![
            (meta::VT.to_string(), settings.visibility_timeout.to_string()),
            (meta::DELAY.to_string(), settings.delay.to_string()),
            (meta::MAXSIZE.to_string(), settings.max_size.to_string()),
            (
                meta::MODIFIED.to_string(),
                Timestamp::now().as_millis().to_string(),
            ),
        ];
        if let Some(max_messages) = settings.max_messages {
            fields.push((meta::MAXMSGS.to_string(), max_messages.to_string()));
        }

        let batch = Batch::new()
            .require(Condition::KeyExists { key: keys.meta() })
            .command(Command::HSet {
                key: keys.meta(),
                fields,
            });

        match self.store.execute(batch).await? {
            BatchOutcome::Applied(_) => {
                debug!(queue = %queue, "Updated queue attributes");
                Ok(())
            }
            BatchOutcome::Aborted { .. } => Err(QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            }),
        }
    }

    /// Number of pending messages, in-flight ones excluded
    pub async fn message_count(&self, queue: &QueueName) -> Result<u64, QueueError> {
        Ok(self.attributes(queue).await?.pending_messages)
    }

    /// Names of all registered queues, sorted
    pub async fn list(&self) -> Result<Vec<String>, QueueError> {
        let members = self
            .store
            .smembers(&crate::keys::registry_key(&self.config.namespace))
            .await?;
        let names: BTreeSet<String> = members.into_iter().collect();
        Ok(names.into_iter().collect())
    }

    /// Remove a queue together with every message it holds
    ///
    /// The purge is conditioned on `totalsent`, `totalreceived`, `msgs` and
    /// `hiddenmsgs` all being unchanged since the message ids were collected.
    /// Every send, receive, pop, delete and reclaim moves at least one of
    /// them, so no record can slip between the pending and in-flight reads.
    pub async fn delete(&self, queue: &QueueName) -> Result<(), QueueError> {
        let keys = self.keys(queue);

        for attempt in 1..=self.config.max_conflict_retries {
            let attributes = self.attributes(queue).await?;

            let mut ids: Vec<String> = self.store.lrange(&keys.pending(), 0, -1).await?;
            ids.extend(self.store.hget_all(&keys.in_flight()).await?.into_keys());

            let snapshot = [
                (meta::TOTALSENT, attributes.total_sent),
                (meta::TOTALRECEIVED, attributes.total_received),
                (meta::MSGS, attributes.pending_messages),
                (meta::HIDDENMSGS, attributes.hidden_messages),
            ];
            let mut batch = Batch::new().require(Condition::KeyExists { key: keys.meta() });
            for (field, value) in snapshot {
                batch = batch.require(Condition::FieldEquals {
                    key: keys.meta(),
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
            batch = batch
                .command(Command::Del { key: keys.meta() })
                .command(Command::Del {
                    key: keys.pending(),
                })
                .command(Command::Del {
                    key: keys.in_flight(),
                });

            let mut purged = 0usize;
            for raw in &ids {
                match raw.parse::<MessageId>() {
                    Ok(id) => {
                        batch = batch.command(Command::Del {
                            key: keys.message(&id),
                        });
                        purged += 1;
                    }
                    Err(_) => warn!(queue = %queue, id = %raw, "Skipping malformed message id"),
                }
            }

            batch = batch.command(Command::SRem {
                key: keys.registry().to_string(),
                member: queue.to_string(),
            });

            match self.store.execute(batch).await? {
                BatchOutcome::Applied(_) => {
                    info!(queue = %queue, purged_messages = purged, "Deleted queue");
                    return Ok(());
                }
                BatchOutcome::Aborted { condition: 0 } => {
                    return Err(QueueError::QueueNotFound {
                        queue_name: queue.to_string(),
                    });
                }
                BatchOutcome::Aborted { .. } => {
                    debug!(queue = %queue, attempt, "Queue changed during delete, retrying");
                }
            }
        }

        warn!(queue = %queue, "Giving up on queue delete after repeated conflicts");
        Err(StoreError::Conflict {
            operation: "delete_queue".to_string(),
            attempts: self.config.max_conflict_retries,
        }
        .into())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
