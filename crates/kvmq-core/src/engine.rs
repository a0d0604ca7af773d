//! # Message Lifecycle Engine
//!
//! Moves messages between the two placements of a queue:
//!
//! ```text
//!            send                 receive
//!   (none) ───────▶ PENDING ─────────────────▶ IN_FLIGHT ──── delete ───▶ (gone)
//!                      ▲                          │
//!                      └──── deadline passes ─────┘
//!                            (reclaim)
//! ```
//!
//! Pending ids live in a list (oldest at the head), in-flight ids in a hash
//! mapping id to visibility deadline. Every transition touches the metadata
//! counters, the placement structures and the message record together and is
//! therefore submitted as one guarded [`Batch`]. Preconditions encode the
//! state the transition was computed from; when another caller got there
//! first the batch aborts untouched and the transition is recomputed.

use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};
use crate::keys::{meta, record, QueueKeys};
use crate::message::{
    Message, MessageId, QueueName, ReceiptToken, ReceiveOptions, ReceivedMessage, SendOptions,
    Timestamp,
};
use crate::registry::{parse_field, parse_timestamp, validate_timeout, QueueRegistry};
use crate::store::{Batch, BatchOutcome, Command, Condition, KeyValueStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

// ============================================================================
// Stored Message Record
// ============================================================================

/// Parsed message record hash
#[derive(Debug, Clone)]
struct MessageRecord {
    body: String,
    sent_at: Timestamp,
    first_seen_at: Timestamp,
    first_received_at: Option<Timestamp>,
    available_at: Timestamp,
    /// Raw counter value, used verbatim in preconditions
    receive_count_raw: String,
    receive_count: u64,
    receipt: Option<String>,
}

impl MessageRecord {
    fn from_hash(key: &str, hash: &HashMap<String, String>) -> Result<Self, StoreError> {
        let receive_count_raw = hash
            .get(record::RECEIVE_COUNT)
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        let receive_count = receive_count_raw
            .parse::<u64>()
            .map_err(|_| StoreError::Corrupted {
                key: key.to_string(),
                field: record::RECEIVE_COUNT.to_string(),
                message: format!("cannot parse '{}'", receive_count_raw),
            })?;

        let first_received_at = if hash.contains_key(record::FIRST_RECEIVED) {
            Some(parse_timestamp(key, hash, record::FIRST_RECEIVED)?)
        } else {
            None
        };

        Ok(Self {
            body: parse_field(key, hash, record::BODY)?,
            sent_at: parse_timestamp(key, hash, record::SENT)?,
            first_seen_at: parse_timestamp(key, hash, record::FIRST_SEEN)?,
            first_received_at,
            available_at: parse_timestamp(key, hash, record::AVAILABLE_AT)?,
            receive_count_raw,
            receive_count,
            receipt: hash.get(record::RECEIPT).cloned(),
        })
    }

    /// Message view after one more successful receive at `now`
    fn into_delivered(self, message_id: MessageId, now: Timestamp) -> Message {
        Message {
            message_id,
            body: self.body,
            receive_count: self.receive_count + 1,
            sent_at: self.sent_at,
            first_seen_at: self.first_seen_at,
            first_received_at: Some(self.first_received_at.unwrap_or(now)),
        }
    }
}

fn parse_deadline(key: &str, field: &str, raw: &str) -> Result<Timestamp, StoreError> {
    raw.parse::<i64>()
        .ok()
        .and_then(Timestamp::from_millis)
        .ok_or_else(|| StoreError::Corrupted {
            key: key.to_string(),
            field: field.to_string(),
            message: format!("'{}' is not a deadline", raw),
        })
}

// ============================================================================
// Engine
// ============================================================================

/// Send, receive, delete and visibility management for queue messages
#[derive(Clone)]
pub struct MessageEngine {
    store: Arc<dyn KeyValueStore>,
    config: Arc<QueueConfig>,
    registry: QueueRegistry,
}

impl MessageEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: Arc<QueueConfig>,
        registry: QueueRegistry,
    ) -> Self {
        Self {
            store,
            config,
            registry,
        }
    }

    fn conflict(&self, operation: &str, queue: &QueueName) -> QueueError {
        warn!(
            queue = %queue,
            operation,
            attempts = self.config.max_conflict_retries,
            "Giving up after repeated conflicts"
        );
        StoreError::Conflict {
            operation: operation.to_string(),
            attempts: self.config.max_conflict_retries,
        }
        .into()
    }

    fn queue_not_found(queue: &QueueName) -> QueueError {
        QueueError::QueueNotFound {
            queue_name: queue.to_string(),
        }
    }

    fn message_not_found(id: &MessageId) -> QueueError {
        QueueError::MessageNotFound {
            message_id: id.to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------------

    /// Store a new message and append it to the pending list
    pub async fn send(
        &self,
        queue: &QueueName,
        body: &str,
        options: &SendOptions,
    ) -> Result<MessageId, QueueError> {
        if body.is_empty() {
            return Err(QueueError::missing("message"));
        }

        let attributes = self.registry.attributes(queue).await?;
        if body.len() > attributes.max_size {
            return Err(QueueError::MessageTooLong {
                size: body.len(),
                max_size: attributes.max_size,
            });
        }

        let delay = options.delay.unwrap_or(attributes.delay);
        validate_timeout("delay", delay)?;

        let queue_full = || QueueError::QueueFull {
            queue_name: queue.to_string(),
            count: attributes.live_messages(),
            capacity: attributes.max_messages,
        };
        if attributes.live_messages() >= attributes.max_messages {
            return Err(queue_full());
        }

        let keys = self.registry.keys(queue);
        let id = MessageId::new();
        let record_key = keys.message(&id);
        let now = Timestamp::now();
        let sent = now.as_millis().to_string();

        let batch = Batch::new()
            .require(Condition::KeyExists { key: keys.meta() })
            .require(Condition::FieldSumBelow {
                key: keys.meta(),
                fields: vec![meta::MSGS.to_string(), meta::HIDDENMSGS.to_string()],
                limit: i64::try_from(attributes.max_messages).unwrap_or(i64::MAX),
            })
            .require(Condition::KeyMissing {
                key: record_key.clone(),
            })
            .command(Command::HSet {
                key: record_key,
                fields: vec![
                    (record::BODY.to_string(), body.to_string()),
                    (record::SENT.to_string(), sent.clone()),
                    (record::FIRST_SEEN.to_string(), sent),
                    (
                        record::AVAILABLE_AT.to_string(),
                        now.add_seconds(delay).as_millis().to_string(),
                    ),
                    (record::RECEIVE_COUNT.to_string(), "0".to_string()),
                ],
            })
            .command(Command::HIncrBy {
                key: keys.meta(),
                field: meta::TOTALSENT.to_string(),
                delta: 1,
            })
            .command(Command::HIncrBy {
                key: keys.meta(),
                field: meta::MSGS.to_string(),
                delta: 1,
            })
            .command(Command::RPush {
                key: keys.pending(),
                value: id.to_string(),
            });

        match self.store.execute(batch).await? {
            BatchOutcome::Applied(_) => {
                debug!(queue = %queue, message_id = %id, delay, "Sent message");
                Ok(id)
            }
            BatchOutcome::Aborted { condition: 0 } => Err(Self::queue_not_found(queue)),
            BatchOutcome::Aborted { condition: 1 } => Err(queue_full()),
            BatchOutcome::Aborted { .. } => Err(QueueError::MessageExists {
                message_id: id.to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Claim the oldest eligible pending message with the batch built by `claim`
    ///
    /// Candidates are tried in list order. A candidate taken by a concurrent
    /// caller aborts its batch and the next one is tried; the pending list is
    /// only re-read once every candidate of a scan has been lost.
    async fn claim_next<T>(
        &self,
        queue: &QueueName,
        operation: &str,
        claim: impl Fn(&QueueKeys, &MessageId, &MessageRecord, Timestamp) -> (Batch, T),
    ) -> Result<(MessageId, MessageRecord, Timestamp, T), QueueError> {
        let keys = self.registry.keys(queue);
        let window = self.config.receive_scan_window as i64;

        for attempt in 1..=self.config.max_conflict_retries {
            let now = Timestamp::now();
            let ids = self.store.lrange(&keys.pending(), 0, window - 1).await?;
            let mut contended = false;

            for raw in ids {
                let id = match raw.parse::<MessageId>() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(queue = %queue, id = %raw, "Skipping malformed pending id");
                        continue;
                    }
                };

                let record_key = keys.message(&id);
                let hash = self.store.hget_all(&record_key).await?;
                if hash.is_empty() {
                    // Deleted between the list read and now
                    continue;
                }

                let record = MessageRecord::from_hash(&record_key, &hash)?;
                if record.available_at > now {
                    continue;
                }

                let (batch, claimed) = claim(&keys, &id, &record, now);
                match self.store.execute(batch).await? {
                    BatchOutcome::Applied(_) => return Ok((id, record, now, claimed)),
                    BatchOutcome::Aborted { condition: 0 } => {
                        return Err(Self::queue_not_found(queue))
                    }
                    BatchOutcome::Aborted { .. } => {
                        debug!(
                            queue = %queue,
                            message_id = %id,
                            attempt,
                            operation,
                            "Lost race for message"
                        );
                        contended = true;
                    }
                }
            }

            if !contended {
                return Err(QueueError::QueueEmpty {
                    queue_name: queue.to_string(),
                });
            }
        }

        Err(self.conflict(operation, queue))
    }

    /// Lock the oldest eligible message for the visibility timeout
    pub async fn receive(
        &self,
        queue: &QueueName,
        options: &ReceiveOptions,
    ) -> Result<ReceivedMessage, QueueError> {
        let attributes = self.registry.attributes(queue).await?;
        let visibility_timeout = options
            .visibility_timeout
            .unwrap_or(attributes.visibility_timeout);
        validate_timeout("visibility_timeout", visibility_timeout)?;

        if self.config.reclaim_on_receive {
            self.reclaim(queue).await?;
        }

        let (id, record, now, (receipt, visible_at)) = self
            .claim_next(queue, "receive", |keys, id, current, now| {
                let record_key = keys.message(id);
                let receipt = ReceiptToken::new();
                let visible_at = now.add_seconds(visibility_timeout);
                let deadline = visible_at.as_millis().to_string();

                let batch = Batch::new()
                    .require(Condition::KeyExists { key: keys.meta() })
                    .require(Condition::ListContains {
                        key: keys.pending(),
                        value: id.to_string(),
                    })
                    .require(Condition::FieldEquals {
                        key: record_key.clone(),
                        field: record::RECEIVE_COUNT.to_string(),
                        value: current.receive_count_raw.clone(),
                    })
                    .command(Command::LRem {
                        key: keys.pending(),
                        value: id.to_string(),
                    })
                    .command(Command::HSet {
                        key: record_key.clone(),
                        fields: vec![
                            (record::RECEIPT.to_string(), receipt.to_string()),
                            (record::VISIBLE_AT.to_string(), deadline.clone()),
                        ],
                    })
                    .command(Command::HIncrBy {
                        key: record_key.clone(),
                        field: record::RECEIVE_COUNT.to_string(),
                        delta: 1,
                    })
                    .command(Command::HSetNx {
                        key: record_key,
                        field: record::FIRST_RECEIVED.to_string(),
                        value: now.as_millis().to_string(),
                    })
                    .command(Command::HIncrBy {
                        key: keys.meta(),
                        field: meta::TOTALRECEIVED.to_string(),
                        delta: 1,
                    })
                    .command(Command::HIncrBy {
                        key: keys.meta(),
                        field: meta::MSGS.to_string(),
                        delta: -1,
                    })
                    .command(Command::HIncrBy {
                        key: keys.meta(),
                        field: meta::HIDDENMSGS.to_string(),
                        delta: 1,
                    })
                    .command(Command::HSet {
                        key: keys.in_flight(),
                        fields: vec![(id.to_string(), deadline)],
                    });

                (batch, (receipt, visible_at))
            })
            .await?;

        let message = record.into_delivered(id, now);
        debug!(
            queue = %queue,
            message_id = %id,
            receive_count = message.receive_count,
            "Received message"
        );
        Ok(ReceivedMessage {
            message,
            receipt,
            visible_at,
        })
    }

    /// Receive and delete the oldest eligible message in one step
    pub async fn pop(&self, queue: &QueueName) -> Result<Message, QueueError> {
        self.registry.attributes(queue).await?;

        if self.config.reclaim_on_receive {
            self.reclaim(queue).await?;
        }

        let (id, record, now, ()) = self
            .claim_next(queue, "pop", |keys, id, current, _| {
                let record_key = keys.message(id);
                let batch = Batch::new()
                    .require(Condition::KeyExists { key: keys.meta() })
                    .require(Condition::ListContains {
                        key: keys.pending(),
                        value: id.to_string(),
                    })
                    .require(Condition::FieldEquals {
                        key: record_key.clone(),
                        field: record::RECEIVE_COUNT.to_string(),
                        value: current.receive_count_raw.clone(),
                    })
                    .command(Command::LRem {
                        key: keys.pending(),
                        value: id.to_string(),
                    })
                    .command(Command::Del { key: record_key })
                    .command(Command::HIncrBy {
                        key: keys.meta(),
                        field: meta::TOTALRECEIVED.to_string(),
                        delta: 1,
                    })
                    .command(Command::HIncrBy {
                        key: keys.meta(),
                        field: meta::MSGS.to_string(),
                        delta: -1,
                    });

                (batch, ())
            })
            .await?;

        debug!(queue = %queue, message_id = %id, "Popped message");
        Ok(record.into_delivered(id, now))
    }

    // ------------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------------

    /// Remove a message from whichever placement it is in
    ///
    /// With a receipt the message must be in flight under exactly that
    /// receipt and its lock must not have lapsed.
    pub async fn delete(
        &self,
        queue: &QueueName,
        id: &MessageId,
        receipt: Option<&ReceiptToken>,
    ) -> Result<(), QueueError> {
        self.registry.attributes(queue).await?;
        let keys = self.registry.keys(queue);
        let record_key = keys.message(id);

        for attempt in 1..=self.config.max_conflict_retries {
            let hash = self.store.hget_all(&record_key).await?;
            if hash.is_empty() {
                return Err(Self::message_not_found(id));
            }
            let record = MessageRecord::from_hash(&record_key, &hash)?;
            let deadline = self.store.hget(&keys.in_flight(), &id.to_string()).await?;

            let batch = Batch::new().require(Condition::KeyExists { key: keys.meta() });
            let batch = match (deadline, receipt) {
                (Some(deadline), receipt) => {
                    if let Some(receipt) = receipt {
                        let lapsed = parse_deadline(&keys.in_flight(), &id.to_string(), &deadline)?
                            <= Timestamp::now();
                        if lapsed || record.receipt.as_deref() != Some(receipt.as_str()) {
                            return Err(Self::message_not_found(id));
                        }
                    }

                    let batch = batch.require(Condition::FieldEquals {
                        key: keys.in_flight(),
                        field: id.to_string(),
                        value: deadline,
                    });
                    let batch = match receipt {
                        Some(receipt) => batch.require(Condition::FieldEquals {
                            key: record_key.clone(),
                            field: record::RECEIPT.to_string(),
                            value: receipt.to_string(),
                        }),
                        None => batch,
                    };

                    batch
                        .command(Command::Del {
                            key: record_key.clone(),
                        })
                        .command(Command::HDel {
                            key: keys.in_flight(),
                            fields: vec![id.to_string()],
                        })
                        .command(Command::HIncrBy {
                            key: keys.meta(),
                            field: meta::HIDDENMSGS.to_string(),
                            delta: -1,
                        })
                }
                (None, Some(_)) => return Err(Self::message_not_found(id)),
                (None, None) => batch
                    .require(Condition::ListContains {
                        key: keys.pending(),
                        value: id.to_string(),
                    })
                    .command(Command::Del {
                        key: record_key.clone(),
                    })
                    .command(Command::LRem {
                        key: keys.pending(),
                        value: id.to_string(),
                    })
                    .command(Command::HIncrBy {
                        key: keys.meta(),
                        field: meta::MSGS.to_string(),
                        delta: -1,
                    }),
            };

            match self.store.execute(batch).await? {
                BatchOutcome::Applied(_) => {
                    debug!(queue = %queue, message_id = %id, "Deleted message");
                    return Ok(());
                }
                BatchOutcome::Aborted { condition: 0 } => return Err(Self::queue_not_found(queue)),
                BatchOutcome::Aborted { .. } => {
                    debug!(
                        queue = %queue,
                        message_id = %id,
                        attempt,
                        "Message moved during delete, re-reading"
                    );
                }
            }
        }

        Err(self.conflict("delete_message", queue))
    }

    // ------------------------------------------------------------------------
    // Visibility
    // ------------------------------------------------------------------------

    /// Move the lock deadline of an in-flight message to `now + timeout`
    ///
    /// Returns the new deadline. A timeout of zero releases the lock at the
    /// next reclamation.
    pub async fn change_visibility(
        &self,
        queue: &QueueName,
        id: &MessageId,
        receipt: &ReceiptToken,
        timeout: u32,
    ) -> Result<Timestamp, QueueError> {
        validate_timeout("visibility_timeout", timeout)?;
        self.registry.attributes(queue).await?;

        let keys = self.registry.keys(queue);
        let record_key = keys.message(id);

        for attempt in 1..=self.config.max_conflict_retries {
            let Some(current) = self.store.hget(&keys.in_flight(), &id.to_string()).await? else {
                return Err(Self::message_not_found(id));
            };
            let active = self.store.hget(&record_key, record::RECEIPT).await?;

            let now = Timestamp::now();
            let lapsed = parse_deadline(&keys.in_flight(), &id.to_string(), &current)? <= now;
            if lapsed || active.as_deref() != Some(receipt.as_str()) {
                return Err(Self::message_not_found(id));
            }

            let visible_at = now.add_seconds(timeout);
            let deadline = visible_at.as_millis().to_string();
            let batch = Batch::new()
                .require(Condition::KeyExists { key: keys.meta() })
                .require(Condition::FieldEquals {
                    key: keys.in_flight(),
                    field: id.to_string(),
                    value: current,
                })
                .require(Condition::FieldEquals {
                    key: record_key.clone(),
                    field: record::RECEIPT.to_string(),
                    value: receipt.to_string(),
                })
                .command(Command::HSet {
                    key: keys.in_flight(),
                    fields: vec![(id.to_string(), deadline.clone())],
                })
                .command(Command::HSet {
                    key: record_key.clone(),
                    fields: vec![(record::VISIBLE_AT.to_string(), deadline)],
                })
                .command(Command::HIncrBy {
                    key: keys.meta(),
                    field: meta::TOTALCHANGED.to_string(),
                    delta: 1,
                });

            match self.store.execute(batch).await? {
                BatchOutcome::Applied(_) => {
                    debug!(queue = %queue, message_id = %id, timeout, "Changed message visibility");
                    return Ok(visible_at);
                }
                BatchOutcome::Aborted { condition: 0 } => return Err(Self::queue_not_found(queue)),
                BatchOutcome::Aborted { .. } => {
                    debug!(
                        queue = %queue,
                        message_id = %id,
                        attempt,
                        "Lock changed concurrently, re-reading"
                    );
                }
            }
        }

        Err(self.conflict("change_message_visibility", queue))
    }

    // ------------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------------

    /// Return every in-flight message whose deadline has passed to the pending list
    ///
    /// Each move is conditioned on the in-flight entry still carrying the
    /// deadline that was read, so concurrent sweepers requeue a message once.
    /// Reclaimed messages go to the head of the list, oldest deadline first.
    pub async fn reclaim(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let keys = self.registry.keys(queue);
        let in_flight = self.store.hget_all(&keys.in_flight()).await?;
        let now = Timestamp::now();

        let mut expired = Vec::new();
        for (raw_id, raw_deadline) in in_flight {
            let deadline = parse_deadline(&keys.in_flight(), &raw_id, &raw_deadline)?;
            if deadline <= now {
                expired.push((deadline, raw_id, raw_deadline));
            }
        }

        // Pushed to the head one by one, so the earliest deadline goes last
        expired.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let mut reclaimed = 0usize;
        for (_, raw_id, raw_deadline) in expired {
            let id = match raw_id.parse::<MessageId>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(queue = %queue, id = %raw_id, "Skipping malformed in-flight id");
                    continue;
                }
            };

            let batch = Batch::new()
                .require(Condition::KeyExists { key: keys.meta() })
                .require(Condition::FieldEquals {
                    key: keys.in_flight(),
                    field: raw_id.clone(),
                    value: raw_deadline,
                })
                .command(Command::HDel {
                    key: keys.in_flight(),
                    fields: vec![raw_id.clone()],
                })
                .command(Command::HDel {
                    key: keys.message(&id),
                    fields: vec![record::RECEIPT.to_string(), record::VISIBLE_AT.to_string()],
                })
                .command(Command::LPush {
                    key: keys.pending(),
                    value: raw_id,
                })
                .command(Command::HIncrBy {
                    key: keys.meta(),
                    field: meta::HIDDENMSGS.to_string(),
                    delta: -1,
                })
                .command(Command::HIncrBy {
                    key: keys.meta(),
                    field: meta::MSGS.to_string(),
                    delta: 1,
                });

            match self.store.execute(batch).await? {
                BatchOutcome::Applied(_) => {
                    debug!(queue = %queue, message_id = %id, "Reclaimed expired message");
                    reclaimed += 1;
                }
                BatchOutcome::Aborted { condition: 0 } => return Err(Self::queue_not_found(queue)),
                BatchOutcome::Aborted { .. } => {
                    debug!(
                        queue = %queue,
                        message_id = %id,
                        "Message already reclaimed or deleted"
                    );
                }
            }
        }

        if reclaimed > 0 {
            info!(queue = %queue, reclaimed, "Reclaimed expired messages");
        }
        Ok(reclaimed)
    }
}
