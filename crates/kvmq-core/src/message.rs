//! Message types for queue operations including core domain identifiers.

use crate::error::QueueError;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ulid::Ulid;

/// Longest queue name accepted by [`QueueName::new`]
pub const MAX_QUEUE_NAME_LENGTH: usize = 160;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
///
/// Names become part of store keys, so the `:` separator is never allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(QueueError::missing("queue_name"));
        }

        if name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(QueueError::invalid_format(
                "queue_name",
                format!("must be at most {} characters", MAX_QUEUE_NAME_LENGTH),
            ));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(QueueError::invalid_format(
                "queue_name",
                "only ASCII alphanumeric, hyphens, and underscores allowed",
            ));
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unique, time-sortable identifier for messages within a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generate new message ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of message ID
    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(QueueError::missing("message_id"));
        }

        let ulid = s
            .parse::<Ulid>()
            .map_err(|_| QueueError::invalid_format("message_id", "expected a ULID"))?;
        Ok(Self(ulid))
    }
}

/// Opaque credential handed out by a receive
///
/// Only the most recent token issued for a message is accepted by delete and
/// visibility changes. Any redelivery replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    /// Generate a fresh random token
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap a token previously returned to a consumer
    pub fn parse(token: &str) -> Result<Self, QueueError> {
        if token.is_empty() {
            return Err(QueueError::missing("receipt"));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReceiptToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
///
/// Persisted as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current time, truncated to the millisecond precision it is stored with
    pub fn now() -> Self {
        Self(Utc::now().trunc_subsecs(3))
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Rebuild a timestamp from its stored millisecond form
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp a whole number of seconds later
    pub fn add_seconds(&self, seconds: u32) -> Self {
        Self(self.0 + Duration::seconds(i64::from(seconds)))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message as stored in a queue, without any delivery credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub body: String,
    /// Number of successful receives, including the current one
    pub receive_count: u64,
    pub sent_at: Timestamp,
    pub first_seen_at: Timestamp,
    pub first_received_at: Option<Timestamp>,
}

/// A message handed to a consumer together with its lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub message: Message,
    pub receipt: ReceiptToken,
    /// Deadline after which the message is eligible for redelivery
    pub visible_at: Timestamp,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> MessageId {
        self.message.message_id
    }

    pub fn body(&self) -> &str {
        &self.message.body
    }

    /// Check if the visibility lock has lapsed
    pub fn is_lock_expired(&self) -> bool {
        Timestamp::now() >= self.visible_at
    }
}

// ============================================================================
// Send and Receive Options
// ============================================================================

/// Configuration options for sending messages to queues
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Seconds before the message becomes receivable, overriding the queue delay
    pub delay: Option<u32>,
}

impl SendOptions {
    /// Create new send options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the queue's delivery delay for this message
    pub fn with_delay(mut self, seconds: u32) -> Self {
        self.delay = Some(seconds);
        self
    }
}

/// Configuration options for receiving messages from queues
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Lock duration in seconds, overriding the queue visibility timeout
    pub visibility_timeout: Option<u32>,
}

impl ReceiveOptions {
    /// Create new receive options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the queue's visibility timeout for this receive
    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = Some(seconds);
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
