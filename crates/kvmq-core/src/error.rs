//! Error types for queue operations.

use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
///
/// Every public operation returns exactly one of these. Validation failures are
/// detected before the store is touched, so none of them leave partial state
/// behind. Only [`QueueError::Store`] is worth retrying.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Missing required parameter: {parameter}")]
    MissingParameter { parameter: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Queue already exists: {queue_name}")]
    QueueExists { queue_name: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue is empty: {queue_name}")]
    QueueEmpty { queue_name: String },

    #[error("Queue is full: {queue_name} holds {count} of {capacity} messages")]
    QueueFull {
        queue_name: String,
        count: u64,
        capacity: u64,
    },

    #[error("Message not found or receipt expired: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Message already exists: {message_id}")]
    MessageExists { message_id: String },

    #[error("Message too long: {size} bytes (max: {max_size})")]
    MessageTooLong { size: usize, max_size: usize },

    #[error("Message body is not a valid UTF-8 string")]
    MessageNotString,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Field-less mirror of [`QueueError`] for exhaustive matching by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingParameter,
    InvalidValue,
    InvalidFormat,
    QueueExists,
    QueueNotFound,
    QueueEmpty,
    QueueFull,
    MessageNotFound,
    MessageExists,
    MessageTooLong,
    MessageNotString,
    Store,
    Configuration,
}

impl QueueError {
    /// Kind of this error without its payload
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingParameter { .. } => ErrorKind::MissingParameter,
            Self::InvalidValue { .. } => ErrorKind::InvalidValue,
            Self::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            Self::QueueExists { .. } => ErrorKind::QueueExists,
            Self::QueueNotFound { .. } => ErrorKind::QueueNotFound,
            Self::QueueEmpty { .. } => ErrorKind::QueueEmpty,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::MessageNotFound { .. } => ErrorKind::MessageNotFound,
            Self::MessageExists { .. } => ErrorKind::MessageExists,
            Self::MessageTooLong { .. } => ErrorKind::MessageTooLong,
            Self::MessageNotString => ErrorKind::MessageNotString,
            Self::Store(_) => ErrorKind::Store,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Store(StoreError::ConnectionFailed { .. }) => Some(Duration::seconds(5)),
            Self::Store(StoreError::Timeout { .. }) => Some(Duration::seconds(1)),
            Self::Store(StoreError::Conflict { .. }) => Some(Duration::milliseconds(50)),
            _ => None,
        }
    }

    pub(crate) fn missing(parameter: &str) -> Self {
        Self::MissingParameter {
            parameter: parameter.to_string(),
        }
    }

    pub(crate) fn invalid_value(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_format(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Failures reported by the key-value store adapter
///
/// These are passed through untouched by the queue engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Key '{key}' holds a {actual} where a {expected} was expected")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Stored value at '{key}' field '{field}' is corrupted: {message}")]
    Corrupted {
        key: String,
        field: String,
        message: String,
    },

    #[error("Operation '{operation}' lost {attempts} consecutive races")]
    Conflict { operation: String, attempts: u32 },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::Conflict { .. } => true,
            Self::Unavailable { .. } => true,
            Self::WrongType { .. } => false,
            Self::Corrupted { .. } => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
