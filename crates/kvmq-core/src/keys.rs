//! Store key layout.
//!
//! Every key is `<namespace>:<queue>:<suffix>` except the registry set, which
//! has two segments and therefore cannot collide with any queue key.

use crate::message::{MessageId, QueueName};

/// Set of registered queue names within a namespace
pub(crate) fn registry_key(namespace: &str) -> String {
    format!("{}:QUEUES", namespace)
}

/// Hash field names of the queue metadata
pub(crate) mod meta {
    pub const VT: &str = "vt";
    pub const DELAY: &str = "delay";
    pub const MAXSIZE: &str = "maxsize";
    pub const MAXMSGS: &str = "maxmsgs";
    pub const CREATED: &str = "created";
    pub const MODIFIED: &str = "modified";
    pub const TOTALSENT: &str = "totalsent";
    pub const TOTALRECEIVED: &str = "totalreceived";
    pub const TOTALCHANGED: &str = "totalchanged";
    pub const MSGS: &str = "msgs";
    pub const HIDDENMSGS: &str = "hiddenmsgs";
}

/// Hash field names of a message record
pub(crate) mod record {
    pub const BODY: &str = "body";
    pub const SENT: &str = "sent";
    pub const FIRST_SEEN: &str = "fs";
    pub const FIRST_RECEIVED: &str = "fr";
    /// Earliest time the message may be received (send time plus delay)
    pub const AVAILABLE_AT: &str = "va";
    pub const RECEIVE_COUNT: &str = "rc";
    pub const RECEIPT: &str = "rt";
    pub const VISIBLE_AT: &str = "vu";
}

/// Keys belonging to one queue
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    prefix: String,
    registry: String,
}

impl QueueKeys {
    pub fn new(namespace: &str, queue: &QueueName) -> Self {
        Self {
            prefix: format!("{}:{}", namespace, queue),
            registry: registry_key(namespace),
        }
    }

    /// Metadata hash with settings and counters
    pub fn meta(&self) -> String {
        format!("{}:Q", self.prefix)
    }

    /// List of pending message ids, oldest at the head
    pub fn pending(&self) -> String {
        format!("{}:P", self.prefix)
    }

    /// Hash of in-flight message id to visibility deadline in milliseconds
    pub fn in_flight(&self) -> String {
        format!("{}:F", self.prefix)
    }

    /// Record hash of a single message
    pub fn message(&self, id: &MessageId) -> String {
        format!("{}:M:{}", self.prefix, id)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }
}
