//! In-memory key-value store for testing and development.
//!
//! This module provides a fully functional in-memory store that:
//! - Keeps hashes, lists and sets per key with Redis-like semantics
//! - Applies batches atomically under a single write lock
//! - Stages every touched key so a failing command leaves no partial state
//! - Drops empty containers, so existence checks match a real store
//!
//! It is the reference implementation of the batch contract that
//! network-backed stores must reproduce.

use crate::error::StoreError;
use crate::store::{Batch, BatchOutcome, Command, Condition, KeyValueStore, Reply};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Value held by a single key
#[derive(Debug, Clone)]
enum StoredValue {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

impl StoredValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Hash(_) => "hash",
            Self::List(_) => "list",
            Self::Set(_) => "set",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Hash(h) => h.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::Set(s) => s.is_empty(),
        }
    }
}

type Keyspace = HashMap<String, StoredValue>;

fn wrong_type(key: &str, expected: &'static str, actual: &StoredValue) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
        actual: actual.type_name(),
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable {
        message: "in-memory store lock poisoned".to_string(),
    }
}

fn read_hash<'a>(
    data: &'a Keyspace,
    key: &str,
) -> Result<Option<&'a HashMap<String, String>>, StoreError> {
    match data.get(key) {
        None => Ok(None),
        Some(StoredValue::Hash(hash)) => Ok(Some(hash)),
        Some(other) => Err(wrong_type(key, "hash", other)),
    }
}

fn read_list<'a>(data: &'a Keyspace, key: &str) -> Result<Option<&'a VecDeque<String>>, StoreError> {
    match data.get(key) {
        None => Ok(None),
        Some(StoredValue::List(list)) => Ok(Some(list)),
        Some(other) => Err(wrong_type(key, "list", other)),
    }
}

fn parse_integer(key: &str, field: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse::<i64>().map_err(|_| StoreError::Corrupted {
        key: key.to_string(),
        field: field.to_string(),
        message: format!("'{}' is not an integer", raw),
    })
}

// ============================================================================
// Condition Evaluation
// ============================================================================

fn condition_holds(data: &Keyspace, condition: &Condition) -> Result<bool, StoreError> {
    match condition {
        Condition::KeyExists { key } => Ok(data.contains_key(key)),
        Condition::KeyMissing { key } => Ok(!data.contains_key(key)),
        Condition::FieldEquals { key, field, value } => Ok(read_hash(data, key)?
            .and_then(|hash| hash.get(field))
            .is_some_and(|current| current == value)),
        Condition::FieldPresent { key, field } => {
            Ok(read_hash(data, key)?.is_some_and(|hash| hash.contains_key(field)))
        }
        Condition::ListContains { key, value } => {
            Ok(read_list(data, key)?.is_some_and(|list| list.iter().any(|v| v == value)))
        }
        Condition::FieldSumBelow { key, fields, limit } => {
            let mut sum: i64 = 0;
            if let Some(hash) = read_hash(data, key)? {
                for field in fields {
                    if let Some(raw) = hash.get(field) {
                        sum = sum.saturating_add(parse_integer(key, field, raw)?);
                    }
                }
            }
            Ok(sum < *limit)
        }
    }
}

// ============================================================================
// Command Application
// ============================================================================

fn command_key(command: &Command) -> &str {
    match command {
        Command::HSet { key, .. }
        | Command::HSetNx { key, .. }
        | Command::HIncrBy { key, .. }
        | Command::HDel { key, .. }
        | Command::Del { key }
        | Command::LPush { key, .. }
        | Command::RPush { key, .. }
        | Command::LPop { key }
        | Command::LRem { key, .. }
        | Command::SAdd { key, .. }
        | Command::SRem { key, .. } => key,
    }
}

fn hash_mut<'a>(
    slot: &'a mut Option<StoredValue>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, StoreError> {
    match slot.get_or_insert_with(|| StoredValue::Hash(HashMap::new())) {
        StoredValue::Hash(hash) => Ok(hash),
        other => Err(wrong_type(key, "hash", other)),
    }
}

fn list_mut<'a>(
    slot: &'a mut Option<StoredValue>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StoreError> {
    match slot.get_or_insert_with(|| StoredValue::List(VecDeque::new())) {
        StoredValue::List(list) => Ok(list),
        other => Err(wrong_type(key, "list", other)),
    }
}

fn set_mut<'a>(
    slot: &'a mut Option<StoredValue>,
    key: &str,
) -> Result<&'a mut HashSet<String>, StoreError> {
    match slot.get_or_insert_with(|| StoredValue::Set(HashSet::new())) {
        StoredValue::Set(set) => Ok(set),
        other => Err(wrong_type(key, "set", other)),
    }
}

fn apply_command(slot: &mut Option<StoredValue>, command: &Command) -> Result<Reply, StoreError> {
    let key = command_key(command);
    let reply = match command {
        Command::HSet { fields, .. } => {
            let hash = hash_mut(slot, key)?;
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Reply::Ok
        }
        Command::HSetNx { field, value, .. } => {
            let hash = hash_mut(slot, key)?;
            if hash.contains_key(field) {
                Reply::Integer(0)
            } else {
                hash.insert(field.clone(), value.clone());
                Reply::Integer(1)
            }
        }
        Command::HIncrBy { field, delta, .. } => {
            let hash = hash_mut(slot, key)?;
            let current = match hash.get(field) {
                Some(raw) => parse_integer(key, field, raw)?,
                None => 0,
            };
            let updated = current
                .checked_add(*delta)
                .ok_or_else(|| StoreError::Corrupted {
                    key: key.to_string(),
                    field: field.clone(),
                    message: "increment overflows".to_string(),
                })?;
            hash.insert(field.clone(), updated.to_string());
            Reply::Integer(updated)
        }
        Command::HDel { fields, .. } => {
            if slot.is_none() {
                Reply::Integer(0)
            } else {
                let hash = hash_mut(slot, key)?;
                let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
                Reply::Integer(removed as i64)
            }
        }
        Command::Del { .. } => Reply::Integer(i64::from(slot.take().is_some())),
        Command::LPush { value, .. } => {
            let list = list_mut(slot, key)?;
            list.push_front(value.clone());
            Reply::Integer(list.len() as i64)
        }
        Command::RPush { value, .. } => {
            let list = list_mut(slot, key)?;
            list.push_back(value.clone());
            Reply::Integer(list.len() as i64)
        }
        Command::LPop { .. } => {
            if slot.is_none() {
                Reply::Value(None)
            } else {
                Reply::Value(list_mut(slot, key)?.pop_front())
            }
        }
        Command::LRem { value, .. } => {
            if slot.is_none() {
                Reply::Integer(0)
            } else {
                let list = list_mut(slot, key)?;
                let before = list.len();
                list.retain(|v| v != value);
                Reply::Integer((before - list.len()) as i64)
            }
        }
        Command::SAdd { member, .. } => {
            Reply::Integer(i64::from(set_mut(slot, key)?.insert(member.clone())))
        }
        Command::SRem { member, .. } => {
            if slot.is_none() {
                Reply::Integer(0)
            } else {
                Reply::Integer(i64::from(set_mut(slot, key)?.remove(member)))
            }
        }
    };

    Ok(reply)
}

// ============================================================================
// InMemoryStore
// ============================================================================

/// Thread-safe in-memory key-value store
///
/// Clones share the same keyspace, so a clone can be handed to every
/// component that needs a store handle.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<Keyspace>>,
}

impl InMemoryStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding a value
    pub fn key_count(&self) -> Result<usize, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.len())
    }

    /// All keys starting with the prefix, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.contains_key(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(read_hash(&data, key)?.and_then(|hash| hash.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(read_hash(&data, key)?.cloned().unwrap_or_default())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        let Some(list) = read_list(&data, key)? else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(read_list(&data, key)?.map_or(0, |list| list.len() as u64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(StoredValue::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, "set", other)),
        }
    }

    async fn execute(&self, batch: Batch) -> Result<BatchOutcome, StoreError> {
        let (conditions, commands) = batch.into_parts();
        let mut data = self.data.write().map_err(|_| poisoned())?;

        for (index, condition) in conditions.iter().enumerate() {
            if !condition_holds(&data, condition)? {
                return Ok(BatchOutcome::Aborted { condition: index });
            }
        }

        // Work on copies so a failing command discards the whole batch
        let mut staged: HashMap<String, Option<StoredValue>> = HashMap::new();
        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            let key = command_key(command);
            let slot = staged
                .entry(key.to_string())
                .or_insert_with(|| data.get(key).cloned());
            replies.push(apply_command(slot, command)?);
        }

        for (key, value) in staged {
            match value {
                Some(value) if !value.is_empty() => {
                    data.insert(key, value);
                }
                _ => {
                    data.remove(&key);
                }
            }
        }

        Ok(BatchOutcome::Applied(replies))
    }
}
