//! Key-value store interface and implementations.
//!
//! Keys are UTF-8 strings kept in lexicographic order so that prefix scans
//! double as range queries. Every write goes through a [`Batch`], which is
//! applied atomically: either all of its operations become visible or none
//! of them do.

pub mod memory;
pub mod redb;

use std::fmt;
use thiserror::Error;

/// Errors that can occur in KV store operations.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv: storage error: {0}")]
    Storage(String),

    #[error("kv: commit rejected: {0}")]
    Rejected(String),
}

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// A single write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(String, Vec<u8>),
    Delete(String),
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::Put(k, _) | Op::Delete(k) => k,
        }
    }
}

/// An ordered list of writes committed as one transaction.
///
/// Later operations on the same key win.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Put(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Delete(key.into()));
        self
    }

    /// Append all operations of `other` after the ones already queued.
    pub fn extend(&mut self, other: Batch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Key-value store trait.
///
/// Implementations must be safe for concurrent use. Readers never observe a
/// partially applied batch.
pub trait KvStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Return all entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>>;

    /// Return all keys starting with `prefix`, in key order.
    fn scan_keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        Ok(self.scan(prefix)?.into_iter().map(|(k, _)| k).collect())
    }

    /// Return the first `limit` keys starting with `prefix`, in key order.
    fn scan_keys_limit(&self, prefix: &str, limit: usize) -> KvResult<Vec<String>> {
        let mut keys = self.scan_keys(prefix)?;
        keys.truncate(limit);
        Ok(keys)
    }

    /// Apply every operation of `batch` atomically.
    fn commit(&self, batch: Batch) -> KvResult<()>;

    /// Set a single key. Shorthand for a one-operation batch.
    fn put(&self, key: &str, value: &[u8]) -> KvResult<()> {
        let mut b = Batch::new();
        b.put(key, value);
        self.commit(b)
    }

    /// Delete a single key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> KvResult<()> {
        let mut b = Batch::new();
        b.delete(key);
        self.commit(b)
    }
}

impl fmt::Debug for dyn KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KvStore {{ ... }}")
    }
}

pub use memory::MemoryStore;
pub use redb::RedbStore;
