//! In-memory key-value store implementation for testing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::{Batch, KvError, KvResult, KvStore, Op};

/// An in-memory key-value store backed by an ordered map.
///
/// Clones share the same data. [`MemoryStore::fail_next_commits`] makes the
/// next `n` commits fail without applying anything, which lets callers
/// exercise their rollback paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    failing: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` commits.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn scan_keys_limit(&self, prefix: &str, limit: usize) -> KvResult<Vec<String>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn commit(&self, batch: Batch) -> KvResult<()> {
        let pending = self.failing.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing.store(pending - 1, Ordering::SeqCst);
            return Err(KvError::Rejected("injected commit failure".into()));
        }

        let mut data = self.data.write();
        for op in batch.ops() {
            match op {
                Op::Put(k, v) => {
                    data.insert(k.clone(), v.clone());
                }
                Op::Delete(k) => {
                    data.remove(k);
                }
            }
        }
        Ok(())
    }
}
