//! Redb-based persistent key-value store implementation.

use std::path::Path;

use redb::{Database, TableDefinition};

use crate::{Batch, KvError, KvResult, KvStore, Op};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

fn storage<E: std::fmt::Display>(e: E) -> KvError {
    KvError::Storage(e.to_string())
}

/// A persistent key-value store backed by redb.
///
/// Each [`Batch`] is applied inside one redb write transaction, so a crash
/// mid-commit leaves the previous state intact.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> KvResult<Self> {
        let db = Database::create(path).map_err(storage)?;

        // Create the table if it doesn't exist.
        let tx = db.begin_write().map_err(storage)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        Ok(Self { db })
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;
        Ok(table.get(key).map_err(storage)?.map(|v| v.value().to_vec()))
    }

    fn scan(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;

        let mut results = Vec::new();
        for item in table.range(prefix..).map_err(storage)? {
            let (key, value) = item.map_err(storage)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }

    fn scan_keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;

        let mut keys = Vec::new();
        for item in table.range(prefix..).map_err(storage)? {
            let (key, _) = item.map_err(storage)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    fn scan_keys_limit(&self, prefix: &str, limit: usize) -> KvResult<Vec<String>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;

        let mut keys = Vec::new();
        for item in table.range(prefix..).map_err(storage)? {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = item.map_err(storage)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    fn commit(&self, batch: Batch) -> KvResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            for op in batch.ops() {
                match op {
                    Op::Put(k, v) => {
                        table.insert(k.as_str(), v.as_slice()).map_err(storage)?;
                    }
                    Op::Delete(k) => {
                        table.remove(k.as_str()).map_err(storage)?;
                    }
                }
            }
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_basic() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.put("key1", b"value1").unwrap();
        assert_eq!(store.get("key1").unwrap(), Some(b"value1".to_vec()));

        store.delete("key1").unwrap();
        assert_eq!(store.get("key1").unwrap(), None);
    }

    #[test]
    fn test_redb_scan_stops_at_prefix_end() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.put("prefix:a", b"1").unwrap();
        store.put("prefix:b", b"2").unwrap();
        store.put("prefiz", b"3").unwrap();
        store.put("other:c", b"4").unwrap();

        let results = store.scan("prefix:").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "prefix:a");
        assert_eq!(store.scan_keys("prefix:").unwrap().len(), 2);
        assert_eq!(store.scan_keys_limit("prefix:", 1).unwrap(), vec!["prefix:a".to_string()]);
        assert!(store.scan_keys_limit("prefix:", 0).unwrap().is_empty());
    }

    #[test]
    fn test_redb_batch_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            let mut b = Batch::new();
            b.put("a", vec![1]).put("b", vec![2]).delete("a");
            store.commit(b).unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(vec![2]));
    }
}
