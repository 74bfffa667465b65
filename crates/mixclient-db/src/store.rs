//! The persistence collaborator consumed by the engine.
//!
//! [`MessageStore`] is a key-value interface scoped by account. Values are
//! opaque bytes; [`crate::records`] layers typed JSON records on top.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use mixclient_types::AccountId;
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::queries::records;
use crate::Result;

/// Durable record storage, shared by every account pipeline.
pub trait MessageStore: Send + Sync {
    /// Insert or replace the record under `key`.
    fn put(&self, account: &AccountId, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the record under `key`.
    fn get(&self, account: &AccountId, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the record under `key`. Returns whether it existed.
    fn delete(&self, account: &AccountId, key: &str) -> Result<bool>;

    /// All records whose key starts with `prefix`, ordered by key.
    fn list(&self, account: &AccountId, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Non-durable store for tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<AccountId, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all accounts.
    pub fn len(&self) -> usize {
        self.records.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for MemoryStore {
    fn put(&self, account: &AccountId, key: &str, value: &[u8]) -> Result<()> {
        self.records
            .lock()
            .entry(*account)
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, account: &AccountId, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .lock()
            .get(account)
            .and_then(|m| m.get(key).cloned()))
    }

    fn delete(&self, account: &AccountId, key: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .get_mut(account)
            .is_some_and(|m| m.remove(key).is_some()))
    }

    fn list(&self, account: &AccountId, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let records = self.records.lock();
        Ok(records
            .get(account)
            .map(|m| {
                m.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// SQLite-backed store. The connection is serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(crate::open(path)?),
        })
    }

    /// In-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(crate::open_memory()?),
        })
    }
}

impl MessageStore for SqliteStore {
    fn put(&self, account: &AccountId, key: &str, value: &[u8]) -> Result<()> {
        records::put(&self.conn.lock(), account, key, value, now_secs())
    }

    fn get(&self, account: &AccountId, key: &str) -> Result<Option<Vec<u8>>> {
        records::get(&self.conn.lock(), account, key)
    }

    fn delete(&self, account: &AccountId, key: &str) -> Result<bool> {
        records::delete(&self.conn.lock(), account, key)
    }

    fn list(&self, account: &AccountId, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        records::list_prefix(&self.conn.lock(), account, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn MessageStore) {
        let alice = AccountId([1; 32]);
        let bob = AccountId([2; 32]);

        store.put(&alice, "pending/02", b"b").expect("put");
        store.put(&alice, "pending/01", b"a").expect("put");
        store.put(&alice, "sent/01", b"s").expect("put");
        store.put(&bob, "pending/01", b"other").expect("put");

        assert_eq!(store.get(&alice, "pending/01").expect("get"), Some(b"a".to_vec()));
        let pending = store.list(&alice, "pending/").expect("list");
        assert_eq!(
            pending,
            vec![
                ("pending/01".to_string(), b"a".to_vec()),
                ("pending/02".to_string(), b"b".to_vec()),
            ]
        );

        assert!(store.delete(&alice, "pending/01").expect("delete"));
        assert!(!store.delete(&alice, "pending/01").expect("delete"));
        assert_eq!(store.list(&alice, "pending/").expect("list").len(), 1);
        assert_eq!(store.get(&bob, "pending/01").expect("get"), Some(b"other".to_vec()));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteStore::open_memory().expect("open"));
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mixclient.db");
        let account = AccountId([9; 32]);
        {
            let store = SqliteStore::open(&path).expect("open");
            store.put(&account, "inbox/aa", b"hello").expect("put");
        }
        let store = SqliteStore::open(&path).expect("reopen");
        assert_eq!(store.get(&account, "inbox/aa").expect("get"), Some(b"hello".to_vec()));
    }
}
