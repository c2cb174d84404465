//! Identity-keyed persistence.
//!
//! Records are serialized as JSON and kept either in a `redb` database (one
//! table per record kind, keyed by identity) or in memory.

use redb::{Database, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const FINGERPRINT_TABLE: &str = "fingerprints";
pub const COOKIE_TABLE: &str = "cookies";
pub const SESSION_TABLE: &str = "sessions";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn db_err<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Database(err.into())
}

/// Load/save interface for one record kind.
pub trait Store<T>: Send + Sync {
    fn load(&self, identity: &str) -> Result<Option<T>, StoreError>;
    fn save(&self, identity: &str, value: &T) -> Result<(), StoreError>;
    fn remove(&self, identity: &str) -> Result<(), StoreError>;
}

/// Opens (or creates) the database file, creating parent directories.
pub fn open_database(path: impl AsRef<Path>) -> Result<Arc<Database>, StoreError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let db = Database::create(path).map_err(db_err)?;
    Ok(Arc::new(db))
}

/// `redb`-backed store for one table.
pub struct RedbStore<T> {
    db: Arc<Database>,
    table: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RedbStore<T> {
    pub fn new(db: Arc<Database>, table: &'static str) -> Self {
        Self {
            db,
            table,
            _marker: PhantomData,
        }
    }

    fn definition(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        TableDefinition::new(self.table)
    }
}

impl<T> Store<T> for RedbStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self, identity: &str) -> Result<Option<T>, StoreError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(self.definition()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(db_err(err)),
        };
        let Some(guard) = table.get(identity).map_err(db_err)? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(guard.value())?;
        Ok(Some(value))
    }

    fn save(&self, identity: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(self.definition()).map_err(db_err)?;
            table.insert(identity, bytes.as_slice()).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(self.definition()).map_err(db_err)?;
            table.remove(identity).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }
}

/// In-process store; nothing survives the process.
pub struct MemoryStore<T> {
    records: Mutex<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|records| records.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Clone + Send,
{
    fn load(&self, identity: &str) -> Result<Option<T>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(identity).cloned())
    }

    fn save(&self, identity: &str, value: &T) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.insert(identity.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.remove(identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redb_store_round_trips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("nested/state.redb")).unwrap();
        let store: RedbStore<HashMap<String, String>> = RedbStore::new(db, COOKIE_TABLE);

        assert!(store.load("alice").unwrap().is_none());

        let mut cookies = HashMap::new();
        cookies.insert("sid".to_string(), "abc".to_string());
        store.save("alice", &cookies).unwrap();
        assert_eq!(store.load("alice").unwrap(), Some(cookies));
        assert!(store.load("bob").unwrap().is_none());

        store.remove("alice").unwrap();
        assert!(store.load("alice").unwrap().is_none());
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryStore::new();
        store.save("a", &1u32).unwrap();
        store.save("a", &2u32).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(2));
        assert_eq!(store.len(), 1);
    }
}
