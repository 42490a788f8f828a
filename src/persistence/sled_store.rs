//! Persistence layer backed by `sled`
//!
//! Snapshots live in a dedicated `snapshots` tree keyed by broker id. Every
//! write is flushed so a crash right after a sync still finds the snapshot on
//! restart.

use sled::{Db, Tree};

use super::{Storage, StorageError};

const SNAPSHOT_TREE: &str = "snapshots";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    snapshots: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let snapshots = db.open_tree(SNAPSHOT_TREE)?;
        Ok(Self { db, snapshots })
    }
}

impl Storage for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.snapshots.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.snapshots.insert(key.as_bytes(), value)?;
        self.snapshots.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("recovered", &self.db.was_recovered())
            .finish()
    }
}
