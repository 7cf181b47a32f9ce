//! LMDB-backed durable store.
//!
//! Uses the heed crate so cache snapshots and invalidation signals survive
//! restarts and are visible to every process mapping the same directory.
//! Each `DurableStore` call runs in its own LMDB transaction.

use std::path::{Path, PathBuf};

use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions};
use tracing::info;
use wayfare_core::{DurableStore, LmdbSettings, StorageError, StorageResult};

/// Durable string store in a single unnamed LMDB database.
#[derive(Clone)]
pub struct LmdbStore {
    env: Env,
    db: Database<Str, Str>,
    path: PathBuf,
    map_size: usize,
}

impl LmdbStore {
    /// Open (or create) the store in `path`, mapping at most `max_size_mb`.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> StorageResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(backend)?;

        let map_size = max_size_mb * 1024 * 1024;
        // SAFETY: the data file is only touched through heed transactions.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path)
        }
        .map_err(backend)?;

        let mut wtxn = env.write_txn().map_err(backend)?;
        let db: Database<Str, Str> = env.create_database(&mut wtxn, None).map_err(backend)?;
        wtxn.commit().map_err(backend)?;

        info!(path = %path.display(), max_size_mb, "Opened LMDB store");
        Ok(Self {
            env,
            db,
            path: path.to_path_buf(),
            map_size,
        })
    }

    /// Open the store described by `settings`, or `None` when no path is set.
    pub fn from_settings(settings: &LmdbSettings) -> StorageResult<Option<Self>> {
        settings
            .path
            .as_ref()
            .map(|path| Self::open(path, settings.map_size_mb))
            .transpose()
    }

    /// Number of stored keys.
    pub fn len(&self) -> StorageResult<u64> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.db.len(&rtxn).map_err(backend)
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.path)
            .field("map_size", &self.map_size)
            .finish_non_exhaustive()
    }
}

impl DurableStore for LmdbStore {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let value = self.db.get(&rtxn, key).map_err(backend)?;
        Ok(value.map(str::to_owned))
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        self.db.put(&mut wtxn, key, value).map_err(|e| match e {
            heed::Error::Mdb(heed::MdbError::MapFull) => StorageError::QuotaExceeded {
                key: key.to_string(),
                needed: key.len() + value.len(),
                limit: self.map_size,
            },
            other => backend(other),
        })?;
        wtxn.commit().map_err(backend)
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        self.db.delete(&mut wtxn, key).map_err(backend)?;
        wtxn.commit().map_err(backend)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let mut keys = Vec::new();
        for item in self.db.iter(&rtxn).map_err(backend)? {
            let (key, _) = item.map_err(backend)?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

fn backend<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend {
        reason: e.to_string(),
    }
}
