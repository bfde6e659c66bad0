//! RocksDB-backed durable storage.
//!
//! One database holds every namespace; rows are keyed
//! `namespace \0 key` and valued `[type-tag byte][wire bytes]`, so a
//! namespace enumerates as one contiguous prefix scan and a clear is
//! one write batch.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded,
    WriteBatch, WriteOptions,
};
use std::path::PathBuf;
use std::sync::Arc;

use prefsync_core::PrefType;

use super::{PrefStorage, StorageError, StorageFactory};

type Db = DBWithThreadMode<SingleThreaded>;

/// RocksDB tuning knobs.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB — preference rows are tiny)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: f64,
    /// Enable fsync on every write (default: true — durability before
    /// notification is the store's core invariant)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("prefsync_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Shared database; hands out one [`RocksStorage`] per namespace.
pub struct RocksFactory {
    db: Arc<Db>,
    sync_writes: bool,
}

impl RocksFactory {
    /// Open (or create) the database at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_write_buffer_size(config.write_buffer_size);
        db_opts.set_keep_log_file_num(5);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&Cache::new_lru_cache(config.block_cache_size));
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let db = Db::open(&db_opts, &config.path)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        log::info!("Opened preference database at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }
}

impl StorageFactory for RocksFactory {
    fn open(&self, namespace: &str) -> Result<Box<dyn PrefStorage>, StorageError> {
        Ok(Box::new(RocksStorage {
            db: self.db.clone(),
            prefix: row_prefix(namespace),
            sync_writes: self.sync_writes,
        }))
    }
}

/// One namespace's view of the shared database.
pub struct RocksStorage {
    db: Arc<Db>,
    prefix: Vec<u8>,
    sync_writes: bool,
}

/// Namespace prefix for row keys. Namespace names must not contain
/// NUL, which is the prefix separator.
fn row_prefix(namespace: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(namespace.len() + 1);
    prefix.extend_from_slice(namespace.as_bytes());
    prefix.push(0);
    prefix
}

fn encode_row(pref_type: PrefType, value: &str) -> Vec<u8> {
    let mut row = Vec::with_capacity(1 + value.len());
    row.push(pref_type.to_u8());
    row.extend_from_slice(value.as_bytes());
    row
}

fn decode_row(row: &[u8]) -> Result<(PrefType, String), StorageError> {
    let (&tag, wire) = row
        .split_first()
        .ok_or_else(|| StorageError::CorruptEntry("empty row".to_string()))?;
    let pref_type = PrefType::from_u8(tag)
        .ok_or_else(|| StorageError::CorruptEntry(format!("unknown type tag {tag}")))?;
    let value = std::str::from_utf8(wire)
        .map_err(|e| StorageError::CorruptEntry(e.to_string()))?
        .to_string();
    Ok((pref_type, value))
}

impl RocksStorage {
    fn row_key(&self, key: &str) -> Vec<u8> {
        let mut row_key = self.prefix.clone();
        row_key.extend_from_slice(key.as_bytes());
        row_key
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

impl PrefStorage for RocksStorage {
    fn get(&self, key: &str) -> Result<Option<(PrefType, String)>, StorageError> {
        match self.db.get(self.row_key(key)) {
            Ok(Some(row)) => decode_row(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::DatabaseError(e.to_string())),
        }
    }

    fn put(&mut self, key: &str, pref_type: PrefType, value: &str) -> Result<(), StorageError> {
        self.db
            .put_opt(self.row_key(key), encode_row(pref_type, value), &self.write_opts())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<bool, StorageError> {
        let row_key = self.row_key(key);
        let existed = self
            .db
            .get(&row_key)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?
            .is_some();
        self.db
            .delete_opt(&row_key, &self.write_opts())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(existed)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for item in self
            .db
            .iterator(IteratorMode::From(&self.prefix, Direction::Forward))
        {
            let (row_key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            if !row_key.starts_with(&self.prefix) {
                break;
            }
            batch.delete(row_key);
        }
        self.db
            .write_opt(batch, &self.write_opts())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    fn enumerate(&self) -> Result<Vec<(String, PrefType, String)>, StorageError> {
        let mut rows = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&self.prefix, Direction::Forward))
        {
            let (row_key, row) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            if !row_key.starts_with(&self.prefix) {
                break;
            }
            let key = std::str::from_utf8(&row_key[self.prefix.len()..])
                .map_err(|e| StorageError::CorruptEntry(e.to_string()))?
                .to_string();
            let (pref_type, value) = decode_row(&row)?;
            rows.push((key, pref_type, value));
        }
        Ok(rows)
    }
}
