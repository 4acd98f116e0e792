//! # RocksDB Storage Adapter
//!
//! Production `KeyValueStore` backend. The atomicity the stores build on
//! maps directly onto `rocksdb::WriteBatch`: one batch per `apply_update`,
//! committed through a single `write_opt` call.
//!
//! Each store subsystem opens its own database directory; their key
//! prefixes are disjoint, so simple deployments may also point both at
//! one directory.

use std::path::Path;

use ln_01_header_chain::ports::outbound::{BatchOperation, KeyValueStore};
use ln_01_header_chain::KVStoreError;
use rocksdb::{BlockBasedOptions, Cache, DBCompressionType, IteratorMode, Options, WriteBatch, DB};
use tracing::info;

/// Tunables for one database directory.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Database directory.
    pub path: String,
    /// LRU block cache size in bytes.
    pub block_cache_size: usize,
    /// Memtable size in bytes.
    pub write_buffer_size: usize,
    /// Memtables kept before flushing stalls writes.
    pub max_write_buffer_number: i32,
    /// fsync every write. Costs latency, survives power loss.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "./data/rocksdb".to_string(),
            block_cache_size: 256 * 1024 * 1024,
            write_buffer_size: 64 * 1024 * 1024,
            max_write_buffer_number: 3,
            sync_writes: true,
        }
    }
}

impl RocksDbConfig {
    /// Production defaults rooted at `path`.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    /// Small buffers, no fsync. For tests only.
    pub fn for_testing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 2,
            sync_writes: false,
        }
    }
}

/// An open RocksDB database implementing the stores' KV contract.
pub struct RocksDbStore {
    db: DB,
    config: RocksDbConfig,
}

impl RocksDbStore {
    /// Open `config.path`, creating the database when absent.
    pub fn open(config: RocksDbConfig) -> Result<Self, KVStoreError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_write_buffer_size(config.write_buffer_size);
        options.set_max_write_buffer_number(config.max_write_buffer_number);
        options.set_compression_type(DBCompressionType::Snappy);

        // Point lookups dominate (header/record/filter by hash); a bloom
        // filter spares most of them a disk touch.
        let mut table_options = BlockBasedOptions::default();
        table_options.set_bloom_filter(10.0, false);
        table_options.set_block_cache(&Cache::new_lru_cache(config.block_cache_size));
        options.set_block_based_table_factory(&table_options);

        let db = DB::open(&options, &config.path).map_err(|e| KVStoreError::Io {
            message: format!("opening RocksDB at {}: {e}", config.path),
        })?;
        info!(path = %config.path, "RocksDB opened");
        Ok(Self { db, config })
    }

    fn write_options(&self) -> rocksdb::WriteOptions {
        let mut write_options = rocksdb::WriteOptions::default();
        write_options.set_sync(self.config.sync_writes);
        write_options
    }
}

fn io_error(context: &str, err: rocksdb::Error) -> KVStoreError {
    KVStoreError::Io {
        message: format!("RocksDB {context}: {err}"),
    }
}

impl KeyValueStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        self.db.get(key).map_err(|e| io_error("get", e))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
        self.db
            .put_opt(key, value, &self.write_options())
            .map_err(|e| io_error("put", e))
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KVStoreError> {
        self.db
            .delete_opt(key, &self.write_options())
            .map_err(|e| io_error("delete", e))
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        let mut batch = WriteBatch::default();
        for operation in operations {
            match operation {
                BatchOperation::Put { key, value } => batch.put(&key, &value),
                BatchOperation::Delete { key } => batch.delete(&key),
            }
        }
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| io_error("batch write", e))
    }

    fn exists(&self, key: &[u8]) -> Result<bool, KVStoreError> {
        self.db
            .get_pinned(key)
            .map(|value| value.is_some())
            .map_err(|e| io_error("exists", e))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| io_error("scan", e))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }
}
