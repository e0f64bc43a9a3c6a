//! RocksDB-backed [`DurableStore`] (feature `rocks`).
//!
//! Column families, chosen by the first segment of the key:
//! - `queue`    — offline and batch queue snapshots, conflict records
//! - `versions` — per-document version ledgers (JSON)
//! - `fallback` — local fallback records for failed saves
//! - `backup`   — emergency backups of evicted / exhausted items
//! - `default`  — anything else
//!
//! Keys are stored whole inside their family, so prefix scans stay a
//! single forward iteration.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use log::debug;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::PathBuf;

use super::{DurableStore, StoreError};

const CF_QUEUE: &str = "queue";
const CF_VERSIONS: &str = "versions";
const CF_FALLBACK: &str = "fallback";
const CF_BACKUP: &str = "backup";
const CF_DEFAULT: &str = "default";

const COLUMN_FAMILIES: &[&str] = &[CF_QUEUE, CF_VERSIONS, CF_FALLBACK, CF_BACKUP];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        debug!("opened durable store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Payloads are already compressed by the codec.
            CF_FALLBACK | CF_BACKUP => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_QUEUE => {
                // Whole-queue snapshots, rewritten often
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    fn family_for(key: &str) -> &'static str {
        let segment = key.split('/').next().unwrap_or_default();
        COLUMN_FAMILIES
            .iter()
            .copied()
            .find(|cf| *cf == segment)
            .unwrap_or(CF_DEFAULT)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, key: &str) -> Result<Option<&rocksdb::ColumnFamily>, StoreError> {
        let name = Self::family_for(key);
        if name == CF_DEFAULT {
            return Ok(None);
        }
        self.db
            .cf_handle(name)
            .map(Some)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' missing")))
    }
}

impl DurableStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(match self.cf(key)? {
            Some(cf) => self.db.get_cf(cf, key.as_bytes())?,
            None => self.db.get(key.as_bytes())?,
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let opts = self.write_opts();
        match self.cf(key)? {
            Some(cf) => self.db.put_cf_opt(cf, key.as_bytes(), value, &opts)?,
            None => self.db.put_opt(key.as_bytes(), value, &opts)?,
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let opts = self.write_opts();
        match self.cf(key)? {
            Some(cf) => self.db.delete_cf_opt(cf, key.as_bytes(), &opts)?,
            None => self.db.delete_opt(key.as_bytes(), &opts)?,
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        let iter = match self.cf(prefix)? {
            Some(cf) => self.db.iterator_cf(cf, mode),
            None => self.db.iterator(mode),
        };

        let mut keys = Vec::new();
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_across_families() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        for key in ["queue/offline", "versions/abc", "fallback/abc", "backup/1", "misc"] {
            store.set(key, key.as_bytes()).unwrap();
        }
        for key in ["queue/offline", "versions/abc", "fallback/abc", "backup/1", "misc"] {
            assert_eq!(store.get(key).unwrap(), Some(key.as_bytes().to_vec()));
        }

        store.delete("backup/1").unwrap();
        assert_eq!(store.get("backup/1").unwrap(), None);
    }

    #[test]
    fn test_prefix_scan() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.set("backup/b", b"").unwrap();
        store.set("backup/a", b"").unwrap();
        store.set("fallback/a", b"").unwrap();

        assert_eq!(
            store.keys_with_prefix("backup/").unwrap(),
            vec!["backup/a".to_string(), "backup/b".to_string()]
        );
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.set("fallback/doc", b"payload").unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get("fallback/doc").unwrap(), Some(b"payload".to_vec()));
    }
}
