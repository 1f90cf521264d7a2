//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: full document state (encoded delta), LZ4 compressed
//! - `metadata`: per-document bookkeeping (bincode)
//!
//! Both are keyed by the 16 raw bytes of the document UUID and written in
//! one batch, so a reader never sees a snapshot without its metadata.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use super::{PersistenceError, PersistenceStore};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Number of snapshots written so far
    pub save_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            snapshot_size: 0,
            compressed_size: 0,
            save_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DatabaseError(String),
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DatabaseError(msg) => PersistenceError::Database(msg),
            StoreError::CompressionError(msg) | StoreError::DeserializationError(msg) => {
                PersistenceError::Corrupt(msg)
            }
            other => PersistenceError::Database(other.to_string()),
        }
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
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
            CF_DOCUMENTS => {
                // Values are already LZ4 frames.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Replace the snapshot of `doc_id`, updating its metadata in the same batch.
    pub fn save_snapshot(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.save_count += 1;
        meta.updated_at = unix_now();

        let key = doc_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot for {doc_id}: {} -> {} bytes",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Decompressed snapshot, or `NotFound`.
    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl PersistenceStore for DocumentStore {
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, PersistenceError> {
        match self.load_snapshot(doc_id) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, doc_id: Uuid, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.save_snapshot(doc_id, bytes)?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let snapshot = b"hello hello hello hello".repeat(20);

        let meta = store.save_snapshot(doc_id, &snapshot).unwrap();
        assert_eq!(meta.snapshot_size, snapshot.len() as u64);
        assert!(meta.compressed_size < meta.snapshot_size);
        assert_eq!(store.load_snapshot(doc_id).unwrap(), snapshot);
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        assert_eq!(store.load_snapshot(doc_id), Err(StoreError::NotFound(doc_id)));
    }

    #[test]
    fn test_save_count_and_created_at_kept() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        let first = store.save_snapshot(doc_id, b"one").unwrap();
        let second = store.save_snapshot(doc_id, b"two!").unwrap();

        assert_eq!(first.save_count, 1);
        assert_eq!(second.save_count, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.load_metadata(doc_id).unwrap(), second);
        assert_eq!(store.load_snapshot(doc_id).unwrap(), b"two!");
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let doc_id = Uuid::new_v4();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_snapshot(doc_id, b"durable").unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_snapshot(doc_id).unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_trait_load_absent_is_none() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_trait_roundtrip() {
        let (_dir, store) = open_temp();
        let doc_id = Uuid::new_v4();
        store.save(doc_id, &[9, 8, 7]).await.unwrap();
        assert_eq!(store.load(doc_id).await.unwrap(), Some(vec![9, 8, 7]));
    }

    #[test]
    fn test_store_error_maps_to_persistence_error() {
        let e: PersistenceError = StoreError::CompressionError("bad frame".into()).into();
        assert!(matches!(e, PersistenceError::Corrupt(_)));
        let e: PersistenceError = StoreError::DatabaseError("io".into()).into();
        assert!(matches!(e, PersistenceError::Database(_)));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("quill_data"));
        assert!(config.sync_writes);
    }
}
