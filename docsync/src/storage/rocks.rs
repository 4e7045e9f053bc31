//! RocksDB-backed durable document store.
//!
//! Column families:
//! - `documents`: room state snapshots (LZ4 compressed, keyed by room id)
//! - `metadata`: `SnapshotMetadata` (bincode, keyed by room id)
//!
//! A document exists once its metadata row exists; the snapshot row appears
//! with the first compaction.
//!
//! RocksDB calls block. The `DocumentStorage` impl runs each one on tokio's
//! blocking pool so snapshot reads and writes never stall the async workers
//! that relay updates.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DocumentStorage, SnapshotMetadata, StorageError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// RocksDB-backed document store. Clones share the same database.
#[derive(Clone)]
pub struct RocksDocumentStore {
    /// RocksDB instance (single-threaded CF mode, tokio provides concurrency)
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
}

impl RocksDocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
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
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_DOCUMENTS => {
                // Values are LZ4 compressed before they reach RocksDB
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

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a snapshot (LZ4 compressed) for an existing document.
    pub fn put_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .metadata(room_id)?
            .ok_or_else(|| StorageError::NotFound(room_id.to_string()))?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        meta.touch(snapshot.len(), compressed.len());

        // Snapshot and metadata land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, room_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a snapshot (LZ4 decompressed).
    pub fn get_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StorageError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load document metadata.
    pub fn metadata(&self, room_id: &str) -> Result<Option<SnapshotMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Register a document. Existing documents keep their metadata.
    pub fn register(&self, room_id: &str) -> Result<SnapshotMetadata, StorageError> {
        if let Some(meta) = self.metadata(room_id)? {
            return Ok(meta);
        }
        let cf = self.cf(CF_METADATA)?;
        let meta = SnapshotMetadata::new(room_id);
        self.db.put_cf(&cf, room_id.as_bytes(), meta.encode()?)?;
        Ok(meta)
    }

    /// Delete a document's snapshot and metadata.
    pub fn remove(&self, room_id: &str) -> Result<(), StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, room_id.as_bytes());
        batch.delete_cf(&cf_meta, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    /// Run `op` against this store on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&RocksDocumentStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StorageError::Database(format!("storage task failed: {e}")))?
    }
}

#[async_trait]
impl DocumentStorage for RocksDocumentStore {
    async fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let room_id = room_id.to_string();
        self.blocking(move |store| store.get_snapshot(&room_id)).await
    }

    async fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StorageError> {
        let room_id = room_id.to_string();
        let snapshot = snapshot.to_vec();
        self.blocking(move |store| store.put_snapshot(&room_id, &snapshot))
            .await
    }

    async fn document_exists(&self, room_id: &str) -> Result<bool, StorageError> {
        let room_id = room_id.to_string();
        self.blocking(move |store| Ok(store.metadata(&room_id)?.is_some()))
            .await
    }

    async fn create_document(&self, room_id: &str) -> Result<SnapshotMetadata, StorageError> {
        let room_id = room_id.to_string();
        self.blocking(move |store| store.register(&room_id)).await
    }

    async fn delete_document(&self, room_id: &str) -> Result<(), StorageError> {
        let room_id = room_id.to_string();
        self.blocking(move |store| store.remove(&room_id)).await
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksDocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_snapshot_requires_document() {
        let (_dir, store) = open_temp();
        let err = store.put_snapshot("missing", b"data").unwrap_err();
        assert_eq!(err, StorageError::NotFound("missing".into()));
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        store.register("room-a").unwrap();
        assert_eq!(store.get_snapshot("room-a").unwrap(), None);

        let data = b"Hello, docsync! This is a snapshot with enough data to compress.".to_vec();
        let meta = store.put_snapshot("room-a", &data).unwrap();
        assert_eq!(meta.room_id, "room-a");
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.get_snapshot("room-a").unwrap(), Some(data));
    }

    #[test]
    fn test_register_is_idempotent() {
        let (_dir, store) = open_temp();
        store.register("room-a").unwrap();
        store.put_snapshot("room-a", b"v1").unwrap();

        let meta = store.register("room-a").unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(store.get_snapshot("room-a").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_version_increments() {
        let (_dir, store) = open_temp();
        store.register("room-a").unwrap();
        store.put_snapshot("room-a", b"v1").unwrap();
        let meta = store.put_snapshot("room-a", b"v2").unwrap();
        assert_eq!(meta.version, 2);
        assert!(meta.updated_at >= meta.created_at);
        assert_eq!(store.metadata("room-a").unwrap(), Some(meta));
    }

    #[test]
    fn test_remove_leaves_other_documents() {
        let (_dir, store) = open_temp();
        for id in ["a", "b", "c"] {
            store.register(id).unwrap();
        }
        store.put_snapshot("b", b"data").unwrap();

        store.remove("b").unwrap();
        assert_eq!(store.metadata("b").unwrap(), None);
        assert_eq!(store.get_snapshot("b").unwrap(), None);
        assert!(store.metadata("a").unwrap().is_some());
        assert!(store.metadata("c").unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksDocumentStore::open(config.clone()).unwrap();
            store.register("durable").unwrap();
            store.put_snapshot("durable", &[7u8; 4096]).unwrap();
            store.sync().unwrap();
        }
        let store = RocksDocumentStore::open(config).unwrap();
        assert_eq!(store.get_snapshot("durable").unwrap(), Some(vec![7u8; 4096]));
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        store.register("large").unwrap();
        let data = vec![42u8; 1_000_000];

        let meta = store.put_snapshot("large", &data).unwrap();
        assert_eq!(meta.snapshot_size, 1_000_000);
        // Uniform data compresses extremely well
        assert!(meta.compressed_size < 100_000);
        assert_eq!(store.get_snapshot("large").unwrap().map(|d| d.len()), Some(1_000_000));
    }

    #[tokio::test]
    async fn test_document_storage_trait() {
        let (_dir, store) = open_temp();
        let storage: &dyn DocumentStorage = &store;

        assert!(!storage.document_exists("doc").await.unwrap());
        storage.create_document("doc").await.unwrap();
        assert!(storage.document_exists("doc").await.unwrap());

        storage.save_snapshot("doc", b"state").await.unwrap();
        assert_eq!(storage.load_snapshot("doc").await.unwrap(), Some(b"state".to_vec()));
        // Blocking-pool writes land in the shared database
        assert_eq!(store.clone().get_snapshot("doc").unwrap(), Some(b"state".to_vec()));

        storage.delete_document("doc").await.unwrap();
        assert!(!storage.document_exists("doc").await.unwrap());
    }
}
