//! Storage tiers for room state.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   get / set    ┌──────────────────────────────────────┐
//! │ Broadcaster │ ─────────────► │ StateStore                           │
//! │ Compactor   │                │                                      │
//! └─────────────┘                │  1. local   DashMap (per process)    │
//!                                │  2. shared  SharedCache (TTL)        │
//!                                │  3. durable DocumentStorage          │
//!                                └──────────────────────────────────────┘
//!                                         │                 │
//!                                         ▼                 ▼
//!                              ┌────────────────┐  ┌───────────────────┐
//!                              │ update log     │  │ RocksDB           │
//!                              │ (shared cache) │  │  CF documents     │
//!                              └────────────────┘  │  CF metadata      │
//!                                                  └───────────────────┘
//! ```
//!
//! Reads fall through the tiers and populate the faster ones on the way
//! back. Writes land in the local and shared tiers only; the compactor owns
//! durable writes.

pub mod memory;
pub mod rocks;
pub mod shared;
pub mod tiered;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub use memory::MemoryDocumentStore;
pub use rocks::{RocksDocumentStore, StoreConfig};
pub use shared::{CacheError, LogEntry, MemorySharedCache, SharedCache};
pub use tiered::{StateStore, Tier};

/// Durable storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// No document with this room id
    #[error("document not found: {0}")]
    NotFound(String),
    /// Backend unreachable or refusing requests
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Call exceeded its deadline
    #[error("storage call timed out")]
    Timeout,
    /// Backend internal error
    #[error("database error: {0}")]
    Database(String),
    /// Snapshot (de)compression failed
    #[error("compression error: {0}")]
    Compression(String),
    /// Metadata (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::Timeout | StorageError::Database(_)
        )
    }
}

/// Metadata stored alongside every durable snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Room id of the document
    pub room_id: String,
    /// Incremented on every snapshot save
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes (equal to `snapshot_size` for
    /// uncompressed backends)
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last snapshot timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl SnapshotMetadata {
    /// Metadata for a freshly created document without a snapshot.
    pub fn new(room_id: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            room_id: room_id.into(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a snapshot save.
    pub fn touch(&mut self, snapshot_size: usize, compressed_size: usize) {
        self.version += 1;
        self.snapshot_size = snapshot_size as u64;
        self.compressed_size = compressed_size as u64;
        self.updated_at = unix_now();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The external document-storage collaborator.
///
/// Documents exist only after `create_document`; snapshots can only be saved
/// for existing documents.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Durable snapshot of a room, `None` if the document has none yet.
    async fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the durable snapshot of an existing document.
    async fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StorageError>;

    /// Whether a document with this room id exists.
    async fn document_exists(&self, room_id: &str) -> Result<bool, StorageError>;

    /// Register a new document. Creating an existing document is a no-op.
    async fn create_document(&self, room_id: &str) -> Result<SnapshotMetadata, StorageError>;

    /// Remove a document and its snapshot.
    async fn delete_document(&self, room_id: &str) -> Result<(), StorageError>;
}
