//! In-memory document store.
//!
//! Used when no storage path is configured and as the durable tier in tests.
//! Snapshots are kept uncompressed.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DocumentStorage, SnapshotMetadata, StorageError};

struct StoredDocument {
    meta: SnapshotMetadata,
    snapshot: Option<Vec<u8>>,
}

/// Process-local `DocumentStorage`.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, StoredDocument>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Metadata of a document, if registered.
    pub fn metadata(&self, room_id: &str) -> Option<SnapshotMetadata> {
        self.documents.get(room_id).map(|d| d.meta.clone())
    }
}

#[async_trait]
impl DocumentStorage for MemoryDocumentStore {
    async fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .documents
            .get(room_id)
            .and_then(|d| d.snapshot.clone()))
    }

    async fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StorageError> {
        let mut doc = self
            .documents
            .get_mut(room_id)
            .ok_or_else(|| StorageError::NotFound(room_id.to_string()))?;
        doc.meta.touch(snapshot.len(), snapshot.len());
        doc.snapshot = Some(snapshot.to_vec());
        Ok(doc.meta.clone())
    }

    async fn document_exists(&self, room_id: &str) -> Result<bool, StorageError> {
        Ok(self.documents.contains_key(room_id))
    }

    async fn create_document(&self, room_id: &str) -> Result<SnapshotMetadata, StorageError> {
        let doc = self
            .documents
            .entry(room_id.to_string())
            .or_insert_with(|| StoredDocument {
                meta: SnapshotMetadata::new(room_id),
                snapshot: None,
            });
        Ok(doc.meta.clone())
    }

    async fn delete_document(&self, room_id: &str) -> Result<(), StorageError> {
        self.documents.remove(room_id);
        Ok(())
    }
}
