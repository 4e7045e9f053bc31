//! Snapshot compaction: moves cached room state into durable storage.
//!
//! Merges only touch the local and shared tiers and bump a per-room dirty
//! generation. A flush reads the cached state, folds it into the durable
//! snapshot and saves the result, retrying transient storage failures with
//! exponential backoff. The dirty mark is cleared only if no update arrived
//! while the flush was running. Logged updates up to the sequence observed
//! before the state was read are folded into the saved state, and only then
//! trimmed from the log.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::merge::MergeError;
use crate::storage::{SnapshotMetadata, StateStore, StorageError};

/// Compaction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompactError {
    /// Document removed from storage; the room's dirty mark was dropped
    #[error("document {0} no longer exists")]
    DocumentGone(String),
    #[error("storage error after {attempts} attempt(s): {source}")]
    Storage {
        attempts: u32,
        #[source]
        source: StorageError,
    },
    /// Durable snapshot and cached state could not be combined
    #[error("snapshot merge failed: {0}")]
    Merge(#[from] MergeError),
}

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending
    Clean,
    /// Snapshot written
    Flushed { version: u64, bytes: usize },
}

enum AttemptError {
    Storage(StorageError),
    Merge(MergeError),
}

impl From<StorageError> for AttemptError {
    fn from(e: StorageError) -> Self {
        AttemptError::Storage(e)
    }
}

impl From<MergeError> for AttemptError {
    fn from(e: MergeError) -> Self {
        AttemptError::Merge(e)
    }
}

/// Flushes dirty rooms to durable storage.
pub struct SnapshotCompactor {
    store: Arc<StateStore>,
    retry: RetryPolicy,
    /// room id → generation of the latest unflushed update
    dirty: DashMap<String, u64>,
    next_generation: AtomicU64,
    /// Serializes flushes (and imports) per room
    flush_locks: DashMap<String, Arc<Mutex<()>>>,
    flushes: AtomicU64,
    failures: AtomicU64,
}

impl SnapshotCompactor {
    pub fn new(store: Arc<StateStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            dirty: DashMap::new(),
            next_generation: AtomicU64::new(1),
            flush_locks: DashMap::new(),
            flushes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Record that the room's cached state is ahead of its snapshot.
    pub fn mark_dirty(&self, room_id: &str) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.dirty.insert(room_id.to_string(), generation);
    }

    pub fn is_dirty(&self, room_id: &str) -> bool {
        self.dirty.contains_key(room_id)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn dirty_rooms(&self) -> Vec<String> {
        self.dirty.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshots written so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Flushes that gave up.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn flush_lock(&self, room_id: &str) -> Arc<Mutex<()>> {
        self.flush_locks
            .entry(room_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop per-room bookkeeping of a clean room nobody is flushing.
    pub fn release(&self, room_id: &str) {
        if self.is_dirty(room_id) {
            return;
        }
        self.flush_locks
            .remove_if(room_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Delete the room's durable document together with its update log and
    /// unflushed state. Returns whether unflushed state was dropped.
    ///
    /// Runs under the room's flush lock, so no flush in progress can save a
    /// snapshot after the document is gone.
    pub async fn delete_document(&self, room_id: &str) -> Result<bool, StorageError> {
        let lock = self.flush_lock(room_id);
        let _flushing = lock.lock().await;

        self.store.durable().delete_document(room_id).await?;
        let discarded = self.dirty.remove(room_id).is_some();
        if let Err(e) = self.store.purge_log(room_id).await {
            log::warn!("Update log of deleted room {room_id} not purged: {e}");
        }
        Ok(discarded)
    }

    /// Write the room's cached state through to durable storage.
    ///
    /// Safe to call redundantly; a clean room returns `FlushOutcome::Clean`.
    pub async fn flush(&self, room_id: &str) -> Result<FlushOutcome, CompactError> {
        let lock = self.flush_lock(room_id);
        let _flushing = lock.lock().await;

        let Some(generation) = self.dirty.get(room_id).map(|g| *g.value()) else {
            return Ok(FlushOutcome::Clean);
        };
        let log_head = self.store.last_logged(room_id).await;
        let cached = self.store.get(room_id).await;
        // The cached state may predate logged updates (rebuilt while a tier
        // was down). Only entries folded in here may be trimmed afterwards.
        let (state, trim_to) = match log_head {
            Some(head) => match self.store.fold_log(room_id, cached.clone(), head).await {
                Ok((folded, _)) => (folded, Some(head)),
                Err(e) => {
                    log::warn!("Update log of room {room_id} unreadable, flushing without trim: {e}");
                    (cached.clone(), None)
                }
            },
            None => (cached.clone(), None),
        };
        if state.is_empty() {
            self.dirty.remove_if(room_id, |_, g| *g == generation);
            return Ok(FlushOutcome::Clean);
        }

        let result = self.save_with_retry(room_id, &state).await;
        let (meta, snapshot) = match result {
            Ok(saved) => saved,
            Err(CompactError::DocumentGone(room)) => {
                log::warn!("Document {room} was deleted, dropping unflushed state");
                self.dirty.remove_if(room_id, |_, g| *g == generation);
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(CompactError::DocumentGone(room));
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let cleared = self
            .dirty
            .remove_if(room_id, |_, g| *g == generation)
            .is_some();
        if let Some(sequence) = trim_to {
            self.store.trim_log(room_id, sequence).await;
        }
        if snapshot != cached && self.store.refresh_local(room_id, &cached, snapshot.clone()).await {
            log::debug!("Cached state of room {room_id} caught up with its snapshot");
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Flushed room {room_id}: version {}, {} bytes{}",
            meta.version,
            snapshot.len(),
            if cleared { "" } else { " (newer updates pending)" }
        );
        Ok(FlushOutcome::Flushed {
            version: meta.version,
            bytes: snapshot.len(),
        })
    }

    async fn save_with_retry(
        &self,
        room_id: &str,
        state: &[u8],
    ) -> Result<(SnapshotMetadata, Vec<u8>), CompactError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(self.retry.timeout, self.write_through(room_id, state))
                .await
                .unwrap_or(Err(AttemptError::Storage(StorageError::Timeout)));

            let error = match result {
                Ok(saved) => return Ok(saved),
                Err(AttemptError::Merge(e)) => return Err(CompactError::Merge(e)),
                Err(AttemptError::Storage(StorageError::NotFound(_))) => {
                    return Err(CompactError::DocumentGone(room_id.to_string()))
                }
                Err(AttemptError::Storage(e)) => e,
            };

            if !error.is_transient() || attempt >= self.retry.max_attempts {
                log::error!("Flush of room {room_id} failed after {attempt} attempt(s): {error}");
                return Err(CompactError::Storage {
                    attempts: attempt,
                    source: error,
                });
            }
            let delay = self.retry.backoff(attempt);
            log::warn!("Flush of room {room_id} failed (attempt {attempt}), retrying in {delay:?}: {error}");
            tokio::time::sleep(delay).await;
        }
    }

    /// Load, combine and save. One attempt.
    async fn write_through(
        &self,
        room_id: &str,
        state: &[u8],
    ) -> Result<(SnapshotMetadata, Vec<u8>), AttemptError> {
        let durable = self.store.durable();
        let snapshot = match durable.load_snapshot(room_id).await? {
            Some(existing) if !existing.is_empty() && existing != state => {
                self.store.merge_engine().combine(&existing, state)?
            }
            _ => state.to_vec(),
        };
        let meta = durable.save_snapshot(room_id, &snapshot).await?;
        Ok((meta, snapshot))
    }

    /// Flush every dirty room. Returns how many snapshots were written.
    pub async fn flush_dirty(&self) -> usize {
        let mut flushed = 0;
        for room_id in self.dirty_rooms() {
            match self.flush(&room_id).await {
                Ok(FlushOutcome::Flushed { .. }) => flushed += 1,
                Ok(FlushOutcome::Clean) => {}
                Err(e) => log::warn!("Background flush of room {room_id} failed: {e}"),
            }
        }
        flushed
    }

    /// Replace a room's durable snapshot and cached state with `snapshot`,
    /// discarding unflushed updates.
    pub async fn import(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StorageError> {
        let lock = self.flush_lock(room_id);
        let _flushing = lock.lock().await;

        let log_head = self.store.last_logged(room_id).await;
        let meta = self.store.durable().save_snapshot(room_id, snapshot).await?;
        self.store.set(room_id, snapshot.to_vec()).await;
        self.dirty.remove(room_id);
        if let Some(sequence) = log_head {
            self.store.trim_log(room_id, sequence).await;
        }
        Ok(meta)
    }
}
