//! Composition root of the sync subsystem.
//!
//! `SyncHub` owns the room registry, the tiered state store, the broadcaster
//! and the compactor, and exposes the operations the connection tasks and
//! operators need. One hub serves every room of a process.
//!
//! ```text
//!             join / leave / handle_update
//! sessions ─────────────────────────────────► SyncHub
//!                                               │
//!        ┌──────────────┬───────────────────────┼─────────────────┐
//!        ▼              ▼                       ▼                 ▼
//!  RoomRegistry   UpdateBroadcaster        StateStore     SnapshotCompactor
//!  (room guards)  (merge + fan-out)   (local/shared/durable)  (flush + retry)
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{Delivery, UpdateBroadcaster, UpdateError};
use crate::compactor::{CompactError, FlushOutcome, SnapshotCompactor};
use crate::config::ServerConfig;
use crate::merge::engine_for;
use crate::protocol::{is_valid_room_id, CloseReason};
use crate::registry::RoomRegistry;
use crate::session::{SessionHandle, SessionId};
use crate::storage::{
    DocumentStorage, MemoryDocumentStore, MemorySharedCache, SharedCache, SnapshotMetadata,
    StateStore, StorageError,
};

/// Errors of the operational API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),
    #[error("snapshot must not be empty")]
    EmptySnapshot,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Point-in-time counters. Observational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Rooms in the registry
    pub rooms: usize,
    /// Connected sessions across all rooms
    pub sessions: usize,
    /// Rooms held in the local state tier
    pub cached_rooms: usize,
    /// Rooms with state not yet in durable storage
    pub dirty_rooms: usize,
    pub updates_merged: u64,
    pub updates_rejected: u64,
    pub frames_delivered: u64,
    /// Sessions removed after a failed delivery
    pub sessions_evicted: u64,
    pub snapshots_flushed: u64,
    pub flush_failures: u64,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub flushed: usize,
    pub rooms_evicted: usize,
    pub cache_entries_released: usize,
}

/// Shared state of the sync subsystem.
pub struct SyncHub {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    store: Arc<StateStore>,
    compactor: Arc<SnapshotCompactor>,
    broadcaster: UpdateBroadcaster,
}

impl SyncHub {
    /// Hub over the given shared cache and durable storage.
    pub fn new(
        config: ServerConfig,
        shared: Arc<dyn SharedCache>,
        durable: Arc<dyn DocumentStorage>,
    ) -> Self {
        let merge = engine_for(config.merge);
        log::info!("Using {} merge engine", merge.name());

        let store = Arc::new(StateStore::new(shared, durable, merge, config.state_ttl));
        let registry = Arc::new(RoomRegistry::new());
        let compactor = Arc::new(SnapshotCompactor::new(store.clone(), config.retry.clone()));
        let broadcaster = UpdateBroadcaster::new(
            registry.clone(),
            store.clone(),
            compactor.clone(),
            config.max_update_bytes,
        );

        Self {
            config,
            registry,
            store,
            compactor,
            broadcaster,
        }
    }

    /// Hub with in-process cache and document store.
    pub fn in_memory(config: ServerConfig) -> Self {
        let shared = Arc::new(MemorySharedCache::new(config.log_retention.clone()));
        Self::new(config, shared, Arc::new(MemoryDocumentStore::new()))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    pub fn compactor(&self) -> &SnapshotCompactor {
        &self.compactor
    }

    // --- Sessions ---

    /// Register a session. The room's current state is queued as the
    /// session's first frame under the room guard, so the session sees
    /// exactly the updates merged before it and every update after.
    pub async fn join(&self, room_id: &str, handle: SessionHandle) -> Result<(), CloseReason> {
        match self.broadcaster.room_exists(room_id).await {
            Ok(true) => {}
            Ok(false) => return Err(CloseReason::UnknownRoom),
            Err(e) => log::warn!(
                "Existence check for room {room_id} failed, admitting session in degraded mode: {e}"
            ),
        }

        let mut room = self.registry.lock(room_id).await;
        let state = self.store.get(room_id).await;
        if !state.is_empty() {
            if let Err(e) = handle.try_deliver(Arc::new(state)) {
                log::error!("Initial state for room {room_id} not queued: {e}");
                return Err(CloseReason::InternalError);
            }
        }
        room.join(handle);
        log::debug!("Room {room_id} now has {} session(s)", room.len());
        Ok(())
    }

    /// Merge an update from `from` and relay it to the room.
    pub async fn handle_update(
        &self,
        room_id: &str,
        from: &SessionId,
        payload: &[u8],
    ) -> Result<Delivery, UpdateError> {
        self.broadcaster.handle_update(room_id, from, payload).await
    }

    /// Remove a session. When the room becomes empty its state is flushed
    /// and the room is released.
    pub async fn leave(&self, room_id: &str, session_id: &SessionId) {
        if !self.registry.leave(room_id, session_id).await {
            return;
        }
        log::info!("Room {room_id} is empty, flushing");
        if let Err(e) = self.compactor.flush(room_id).await {
            log::warn!("Flush of empty room {room_id} failed, keeping it cached: {e}");
        }
        self.release_if_idle(room_id).await;
    }

    /// Evict an empty room from the registry and, if its state is durable,
    /// from the local cache.
    async fn release_if_idle(&self, room_id: &str) -> bool {
        if !self.registry.try_evict(room_id).await {
            return false;
        }
        let uncached = self.store.evict_local_if(room_id, || {
            !self.registry.contains(room_id) && !self.compactor.is_dirty(room_id)
        });
        self.compactor.release(room_id);
        log::debug!(
            "Room {room_id} released{}",
            if uncached { " and uncached" } else { "" }
        );
        true
    }

    pub async fn session_count(&self, room_id: &str) -> usize {
        self.registry.session_count(room_id).await
    }

    // --- Operational API ---

    /// Create a room with a generated id.
    pub async fn create_room(&self) -> Result<String, HubError> {
        let room_id = format!("doc_{}", Uuid::new_v4().simple());
        self.create_room_with_id(&room_id).await?;
        Ok(room_id)
    }

    /// Create (or confirm) the document backing `room_id`.
    pub async fn create_room_with_id(&self, room_id: &str) -> Result<SnapshotMetadata, HubError> {
        if !is_valid_room_id(room_id) {
            return Err(HubError::InvalidRoomId(room_id.to_string()));
        }
        let meta = self.store.durable().create_document(room_id).await?;
        self.broadcaster.mark_known(room_id);
        log::info!("Room {room_id} created");
        Ok(meta)
    }

    /// Current state of a room, as a joining client would receive it.
    pub async fn document_state(&self, room_id: &str) -> Vec<u8> {
        self.store.get(room_id).await
    }

    /// Replace a room's state with an explicit snapshot.
    pub async fn import_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, HubError> {
        if snapshot.is_empty() {
            return Err(HubError::EmptySnapshot);
        }
        // Hold the room guard so no update interleaves with the swap
        let _room = self.registry.lock(room_id).await;
        let meta = self.compactor.import(room_id, snapshot).await?;
        self.broadcaster.mark_known(room_id);
        log::info!(
            "Imported snapshot of {} bytes into room {room_id} (version {})",
            snapshot.len(),
            meta.version
        );
        Ok(meta)
    }

    /// Drop a room's local and shared cache entries.
    pub async fn clear_cache(&self, room_id: &str) {
        self.store.invalidate(room_id).await;
        log::debug!("Cleared cache for room {room_id}");
    }

    /// Delete a room's document, cached state and update log, and close its
    /// sessions with 1008.
    pub async fn delete_room(&self, room_id: &str) -> Result<(), HubError> {
        let mut room = self.registry.lock(room_id).await;
        let discarded = self.compactor.delete_document(room_id).await?;
        self.broadcaster.forget(room_id);
        self.store.invalidate(room_id).await;

        let sessions = room.targets(None);
        for session in &sessions {
            room.leave(&session.id());
            session.kick(CloseReason::UnknownRoom);
        }
        drop(room);
        self.release_if_idle(room_id).await;
        log::info!(
            "Room {room_id} deleted, {} session(s) closed{}",
            sessions.len(),
            if discarded { ", unflushed state dropped" } else { "" }
        );
        Ok(())
    }

    pub async fn flush(&self, room_id: &str) -> Result<FlushOutcome, CompactError> {
        self.compactor.flush(room_id).await
    }

    /// Flush every dirty room. Returns how many snapshots were written.
    pub async fn flush_all(&self) -> usize {
        self.compactor.flush_dirty().await
    }

    pub fn stats(&self) -> HubStats {
        use std::sync::atomic::Ordering::Relaxed;
        let counters = self.broadcaster.stats();
        HubStats {
            rooms: self.registry.room_count(),
            sessions: self.registry.total_sessions(),
            cached_rooms: self.store.cached_room_count(),
            dirty_rooms: self.compactor.dirty_count(),
            updates_merged: counters.updates_merged.load(Relaxed),
            updates_rejected: counters.updates_rejected.load(Relaxed),
            frames_delivered: counters.frames_delivered.load(Relaxed),
            sessions_evicted: counters.sessions_evicted.load(Relaxed),
            snapshots_flushed: self.compactor.flush_count(),
            flush_failures: self.compactor.failure_count(),
        }
    }

    // --- Maintenance ---

    /// One background pass: flush dirty rooms, purge the shared cache,
    /// release empty rooms and idle cache entries.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            flushed: self.compactor.flush_dirty().await,
            ..MaintenanceReport::default()
        };
        self.store.purge_shared().await;

        // Rooms emptied by evictions never saw a leave that emptied them
        for room_id in self.registry.room_ids() {
            if self.registry.session_count(&room_id).await == 0 && self.release_if_idle(&room_id).await
            {
                report.rooms_evicted += 1;
            }
        }

        for room_id in self.store.cached_rooms() {
            let released = self.store.evict_local_if(&room_id, || {
                !self.registry.contains(&room_id) && !self.compactor.is_dirty(&room_id)
            });
            if released {
                report.cache_entries_released += 1;
            }
        }

        if report != MaintenanceReport::default() {
            log::debug!("Maintenance: {report:?}");
        }
        report
    }

    /// Run maintenance every `flush_interval` until `shutdown` flips, then
    /// flush once more.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.run_maintenance().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }

            let flushed = hub.flush_all().await;
            log::info!("Maintenance stopped, final flush wrote {flushed} snapshot(s)");
        })
    }
}
