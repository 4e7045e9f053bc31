//! Update intake and fan-out.
//!
//! Every inbound update goes through `handle_update`:
//!
//! ```text
//! payload ──► validate ──► room known? ──► [room guard] ──► merge ──► persist ──► fan out
//!               │              │               │              │                     │
//!               ▼              ▼               ▼              ▼                     ▼
//!         EmptyPayload    UnknownRoom      NotMember        Merge          slow / dead
//!         TooLarge        (close 1008)   (close 1008)    (rejected)       targets evicted
//! ```
//!
//! Merge, persist and fan-out run under the room's guard, so updates of one
//! room are applied and delivered in a single order. Fan-out never waits:
//! each target gets a non-blocking enqueue, and a target whose queue is full
//! or closed is removed from the room and kicked.

use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::compactor::SnapshotCompactor;
use crate::merge::MergeError;
use crate::protocol::CloseReason;
use crate::registry::{RoomGuard, RoomRegistry};
use crate::session::{DeliveryError, Frame, SessionId};
use crate::storage::{StateStore, StorageError};

/// Why an update was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("empty update")]
    EmptyPayload,
    #[error("update of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    /// No document backs this room
    #[error("unknown room {0}")]
    UnknownRoom(String),
    /// Sender is not (or no longer) a member of the room
    #[error("session {session} is not a member of room {room_id}")]
    NotMember { room_id: String, session: SessionId },
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
}

impl UpdateError {
    /// Close reason if this error ends the sender's connection.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            UpdateError::UnknownRoom(_) => Some(CloseReason::UnknownRoom),
            UpdateError::NotMember { .. } => Some(CloseReason::NotMember),
            _ => None,
        }
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Targets that accepted the frame
    pub delivered: usize,
    /// Targets removed from the room because delivery failed
    pub evicted: Vec<SessionId>,
}

/// Counters for monitoring. Updated with relaxed atomics off the lock path.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    pub updates_merged: AtomicU64,
    pub updates_rejected: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub sessions_evicted: AtomicU64,
}

/// Merges inbound updates into room state and relays them to peers.
pub struct UpdateBroadcaster {
    registry: Arc<RoomRegistry>,
    store: Arc<StateStore>,
    compactor: Arc<SnapshotCompactor>,
    /// Rooms confirmed to be backed by a document
    known_rooms: DashSet<String>,
    max_update_bytes: usize,
    stats: BroadcastStats,
}

impl UpdateBroadcaster {
    pub fn new(
        registry: Arc<RoomRegistry>,
        store: Arc<StateStore>,
        compactor: Arc<SnapshotCompactor>,
        max_update_bytes: usize,
    ) -> Self {
        Self {
            registry,
            store,
            compactor,
            known_rooms: DashSet::new(),
            max_update_bytes,
            stats: BroadcastStats::default(),
        }
    }

    /// Remember that a document exists for `room_id`.
    pub fn mark_known(&self, room_id: &str) {
        self.known_rooms.insert(room_id.to_string());
    }

    /// Drop a cached existence answer.
    pub fn forget(&self, room_id: &str) {
        self.known_rooms.remove(room_id);
    }

    /// Whether a document backs `room_id`. Positive answers are cached;
    /// storage failures are returned to the caller.
    pub async fn room_exists(&self, room_id: &str) -> Result<bool, StorageError> {
        if self.known_rooms.contains(room_id) || self.store.is_cached_locally(room_id) {
            return Ok(true);
        }
        let exists = self.store.durable().document_exists(room_id).await?;
        if exists {
            self.mark_known(room_id);
        }
        Ok(exists)
    }

    /// Merge `payload` into the room's state and relay it to every other
    /// session in the room.
    pub async fn handle_update(
        &self,
        room_id: &str,
        from: &SessionId,
        payload: &[u8],
    ) -> Result<Delivery, UpdateError> {
        self.apply(room_id, from, payload).await.inspect_err(|e| {
            self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!("Update from {from} to room {room_id} rejected: {e}");
        })
    }

    async fn apply(
        &self,
        room_id: &str,
        from: &SessionId,
        payload: &[u8],
    ) -> Result<Delivery, UpdateError> {
        if payload.is_empty() {
            return Err(UpdateError::EmptyPayload);
        }
        if payload.len() > self.max_update_bytes {
            return Err(UpdateError::TooLarge {
                size: payload.len(),
                limit: self.max_update_bytes,
            });
        }

        match self.room_exists(room_id).await {
            Ok(true) => {}
            Ok(false) => return Err(UpdateError::UnknownRoom(room_id.to_string())),
            Err(e) => log::warn!(
                "Existence check for room {room_id} failed, accepting update in degraded mode: {e}"
            ),
        }

        let not_member = || UpdateError::NotMember {
            room_id: room_id.to_string(),
            session: *from,
        };
        let mut room = self
            .registry
            .lock_existing(room_id)
            .await
            .ok_or_else(not_member)?;
        if !room.contains(from) {
            return Err(not_member());
        }

        let state = self.store.get(room_id).await;
        let merged = self.store.merge_engine().merge(&state, payload)?;
        self.store.set(room_id, merged).await;
        self.store.append_update(room_id, payload).await;
        self.compactor.mark_dirty(room_id);
        self.stats.updates_merged.fetch_add(1, Ordering::Relaxed);

        Ok(self.fan_out(&mut room, Some(from), Arc::new(payload.to_vec())))
    }

    /// Queue `frame` for every session in the guarded room except `from`.
    pub fn fan_out(&self, room: &mut RoomGuard, from: Option<&SessionId>, frame: Frame) -> Delivery {
        let mut delivery = Delivery::default();

        for target in room.targets(from) {
            let reason = match target.try_deliver(Arc::clone(&frame)) {
                Ok(()) => {
                    delivery.delivered += 1;
                    continue;
                }
                Err(DeliveryError::Full) => CloseReason::SlowConsumer,
                Err(DeliveryError::Closed) => CloseReason::Evicted,
            };

            log::warn!(
                "Removing session {} from room {}: {}",
                target.id(),
                room.room_id(),
                reason.reason()
            );
            room.leave(&target.id());
            target.kick(reason);
            delivery.evicted.push(target.id());
        }

        self.stats
            .frames_delivered
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.stats
            .sessions_evicted
            .fetch_add(delivery.evicted.len() as u64, Ordering::Relaxed);
        delivery
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.stats
    }
}
