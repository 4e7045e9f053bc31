//! Room registry: live sessions per room.
//!
//! Each room is its own serialization domain: a `tokio::sync::Mutex` around
//! the room's member set, stored in a sharded `DashMap`. Nothing takes a
//! registry-wide lock, so different rooms never wait on each other.
//!
//! Eviction is compare-and-remove. `try_evict` locks the room, gives up if a
//! session is present, otherwise marks the member set closed and removes that
//! exact map entry. A joiner that raced onto a closed member set retries and
//! lands in a fresh one.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::session::{SessionHandle, SessionId};

#[derive(Default)]
struct RoomMembers {
    sessions: HashMap<SessionId, SessionHandle>,
    /// Set once the room has been evicted; a closed set never reopens
    closed: bool,
}

type RoomSlot = Arc<Mutex<RoomMembers>>;

/// Exclusive access to one room's member set.
///
/// Holding the guard serializes against every other join, leave, update and
/// eviction for the same room.
pub struct RoomGuard {
    room_id: String,
    members: OwnedMutexGuard<RoomMembers>,
    total_sessions: Arc<AtomicUsize>,
}

impl RoomGuard {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Add a session. Returns false if the id was already present (the
    /// handle is replaced).
    pub fn join(&mut self, handle: SessionHandle) -> bool {
        let fresh = self.members.sessions.insert(handle.id(), handle).is_none();
        if fresh {
            self.total_sessions.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Remove a session, returning its handle if it was present.
    pub fn leave(&mut self, session_id: &SessionId) -> Option<SessionHandle> {
        let removed = self.members.sessions.remove(session_id);
        if removed.is_some() {
            self.total_sessions.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.members.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.sessions.is_empty()
    }

    /// Every session except `excluding`.
    pub fn targets(&self, excluding: Option<&SessionId>) -> Vec<SessionHandle> {
        self.members
            .sessions
            .values()
            .filter(|h| Some(&h.id()) != excluding)
            .cloned()
            .collect()
    }
}

/// Registry of rooms and their live sessions.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomSlot>,
    total_sessions: Arc<AtomicUsize>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            total_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn guard(&self, room_id: &str, members: OwnedMutexGuard<RoomMembers>) -> RoomGuard {
        RoomGuard {
            room_id: room_id.to_string(),
            members,
            total_sessions: Arc::clone(&self.total_sessions),
        }
    }

    /// Lock a room, creating it if needed.
    pub async fn lock(&self, room_id: &str) -> RoomGuard {
        loop {
            let slot = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RoomMembers::default())))
                .value()
                .clone();

            let members = slot.lock_owned().await;
            if !members.closed {
                return self.guard(room_id, members);
            }
            // Lost a race with eviction; the closed slot is already gone
            drop(members);
            tokio::task::yield_now().await;
        }
    }

    /// Lock a room only if it is live.
    pub async fn lock_existing(&self, room_id: &str) -> Option<RoomGuard> {
        let slot = self.rooms.get(room_id).map(|r| r.value().clone())?;
        let members = slot.lock_owned().await;
        if members.closed {
            return None;
        }
        Some(self.guard(room_id, members))
    }

    /// Add a session to a room.
    pub async fn join(&self, room_id: &str, handle: SessionHandle) {
        let session_id = handle.id();
        let mut room = self.lock(room_id).await;
        room.join(handle);
        log::debug!(
            "Session {session_id} joined room {room_id} ({} active)",
            room.len()
        );
    }

    /// Remove a session. Returns true exactly when this call emptied the
    /// room; unknown rooms and absent sessions are a no-op.
    pub async fn leave(&self, room_id: &str, session_id: &SessionId) -> bool {
        let Some(mut room) = self.lock_existing(room_id).await else {
            return false;
        };
        room.leave(session_id).is_some() && room.is_empty()
    }

    /// Sessions of a room other than `excluding`.
    pub async fn broadcast_targets(
        &self,
        room_id: &str,
        excluding: Option<&SessionId>,
    ) -> Vec<SessionHandle> {
        match self.lock_existing(room_id).await {
            Some(room) => room.targets(excluding),
            None => Vec::new(),
        }
    }

    /// Evict an empty room. Aborts (returns false) if a session is present.
    pub async fn try_evict(&self, room_id: &str) -> bool {
        let Some(slot) = self.rooms.get(room_id).map(|r| r.value().clone()) else {
            return false;
        };
        let mut members = slot.lock().await;
        if members.closed || !members.sessions.is_empty() {
            return false;
        }
        members.closed = true;
        self.rooms
            .remove_if(room_id, |_, current| Arc::ptr_eq(current, &slot));
        log::debug!("Room {room_id} evicted from registry");
        true
    }

    /// Sessions in a room.
    pub async fn session_count(&self, room_id: &str) -> usize {
        match self.lock_existing(room_id).await {
            Some(room) => room.len(),
            None => 0,
        }
    }

    /// Sessions across all rooms.
    pub fn total_sessions(&self) -> usize {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// Rooms currently registered.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }
}
