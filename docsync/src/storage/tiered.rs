//! Read-through tiered state store.
//!
//! Lookup order is local → shared → durable. The first tier that answers is
//! written back into every faster tier, so the next read is a local hit. A
//! lookup that finds nothing anywhere (or only failing tiers) yields the empty
//! state, which is what a brand-new room starts from.
//!
//! Logged updates are folded over whatever the durable tier returned, and
//! over the empty state when the durable tier is unreachable, so an update
//! that was relayed is never missing from a rebuilt state while its log
//! entry is retained.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, DocumentStorage, LogEntry, SharedCache};
use crate::merge::MergeEngine;

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Shared,
    Durable,
    /// Update log only; the durable tier was unreachable
    Log,
    Empty,
}

/// Shared-cache key holding a room's state.
pub fn state_key(room_id: &str) -> String {
    format!("docsync:state:{room_id}")
}

/// Tiered store of per-room accumulated state.
pub struct StateStore {
    local: DashMap<String, Arc<Vec<u8>>>,
    shared: Arc<dyn SharedCache>,
    durable: Arc<dyn DocumentStorage>,
    merge: Arc<dyn MergeEngine>,
    ttl: Duration,
}

impl StateStore {
    pub fn new(
        shared: Arc<dyn SharedCache>,
        durable: Arc<dyn DocumentStorage>,
        merge: Arc<dyn MergeEngine>,
        ttl: Duration,
    ) -> Self {
        Self {
            local: DashMap::new(),
            shared,
            durable,
            merge,
            ttl,
        }
    }

    /// Current state of a room; empty if no tier knows it.
    pub async fn get(&self, room_id: &str) -> Vec<u8> {
        self.get_with_tier(room_id).await.0
    }

    /// Current state plus the tier that produced it.
    pub async fn get_with_tier(&self, room_id: &str) -> (Vec<u8>, Tier) {
        if let Some((state, tier)) = self.cached_with_tier(room_id).await {
            return (state, tier);
        }

        let snapshot = match self.durable.load_snapshot(room_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Durable read failed for room {room_id}, rebuilding from the update log: {e}");
                // Not cached: the next read retries the durable tier
                let (state, replayed) = self.replay_log(room_id, Vec::new()).await;
                let tier = if state.is_empty() { Tier::Empty } else { Tier::Log };
                log::debug!("Rebuilt room {room_id} from {replayed} logged updates");
                return (state, tier);
            }
        };

        let (state, replayed) = self.replay_log(room_id, snapshot.unwrap_or_default()).await;
        if state.is_empty() {
            log::debug!("No state found for room {room_id}");
            return (state, Tier::Empty);
        }

        log::debug!(
            "Loaded room {room_id} from durable storage ({} bytes, {replayed} logged updates replayed)",
            state.len()
        );
        self.write_shared(room_id, &state).await;
        self.local.insert(room_id.to_string(), Arc::new(state.clone()));
        (state, Tier::Durable)
    }

    /// State from the local or shared tier only.
    pub async fn cached(&self, room_id: &str) -> Option<Vec<u8>> {
        self.cached_with_tier(room_id).await.map(|(state, _)| state)
    }

    async fn cached_with_tier(&self, room_id: &str) -> Option<(Vec<u8>, Tier)> {
        if let Some(state) = self.local.get(room_id).map(|s| s.value().clone()) {
            return Some((state.as_ref().clone(), Tier::Local));
        }

        match self.shared.get(&state_key(room_id)).await {
            Ok(Some(state)) => {
                self.local.insert(room_id.to_string(), Arc::new(state.clone()));
                Some((state, Tier::Shared))
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Shared cache read failed for room {room_id}: {e}");
                None
            }
        }
    }

    /// Fold retained update-log entries over a durable snapshot.
    async fn replay_log(&self, room_id: &str, snapshot: Vec<u8>) -> (Vec<u8>, usize) {
        match self.shared.updates_after(room_id, 0).await {
            Ok(entries) => self.fold(room_id, snapshot, entries),
            Err(e) => {
                log::warn!("Update log unavailable for room {room_id}: {e}");
                (snapshot, 0)
            }
        }
    }

    /// Fold logged updates with sequence `<= up_to` over `state`.
    ///
    /// Merges are idempotent, so entries already contained in `state` leave
    /// it unchanged. Fails only if the log cannot be read.
    pub async fn fold_log(
        &self,
        room_id: &str,
        state: Vec<u8>,
        up_to: u64,
    ) -> Result<(Vec<u8>, usize), CacheError> {
        let mut entries = self.shared.updates_after(room_id, 0).await?;
        entries.retain(|e| e.sequence <= up_to);
        Ok(self.fold(room_id, state, entries))
    }

    fn fold(&self, room_id: &str, mut state: Vec<u8>, entries: Vec<LogEntry>) -> (Vec<u8>, usize) {
        let mut replayed = 0;
        for entry in entries {
            match self.merge.merge(&state, &entry.payload) {
                Ok(merged) => {
                    state = merged;
                    replayed += 1;
                }
                Err(e) => log::warn!(
                    "Skipping logged update {} for room {room_id}: {e}",
                    entry.sequence
                ),
            }
        }
        (state, replayed)
    }

    /// Store a room's state in the local and shared tiers.
    pub async fn set(&self, room_id: &str, state: Vec<u8>) {
        let state = Arc::new(state);
        self.local.insert(room_id.to_string(), Arc::clone(&state));
        self.write_shared(room_id, &state).await;
    }

    /// Replace the local state with `state` if it still equals `seen`.
    ///
    /// Used after a flush whose snapshot holds more than the cache did. The
    /// shared copy is dropped rather than overwritten, so other processes
    /// rebuild from the durable snapshot and the retained log.
    pub async fn refresh_local(&self, room_id: &str, seen: &[u8], state: Vec<u8>) -> bool {
        let replaced = match self.local.get_mut(room_id) {
            Some(mut entry) if entry.as_slice() == seen => {
                *entry = Arc::new(state);
                true
            }
            _ => false,
        };
        if replaced {
            if let Err(e) = self.shared.delete(&state_key(room_id)).await {
                log::warn!("Shared cache delete failed for room {room_id}: {e}");
            }
        }
        replaced
    }

    async fn write_shared(&self, room_id: &str, state: &[u8]) {
        if let Err(e) = self.shared.set(&state_key(room_id), state, self.ttl).await {
            log::warn!("Shared cache write failed for room {room_id}: {e}");
        }
    }

    /// Append a raw update to the room's log. Returns the sequence, if the
    /// log accepted it.
    pub async fn append_update(&self, room_id: &str, update: &[u8]) -> Option<u64> {
        match self.shared.append_update(room_id, update).await {
            Ok(seq) => Some(seq),
            Err(e) => {
                log::warn!("Update log append failed for room {room_id}: {e}");
                None
            }
        }
    }

    /// Highest logged sequence for a room (None if unknown or unavailable).
    pub async fn last_logged(&self, room_id: &str) -> Option<u64> {
        self.shared.last_sequence(room_id).await.ok().flatten()
    }

    /// Drop logged updates up to `sequence` once they are durable.
    pub async fn trim_log(&self, room_id: &str, sequence: u64) {
        match self.shared.trim_updates(room_id, sequence).await {
            Ok(n) if n > 0 => log::debug!("Trimmed {n} logged updates for room {room_id}"),
            Ok(_) => {}
            Err(e) => log::warn!("Update log trim failed for room {room_id}: {e}"),
        }
    }

    /// Drop the room's whole update log.
    pub async fn purge_log(&self, room_id: &str) -> Result<usize, CacheError> {
        let dropped = self.shared.delete_log(room_id).await?;
        if dropped > 0 {
            log::debug!("Purged {dropped} logged updates for room {room_id}");
        }
        Ok(dropped)
    }

    /// Drop a room from the local and shared tiers.
    pub async fn invalidate(&self, room_id: &str) {
        self.local.remove(room_id);
        if let Err(e) = self.shared.delete(&state_key(room_id)).await {
            log::warn!("Shared cache delete failed for room {room_id}: {e}");
        }
    }

    /// Remove the local entry if `evictable` holds while the entry's shard is
    /// locked. Returns whether an entry was removed.
    pub fn evict_local_if(&self, room_id: &str, evictable: impl FnOnce() -> bool) -> bool {
        self.local.remove_if(room_id, |_, _| evictable()).is_some()
    }

    /// Whether the local tier holds this room.
    pub fn is_cached_locally(&self, room_id: &str) -> bool {
        self.local.contains_key(room_id)
    }

    /// Room ids held in the local tier.
    pub fn cached_rooms(&self) -> Vec<String> {
        self.local.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of rooms in the local tier.
    pub fn cached_room_count(&self) -> usize {
        self.local.len()
    }

    /// Purge expired shared-cache entries.
    pub async fn purge_shared(&self) {
        match self.shared.purge_expired().await {
            Ok(n) if n > 0 => log::debug!("Purged {n} expired shared cache entries"),
            Ok(_) => {}
            Err(e) => log::warn!("Shared cache purge failed: {e}"),
        }
    }

    pub fn durable(&self) -> &Arc<dyn DocumentStorage> {
        &self.durable
    }

    pub fn merge_engine(&self) -> &Arc<dyn MergeEngine> {
        &self.merge
    }
}
