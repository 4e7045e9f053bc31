//! Shared cache tier and per-room update log.
//!
//! The shared cache is a key/value store with per-key TTL that several
//! server processes could point at. It also carries an append-only update log
//! per room, bounded by entry count and age, used to replay updates that were
//! merged but not yet compacted into a durable snapshot.
//!
//! `MemorySharedCache` is the in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::LogRetention;

/// Shared cache errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Cache unreachable
    #[error("shared cache unavailable: {0}")]
    Unavailable(String),
    /// A log entry failed checksum verification
    #[error("update log corrupted at sequence {sequence}")]
    Corrupt { sequence: u64 },
}

/// One retained update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Sequence number, increasing across every room of the cache
    pub sequence: u64,
    /// Raw update bytes, exactly as received
    pub payload: Vec<u8>,
    /// FNV-1a over sequence, room id and payload
    pub checksum: u32,
}

impl LogEntry {
    /// Create an entry with computed checksum.
    pub fn new(room_id: &str, sequence: u64, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(room_id, sequence, &payload);
        Self {
            sequence,
            payload,
            checksum,
        }
    }

    /// Verify the entry belongs to `room_id` and is intact.
    pub fn verify(&self, room_id: &str) -> bool {
        self.checksum == Self::compute_checksum(room_id, self.sequence, &self.payload)
    }

    fn compute_checksum(room_id: &str, sequence: u64, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        };
        sequence.to_be_bytes().into_iter().for_each(&mut mix);
        room_id.bytes().for_each(&mut mix);
        // Separator so ("ab", [c]) and ("a", [b, c]) differ
        mix(0xff);
        payload.iter().copied().for_each(&mut mix);
        hash
    }
}

/// The shared cache collaborator.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Append an update to the room's log, returning its sequence number.
    async fn append_update(&self, room_id: &str, update: &[u8]) -> Result<u64, CacheError>;

    /// Retained entries with a sequence number greater than `after`, oldest
    /// first.
    async fn updates_after(&self, room_id: &str, after: u64) -> Result<Vec<LogEntry>, CacheError>;

    /// Highest sequence number assigned for the room since its log was
    /// created.
    async fn last_sequence(&self, room_id: &str) -> Result<Option<u64>, CacheError>;

    /// Drop entries with sequence `<= up_to`, returning how many were dropped.
    async fn trim_updates(&self, room_id: &str, up_to: u64) -> Result<usize, CacheError>;

    /// Drop the room's whole log. Sequence numbers are never reused, so a
    /// log created later for the same room starts above every old entry.
    async fn delete_log(&self, room_id: &str) -> Result<usize, CacheError>;

    /// Drop expired keys and log entries. Returns the number dropped.
    async fn purge_expired(&self) -> Result<usize, CacheError>;
}

struct CachedValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

struct RetainedEntry {
    entry: LogEntry,
    appended: Instant,
}

#[derive(Default)]
struct UpdateLog {
    entries: VecDeque<RetainedEntry>,
    /// Kept after trims; zero until the first append
    last_sequence: u64,
}

impl UpdateLog {
    fn prune(&mut self, retention: &LogRetention, now: Instant) -> usize {
        let mut dropped = 0;
        while self.entries.len() > retention.max_entries {
            self.entries.pop_front();
            dropped += 1;
        }
        while self
            .entries
            .front()
            .is_some_and(|e| now.duration_since(e.appended) >= retention.ttl)
        {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }
}

/// In-process `SharedCache`.
pub struct MemorySharedCache {
    values: DashMap<String, CachedValue>,
    logs: DashMap<String, UpdateLog>,
    /// Last sequence handed out, shared by all rooms
    sequence: AtomicU64,
    retention: LogRetention,
}

impl MemorySharedCache {
    pub fn new(retention: LogRetention) -> Self {
        Self {
            values: DashMap::new(),
            logs: DashMap::new(),
            sequence: AtomicU64::new(0),
            retention,
        }
    }
}

impl Default for MemorySharedCache {
    fn default() -> Self {
        Self::new(LogRetention::default())
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        if let Some(value) = self.values.get(key) {
            if value.expires_at > now {
                return Ok(Some(value.bytes.clone()));
            }
        }
        self.values.remove_if(key, |_, v| v.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.values.insert(
            key.to_string(),
            CachedValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.values.remove(key);
        Ok(())
    }

    async fn append_update(&self, room_id: &str, update: &[u8]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut log = self.logs.entry(room_id.to_string()).or_default();
        // Taken under the entry lock so a room's log stays in sequence order
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        log.last_sequence = sequence;
        log.entries.push_back(RetainedEntry {
            entry: LogEntry::new(room_id, sequence, update.to_vec()),
            appended: now,
        });
        log.prune(&self.retention, now);
        Ok(sequence)
    }

    async fn updates_after(&self, room_id: &str, after: u64) -> Result<Vec<LogEntry>, CacheError> {
        let now = Instant::now();
        let Some(log) = self.logs.get(room_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for retained in log.entries.iter() {
            if retained.entry.sequence <= after
                || now.duration_since(retained.appended) >= self.retention.ttl
            {
                continue;
            }
            if !retained.entry.verify(room_id) {
                return Err(CacheError::Corrupt {
                    sequence: retained.entry.sequence,
                });
            }
            out.push(retained.entry.clone());
        }
        Ok(out)
    }

    async fn last_sequence(&self, room_id: &str) -> Result<Option<u64>, CacheError> {
        Ok(self
            .logs
            .get(room_id)
            .map(|log| log.last_sequence)
            .filter(|seq| *seq > 0))
    }

    async fn trim_updates(&self, room_id: &str, up_to: u64) -> Result<usize, CacheError> {
        let Some(mut log) = self.logs.get_mut(room_id) else {
            return Ok(0);
        };
        let before = log.entries.len();
        log.entries.retain(|e| e.entry.sequence > up_to);
        Ok(before - log.entries.len())
    }

    async fn delete_log(&self, room_id: &str) -> Result<usize, CacheError> {
        Ok(self
            .logs
            .remove(room_id)
            .map(|(_, log)| log.entries.len())
            .unwrap_or(0))
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let before = self.values.len();
        self.values.retain(|_, v| v.expires_at > now);
        let mut dropped = before.saturating_sub(self.values.len());
        for mut log in self.logs.iter_mut() {
            dropped += log.prune(&self.retention, now);
        }
        // Sequences are cache-wide, so forgetting an empty log is safe
        self.logs.retain(|_, log| !log.entries.is_empty());
        Ok(dropped)
    }
}
