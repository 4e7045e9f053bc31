//! Persistence integration tests.
//!
//! Verifies:
//! - Room state survives a restart on RocksDB
//! - A durable snapshot is served unchanged when caches are cold
//! - Flush failures keep the room dirty and cached until storage recovers
//! - Shared cache outages do not stop merging or fan-out
//! - State is rebuilt from the update log when the cached copy is gone
//! - Sessions are admitted in degraded mode when storage is unreachable
//! - Relayed updates survive cache loss during storage and cache outages

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync::storage::tiered::state_key;
use docsync::storage::LogEntry;
use docsync::{
    CacheError, DocumentStorage, MemoryDocumentStore, MemorySharedCache, MergeEngine, MergeKind,
    RocksDocumentStore, ServerConfig, SessionHandle, SessionId, SharedCache, SnapshotMetadata,
    StorageError, StoreConfig, SyncHub, Tier, UpdateSetMerge,
};
use tempfile::tempdir;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

// ─── Fault injection ─────────────────────────────────────────────────────────

/// Durable storage that can be switched off.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryDocumentStore,
    down: AtomicBool,
}

impl FlakyStorage {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStorage for FlakyStorage {
    async fn load_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        self.inner.load_snapshot(room_id).await
    }

    async fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<SnapshotMetadata, StorageError> {
        self.check()?;
        self.inner.save_snapshot(room_id, snapshot).await
    }

    async fn document_exists(&self, room_id: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.document_exists(room_id).await
    }

    async fn create_document(&self, room_id: &str) -> Result<SnapshotMetadata, StorageError> {
        self.check()?;
        self.inner.create_document(room_id).await
    }

    async fn delete_document(&self, room_id: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.delete_document(room_id).await
    }
}

/// Shared cache that can be switched off.
#[derive(Default)]
struct FlakyCache {
    inner: MemorySharedCache,
    down: AtomicBool,
}

impl FlakyCache {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedCache for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn append_update(&self, room_id: &str, update: &[u8]) -> Result<u64, CacheError> {
        self.check()?;
        self.inner.append_update(room_id, update).await
    }

    async fn updates_after(&self, room_id: &str, after: u64) -> Result<Vec<LogEntry>, CacheError> {
        self.check()?;
        self.inner.updates_after(room_id, after).await
    }

    async fn last_sequence(&self, room_id: &str) -> Result<Option<u64>, CacheError> {
        self.check()?;
        self.inner.last_sequence(room_id).await
    }

    async fn trim_updates(&self, room_id: &str, up_to: u64) -> Result<usize, CacheError> {
        self.check()?;
        self.inner.trim_updates(room_id, up_to).await
    }

    async fn delete_log(&self, room_id: &str) -> Result<usize, CacheError> {
        self.check()?;
        self.inner.delete_log(room_id).await
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        self.check()?;
        self.inner.purge_expired().await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Faulty {
    hub: SyncHub,
    storage: Arc<FlakyStorage>,
    cache: Arc<FlakyCache>,
}

fn faulty_hub() -> Faulty {
    let storage = Arc::new(FlakyStorage::default());
    let cache = Arc::new(FlakyCache::default());
    let hub = SyncHub::new(ServerConfig::for_testing(), cache.clone(), storage.clone());
    Faulty { hub, storage, cache }
}

fn set_state(updates: &[&[u8]]) -> Vec<u8> {
    let mut state = Vec::new();
    for update in updates {
        state = UpdateSetMerge.merge(&state, update).unwrap();
    }
    state
}

/// Join a fresh session, returning its id and the handle's inbox.
async fn join(hub: &SyncHub, room: &str) -> (SessionId, docsync::session::SessionInbox) {
    let (handle, inbox) = SessionHandle::new(16);
    let id = handle.id();
    hub.join(room, handle).await.unwrap();
    (id, inbox)
}

/// Update produced by an independent client inserting `text` at 0.
fn yrs_insert(client_id: u64, text: &str) -> Vec<u8> {
    let doc = Doc::with_client_id(client_id);
    {
        let mut txn = doc.transact_mut();
        let t = txn.get_or_insert_text("content");
        t.insert(&mut txn, 0, text);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn yrs_text(state: &[u8]) -> String {
    let doc = Doc::new();
    {
        let update = Update::decode_v1(state).unwrap();
        let mut txn = doc.transact_mut();
        txn.apply_update(update).unwrap();
    }
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_room_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let config = ServerConfig {
        merge: MergeKind::Yrs,
        ..ServerConfig::for_testing()
    };

    {
        let rocks = RocksDocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        let hub = SyncHub::new(
            config.clone(),
            Arc::new(MemorySharedCache::default()),
            Arc::new(rocks),
        );
        hub.create_room_with_id("notes").await.unwrap();

        let (alice, _alice_inbox) = join(&hub, "notes").await;
        let (bob, _bob_inbox) = join(&hub, "notes").await;
        hub.handle_update("notes", &alice, &yrs_insert(1, "hello"))
            .await
            .unwrap();
        hub.handle_update("notes", &bob, &yrs_insert(2, "world"))
            .await
            .unwrap();

        hub.leave("notes", &alice).await;
        hub.leave("notes", &bob).await;
        assert_eq!(hub.stats().dirty_rooms, 0, "last leave flushes");
    }

    // Fresh process: new RocksDB handle, cold caches
    let rocks = RocksDocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
    let hub = SyncHub::new(config, Arc::new(MemorySharedCache::default()), Arc::new(rocks));

    let (state, tier) = hub.state_store().get_with_tier("notes").await;
    assert_eq!(tier, Tier::Durable);
    let text = yrs_text(&state);
    assert_eq!(text.len(), 10);
    assert!(text.contains("hello"));
    assert!(text.contains("world"));

    let (_carol, mut inbox) = join(&hub, "notes").await;
    let first = inbox.frames.recv().await.unwrap();
    assert_eq!(yrs_text(&first), text);
}

#[tokio::test]
async fn test_durable_snapshot_served_unchanged() {
    let durable = Arc::new(MemoryDocumentStore::new());
    durable.create_document("r2").await.unwrap();
    let snapshot = set_state(&[b"s"]);
    durable.save_snapshot("r2", &snapshot).await.unwrap();

    let hub = SyncHub::new(
        ServerConfig::for_testing(),
        Arc::new(MemorySharedCache::default()),
        durable,
    );

    assert_eq!(hub.document_state("r2").await, snapshot);

    let (_id, mut inbox) = join(&hub, "r2").await;
    assert_eq!(inbox.frames.recv().await.unwrap().as_ref(), &snapshot);
}

#[tokio::test]
async fn test_flush_failure_keeps_room_dirty_until_recovery() {
    let f = faulty_hub();
    f.hub.create_room_with_id("r1").await.unwrap();
    let (alice, _inbox) = join(&f.hub, "r1").await;

    f.storage.set_down(true);
    f.hub.handle_update("r1", &alice, &[1]).await.unwrap();
    f.hub.handle_update("r1", &alice, &[2]).await.unwrap();
    f.hub.leave("r1", &alice).await;

    let stats = f.hub.stats();
    assert_eq!(stats.rooms, 0, "empty room leaves the registry");
    assert_eq!(stats.dirty_rooms, 1);
    assert_eq!(stats.cached_rooms, 1, "unflushed state stays cached");
    assert!(stats.flush_failures >= 1);
    assert_eq!(f.hub.document_state("r1").await, set_state(&[&[1], &[2]]));

    // Still failing: maintenance writes nothing
    assert_eq!(f.hub.run_maintenance().await.flushed, 0);

    f.storage.set_down(false);
    let report = f.hub.run_maintenance().await;
    assert_eq!(report.flushed, 1);
    assert_eq!(report.cache_entries_released, 1);

    assert_eq!(
        f.storage.inner.load_snapshot("r1").await.unwrap(),
        Some(set_state(&[&[1], &[2]]))
    );
    let stats = f.hub.stats();
    assert_eq!(stats.dirty_rooms, 0);
    assert_eq!(stats.cached_rooms, 0);
}

#[tokio::test]
async fn test_flush_merges_into_newer_durable_snapshot() {
    let f = faulty_hub();
    f.hub.create_room_with_id("r1").await.unwrap();
    let (alice, _inbox) = join(&f.hub, "r1").await;
    f.hub.handle_update("r1", &alice, &[1]).await.unwrap();

    // Another writer saved a snapshot in the meantime
    f.storage
        .inner
        .save_snapshot("r1", &set_state(&[&[9]]))
        .await
        .unwrap();

    f.hub.flush("r1").await.unwrap();
    assert_eq!(
        f.storage.inner.load_snapshot("r1").await.unwrap(),
        Some(set_state(&[&[1], &[9]]))
    );
}

#[tokio::test]
async fn test_shared_cache_outage_does_not_block_updates() {
    let f = faulty_hub();
    f.hub.create_room_with_id("r1").await.unwrap();
    let (alice, _alice_inbox) = join(&f.hub, "r1").await;
    let (_bob, mut bob_inbox) = join(&f.hub, "r1").await;

    f.cache.set_down(true);
    let delivery = f.hub.handle_update("r1", &alice, &[5]).await.unwrap();
    assert_eq!(delivery.delivered, 1);
    assert_eq!(bob_inbox.frames.recv().await.unwrap().as_ref(), &vec![5]);
    assert_eq!(f.hub.document_state("r1").await, set_state(&[&[5]]));

    f.hub.flush("r1").await.unwrap();
    assert_eq!(
        f.storage.inner.load_snapshot("r1").await.unwrap(),
        Some(set_state(&[&[5]]))
    );
}

#[tokio::test]
async fn test_state_rebuilt_from_update_log() {
    let storage = Arc::new(MemoryDocumentStore::new());
    let cache = Arc::new(MemorySharedCache::default());
    let config = ServerConfig::for_testing();

    let writer = SyncHub::new(config.clone(), cache.clone(), storage.clone());
    writer.create_room_with_id("r1").await.unwrap();
    let (alice, _inbox) = join(&writer, "r1").await;
    writer.handle_update("r1", &alice, &[1]).await.unwrap();
    writer.handle_update("r1", &alice, &[2]).await.unwrap();

    // The writer never flushed and its cached state expired
    cache.delete(&state_key("r1")).await.unwrap();
    assert_eq!(storage.load_snapshot("r1").await.unwrap(), None);

    let reader = SyncHub::new(config, cache, storage);
    let (state, tier) = reader.state_store().get_with_tier("r1").await;
    assert_eq!(tier, Tier::Durable);
    assert_eq!(state, set_state(&[&[1], &[2]]));
}

#[tokio::test]
async fn test_degraded_join_when_storage_unreachable() {
    let f = faulty_hub();
    f.storage.inner.create_document("r1").await.unwrap();
    f.storage.set_down(true);

    let (alice, _alice_inbox) = join(&f.hub, "r1").await;
    let (_bob, mut bob_inbox) = join(&f.hub, "r1").await;
    f.hub.handle_update("r1", &alice, &[3]).await.unwrap();
    assert_eq!(bob_inbox.frames.recv().await.unwrap().as_ref(), &vec![3]);

    f.storage.set_down(false);
    assert_eq!(f.hub.flush_all().await, 1);
    assert_eq!(
        f.storage.inner.load_snapshot("r1").await.unwrap(),
        Some(set_state(&[&[3]]))
    );
}

#[tokio::test]
async fn test_relayed_update_survives_cache_loss_during_storage_outage() {
    let f = faulty_hub();
    f.hub.create_room_with_id("r1").await.unwrap();
    let (alice, _alice_inbox) = join(&f.hub, "r1").await;
    let (_bob, mut bob_inbox) = join(&f.hub, "r1").await;

    f.hub.handle_update("r1", &alice, &[1]).await.unwrap();
    assert_eq!(bob_inbox.frames.recv().await.unwrap().as_ref(), &vec![1]);
    f.hub.clear_cache("r1").await;

    // Cold caches and no durable tier: the state comes from the log
    f.storage.set_down(true);
    f.hub.handle_update("r1", &alice, &[2]).await.unwrap();
    assert_eq!(bob_inbox.frames.recv().await.unwrap().as_ref(), &vec![2]);
    f.storage.set_down(false);

    f.hub.flush("r1").await.unwrap();
    let both = set_state(&[&[1], &[2]]);
    assert_eq!(f.storage.inner.load_snapshot("r1").await.unwrap(), Some(both.clone()));
    assert_eq!(f.hub.document_state("r1").await, both);
}

#[tokio::test]
async fn test_relayed_update_survives_full_outage() {
    let f = faulty_hub();
    f.hub.create_room_with_id("r1").await.unwrap();
    let (alice, _alice_inbox) = join(&f.hub, "r1").await;
    let (_bob, mut bob_inbox) = join(&f.hub, "r1").await;

    f.hub.handle_update("r1", &alice, &[1]).await.unwrap();
    assert_eq!(bob_inbox.frames.recv().await.unwrap().as_ref(), &vec![1]);
    f.hub.clear_cache("r1").await;

    // Neither tier answers: the update is merged onto the empty state
    f.storage.set_down(true);
    f.cache.set_down(true);
    let delivery = f.hub.handle_update("r1", &alice, &[2]).await.unwrap();
    assert_eq!(delivery.delivered, 1);
    assert_eq!(bob_inbox.frames.recv().await.unwrap().as_ref(), &vec![2]);

    // Nothing can be written while both are down
    assert!(f.hub.flush("r1").await.is_err());
    assert_eq!(f.hub.stats().dirty_rooms, 1);

    f.storage.set_down(false);
    f.cache.set_down(false);
    f.hub.flush("r1").await.unwrap();

    let both = set_state(&[&[1], &[2]]);
    assert_eq!(f.storage.inner.load_snapshot("r1").await.unwrap(), Some(both.clone()));
    assert!(f.cache.inner.updates_after("r1", 0).await.unwrap().is_empty());
    assert_eq!(f.hub.stats().dirty_rooms, 0);

    // A later joiner gets both updates
    let (_carol, mut carol_inbox) = join(&f.hub, "r1").await;
    assert_eq!(carol_inbox.frames.recv().await.unwrap().as_ref(), &both);
}

#[tokio::test]
async fn test_deleted_document_drops_pending_state() {
    let f = faulty_hub();
    f.hub.create_room_with_id("r1").await.unwrap();
    let (alice, _inbox) = join(&f.hub, "r1").await;
    f.hub.handle_update("r1", &alice, &[1]).await.unwrap();

    f.storage.inner.delete_document("r1").await.unwrap();
    assert!(matches!(
        f.hub.flush("r1").await,
        Err(docsync::CompactError::DocumentGone(_))
    ));
    assert_eq!(f.hub.stats().dirty_rooms, 0);
}

#[tokio::test]
async fn test_import_replaces_state_across_tiers() {
    let dir = tempdir().unwrap();
    let rocks = RocksDocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let hub = SyncHub::new(
        ServerConfig::for_testing(),
        Arc::new(MemorySharedCache::default()),
        Arc::new(rocks),
    );
    hub.create_room_with_id("r1").await.unwrap();
    let (alice, _inbox) = join(&hub, "r1").await;
    hub.handle_update("r1", &alice, &[1]).await.unwrap();

    let imported = set_state(&[b"fresh"]);
    let meta = hub.import_snapshot("r1", &imported).await.unwrap();
    assert!(meta.version >= 1);
    assert_eq!(hub.document_state("r1").await, imported);
    assert_eq!(
        hub.state_store().durable().load_snapshot("r1").await.unwrap(),
        Some(imported.clone())
    );

    hub.clear_cache("r1").await;
    assert_eq!(hub.document_state("r1").await, imported);
}
