//! # docsync: real-time document synchronization
//!
//! Clients stream binary updates over WebSocket; the server merges them into
//! per-room state, relays them to every other participant and persists the
//! accumulated state through a tiered store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   /ws/yjs/{room}   ┌─────────────┐
//! │ Client      │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │   binary updates   │ (accept)    │
//! └─────────────┘                    └──────┬──────┘
//!                                           │ one task per session
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │ SyncHub     │
//!                                    └──────┬──────┘
//!               ┌──────────────┬────────────┼──────────────┐
//!               ▼              ▼            ▼              ▼
//!        RoomRegistry   UpdateBroadcaster  StateStore  SnapshotCompactor
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: rooms and their live sessions, one guard per room
//! - [`broadcast`]: update validation, merge, persistence and fan-out
//! - [`storage`]: local / shared / durable state tiers
//! - [`merge`]: pluggable merge engines (Yrs, update set)
//! - [`compactor`]: durable snapshots with retry and backoff
//! - [`session`]: per-connection lifecycle
//! - [`protocol`]: room addressing and close codes
//! - [`hub`]: composition root, operational API, maintenance
//! - [`server`]: accept loop and shutdown
//! - [`config`]: server configuration

pub mod broadcast;
pub mod compactor;
pub mod config;
pub mod hub;
pub mod merge;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{Delivery, UpdateBroadcaster, UpdateError};
pub use compactor::{CompactError, FlushOutcome, SnapshotCompactor};
pub use config::{ConfigError, LogRetention, MergeKind, RetryPolicy, ServerConfig};
pub use hub::{HubError, HubStats, MaintenanceReport, SyncHub};
pub use merge::{engine_for, MergeEngine, MergeError, UpdateSetMerge, YrsMerge};
pub use protocol::{resolve_room_id, CloseReason, RoomIdError};
pub use registry::{RoomGuard, RoomRegistry};
pub use server::{ServerError, SyncServer};
pub use session::{SessionHandle, SessionId, SessionState};
pub use storage::{
    CacheError, DocumentStorage, MemoryDocumentStore, MemorySharedCache, RocksDocumentStore,
    SharedCache, SnapshotMetadata, StateStore, StorageError, StoreConfig, Tier,
};
