//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── RoomRegistry (per-room guards)
//!            ├── /ws/yjs/{room} ──► SyncHub ── UpdateBroadcaster ──► other sessions
//! Client B ──┘                       │
//!                                    ├── StateStore
//!                                    │     ├── local (DashMap)
//!                                    │     ├── shared cache (TTL + update log)
//!                                    │     └── DocumentStorage (RocksDB, LZ4)
//!                                    │
//!                                    └── SnapshotCompactor (maintenance task)
//! ```
//!
//! One tokio task per connection, one maintenance task per server. Shutdown
//! is a `watch` flag seen by the accept loop, every session and the
//! maintenance task, which flushes all dirty rooms on the way out.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{ConfigError, ServerConfig};
use crate::hub::{HubError, SyncHub};
use crate::session::serve_connection;
use crate::storage::{
    DocumentStorage, MemoryDocumentStore, MemorySharedCache, RocksDocumentStore, SharedCache,
    StorageError, StoreConfig,
};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to create seed room: {0}")]
    Seed(#[from] HubError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The sync server.
pub struct SyncServer {
    hub: Arc<SyncHub>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server; opens RocksDB when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let durable: Arc<dyn DocumentStorage> = match &config.storage_path {
            Some(path) => {
                let store = RocksDocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Durable storage at {}", path.display());
                Arc::new(store)
            }
            None => {
                log::info!("No storage path configured, documents are kept in memory");
                Arc::new(MemoryDocumentStore::new())
            }
        };
        let shared = Arc::new(MemorySharedCache::new(config.log_retention.clone()));

        Self::with_components(config, shared, durable)
    }

    /// Create a server over explicit cache and storage collaborators.
    pub fn with_components(
        config: ServerConfig,
        shared: Arc<dyn SharedCache>,
        durable: Arc<dyn DocumentStorage>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            hub: Arc::new(SyncHub::new(config, shared, durable)),
            shutdown,
        })
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.hub.config().bind_addr).await?;
        Ok(listener)
    }

    /// Serve connections from `listener` until `shutdown` is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        for room_id in &self.hub.config().seed_rooms {
            self.hub.create_room_with_id(room_id).await?;
        }

        let local_addr = listener.local_addr()?;
        log::info!(
            "Sync server listening on ws://{local_addr}{}/{{room}}",
            self.hub.config().path_prefix
        );

        let maintenance = self.hub.spawn_maintenance(self.shutdown.subscribe());
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        log::info!("Sync server on {local_addr} shutting down");
        if let Err(e) = maintenance.await {
            log::error!("Maintenance task failed: {e}");
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        log::debug!("New TCP connection from {peer}");
        let hub = Arc::clone(&self.hub);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, hub, shutdown).await {
                log::error!("Connection error from {peer}: {e}");
            }
        });
    }

    /// Stop accepting, close every session and run a final flush.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
