//! Durable document snapshots.
//!
//! ```text
//! ┌────────────────┐  load / save   ┌──────────────────────────────┐
//! │ SyncCoordinator│ ─────────────► │ dyn PersistenceStore         │
//! └────────────────┘                │  ├─ MemoryStore  (tests)     │
//!                                   │  └─ DocumentStore (RocksDB)  │
//!                                   └──────────────────────────────┘
//! ```
//!
//! A store only ever sees opaque blobs keyed by document id. Several
//! sessions may write the same key concurrently; the coordinator merges
//! what it reads before it writes, so a store needs no locking beyond
//! making each `save` atomic.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};

use async_trait::async_trait;
use uuid::Uuid;

/// Load/save failure as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Backend temporarily unreachable; worth retrying.
    Unavailable(String),
    Database(String),
    /// Stored bytes could not be read back.
    Corrupt(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            PersistenceError::Database(e) => write!(f, "Database error: {e}"),
            PersistenceError::Corrupt(e) => write!(f, "Corrupt snapshot: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Blob store keyed by document id.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// `Ok(None)` when nothing was ever saved for `doc_id`.
    async fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the stored blob atomically.
    async fn save(&self, doc_id: Uuid, bytes: &[u8]) -> Result<(), PersistenceError>;
}
