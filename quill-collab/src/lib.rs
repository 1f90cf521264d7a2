//! # quill-collab: live sessions for quill-text documents
//!
//! Connects a replicated [`quill_text::TextDoc`] to peers and to storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   SyncMessage    ┌───────────────┐   RelayFrame   ┌─────────────┐
//! │ SessionHandle│ ───────────────► │ SyncTransport │ ─────────────► │ RelayServer │
//! │ (per editor) │ ◄─────────────── │ hub/websocket │ ◄───────────── │ (fan-out)   │
//! └──────┬───────┘                  └───────────────┘                └─────────────┘
//!        │ commands
//!        ▼
//! ┌──────────────┐   load/save    ┌──────────────────┐
//! │ session task │ ─────────────► │ PersistenceStore │
//! │ TextDoc +    │                │ memory / RocksDB │
//! │ Awareness    │                └──────────────────┘
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary envelope for sync, update and presence messages
//! - [`awareness`]: ephemeral presence with clock-based recency and expiry
//! - [`transport`]: pub/sub trait, in-process hub, WebSocket client
//! - [`server`]: WebSocket relay
//! - [`storage`]: snapshot store trait, in-memory and RocksDB backends
//! - [`session`]: the per-document coordinator

pub mod awareness;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

pub use awareness::{
    AwarenessChange, AwarenessEntry, AwarenessField, AwarenessState, AwarenessStore,
    AwarenessUpdate, Cursor, CursorColor, Identity,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{
    SessionConfig, SessionError, SessionEvent, SessionHandle, SyncCoordinator, SyncState,
};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, PersistenceError, PersistenceStore,
    StoreConfig, StoreError,
};
pub use transport::{
    HubTransport, LocalHub, RelayFrame, Subscription, SubscriptionId, SyncTransport,
    TransportError, TransportEvent, WebSocketTransport,
};
