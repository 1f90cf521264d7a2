//! # quill-text: replicated plain-text engine
//!
//! Conflict-free sequence CRDT for collaborative text editing, plus the
//! binary codec used to ship its state between replicas and to storage.
//!
//! ```text
//! local edit ──► TextDoc::insert/delete ──► Delta ──► codec::encode_delta ──► bytes
//! bytes ──► codec::decode_delta ──► Delta ──► TextDoc::integrate ──► materialize()
//! ```
//!
//! ## Modules
//!
//! - [`id`]: replica ids, identifiers and the per-replica counter
//! - [`state_vector`]: "highest counter seen" summary per replica
//! - [`delta`]: items and tombstone sets exchanged between replicas
//! - [`doc`]: the sequence CRDT ([`TextDoc`])
//! - [`codec`]: deterministic binary encoding with strict decoding

pub mod codec;
pub mod delta;
pub mod doc;
pub mod error;
pub mod id;
pub mod state_vector;

pub use delta::{DeleteRange, DeleteSet, Delta, Item};
pub use doc::{IntegrationReport, TextDoc};
pub use error::{EncodingError, ProtocolViolation, TextError};
pub use id::{IdClock, Identifier, ReplicaId};
pub use state_vector::StateVector;
