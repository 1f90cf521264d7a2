//! Sync message envelope exchanged over a transport channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬────────────┬──────────┐
//! │ msg_type │ sender    │ doc_id   │ target?    │ payload  │
//! │ 1 byte   │ varint    │ 16 bytes │ 1 + varint │ variable │
//! └──────────┴───────────┴──────────┴────────────┴──────────┘
//! ```
//!
//! Handshake over a broadcast channel:
//! ```text
//! joiner ── SyncStep1(sv) ─────────────────► everyone
//! peer   ── SyncStep2(diff) ── target=joiner ►
//! peer   ── SyncStep1(sv)   ── target=joiner ►
//! joiner ── SyncStep2(diff) ── target=peer ──►
//! ```
//!
//! A targeted `SyncStep1` is answered with a `SyncStep2` only, so the
//! exchange always terminates.

use quill_text::codec;
use quill_text::{Delta, EncodingError, ReplicaId, StateVector};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector: "this is what I have"
    SyncStep1 = 1,
    /// Diff answering a state vector
    SyncStep2 = 2,
    /// Incremental local edit
    Update = 3,
    /// Presence update, heartbeat or leave
    Awareness = 4,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub sender: ReplicaId,
    pub doc_id: Uuid,
    /// `None` = every subscriber of the channel.
    pub target: Option<ReplicaId>,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Untargeted state vector announcement (join or reconnect).
    pub fn sync_step1(sender: ReplicaId, doc_id: Uuid, sv: &StateVector) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep1,
            sender,
            doc_id,
            target: None,
            payload: codec::encode_state_vector(sv)?,
        })
    }

    /// State vector sent back to a specific joiner.
    pub fn sync_step1_reply(
        sender: ReplicaId,
        doc_id: Uuid,
        target: ReplicaId,
        sv: &StateVector,
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::sync_step1(sender, doc_id, sv)?;
        msg.target = Some(target);
        Ok(msg)
    }

    pub fn sync_step2(
        sender: ReplicaId,
        doc_id: Uuid,
        target: ReplicaId,
        diff: &Delta,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            sender,
            doc_id,
            target: Some(target),
            payload: codec::encode_delta(diff)?,
        })
    }

    pub fn update(sender: ReplicaId, doc_id: Uuid, delta: &Delta) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Update,
            sender,
            doc_id,
            target: None,
            payload: codec::encode_delta(delta)?,
        })
    }

    pub fn awareness(
        sender: ReplicaId,
        doc_id: Uuid,
        update: &AwarenessUpdate,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Awareness,
            sender,
            doc_id,
            target: None,
            payload: update.encode()?,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::DeserializationError(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }

    /// Whether this replica should look at the message at all.
    pub fn is_for(&self, me: ReplicaId, doc_id: Uuid) -> bool {
        self.doc_id == doc_id && self.sender != me && self.target.map_or(true, |t| t == me)
    }

    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.msg_type != MessageType::SyncStep1 {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(codec::decode_state_vector(&self.payload)?)
    }

    /// Decode the delta carried by `SyncStep2` or `Update`.
    pub fn delta(&self) -> Result<Delta, ProtocolError> {
        match self.msg_type {
            MessageType::SyncStep2 | MessageType::Update => Ok(codec::decode_delta(&self.payload)?),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let update = AwarenessUpdate::decode(&self.payload)?;
        if update.replica != self.sender {
            return Err(ProtocolError::InvalidPayload(format!(
                "awareness for {} sent by {}",
                update.replica, self.sender
            )));
        }
        Ok(update)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    Encoding(EncodingError),
    InvalidMessageType,
    InvalidPayload(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::Encoding(e) => write!(f, "{e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<EncodingError> for ProtocolError {
    fn from(e: EncodingError) -> Self {
        ProtocolError::Encoding(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessState, CursorColor, Identity};
    use quill_text::TextDoc;

    fn doc_with(text: &str) -> TextDoc {
        let mut doc = TextDoc::new(ReplicaId(1));
        doc.insert(0, text).unwrap();
        doc
    }

    #[test]
    fn test_update_roundtrip() {
        let mut doc = TextDoc::new(ReplicaId(1));
        let delta = doc.insert(0, "hi").unwrap();
        let doc_id = Uuid::new_v4();

        let msg = SyncMessage::update(ReplicaId(1), doc_id, &delta).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.sender, ReplicaId(1));
        assert_eq!(decoded.doc_id, doc_id);
        assert_eq!(decoded.target, None);
        assert_eq!(decoded.delta().unwrap(), delta);
    }

    #[test]
    fn test_sync_step1_roundtrip() {
        let doc = doc_with("abc");
        let msg = SyncMessage::sync_step1(ReplicaId(1), Uuid::nil(), doc.state_vector()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(&decoded.state_vector().unwrap(), doc.state_vector());
        assert!(decoded.delta().is_err());
    }

    #[test]
    fn test_step1_reply_is_targeted() {
        let doc = doc_with("abc");
        let msg = SyncMessage::sync_step1_reply(ReplicaId(1), Uuid::nil(), ReplicaId(2), doc.state_vector())
            .unwrap();
        assert_eq!(msg.target, Some(ReplicaId(2)));
    }

    #[test]
    fn test_sync_step2_carries_diff() {
        let doc = doc_with("abc");
        let diff = doc.diff(&StateVector::new());
        let msg = SyncMessage::sync_step2(ReplicaId(1), Uuid::nil(), ReplicaId(2), &diff).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::SyncStep2);
        assert_eq!(decoded.delta().unwrap().items.len(), 3);
    }

    #[test]
    fn test_is_for_filters() {
        let doc_id = Uuid::new_v4();
        let me = ReplicaId(5);
        let doc = doc_with("x");
        let broadcast = SyncMessage::sync_step1(ReplicaId(1), doc_id, doc.state_vector()).unwrap();
        assert!(broadcast.is_for(me, doc_id));
        assert!(!broadcast.is_for(me, Uuid::new_v4()));
        assert!(!broadcast.is_for(ReplicaId(1), doc_id));

        let mut targeted = broadcast.clone();
        targeted.target = Some(ReplicaId(6));
        assert!(!targeted.is_for(me, doc_id));
        targeted.target = Some(me);
        assert!(targeted.is_for(me, doc_id));
    }

    #[test]
    fn test_awareness_roundtrip() {
        let state = AwarenessState {
            identity: Identity::new("u-1", "Alice"),
            color: CursorColor::from_replica(ReplicaId(3)),
            cursor: None,
        };
        let update = AwarenessUpdate { replica: ReplicaId(3), clock: 4, state: Some(state) };
        let msg = SyncMessage::awareness(ReplicaId(3), Uuid::nil(), &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_awareness_spoofed_replica_rejected() {
        let update = AwarenessUpdate { replica: ReplicaId(9), clock: 1, state: None };
        let msg = SyncMessage::awareness(ReplicaId(3), Uuid::nil(), &update).unwrap();
        assert!(matches!(msg.awareness_update(), Err(ProtocolError::InvalidPayload(_))));
    }

    #[test]
    fn test_corrupt_delta_payload() {
        let doc = doc_with("abc");
        let mut msg = SyncMessage::update(ReplicaId(1), Uuid::nil(), &doc.encode_state()).unwrap();
        msg.payload.truncate(msg.payload.len() - 1);
        assert!(matches!(msg.delta(), Err(ProtocolError::Encoding(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
    }
}
