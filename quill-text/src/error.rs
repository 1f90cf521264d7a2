use crate::id::Identifier;

/// Local edit errors. These are programmer errors (bad offsets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextError {
    OffsetOutOfBounds { offset: usize, len: usize },
    RangeOutOfBounds { offset: usize, length: usize, len: usize },
}

impl std::fmt::Display for TextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextError::OffsetOutOfBounds { offset, len } => {
                write!(f, "Offset {offset} out of bounds for text of length {len}")
            }
            TextError::RangeOutOfBounds { offset, length, len } => write!(
                f,
                "Range {offset}..{} out of bounds for text of length {len}",
                offset + length
            ),
        }
    }
}

impl std::error::Error for TextError {}

/// Malformed or truncated wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    Truncated,
    TrailingBytes { extra: usize },
    Malformed(String),
    Serialization(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::Truncated => write!(f, "Encoding error: input truncated"),
            EncodingError::TrailingBytes { extra } => {
                write!(f, "Encoding error: {extra} trailing bytes")
            }
            EncodingError::Malformed(e) => write!(f, "Encoding error: {e}"),
            EncodingError::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<bincode::error::DecodeError> for EncodingError {
    fn from(e: bincode::error::DecodeError) -> Self {
        match e {
            bincode::error::DecodeError::UnexpectedEnd { .. } => EncodingError::Truncated,
            other => EncodingError::Malformed(other.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for EncodingError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EncodingError::Serialization(e.to_string())
    }
}

/// A remote item that contradicts what this replica already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Identifier reused with different content or origins.
    ConflictingItem { id: Identifier },
    /// Origin names the item itself.
    SelfReference { id: Identifier },
}

impl ProtocolViolation {
    pub fn id(&self) -> Identifier {
        match self {
            ProtocolViolation::ConflictingItem { id } => *id,
            ProtocolViolation::SelfReference { id } => *id,
        }
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::ConflictingItem { id } => {
                write!(f, "Protocol violation: identifier {id} reused with different content")
            }
            ProtocolViolation::SelfReference { id } => {
                write!(f, "Protocol violation: item {id} uses itself as origin")
            }
        }
    }
}

impl std::error::Error for ProtocolViolation {}
