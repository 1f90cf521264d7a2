//! Binary encoding of state vectors and deltas.
//!
//! Wire format (bincode standard config, varint integers):
//! ```text
//! StateVector: count │ (replica, counter)*            sorted by replica
//! Delta:       count │ Item* │ DeleteSet
//! Item:        id │ origin_left? │ origin_right? │ len+utf8 content │ deleted u8
//! DeleteSet:   count │ (replica, count │ (start, len)*)*
//! ```
//!
//! Decoding always produces a complete staging value before anything is
//! integrated, so a rejected buffer never touches document state.

use crate::delta::Delta;
use crate::error::EncodingError;
use crate::state_vector::StateVector;

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

pub fn encode_state_vector(sv: &StateVector) -> Result<Vec<u8>, EncodingError> {
    Ok(bincode::serde::encode_to_vec(sv, config())?)
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, EncodingError> {
    let (sv, read): (StateVector, usize) = bincode::serde::decode_from_slice(bytes, config())?;
    ensure_consumed(bytes, read)?;
    for (replica, counter) in sv.iter() {
        if counter == 0 {
            return Err(EncodingError::Malformed(format!(
                "zero counter for replica {replica}"
            )));
        }
    }
    Ok(sv)
}

pub fn encode_delta(delta: &Delta) -> Result<Vec<u8>, EncodingError> {
    Ok(bincode::serde::encode_to_vec(delta, config())?)
}

pub fn decode_delta(bytes: &[u8]) -> Result<Delta, EncodingError> {
    let (delta, read): (Delta, usize) = bincode::serde::decode_from_slice(bytes, config())?;
    ensure_consumed(bytes, read)?;
    validate_delta(&delta)?;
    Ok(delta)
}

fn ensure_consumed(bytes: &[u8], read: usize) -> Result<(), EncodingError> {
    if read < bytes.len() {
        return Err(EncodingError::TrailingBytes { extra: bytes.len() - read });
    }
    Ok(())
}

fn validate_delta(delta: &Delta) -> Result<(), EncodingError> {
    for item in &delta.items {
        let ids = std::iter::once(item.id)
            .chain(item.origin_left)
            .chain(item.origin_right);
        for id in ids {
            if id.counter == 0 {
                return Err(EncodingError::Malformed(format!("zero counter in item {}", item.id)));
            }
        }
        if item.content.chars().count() != 1 {
            return Err(EncodingError::Malformed(format!(
                "item {} must hold exactly one character",
                item.id
            )));
        }
    }
    for (replica, ranges) in delta.deleted.ranges() {
        for range in ranges {
            if range.len == 0 || range.start == 0 || range.start.checked_add(range.len).is_none() {
                return Err(EncodingError::Malformed(format!(
                    "invalid delete range {}+{} for replica {replica}",
                    range.start, range.len
                )));
            }
        }
    }
    Ok(())
}
