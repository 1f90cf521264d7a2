//! Ephemeral presence: who is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! local cursor / identity change
//!       │
//!       ▼
//! AwarenessStore::set_local_field()   (bumps local clock)
//!       │
//!       ▼
//! AwarenessUpdate { replica, clock, state }
//!       │
//!       ▼   (SyncMessage::Awareness broadcast)
//! remote AwarenessStore::apply_remote()  (newer clock wins)
//!       │
//!       ▼
//! AwarenessChange ──► UI
//! ```
//!
//! Each replica is the only writer of its own entry, so the per-replica
//! clock is enough to drop duplicates and stale reorderings; there is
//! nothing to merge. Nothing here is persisted.
//!
//! Entries that are not refreshed within the liveness threshold are
//! dropped by [`AwarenessStore::expire`]. Owners refresh them with a
//! heartbeat every third of the threshold.

use quill_text::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::ProtocolError;

/// Default liveness threshold.
pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_DISPLAY_NAME_CHARS: usize = 64;
const MAX_URL_CHARS: usize = 2048;
const MAX_CURSOR_OFFSET: usize = u32::MAX as usize;
/// Timeouts of silence after which a departed replica's clock is forgotten.
const CLOCK_RETENTION: u32 = 3;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// User identity supplied by the session provider. Not validated beyond size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// RGB color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Stable, vivid color derived from a replica id.
    ///
    /// Uses HSL with fixed saturation/lightness so every hue stays readable.
    pub fn from_replica(replica: ReplicaId) -> Self {
        let hue = (replica.as_u64() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl std::fmt::Display for CursorColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Selection in visible-text offsets of the sender's current text.
///
/// Offsets are not anchored to identifiers; they can point at the wrong
/// character once concurrent edits land upstream of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub anchor: usize,
    pub head: usize,
}

impl Cursor {
    pub fn caret(offset: usize) -> Self {
        Self { anchor: offset, head: offset }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Clamp both ends to a text of `len` characters.
    pub fn clamped(&self, len: usize) -> Self {
        Self {
            anchor: self.anchor.min(len),
            head: self.head.min(len),
        }
    }
}

/// Presence payload of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub identity: Identity,
    pub color: CursorColor,
    pub cursor: Option<Cursor>,
}

impl AwarenessState {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let name_len = self.identity.display_name.chars().count();
        if name_len == 0 || name_len > MAX_DISPLAY_NAME_CHARS {
            return Err(ProtocolError::InvalidPayload(format!(
                "display name must be 1..={MAX_DISPLAY_NAME_CHARS} characters"
            )));
        }
        if let Some(url) = &self.identity.avatar_url {
            if url.chars().count() > MAX_URL_CHARS {
                return Err(ProtocolError::InvalidPayload("avatar url too long".into()));
            }
        }
        if let Some(cursor) = &self.cursor {
            if cursor.anchor > MAX_CURSOR_OFFSET || cursor.head > MAX_CURSOR_OFFSET {
                return Err(ProtocolError::InvalidPayload("cursor offset out of range".into()));
            }
        }
        Ok(())
    }
}

/// One settable part of the local state.
#[derive(Debug, Clone, PartialEq)]
pub enum AwarenessField {
    Identity(Identity),
    Color(CursorColor),
    Cursor(Option<Cursor>),
}

// ───────────────────────────────────────────────────────────────────
// Wire message
// ───────────────────────────────────────────────────────────────────

/// Outbound/inbound presence event. `state: None` means the replica left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub replica: ReplicaId,
    /// Sender's monotonic per-replica counter.
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

impl AwarenessUpdate {
    pub fn is_leave(&self) -> bool {
        self.state.is_none()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if let Some(state) = &update.state {
            state.validate()?;
        }
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// A live presence entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub replica: ReplicaId,
    pub state: AwarenessState,
    pub clock: u64,
    pub last_seen_at: Instant,
}

/// What an inbound update or an expiry sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Per-session presence table.
pub struct AwarenessStore {
    local: ReplicaId,
    local_state: Option<AwarenessState>,
    local_clock: u64,
    local_updated_at: Instant,
    remote: HashMap<ReplicaId, AwarenessEntry>,
    /// Highest clock seen per remote replica and when it arrived. Kept
    /// after removal so a late, older update cannot bring an entry back.
    clocks: HashMap<ReplicaId, (u64, Instant)>,
    timeout: Duration,
}

impl AwarenessStore {
    /// Create the store with the local entry in place.
    pub fn new(local: ReplicaId, identity: Identity) -> Self {
        Self::with_timeout(local, identity, DEFAULT_AWARENESS_TIMEOUT)
    }

    pub fn with_timeout(local: ReplicaId, identity: Identity, timeout: Duration) -> Self {
        Self {
            local,
            local_state: Some(AwarenessState {
                identity,
                color: CursorColor::from_replica(local),
                cursor: None,
            }),
            local_clock: 0,
            local_updated_at: Instant::now(),
            remote: HashMap::new(),
            clocks: HashMap::new(),
            timeout,
        }
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local_state.as_ref()
    }

    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Refresh period owners should use.
    pub fn heartbeat_interval(&self) -> Duration {
        self.timeout / 3
    }

    /// The current local state as an outbound update (no clock bump).
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            replica: self.local,
            clock: self.local_clock,
            state: self.local_state.clone(),
        }
    }

    /// Change one local field and return the update to broadcast.
    ///
    /// The new state must pass the same validation peers apply on receipt;
    /// otherwise nothing changes and the error is returned.
    ///
    /// After [`remove_local`](Self::remove_local) the local entry is gone
    /// and setting a field re-creates it.
    pub fn set_local_field(&mut self, field: AwarenessField) -> Result<AwarenessUpdate, ProtocolError> {
        let local = self.local;
        let mut state = self.local_state.clone().unwrap_or_else(|| AwarenessState {
            identity: Identity::new(local.to_string(), format!("Peer-{local}")),
            color: CursorColor::from_replica(local),
            cursor: None,
        });
        match field {
            AwarenessField::Identity(identity) => state.identity = identity,
            AwarenessField::Color(color) => state.color = color,
            AwarenessField::Cursor(cursor) => state.cursor = cursor,
        }
        state.validate()?;

        self.local_state = Some(state);
        self.bump();
        Ok(self.local_update())
    }

    /// Re-emit the local state with a fresh clock. `None` after leaving.
    pub fn heartbeat(&mut self) -> Option<AwarenessUpdate> {
        self.local_state.as_ref()?;
        self.bump();
        Some(self.local_update())
    }

    /// Explicit leave.
    pub fn remove_local(&mut self) -> AwarenessUpdate {
        self.local_state = None;
        self.bump();
        self.local_update()
    }

    fn bump(&mut self) {
        self.local_clock += 1;
        self.local_updated_at = Instant::now();
    }

    /// Apply a peer's update if its clock is newer than anything seen.
    pub fn apply_remote(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        if update.replica == self.local {
            return change;
        }

        let seen = self.clocks.get(&update.replica).map_or(0, |(clock, _)| *clock);
        if update.clock <= seen {
            log::debug!(
                "Discarding stale awareness from {} (clock {} <= {seen})",
                update.replica,
                update.clock
            );
            return change;
        }
        self.clocks.insert(update.replica, (update.clock, now));

        match &update.state {
            Some(state) => {
                let entry = AwarenessEntry {
                    replica: update.replica,
                    state: state.clone(),
                    clock: update.clock,
                    last_seen_at: now,
                };
                match self.remote.insert(update.replica, entry) {
                    None => change.added.push(update.replica),
                    Some(previous) if previous.state != *state => change.updated.push(update.replica),
                    Some(_) => {}
                }
            }
            None => {
                if self.remote.remove(&update.replica).is_some() {
                    change.removed.push(update.replica);
                }
            }
        }
        change
    }

    /// Drop every remote entry not refreshed within the threshold.
    ///
    /// Clocks of replicas that have been gone for several thresholds are
    /// forgotten too, so the table does not grow with every past joiner.
    pub fn expire(&mut self, now: Instant) -> AwarenessChange {
        let timeout = self.timeout;
        let stale: Vec<ReplicaId> = self
            .remote
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen_at) > timeout)
            .map(|e| e.replica)
            .collect();

        for replica in &stale {
            self.remote.remove(replica);
            log::debug!("Awareness entry for {replica} expired");
        }

        let forget_after = timeout * CLOCK_RETENTION;
        let remote = &self.remote;
        self.clocks.retain(|replica, (_, seen_at)| {
            remote.contains_key(replica) || now.saturating_duration_since(*seen_at) <= forget_after
        });

        AwarenessChange { removed: stale, ..AwarenessChange::default() }
    }

    pub fn get(&self, replica: ReplicaId) -> Option<&AwarenessEntry> {
        self.remote.get(&replica)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// All live entries (local included), sorted by replica.
    pub fn snapshot(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<AwarenessEntry> = self.remote.values().cloned().collect();
        if let Some(state) = &self.local_state {
            entries.push(AwarenessEntry {
                replica: self.local,
                state: state.clone(),
                clock: self.local_clock,
                last_seen_at: self.local_updated_at,
            });
        }
        entries.sort_by_key(|e| e.replica);
        entries
    }
}

// ===================================================================
// Tests
// ===================================================================
