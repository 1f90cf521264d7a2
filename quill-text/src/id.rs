//! Globally unique operation identifiers.
//!
//! Every inserted character is tagged with an [`Identifier`]: the replica
//! that created it plus a per-replica counter. Identifiers are totally
//! ordered (replica first, then counter) and that order is the only
//! tie-break used when concurrent inserts land on the same position.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, comparable replica token.
///
/// One is drawn per document session. Counters restart at 1 for every
/// replica, so a replica id must never be reused across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Reserved replica for deterministic initial content.
    pub const SEED: ReplicaId = ReplicaId(0);

    /// Draw a fresh random replica id (never [`ReplicaId::SEED`]).
    pub fn random() -> Self {
        loop {
            let (hi, lo) = Uuid::new_v4().as_u64_pair();
            let raw = hi ^ lo;
            if raw != Self::SEED.0 {
                return Self(raw);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// (replica, counter) pair. Immutable once assigned.
///
/// The derived ordering compares `replica` first, then `counter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl Identifier {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

/// Per-replica identifier allocator.
///
/// Counters start at 1; 0 means "nothing allocated yet" so that a state
/// vector entry of 0 covers no identifiers.
#[derive(Debug, Clone)]
pub struct IdClock {
    replica: ReplicaId,
    counter: u64,
}

impl IdClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self { replica, counter: 0 }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Highest counter handed out so far.
    pub fn current(&self) -> u64 {
        self.counter
    }

    pub fn next(&mut self) -> Identifier {
        self.counter += 1;
        Identifier::new(self.replica, self.counter)
    }

    /// Allocate `len` consecutive identifiers, returning the first.
    ///
    /// Returns `None` for an empty run.
    pub fn next_run(&mut self, len: u64) -> Option<Identifier> {
        if len == 0 {
            return None;
        }
        let first = Identifier::new(self.replica, self.counter + 1);
        self.counter += len;
        Some(first)
    }
}
