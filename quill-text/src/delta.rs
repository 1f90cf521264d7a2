//! Update deltas: items plus tombstone markers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{Identifier, ReplicaId};
use crate::state_vector::StateVector;

/// One inserted character.
///
/// `origin_left`/`origin_right` name the neighbours at insertion time;
/// `None` stands for the start/end sentinel respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Identifier,
    pub origin_left: Option<Identifier>,
    pub origin_right: Option<Identifier>,
    /// Exactly one `char`, UTF-8 encoded.
    pub content: String,
    pub deleted: bool,
}

impl Item {
    /// Same identity, content and anchors (ignores the tombstone flag).
    pub fn same_insert(&self, other: &Item) -> bool {
        self.id == other.id
            && self.origin_left == other.origin_left
            && self.origin_right == other.origin_right
            && self.content == other.content
    }
}

/// Contiguous run of deleted counters from one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRange {
    pub start: u64,
    pub len: u64,
}

impl DeleteRange {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    pub fn contains(&self, counter: u64) -> bool {
        counter >= self.start && counter < self.end()
    }
}

/// Tombstone markers, stored as sorted, coalesced ranges per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSet {
    ranges: BTreeMap<ReplicaId, Vec<DeleteRange>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Identifier) {
        self.insert_range(id.replica, id.counter, 1);
    }

    /// Add `len` counters from `start`, merging with any range it overlaps or touches.
    pub fn insert_range(&mut self, replica: ReplicaId, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);
        let ranges = self.ranges.entry(replica).or_default();
        let lo = ranges.partition_point(|r| r.end() < start);
        let hi = ranges.partition_point(|r| r.start <= end);

        let merged = if lo < hi {
            let first = ranges[lo].start.min(start);
            let last = ranges[hi - 1].end().max(end);
            DeleteRange { start: first, len: last - first }
        } else {
            DeleteRange { start, len: end - start }
        };
        ranges.splice(lo..hi, [merged]);
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.ranges.get(&id.replica).map_or(false, |ranges| {
            let at = ranges.partition_point(|r| r.end() <= id.counter);
            ranges.get(at).map_or(false, |r| r.contains(id.counter))
        })
    }

    pub fn merge(&mut self, other: &DeleteSet) {
        for (replica, ranges) in &other.ranges {
            for r in ranges {
                self.insert_range(*replica, r.start, r.len);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of deleted identifiers covered.
    pub fn len(&self) -> u64 {
        self.ranges.values().flatten().map(|r| r.len).sum()
    }

    pub fn ranges(&self) -> impl Iterator<Item = (ReplicaId, &[DeleteRange])> {
        self.ranges.iter().map(|(r, v)| (*r, v.as_slice()))
    }

    /// Deleted identifiers that `state` covers, in (replica, counter) order.
    ///
    /// Ranges reaching past what `state` has seen are cut short, so the
    /// walk is bounded by known items however wide a remote range claims
    /// to be.
    pub fn ids_covered_by<'a>(
        &'a self,
        state: &'a StateVector,
    ) -> impl Iterator<Item = Identifier> + 'a {
        self.ranges.iter().flat_map(move |(replica, ranges)| {
            let known = state.get(*replica);
            ranges
                .iter()
                .take_while(move |r| r.start <= known)
                .flat_map(move |r| {
                    let last = r.end().saturating_sub(1).min(known);
                    (r.start..=last).map(move |c| Identifier::new(*replica, c))
                })
        })
    }
}

/// Items (and tombstones) a peer does not have yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub items: Vec<Item>,
    pub deleted: DeleteSet,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deleted.is_empty()
    }

    /// Append another delta's contents to this one.
    pub fn merge(&mut self, other: Delta) {
        self.items.extend(other.items);
        self.deleted.merge(&other.deleted);
    }
}
