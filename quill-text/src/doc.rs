//! Sequence CRDT for plain text.
//!
//! ## Layout
//!
//! ```text
//! head ──► Node { item, next } ──► Node { item, next } ──► ... ──► None
//! arena: Identifier ──► Node        (tombstones included)
//! ```
//!
//! The list is singly linked through identifiers stored in the arena, so
//! finding an origin is a hash lookup and linking a new item is constant
//! time. Origins are stored as identifiers, never as references, so the
//! list has no ownership cycles and every item serializes on its own.
//!
//! ## Integration
//!
//! A new item is placed by scanning from just after `origin_left` towards
//! `origin_right`. Items met on the way whose own origins also span the
//! insertion point are concurrent with it; they are skipped when their
//! identifier sorts first and otherwise the scan stops. Two replicas that
//! integrate the same set of concurrent inserts therefore end with the same
//! order regardless of arrival order.
//!
//! Items that arrive before their predecessor or origins are parked under
//! the one identifier they are waiting for and woken when it lands.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared
//! Editing on Extensible Data Types" (YATA), GROUP 2016

use std::collections::{HashMap, HashSet};

use crate::delta::{Delta, DeleteSet, Item};
use crate::error::{ProtocolViolation, TextError};
use crate::id::{IdClock, Identifier, ReplicaId};
use crate::state_vector::StateVector;

/// Outcome of [`TextDoc::integrate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationReport {
    /// Items placed into the list by this call (including released pending ones).
    pub integrated: usize,
    /// Items already known, ignored.
    pub duplicates: usize,
    /// Items still waiting for a missing origin or predecessor.
    pub pending: usize,
    /// Visible characters turned into tombstones.
    pub deleted: usize,
    /// Items rejected as contradicting local state.
    pub violations: Vec<ProtocolViolation>,
}

impl IntegrationReport {
    /// Whether the materialized text may have changed.
    pub fn changed(&self) -> bool {
        self.integrated > 0 || self.deleted > 0
    }
}

#[derive(Debug, Clone)]
struct Node {
    item: Item,
    /// Right neighbour in document order.
    next: Option<Identifier>,
}

/// Replicated text document.
///
/// Owns every item of the document. Mutation is synchronous and never
/// performs I/O; callers serialize access.
#[derive(Debug, Clone)]
pub struct TextDoc {
    clock: IdClock,
    arena: HashMap<Identifier, Node>,
    head: Option<Identifier>,
    state: StateVector,
    /// Every known deletion, including ones for items not yet received.
    deleted: DeleteSet,
    pending: HashMap<Identifier, Item>,
    /// Pending items keyed by the identifier they wait for.
    blocked: HashMap<Identifier, Vec<Identifier>>,
    visible_len: usize,
}

impl TextDoc {
    /// Empty document: only the implicit start/end sentinels.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            clock: IdClock::new(replica),
            arena: HashMap::new(),
            head: None,
            state: StateVector::new(),
            deleted: DeleteSet::new(),
            pending: HashMap::new(),
            blocked: HashMap::new(),
            visible_len: 0,
        }
    }

    /// Document holding `text` as initial content.
    ///
    /// The content is created under [`ReplicaId::SEED`] with a fixed
    /// origin chain, so replicas that seed the same text independently
    /// produce identical items and merge without duplication.
    pub fn seeded(replica: ReplicaId, text: &str) -> Self {
        let mut doc = Self::new(replica);
        let mut seed_clock = IdClock::new(ReplicaId::SEED);
        doc.insert_with_clock(&mut seed_clock, 0, text);
        doc
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.deleted
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    /// Items in the list, tombstones included.
    pub fn item_count(&self) -> usize {
        self.arena.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn item(&self, id: &Identifier) -> Option<&Item> {
        self.arena.get(id).map(|node| &node.item)
    }

    /// Concatenate the non-deleted items in list order.
    pub fn materialize(&self) -> String {
        let mut out = String::with_capacity(self.visible_len);
        for item in self.items().filter(|item| !item.deleted) {
            out.push_str(&item.content);
        }
        out
    }

    /// Insert `content` before the character at `offset` (tombstones ignored).
    ///
    /// `offset == len()` appends.
    pub fn insert(&mut self, offset: usize, content: &str) -> Result<Delta, TextError> {
        if offset > self.visible_len {
            return Err(TextError::OffsetOutOfBounds { offset, len: self.visible_len });
        }
        let mut clock = self.clock.clone();
        let delta = self.insert_with_clock(&mut clock, offset, content);
        self.clock = clock;
        Ok(delta)
    }

    fn insert_with_clock(&mut self, clock: &mut IdClock, offset: usize, content: &str) -> Delta {
        let chars: Vec<char> = content.chars().collect();
        let mut delta = Delta::new();
        let Some(first) = clock.next_run(chars.len() as u64) else {
            return delta;
        };

        let mut origin_left = if offset == 0 { None } else { self.visible_id(offset - 1) };
        let origin_right = self.next_of(origin_left);

        let mut report = IntegrationReport::default();
        for (k, ch) in chars.into_iter().enumerate() {
            let item = Item {
                id: Identifier::new(first.replica, first.counter + k as u64),
                origin_left,
                origin_right,
                content: ch.to_string(),
                deleted: false,
            };
            origin_left = Some(item.id);
            delta.items.push(item.clone());
            self.integrate_and_release(item, &mut report);
        }
        delta
    }

    /// Tombstone `length` visible characters starting at `offset`.
    pub fn delete(&mut self, offset: usize, length: usize) -> Result<Delta, TextError> {
        let in_bounds = offset
            .checked_add(length)
            .map_or(false, |end| end <= self.visible_len);
        if !in_bounds {
            return Err(TextError::RangeOutOfBounds { offset, length, len: self.visible_len });
        }

        let mut delta = Delta::new();
        if length == 0 {
            return Ok(delta);
        }

        let targets: Vec<Identifier> = self
            .items()
            .filter(|item| !item.deleted)
            .skip(offset)
            .take(length)
            .map(|item| item.id)
            .collect();
        for id in targets {
            if let Some(node) = self.arena.get_mut(&id) {
                node.item.deleted = true;
                delta.deleted.insert(id);
            }
        }

        self.visible_len -= length;
        self.deleted.merge(&delta.deleted);
        Ok(delta)
    }

    /// Merge a remote or replayed delta.
    ///
    /// Idempotent, commutative and associative: any arrival order and any
    /// number of repeats converge to the same list.
    pub fn integrate(&mut self, delta: &Delta) -> IntegrationReport {
        let mut report = IntegrationReport::default();

        for item in &delta.items {
            self.receive_item(item.clone(), &mut report);
        }

        if !delta.deleted.is_empty() {
            self.deleted.merge(&delta.deleted);
            // Items not integrated yet pick their tombstone up from `self.deleted`.
            for id in delta.deleted.ids_covered_by(&self.state) {
                let Some(node) = self.arena.get_mut(&id) else { continue };
                if !node.item.deleted {
                    node.item.deleted = true;
                    self.visible_len -= 1;
                    report.deleted += 1;
                }
            }
        }

        report.pending = self.pending.len();
        for violation in &report.violations {
            log::warn!("Rejected remote item: {violation}");
        }
        if report.pending > 0 {
            log::debug!("{} items waiting for missing dependencies", report.pending);
        }
        report
    }

    /// Everything `remote` has not seen, plus the complete delete set.
    pub fn diff(&self, remote: &StateVector) -> Delta {
        let mut items: Vec<Item> = self
            .arena
            .values()
            .map(|node| &node.item)
            .filter(|item| !remote.covers(&item.id))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Delta { items, deleted: self.deleted.clone() }
    }

    /// Full state as a delta against the empty state vector.
    pub fn encode_state(&self) -> Delta {
        self.diff(&StateVector::new())
    }

    /// Items in document order, tombstones included.
    fn items(&self) -> impl Iterator<Item = &Item> + '_ {
        let first = self.head.and_then(|id| self.arena.get(&id));
        std::iter::successors(first, move |node| node.next.and_then(|id| self.arena.get(&id)))
            .map(|node| &node.item)
    }

    /// Right neighbour of `id`, where `None` is the start sentinel.
    fn next_of(&self, id: Option<Identifier>) -> Option<Identifier> {
        match id {
            None => self.head,
            Some(id) => self.arena.get(&id).and_then(|node| node.next),
        }
    }

    fn receive_item(&mut self, item: Item, report: &mut IntegrationReport) {
        if item.origin_left == Some(item.id) || item.origin_right == Some(item.id) {
            report.violations.push(ProtocolViolation::SelfReference { id: item.id });
            return;
        }

        let known = self
            .arena
            .get(&item.id)
            .map(|node| &node.item)
            .or_else(|| self.pending.get(&item.id));
        if let Some(existing) = known {
            if existing.same_insert(&item) {
                report.duplicates += 1;
                if item.deleted && !self.deleted.contains(&item.id) {
                    self.tombstone_known(item.id, report);
                }
            } else {
                report.violations.push(ProtocolViolation::ConflictingItem { id: item.id });
            }
            return;
        }

        match self.missing_dependency(&item) {
            None => self.integrate_and_release(item, report),
            Some(waiting_for) => self.park(item, waiting_for),
        }
    }

    fn tombstone_known(&mut self, id: Identifier, report: &mut IntegrationReport) {
        self.deleted.insert(id);
        if let Some(node) = self.arena.get_mut(&id) {
            if !node.item.deleted {
                node.item.deleted = true;
                self.visible_len -= 1;
                report.deleted += 1;
            }
        } else if let Some(waiting) = self.pending.get_mut(&id) {
            waiting.deleted = true;
        }
    }

    /// First identifier `item` needs before it can be placed.
    ///
    /// Items from one replica integrate in counter order, so anything
    /// below the next expected counter is already in the arena.
    fn missing_dependency(&self, item: &Item) -> Option<Identifier> {
        let next_expected = self.state.get(item.id.replica) + 1;
        if item.id.counter > next_expected {
            return Some(Identifier::new(item.id.replica, item.id.counter - 1));
        }
        [item.origin_left, item.origin_right]
            .into_iter()
            .flatten()
            .find(|origin| !self.arena.contains_key(origin))
    }

    fn park(&mut self, item: Item, waiting_for: Identifier) {
        self.blocked.entry(waiting_for).or_default().push(item.id);
        self.pending.insert(item.id, item);
    }

    /// Place `item`, then every parked item that becomes ready as a result.
    fn integrate_and_release(&mut self, item: Item, report: &mut IntegrationReport) {
        let mut ready = vec![item];
        while let Some(item) = ready.pop() {
            let id = item.id;
            self.integrate_item(item);
            report.integrated += 1;

            let Some(waiters) = self.blocked.remove(&id) else { continue };
            for waiter in waiters {
                let Some(parked) = self.pending.get(&waiter) else { continue };
                match self.missing_dependency(parked) {
                    None => {
                        if let Some(parked) = self.pending.remove(&waiter) {
                            ready.push(parked);
                        }
                    }
                    Some(next) => self.blocked.entry(next).or_default().push(waiter),
                }
            }
        }
    }

    fn integrate_item(&mut self, mut item: Item) {
        let mut insert_after = item.origin_left;
        let mut before_origin: HashSet<Identifier> = HashSet::new();
        let mut conflicting: HashSet<Identifier> = HashSet::new();

        let mut cursor = self.next_of(item.origin_left);
        while let Some(current) = cursor {
            if Some(current) == item.origin_right {
                break;
            }
            let Some(node) = self.arena.get(&current) else { break };
            let o = &node.item;
            before_origin.insert(o.id);
            conflicting.insert(o.id);

            if o.origin_left == item.origin_left {
                if o.id < item.id {
                    insert_after = Some(o.id);
                    conflicting.clear();
                } else if o.origin_right == item.origin_right {
                    break;
                }
            } else if let Some(o_left) = o.origin_left.filter(|ol| before_origin.contains(ol)) {
                if !conflicting.contains(&o_left) {
                    insert_after = Some(o.id);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor = node.next;
        }

        if item.deleted {
            self.deleted.insert(item.id);
        } else if self.deleted.contains(&item.id) {
            item.deleted = true;
        }
        if !item.deleted {
            self.visible_len += 1;
        }

        self.state.advance(item.id.replica, item.id.counter);
        let next = self.next_of(insert_after);
        match insert_after {
            Some(left) => {
                if let Some(node) = self.arena.get_mut(&left) {
                    node.next = Some(item.id);
                }
            }
            None => self.head = Some(item.id),
        }
        self.arena.insert(item.id, Node { item, next });
    }

    /// Identifier of the `n`-th visible character.
    fn visible_id(&self, n: usize) -> Option<Identifier> {
        self.items().filter(|item| !item.deleted).nth(n).map(|item| item.id)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn doc(replica: u64) -> TextDoc {
        TextDoc::new(ReplicaId(replica))
    }

    /// Deliver every delta to every replica (including the author) until stable.
    fn sync_pair(a: &mut TextDoc, b: &mut TextDoc) {
        let to_b = a.diff(b.state_vector());
        let to_a = b.diff(a.state_vector());
        b.integrate(&to_b);
        a.integrate(&to_a);
    }

    #[test]
    fn test_empty_document() {
        let d = doc(1);
        assert_eq!(d.materialize(), "");
        assert!(d.is_empty());
        assert_eq!(d.item_count(), 0);
    }

    #[test]
    fn test_insert_and_materialize() {
        let mut d = doc(1);
        d.insert(0, "hello").unwrap();
        d.insert(5, " world").unwrap();
        d.insert(0, ">").unwrap();
        assert_eq!(d.materialize(), ">hello world");
        assert_eq!(d.len(), 12);
        assert_eq!(d.state_vector().get(ReplicaId(1)), 12);
    }

    #[test]
    fn test_insert_middle() {
        let mut d = doc(1);
        d.insert(0, "ac").unwrap();
        d.insert(1, "b").unwrap();
        assert_eq!(d.materialize(), "abc");
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let mut d = doc(1);
        d.insert(0, "ab").unwrap();
        let err = d.insert(3, "x").unwrap_err();
        assert_eq!(err, TextError::OffsetOutOfBounds { offset: 3, len: 2 });
    }

    #[test]
    fn test_append_at_length_uses_end_sentinel() {
        let mut d = doc(1);
        d.insert(0, "ab").unwrap();
        let delta = d.insert(2, "c").unwrap();
        assert_eq!(delta.items[0].origin_right, None);
        assert_eq!(delta.items[0].origin_left, Some(Identifier::new(ReplicaId(1), 2)));
    }

    #[test]
    fn test_multi_char_origins_chain() {
        let mut d = doc(1);
        d.insert(0, "xy").unwrap();
        let delta = d.insert(1, "abc").unwrap();
        let ids: Vec<Identifier> = delta.items.iter().map(|i| i.id).collect();
        assert_eq!(delta.items[0].origin_left, Some(Identifier::new(ReplicaId(1), 1)));
        assert_eq!(delta.items[1].origin_left, Some(ids[0]));
        assert_eq!(delta.items[2].origin_left, Some(ids[1]));
        for item in &delta.items {
            assert_eq!(item.origin_right, Some(Identifier::new(ReplicaId(1), 2)));
        }
        assert_eq!(d.materialize(), "xabcy");
    }

    #[test]
    fn test_unicode_offsets_count_chars() {
        let mut d = doc(1);
        d.insert(0, "héllo").unwrap();
        d.insert(2, "✓").unwrap();
        assert_eq!(d.materialize(), "hé✓llo");
        assert_eq!(d.len(), 6);
    }

    #[test]
    fn test_delete_keeps_tombstones_and_counters() {
        let mut d = doc(1);
        d.insert(0, "hello world").unwrap();
        let before = d.state_vector().clone();
        let delta = d.delete(5, 6).unwrap();
        assert_eq!(d.materialize(), "hello");
        assert_eq!(delta.deleted.len(), 6);
        assert!(delta.items.is_empty());
        assert_eq!(d.state_vector(), &before);
        assert_eq!(d.item_count(), 11);
    }

    #[test]
    fn test_delete_out_of_bounds() {
        let mut d = doc(1);
        d.insert(0, "abc").unwrap();
        assert!(d.delete(2, 2).is_err());
        assert!(d.delete(usize::MAX, 2).is_err());
        assert!(d.delete(3, 0).unwrap().is_empty());
    }

    #[test]
    fn test_delete_already_deleted_is_noop() {
        let mut a = doc(1);
        a.insert(0, "abc").unwrap();
        let del = a.delete(1, 1).unwrap();
        let report = a.integrate(&del);
        assert_eq!(report.deleted, 0);
        assert_eq!(a.materialize(), "ac");
    }

    #[test]
    fn test_remote_insert_roundtrip() {
        let mut a = doc(1);
        let mut b = doc(2);
        let delta = a.insert(0, "abc").unwrap();
        let report = b.integrate(&delta);
        assert_eq!(report.integrated, 3);
        assert_eq!(b.materialize(), "abc");
    }

    #[test]
    fn test_concurrent_inserts_same_position_converge() {
        let mut a = doc(1);
        let mut b = doc(2);
        let da = a.insert(0, "abc").unwrap();
        let db = b.insert(0, "xyz").unwrap();
        a.integrate(&db);
        b.integrate(&da);
        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.len(), 6);
        // Lower replica id sorts first among concurrent siblings.
        assert_eq!(a.materialize(), "abcxyz");
    }

    #[test]
    fn test_three_way_concurrent_inserts_any_order() {
        let mut base = doc(10);
        let seed = base.insert(0, "[]").unwrap();

        let mut deltas = Vec::new();
        for (replica, text) in [(3u64, "c"), (1, "a"), (2, "b")] {
            let mut r = doc(replica);
            r.integrate(&seed);
            deltas.push(r.insert(1, text).unwrap());
        }

        let orders = [[0, 1, 2], [2, 1, 0], [1, 0, 2], [1, 2, 0], [2, 0, 1], [0, 2, 1]];
        let mut results = Vec::new();
        for order in orders {
            let mut r = doc(99);
            r.integrate(&seed);
            for i in order {
                r.integrate(&deltas[i]);
            }
            results.push(r.materialize());
        }
        assert!(results.iter().all(|t| t == &results[0]));
        assert_eq!(results[0], "[abc]");
    }

    #[test]
    fn test_interleaving_with_concurrent_run_extension() {
        let mut a = doc(1);
        let mut b = doc(2);
        let base = a.insert(0, "ac").unwrap();
        b.integrate(&base);

        let d1 = a.insert(1, "1").unwrap();
        let d2 = a.insert(2, "2").unwrap();
        let d3 = b.insert(1, "X").unwrap();
        let d4 = b.insert(1, "Y").unwrap();

        a.integrate(&d3);
        a.integrate(&d4);
        b.integrate(&d2);
        b.integrate(&d1);
        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_idempotent_integration() {
        let mut a = doc(1);
        let mut b = doc(2);
        let d = a.insert(0, "hello").unwrap();
        b.integrate(&d);
        let once = b.materialize();
        let report = b.integrate(&d);
        assert_eq!(report.integrated, 0);
        assert_eq!(report.duplicates, 5);
        assert_eq!(b.materialize(), once);
    }

    #[test]
    fn test_commutative_integration() {
        let mut a = doc(1);
        let mut b = doc(2);
        let d1 = a.insert(0, "one ").unwrap();
        let d2 = b.insert(0, "two ").unwrap();

        let mut r1 = doc(3);
        r1.integrate(&d1);
        r1.integrate(&d2);
        let mut r2 = doc(4);
        r2.integrate(&d2);
        r2.integrate(&d1);
        assert_eq!(r1.materialize(), r2.materialize());
    }

    #[test]
    fn test_out_of_order_items_wait_for_dependencies() {
        let mut a = doc(1);
        let d1 = a.insert(0, "ab").unwrap();
        let d2 = a.insert(2, "cd").unwrap();

        let mut b = doc(2);
        let report = b.integrate(&d2);
        assert_eq!(report.integrated, 0);
        assert_eq!(report.pending, 2);
        assert_eq!(b.materialize(), "");

        let report = b.integrate(&d1);
        assert_eq!(report.integrated, 4);
        assert_eq!(report.pending, 0);
        assert_eq!(b.materialize(), "abcd");
    }

    #[test]
    fn test_delete_before_insert_arrives() {
        let mut a = doc(1);
        let ins = a.insert(0, "abc").unwrap();
        let del = a.delete(1, 1).unwrap();

        let mut b = doc(2);
        b.integrate(&del);
        assert_eq!(b.materialize(), "");
        b.integrate(&ins);
        assert_eq!(b.materialize(), "ac");
    }

    #[test]
    fn test_no_resurrection_after_concurrent_insert() {
        let mut a = doc(1);
        let mut b = doc(2);
        let base = a.insert(0, "0123456789").unwrap();
        b.integrate(&base);

        let del = a.delete(2, 3).unwrap();
        let ins = b.insert(8, "XY").unwrap();

        a.integrate(&ins);
        b.integrate(&del);
        assert_eq!(a.materialize(), "01567XY89");
        assert_eq!(a.materialize(), b.materialize());

        // Replaying the insert again must not bring anything back.
        a.integrate(&ins);
        assert_eq!(a.materialize(), "01567XY89");
    }

    #[test]
    fn test_insert_anchored_on_concurrently_deleted_char() {
        let mut a = doc(1);
        let mut b = doc(2);
        let base = a.insert(0, "abc").unwrap();
        b.integrate(&base);

        let del = a.delete(1, 1).unwrap();
        let ins = b.insert(2, "Z").unwrap();
        a.integrate(&ins);
        b.integrate(&del);
        assert_eq!(a.materialize(), "aZc");
        assert_eq!(b.materialize(), "aZc");
    }

    #[test]
    fn test_conflicting_identifier_rejected() {
        let mut a = doc(1);
        let good = a.insert(0, "ab").unwrap();
        let mut b = doc(2);
        b.integrate(&good);

        let mut forged = good.clone();
        forged.items[0].content = "Z".into();
        forged.items.push(Item {
            id: Identifier::new(ReplicaId(5), 1),
            origin_left: None,
            origin_right: None,
            content: "q".into(),
            deleted: false,
        });
        let report = b.integrate(&forged);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].id(), Identifier::new(ReplicaId(1), 1));
        assert_eq!(report.integrated, 1);
        assert!(b.materialize().contains("ab"));
        assert!(b.materialize().contains('q'));
    }

    #[test]
    fn test_self_referencing_item_rejected() {
        let id = Identifier::new(ReplicaId(4), 1);
        let mut delta = Delta::new();
        delta.items.push(Item {
            id,
            origin_left: Some(id),
            origin_right: None,
            content: "x".into(),
            deleted: false,
        });
        let mut d = doc(1);
        let report = d.integrate(&delta);
        assert_eq!(report.violations, vec![ProtocolViolation::SelfReference { id }]);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_diff_only_missing_items() {
        let mut a = doc(1);
        let mut b = doc(2);
        let first = a.insert(0, "abc").unwrap();
        b.integrate(&first);
        a.insert(3, "def").unwrap();

        let diff = a.diff(b.state_vector());
        assert_eq!(diff.items.len(), 3);
        b.integrate(&diff);
        assert_eq!(b.materialize(), "abcdef");
    }

    #[test]
    fn test_diff_carries_deletions_of_known_items() {
        let mut a = doc(1);
        let mut b = doc(2);
        let base = a.insert(0, "abc").unwrap();
        b.integrate(&base);
        a.delete(0, 1).unwrap();

        let diff = a.diff(b.state_vector());
        assert!(diff.items.is_empty());
        b.integrate(&diff);
        assert_eq!(b.materialize(), "bc");
    }

    #[test]
    fn test_encode_state_rebuilds_document() {
        let mut a = doc(1);
        a.insert(0, "hello world").unwrap();
        a.delete(0, 6).unwrap();
        let mut b = doc(2);
        b.integrate(&a.encode_state());
        assert_eq!(b.materialize(), "world");
        assert_eq!(b.item_count(), 11);
    }

    #[test]
    fn test_seeded_documents_merge_idempotently() {
        let mut a = TextDoc::seeded(ReplicaId(1), "Untitled");
        let mut b = TextDoc::seeded(ReplicaId(2), "Untitled");
        a.insert(8, "!").unwrap();
        sync_pair(&mut a, &mut b);
        assert_eq!(a.materialize(), "Untitled!");
        assert_eq!(b.materialize(), "Untitled!");
        assert_eq!(a.state_vector().get(ReplicaId::SEED), 8);
    }

    #[test]
    fn test_scenario_mutual_prefix_inserts() {
        let mut r1 = doc(1);
        let mut r2 = doc(2);
        r1.insert(0, "abc").unwrap();
        r2.insert(0, "xyz").unwrap();
        sync_pair(&mut r1, &mut r2);
        assert_eq!(r1.materialize().chars().count(), 6);
        assert_eq!(r1.materialize(), r2.materialize());
    }

    #[test]
    fn test_large_reversed_load_integrates_in_one_pass() {
        let mut a = doc(1);
        let mut b = doc(2);
        let chunk = "abcdefghijklmnopqrstuvwxyz0123456789".repeat(4);
        for round in 0..60 {
            let at = a.len() / 2;
            let d = a.insert(at, &chunk).unwrap();
            b.integrate(&d);
            let at = b.len() / 3;
            let d = b.insert(at, &chunk).unwrap();
            a.integrate(&d);
            if round % 5 == 0 {
                let d = a.delete(at, 10).unwrap();
                b.integrate(&d);
            }
        }
        assert_eq!(a.materialize(), b.materialize());
        assert!(a.item_count() > 17_000);

        // Highest counters first: every item but one has to be parked.
        let mut full = a.encode_state();
        full.items.reverse();
        let started = std::time::Instant::now();
        let mut fresh = doc(3);
        let report = fresh.integrate(&full);
        let elapsed = started.elapsed();

        assert_eq!(report.pending, 0);
        assert_eq!(report.integrated, a.item_count());
        assert_eq!(fresh.materialize(), a.materialize());
        assert!(elapsed < std::time::Duration::from_secs(5), "load took {elapsed:?}");
    }

    #[test]
    fn test_parked_item_waits_for_origin_from_other_replica() {
        let mut a = doc(1);
        let mut b = doc(2);
        let base = a.insert(0, "ab").unwrap();
        b.integrate(&base);
        let reply = b.insert(1, "X").unwrap();

        let mut c = doc(3);
        let report = c.integrate(&reply);
        assert_eq!(report.pending, 1);
        let report = c.integrate(&base);
        assert_eq!(report.integrated, 3);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.materialize(), "aXb");
    }
}
