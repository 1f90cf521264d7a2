use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{Identifier, ReplicaId};

/// Highest integrated counter per replica.
///
/// Entries only ever grow. A `BTreeMap` keeps the replicas sorted, which
/// is also the order the codec writes them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `replica` (0 if none).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.clocks.get(&replica).copied().unwrap_or(0)
    }

    /// Raise the entry for `replica` to `counter`. Lower values are ignored.
    pub fn advance(&mut self, replica: ReplicaId, counter: u64) {
        if counter == 0 {
            return;
        }
        let entry = self.clocks.entry(replica).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Whether `id` is already covered by this vector.
    pub fn covers(&self, id: &Identifier) -> bool {
        id.counter <= self.get(id.replica)
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, counter) in other.iter() {
            self.advance(replica, counter);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.clocks.iter().map(|(r, c)| (*r, *c))
    }

    /// Number of replicas tracked.
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, counter) in iter {
            sv.advance(replica, counter);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let mut sv = StateVector::new();
        sv.advance(ReplicaId(1), 5);
        sv.advance(ReplicaId(1), 3);
        assert_eq!(sv.get(ReplicaId(1)), 5);
        sv.advance(ReplicaId(1), 8);
        assert_eq!(sv.get(ReplicaId(1)), 8);
    }

    #[test]
    fn test_zero_counter_not_recorded() {
        let mut sv = StateVector::new();
        sv.advance(ReplicaId(1), 0);
        assert!(sv.is_empty());
    }

    #[test]
    fn test_covers() {
        let sv: StateVector = [(ReplicaId(1), 4)].into_iter().collect();
        assert!(sv.covers(&Identifier::new(ReplicaId(1), 4)));
        assert!(!sv.covers(&Identifier::new(ReplicaId(1), 5)));
        assert!(!sv.covers(&Identifier::new(ReplicaId(2), 1)));
    }

    #[test]
    fn test_merge_takes_maximum() {
        let mut a: StateVector = [(ReplicaId(1), 4), (ReplicaId(2), 1)].into_iter().collect();
        let b: StateVector = [(ReplicaId(1), 2), (ReplicaId(3), 7)].into_iter().collect();
        a.merge(&b);
        assert_eq!(a.get(ReplicaId(1)), 4);
        assert_eq!(a.get(ReplicaId(2)), 1);
        assert_eq!(a.get(ReplicaId(3)), 7);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_iter_sorted_by_replica() {
        let sv: StateVector = [(ReplicaId(9), 1), (ReplicaId(2), 1), (ReplicaId(5), 1)]
            .into_iter()
            .collect();
        let replicas: Vec<u64> = sv.iter().map(|(r, _)| r.0).collect();
        assert_eq!(replicas, vec![2, 5, 9]);
    }
}
