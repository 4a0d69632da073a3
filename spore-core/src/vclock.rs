//! Vector clocks: per-replica counters summarising causal knowledge.
//!
//! Encoded on the wire as a JSON object keyed by the decimal replica id:
//! `{"17": 3, "42": 1}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fact::ReplicaId;
use crate::oplog::LogError;

/// Highest counter seen for each replica.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
#[serde(transparent)]
pub struct VClock {
    counters: BTreeMap<ReplicaId, u64>,
}

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `replica`, zero when never seen.
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.counters.get(&replica).copied().unwrap_or(0)
    }

    /// Record that `counter` has been seen for `replica`. Never decreases.
    pub fn observe(&mut self, replica: ReplicaId, counter: u64) {
        self.counters
            .entry(replica)
            .and_modify(|c| *c = (*c).max(counter))
            .or_insert(counter);
    }

    /// Bump the counter of `replica` and return the new value.
    pub fn increment(&mut self, replica: ReplicaId) -> u64 {
        let counter = self.counters.entry(replica).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &Self) {
        for (replica, counter) in other.iter() {
            self.observe(*replica, *counter);
        }
    }

    /// Does `self` know everything `other` knows?
    pub fn dominates(&self, other: &Self) -> bool {
        other.iter().all(|(replica, counter)| self.get(*replica) >= *counter)
    }

    /// Can this clock offer newer facts to `other`?
    pub fn has_news_for(&self, other: &Self) -> bool {
        !other.dominates(self)
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, ReplicaId, u64> {
        self.counters.iter()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn to_json(&self) -> Result<String, LogError> {
        serde_json::to_string(self).map_err(|e| LogError::Encoding(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, LogError> {
        serde_json::from_str(json).map_err(|e| LogError::Encoding(e.to_string()))
    }
}

impl FromIterator<(ReplicaId, u64)> for VClock {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut clock = Self::new();
        for (replica, counter) in iter {
            clock.observe(replica, counter);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_decreases() {
        let mut clock = VClock::new();
        clock.observe(ReplicaId(1), 5);
        clock.observe(ReplicaId(1), 3);
        assert_eq!(clock.get(ReplicaId(1)), 5);
    }

    #[test]
    fn test_unknown_replica_is_zero() {
        assert_eq!(VClock::new().get(ReplicaId(9)), 0);
    }

    #[test]
    fn test_increment() {
        let mut clock = VClock::new();
        assert_eq!(clock.increment(ReplicaId(1)), 1);
        assert_eq!(clock.increment(ReplicaId(1)), 2);
        assert_eq!(clock.get(ReplicaId(1)), 2);
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut a: VClock = [(ReplicaId(1), 3), (ReplicaId(2), 1)].into_iter().collect();
        let b: VClock = [(ReplicaId(1), 1), (ReplicaId(3), 4)].into_iter().collect();
        a.merge(&b);
        assert_eq!(a.get(ReplicaId(1)), 3);
        assert_eq!(a.get(ReplicaId(2)), 1);
        assert_eq!(a.get(ReplicaId(3)), 4);
    }

    #[test]
    fn test_dominates_and_news() {
        let a: VClock = [(ReplicaId(1), 3)].into_iter().collect();
        let b: VClock = [(ReplicaId(1), 2)].into_iter().collect();
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.has_news_for(&b));
        assert!(!b.has_news_for(&a));
        assert!(a.dominates(&VClock::new()));
    }

    #[test]
    fn test_json_keys_are_decimal_strings() {
        let clock: VClock = [(ReplicaId(17), 3), (ReplicaId(42), 1)].into_iter().collect();
        let json = clock.to_json().unwrap();
        assert_eq!(json, r#"{"17":3,"42":1}"#);
        assert_eq!(VClock::from_json(&json).unwrap(), clock);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(VClock::from_json("not a clock").is_err());
    }
}
