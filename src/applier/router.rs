//! Conflict-key routing
//!
//! Routes entries to writers by hashing their conflict key with SipHash.
//! Entries sharing a key always land on the same writer.

use crate::oplog::{ConflictKey, OplogEntry};
use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

/// Routes conflict keys to writer indexes
pub struct ConflictRouter {
    num_writers: usize,
}

impl ConflictRouter {
    /// Create a new router
    pub fn new(num_writers: usize) -> Self {
        assert!(num_writers > 0, "Number of writers must be > 0");
        ConflictRouter { num_writers }
    }

    /// Route a conflict key to a writer index
    pub fn route_key(&self, key: &ConflictKey) -> usize {
        let mut hasher = SipHasher13::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.num_writers
    }

    /// Route an entry; keyless entries go to writer 0
    pub fn route_entry(&self, entry: &OplogEntry) -> usize {
        entry
            .conflict_key()
            .map(|key| self.route_key(&key))
            .unwrap_or(0)
    }

    /// Split entries into one ordered group per writer
    pub fn partition(&self, entries: Vec<OplogEntry>) -> Vec<Vec<OplogEntry>> {
        let mut groups: Vec<Vec<OplogEntry>> = (0..self.num_writers).map(|_| Vec::new()).collect();
        for entry in entries {
            let writer = self.route_entry(&entry);
            groups[writer].push(entry);
        }
        groups
    }

    pub fn num_writers(&self) -> usize {
        self.num_writers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OpTime;
    use serde_json::json;

    fn key(i: usize) -> ConflictKey {
        ConflictKey {
            namespace: "app.c".to_string(),
            id: format!("doc_{}", i),
        }
    }

    #[test]
    fn test_routing_deterministic() {
        let router = ConflictRouter::new(4);
        assert_eq!(router.route_key(&key(1)), router.route_key(&key(1)));
    }

    #[test]
    fn test_routing_distribution() {
        let router = ConflictRouter::new(4);
        let mut counts = vec![0; 4];
        for i in 0..1000 {
            counts[router.route_key(&key(i))] += 1;
        }
        for count in counts {
            assert!(count > 150 && count < 350, "Uneven distribution: {}", count);
        }
    }

    #[test]
    fn test_partition_keeps_same_key_in_order() {
        let router = ConflictRouter::new(3);
        let entries: Vec<OplogEntry> = (1..=30)
            .map(|i| OplogEntry::update(OpTime::new(i, 0, 1), "app.c", json!(i % 4), json!({"n": i})))
            .collect();

        let groups = router.partition(entries);
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 30);

        for group in &groups {
            // every key present in a group appears only in that group, in op_time order
            let mut last_seen = std::collections::HashMap::new();
            for entry in group {
                let k = entry.conflict_key().unwrap();
                if let Some(prev) = last_seen.insert(k, entry.op_time) {
                    assert!(prev < entry.op_time);
                }
            }
        }
    }

    #[test]
    fn test_keyless_entries_route_to_first_writer() {
        let router = ConflictRouter::new(8);
        assert_eq!(router.route_entry(&OplogEntry::noop(OpTime::new(1, 0, 1))), 0);
    }
}
