//! The TTL Index: an in-memory min-heap of `(expiry, key)` pairs plus a
//! liveness map, used by the cleanup loop to find expired keys cheaply
//! without paying an O(log n) physical delete on cancellation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tether_core::document::RESERVED_KEY_PREFIX;

/// Prefix distinguishing a TTL side entry from a regular Record key in
/// the BTree Layer's shared key space.
pub fn ttl_prefix() -> &'static [u8] {
    const PREFIX: [u8; 5] = [RESERVED_KEY_PREFIX, b't', b't', b'l', b':'];
    &PREFIX
}

/// Builds the BTree key a TTL side entry for `key` is stored under.
pub fn side_entry_key(key: &str) -> Vec<u8> {
    let mut out = ttl_prefix().to_vec();
    out.extend_from_slice(key.as_bytes());
    out
}

/// Recovers the original record key from a TTL side entry's BTree key.
pub fn record_key_from_side_entry(side_key: &[u8]) -> Option<&str> {
    side_key
        .strip_prefix(ttl_prefix())
        .and_then(|rest| std::str::from_utf8(rest).ok())
}

/// Encodes an expiry (epoch seconds) as the fixed 8-byte big-endian
/// value a TTL side entry's BTree value holds.
#[must_use]
pub fn encode_expiry(expiry_epoch_seconds: u64) -> [u8; 8] {
    expiry_epoch_seconds.to_be_bytes()
}

#[must_use]
pub fn decode_expiry(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// In-memory min-heap over `(expiry, key)`, with O(1) logical
/// cancellation and opportunistic compaction of dead heap entries.
#[derive(Default)]
pub struct TtlIndex {
    heap: BinaryHeap<Reverse<(u64, String)>>,
    live: HashMap<String, u64>,
}

impl TtlIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` as expiring at `expiry`. A prior live TTL for the
    /// same key is superseded: its old heap entry becomes dead and is
    /// skipped on pop.
    pub fn insert(&mut self, key: String, expiry: u64) {
        self.live.insert(key.clone(), expiry);
        self.heap.push(Reverse((expiry, key)));
    }

    /// Logically cancels `key`'s TTL, if any. The physical heap entry,
    /// if already pushed, is left to be skipped lazily on pop.
    pub fn cancel(&mut self, key: &str) {
        self.live.remove(key);
    }

    /// Returns `key`'s current live expiry, if it carries a TTL.
    #[must_use]
    pub fn expiry_of(&self, key: &str) -> Option<u64> {
        self.live.get(key).copied()
    }

    #[must_use]
    pub fn is_expired(&self, key: &str, now: u64) -> bool {
        self.live.get(key).is_some_and(|expiry| *expiry <= now)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Pops every heap entry whose expiry is `<= now` that is still
    /// live, yielding its key. Dead entries (cancelled, or superseded
    /// by a later `insert`) are discarded without being yielded.
    ///
    /// Compacts the heap when the dead fraction exceeds 50%.
    pub fn pop_expired(&mut self, now: u64) -> Vec<String> {
        let mut expired = Vec::new();

        while let Some(Reverse((expiry, _))) = self.heap.peek() {
            if *expiry > now {
                break;
            }
            let Reverse((expiry, key)) = self.heap.pop().unwrap();
            if self.live.get(&key) == Some(&expiry) {
                self.live.remove(&key);
                expired.push(key);
            }
        }

        self.maybe_compact();
        expired
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() > self.live.len().saturating_mul(2).max(16) {
            self.heap = self
                .live
                .iter()
                .map(|(key, expiry)| Reverse((*expiry, key.clone())))
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_expired_respects_liveness_and_ordering() {
        let mut index = TtlIndex::new();
        index.insert("a".to_string(), 10);
        index.insert("b".to_string(), 5);
        index.insert("c".to_string(), 20);

        assert_eq!(index.pop_expired(7), vec!["b".to_string()]);
        assert_eq!(index.pop_expired(10), vec!["a".to_string()]);
        assert!(index.pop_expired(10).is_empty());
        assert_eq!(index.pop_expired(20), vec!["c".to_string()]);
    }

    #[test]
    fn cancel_makes_a_heap_entry_dead_without_a_physical_remove() {
        let mut index = TtlIndex::new();
        index.insert("a".to_string(), 5);
        index.cancel("a");
        assert!(index.pop_expired(100).is_empty());
    }

    #[test]
    fn reinsert_supersedes_the_prior_heap_entry() {
        let mut index = TtlIndex::new();
        index.insert("a".to_string(), 5);
        index.insert("a".to_string(), 50);
        assert!(index.pop_expired(10).is_empty());
        assert_eq!(index.pop_expired(50), vec!["a".to_string()]);
    }

    #[test]
    fn side_entry_key_round_trips_the_record_key() {
        let key = side_entry_key("user-42");
        assert_eq!(record_key_from_side_entry(&key), Some("user-42"));
    }

    #[test]
    fn expiry_byte_encoding_round_trips() {
        let bytes = encode_expiry(1_700_000_000);
        assert_eq!(decode_expiry(&bytes), Some(1_700_000_000));
    }

    #[test]
    fn compaction_keeps_the_heap_bounded_by_dead_fraction() {
        let mut index = TtlIndex::new();
        for i in 0..100 {
            index.insert("k".to_string(), i); // repeated key: each insert deadens the last
        }
        index.pop_expired(0);
        assert!(index.heap.len() <= index.live.len().saturating_mul(2).max(16));
    }

    proptest::proptest! {
        /// Whatever `pop_expired` yields at `now` is a subset of keys
        /// whose live expiry is `<= now`, for an arbitrary sequence of
        /// inserts and cancels.
        #[test]
        fn pop_expired_never_yields_an_unexpired_key(
            ops in proptest::collection::vec(
                (proptest::sample::select(vec!["a", "b", "c", "d"]), 0u64..50, proptest::bool::ANY),
                1..100,
            ),
            now in 0u64..50,
        ) {
            let mut index = TtlIndex::new();
            let mut model: std::collections::HashMap<&str, u64> = std::collections::HashMap::new();

            for (key, expiry, cancel) in ops {
                if cancel {
                    index.cancel(key);
                    model.remove(key);
                } else {
                    index.insert(key.to_string(), expiry);
                    model.insert(key, expiry);
                }
            }

            for key in index.pop_expired(now) {
                let expiry = model.get(key.as_str()).copied();
                prop_assert!(expiry.is_some_and(|expiry| expiry <= now));
            }
        }
    }
}
