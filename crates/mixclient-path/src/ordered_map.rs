//! Ordered map with range lookup.
//!
//! A thin balanced-tree wrapper with no protocol knowledge; the topology
//! index keys it by [`NodeId`](mixclient_types::NodeId).

use std::collections::BTreeMap;
use std::ops::RangeBounds;

/// Ordered key/value store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderedMap<K: Ord, V> {
    tree: BTreeMap<K, V>,
}

impl<K: Ord, V> OrderedMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    /// Insert, returning the previous value for the key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.tree.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.tree.get(key)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Entries whose keys fall within `range`, ascending.
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl DoubleEndedIterator<Item = (&K, &V)> {
        self.tree.range(range)
    }

    /// Values in ascending key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.tree.values()
    }
}

impl<K: Ord, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OrderedMap<u32, &'static str> {
        let mut map = OrderedMap::new();
        for (k, v) in [(30, "c"), (10, "a"), (20, "b"), (40, "d")] {
            map.insert(k, v);
        }
        map
    }

    #[test]
    fn test_values_in_key_order() {
        let map = sample();
        let values: Vec<&str> = map.values().copied().collect();
        assert_eq!(values, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_range_query() {
        let map = sample();
        let mid: Vec<&str> = map.range(15..=30).map(|(_, v)| *v).collect();
        assert_eq!(mid, vec!["b", "c"]);
        let tail: Vec<u32> = map.range(35..).rev().map(|(k, _)| *k).collect();
        assert_eq!(tail, vec![40]);
    }

    #[test]
    fn test_insert_replace() {
        let mut map = sample();
        assert_eq!(map.insert(20, "B"), Some("b"));
        assert_eq!(map.get(&20), Some(&"B"));
        assert_eq!(map.insert(50, "e"), None);
        assert_eq!(map.len(), 5);
        assert!(!map.is_empty());
        assert!(OrderedMap::<u32, u32>::new().is_empty());
    }
}
