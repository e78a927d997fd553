//! Ordered byte store.
//!
//! Every lifecycle keyspace is a key prefix inside one `KvStore`. Iteration is
//! always in ascending byte order, which is what makes multi-key reads
//! (expiration sweeps, TWAP releases, warm start) identical on every replica.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordered key-value store.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Returns whether the key existed.
    fn delete(&mut self, key: &[u8]) -> bool;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Entries in `[start, end)` in ascending key order. `None` means unbounded.
    fn range(&self, start: &[u8], end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Entries whose key starts with `prefix`, in ascending key order.
    fn prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let end = prefix_end(prefix);
        self.range(prefix, end.as_deref())
    }
}

/// Smallest key greater than every key starting with `prefix`.
///
/// `None` when the prefix is all `0xff` (no upper bound).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// In-memory `KvStore` backed by a `BTreeMap`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hex rendering of every entry under `prefix`, one `key=value` per line.
    pub fn dump_prefix(&self, prefix: &[u8]) -> Vec<String> {
        self.prefix(prefix)
            .into_iter()
            .map(|(k, v)| format!("{}={}", hex::encode(k), hex::encode(v)))
            .collect()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.entries.remove(key).is_some()
    }

    fn has(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    fn range(&self, start: &[u8], end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let upper = match end {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        self.entries
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_prefix_iteration_is_ordered_and_bounded() {
        let mut store = MemStore::new();
        store.set(b"b/2".to_vec(), vec![2]);
        store.set(b"a/9".to_vec(), vec![9]);
        store.set(b"b/1".to_vec(), vec![1]);
        store.set(b"c/0".to_vec(), vec![0]);

        let keys: Vec<Vec<u8>> = store.prefix(b"b/").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b/1".to_vec(), b"b/2".to_vec()]);
    }

    #[test]
    fn test_delete_reports_existence() {
        let mut store = MemStore::new();
        store.set(b"k".to_vec(), vec![1]);
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_range_excludes_end() {
        let mut store = MemStore::new();
        for i in 0u8..5 {
            store.set(vec![i], vec![i]);
        }
        let got: Vec<u8> = store.range(&[1], Some(&[3])).into_iter().map(|(k, _)| k[0]).collect();
        assert_eq!(got, vec![1, 2]);
    }
}
