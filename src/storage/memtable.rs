//! MemTable
//!
//! In-memory sorted write buffer for one LSM engine. Keys are ordered
//! lexicographically; deletions are explicit tombstones so they can shadow
//! older SSTable entries until compaction drops them.
//!
//! Writers are serialized by the owning engine. [`MemTable::snapshot`]
//! returns an independent copy that the flusher can read without blocking
//! new writes; `Bytes` makes that copy O(1) per entry.

use std::collections::BTreeMap;

use bytes::Bytes;

/// A single memtable entry: a write stamped with the engine's sequence
/// number, or a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct MemEntry {
    /// Monotonic per-engine sequence; newest wins during reads and merges.
    pub sequence: u64,
    /// `None` marks a tombstone.
    pub value: Option<Bytes>,
}

impl MemEntry {
    pub fn put(sequence: u64, value: Bytes) -> Self {
        Self {
            sequence,
            value: Some(value),
        }
    }

    pub fn tombstone(sequence: u64) -> Self {
        Self {
            sequence,
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Sorted key → entry map with byte-size accounting.
#[derive(Debug, Default)]
pub struct MemTable {
    entries: BTreeMap<Bytes, MemEntry>,
    approximate_size: usize,
    max_bytes: usize,
}

/// Immutable snapshot handed to the flusher.
#[derive(Debug, Clone)]
pub struct MemTableSnapshot {
    pub entries: BTreeMap<Bytes, MemEntry>,
}

impl MemTable {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            approximate_size: 0,
            max_bytes,
        }
    }

    /// Inserts or replaces an entry. Returns `true` when the table has
    /// reached its size threshold and should be frozen.
    ///
    /// Accounting: a new key charges `len(key) + len(value)`; replacing an
    /// existing key charges only the delta in value length.
    pub fn put(&mut self, key: Bytes, entry: MemEntry) -> bool {
        let value_len = entry.value.as_ref().map(|v| v.len()).unwrap_or(0);
        match self.entries.insert(key.clone(), entry) {
            Some(previous) => {
                let old_len = previous.value.as_ref().map(|v| v.len()).unwrap_or(0);
                self.approximate_size = self.approximate_size - old_len + value_len;
            }
            None => {
                self.approximate_size += key.len() + value_len;
            }
        }
        self.needs_flush()
    }

    /// Looks a key up. `Some(entry)` may be a tombstone; `None` means the
    /// key was never written to this memtable.
    pub fn get(&self, key: &[u8]) -> Option<&MemEntry> {
        self.entries.get(key)
    }

    /// Records a deletion as a tombstone.
    pub fn delete(&mut self, key: Bytes, sequence: u64) -> bool {
        self.put(key, MemEntry::tombstone(sequence))
    }

    /// Approximate byte footprint of keys + values.
    pub fn size(&self) -> usize {
        self.approximate_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn needs_flush(&self) -> bool {
        self.approximate_size >= self.max_bytes
    }

    /// Independent copy safe for concurrent reading by the flusher.
    pub fn snapshot(&self) -> MemTableSnapshot {
        MemTableSnapshot {
            entries: self.entries.clone(),
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&Bytes, &MemEntry)) {
        for (key, entry) in &self.entries {
            f(key, entry);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.approximate_size = 0;
    }

}

impl MemTableSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&MemEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &MemEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn put_get_delete_round_trip() {
        let mut table = MemTable::new(1024);
        table.put(b("k1"), MemEntry::put(1, b("v1")));
        assert_eq!(table.get(b"k1").unwrap().value.as_deref(), Some(&b"v1"[..]));

        table.delete(b("k1"), 2);
        assert!(table.get(b"k1").unwrap().is_tombstone());
        assert!(table.get(b"missing").is_none());
    }

    #[test]
    fn size_accounting_tracks_new_and_updated_keys() {
        let mut table = MemTable::new(1024);
        table.put(b("key"), MemEntry::put(1, b("value")));
        assert_eq!(table.size(), 3 + 5);

        // Update charges only the value delta.
        table.put(b("key"), MemEntry::put(2, b("longer-value")));
        assert_eq!(table.size(), 3 + 12);

        table.put(b("key"), MemEntry::put(3, b("v")));
        assert_eq!(table.size(), 3 + 1);
    }

    #[test]
    fn needs_flush_at_threshold() {
        let mut table = MemTable::new(10);
        assert!(!table.put(b("a"), MemEntry::put(1, b("1234"))));
        assert!(table.put(b("b"), MemEntry::put(2, b("56789"))));
        assert!(table.needs_flush());
    }

    #[test]
    fn snapshot_is_independent_of_later_writes() {
        let mut table = MemTable::new(1024);
        table.put(b("k"), MemEntry::put(1, b("old")));
        let snapshot = table.snapshot();

        table.put(b("k"), MemEntry::put(2, b("new")));
        table.clear();

        assert_eq!(
            snapshot.get(b"k").unwrap().value.as_deref(),
            Some(&b"old"[..])
        );
        assert_eq!(snapshot.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn keys_iterate_in_lexicographic_order() {
        let mut table = MemTable::new(1024);
        for key in ["b", "a", "c"] {
            table.put(b(key), MemEntry::put(1, b("x")));
        }
        let mut seen = Vec::new();
        table.for_each(|k, _| seen.push(k.clone()));
        assert_eq!(seen, vec![b("a"), b("b"), b("c")]);
    }
}
