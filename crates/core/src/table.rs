//! Open-addressing hash table keyed by interned strings.
//!
//! Because strings are interned, a key is just its heap handle and lookup
//! is handle equality. The table never reads the heap itself: callers pass
//! the key's FNV-1a hash alongside the handle, which keeps the table usable
//! both for heap-owned maps (globals, intern set) and for maps stored
//! inside heap objects (instance fields, class methods, table values).
//!
//! Bucket states:
//! - empty:     `key = None, value = NIL`
//! - tombstone: `key = None, value = false`
//! - live:      `key = Some(handle)`
//!
//! Tombstones count toward the load factor and are recycled by `set`.

use crate::heap::Handle;
use crate::value::Value;

/// Grow once `size >= capacity * 0.75`; tombstones included in `size`.
const MAX_LOAD: f64 = 0.75;

/// 32-bit FNV-1a over raw bytes, with the multiply written as shift-adds.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash
            .wrapping_add(hash << 1)
            .wrapping_add(hash << 4)
            .wrapping_add(hash << 7)
            .wrapping_add(hash << 8)
            .wrapping_add(hash << 24);
    }
    hash
}

#[derive(Clone, Copy)]
struct Entry {
    key: Option<Handle>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::NIL,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_nil()
    }
}

#[derive(Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; drives growth.
    size: usize,
    /// Live entries only; what `len` reports.
    live: usize,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Number of live entries (tombstones excluded).
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Bucket count, for index-based iteration during GC marking.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The live entry in bucket `i`, if any. Copies out so callers can keep
    /// mutating the heap while they walk the table.
    pub fn entry_at(&self, i: usize) -> Option<(Handle, Value)> {
        let e = self.entries[i];
        e.key.map(|k| (k, e.value))
    }

    /// Find the bucket for `key`: the first matching live bucket, or failing
    /// that the first reusable bucket (preferring a remembered tombstone).
    fn probe(entries: &[Entry], key: Handle, hash: u32) -> usize {
        let capacity = entries.len();
        let mut idx = hash as usize % capacity;
        let mut tombstone = None;
        loop {
            let entry = &entries[idx];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(idx);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Some(k) if k == key => return idx,
                Some(_) => {}
            }
            idx = (idx + 1) % capacity;
        }
    }

    /// Reinitialize at the next capacity and reinsert live entries;
    /// tombstones are dropped and the load count reset.
    fn grow(&mut self) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.size = 0;
        for entry in old {
            if let Some(k) = entry.key {
                let idx = Table::probe(&self.entries, k, entry.hash);
                self.entries[idx] = entry;
                self.size += 1;
            }
        }
    }

    /// Insert or update. Returns `true` when the key was not already present.
    pub fn set(&mut self, key: Handle, hash: u32, value: Value) -> bool {
        if (self.entries.len() as f64 * MAX_LOAD) <= self.size as f64 {
            self.grow();
        }

        let idx = Table::probe(&self.entries, key, hash);
        let entry = &mut self.entries[idx];
        let is_new = entry.key.is_none();
        if is_new && entry.value.is_nil() {
            self.size += 1;
        }
        if is_new {
            self.live += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    pub fn get(&self, key: Handle, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Table::probe(&self.entries, key, hash);
        let entry = &self.entries[idx];
        entry.key.map(|_| entry.value)
    }

    /// Delete by writing a tombstone in place.
    pub fn delete(&mut self, key: Handle, hash: u32) -> bool {
        if self.size == 0 {
            return false;
        }
        let idx = Table::probe(&self.entries, key, hash);
        let entry = &mut self.entries[idx];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::FALSE,
        };
        self.live -= 1;
        true
    }

    /// Content-based probe for the intern set: walks the cluster for `hash`,
    /// skipping tombstones, and returns the first key the predicate accepts.
    /// Tombstones must not terminate the walk or re-interning after a sweep
    /// could duplicate a string that is still live elsewhere in the cluster.
    pub fn find_by(&self, hash: u32, mut matches: impl FnMut(Handle) -> bool) -> Option<Handle> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut idx = hash as usize % capacity;
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(k) => {
                    if entry.hash == hash && matches(k) {
                        return Some(k);
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> Handle {
        Handle::new(i)
    }

    #[test]
    fn test_set_get_update() {
        let mut t = Table::new();
        assert!(t.set(key(1), 11, Value::number(1.0)));
        assert!(t.set(key(2), 12, Value::number(2.0)));
        assert!(!t.set(key(1), 11, Value::number(3.0)));
        assert_eq!(t.get(key(1), 11), Some(Value::number(3.0)));
        assert_eq!(t.get(key(2), 12), Some(Value::number(2.0)));
        assert_eq!(t.get(key(3), 13), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_delete_leaves_cluster_walkable() {
        // Three keys colliding into one cluster; deleting the middle one
        // must not hide the last.
        let mut t = Table::new();
        t.set(key(1), 8, Value::number(1.0));
        t.set(key(2), 8, Value::number(2.0));
        t.set(key(3), 8, Value::number(3.0));
        assert!(t.delete(key(2), 8));
        assert!(!t.delete(key(2), 8));
        assert_eq!(t.get(key(3), 8), Some(Value::number(3.0)));
        assert_eq!(t.get(key(2), 8), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_tombstone_reused_on_insert() {
        let mut t = Table::new();
        t.set(key(1), 8, Value::number(1.0));
        t.set(key(2), 8, Value::number(2.0));
        t.delete(key(1), 8);
        t.set(key(9), 8, Value::number(9.0));
        assert_eq!(t.get(key(9), 8), Some(Value::number(9.0)));
        assert_eq!(t.get(key(2), 8), Some(Value::number(2.0)));
    }

    #[test]
    fn test_growth_keeps_entries() {
        let mut t = Table::new();
        for i in 0..64 {
            t.set(key(i), fnv1a(&i.to_le_bytes()), Value::number(f64::from(i)));
        }
        for i in 0..64 {
            assert_eq!(
                t.get(key(i), fnv1a(&i.to_le_bytes())),
                Some(Value::number(f64::from(i))),
                "key {i} lost during growth"
            );
        }
        assert!(t.capacity() >= 64);
    }

    #[test]
    fn test_find_by_skips_tombstones() {
        let mut t = Table::new();
        t.set(key(1), 8, Value::NIL);
        t.set(key(2), 8, Value::NIL);
        t.delete(key(1), 8);
        assert_eq!(t.find_by(8, |h| h == key(2)), Some(key(2)));
        assert_eq!(t.find_by(8, |h| h == key(1)), None);
    }

    #[test]
    fn test_fnv1a_known_values() {
        // FNV-1a with a zero offset basis, as used by the string interner.
        assert_eq!(fnv1a(b""), 0);
        assert_ne!(fnv1a(b"push"), fnv1a(b"pop"));
        assert_eq!(fnv1a(b"init"), fnv1a(b"init"));
    }
}
