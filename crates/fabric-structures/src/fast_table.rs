//! Resizable Open-Addressed Hash Table
//!
//! Backing store for every index in the fabric: tree levels, mempool
//! endpoints, channel slots and in-flight transfers.
//!
//! # Design
//!
//! - Linear probing from `hash(key) % size`
//! - A parallel is-empty bitmap turns "next empty slot from X" into a word
//!   scan, which keeps insertion and rehash near O(1)
//! - Backward-shift deletion, so probe runs stay contiguous without
//!   tombstones
//! - Grows past `size * load_factor`, shrinks under `size * shrink_factor`,
//!   always clamped to `[min_size, max_size]`
//! - Zero is an ordinary key; emptiness lives only in the bitmap

use fabric_common::{Classify, ErrorClass, TableConfig};

use crate::bitvec::SlotBitmap;
use crate::hash::FastHash;

/// Table errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("table is full at max size {0}")]
    Full(u64),

    #[error("key already present")]
    DuplicateKey,

    #[error("invalid table config: {0}")]
    InvalidConfig(String),

    #[error("table corrupted: {0}")]
    Corrupted(&'static str),
}

impl Classify for TableError {
    fn class(&self) -> ErrorClass {
        match self {
            TableError::Full(_) => ErrorClass::Recoverable,
            TableError::DuplicateKey | TableError::InvalidConfig(_) => ErrorClass::Invalid,
            TableError::Corrupted(_) => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot<K, V> {
    key: K,
    value: V,
}

/// Open-addressed table with bitmap-assisted probing.
#[derive(Debug, Clone)]
pub struct FastTable<K, V> {
    slots: Vec<Option<Slot<K, V>>>,
    /// Bit set means the slot is empty
    empty: SlotBitmap,
    count: usize,
    min_size: usize,
    max_size: usize,
    load_factor: f64,
    shrink_factor: f64,
}

impl<K: FastHash + Eq, V> FastTable<K, V> {
    /// Create an empty table at `config.min_size` slots
    pub fn new(config: TableConfig) -> Result<Self, TableError> {
        config
            .validate()
            .map_err(|e| TableError::InvalidConfig(e.to_string()))?;

        let min_size = to_usize(config.min_size);
        let max_size = to_usize(config.max_size);

        Ok(Self {
            slots: empty_slots(min_size),
            empty: SlotBitmap::all_set(min_size),
            count: 0,
            min_size,
            max_size,
            load_factor: config.load_factor,
            shrink_factor: config.shrink_factor,
        })
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// No entries
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current slot count
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot count growth will not exceed
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_size
    }

    /// Key present
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find_index(key).is_some()
    }

    /// Shared reference to the value for `key`
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        let idx = self.find_index(key)?;
        self.slots[idx].as_ref().map(|s| &s.value)
    }

    /// Mutable reference to the value for `key`
    #[inline]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = self.find_index(key)?;
        self.slots[idx].as_mut().map(|s| &mut s.value)
    }

    /// Insert a new key.
    ///
    /// Fails with `DuplicateKey` if the key exists (the stored value is left
    /// untouched) and with `Full` when the table already holds `max_size`
    /// entries.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), TableError> {
        if self.find_index(&key).is_some() {
            return Err(TableError::DuplicateKey);
        }
        self.insert_new(key, value).map(|_| ())
    }

    /// Insert or overwrite, returning the replaced value
    pub fn upsert(&mut self, key: K, value: V) -> Result<Option<V>, TableError> {
        if let Some(idx) = self.find_index(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                return Ok(Some(std::mem::replace(&mut slot.value, value)));
            }
        }
        self.insert_new(key, value).map(|_| None)
    }

    /// Value for `key`, inserting `make()` first if absent
    pub fn get_or_insert_with(
        &mut self,
        key: K,
        make: impl FnOnce() -> V,
    ) -> Result<&mut V, TableError> {
        let idx = match self.find_index(&key) {
            Some(idx) => idx,
            None => self.insert_new(key, make())?,
        };
        self.slots[idx]
            .as_mut()
            .map(|s| &mut s.value)
            .ok_or(TableError::Corrupted("occupied slot vanished"))
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.find_index(key)?;
        let removed = self.slots[idx].take()?;
        self.empty.set(idx);
        self.count -= 1;
        self.backshift(idx);

        if self.should_shrink() {
            self.resize(self.shrink_target());
        }
        Some(removed.value)
    }

    /// Drop every entry and return to `min_size`
    pub fn clear(&mut self) {
        self.slots = empty_slots(self.min_size);
        self.empty = SlotBitmap::all_set(self.min_size);
        self.count = 0;
    }

    /// Entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = 0usize;
        std::iter::from_fn(move || {
            let idx = self.empty.next_clear_from(cursor)?;
            cursor = idx + 1;
            self.slots[idx].as_ref().map(|s| (&s.key, &s.value))
        })
    }

    /// Mutable values in slot order
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.slots.iter_mut().flatten().map(|s| &mut s.value)
    }

    #[inline]
    fn home(&self, key: &K) -> usize {
        (key.fast_hash() % self.slots.len() as u64) as usize
    }

    fn find_index(&self, key: &K) -> Option<usize> {
        let size = self.slots.len();
        let mut idx = self.home(key);
        for _ in 0..size {
            match &self.slots[idx] {
                None => return None,
                Some(slot) if slot.key == *key => return Some(idx),
                Some(_) => {}
            }
            idx += 1;
            if idx == size {
                idx = 0;
            }
        }
        None
    }

    /// Place a key known to be absent; returns its slot index.
    ///
    /// Growth happens before placement so the returned index stays valid.
    fn insert_new(&mut self, key: K, value: V) -> Result<usize, TableError> {
        let needs_room = self.count == self.slots.len();
        if needs_room && self.slots.len() >= self.max_size {
            return Err(TableError::Full(self.max_size as u64));
        }
        if needs_room || self.exceeds_load(self.count + 1) {
            self.resize(self.grow_target());
        }

        let home = self.home(&key);
        let idx = self
            .empty
            .next_set_wrapping(home)
            .ok_or(TableError::Corrupted("no empty slot below capacity"))?;
        self.slots[idx] = Some(Slot { key, value });
        self.empty.clear(idx);
        self.count += 1;
        Ok(idx)
    }

    /// Close the hole at `hole` by pulling later run members back.
    fn backshift(&mut self, mut hole: usize) {
        let size = self.slots.len();
        let mut j = hole;
        for _ in 0..size {
            j += 1;
            if j == size {
                j = 0;
            }
            let home = match &self.slots[j] {
                None => return,
                Some(slot) => self.home(&slot.key),
            };
            if !cyclic_between(home, hole, j) {
                self.slots[hole] = self.slots[j].take();
                self.empty.clear(hole);
                self.empty.set(j);
                hole = j;
            }
        }
    }

    fn exceeds_load(&self, count: usize) -> bool {
        self.slots.len() < self.max_size
            && count as f64 > self.slots.len() as f64 * self.load_factor
    }

    fn should_shrink(&self) -> bool {
        self.slots.len() > self.min_size
            && (self.count as f64) < self.slots.len() as f64 * self.shrink_factor
    }

    fn grow_target(&self) -> usize {
        let size = self.slots.len();
        let scaled = (size as f64 / self.load_factor).ceil() as usize;
        scaled.max(size + 1).min(self.max_size)
    }

    fn shrink_target(&self) -> usize {
        let size = self.slots.len();
        let scaled = (size as f64 * (1.0 - self.shrink_factor)) as usize;
        scaled.max(self.min_size).max(self.count + 1).min(size)
    }

    fn resize(&mut self, new_size: usize) {
        if new_size == self.slots.len() {
            return;
        }
        let old = std::mem::replace(&mut self.slots, empty_slots(new_size));
        self.empty = SlotBitmap::all_set(new_size);

        for slot in old.into_iter().flatten() {
            let home = self.home(&slot.key);
            match self.empty.next_set_wrapping(home) {
                Some(idx) => {
                    self.slots[idx] = Some(slot);
                    self.empty.clear(idx);
                }
                None => {
                    tracing::error!(new_size, "rehash ran out of slots");
                    return;
                }
            }
        }
    }
}

/// True if `x` lies in the cyclic interval `(lo, hi]`.
#[inline]
fn cyclic_between(x: usize, lo: usize, hi: usize) -> bool {
    if lo <= hi {
        lo < x && x <= hi
    } else {
        x > lo || x <= hi
    }
}

fn empty_slots<K, V>(n: usize) -> Vec<Option<Slot<K, V>>> {
    let mut v = Vec::with_capacity(n);
    v.resize_with(n, || None);
    v
}

#[inline]
fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn table(min: u64, max: u64) -> FastTable<u64, u64> {
        FastTable::new(TableConfig::new(min, max, 0.5, 0.25)).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let mut t = table(2, 1 << 10);
        t.insert(7, 70).unwrap();
        t.insert(0, 1).unwrap();

        assert_eq!(t.get(&7), Some(&70));
        assert_eq!(t.get(&0), Some(&1));
        assert_eq!(t.len(), 2);

        assert_eq!(t.remove(&7), Some(70));
        assert_eq!(t.get(&7), None);
        assert_eq!(t.remove(&7), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_zero_key_is_ordinary() {
        let mut t = table(4, 16);
        t.insert(0, 42).unwrap();
        assert!(t.contains_key(&0));
        assert_eq!(t.insert(0, 43), Err(TableError::DuplicateKey));
        assert_eq!(t.get(&0), Some(&42));
    }

    #[test]
    fn test_full_at_max_size() {
        let mut t: FastTable<u32, u32> = FastTable::new(TableConfig::fixed(8)).unwrap();
        for k in 0..8 {
            t.insert(k, k).unwrap();
        }
        assert_eq!(t.insert(8, 8), Err(TableError::Full(8)));
        assert!(t.insert(8, 8).unwrap_err().is_recoverable());
        assert_eq!(t.capacity(), 8);

        // Every key is still reachable in a completely full table.
        for k in 0..8 {
            assert_eq!(t.get(&k), Some(&k));
        }
        assert_eq!(t.get(&99), None);
    }

    #[test]
    fn test_growth_clamped_to_max() {
        let mut t = table(2, 10);
        for k in 0..10 {
            t.insert(k, k).unwrap();
        }
        assert_eq!(t.capacity(), 10);
        assert!(matches!(t.insert(10, 10), Err(TableError::Full(10))));
    }

    #[test]
    fn test_resize_preserves_entries() {
        let mut t = table(2, 1 << 16);
        let mut grows = 0;
        let mut last = t.capacity();
        for k in 0..2000u64 {
            t.insert(k * 3, k).unwrap();
            if t.capacity() > last {
                grows += 1;
                last = t.capacity();
            }
        }
        assert!(grows >= 3);

        let mut shrinks = 0;
        for k in 0..1990u64 {
            assert_eq!(t.remove(&(k * 3)), Some(k));
            if t.capacity() < last {
                shrinks += 1;
                last = t.capacity();
            }
        }
        assert!(shrinks >= 2);

        let mut remaining: Vec<_> = t.iter().map(|(k, v)| (*k, *v)).collect();
        remaining.sort_unstable();
        let expected: Vec<_> = (1990..2000u64).map(|k| (k * 3, k)).collect();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn test_removal_keeps_probe_runs() {
        // Small fixed table so that keys collide and form runs.
        let mut t: FastTable<u8, u8> = FastTable::new(TableConfig::fixed(16)).unwrap();
        for k in 0..16u8 {
            t.insert(k, k).unwrap();
        }
        for k in (0..16u8).step_by(2) {
            t.remove(&k);
        }
        for k in (1..16u8).step_by(2) {
            assert_eq!(t.get(&k), Some(&k), "lost key {}", k);
        }
    }

    #[test]
    fn test_upsert_and_get_or_insert() {
        let mut t = table(2, 64);
        assert_eq!(t.upsert(5, 1).unwrap(), None);
        assert_eq!(t.upsert(5, 2).unwrap(), Some(1));

        *t.get_or_insert_with(9, || 100).unwrap() += 1;
        *t.get_or_insert_with(9, || 0).unwrap() += 1;
        assert_eq!(t.get(&9), Some(&102));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u64, u64),
        Remove(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..256, any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            (0u64..256).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_hashmap(ops in prop::collection::vec(op(), 1..400)) {
            let mut t = table(2, 1 << 12);
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    Op::Insert(k, v) => {
                        let res = t.insert(k, v);
                        if model.contains_key(&k) {
                            prop_assert_eq!(res, Err(TableError::DuplicateKey));
                        } else {
                            prop_assert!(res.is_ok());
                            model.insert(k, v);
                        }
                    }
                    Op::Remove(k) => {
                        prop_assert_eq!(t.remove(&k), model.remove(&k));
                    }
                }
                prop_assert_eq!(t.len(), model.len());
            }

            for (k, v) in &model {
                prop_assert_eq!(t.get(k), Some(v));
            }
        }
    }
}
