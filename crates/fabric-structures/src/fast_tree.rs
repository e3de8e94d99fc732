//! Fast Tree: a 32/16/8/8 radix index over `u64` keys
//!
//! Keys are cut into four segments. The root table maps the high 32 bits to
//! a [`Tree32`], which maps the next 16 bits to a [`Tree16`], which maps the
//! next 8 bits to a leaf. A leaf holds a 256-bit presence vector and a value
//! table keyed by the low byte.
//!
//! # Design
//!
//! - Every level pairs its value-bearing table with an outward presence set
//!   over its child segments, so next/prev queries escalate one level at a
//!   time without walking values
//! - Levels are created lazily on insert and freed as soon as they empty
//! - Each level tracks `{count, min, max}`; after a removal hits the min or
//!   max the bound is recomputed from the presence sets, never carried over
//! - Leaves sit in an arena and are chained in key order for traversal
//! - Single-threaded; owners serialize access

use fabric_common::{Classify, ErrorClass, TableConfig};

use crate::bitvec::BitVector256;
use crate::fast_table::{FastTable, TableError};
use crate::presence::{Set16, Set32};

/// Query modes for [`FastTree::search`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Smallest key present
    Min,
    /// Largest key present
    Max,
    /// Largest key `< k`
    Prev,
    /// Smallest key `> k`
    Next,
    /// Exactly `k`
    Equal,
    /// Smallest key `>= k`
    EqualOrNext,
    /// Largest key `<= k`
    EqualOrPrev,
}

/// Result of a successful search
#[derive(Debug)]
pub struct SearchHit<'a, V> {
    /// Key found
    pub key: u64,
    /// Leaf holding the key
    pub leaf: LeafId,
    /// Stored value
    pub value: &'a V,
}

/// Outcome of [`FastTree::insert`]
#[derive(Debug, PartialEq, Eq)]
pub enum TreeInsert<V> {
    /// Key was absent
    Inserted,
    /// Key was present and overwritten; holds the previous value
    Replaced(V),
    /// Key was present and overwrite was off; hands the new value back
    Rejected(V),
}

/// Tree errors
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("tree corrupted: {0}")]
    Corrupted(&'static str),
}

impl Classify for TreeError {
    fn class(&self) -> ErrorClass {
        match self {
            TreeError::Table(e) => e.class(),
            TreeError::Corrupted(_) => ErrorClass::Fatal,
        }
    }
}

/// Per-level table sizing. Maximum sizes always equal the key width of the
/// level, so a level can never report full.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastTreeConfig {
    /// Root level (32-bit segments)
    pub tree_32: TableConfig,
    /// 16-bit segment tables
    pub tree_16: TableConfig,
    /// Byte-keyed tables, leaf values included
    pub tree_8: TableConfig,
}

impl Default for FastTreeConfig {
    fn default() -> Self {
        Self {
            tree_32: TableConfig::tree_32(),
            tree_16: TableConfig::tree_16(),
            tree_8: TableConfig::tree_8(),
        }
    }
}

impl FastTreeConfig {
    fn normalized(self) -> Self {
        fn level(cfg: TableConfig, bits: u32) -> TableConfig {
            let max_size = 1u64 << bits;
            TableConfig {
                min_size: cfg.min_size.min(max_size),
                max_size,
                ..cfg
            }
        }
        Self {
            tree_32: level(self.tree_32, 32),
            tree_16: level(self.tree_16, 16),
            tree_8: level(self.tree_8, 8),
        }
    }
}

/// Stable handle to a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Leaf<V> {
    base: u64,
    present: BitVector256,
    values: FastTable<u8, V>,
    prev: Option<LeafId>,
    next: Option<LeafId>,
}

#[derive(Debug, Clone)]
struct ArenaSlot<V> {
    generation: u32,
    leaf: Option<Leaf<V>>,
}

#[derive(Debug, Clone)]
struct LeafArena<V> {
    slots: Vec<ArenaSlot<V>>,
    free: Vec<u32>,
}

impl<V> LeafArena<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, leaf: Leaf<V>) -> LeafId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.leaf = Some(leaf);
                LeafId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(ArenaSlot {
                    generation: 0,
                    leaf: Some(leaf),
                });
                LeafId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: LeafId) -> Option<Leaf<V>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let leaf = slot.leaf.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(leaf)
    }

    fn get(&self, id: LeafId) -> Option<&Leaf<V>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.leaf.as_ref()
    }

    fn get_mut(&mut self, id: LeafId) -> Option<&mut Leaf<V>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.leaf.as_mut()
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// 16-bit level: byte segment to leaf.
#[derive(Debug, Clone)]
struct Tree16 {
    inward: FastTable<u8, LeafId>,
    outward: BitVector256,
    count: u64,
    min: u16,
    max: u16,
}

impl Tree16 {
    fn new(config: &FastTreeConfig) -> Result<Self, TableError> {
        Ok(Self {
            inward: FastTable::new(config.tree_8)?,
            outward: BitVector256::new(),
            count: 0,
            min: 0,
            max: 0,
        })
    }

    fn note_insert(&mut self, suffix: u16) {
        if self.count == 0 {
            self.min = suffix;
            self.max = suffix;
        } else {
            self.min = self.min.min(suffix);
            self.max = self.max.max(suffix);
        }
        self.count += 1;
    }

    fn first(&self) -> Option<(u16, LeafId)> {
        let leaf = *self.inward.get(&((self.min >> 8) as u8))?;
        Some((self.min, leaf))
    }

    fn last(&self) -> Option<(u16, LeafId)> {
        let leaf = *self.inward.get(&((self.max >> 8) as u8))?;
        Some((self.max, leaf))
    }

    fn next_from<V>(&self, x: u16, leaves: &LeafArena<V>) -> Option<(u16, LeafId)> {
        if x <= self.min {
            return self.first();
        }
        if x > self.max {
            return None;
        }
        let seg = (x >> 8) as u8;
        if let Some(&leaf) = self.inward.get(&seg) {
            if let Some(lo) = leaves.get(leaf).and_then(|l| l.present.next_from(x as u8)) {
                return Some((join8(seg, lo), leaf));
            }
        }
        let seg = self.outward.next_after(seg)?;
        let leaf = *self.inward.get(&seg)?;
        let lo = leaves.get(leaf)?.present.min()?;
        Some((join8(seg, lo), leaf))
    }

    fn prev_from<V>(&self, x: u16, leaves: &LeafArena<V>) -> Option<(u16, LeafId)> {
        if x >= self.max {
            return self.last();
        }
        if x < self.min {
            return None;
        }
        let seg = (x >> 8) as u8;
        if let Some(&leaf) = self.inward.get(&seg) {
            if let Some(lo) = leaves.get(leaf).and_then(|l| l.present.prev_from(x as u8)) {
                return Some((join8(seg, lo), leaf));
            }
        }
        let seg = self.outward.prev_before(seg)?;
        let leaf = *self.inward.get(&seg)?;
        let lo = leaves.get(leaf)?.present.max()?;
        Some((join8(seg, lo), leaf))
    }

    fn refresh_bounds<V>(&mut self, leaves: &LeafArena<V>) -> Option<()> {
        let lo_seg = self.outward.min()?;
        let hi_seg = self.outward.max()?;
        let lo = leaves.get(*self.inward.get(&lo_seg)?)?.present.min()?;
        let hi = leaves.get(*self.inward.get(&hi_seg)?)?.present.max()?;
        self.min = join8(lo_seg, lo);
        self.max = join8(hi_seg, hi);
        Some(())
    }
}

/// 32-bit level: 16-bit segment to [`Tree16`].
#[derive(Debug, Clone)]
struct Tree32 {
    inward: FastTable<u16, Tree16>,
    outward: Set16,
    count: u64,
    min: u32,
    max: u32,
}

impl Tree32 {
    fn new(config: &FastTreeConfig) -> Result<Self, TableError> {
        Ok(Self {
            inward: FastTable::new(config.tree_16)?,
            outward: Set16::new(config.tree_8)?,
            count: 0,
            min: 0,
            max: 0,
        })
    }

    fn note_insert(&mut self, suffix: u32) {
        if self.count == 0 {
            self.min = suffix;
            self.max = suffix;
        } else {
            self.min = self.min.min(suffix);
            self.max = self.max.max(suffix);
        }
        self.count += 1;
    }

    fn first(&self) -> Option<(u32, LeafId)> {
        let seg = (self.min >> 16) as u16;
        let (_, leaf) = self.inward.get(&seg)?.first()?;
        Some((self.min, leaf))
    }

    fn last(&self) -> Option<(u32, LeafId)> {
        let seg = (self.max >> 16) as u16;
        let (_, leaf) = self.inward.get(&seg)?.last()?;
        Some((self.max, leaf))
    }

    fn next_from<V>(&self, x: u32, leaves: &LeafArena<V>) -> Option<(u32, LeafId)> {
        if x <= self.min {
            return self.first();
        }
        if x > self.max {
            return None;
        }
        let seg = (x >> 16) as u16;
        if let Some(found) = self
            .inward
            .get(&seg)
            .and_then(|t| t.next_from(x as u16, leaves))
        {
            return Some((join16(seg, found.0), found.1));
        }
        let seg = self.outward.next_after(seg)?;
        let (suffix, leaf) = self.inward.get(&seg)?.first()?;
        Some((join16(seg, suffix), leaf))
    }

    fn prev_from<V>(&self, x: u32, leaves: &LeafArena<V>) -> Option<(u32, LeafId)> {
        if x >= self.max {
            return self.last();
        }
        if x < self.min {
            return None;
        }
        let seg = (x >> 16) as u16;
        if let Some(found) = self
            .inward
            .get(&seg)
            .and_then(|t| t.prev_from(x as u16, leaves))
        {
            return Some((join16(seg, found.0), found.1));
        }
        let seg = self.outward.prev_before(seg)?;
        let (suffix, leaf) = self.inward.get(&seg)?.last()?;
        Some((join16(seg, suffix), leaf))
    }

    fn refresh_bounds(&mut self) -> Option<()> {
        let lo_seg = self.outward.min()?;
        let hi_seg = self.outward.max()?;
        let lo = self.inward.get(&lo_seg)?.min;
        let hi = self.inward.get(&hi_seg)?.max;
        self.min = join16(lo_seg, lo);
        self.max = join16(hi_seg, hi);
        Some(())
    }
}

/// Ordered map from `u64` to `V` with near constant-time neighbour search.
#[derive(Debug, Clone)]
pub struct FastTree<V> {
    root: FastTable<u32, Tree32>,
    outward: Set32,
    leaves: LeafArena<V>,
    head: Option<LeafId>,
    tail: Option<LeafId>,
    count: u64,
    min: u64,
    max: u64,
    config: FastTreeConfig,
}

impl<V> FastTree<V> {
    /// Empty tree with default level sizing
    pub fn new() -> Result<Self, TreeError> {
        Self::with_config(FastTreeConfig::default())
    }

    /// Empty tree with custom level sizing
    pub fn with_config(config: FastTreeConfig) -> Result<Self, TreeError> {
        let config = config.normalized();
        Ok(Self {
            root: FastTable::new(config.tree_32)?,
            outward: Set32::new(config.tree_16, config.tree_8)?,
            leaves: LeafArena::new(),
            head: None,
            tail: None,
            count: 0,
            min: 0,
            max: 0,
            config,
        })
    }

    /// Number of keys
    #[inline]
    pub fn len(&self) -> u64 {
        self.count
    }

    /// No keys
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Smallest key
    #[inline]
    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest key
    #[inline]
    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    /// Number of live leaves
    pub fn leaf_count(&self) -> usize {
        self.leaves.live()
    }

    /// Key present
    pub fn contains(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Value for `key`
    pub fn get(&self, key: u64) -> Option<&V> {
        let leaf = self.locate_leaf(key)?;
        self.leaves.get(leaf)?.values.get(&(key as u8))
    }

    /// Mutable value for `key`
    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        let leaf = self.locate_leaf(key)?;
        self.leaves.get_mut(leaf)?.values.get_mut(&(key as u8))
    }

    /// First key of the leaf behind `leaf`
    pub fn leaf_base(&self, leaf: LeafId) -> Option<u64> {
        self.leaves.get(leaf).map(|l| l.base)
    }

    /// Leaf holding the smallest key
    pub fn first_leaf(&self) -> Option<LeafId> {
        self.head
    }

    /// Leaf holding the largest key
    pub fn last_leaf(&self) -> Option<LeafId> {
        self.tail
    }

    /// Leaf following `leaf` in key order
    pub fn next_leaf(&self, leaf: LeafId) -> Option<LeafId> {
        self.leaves.get(leaf)?.next
    }

    /// Locate a key according to `mode`
    pub fn search(&self, key: u64, mode: SearchMode) -> Option<SearchHit<'_, V>> {
        if self.count == 0 {
            return None;
        }
        let (found, leaf) = match mode {
            SearchMode::Min => self.next_from(0)?,
            SearchMode::Max => self.prev_from(u64::MAX)?,
            SearchMode::Equal => {
                let leaf = self.locate_leaf(key)?;
                if !self.leaves.get(leaf)?.present.test(key as u8) {
                    return None;
                }
                (key, leaf)
            }
            SearchMode::EqualOrNext => self.next_from(key)?,
            SearchMode::EqualOrPrev => self.prev_from(key)?,
            SearchMode::Next => self.next_from(key.checked_add(1)?)?,
            SearchMode::Prev => self.prev_from(key.checked_sub(1)?)?,
        };
        let value = self.leaves.get(leaf)?.values.get(&(found as u8))?;
        Some(SearchHit {
            key: found,
            leaf,
            value,
        })
    }

    /// Insert `value` at `key`.
    ///
    /// An existing key is overwritten only when `overwrite` is set.
    pub fn insert(&mut self, key: u64, value: V, overwrite: bool) -> Result<TreeInsert<V>, TreeError> {
        let (hi, mid, seg, lo) = split_key(key);

        if let Some(leaf_id) = self.locate_leaf(key) {
            let leaf = self
                .leaves
                .get_mut(leaf_id)
                .ok_or(TreeError::Corrupted("indexed leaf missing from arena"))?;
            if leaf.present.test(lo) {
                if !overwrite {
                    return Ok(TreeInsert::Rejected(value));
                }
                let prev = leaf
                    .values
                    .upsert(lo, value)?
                    .ok_or(TreeError::Corrupted("present bit without value"))?;
                return Ok(TreeInsert::Replaced(prev));
            }
            leaf.values.insert(lo, value)?;
            leaf.present.set(lo);
        } else {
            self.create_leaf(key, value)?;
        }

        let t32 = self
            .root
            .get_mut(&hi)
            .ok_or(TreeError::Corrupted("root segment missing"))?;
        let t16 = t32
            .inward
            .get_mut(&mid)
            .ok_or(TreeError::Corrupted("16-bit segment missing"))?;
        t16.note_insert(join8(seg, lo));
        t32.note_insert(key as u32);

        if self.count == 0 {
            self.min = key;
            self.max = key;
        } else {
            self.min = self.min.min(key);
            self.max = self.max.max(key);
        }
        self.count += 1;
        Ok(TreeInsert::Inserted)
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: u64) -> Option<V> {
        let (hi, mid, seg, lo) = split_key(key);
        let leaf_id = self.locate_leaf(key)?;

        let (value, leaf_emptied) = {
            let leaf = self.leaves.get_mut(leaf_id)?;
            if !leaf.present.clear(lo) {
                return None;
            }
            let value = leaf.values.remove(&lo);
            (value, leaf.present.is_empty())
        };
        let Some(value) = value else {
            tracing::error!(key, "present bit set without a stored value");
            return None;
        };

        if leaf_emptied {
            self.unlink_leaf(leaf_id);
            self.leaves.release(leaf_id);
        }

        let Some(t32) = self.root.get_mut(&hi) else {
            tracing::error!(key, "root segment missing during remove");
            return Some(value);
        };

        let t16_emptied = match t32.inward.get_mut(&mid) {
            Some(t16) => {
                t16.count -= 1;
                if leaf_emptied {
                    t16.inward.remove(&seg);
                    t16.outward.clear(seg);
                }
                let suffix = join8(seg, lo);
                if t16.count > 0 && (suffix == t16.min || suffix == t16.max) {
                    t16.refresh_bounds(&self.leaves);
                }
                t16.count == 0
            }
            None => {
                tracing::error!(key, "16-bit segment missing during remove");
                return Some(value);
            }
        };

        if t16_emptied {
            t32.inward.remove(&mid);
            t32.outward.remove(mid);
        }
        t32.count -= 1;
        let suffix = key as u32;
        if t32.count > 0 && (suffix == t32.min || suffix == t32.max) {
            t32.refresh_bounds();
        }
        let t32_emptied = t32.count == 0;

        if t32_emptied {
            self.root.remove(&hi);
            self.outward.remove(hi);
        }
        self.count -= 1;
        if self.count > 0 && (key == self.min || key == self.max) {
            self.refresh_bounds();
        }
        Some(value)
    }

    /// Entries in ascending key order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        let mut leaf = self.head;
        let mut cursor: Option<u8> = None;
        std::iter::from_fn(move || loop {
            let id = leaf?;
            let current = self.leaves.get(id)?;
            let next_lo = match cursor {
                None => current.present.min(),
                Some(c) => current.present.next_after(c),
            };
            match next_lo {
                Some(lo) => {
                    cursor = Some(lo);
                    let value = current.values.get(&lo)?;
                    return Some((current.base | lo as u64, value));
                }
                None => {
                    leaf = current.next;
                    cursor = None;
                }
            }
        })
    }

    fn locate_leaf(&self, key: u64) -> Option<LeafId> {
        let (hi, mid, seg, _) = split_key(key);
        let t32 = self.root.get(&hi)?;
        let t16 = t32.inward.get(&mid)?;
        t16.inward.get(&seg).copied()
    }

    fn next_from(&self, key: u64) -> Option<(u64, LeafId)> {
        if self.count == 0 || key > self.max {
            return None;
        }
        let hi = (key >> 32) as u32;
        if key > self.min {
            if let Some((suffix, leaf)) = self
                .root
                .get(&hi)
                .and_then(|t| t.next_from(key as u32, &self.leaves))
            {
                return Some((join32(hi, suffix), leaf));
            }
            let hi = self.outward.next_after(hi)?;
            let (suffix, leaf) = self.root.get(&hi)?.first()?;
            return Some((join32(hi, suffix), leaf));
        }
        let hi = (self.min >> 32) as u32;
        let (suffix, leaf) = self.root.get(&hi)?.first()?;
        Some((join32(hi, suffix), leaf))
    }

    fn prev_from(&self, key: u64) -> Option<(u64, LeafId)> {
        if self.count == 0 || key < self.min {
            return None;
        }
        let hi = (key >> 32) as u32;
        if key < self.max {
            if let Some((suffix, leaf)) = self
                .root
                .get(&hi)
                .and_then(|t| t.prev_from(key as u32, &self.leaves))
            {
                return Some((join32(hi, suffix), leaf));
            }
            let hi = self.outward.prev_before(hi)?;
            let (suffix, leaf) = self.root.get(&hi)?.last()?;
            return Some((join32(hi, suffix), leaf));
        }
        let hi = (self.max >> 32) as u32;
        let (suffix, leaf) = self.root.get(&hi)?.last()?;
        Some((join32(hi, suffix), leaf))
    }

    fn refresh_bounds(&mut self) {
        let bounds = (|| {
            let lo_seg = self.outward.min()?;
            let hi_seg = self.outward.max()?;
            let lo = self.root.get(&lo_seg)?.min;
            let hi = self.root.get(&hi_seg)?.max;
            Some((join32(lo_seg, lo), join32(hi_seg, hi)))
        })();
        match bounds {
            Some((min, max)) => {
                self.min = min;
                self.max = max;
            }
            None => tracing::error!("tree bounds unavailable with keys present"),
        }
    }

    /// Build the leaf for `key`, link it into key order and index it on
    /// every level. Tree counts are updated by the caller.
    fn create_leaf(&mut self, key: u64, value: V) -> Result<(), TreeError> {
        let (hi, mid, seg, lo) = split_key(key);
        let base = key & !0xFF;

        let pred = base
            .checked_sub(1)
            .and_then(|k| self.prev_from(k))
            .map(|(_, leaf)| leaf);

        let mut values = FastTable::new(self.config.tree_8)?;
        values.insert(lo, value)?;
        let mut present = BitVector256::new();
        present.set(lo);

        let next = match pred {
            Some(p) => self.leaves.get(p).and_then(|l| l.next),
            None => self.head,
        };
        let id = self.leaves.alloc(Leaf {
            base,
            present,
            values,
            prev: pred,
            next,
        });
        match pred.and_then(|p| self.leaves.get_mut(p)) {
            Some(p) => p.next = Some(id),
            None => self.head = Some(id),
        }
        match next.and_then(|n| self.leaves.get_mut(n)) {
            Some(n) => n.prev = Some(id),
            None => self.tail = Some(id),
        }

        if !self.root.contains_key(&hi) {
            self.root.insert(hi, Tree32::new(&self.config)?)?;
            self.outward.insert(hi)?;
        }
        let t32 = self
            .root
            .get_mut(&hi)
            .ok_or(TreeError::Corrupted("root segment missing after insert"))?;
        if !t32.inward.contains_key(&mid) {
            t32.inward.insert(mid, Tree16::new(&self.config)?)?;
            t32.outward.insert(mid)?;
        }
        let t16 = t32
            .inward
            .get_mut(&mid)
            .ok_or(TreeError::Corrupted("16-bit segment missing after insert"))?;
        t16.inward.insert(seg, id)?;
        t16.outward.set(seg);
        Ok(())
    }

    fn unlink_leaf(&mut self, id: LeafId) {
        let Some((prev, next)) = self.leaves.get(id).map(|l| (l.prev, l.next)) else {
            return;
        };
        match prev.and_then(|p| self.leaves.get_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.leaves.get_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }
}

#[inline(always)]
fn split_key(key: u64) -> (u32, u16, u8, u8) {
    ((key >> 32) as u32, (key >> 16) as u16, (key >> 8) as u8, key as u8)
}

#[inline(always)]
fn join8(seg: u8, lo: u8) -> u16 {
    ((seg as u16) << 8) | lo as u16
}

#[inline(always)]
fn join16(seg: u16, lo: u16) -> u32 {
    ((seg as u32) << 16) | lo as u32
}

#[inline(always)]
fn join32(seg: u32, lo: u32) -> u64 {
    ((seg as u64) << 32) | lo as u64
}
