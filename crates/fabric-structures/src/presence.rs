//! Value-free presence sets over 16- and 32-bit segments.
//!
//! These are the "outward" indices of the fast tree: they only record which
//! child segments are populated, so next/prev segment queries never touch
//! the value-bearing levels.

use fabric_common::TableConfig;

use crate::bitvec::BitVector256;
use crate::fast_table::{FastTable, TableError};

/// Set of `u16`: a byte-keyed table of 256-bit vectors plus a top vector of
/// populated high bytes.
#[derive(Debug, Clone)]
pub struct Set16 {
    inward: FastTable<u8, BitVector256>,
    outward: BitVector256,
    count: u32,
}

impl Set16 {
    pub fn new(byte_level: TableConfig) -> Result<Self, TableError> {
        Ok(Self {
            inward: FastTable::new(byte_level)?,
            outward: BitVector256::new(),
            count: 0,
        })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[cfg(test)]
    pub fn len(&self) -> u32 {
        self.count
    }

    #[cfg(test)]
    pub fn contains(&self, x: u16) -> bool {
        let (hi, lo) = split16(x);
        self.inward.get(&hi).is_some_and(|bv| bv.test(lo))
    }

    /// Returns true if `x` was newly added
    pub fn insert(&mut self, x: u16) -> Result<bool, TableError> {
        let (hi, lo) = split16(x);
        let added = self.inward.get_or_insert_with(hi, BitVector256::new)?.set(lo);
        self.outward.set(hi);
        if added {
            self.count += 1;
        }
        Ok(added)
    }

    /// Returns true if `x` was present
    pub fn remove(&mut self, x: u16) -> bool {
        let (hi, lo) = split16(x);
        let Some(bv) = self.inward.get_mut(&hi) else {
            return false;
        };
        if !bv.clear(lo) {
            return false;
        }
        if bv.is_empty() {
            self.inward.remove(&hi);
            self.outward.clear(hi);
        }
        self.count -= 1;
        true
    }

    pub fn min(&self) -> Option<u16> {
        let hi = self.outward.min()?;
        let lo = self.inward.get(&hi)?.min()?;
        Some(join16(hi, lo))
    }

    pub fn max(&self) -> Option<u16> {
        let hi = self.outward.max()?;
        let lo = self.inward.get(&hi)?.max()?;
        Some(join16(hi, lo))
    }

    /// Smallest member `>= x`
    pub fn next_from(&self, x: u16) -> Option<u16> {
        let (hi, lo) = split16(x);
        if let Some(found) = self.inward.get(&hi).and_then(|bv| bv.next_from(lo)) {
            return Some(join16(hi, found));
        }
        let hi = self.outward.next_after(hi)?;
        let lo = self.inward.get(&hi)?.min()?;
        Some(join16(hi, lo))
    }

    /// Largest member `<= x`
    pub fn prev_from(&self, x: u16) -> Option<u16> {
        let (hi, lo) = split16(x);
        if let Some(found) = self.inward.get(&hi).and_then(|bv| bv.prev_from(lo)) {
            return Some(join16(hi, found));
        }
        let hi = self.outward.prev_before(hi)?;
        let lo = self.inward.get(&hi)?.max()?;
        Some(join16(hi, lo))
    }

    #[inline]
    pub fn next_after(&self, x: u16) -> Option<u16> {
        x.checked_add(1).and_then(|x| self.next_from(x))
    }

    #[inline]
    pub fn prev_before(&self, x: u16) -> Option<u16> {
        x.checked_sub(1).and_then(|x| self.prev_from(x))
    }
}

/// Set of `u32`: a `u16`-keyed table of [`Set16`] plus a [`Set16`] of
/// populated high halves.
#[derive(Debug, Clone)]
pub struct Set32 {
    inward: FastTable<u16, Set16>,
    outward: Set16,
    byte_level: TableConfig,
    count: u64,
}

impl Set32 {
    pub fn new(half_level: TableConfig, byte_level: TableConfig) -> Result<Self, TableError> {
        Ok(Self {
            inward: FastTable::new(half_level)?,
            outward: Set16::new(byte_level)?,
            byte_level,
            count: 0,
        })
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[cfg(test)]
    pub fn contains(&self, x: u32) -> bool {
        let (hi, lo) = split32(x);
        self.inward.get(&hi).is_some_and(|s| s.contains(lo))
    }

    pub fn insert(&mut self, x: u32) -> Result<bool, TableError> {
        let (hi, lo) = split32(x);
        if !self.inward.contains_key(&hi) {
            self.inward.insert(hi, Set16::new(self.byte_level)?)?;
        }
        let added = match self.inward.get_mut(&hi) {
            Some(set) => set.insert(lo)?,
            None => return Err(TableError::Corrupted("inserted segment missing")),
        };
        self.outward.insert(hi)?;
        if added {
            self.count += 1;
        }
        Ok(added)
    }

    pub fn remove(&mut self, x: u32) -> bool {
        let (hi, lo) = split32(x);
        let Some(set) = self.inward.get_mut(&hi) else {
            return false;
        };
        if !set.remove(lo) {
            return false;
        }
        if set.is_empty() {
            self.inward.remove(&hi);
            self.outward.remove(hi);
        }
        self.count -= 1;
        true
    }

    pub fn min(&self) -> Option<u32> {
        let hi = self.outward.min()?;
        let lo = self.inward.get(&hi)?.min()?;
        Some(join32(hi, lo))
    }

    pub fn max(&self) -> Option<u32> {
        let hi = self.outward.max()?;
        let lo = self.inward.get(&hi)?.max()?;
        Some(join32(hi, lo))
    }

    pub fn next_from(&self, x: u32) -> Option<u32> {
        let (hi, lo) = split32(x);
        if let Some(found) = self.inward.get(&hi).and_then(|s| s.next_from(lo)) {
            return Some(join32(hi, found));
        }
        let hi = self.outward.next_after(hi)?;
        let lo = self.inward.get(&hi)?.min()?;
        Some(join32(hi, lo))
    }

    pub fn prev_from(&self, x: u32) -> Option<u32> {
        let (hi, lo) = split32(x);
        if let Some(found) = self.inward.get(&hi).and_then(|s| s.prev_from(lo)) {
            return Some(join32(hi, found));
        }
        let hi = self.outward.prev_before(hi)?;
        let lo = self.inward.get(&hi)?.max()?;
        Some(join32(hi, lo))
    }

    #[inline]
    pub fn next_after(&self, x: u32) -> Option<u32> {
        x.checked_add(1).and_then(|x| self.next_from(x))
    }

    #[inline]
    pub fn prev_before(&self, x: u32) -> Option<u32> {
        x.checked_sub(1).and_then(|x| self.prev_from(x))
    }
}

#[inline(always)]
fn split16(x: u16) -> (u8, u8) {
    ((x >> 8) as u8, x as u8)
}

#[inline(always)]
fn join16(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

#[inline(always)]
fn split32(x: u32) -> (u16, u16) {
    ((x >> 16) as u16, x as u16)
}

#[inline(always)]
fn join32(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set16_neighbours() {
        let mut s = Set16::new(TableConfig::tree_8()).unwrap();
        for x in [5u16, 0x0100, 0x01FF, 0xFF00] {
            assert!(s.insert(x).unwrap());
        }
        assert!(!s.insert(5).unwrap());

        assert_eq!(s.min(), Some(5));
        assert_eq!(s.max(), Some(0xFF00));
        assert_eq!(s.next_from(6), Some(0x0100));
        assert_eq!(s.next_after(0x01FF), Some(0xFF00));
        assert_eq!(s.prev_from(0x00FF), Some(5));
        assert_eq!(s.prev_before(5), None);

        assert!(s.remove(0x0100));
        assert!(s.remove(0x01FF));
        assert_eq!(s.next_from(6), Some(0xFF00));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_set32_neighbours() {
        let mut s = Set32::new(TableConfig::tree_16(), TableConfig::tree_8()).unwrap();
        for x in [0u32, 0x0001_0000, 0xDEAD_BEEF, u32::MAX] {
            s.insert(x).unwrap();
        }
        assert_eq!(s.next_after(0), Some(0x0001_0000));
        assert_eq!(s.next_after(0x0001_0000), Some(0xDEAD_BEEF));
        assert_eq!(s.prev_before(u32::MAX), Some(0xDEAD_BEEF));
        assert_eq!(s.next_after(u32::MAX), None);

        assert!(s.remove(0xDEAD_BEEF));
        assert!(!s.contains(0xDEAD_BEEF));
        assert_eq!(s.prev_before(u32::MAX), Some(0x0001_0000));
        assert_eq!(s.max(), Some(u32::MAX));
        assert_eq!(s.min(), Some(0));
    }
}
