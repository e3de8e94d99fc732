//! Bitvector primitives
//!
//! Two shapes are needed: a fixed 256-bit vector (one bit per byte value)
//! used by every fast-tree level, and a growable slot bitmap used by the hash
//! table to find the next empty or occupied slot.
//!
//! # Design
//! - Scans work a word at a time with `trailing_zeros`/`leading_zeros`
//! - Bits are numbered from the least significant bit of word 0

/// 256 presence bits, one per `u8` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct BitVector256 {
    words: [u64; 4],
}

impl BitVector256 {
    /// All bits clear
    #[inline]
    pub const fn new() -> Self {
        Self { words: [0; 4] }
    }

    /// Set bit `i`; returns true if it was previously clear
    #[inline]
    pub fn set(&mut self, i: u8) -> bool {
        let (w, b) = split(i);
        let was_clear = self.words[w] & (1 << b) == 0;
        self.words[w] |= 1 << b;
        was_clear
    }

    /// Clear bit `i`; returns true if it was previously set
    #[inline]
    pub fn clear(&mut self, i: u8) -> bool {
        let (w, b) = split(i);
        let was_set = self.words[w] & (1 << b) != 0;
        self.words[w] &= !(1 << b);
        was_set
    }

    /// Test bit `i`
    #[inline]
    pub fn test(&self, i: u8) -> bool {
        let (w, b) = split(i);
        self.words[w] & (1 << b) != 0
    }

    /// No bit set
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of set bits
    #[inline]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Lowest set bit
    #[inline]
    pub fn min(&self) -> Option<u8> {
        self.next_from(0)
    }

    /// Highest set bit
    #[inline]
    pub fn max(&self) -> Option<u8> {
        self.prev_from(255)
    }

    /// Lowest set bit `>= i`
    pub fn next_from(&self, i: u8) -> Option<u8> {
        let (mut w, b) = split(i);
        let mut word = self.words[w] & (u64::MAX << b);
        loop {
            if word != 0 {
                return Some((w * 64 + word.trailing_zeros() as usize) as u8);
            }
            w += 1;
            if w == 4 {
                return None;
            }
            word = self.words[w];
        }
    }

    /// Lowest set bit `> i`
    #[inline]
    pub fn next_after(&self, i: u8) -> Option<u8> {
        if i == u8::MAX {
            return None;
        }
        self.next_from(i + 1)
    }

    /// Highest set bit `<= i`
    pub fn prev_from(&self, i: u8) -> Option<u8> {
        let (mut w, b) = split(i);
        let mut word = self.words[w] & (u64::MAX >> (63 - b));
        loop {
            if word != 0 {
                return Some((w * 64 + 63 - word.leading_zeros() as usize) as u8);
            }
            if w == 0 {
                return None;
            }
            w -= 1;
            word = self.words[w];
        }
    }

    /// Highest set bit `< i`
    #[inline]
    pub fn prev_before(&self, i: u8) -> Option<u8> {
        if i == 0 {
            return None;
        }
        self.prev_from(i - 1)
    }

    /// Set bits in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        let mut cursor = self.min();
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.next_after(current);
            Some(current)
        })
    }
}

#[inline(always)]
fn split(i: u8) -> (usize, u32) {
    ((i >> 6) as usize, (i & 63) as u32)
}

/// Growable bitmap over table slots.
#[derive(Debug, Clone, Default)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
}

impl SlotBitmap {
    /// `len` bits, all set
    pub fn all_set(len: usize) -> Self {
        let mut words = vec![u64::MAX; len.div_ceil(64)];
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self { words, len }
    }

    /// Number of bits
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Zero-length bitmap
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Test bit `i`
    #[inline]
    pub fn test(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// Set bit `i`
    #[inline]
    pub fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    /// Clear bit `i`
    #[inline]
    pub fn clear(&mut self, i: usize) {
        self.words[i / 64] &= !(1 << (i % 64));
    }

    /// Lowest set bit in `start..len`
    pub fn next_set_from(&self, start: usize) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let mut w = start / 64;
        let mut word = self.words[w] & (u64::MAX << (start % 64));
        loop {
            if word != 0 {
                let idx = w * 64 + word.trailing_zeros() as usize;
                return (idx < self.len).then_some(idx);
            }
            w += 1;
            if w == self.words.len() {
                return None;
            }
            word = self.words[w];
        }
    }

    /// Lowest set bit at or after `start`, wrapping to the front
    #[inline]
    pub fn next_set_wrapping(&self, start: usize) -> Option<usize> {
        self.next_set_from(start).or_else(|| self.next_set_from(0))
    }

    /// Lowest clear bit in `start..len`
    pub fn next_clear_from(&self, start: usize) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let mut w = start / 64;
        let mut word = !self.words[w] & (u64::MAX << (start % 64));
        loop {
            if word != 0 {
                let idx = w * 64 + word.trailing_zeros() as usize;
                return (idx < self.len).then_some(idx);
            }
            w += 1;
            if w == self.words.len() {
                return None;
            }
            word = !self.words[w];
        }
    }
}
