//! Fixed-width hash functions
//!
//! Each key width has its own mixer: integer mixes for 64 and 32 bits, and a
//! Pearson permutation for 16 and 8 bits. The Pearson table is a permutation
//! of `0..=255`, so byte keys never collide in a 256-slot table.

use fabric_common::Fingerprint;

/// Hash used by [`FastTable`](crate::FastTable) to pick a home slot.
pub trait FastHash {
    /// 64-bit hash; the table reduces it modulo its size
    fn fast_hash(&self) -> u64;
}

static PEARSON: [u8; 256] = [
     64,  67,  45, 157, 253, 237, 236, 112,  17,  69,  61, 182, 173,  44, 235, 153,
    102, 223, 251,  95, 166, 136, 160,  25,  60, 198, 146,  62,  87, 200,  71, 169,
    220,   5, 131, 133, 138,  99,  73,  48, 129,  96, 130, 139, 233, 246, 248,  41,
    150, 175,  98, 214,  74, 177,  66, 219, 105,  78,  65,  32,  94,  16, 240,  14,
     68, 174,  37,  81, 238, 107,  88, 135,  13, 180, 132,  28, 155, 222, 228,  70,
     92, 232, 163, 168, 103, 167, 190,  91, 206, 205,  24, 179, 161, 255,  83,  31,
    208,  12, 148, 189,  79, 106,  51, 137, 122, 159, 178, 224,  72, 191, 225,  11,
     18, 193,   8, 126,  84,  50, 114, 140, 247, 215,   9, 221, 171, 152, 196,  59,
    242,  35, 244,  56, 213, 164,  76, 209, 245, 226, 197,  75, 158, 216, 147, 211,
     52, 186,   1, 195, 201,  46, 172, 165,  85, 170, 185,   0, 254,   7,  80, 144,
    141,   6,  89, 217, 128,  86,  30, 121, 113, 184, 199, 252, 110,  57, 188,  54,
    231, 183, 187, 156,  63,  47,  39, 118, 124,  90, 207,  43, 116,   2,  26, 212,
    202, 234, 203, 218,  93, 210,  34,  55,  29, 101, 192,  21,  40,  49, 249,  82,
    100, 230, 204,  20, 125, 239, 145, 108, 111,  27, 176,   4,  53, 241, 229,   3,
    143,  77,  15, 149,  23, 154,  58,  36, 109, 123, 134, 119, 162, 104, 243, 127,
     22,  42,  10,  19, 227, 115, 117,  33, 250,  38,  97, 151, 120, 194, 142, 181,
];

/// Thomas Wang 64-bit integer mix
#[inline]
pub fn hash_u64(key: u64) -> u64 {
    let mut key = (key << 21).wrapping_sub(key).wrapping_sub(1);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key.wrapping_add(key << 31)
}

/// Robert Jenkins 32-bit integer mix
#[inline]
pub fn hash_u32(key: u32) -> u32 {
    let mut key = key.wrapping_add(0x7ed5_5d16).wrapping_add(key << 12);
    key = (key ^ 0xc761_c23c) ^ (key >> 19);
    key = key.wrapping_add(0x1656_67b1).wrapping_add(key << 5);
    key = key.wrapping_add(0xd3a2_646c) ^ (key << 9);
    key = key.wrapping_add(0xfd70_46c5).wrapping_add(key << 3);
    (key ^ 0xb55a_4f09) ^ (key >> 16)
}

/// Two-round Pearson hash over both bytes
#[inline]
pub fn hash_u16(key: u16) -> u16 {
    let lo = (key & 0xFF) as u8;
    let hi = (key >> 8) as u8;
    let h1 = PEARSON[(PEARSON[lo as usize] ^ hi) as usize];
    let h2 = PEARSON[(PEARSON[(lo ^ 1) as usize] ^ hi) as usize];
    ((h2 as u16) << 8) | h1 as u16
}

/// Single Pearson lookup
#[inline]
pub fn hash_u8(key: u8) -> u8 {
    PEARSON[key as usize]
}

impl FastHash for u64 {
    #[inline]
    fn fast_hash(&self) -> u64 {
        hash_u64(*self)
    }
}

impl FastHash for u32 {
    #[inline]
    fn fast_hash(&self) -> u64 {
        hash_u32(*self) as u64
    }
}

impl FastHash for u16 {
    #[inline]
    fn fast_hash(&self) -> u64 {
        hash_u16(*self) as u64
    }
}

impl FastHash for u8 {
    #[inline]
    fn fast_hash(&self) -> u64 {
        hash_u8(*self) as u64
    }
}

impl FastHash for Fingerprint {
    #[inline]
    fn fast_hash(&self) -> u64 {
        self.low_u64()
    }
}
