//! Fabric Structures - Indexing primitives for range and id bookkeeping
//!
//! Everything here is single-threaded and allocation-lazy; owners wrap the
//! structures in their own locks.
//!
//! | Structure | Role |
//! |-----------|------|
//! | [`FastTable`] | Resizable open-addressed map with bitmap probing |
//! | [`FastList`] | Arena-backed doubly linked list of `u64` |
//! | [`FastTree`] | 32/16/8/8 radix tree with neighbour search |
//! | [`BitVector256`] | 256-bit presence vector with next/prev scans |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitvec;
pub mod fast_list;
pub mod fast_table;
pub mod fast_tree;
pub mod hash;
mod presence;

pub use bitvec::{BitVector256, SlotBitmap};
pub use fast_list::{FastList, NodeId};
pub use fast_table::{FastTable, TableError};
pub use fast_tree::{FastTree, FastTreeConfig, LeafId, SearchHit, SearchMode, TreeError, TreeInsert};
pub use hash::FastHash;
