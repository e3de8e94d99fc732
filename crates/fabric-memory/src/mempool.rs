//! Chunked Memory Pool
//!
//! Manages a fixed address space of `num_chunks` equally sized chunks.
//!
//! # Design
//!
//! - Free ranges are indexed by size in a [`FastTree`]; each size maps to a
//!   [`FastList`] of range starts, oldest first
//! - `endpoints` maps the first and last chunk of every free range to the
//!   range, so release finds its neighbours with two point lookups
//! - `by_start` orders free ranges by first chunk, which lets release reject
//!   any range that overlaps free memory
//! - Reserve is best fit by size: `EqualOrNext` on the tree, then split
//! - Release coalesces with both neighbours and updates the surviving outer
//!   endpoints in place

use std::fmt;

use fabric_common::{Classify, ErrorClass, TableConfig};
use fabric_structures::{FastList, FastTable, FastTree, NodeId, SearchMode, TableError, TreeError};

/// Pool identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolId {
    /// Host memory
    System,
    /// Memory of one device
    Device(u32),
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::System => f.write_str("system"),
            PoolId::Device(id) => write!(f, "device-{id}"),
        }
    }
}

/// Memory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("pool {pool} out of memory: requested {requested} chunks, {free} free, largest range {largest}")]
    PoolOom {
        pool: PoolId,
        requested: u64,
        free: u64,
        largest: u64,
    },

    #[error("memory system error: {0}")]
    System(String),

    #[error("invalid memory operation: {0}")]
    InvalidOp(String),

    #[error("unknown pool {0}")]
    UnknownPool(PoolId),
}

impl Classify for MemoryError {
    fn class(&self) -> ErrorClass {
        match self {
            MemoryError::PoolOom { .. } => ErrorClass::Recoverable,
            MemoryError::System(_) => ErrorClass::Fatal,
            MemoryError::InvalidOp(_) | MemoryError::UnknownPool(_) => ErrorClass::Invalid,
        }
    }
}

impl From<TableError> for MemoryError {
    fn from(e: TableError) -> Self {
        MemoryError::System(e.to_string())
    }
}

impl From<TreeError> for MemoryError {
    fn from(e: TreeError) -> Self {
        MemoryError::System(e.to_string())
    }
}

/// A granted range of chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Pool that granted the range
    pub pool_id: PoolId,
    /// Bytes requested
    pub size_bytes: u64,
    /// First chunk
    pub start_chunk_id: u64,
    /// Chunks granted (`ceil(size_bytes / chunk_size)`)
    pub num_chunks: u64,
    /// Address of the first byte
    pub buffer: u64,
}

/// Free range as seen from one of its endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    /// First chunk of the range
    pub start: u64,
    /// Chunks in the range
    pub size: u64,
    node: NodeId,
}

impl MemRange {
    #[inline]
    fn end(&self) -> u64 {
        self.start + self.size - 1
    }
}

/// Best-fit chunk allocator over one address space
#[derive(Debug)]
pub struct Mempool {
    pool_id: PoolId,
    base: u64,
    chunk_size: u64,
    num_chunks: u64,
    free_chunks: u64,
    ranges: FastTree<FastList>,
    endpoints: FastTable<u64, MemRange>,
    /// Free range start to size
    by_start: FastTree<u64>,
    list_capacity: usize,
}

impl Mempool {
    /// Pool over `num_chunks * chunk_size` bytes starting at `base`, all free
    pub fn new(
        pool_id: PoolId,
        base: u64,
        num_chunks: u64,
        chunk_size: u64,
        list_capacity: usize,
    ) -> Result<Self, MemoryError> {
        if num_chunks == 0 || chunk_size == 0 {
            return Err(MemoryError::InvalidOp(format!(
                "pool {pool_id} needs chunks (num_chunks {num_chunks}, chunk_size {chunk_size})"
            )));
        }

        let mut pool = Self {
            pool_id,
            base,
            chunk_size,
            num_chunks,
            free_chunks: 0,
            ranges: FastTree::new()?,
            endpoints: FastTable::new(TableConfig::mempool_endpoints(num_chunks))?,
            by_start: FastTree::new()?,
            list_capacity,
        };
        pool.insert_free_range(0, num_chunks)?;

        tracing::debug!(pool = %pool_id, num_chunks, chunk_size, "mempool initialized");
        Ok(pool)
    }

    /// Pool identity
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Bytes per chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Chunks managed
    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Chunks not reserved
    pub fn free_chunks(&self) -> u64 {
        self.free_chunks
    }

    /// Size of the largest free range
    pub fn largest_free_range(&self) -> u64 {
        self.ranges.max().unwrap_or(0)
    }

    /// Number of disjoint free ranges
    pub fn num_free_ranges(&self) -> usize {
        self.ranges.iter().map(|(_, list)| list.len()).sum()
    }

    /// Free ranges as `(start, size)`, sorted by start
    pub fn free_ranges(&self) -> Vec<(u64, u64)> {
        let mut out: Vec<(u64, u64)> = self
            .ranges
            .iter()
            .flat_map(|(size, list)| list.iter().map(move |start| (start, size)))
            .collect();
        out.sort_unstable();
        out
    }

    /// Reserve enough whole chunks for `size_bytes`
    pub fn reserve(&mut self, size_bytes: u64) -> Result<Reservation, MemoryError> {
        if size_bytes == 0 {
            return Err(MemoryError::InvalidOp(format!(
                "zero-byte reservation on pool {}",
                self.pool_id
            )));
        }

        let requested = size_bytes.div_ceil(self.chunk_size);
        let largest = self.largest_free_range();
        if requested > self.free_chunks || requested > largest {
            tracing::debug!(
                pool = %self.pool_id,
                requested,
                free = self.free_chunks,
                largest,
                "reservation does not fit"
            );
            metrics::counter!("fabric.mempool.oom").increment(1);
            return Err(MemoryError::PoolOom {
                pool: self.pool_id,
                requested,
                free: self.free_chunks,
                largest,
            });
        }

        let range_size = self
            .ranges
            .search(requested, SearchMode::EqualOrNext)
            .map(|hit| hit.key)
            .ok_or_else(|| self.system_error(format!("no range >= {requested} below max {largest}")))?;

        let start = self.take_start(range_size)?;
        self.by_start.remove(start);
        self.endpoints.remove(&start);
        if range_size > 1 {
            self.endpoints.remove(&(start + range_size - 1));
        }
        self.free_chunks -= range_size;

        if range_size > requested {
            self.insert_free_range(start + requested, range_size - requested)?;
        }

        metrics::counter!("fabric.mempool.reserve").increment(1);
        Ok(Reservation {
            pool_id: self.pool_id,
            size_bytes,
            start_chunk_id: start,
            num_chunks: requested,
            buffer: self.base + start * self.chunk_size,
        })
    }

    /// Return a reservation, merging it with adjacent free ranges
    pub fn release(&mut self, reservation: &Reservation) -> Result<(), MemoryError> {
        self.validate_release(reservation)?;

        let start = reservation.start_chunk_id;
        let count = reservation.num_chunks;
        let end = start + count - 1;

        let left = start
            .checked_sub(1)
            .and_then(|prev| self.endpoints.get(&prev).copied());
        let right = (end + 1 < self.num_chunks)
            .then(|| self.endpoints.get(&(end + 1)).copied())
            .flatten();

        if let Some(l) = left {
            if l.end() != start - 1 {
                return Err(self.invalid(format!("chunk {start} already inside free range at {}", l.start)));
            }
        }
        if let Some(r) = right {
            if r.start != end + 1 {
                return Err(self.invalid(format!("chunk {end} already inside free range at {}", r.start)));
            }
        }

        // Detach neighbours from their size buckets.
        match (left, right) {
            (Some(l), Some(r)) if l.size == r.size => {
                let list = self
                    .ranges
                    .get_mut(l.size)
                    .ok_or_else(|| MemoryError::System(format!("bucket {} missing", l.size)))?;
                let detached = list.remove(l.node).is_some() && list.remove(r.node).is_some();
                let emptied = list.is_empty();
                if !detached {
                    return Err(self.system_error(format!("neighbours missing from bucket {}", l.size)));
                }
                if emptied {
                    self.ranges.remove(l.size);
                }
            }
            _ => {
                for neighbour in [left, right].into_iter().flatten() {
                    self.detach(neighbour)?;
                }
            }
        }

        let merged_start = left.map_or(start, |l| l.start);
        let merged_end = right.map_or(end, |r| r.end());
        let merged_size = merged_end - merged_start + 1;

        if let Some(l) = left.filter(|l| l.size > 1) {
            self.endpoints.remove(&l.end());
        }
        if let Some(r) = right.filter(|r| r.size > 1) {
            self.endpoints.remove(&r.start);
        }
        if let Some(r) = right {
            self.by_start.remove(r.start);
        }
        self.by_start.insert(merged_start, merged_size, true)?;

        let node = self.bucket_push(merged_size, merged_start)?;
        let merged = MemRange {
            start: merged_start,
            size: merged_size,
            node,
        };
        self.write_endpoint(merged_start, merged, left.is_some())?;
        if merged_size > 1 {
            self.write_endpoint(merged_end, merged, right.is_some())?;
        }
        self.free_chunks += count;

        metrics::counter!("fabric.mempool.release").increment(1);
        Ok(())
    }

    /// Check that the indexes agree with each other.
    ///
    /// Walks every free range; meant for tests and debugging.
    pub fn audit(&self) -> Result<(), MemoryError> {
        let ranges = self.free_ranges();
        let total: u64 = ranges.iter().map(|(_, size)| size).sum();
        if total != self.free_chunks {
            return Err(MemoryError::System(format!(
                "free ranges sum to {total}, counter says {}",
                self.free_chunks
            )));
        }
        for pair in ranges.windows(2) {
            let (a_start, a_size) = pair[0];
            if a_start + a_size >= pair[1].0 {
                return Err(MemoryError::System(format!(
                    "ranges at {a_start} and {} overlap or touch",
                    pair[1].0
                )));
            }
        }
        let indexed: Vec<(u64, u64)> = self.by_start.iter().map(|(start, size)| (start, *size)).collect();
        if indexed != ranges {
            return Err(MemoryError::System(format!(
                "start index holds {} ranges, size buckets {}",
                indexed.len(),
                ranges.len()
            )));
        }
        let expected_endpoints: usize = ranges.iter().map(|&(_, size)| if size > 1 { 2 } else { 1 }).sum();
        if expected_endpoints != self.endpoints.len() {
            return Err(MemoryError::System(format!(
                "{} endpoints for {} ranges",
                self.endpoints.len(),
                ranges.len()
            )));
        }
        for (start, size) in ranges {
            for chunk in [start, start + size - 1] {
                match self.endpoints.get(&chunk) {
                    Some(r) if r.start == start && r.size == size => {}
                    _ => {
                        return Err(MemoryError::System(format!(
                            "endpoint {chunk} of range ({start}, {size}) missing or stale"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_release(&self, r: &Reservation) -> Result<(), MemoryError> {
        if r.pool_id != self.pool_id {
            return Err(self.invalid(format!("reservation belongs to pool {}", r.pool_id)));
        }
        if r.num_chunks == 0 {
            return Err(self.invalid("empty reservation".into()));
        }
        let in_bounds = r
            .start_chunk_id
            .checked_add(r.num_chunks)
            .is_some_and(|end| end <= self.num_chunks);
        if !in_bounds {
            return Err(self.invalid(format!(
                "range ({}, {}) outside {} chunks",
                r.start_chunk_id, r.num_chunks, self.num_chunks
            )));
        }
        let end = r.start_chunk_id + r.num_chunks - 1;
        let below = self
            .by_start
            .search(r.start_chunk_id, SearchMode::EqualOrPrev)
            .is_some_and(|hit| hit.key + *hit.value > r.start_chunk_id);
        let above = self
            .by_start
            .search(r.start_chunk_id, SearchMode::EqualOrNext)
            .is_some_and(|hit| hit.key <= end);
        if below || above {
            return Err(self.invalid(format!(
                "release of ({}, {}) overlaps free memory",
                r.start_chunk_id, r.num_chunks
            )));
        }
        Ok(())
    }

    /// Pop the oldest start of `size`, dropping the bucket once empty.
    fn take_start(&mut self, size: u64) -> Result<u64, MemoryError> {
        let list = self
            .ranges
            .get_mut(size)
            .ok_or_else(|| MemoryError::System(format!("bucket {size} missing")))?;
        let start = list.pop_front();
        let emptied = list.is_empty();
        if emptied {
            self.ranges.remove(size);
        }
        start.ok_or_else(|| self.system_error(format!("bucket {size} was empty")))
    }

    fn detach(&mut self, range: MemRange) -> Result<(), MemoryError> {
        let list = self
            .ranges
            .get_mut(range.size)
            .ok_or_else(|| MemoryError::System(format!("bucket {} missing", range.size)))?;
        let removed = list.remove(range.node);
        let emptied = list.is_empty();
        if emptied {
            self.ranges.remove(range.size);
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(self.system_error(format!("range at {} missing from its bucket", range.start))),
        }
    }

    fn bucket_push(&mut self, size: u64, start: u64) -> Result<NodeId, MemoryError> {
        if self.ranges.get(size).is_none() {
            self.ranges
                .insert(size, FastList::with_capacity(self.list_capacity), false)?;
        }
        self.ranges
            .get_mut(size)
            .map(|list| list.push_back(start))
            .ok_or_else(|| MemoryError::System(format!("bucket {size} vanished")))
    }

    fn write_endpoint(&mut self, chunk: u64, range: MemRange, existing: bool) -> Result<(), MemoryError> {
        if existing {
            match self.endpoints.get_mut(&chunk) {
                Some(slot) => *slot = range,
                None => return Err(self.system_error(format!("surviving endpoint {chunk} missing"))),
            }
        } else {
            self.endpoints.insert(chunk, range)?;
        }
        Ok(())
    }

    fn insert_free_range(&mut self, start: u64, size: u64) -> Result<(), MemoryError> {
        let node = self.bucket_push(size, start)?;
        self.by_start.insert(start, size, false)?;
        let range = MemRange { start, size, node };
        self.endpoints.insert(start, range)?;
        if size > 1 {
            self.endpoints.insert(start + size - 1, range)?;
        }
        self.free_chunks += size;
        Ok(())
    }

    fn system_error(&self, detail: String) -> MemoryError {
        tracing::error!(pool = %self.pool_id, %detail, "mempool invariant violated");
        MemoryError::System(detail)
    }

    fn invalid(&self, detail: String) -> MemoryError {
        tracing::warn!(pool = %self.pool_id, %detail, "rejected mempool operation");
        MemoryError::InvalidOp(detail)
    }
}
