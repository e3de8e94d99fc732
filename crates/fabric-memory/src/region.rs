//! Pinned-style host memory regions
//!
//! A region is a zeroed, page-aligned allocation whose bytes are only ever
//! touched through raw pointers. That matches how registered RDMA memory
//! behaves: the owner hands out addresses and the transport reads and
//! writes behind its back.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::mempool::MemoryError;

const REGION_ALIGN: usize = 4096;

/// Owned, page-aligned host allocation
#[derive(Debug)]
pub struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The region is plain bytes; synchronisation of overlapping accesses is the
// job of whoever owns the slot being accessed.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl HostRegion {
    /// Allocate `len` zeroed bytes
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        let layout = Layout::from_size_align(len.max(1), REGION_ALIGN)
            .map_err(|e| MemoryError::InvalidOp(format!("region of {len} bytes: {e}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| MemoryError::System(format!("allocation of {len} bytes failed")))?;
        Ok(Self { ptr, layout })
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Zero-length region
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Address of the first byte
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// True if `[addr, addr + len)` lies inside the region
    #[inline]
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.addr();
        addr >= start
            && (addr - start)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.len() as u64)
    }

    /// Copy `data` to `offset`.
    ///
    /// # Safety
    ///
    /// No other thread may access `[offset, offset + data.len())` for the
    /// duration of the call.
    pub unsafe fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check(offset, data.len())?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        Ok(())
    }

    /// Copy `out.len()` bytes from `offset` into `out`.
    ///
    /// # Safety
    ///
    /// No other thread may write `[offset, offset + out.len())` for the
    /// duration of the call.
    pub unsafe fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check(offset, out.len())?;
        std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        Ok(())
    }

    /// Zero `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`HostRegion::write_at`].
    pub unsafe fn zero(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        self.check(offset, len)?;
        std::ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len);
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(MemoryError::InvalidOp(format!(
                "access ({offset}, {len}) outside region of {} bytes",
                self.len()
            ))),
        }
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_zero() {
        let region = HostRegion::new(8192).unwrap();
        assert_eq!(region.addr() % REGION_ALIGN as u64, 0);

        let mut out = [0u8; 4];
        unsafe {
            region.write_at(4096, b"abcd").unwrap();
            region.read_at(4096, &mut out).unwrap();
        }
        assert_eq!(&out, b"abcd");

        unsafe {
            region.zero(4096, 4).unwrap();
            region.read_at(4096, &mut out).unwrap();
        }
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_bounds() {
        let region = HostRegion::new(16).unwrap();
        assert!(unsafe { region.write_at(12, b"hello") }.is_err());
        assert!(region.contains(region.addr() + 8, 8));
        assert!(!region.contains(region.addr() + 8, 9));
        assert!(!region.contains(region.addr() - 1, 1));
    }
}
