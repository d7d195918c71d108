// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Guest physical memory and the frame pool.
//!
//! All guest physical memory is one page-aligned host allocation.
//! [`FramePool`] hands out zeroed 4 KiB frames from it and tracks a
//! refcount per frame so pages can be shared between cloned page tables.
//! Ownership transitions: pool → page-table entry on map; entry → pool on
//! unmap, after the refcount drops to zero.

use crate::address::{Address, PhysAddr};
use crate::error::MemError;
use crate::types::PAGE_SIZE;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::{Arc, Mutex};

/// Shared handle to the frame pool; the "allocator handle" member of an
/// address space. Single-writer in the host: guest code can only reach it
/// through address-space operations.
pub type FramePoolRef = Arc<Mutex<FramePool>>;

/// The host allocation backing guest physical memory. Guest physical
/// address 0 is the first byte of the allocation.
#[derive(Debug)]
pub struct GuestMemory {
    base: *mut u8,
    size: usize,
}

// The allocation is uniquely owned and only reached through &/&mut self.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Allocates `size` bytes of zeroed, page-aligned backing memory.
    pub fn new(size: usize) -> Result<Self, MemError> {
        assert!(size > 0 && size % PAGE_SIZE == 0);
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| MemError::OutOfMemory)?;
        // SAFETY: layout has non-zero size and valid alignment.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(MemError::OutOfMemory);
        }
        Ok(Self { base, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Host pointer to guest physical address 0, for registering the
    /// region with the virtualization container.
    pub fn host_base(&self) -> *mut u8 {
        self.base
    }

    fn check_range(&self, paddr: PhysAddr, len: usize) -> Result<usize, MemError> {
        let start = usize::try_from(paddr.bits()).map_err(|_| MemError::NotMapped)?;
        let end = start.checked_add(len).ok_or(MemError::NotMapped)?;
        if end > self.size {
            return Err(MemError::NotMapped);
        }
        Ok(start)
    }

    pub fn slice(&self, paddr: PhysAddr, len: usize) -> Result<&[u8], MemError> {
        let start = self.check_range(paddr, len)?;
        // SAFETY: the range was checked against the allocation bounds.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(start), len) })
    }

    pub fn slice_mut(&mut self, paddr: PhysAddr, len: usize) -> Result<&mut [u8], MemError> {
        let start = self.check_range(paddr, len)?;
        // SAFETY: the range was checked against the allocation bounds.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(start), len) })
    }

    /// Reads one page-table entry sized word at `paddr`.
    pub fn read_u64(&self, paddr: PhysAddr) -> Result<u64, MemError> {
        let bytes = self.slice(paddr, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Writes one page-table entry sized word at `paddr`.
    pub fn write_u64(&mut self, paddr: PhysAddr, value: u64) -> Result<(), MemError> {
        let bytes = self.slice_mut(paddr, 8)?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
        // SAFETY: base was allocated with exactly this layout.
        unsafe { dealloc(self.base, layout) };
    }
}

/// Allocator for 4 KiB guest physical frames.
#[derive(Debug)]
pub struct FramePool {
    mem: GuestMemory,
    /// Bump cursor: frames below it have been handed out at least once.
    next: u64,
    /// Frames returned to the pool, reused before the cursor moves.
    free: Vec<PhysAddr>,
    /// Refcount per frame, indexed by pfn. Zero means pool-owned.
    refcounts: Vec<u32>,
}

impl FramePool {
    pub fn new(mem_size: usize) -> Result<Self, MemError> {
        let mem = GuestMemory::new(mem_size)?;
        let nframes = mem_size / PAGE_SIZE;
        Ok(Self {
            mem,
            next: 0,
            free: Vec::new(),
            refcounts: vec![0; nframes],
        })
    }

    /// Creates the shared handle the address spaces hold.
    pub fn new_shared(mem_size: usize) -> Result<FramePoolRef, MemError> {
        Ok(Arc::new(Mutex::new(Self::new(mem_size)?)))
    }

    pub fn mem(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut GuestMemory {
        &mut self.mem
    }

    /// Guest physical address of the first never-allocated frame. Frames
    /// past this point are what the guest may still receive.
    pub fn alloc_cursor(&self) -> PhysAddr {
        PhysAddr::new(self.next)
    }

    /// Allocates one zeroed frame with refcount 1.
    pub fn alloc_frame(&mut self) -> Result<PhysAddr, MemError> {
        let frame = if let Some(frame) = self.free.pop() {
            frame
        } else {
            if self.next as usize >= self.mem.size() {
                return Err(MemError::OutOfMemory);
            }
            let frame = PhysAddr::new(self.next);
            self.next += PAGE_SIZE as u64;
            frame
        };

        self.mem.slice_mut(frame, PAGE_SIZE)?.fill(0);
        self.refcounts[frame.pfn() as usize] = 1;
        Ok(frame)
    }

    /// Takes an additional reference on a shared frame.
    pub fn get_ref(&mut self, frame: PhysAddr) {
        let pfn = frame.pfn() as usize;
        assert!(self.refcounts[pfn] > 0, "get_ref on pool-owned frame");
        self.refcounts[pfn] += 1;
    }

    /// Drops one reference; the frame returns to the pool when the last
    /// reference goes away.
    pub fn put_frame(&mut self, frame: PhysAddr) {
        let pfn = frame.pfn() as usize;
        assert!(self.refcounts[pfn] > 0, "put_frame on pool-owned frame");
        self.refcounts[pfn] -= 1;
        if self.refcounts[pfn] == 0 {
            self.free.push(frame);
        }
    }

    pub fn refcount(&self, frame: PhysAddr) -> u32 {
        self.refcounts[frame.pfn() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_reuse() {
        let mut pool = FramePool::new(4 * PAGE_SIZE).unwrap();
        let f0 = pool.alloc_frame().unwrap();
        let f1 = pool.alloc_frame().unwrap();
        assert_ne!(f0, f1);
        assert_eq!(pool.refcount(f0), 1);

        pool.put_frame(f0);
        assert_eq!(pool.refcount(f0), 0);
        // The freed frame is handed out again.
        let f2 = pool.alloc_frame().unwrap();
        assert_eq!(f2, f0);
    }

    #[test]
    fn frames_are_zeroed_on_alloc() {
        let mut pool = FramePool::new(2 * PAGE_SIZE).unwrap();
        let frame = pool.alloc_frame().unwrap();
        pool.mem_mut()
            .slice_mut(frame, PAGE_SIZE)
            .unwrap()
            .fill(0xab);
        pool.put_frame(frame);

        let again = pool.alloc_frame().unwrap();
        assert_eq!(again, frame);
        assert!(pool
            .mem()
            .slice(again, PAGE_SIZE)
            .unwrap()
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn pool_exhaustion() {
        let mut pool = FramePool::new(2 * PAGE_SIZE).unwrap();
        pool.alloc_frame().unwrap();
        pool.alloc_frame().unwrap();
        assert_eq!(pool.alloc_frame(), Err(MemError::OutOfMemory));
    }

    #[test]
    fn shared_refcounts() {
        let mut pool = FramePool::new(2 * PAGE_SIZE).unwrap();
        let frame = pool.alloc_frame().unwrap();
        pool.get_ref(frame);
        assert_eq!(pool.refcount(frame), 2);
        pool.put_frame(frame);
        assert_eq!(pool.refcount(frame), 1);
        // Still owned, not recycled.
        let other = pool.alloc_frame().unwrap();
        assert_ne!(other, frame);
    }
}
