// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Per-process guest address space.
//!
//! An address space is the tuple (page table, region map, allocator
//! handle). Every public operation keeps the region map and the page
//! table in agreement, with one documented exception: a `map_range` that
//! fails with `AlreadyMapped` partway leaves the region map showing the
//! requested range as mapped, matching the Linux `mmap` contract the
//! guest expects.

use crate::address::{Address, PhysAddr, VirtAddr};
use crate::error::MemError;
use crate::mm::alloc::{FramePool, FramePoolRef};
use crate::mm::pagetable::{PTEntry, PTEntryFlags, PageTable};
use crate::mm::regions::RegionMap;
use crate::mm::{MapFlags, Perms};
use crate::types::PAGE_SIZE;
use crate::utils::is_aligned;

use std::sync::Arc;

use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Debug)]
pub struct AddressSpace {
    pgtable: PageTable,
    regions: RegionMap,
    pool: FramePoolRef,
}

impl AddressSpace {
    pub fn new(
        pool: FramePoolRef,
        window_start: VirtAddr,
        window_end: VirtAddr,
    ) -> Result<Self, MemError> {
        let pgtable = {
            let mut guard = pool.lock().expect("frame pool lock poisoned");
            PageTable::new(&mut guard)?
        };
        Ok(Self {
            pgtable,
            regions: RegionMap::new(window_start, window_end),
            pool,
        })
    }

    /// The allocator handle shared with other address spaces of this VM.
    pub fn allocator(&self) -> FramePoolRef {
        Arc::clone(&self.pool)
    }

    /// CR3 value of this address space.
    pub fn root(&self) -> PhysAddr {
        self.pgtable.root()
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    /// Region-map view of whether `vaddr` is inside a mapped interval.
    pub fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        self.regions.is_mapped(vaddr)
    }

    /// Page-table view of the leaf entry mapping `vaddr`.
    pub fn entry(&self, vaddr: VirtAddr) -> Option<PTEntry> {
        let pool = self.pool.lock().expect("frame pool lock poisoned");
        self.pgtable.entry(&pool, vaddr.page_align())
    }

    /// Common argument validation: page-aligned address and length,
    /// non-zero, non-overflowing, inside the user window.
    fn check_range(&self, addr: VirtAddr, len: u64) -> Result<VirtAddr, MemError> {
        if len == 0 || !addr.is_page_aligned() || !is_aligned(len, PAGE_SIZE as u64) {
            return Err(MemError::NotUserRange);
        }
        let end = addr.checked_add(len).ok_or(MemError::NotUserRange)?;
        let (window_start, window_end) = self.regions.window();
        if addr < window_start || end > window_end {
            return Err(MemError::NotUserRange);
        }
        Ok(end)
    }

    /// Reserves `[addr, addr + len)` in the region map, allocates one
    /// fresh frame per page and maps it with options derived from
    /// `perms` and `flags`.
    pub fn map_range(
        &mut self,
        addr: VirtAddr,
        len: u64,
        perms: Perms,
        flags: MapFlags,
    ) -> Result<(), MemError> {
        let end = self.check_range(addr, len)?;

        if flags.contains(MapFlags::DISCARD) {
            self.regions.set_not_mapped(addr, end);
        }
        self.regions.set_mapped(addr, end)?;

        let pt_flags = PTEntryFlags::from_mapping(perms, flags);
        let discard = flags.contains(MapFlags::DISCARD);

        let pool_ref = Arc::clone(&self.pool);
        let mut pool = pool_ref.lock().expect("frame pool lock poisoned");

        let pages = len / PAGE_SIZE as u64;
        for i in 0..pages {
            let vaddr = addr + i * PAGE_SIZE as u64;
            let frame = match pool.alloc_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    self.abort_map(&mut pool, addr, vaddr, end);
                    return Err(err);
                }
            };
            match self.pgtable.map_4k(&mut pool, vaddr, frame, pt_flags, discard) {
                Ok(()) => {}
                Err(MemError::AlreadyMapped) => {
                    // The region map keeps the whole range marked mapped
                    // and the already-mapped prefix stays in place; the
                    // caller owns the partial-state policy.
                    pool.put_frame(frame);
                    return Err(MemError::AlreadyMapped);
                }
                Err(err) => {
                    pool.put_frame(frame);
                    self.abort_map(&mut pool, addr, vaddr, end);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Restores region map and page table to the entry state after a
    /// mid-range failure: the mapped prefix `[start, failed)` is unmapped
    /// and the reservation dropped.
    fn abort_map(&mut self, pool: &mut FramePool, start: VirtAddr, failed: VirtAddr, end: VirtAddr) {
        let mut vaddr = start;
        while vaddr < failed {
            self.pgtable
                .unmap_4k(pool, vaddr)
                .expect("mapped prefix vanished during rollback");
            vaddr = vaddr + PAGE_SIZE as u64;
        }
        self.regions.set_not_mapped(start, end);
    }

    /// Picks the lowest free run of `len` bytes and maps it. A region-map
    /// answer the page table then contradicts is an internal bug and
    /// aborts the hypervisor.
    pub fn map_range_anywhere(
        &mut self,
        len: u64,
        perms: Perms,
        flags: MapFlags,
    ) -> Result<VirtAddr, MemError> {
        if len == 0 || !is_aligned(len, PAGE_SIZE as u64) {
            return Err(MemError::NotUserRange);
        }
        let addr = self
            .regions
            .find_not_mapped(len)
            .ok_or(MemError::OutOfMemory)?;
        match self.map_range(addr, len, perms, flags) {
            Err(MemError::AlreadyMapped) | Err(MemError::NotUserRange) => {
                panic!("region manager inconsistent with page table at {addr:#x}");
            }
            Err(err) => Err(err),
            Ok(()) => Ok(addr),
        }
    }

    /// Unmaps `[addr, addr + len)`. Pages that were already unmapped do
    /// not stop the sweep; they surface as a final `NotMapped` once the
    /// rest of the range has been released.
    pub fn unmap_range(&mut self, addr: VirtAddr, len: u64) -> Result<(), MemError> {
        let end = self.check_range(addr, len)?;
        self.regions.set_not_mapped(addr, end);

        let pool_ref = Arc::clone(&self.pool);
        let mut pool = pool_ref.lock().expect("frame pool lock poisoned");

        let mut any_missing = false;
        let pages = len / PAGE_SIZE as u64;
        for i in 0..pages {
            let vaddr = addr + i * PAGE_SIZE as u64;
            match self.pgtable.unmap_4k(&mut pool, vaddr) {
                Ok(()) => {}
                Err(MemError::NotMapped) => any_missing = true,
                Err(err) => return Err(err),
            }
        }
        if any_missing {
            Err(MemError::NotMapped)
        } else {
            Ok(())
        }
    }

    /// Applies `perms` to every page of the range, stopping at the first
    /// error.
    pub fn set_range_perms(
        &mut self,
        addr: VirtAddr,
        len: u64,
        perms: Perms,
    ) -> Result<(), MemError> {
        self.check_range(addr, len)?;
        let pt_flags = PTEntryFlags::from_mapping(perms, MapFlags::empty());

        let pool_ref = Arc::clone(&self.pool);
        let mut pool = pool_ref.lock().expect("frame pool lock poisoned");

        let pages = len / PAGE_SIZE as u64;
        for i in 0..pages {
            let vaddr = addr + i * PAGE_SIZE as u64;
            self.pgtable.set_flags_4k(&mut pool, vaddr, pt_flags)?;
        }
        Ok(())
    }

    /// Forks the address space: the page table is deep-copied (shared
    /// pages refcounted, private pages duplicated) and the region map
    /// cloned.
    pub fn try_clone(&self) -> Result<Self, MemError> {
        let pgtable = {
            let pool_ref = Arc::clone(&self.pool);
            let mut pool = pool_ref.lock().expect("frame pool lock poisoned");
            self.pgtable.clone_tree(&mut pool)?
        };
        Ok(Self {
            pgtable,
            regions: self.regions.clone(),
            pool: Arc::clone(&self.pool),
        })
    }

    /// Translates one guest-virtual address for an access of the given
    /// kind. Fails for unmapped, prot-none and (for writes) read-only
    /// pages.
    fn translate(&self, pool: &FramePool, vaddr: VirtAddr, write: bool) -> Result<PhysAddr, MemError> {
        let (window_start, window_end) = self.regions.window();
        if vaddr < window_start || vaddr >= window_end {
            return Err(MemError::NotUserRange);
        }
        let entry = self
            .pgtable
            .entry(pool, vaddr.page_align())
            .ok_or(MemError::NotMapped)?;
        if !entry.present() {
            return Err(MemError::NotMapped);
        }
        if write && !entry.flags().contains(PTEntryFlags::WRITABLE) {
            return Err(MemError::NotMapped);
        }
        Ok(entry.address() + vaddr.page_offset() as u64)
    }

    /// Copies guest memory into `buf`, page by page, validating each page
    /// on the way. Used by the bridge before dereferencing guest
    /// pointers.
    pub fn read_bytes(&self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), MemError> {
        let pool = self.pool.lock().expect("frame pool lock poisoned");
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr
                .checked_add(done as u64)
                .ok_or(MemError::NotUserRange)?;
            let chunk = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            let paddr = self.translate(&pool, va, false)?;
            buf[done..done + chunk].copy_from_slice(pool.mem().slice(paddr, chunk)?);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into guest memory, validating writability per page.
    pub fn write_bytes(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<(), MemError> {
        let pool_ref = Arc::clone(&self.pool);
        let mut pool = pool_ref.lock().expect("frame pool lock poisoned");
        let mut done = 0;
        while done < data.len() {
            let va = vaddr
                .checked_add(done as u64)
                .ok_or(MemError::NotUserRange)?;
            let chunk = (PAGE_SIZE - va.page_offset()).min(data.len() - done);
            let paddr = self.translate(&pool, va, true)?;
            pool.mem_mut()
                .slice_mut(paddr, chunk)?
                .copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Reads a NUL-terminated guest string, truncated at `max` bytes.
    pub fn read_cstr(&self, vaddr: VirtAddr, max: usize) -> Result<String, MemError> {
        let pool = self.pool.lock().expect("frame pool lock poisoned");
        let mut out = Vec::new();
        while out.len() < max {
            let va = vaddr
                .checked_add(out.len() as u64)
                .ok_or(MemError::NotUserRange)?;
            let chunk = (PAGE_SIZE - va.page_offset()).min(max - out.len());
            let paddr = self.translate(&pool, va, false)?;
            let bytes = pool.mem().slice(paddr, chunk)?;
            match bytes.iter().position(|&b| b == 0) {
                Some(pos) => {
                    out.extend_from_slice(&bytes[..pos]);
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                None => out.extend_from_slice(bytes),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Reads a fixed-layout object from guest memory.
    pub fn read_obj<T: FromBytes>(&self, vaddr: VirtAddr) -> Result<T, MemError> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(T::read_from_bytes(&buf).expect("sized object read"))
    }

    /// Writes a fixed-layout object into guest memory.
    pub fn write_obj<T: IntoBytes + Immutable>(
        &mut self,
        vaddr: VirtAddr,
        value: &T,
    ) -> Result<(), MemError> {
        self.write_bytes(vaddr, value.as_bytes())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let pool_ref = Arc::clone(&self.pool);
        if let Ok(mut pool) = pool_ref.lock() {
            self.pgtable.free(&mut pool);
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::alloc::FramePool;
    use crate::types::{USER_WINDOW_END, USER_WINDOW_START};

    const MEM_SIZE: usize = 256 * PAGE_SIZE;

    fn setup() -> AddressSpace {
        let pool = FramePool::new_shared(MEM_SIZE).unwrap();
        AddressSpace::new(
            pool,
            VirtAddr::new(USER_WINDOW_START),
            VirtAddr::new(USER_WINDOW_END),
        )
        .unwrap()
    }

    fn va(v: u64) -> VirtAddr {
        VirtAddr::new(v)
    }

    #[test]
    fn remap_reads_fresh_zeroed_frames() {
        let mut space = setup();
        let addr = va(0x10000);
        let len = 0x3000;

        space.map_range(addr, len, Perms::rw(), MapFlags::empty()).unwrap();
        space.write_bytes(addr, &[0xab; 0x3000]).unwrap();

        let mut buf = [0u8; 0x3000];
        space.read_bytes(addr, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xab));

        space.unmap_range(addr, len).unwrap();
        space.map_range(addr, len, Perms::rw(), MapFlags::empty()).unwrap();
        space.read_bytes(addr, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn map_anywhere_returns_disjoint_user_ranges() {
        let mut space = setup();
        let a = space
            .map_range_anywhere(0x4000, Perms::rx(), MapFlags::empty())
            .unwrap();
        let b = space
            .map_range_anywhere(0x4000, Perms::rx(), MapFlags::empty())
            .unwrap();

        assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(hi.bits() - lo.bits() >= 0x4000);
        assert!(a.bits() >= USER_WINDOW_START && b.bits() >= USER_WINDOW_START);
        assert!(a.checked_add(0x4000).unwrap().bits() <= USER_WINDOW_END);
    }

    #[test]
    fn regions_and_pagetable_agree() {
        let mut space = setup();
        let addr = va(0x20000);

        space.map_range(addr, 0x2000, Perms::rw(), MapFlags::empty()).unwrap();
        for off in [0u64, 0x1000] {
            assert!(space.is_mapped(addr + off));
            assert!(space.entry(addr + off).is_some());
        }

        space.unmap_range(addr, 0x2000).unwrap();
        for off in [0u64, 0x1000] {
            assert!(!space.is_mapped(addr + off));
            assert!(space.entry(addr + off).is_none());
        }
    }

    #[test]
    fn unmap_twice_reports_not_mapped_once() {
        let mut space = setup();
        let addr = va(0x30000);
        space.map_range(addr, 0x2000, Perms::rw(), MapFlags::empty()).unwrap();

        // Neighbouring mapping must survive the double unmap.
        let other = va(0x40000);
        space.map_range(other, 0x1000, Perms::rw(), MapFlags::empty()).unwrap();

        assert_eq!(space.unmap_range(addr, 0x2000), Ok(()));
        assert_eq!(space.unmap_range(addr, 0x2000), Err(MemError::NotMapped));
        assert!(space.is_mapped(other));
        assert!(space.entry(other).is_some());
    }

    #[test]
    fn already_mapped_leaves_region_reserved() {
        let mut space = setup();
        // Pre-existing single page in the middle of the range, created
        // behind the region map's back by a previous partial failure.
        let addr = va(0x50000);
        space.map_range(addr + 0x1000, 0x1000, Perms::rw(), MapFlags::empty()).unwrap();
        space.regions.set_not_mapped(addr + 0x1000, addr + 0x2000);

        let err = space
            .map_range(addr, 0x3000, Perms::rw(), MapFlags::empty())
            .unwrap_err();
        assert_eq!(err, MemError::AlreadyMapped);

        // Documented partial-failure window: the region map shows the
        // whole requested range as mapped, the tail page is not in the
        // page table.
        assert!(space.is_mapped(addr));
        assert!(space.is_mapped(addr + 0x2000));
        assert!(space.entry(addr).is_some());
        assert!(space.entry(addr + 0x2000).is_none());
    }

    #[test]
    fn range_argument_validation() {
        let mut space = setup();
        let cases = [
            (va(0x10800), 0x1000u64), // unaligned address
            (va(0x10000), 0x800),     // unaligned length
            (va(0x1000), 0x1000),     // below the window
            (va(USER_WINDOW_END), 0x1000),
            (va(u64::MAX & !0xfff), 0x2000), // overflow
        ];
        for (addr, len) in cases {
            assert_eq!(
                space.map_range(addr, len, Perms::rw(), MapFlags::empty()),
                Err(MemError::NotUserRange),
                "{addr:#x}/{len:#x}"
            );
        }
        assert_eq!(
            space.map_range(va(0x10000), 0, Perms::rw(), MapFlags::empty()),
            Err(MemError::NotUserRange)
        );
    }

    #[test]
    fn clone_isolates_private_pages() {
        let mut space = setup();
        let addr = va(0x60000);
        space.map_range(addr, 0x1000, Perms::rw(), MapFlags::empty()).unwrap();
        space.write_bytes(addr, b"original").unwrap();

        let mut forked = space.try_clone().unwrap();
        forked.write_bytes(addr, b"forked!!").unwrap();

        let mut buf = [0u8; 8];
        space.read_bytes(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"original");
        forked.read_bytes(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"forked!!");
    }

    #[test]
    fn clone_shares_shared_pages() {
        let mut space = setup();
        let addr = va(0x70000);
        space.map_range(addr, 0x1000, Perms::rw(), MapFlags::SHARED).unwrap();
        space.write_bytes(addr, b"shared").unwrap();

        let forked = space.try_clone().unwrap();
        space.write_bytes(addr, b"update").unwrap();

        let mut buf = [0u8; 6];
        forked.read_bytes(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"update");
    }

    #[test]
    fn access_respects_permissions() {
        let mut space = setup();
        let addr = va(0x80000);
        space.map_range(addr, 0x1000, Perms::rw(), MapFlags::empty()).unwrap();

        // Read-only after the perms change.
        space.set_range_perms(addr, 0x1000, Perms::READ).unwrap();
        let mut buf = [0u8; 4];
        space.read_bytes(addr, &mut buf).unwrap();
        assert_eq!(space.write_bytes(addr, b"nope"), Err(MemError::NotMapped));

        // Prot-none blocks both directions but stays mapped.
        space.set_range_perms(addr, 0x1000, Perms::empty()).unwrap();
        assert_eq!(space.read_bytes(addr, &mut buf), Err(MemError::NotMapped));
        assert!(space.is_mapped(addr));
        assert!(space.entry(addr).is_some());

        // Unmapped access fails outright.
        assert_eq!(
            space.read_bytes(va(0x90000), &mut buf),
            Err(MemError::NotMapped)
        );
    }

    #[test]
    fn reads_may_straddle_pages() {
        let mut space = setup();
        let addr = va(0xa0000);
        space.map_range(addr, 0x2000, Perms::rw(), MapFlags::empty()).unwrap();

        let payload = [0x77u8; 0x100];
        space.write_bytes(addr + 0xf80, &payload).unwrap();
        let mut buf = [0u8; 0x100];
        space.read_bytes(addr + 0xf80, &mut buf).unwrap();
        assert_eq!(buf, payload);

        // A read straddling into unmapped territory fails.
        let mut big = [0u8; 0x100];
        assert_eq!(
            space.read_bytes(addr + 0x1f80, &mut big),
            Err(MemError::NotMapped)
        );
    }

    #[test]
    fn cstr_reads_are_capped() {
        let mut space = setup();
        let addr = va(0xb0000);
        space.map_range(addr, 0x1000, Perms::rw(), MapFlags::empty()).unwrap();
        space.write_bytes(addr, b"hello\0world").unwrap();

        assert_eq!(space.read_cstr(addr, 64).unwrap(), "hello");
        // No terminator within the cap: truncated.
        assert_eq!(space.read_cstr(addr, 3).unwrap(), "hel");
    }
}
