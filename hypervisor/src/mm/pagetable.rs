// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! 4-level x86-64 page-table engine.
//!
//! Tables live in guest physical frames and are manipulated from the host
//! through the frame pool's backing memory. Intermediate tables are
//! created on demand and freed when their last entry goes away; the
//! per-table live-entry counters are kept host-side, keyed by table
//! frame, so emptiness checks never rescan the table.

use crate::address::{Address, PhysAddr, VirtAddr};
use crate::error::MemError;
use crate::mm::alloc::FramePool;
use crate::mm::{MapFlags, Perms};
use crate::types::{ENTRY_COUNT, PAGE_SIZE};

use std::collections::HashMap;

use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PTEntryFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        const ACCESSED  = 1 << 5;
        const DIRTY     = 1 << 6;
        const HUGE      = 1 << 7;
        const GLOBAL    = 1 << 8;
        /// Software bit: the frame is refcount-shared across clones.
        const SHARED    = 1 << 9;
        /// Software bit: mapped but inaccessible. Keeps a non-present
        /// entry distinct from an unmapped one.
        const PROT_NONE = 1 << 10;
        const NX        = 1 << 63;
    }
}

impl PTEntryFlags {
    /// Derives the entry flags for a user mapping from the caller's
    /// permissions and mapping flags. An empty permission set produces a
    /// prot-none entry: mapped, never accessible, faults on first touch.
    pub fn from_mapping(perms: Perms, flags: MapFlags) -> Self {
        let mut pt_flags = if perms.is_empty() {
            Self::PROT_NONE | Self::USER
        } else {
            let mut pt_flags = Self::PRESENT | Self::USER | Self::ACCESSED | Self::DIRTY;
            if perms.contains(Perms::WRITE) {
                pt_flags |= Self::WRITABLE;
            }
            if !perms.contains(Perms::EXEC) {
                pt_flags |= Self::NX;
            }
            pt_flags
        };
        if flags.contains(MapFlags::SHARED) {
            pt_flags |= Self::SHARED;
        }
        pt_flags
    }
}

/// Bits 12..52 hold the frame address.
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// A page-table entry in hardware format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PTEntry(u64);

impl PTEntry {
    /// Check if the page table entry is clear (no mapping at all).
    pub fn is_clear(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Check if the entry is present to the hardware. A prot-none entry
    /// is mapped but not present.
    pub fn present(&self) -> bool {
        self.flags().contains(PTEntryFlags::PRESENT)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn flags(&self) -> PTEntryFlags {
        PTEntryFlags::from_bits_truncate(self.0)
    }

    pub fn set(&mut self, addr: PhysAddr, flags: PTEntryFlags) {
        let addr = addr.bits();
        assert_eq!(addr & !PTE_ADDR_MASK, 0);
        self.0 = addr | flags.bits();
    }

    pub fn address(&self) -> PhysAddr {
        PhysAddr::new(self.0 & PTE_ADDR_MASK)
    }
}

/// A 4-level page-table tree rooted at a guest physical frame.
#[derive(Debug)]
pub struct PageTable {
    root: PhysAddr,
    /// Live-entry counter per table frame, root included.
    live: HashMap<PhysAddr, usize>,
}

impl PageTable {
    pub fn new(pool: &mut FramePool) -> Result<Self, MemError> {
        let root = pool.alloc_frame()?;
        let mut live = HashMap::new();
        live.insert(root, 0);
        Ok(Self { root, live })
    }

    /// CR3 value for this table.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    fn read_entry(pool: &FramePool, table: PhysAddr, idx: usize) -> PTEntry {
        let raw = pool
            .mem()
            .read_u64(table + (idx * 8) as u64)
            .expect("page-table frame outside guest memory");
        PTEntry(raw)
    }

    fn write_entry(pool: &mut FramePool, table: PhysAddr, idx: usize, entry: PTEntry) {
        pool.mem_mut()
            .write_u64(table + (idx * 8) as u64, entry.raw())
            .expect("page-table frame outside guest memory");
    }

    /// Walks down to the leaf table for `vaddr` without creating
    /// anything. `path[level]` is the table frame at that level.
    fn walk(&self, pool: &FramePool, vaddr: VirtAddr) -> Option<[PhysAddr; 4]> {
        let mut path = [PhysAddr::null(); 4];
        path[3] = self.root;
        let mut table = self.root;
        for level in (1..=3).rev() {
            let entry = Self::read_entry(pool, table, vaddr.to_pgtbl_idx(level));
            if entry.is_clear() {
                return None;
            }
            table = entry.address();
            path[level - 1] = table;
        }
        Some(path)
    }

    /// Walks down to the leaf table for `vaddr`, creating intermediate
    /// tables on demand.
    fn walk_create(
        &mut self,
        pool: &mut FramePool,
        vaddr: VirtAddr,
    ) -> Result<[PhysAddr; 4], MemError> {
        let mut path = [PhysAddr::null(); 4];
        path[3] = self.root;
        let mut table = self.root;
        for level in (1..=3).rev() {
            let idx = vaddr.to_pgtbl_idx(level);
            let entry = Self::read_entry(pool, table, idx);
            let next = if entry.is_clear() {
                let frame = pool.alloc_frame()?;
                let mut entry = PTEntry::default();
                entry.set(
                    frame,
                    PTEntryFlags::PRESENT
                        | PTEntryFlags::WRITABLE
                        | PTEntryFlags::USER
                        | PTEntryFlags::ACCESSED,
                );
                Self::write_entry(pool, table, idx, entry);
                *self.live.get_mut(&table).expect("untracked table frame") += 1;
                self.live.insert(frame, 0);
                frame
            } else {
                entry.address()
            };
            path[level - 1] = next;
            table = next;
        }
        Ok(path)
    }

    /// Returns the leaf entry mapping `vaddr`, if one exists. Prot-none
    /// entries count as mapped.
    pub fn entry(&self, pool: &FramePool, vaddr: VirtAddr) -> Option<PTEntry> {
        let path = self.walk(pool, vaddr)?;
        let entry = Self::read_entry(pool, path[0], vaddr.to_pgtbl_idx(0));
        (!entry.is_clear()).then_some(entry)
    }

    /// Maps one 4 KiB page. Fails with `AlreadyMapped` unless `discard`
    /// is set, in which case the previous mapping is replaced and its
    /// frame returned to the pool (after refcounting for shared pages).
    pub fn map_4k(
        &mut self,
        pool: &mut FramePool,
        vaddr: VirtAddr,
        frame: PhysAddr,
        flags: PTEntryFlags,
        discard: bool,
    ) -> Result<(), MemError> {
        assert!(vaddr.is_page_aligned());

        let path = self.walk_create(pool, vaddr)?;
        let leaf = path[0];
        let idx = vaddr.to_pgtbl_idx(0);

        let old = Self::read_entry(pool, leaf, idx);
        if !old.is_clear() {
            if !discard {
                return Err(MemError::AlreadyMapped);
            }
            pool.put_frame(old.address());
        } else {
            *self.live.get_mut(&leaf).expect("untracked table frame") += 1;
        }

        let mut entry = PTEntry::default();
        entry.set(frame, flags);
        Self::write_entry(pool, leaf, idx, entry);
        Ok(())
    }

    /// Unmaps one 4 KiB page, returning its frame to the pool and
    /// pruning page-table pages that became empty.
    pub fn unmap_4k(&mut self, pool: &mut FramePool, vaddr: VirtAddr) -> Result<(), MemError> {
        assert!(vaddr.is_page_aligned());

        let path = self.walk(pool, vaddr).ok_or(MemError::NotMapped)?;
        let entry = Self::read_entry(pool, path[0], vaddr.to_pgtbl_idx(0));
        if entry.is_clear() {
            return Err(MemError::NotMapped);
        }

        pool.put_frame(entry.address());
        Self::write_entry(pool, path[0], vaddr.to_pgtbl_idx(0), PTEntry::default());

        // Walk upward freeing tables whose last entry just went away.
        // The root is never freed.
        let mut level = 0;
        loop {
            let table = path[level];
            let count = self.live.get_mut(&table).expect("untracked table frame");
            *count -= 1;
            if *count > 0 || level == 3 {
                break;
            }
            self.live.remove(&table);
            pool.put_frame(table);
            Self::write_entry(pool, path[level + 1], vaddr.to_pgtbl_idx(level + 1), PTEntry::default());
            level += 1;
        }
        Ok(())
    }

    /// Replaces the permission bits of an existing mapping. The frame and
    /// the shared marker are preserved.
    pub fn set_flags_4k(
        &mut self,
        pool: &mut FramePool,
        vaddr: VirtAddr,
        flags: PTEntryFlags,
    ) -> Result<(), MemError> {
        assert!(vaddr.is_page_aligned());

        let path = self.walk(pool, vaddr).ok_or(MemError::NotMapped)?;
        let idx = vaddr.to_pgtbl_idx(0);
        let old = Self::read_entry(pool, path[0], idx);
        if old.is_clear() {
            return Err(MemError::NotMapped);
        }

        let preserved = old.flags() & PTEntryFlags::SHARED;
        let mut entry = PTEntry::default();
        entry.set(old.address(), flags | preserved);
        Self::write_entry(pool, path[0], idx, entry);
        Ok(())
    }

    /// Deep-copies the tree. Shared leaves take a reference on the
    /// underlying frame; private leaves are copied eagerly into fresh
    /// frames.
    pub fn clone_tree(&self, pool: &mut FramePool) -> Result<PageTable, MemError> {
        let mut live = HashMap::new();
        let root = Self::clone_table(pool, self.root, 3, &mut live)?;
        Ok(PageTable { root, live })
    }

    fn clone_table(
        pool: &mut FramePool,
        src: PhysAddr,
        level: usize,
        live: &mut HashMap<PhysAddr, usize>,
    ) -> Result<PhysAddr, MemError> {
        let dst = pool.alloc_frame()?;
        live.insert(dst, 0);

        for idx in 0..ENTRY_COUNT {
            let entry = Self::read_entry(pool, src, idx);
            if entry.is_clear() {
                continue;
            }

            let new_entry = if level == 0 {
                if entry.flags().contains(PTEntryFlags::SHARED) {
                    pool.get_ref(entry.address());
                    entry
                } else {
                    let frame = pool.alloc_frame()?;
                    let data = pool.mem().slice(entry.address(), PAGE_SIZE)?.to_vec();
                    pool.mem_mut().slice_mut(frame, PAGE_SIZE)?.copy_from_slice(&data);
                    let mut new_entry = PTEntry::default();
                    new_entry.set(frame, entry.flags());
                    new_entry
                }
            } else {
                let child = Self::clone_table(pool, entry.address(), level - 1, live)?;
                let mut new_entry = PTEntry::default();
                new_entry.set(child, entry.flags());
                new_entry
            };

            Self::write_entry(pool, dst, idx, new_entry);
            *live.get_mut(&dst).expect("untracked table frame") += 1;
        }
        Ok(dst)
    }

    /// Returns every frame of the tree to the pool: leaf frames first,
    /// then the table pages themselves.
    pub fn free(&mut self, pool: &mut FramePool) {
        Self::free_table(pool, self.root, 3);
        self.live.clear();
        self.root = PhysAddr::null();
    }

    fn free_table(pool: &mut FramePool, table: PhysAddr, level: usize) {
        for idx in 0..ENTRY_COUNT {
            let entry = Self::read_entry(pool, table, idx);
            if entry.is_clear() {
                continue;
            }
            if level == 0 {
                pool.put_frame(entry.address());
            } else {
                Self::free_table(pool, entry.address(), level - 1);
            }
        }
        pool.put_frame(table);
    }
}
