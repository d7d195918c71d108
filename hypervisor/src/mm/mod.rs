// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

pub mod addrspace;
pub mod alloc;
pub mod pagetable;
pub mod regions;

pub use self::addrspace::AddressSpace;
pub use self::alloc::{FramePool, FramePoolRef, GuestMemory};
pub use self::pagetable::{PTEntry, PTEntryFlags, PageTable};
pub use self::regions::RegionMap;

use bitflags::bitflags;

bitflags! {
    /// Access permissions for a user mapping. The empty set is a valid,
    /// representable state: a mapped-but-inaccessible page used to detect
    /// first touch. It is distinct from "unmapped".
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Perms: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Perms {
    pub fn rw() -> Self {
        Self::READ | Self::WRITE
    }

    pub fn rx() -> Self {
        Self::READ | Self::EXEC
    }
}

bitflags! {
    /// Caller flags combined with [`Perms`] to derive the page-table
    /// options before each page-table write.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// The frame is refcount-shared across page tables on clone.
        const SHARED  = 1 << 0;
        /// Atomically replace an existing mapping instead of failing
        /// with `AlreadyMapped`.
        const DISCARD = 1 << 1;
    }
}
