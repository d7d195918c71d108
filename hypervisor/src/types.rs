// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Entries per page-table page (4KB / 8B).
pub const ENTRY_COUNT: usize = 512;

pub use vmdefs::{USER_WINDOW_END, USER_WINDOW_START};

/// Base chosen for ET_DYN images before mapping.
pub const ET_DYN_LOAD_BASE: u64 = 0x40_0000;

/// Size of the initial guest stack mapping.
pub const GUEST_STACK_SIZE: usize = 0x10000;
