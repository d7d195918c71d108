// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Error typing for the hypervisor APIs.
//!
//! Module-private functions return leaf error types directly; public
//! functions return [`HvError`] wrapping the leaf type, converted through
//! `From`. Internal-bug conditions (region-manager/page-table
//! disagreement) are not errors: they abort the hypervisor via assertions
//! so fuzzing stays deterministic.

use core::fmt;

use elf::ElfError;

/// Errors from the address-space and page-table layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemError {
    /// The page or range is already mapped and discard was not requested.
    AlreadyMapped,
    /// No mapping exists at the given address.
    NotMapped,
    /// Address/length outside the user window, misaligned, zero-length or
    /// overflowing.
    NotUserRange,
    /// The frame pool is exhausted.
    OutOfMemory,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "address range already mapped"),
            Self::NotMapped => write!(f, "address range not mapped"),
            Self::NotUserRange => write!(f, "address range not a valid user range"),
            Self::OutOfMemory => write!(f, "out of guest physical memory"),
        }
    }
}

/// A generic error during hypervisor operation.
#[derive(Debug)]
pub enum HvError {
    /// Errors from the guest memory subsystem.
    Mem(MemError),
    /// ELF validation failure, fatal before the guest starts.
    Elf(ElfError),
    /// A malformed configuration value, rejected before the guest
    /// starts. Marshalling failures of guest pointers do not use this:
    /// they end the run as a `BadAddress` fault instead.
    BadArgument,
    /// The virtualization container reported a failure.
    Container(&'static str),
    /// Host I/O errors while reading guest images or inputs.
    Io(std::io::Error),
}

impl fmt::Display for HvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mem(e) => write!(f, "memory error: {e}"),
            Self::Elf(e) => write!(f, "invalid ELF: {e}"),
            Self::BadArgument => write!(f, "bad argument"),
            Self::Container(msg) => write!(f, "container error: {msg}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for HvError {}

impl From<MemError> for HvError {
    fn from(err: MemError) -> Self {
        Self::Mem(err)
    }
}

impl From<ElfError> for HvError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

impl From<std::io::Error> for HvError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
