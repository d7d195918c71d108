// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Wire contract between the hypervisor and the guest kernel.
//!
//! Everything in this crate is shared bit-exactly by both sides of the
//! hypercall boundary. Any layout or numbering change here is a breaking
//! ABI change and must be applied to host and guest in lockstep.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// I/O port the guest writes to in order to force a VM-exit. The dispatch
/// number travels in the full rax register; the `out` itself only carries
/// the low byte, which the host ignores.
pub const HYPERCALL_PORT: u16 = 16;

/// Maximum payload of a single Print hypercall. The guest batches output
/// into a buffer of this many bytes plus a NUL terminator and flushes on
/// newline or when full.
pub const PRINT_BUF_SIZE: usize = 1024;

/// Longest file name `GetFileName` will write into a guest buffer,
/// including the NUL terminator.
pub const FILE_NAME_MAX: usize = 256;

/// Window of guest-virtual addresses valid for user mappings. Both sides
/// enforce it: the host before touching guest pointers, the guest kernel
/// before dereferencing flat user pointers from syscalls. The low 64 KiB
/// stay unmapped so null-pointer arithmetic faults instead of resolving.
pub const USER_WINDOW_START: u64 = 0x1_0000;
pub const USER_WINDOW_END: u64 = 0x0000_7fff_ffff_f000;

/// Hypercall dispatch numbers. Frozen numeric contract with the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Hypercall {
    Test = 0,
    Print = 1,
    GetMemInfo = 2,
    GetKernelBrk = 3,
    GetInfo = 4,
    GetFileLen = 5,
    GetFileName = 6,
    SetFileBuf = 7,
    Fault = 8,
    PrintStacktrace = 9,
    EndRun = 10,
}

impl TryFrom<u64> for Hypercall {
    type Error = u64;

    fn try_from(nr: u64) -> Result<Self, u64> {
        match nr {
            0 => Ok(Self::Test),
            1 => Ok(Self::Print),
            2 => Ok(Self::GetMemInfo),
            3 => Ok(Self::GetKernelBrk),
            4 => Ok(Self::GetInfo),
            5 => Ok(Self::GetFileLen),
            6 => Ok(Self::GetFileName),
            7 => Ok(Self::SetFileBuf),
            8 => Ok(Self::Fault),
            9 => Ok(Self::PrintStacktrace),
            10 => Ok(Self::EndRun),
            other => Err(other),
        }
    }
}

/// Program-header location triple passed to the guest so it can build the
/// AT_PHDR/AT_PHENT/AT_PHNUM auxv entries.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PhInfo {
    pub e_phoff: u64,
    pub e_phentsize: u64,
    pub e_phnum: u64,
}

/// Environment announcement the host writes on a `GetInfo` hypercall.
///
/// The field order is the layout; host and guest must agree byte for byte.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct VmInfo {
    /// Guest-physical base of the memory the guest may manage.
    pub mem_start: u64,
    /// Length of that memory in bytes.
    pub mem_length: u64,
    /// First address past the loaded image, heap base for the guest.
    pub brk: u64,
    /// Entry point of the loaded user binary.
    pub user_entry: u64,
    /// Program-header triple for auxv.
    pub phinfo: PhInfo,
    /// Number of argv entries staged by the host.
    pub argc: u64,
    /// Guest address of the staged argv string table.
    pub argv: u64,
    /// Guest address of the staged envp string table.
    pub envp: u64,
}

/// Classification of an unrecoverable guest fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum FaultKind {
    Read = 0,
    Write = 1,
    Exec = 2,
    Uncategorized = 3,
    BadAddress = 4,
    AssertFailed = 5,
}

impl From<u64> for FaultKind {
    fn from(raw: u64) -> Self {
        match raw {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Exec,
            4 => Self::BadAddress,
            5 => Self::AssertFailed,
            _ => Self::Uncategorized,
        }
    }
}

/// Payload of the `Fault` hypercall: the guest hands this back when it
/// cannot continue and the host ends the run with the classification.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct FaultInfo {
    kind: u64,
    pub rip: u64,
    pub fault_addr: u64,
    pub extra: u64,
}

impl FaultInfo {
    pub fn new(kind: FaultKind, rip: u64, fault_addr: u64) -> Self {
        Self {
            kind: kind as u64,
            rip,
            fault_addr,
            extra: 0,
        }
    }

    pub fn kind(&self) -> FaultKind {
        FaultKind::from(self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn dispatch_numbers_are_frozen() {
        assert_eq!(Hypercall::Test as u64, 0);
        assert_eq!(Hypercall::Print as u64, 1);
        assert_eq!(Hypercall::SetFileBuf as u64, 7);
        assert_eq!(Hypercall::EndRun as u64, 10);
        assert_eq!(Hypercall::try_from(8), Ok(Hypercall::Fault));
        assert_eq!(Hypercall::try_from(11), Err(11));
    }

    #[test]
    fn vminfo_layout() {
        // 7 u64 scalar fields plus the 3-word phinfo triple.
        assert_eq!(core::mem::size_of::<VmInfo>(), 10 * 8);
        assert_eq!(core::mem::size_of::<FaultInfo>(), 4 * 8);
    }

    #[test]
    fn fault_info_round_trip() {
        let fault = FaultInfo::new(FaultKind::Write, 0x1000, 0xdead_beef);
        let bytes = fault.as_bytes();
        let back = FaultInfo::read_from_bytes(bytes).unwrap();
        assert_eq!(back.kind(), FaultKind::Write);
        assert_eq!({ back.fault_addr }, 0xdead_beef);
    }

    #[test]
    fn unknown_fault_kind_is_uncategorized() {
        assert_eq!(FaultKind::from(99), FaultKind::Uncategorized);
    }
}
