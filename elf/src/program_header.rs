// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

use super::types::*;
use super::ElfError;
use bitflags::bitflags;

bitflags! {
    /// Attributes of an ELF64 program header: whether the segment is
    /// readable, writable and/or executable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Elf64PhdrFlags : Elf64Word {
        const EXECUTE = 0x01;
        const WRITE   = 0x02;
        const READ    = 0x04;
    }
}

/// Program header entry in an ELF64 file.
#[derive(Debug, Clone, Copy)]
pub struct Elf64Phdr {
    pub p_type: Elf64Word,
    pub p_flags: Elf64PhdrFlags,
    pub p_offset: Elf64Off,
    pub p_vaddr: Elf64Addr,
    pub p_paddr: Elf64Addr,
    pub p_filesz: Elf64Xword,
    pub p_memsz: Elf64Xword,
    pub p_align: Elf64Xword,
}

impl Elf64Phdr {
    pub const PT_NULL: Elf64Word = 0;
    /// Loadable segment, consumed by the loader.
    pub const PT_LOAD: Elf64Word = 1;
    pub const PT_DYNAMIC: Elf64Word = 2;
    /// Dynamic-linker path, recorded as the view's interpreter.
    pub const PT_INTERP: Elf64Word = 3;

    /// Reads a program header entry from its 56-byte on-disk encoding.
    pub fn read(phdr_buf: &[u8]) -> Self {
        let p_type = Elf64Word::from_le_bytes(phdr_buf[0..4].try_into().unwrap());
        let p_flags = Elf64Word::from_le_bytes(phdr_buf[4..8].try_into().unwrap());
        let p_offset = Elf64Off::from_le_bytes(phdr_buf[8..16].try_into().unwrap());
        let p_vaddr = Elf64Addr::from_le_bytes(phdr_buf[16..24].try_into().unwrap());
        let p_paddr = Elf64Addr::from_le_bytes(phdr_buf[24..32].try_into().unwrap());
        let p_filesz = Elf64Xword::from_le_bytes(phdr_buf[32..40].try_into().unwrap());
        let p_memsz = Elf64Xword::from_le_bytes(phdr_buf[40..48].try_into().unwrap());
        let p_align = Elf64Xword::from_le_bytes(phdr_buf[48..56].try_into().unwrap());

        let p_flags = Elf64PhdrFlags::from_bits_truncate(p_flags);

        Self {
            p_type,
            p_flags,
            p_offset,
            p_vaddr,
            p_paddr,
            p_filesz,
            p_memsz,
            p_align,
        }
    }

    /// Basic integrity checks on a single entry. A PT_LOAD segment must
    /// not claim more file bytes than memory bytes.
    pub fn verify(&self) -> Result<(), ElfError> {
        if self.p_type == Self::PT_NULL {
            return Ok(());
        }

        if self.p_type == Self::PT_LOAD && self.p_memsz < self.p_filesz {
            return Err(ElfError::InvalidSegmentSize);
        }

        if self.p_filesz != 0 && self.p_offset.checked_add(self.p_filesz).is_none() {
            return Err(ElfError::InvalidFileRange);
        }
        if self.p_memsz != 0 && self.p_vaddr.checked_add(self.p_memsz).is_none() {
            return Err(ElfError::InvalidSegmentSize);
        }

        Ok(())
    }
}
