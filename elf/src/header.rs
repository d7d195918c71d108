// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

use super::types::*;
use super::ElfError;
use core::mem;

/// Header of an ELF64 file. Only the fields the view consumes are kept;
/// everything is read with explicit little-endian decoding so the parse
/// does not depend on host layout.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Elf64Hdr {
    pub e_ident: [Elf64char; 16],
    pub e_type: Elf64Half,
    pub e_machine: Elf64Half,
    pub e_version: Elf64Word,
    pub e_entry: Elf64Addr,
    pub e_phoff: Elf64Off,
    pub e_shoff: Elf64Off,
    pub e_flags: Elf64Word,
    pub e_ehsize: Elf64Half,
    pub e_phentsize: Elf64Half,
    pub e_phnum: Elf64Half,
    pub e_shentsize: Elf64Half,
    pub e_shnum: Elf64Half,
    pub e_shstrndx: Elf64Half,
}

impl Elf64Hdr {
    const EI_CLASS: usize = 4;
    const EI_DATA: usize = 5;
    const EI_VERSION: usize = 6;

    const ELFMAG: [Elf64char; 4] = [0x7f, b'E', b'L', b'F'];

    const ELFCLASS64: Elf64char = 2;
    const ELFDATA2LSB: Elf64char = 1;

    pub const ET_EXEC: Elf64Half = 2;
    pub const ET_DYN: Elf64Half = 3;

    const EM_X86_64: Elf64Half = 62;

    const EV_CURRENT: Elf64Word = 1;

    /// Reads and validates an ELF64 header from a byte buffer.
    ///
    /// Acceptance criteria: 64-bit little-endian, machine x86-64, type
    /// ET_EXEC or ET_DYN. Anything else is fatal before the guest starts.
    pub fn read(buf: &[u8]) -> Result<Self, ElfError> {
        if buf.len() < 16 {
            return Err(ElfError::FileTooShort);
        }
        let e_ident: [Elf64char; 16] = buf[..16].try_into().unwrap();
        if e_ident[..mem::size_of_val(&Self::ELFMAG)] != Self::ELFMAG {
            return Err(ElfError::UnrecognizedMagic);
        } else if e_ident[Self::EI_CLASS] != Self::ELFCLASS64 {
            return Err(ElfError::UnsupportedClass);
        } else if e_ident[Self::EI_DATA] != Self::ELFDATA2LSB {
            return Err(ElfError::UnsupportedEndianess);
        } else if e_ident[Self::EI_VERSION] != Self::EV_CURRENT as Elf64char {
            return Err(ElfError::UnsupportedVersion);
        }

        // ELFCLASS64 is confirmed, so the full header is 64 bytes.
        if buf.len() < 64 {
            return Err(ElfError::FileTooShort);
        }
        let e_type = Elf64Half::from_le_bytes(buf[16..18].try_into().unwrap());
        let e_machine = Elf64Half::from_le_bytes(buf[18..20].try_into().unwrap());
        let e_version = Elf64Word::from_le_bytes(buf[20..24].try_into().unwrap());
        let e_entry = Elf64Addr::from_le_bytes(buf[24..32].try_into().unwrap());
        let e_phoff = Elf64Off::from_le_bytes(buf[32..40].try_into().unwrap());
        let e_shoff = Elf64Off::from_le_bytes(buf[40..48].try_into().unwrap());
        let e_flags = Elf64Word::from_le_bytes(buf[48..52].try_into().unwrap());
        let e_ehsize = Elf64Half::from_le_bytes(buf[52..54].try_into().unwrap());
        let e_phentsize = Elf64Half::from_le_bytes(buf[54..56].try_into().unwrap());
        let e_phnum = Elf64Half::from_le_bytes(buf[56..58].try_into().unwrap());
        let e_shentsize = Elf64Half::from_le_bytes(buf[58..60].try_into().unwrap());
        let e_shnum = Elf64Half::from_le_bytes(buf[60..62].try_into().unwrap());
        let e_shstrndx = Elf64Half::from_le_bytes(buf[62..64].try_into().unwrap());

        if e_type != Self::ET_EXEC && e_type != Self::ET_DYN {
            return Err(ElfError::UnsupportedType);
        }
        if e_machine != Self::EM_X86_64 {
            return Err(ElfError::UnsupportedMachine);
        }
        if e_version != Self::EV_CURRENT {
            return Err(ElfError::UnsupportedVersion);
        }

        Ok(Self {
            e_ident,
            e_type,
            e_machine,
            e_version,
            e_entry,
            e_phoff,
            e_shoff,
            e_flags,
            e_ehsize,
            e_phentsize,
            e_phnum,
            e_shentsize,
            e_shnum,
            e_shstrndx,
        })
    }
}
