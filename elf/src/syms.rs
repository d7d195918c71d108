// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

use super::types::*;
use super::ElfError;

use core::ffi;

/// An ELF64 string table. Symbol and section names are NUL-terminated
/// strings indexed by byte offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct Elf64Strtab<'a> {
    strtab_buf: &'a [u8],
}

impl<'a> Elf64Strtab<'a> {
    pub fn new(strtab_buf: &'a [u8]) -> Self {
        Self { strtab_buf }
    }

    /// Retrieves the string at `index`, which must name a valid
    /// NUL-terminated UTF-8 string inside the table.
    pub fn get_str(&self, index: Elf64Word) -> Result<&'a str, ElfError> {
        let index = usize::try_from(index).unwrap();
        if index >= self.strtab_buf.len() {
            return Err(ElfError::InvalidStrtabString);
        }

        ffi::CStr::from_bytes_until_nul(&self.strtab_buf[index..])
            .map_err(|_| ElfError::InvalidStrtabString)?
            .to_str()
            .map_err(|_| ElfError::InvalidStrtabString)
    }
}

/// Raw ELF64 symbol table entry.
#[derive(Debug, Clone, Copy)]
pub struct Elf64Sym {
    pub st_name: Elf64Word,
    pub st_info: Elf64char,
    pub st_other: Elf64char,
    pub st_shndx: Elf64Half,
    pub st_value: Elf64Addr,
    pub st_size: Elf64Xword,
}

impl Elf64Sym {
    /// On-disk size of one symbol entry.
    pub const ENTSIZE: usize = 24;

    pub fn read(buf: &[u8]) -> Self {
        let st_name = Elf64Word::from_le_bytes(buf[0..4].try_into().unwrap());
        let st_info = buf[4];
        let st_other = buf[5];
        let st_shndx = Elf64Half::from_le_bytes(buf[6..8].try_into().unwrap());
        let st_value = Elf64Addr::from_le_bytes(buf[8..16].try_into().unwrap());
        let st_size = Elf64Xword::from_le_bytes(buf[16..24].try_into().unwrap());
        Self {
            st_name,
            st_info,
            st_other,
            st_shndx,
            st_value,
            st_size,
        }
    }

    /// Symbol type, low nibble of st_info (STT_FUNC = 2, ...).
    pub fn sym_type(&self) -> Elf64char {
        self.st_info & 0xf
    }

    /// Symbol binding, high nibble of st_info (STB_GLOBAL = 1, ...).
    pub fn binding(&self) -> Elf64char {
        self.st_info >> 4
    }

    /// Symbol visibility, low bits of st_other.
    pub fn visibility(&self) -> Elf64char {
        self.st_other & 0x3
    }
}
