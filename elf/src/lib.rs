// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Host-side view of an ELF64 file.
//!
//! [`ElfView`] parses a file exactly once at construction and exposes the
//! pieces the loader and the hypercall bridge consume: loadable segments,
//! sections, symbols, the interpreter path and the program-header location
//! triple. The view is base-relative: [`ElfView::set_base`] is the only
//! mutation permitted after construction and rebases every absolute
//! virtual address reported by the accessors, which makes ET_DYN
//! relocation a single call.

#![no_std]

extern crate alloc;

pub mod error;
pub mod header;
pub mod program_header;
pub mod section_header;
pub mod syms;
pub mod types;


pub use error::ElfError;
pub use header::Elf64Hdr;
pub use program_header::{Elf64Phdr, Elf64PhdrFlags};
pub use section_header::{Elf64Shdr, Elf64ShdrFlags};
pub use syms::{Elf64Strtab, Elf64Sym};
pub use types::*;

use alloc::vec::Vec;
use core::ffi;

/// Program-header table location, passed through to the guest for auxv.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ElfPhdrInfo {
    pub e_phoff: Elf64Off,
    pub e_phentsize: Elf64Half,
    pub e_phnum: Elf64Half,
}

/// One program-header record of the view. Addresses are reported already
/// rebased by the view's current base.
#[derive(Debug, Clone, Copy)]
pub struct ElfSegment {
    pub p_type: Elf64Word,
    pub flags: Elf64PhdrFlags,
    pub file_offset: Elf64Off,
    pub vaddr: Elf64Addr,
    pub paddr: Elf64Addr,
    pub filesize: Elf64Xword,
    pub memsize: Elf64Xword,
    pub align: Elf64Xword,
}

/// One section record of the view, name already resolved.
#[derive(Debug, Clone, Copy)]
pub struct ElfSection<'a> {
    pub name: &'a str,
    pub sh_type: Elf64Word,
    pub flags: Elf64ShdrFlags,
    pub addr: Elf64Addr,
    pub file_offset: Elf64Off,
    pub size: Elf64Xword,
    pub link: Elf64Word,
    pub info: Elf64Word,
    pub addralign: Elf64Xword,
    pub entsize: Elf64Xword,
}

/// One symbol record of the view, name already resolved.
#[derive(Debug, Clone, Copy)]
pub struct ElfSymbol<'a> {
    pub name: &'a str,
    pub sym_type: Elf64char,
    pub binding: Elf64char,
    pub visibility: Elf64char,
    pub shndx: Elf64Half,
    pub value: Elf64Addr,
    pub size: Elf64Xword,
}

/// Returns the subslice `[offset, offset + len)` of `data`, or
/// [`ElfError::InvalidFileRange`] when it does not fit the file.
fn file_slice(data: &[u8], offset: Elf64Off, len: u64) -> Result<&[u8], ElfError> {
    let offset = usize::try_from(offset).map_err(|_| ElfError::InvalidFileRange)?;
    let len = usize::try_from(len).map_err(|_| ElfError::InvalidFileRange)?;
    let end = offset.checked_add(len).ok_or(ElfError::InvalidFileRange)?;
    data.get(offset..end).ok_or(ElfError::InvalidFileRange)
}

/// The parsed, rebasable view of one ELF64 file.
///
/// Internally every address is kept exactly as parsed; the accessors add
/// the current base, so rebasing never walks the records.
#[derive(Debug)]
pub struct ElfView<'a> {
    data: &'a [u8],
    base: Elf64Addr,
    e_type: Elf64Half,
    entry: Elf64Addr,
    load_addr: Elf64Addr,
    initial_brk: Elf64Addr,
    phinfo: ElfPhdrInfo,
    interpreter: Option<&'a str>,
    segments: Vec<ElfSegment>,
    sections: Vec<ElfSection<'a>>,
    symbols: Vec<ElfSymbol<'a>>,
}

impl<'a> ElfView<'a> {
    const PHDR_ENTSIZE: usize = 56;
    const SHDR_ENTSIZE: usize = 64;

    /// Parses `data` into a view. This is the only place the file is
    /// walked; all accessors afterwards are cheap.
    pub fn new(data: &'a [u8]) -> Result<Self, ElfError> {
        let hdr = Elf64Hdr::read(data)?;

        let phinfo = ElfPhdrInfo {
            e_phoff: hdr.e_phoff,
            e_phentsize: hdr.e_phentsize,
            e_phnum: hdr.e_phnum,
        };

        let segments = Self::read_segments(data, &hdr)?;

        // Fold the LOAD segments into the image bounds: the lowest vaddr
        // becomes load_addr, the highest page-rounded end becomes the
        // initial brk. Capture the INTERP payload on the way.
        let mut load_addr = Elf64Addr::MAX;
        let mut initial_brk: Elf64Addr = 0;
        let mut interpreter = None;
        for segment in segments.iter() {
            match segment.p_type {
                Elf64Phdr::PT_LOAD => {
                    load_addr = load_addr.min(segment.vaddr);
                    let end = segment
                        .vaddr
                        .checked_add(segment.memsize)
                        .and_then(|end| end.checked_add(0xfff))
                        .ok_or(ElfError::InvalidSegmentSize)?
                        & !0xfff;
                    initial_brk = initial_brk.max(end);
                }
                Elf64Phdr::PT_INTERP => {
                    let raw = file_slice(data, segment.file_offset, segment.filesize)?;
                    let path = ffi::CStr::from_bytes_until_nul(raw)
                        .map_err(|_| ElfError::InvalidInterpreter)?
                        .to_str()
                        .map_err(|_| ElfError::InvalidInterpreter)?;
                    interpreter = Some(path);
                }
                _ => {}
            }
        }
        if load_addr == Elf64Addr::MAX {
            return Err(ElfError::MissingLoadSegments);
        }

        let sections = Self::read_sections(data, &hdr)?;
        let symbols = Self::read_symbols(data, &sections)?;

        Ok(Self {
            data,
            base: 0,
            e_type: hdr.e_type,
            entry: hdr.e_entry,
            load_addr,
            initial_brk,
            phinfo,
            interpreter,
            segments,
            sections,
            symbols,
        })
    }

    fn read_segments(data: &'a [u8], hdr: &Elf64Hdr) -> Result<Vec<ElfSegment>, ElfError> {
        let entsize = usize::from(hdr.e_phentsize);
        if hdr.e_phnum != 0 && entsize < Self::PHDR_ENTSIZE {
            return Err(ElfError::InvalidPhdrSize);
        }

        let mut segments = Vec::with_capacity(usize::from(hdr.e_phnum));
        for i in 0..u64::from(hdr.e_phnum) {
            let off = hdr
                .e_phoff
                .checked_add(i * entsize as u64)
                .ok_or(ElfError::InvalidFileRange)?;
            let buf = file_slice(data, off, Self::PHDR_ENTSIZE as u64)?;
            let phdr = Elf64Phdr::read(buf);
            phdr.verify()?;
            if phdr.p_filesz != 0 {
                file_slice(data, phdr.p_offset, phdr.p_filesz)?;
            }
            segments.push(ElfSegment {
                p_type: phdr.p_type,
                flags: phdr.p_flags,
                file_offset: phdr.p_offset,
                vaddr: phdr.p_vaddr,
                paddr: phdr.p_paddr,
                filesize: phdr.p_filesz,
                memsize: phdr.p_memsz,
                align: phdr.p_align,
            });
        }
        Ok(segments)
    }

    fn read_sections(data: &'a [u8], hdr: &Elf64Hdr) -> Result<Vec<ElfSection<'a>>, ElfError> {
        if hdr.e_shoff == 0 || hdr.e_shnum == 0 {
            return Ok(Vec::new());
        }
        let entsize = usize::from(hdr.e_shentsize);
        if entsize < Self::SHDR_ENTSIZE {
            return Err(ElfError::InvalidShdrSize);
        }
        if hdr.e_shstrndx >= hdr.e_shnum {
            return Err(ElfError::InvalidSectionIndex);
        }

        let shdr_at = |i: u64| -> Result<Elf64Shdr, ElfError> {
            let off = hdr
                .e_shoff
                .checked_add(i * entsize as u64)
                .ok_or(ElfError::InvalidFileRange)?;
            Ok(Elf64Shdr::read(file_slice(
                data,
                off,
                Self::SHDR_ENTSIZE as u64,
            )?))
        };

        // Section names live in the section named by e_shstrndx.
        let shstr = shdr_at(u64::from(hdr.e_shstrndx))?;
        let strtab = Elf64Strtab::new(file_slice(data, shstr.sh_offset, shstr.sh_size)?);

        let mut sections = Vec::with_capacity(usize::from(hdr.e_shnum));
        for i in 0..u64::from(hdr.e_shnum) {
            let shdr = shdr_at(i)?;
            if shdr.sh_type != Elf64Shdr::SHT_NOBITS && shdr.sh_size != 0 {
                file_slice(data, shdr.sh_offset, shdr.sh_size)?;
            }
            sections.push(ElfSection {
                name: strtab.get_str(shdr.sh_name)?,
                sh_type: shdr.sh_type,
                flags: shdr.sh_flags,
                addr: shdr.sh_addr,
                file_offset: shdr.sh_offset,
                size: shdr.sh_size,
                link: shdr.sh_link,
                info: shdr.sh_info,
                addralign: shdr.sh_addralign,
                entsize: shdr.sh_entsize,
            });
        }
        Ok(sections)
    }

    fn read_symbols(
        data: &'a [u8],
        sections: &[ElfSection<'a>],
    ) -> Result<Vec<ElfSymbol<'a>>, ElfError> {
        let mut symbols = Vec::new();
        for section in sections {
            if section.sh_type != Elf64Shdr::SHT_SYMTAB && section.sh_type != Elf64Shdr::SHT_DYNSYM
            {
                continue;
            }

            let entsize = usize::try_from(section.entsize).unwrap_or(0);
            if entsize < Elf64Sym::ENTSIZE {
                return Err(ElfError::InvalidSymbolEntrySize);
            }

            // The names are in the string table the symbol section links to.
            let strtab_section = sections
                .get(usize::try_from(section.link).unwrap())
                .ok_or(ElfError::InvalidSectionIndex)?;
            let strtab = Elf64Strtab::new(file_slice(
                data,
                strtab_section.file_offset,
                strtab_section.size,
            )?);

            let syms_buf = file_slice(data, section.file_offset, section.size)?;
            for chunk in syms_buf.chunks_exact(entsize) {
                let sym = Elf64Sym::read(chunk);
                symbols.push(ElfSymbol {
                    name: strtab.get_str(sym.st_name)?,
                    sym_type: sym.sym_type(),
                    binding: sym.binding(),
                    visibility: sym.visibility(),
                    shndx: sym.st_shndx,
                    value: sym.st_value,
                    size: sym.st_size,
                });
            }
        }
        Ok(symbols)
    }

    /// Rebases the view: every absolute virtual address reported from now
    /// on is shifted by `base − previous_base` relative to the previous
    /// reports. ET_EXEC consumers only ever pass 0; ET_DYN consumers pick
    /// a base once before mapping.
    pub fn set_base(&mut self, base: Elf64Addr) {
        self.base = base;
    }

    pub fn base(&self) -> Elf64Addr {
        self.base
    }

    pub fn file_type(&self) -> Elf64Half {
        self.e_type
    }

    pub fn entry(&self) -> Elf64Addr {
        self.entry.wrapping_add(self.base)
    }

    pub fn load_addr(&self) -> Elf64Addr {
        self.load_addr.wrapping_add(self.base)
    }

    pub fn initial_brk(&self) -> Elf64Addr {
        self.initial_brk.wrapping_add(self.base)
    }

    pub fn phinfo(&self) -> ElfPhdrInfo {
        self.phinfo
    }

    pub fn interpreter(&self) -> Option<&'a str> {
        self.interpreter
    }

    /// All program-header records, addresses rebased.
    pub fn segments(&self) -> impl ExactSizeIterator<Item = ElfSegment> + '_ {
        let base = self.base;
        self.segments.iter().map(move |segment| ElfSegment {
            vaddr: segment.vaddr.wrapping_add(base),
            paddr: segment.paddr.wrapping_add(base),
            ..*segment
        })
    }

    /// All section records, addresses rebased.
    pub fn sections(&self) -> impl ExactSizeIterator<Item = ElfSection<'a>> + '_ {
        let base = self.base;
        self.sections.iter().map(move |section| ElfSection {
            addr: section.addr.wrapping_add(base),
            ..*section
        })
    }

    /// All symbol records, values rebased.
    pub fn symbols(&self) -> impl ExactSizeIterator<Item = ElfSymbol<'a>> + '_ {
        let base = self.base;
        self.symbols.iter().map(move |symbol| ElfSymbol {
            value: symbol.value.wrapping_add(base),
            ..*symbol
        })
    }

    /// The file bytes backing a segment. BSS bytes past `filesize` have no
    /// backing and are zero-filled by the consumer.
    pub fn segment_data(&self, segment: &ElfSegment) -> Result<&'a [u8], ElfError> {
        file_slice(self.data, segment.file_offset, segment.filesize)
    }

    /// The file bytes backing a section.
    pub fn section_data(&self, section: &ElfSection<'a>) -> Result<&'a [u8], ElfError> {
        file_slice(self.data, section.file_offset, section.size)
    }

    /// Finds the symbol whose `[value, value + size)` range contains
    /// `vaddr`, used to symbolize guest stack traces.
    pub fn symbol_at(&self, vaddr: Elf64Addr) -> Option<ElfSymbol<'a>> {
        self.symbols()
            .filter(|sym| sym.size != 0)
            .find(|sym| vaddr >= sym.value && vaddr < sym.value + sym.size)
    }
}
