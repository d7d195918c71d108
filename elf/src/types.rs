// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

pub type Elf64Addr = u64;
pub type Elf64Off = u64;
pub type Elf64Half = u16;
pub type Elf64Word = u32;
pub type Elf64Xword = u64;
pub type Elf64char = u8;
