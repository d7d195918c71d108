// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Materializes a guest process image from a parsed ELF view.
//!
//! For each LOAD segment the covered range is mapped rounded out to page
//! boundaries, the file bytes are copied in and the tail stays zero by
//! virtue of fresh-frame allocation. Segment protections are applied in a
//! second pass once all bytes are in place, so a split page shared by two
//! segments is writable while either still needs its copy; the later
//! segment's protection wins on such a page.

use crate::address::{Address, VirtAddr};
use crate::error::HvError;
use crate::mm::{AddressSpace, MapFlags, Perms};
use crate::types::PAGE_SIZE;

use elf::{Elf64Phdr, Elf64PhdrFlags, ElfPhdrInfo, ElfView};

/// What the loader reports back about a placed image.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub entry: VirtAddr,
    pub load_addr: VirtAddr,
    /// First address past the image, heap base.
    pub brk: VirtAddr,
    pub phinfo: ElfPhdrInfo,
    pub interpreter: Option<String>,
}

fn segment_perms(flags: Elf64PhdrFlags) -> Perms {
    let mut perms = Perms::empty();
    if flags.contains(Elf64PhdrFlags::READ) {
        perms |= Perms::READ;
    }
    if flags.contains(Elf64PhdrFlags::WRITE) {
        perms |= Perms::WRITE;
    }
    if flags.contains(Elf64PhdrFlags::EXECUTE) {
        perms |= Perms::EXEC;
    }
    perms
}

/// Maps every LOAD segment of `view` into `space` and copies the file
/// bytes. The view must already be rebased for ET_DYN images.
pub fn load_into(space: &mut AddressSpace, view: &ElfView<'_>) -> Result<LoadedImage, HvError> {
    let mut protections: Vec<(VirtAddr, u64, Perms)> = Vec::new();

    for segment in view.segments() {
        if segment.p_type != Elf64Phdr::PT_LOAD || segment.memsize == 0 {
            continue;
        }

        let start = VirtAddr::new(segment.vaddr).page_align();
        let end = VirtAddr::new(segment.vaddr + segment.memsize).page_align_up();

        // Adjacent segments may share a boundary page; only pages not yet
        // owned by an earlier segment are mapped.
        let mut page = start;
        while page < end {
            if !space.is_mapped(page) {
                space.map_range(page, PAGE_SIZE as u64, Perms::rw(), MapFlags::empty())?;
            }
            page = page + PAGE_SIZE as u64;
        }

        let data = view.segment_data(&segment)?;
        space.write_bytes(VirtAddr::new(segment.vaddr), data)?;

        protections.push((start, end - start, segment_perms(segment.flags)));
    }

    for (start, len, perms) in protections {
        space.set_range_perms(start, len, perms)?;
    }

    Ok(LoadedImage {
        entry: VirtAddr::new(view.entry()),
        load_addr: VirtAddr::new(view.load_addr()),
        brk: VirtAddr::new(view.initial_brk()),
        phinfo: view.phinfo(),
        interpreter: view.interpreter().map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::alloc::FramePool;
    use crate::types::{USER_WINDOW_END, USER_WINDOW_START};
    use crate::vm::testutil::build_minimal_elf;

    fn space() -> AddressSpace {
        let pool = FramePool::new_shared(256 * PAGE_SIZE).unwrap();
        AddressSpace::new(
            pool,
            VirtAddr::new(USER_WINDOW_START),
            VirtAddr::new(USER_WINDOW_END),
        )
        .unwrap()
    }

    #[test]
    fn load_copies_and_protects() {
        // Two segments: R+X text at 0x10000, RW data at 0x12000.
        let image = build_minimal_elf(0x10040);
        let view = ElfView::new(&image).unwrap();
        let mut space = space();

        let loaded = load_into(&mut space, &view).unwrap();
        assert_eq!(loaded.entry, VirtAddr::new(0x10040));
        assert_eq!(loaded.load_addr, VirtAddr::new(0x10000));
        assert_eq!(loaded.brk, VirtAddr::new(0x14000));

        // Text bytes landed and the page is not writable.
        let mut buf = [0u8; 4];
        space.read_bytes(VirtAddr::new(0x10000), &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0x90, 0x90, 0x90]);
        assert!(space
            .write_bytes(VirtAddr::new(0x10000), &[0])
            .is_err());

        // Data segment is writable, BSS tail reads zero.
        space.write_bytes(VirtAddr::new(0x12000), &[1]).unwrap();
        let mut tail = [0xffu8; 8];
        space.read_bytes(VirtAddr::new(0x12100), &mut tail).unwrap();
        assert_eq!(tail, [0u8; 8]);
    }

    #[test]
    fn load_rebased_dyn_image() {
        let mut image = build_minimal_elf(0x10040);
        // Flip the type to ET_DYN; the builder's fixed link addresses
        // then act as offsets under the chosen base.
        image[16..18].copy_from_slice(&3u16.to_le_bytes());
        let mut view = ElfView::new(&image).unwrap();
        view.set_base(0x200000);

        let mut space = space();
        let loaded = load_into(&mut space, &view).unwrap();
        assert_eq!(loaded.load_addr, VirtAddr::new(0x210000));
        assert_eq!(loaded.entry, VirtAddr::new(0x210040));
        assert_eq!(loaded.brk, VirtAddr::new(0x214000));

        let mut buf = [0u8; 4];
        space.read_bytes(VirtAddr::new(0x210000), &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0x90, 0x90, 0x90]);
    }
}
