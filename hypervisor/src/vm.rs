// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! VM construction and the run loop.
//!
//! A [`Vm`] owns the frame pool, the guest process image and the file
//! inputs, and drives one vCPU to completion of a run: EndRun, a
//! classified fault, or a container error. Hypercalls are totally ordered
//! per vCPU; any host state mutated before an exit point is kept.

use crate::address::{Address, VirtAddr};
use crate::error::HvError;
use crate::files::{FileInput, FileTable};
use crate::hypercalls::handle_hypercall;
use crate::loader;
use crate::mm::alloc::FramePool;
use crate::mm::{AddressSpace, MapFlags, Perms};
use crate::types::{ET_DYN_LOAD_BASE, GUEST_STACK_SIZE, PAGE_SIZE, USER_WINDOW_END, USER_WINDOW_START};
use crate::vcpu::{Vcpu, VmExit};

use elf::{Elf64Hdr, ElfView};
use vmdefs::{FaultInfo, PhInfo, VmInfo, HYPERCALL_PORT};

/// Why a run ended. This is the primary observable for a fuzzing
/// harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The guest signalled normal termination.
    Exit,
    /// The guest reported an unrecoverable fault.
    Fault(FaultInfo),
}

/// Host view of the guest process: its address space and heap base.
#[derive(Debug)]
pub struct Process {
    pub space: AddressSpace,
    pub brk: VirtAddr,
}

/// Everything needed to build a [`Vm`].
#[derive(Debug, Default)]
pub struct VmConfig {
    pub mem_size: usize,
    /// The guest kernel image, entered by the vCPU.
    pub kernel: Vec<u8>,
    /// The target binary handed to the guest kernel via VmInfo. Loaded
    /// into the same guest address space when present.
    pub user: Option<Vec<u8>>,
    pub files: Vec<FileInput>,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

/// An owned symbol record harvested from the loaded images, used to
/// symbolize guest stack traces after the borrowing ELF views are gone.
#[derive(Debug, Clone)]
pub(crate) struct SymbolRecord {
    pub name: String,
    pub value: u64,
    pub size: u64,
}

#[derive(Debug)]
pub struct Vm {
    pub(crate) process: Process,
    pub(crate) files: FileTable,
    pub(crate) vminfo: VmInfo,
    pub(crate) kernel_brk: VirtAddr,
    kernel_entry: VirtAddr,
    stack_top: VirtAddr,
    pub(crate) guest_mem: (u64, u64),
    pub(crate) symbols: Vec<SymbolRecord>,
    /// Everything the guest printed through the bridge.
    pub(crate) output: Vec<u8>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Result<Self, HvError> {
        if config.mem_size == 0 || config.mem_size % PAGE_SIZE != 0 {
            return Err(HvError::BadArgument);
        }

        let pool = FramePool::new_shared(config.mem_size)?;
        let mut space = AddressSpace::new(
            pool.clone(),
            VirtAddr::new(USER_WINDOW_START),
            VirtAddr::new(USER_WINDOW_END),
        )?;

        let mut symbols = Vec::new();

        let mut kernel_view = ElfView::new(&config.kernel)?;
        if kernel_view.file_type() == Elf64Hdr::ET_DYN {
            kernel_view.set_base(ET_DYN_LOAD_BASE);
        }
        let kernel_image = loader::load_into(&mut space, &kernel_view)?;
        Self::harvest_symbols(&kernel_view, &mut symbols);

        // The user binary lands in the same guest address space; the
        // guest kernel builds the process from the VmInfo announcement.
        let user_image = match &config.user {
            Some(user) => {
                let mut view = ElfView::new(user)?;
                if view.file_type() == Elf64Hdr::ET_DYN {
                    view.set_base(ET_DYN_LOAD_BASE);
                }
                let image = loader::load_into(&mut space, &view)?;
                Self::harvest_symbols(&view, &mut symbols);
                image
            }
            None => kernel_image.clone(),
        };

        let stack_base =
            space.map_range_anywhere(GUEST_STACK_SIZE as u64, Perms::rw(), MapFlags::empty())?;
        let stack_top = stack_base + GUEST_STACK_SIZE as u64;

        let (argv_addr, envp_addr) = Self::stage_strings(&mut space, &config.argv, &config.envp)?;

        // Everything below the cursor now belongs to the images and the
        // host bookkeeping; the guest kernel manages the rest.
        let guest_mem = {
            let guard = pool.lock().expect("frame pool lock poisoned");
            let cursor = guard.alloc_cursor().bits();
            (cursor, config.mem_size as u64 - cursor)
        };

        let vminfo = VmInfo {
            mem_start: guest_mem.0,
            mem_length: guest_mem.1,
            brk: user_image.brk.bits(),
            user_entry: user_image.entry.bits(),
            phinfo: PhInfo {
                e_phoff: user_image.phinfo.e_phoff,
                e_phentsize: u64::from(user_image.phinfo.e_phentsize),
                e_phnum: u64::from(user_image.phinfo.e_phnum),
            },
            argc: config.argv.len() as u64,
            argv: argv_addr.bits(),
            envp: envp_addr.bits(),
        };

        Ok(Self {
            process: Process {
                space,
                brk: user_image.brk,
            },
            files: FileTable::new(config.files),
            vminfo,
            kernel_brk: kernel_image.brk,
            kernel_entry: kernel_image.entry,
            stack_top,
            guest_mem,
            symbols,
            output: Vec::new(),
        })
    }

    fn harvest_symbols(view: &ElfView<'_>, out: &mut Vec<SymbolRecord>) {
        for sym in view.symbols() {
            if sym.size == 0 || sym.name.is_empty() {
                continue;
            }
            out.push(SymbolRecord {
                name: sym.name.to_owned(),
                value: sym.value,
                size: sym.size,
            });
        }
    }

    /// Stages the argv and envp string tables into one read-only guest
    /// mapping. Strings are concatenated NUL-terminated; the guest splits
    /// them by count.
    fn stage_strings(
        space: &mut AddressSpace,
        argv: &[String],
        envp: &[String],
    ) -> Result<(VirtAddr, VirtAddr), HvError> {
        let mut table = Vec::new();
        for arg in argv {
            table.extend_from_slice(arg.as_bytes());
            table.push(0);
        }
        let envp_off = table.len() as u64;
        for env in envp {
            table.extend_from_slice(env.as_bytes());
            table.push(0);
        }
        if table.is_empty() {
            return Ok((VirtAddr::null(), VirtAddr::null()));
        }

        let len = VirtAddr::new(table.len() as u64).page_align_up().bits();
        let base = space.map_range_anywhere(len, Perms::rw(), MapFlags::empty())?;
        space.write_bytes(base, &table)?;
        space.set_range_perms(base, len, Perms::READ)?;
        Ok((base, base + envp_off))
    }

    /// Drives `vcpu` until the run ends. I/O exits on the hypercall port
    /// dispatch into the bridge; every other exit is a container-level
    /// failure.
    pub fn run(&mut self, vcpu: &mut dyn Vcpu) -> Result<RunEnd, HvError> {
        vcpu.init(self.process.space.root(), self.kernel_entry, self.stack_top)?;

        loop {
            match vcpu.run()? {
                VmExit::IoOut {
                    port: HYPERCALL_PORT,
                    ..
                } => {
                    let mut regs = vcpu.regs()?;
                    if let Some(end) = handle_hypercall(self, &mut regs)? {
                        log::info!("run ended: {end:?}");
                        return Ok(end);
                    }
                    vcpu.set_regs(&regs)?;
                }
                VmExit::IoOut { port, .. } => {
                    log::error!("guest accessed unexpected i/o port {port:#x}");
                    return Err(HvError::Container("guest accessed unexpected i/o port"));
                }
                VmExit::Halt => return Err(HvError::Container("guest halted outside the bridge")),
                VmExit::Shutdown => return Err(HvError::Container("container shut down")),
            }
        }
    }

    /// The bytes the guest printed through the bridge so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Host mapping of guest physical memory, for registering the region
    /// with the virtualization container. The pointer stays valid for the
    /// lifetime of this VM.
    pub fn host_memory(&self) -> (*mut u8, usize) {
        let pool = self.process.space.allocator();
        let guard = pool.lock().expect("frame pool lock poisoned");
        (guard.mem().host_base(), guard.mem().size())
    }

    pub fn vminfo(&self) -> &VmInfo {
        &self.vminfo
    }

    pub(crate) fn symbol_at(&self, addr: u64) -> Option<&SymbolRecord> {
        self.symbols
            .iter()
            .find(|sym| addr >= sym.value && addr < sym.value + sym.size)
    }

    /// Unwinds the guest stack by scanning return-address candidates and
    /// resolving them through the symbol view.
    pub(crate) fn print_stacktrace(&self, rsp: u64, rip: u64) {
        match self.symbol_at(rip) {
            Some(sym) => log::info!("guest fault at {:#x} in {}", rip, sym.name),
            None => log::info!("guest fault at {:#x}", rip),
        }

        let mut frame = [0u8; 8];
        for slot in 0..64u64 {
            let Some(addr) = rsp.checked_add(slot * 8) else {
                break;
            };
            if self
                .process
                .space
                .read_bytes(VirtAddr::new(addr), &mut frame)
                .is_err()
            {
                break;
            }
            let value = u64::from_le_bytes(frame);
            if let Some(sym) = self.symbol_at(value) {
                log::info!("  #{:<2} {:#x} {}+{:#x}", slot, value, sym.name, value - sym.value);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::address::PhysAddr;
    use crate::error::HvError;
    use crate::vcpu::RegisterFrame;
    use std::collections::VecDeque;

    /// Assembles a minimal ELF64 image: an R+X text segment at 0x10000
    /// (first bytes NOP) and an RW data segment at 0x12000 with a BSS
    /// tail, giving an initial brk of 0x14000.
    pub(crate) fn build_minimal_elf(entry: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];

        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1; // EV_CURRENT
        buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        buf[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..32].copy_from_slice(&entry.to_le_bytes());
        buf[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        buf[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        buf[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        buf[56..58].copy_from_slice(&2u16.to_le_bytes()); // e_phnum

        let mut phdr = |off: usize, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64| {
            buf[off..off + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            buf[off + 4..off + 8].copy_from_slice(&flags.to_le_bytes());
            buf[off + 8..off + 16].copy_from_slice(&offset.to_le_bytes());
            buf[off + 16..off + 24].copy_from_slice(&vaddr.to_le_bytes());
            buf[off + 24..off + 32].copy_from_slice(&vaddr.to_le_bytes());
            buf[off + 32..off + 40].copy_from_slice(&filesz.to_le_bytes());
            buf[off + 40..off + 48].copy_from_slice(&memsz.to_le_bytes());
            buf[off + 48..off + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        };
        phdr(64, 0x5, 0x200, 0x10000, 0x100, 0x100); // text, R+X
        phdr(120, 0x6, 0x300, 0x12000, 0x100, 0x1800); // data + bss, RW

        buf[0x200..0x204].copy_from_slice(&[0x90; 4]);
        buf
    }

    /// A scripted container: each `run` pops one (register frame, exit)
    /// pair; register writes from the bridge are recorded.
    #[derive(Default)]
    pub(crate) struct MockVcpu {
        script: VecDeque<(RegisterFrame, VmExit)>,
        pub written: Vec<RegisterFrame>,
        pub inited: Option<(PhysAddr, VirtAddr, VirtAddr)>,
        current: RegisterFrame,
    }

    impl MockVcpu {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_hypercall(&mut self, nr: u64, args: [u64; 6]) {
            let mut regs = RegisterFrame {
                rax: nr,
                rdi: args[0],
                rsi: args[1],
                rdx: args[2],
                rcx: args[3],
                r8: args[4],
                r9: args[5],
                rip: 0x10040,
                ..Default::default()
            };
            regs.rsp = 0x7000_0000;
            self.script.push_back((
                regs,
                VmExit::IoOut {
                    port: HYPERCALL_PORT,
                    value: nr as u8,
                },
            ));
        }

        pub fn push_exit(&mut self, exit: VmExit) {
            self.script.push_back((RegisterFrame::default(), exit));
        }
    }

    impl Vcpu for MockVcpu {
        fn init(&mut self, root: PhysAddr, entry: VirtAddr, stack: VirtAddr) -> Result<(), HvError> {
            self.inited = Some((root, entry, stack));
            Ok(())
        }

        fn run(&mut self) -> Result<VmExit, HvError> {
            let (regs, exit) = self
                .script
                .pop_front()
                .ok_or(HvError::Container("mock script exhausted"))?;
            self.current = regs;
            Ok(exit)
        }

        fn regs(&mut self) -> Result<RegisterFrame, HvError> {
            Ok(self.current)
        }

        fn set_regs(&mut self, regs: &RegisterFrame) -> Result<(), HvError> {
            self.current = *regs;
            self.written.push(*regs);
            Ok(())
        }
    }

    pub(crate) fn test_vm(files: Vec<FileInput>) -> Vm {
        Vm::new(VmConfig {
            mem_size: 1024 * crate::types::PAGE_SIZE,
            kernel: build_minimal_elf(0x10040),
            user: None,
            files,
            argv: vec!["target".into()],
            envp: vec![],
        })
        .unwrap()
    }
}
