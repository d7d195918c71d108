// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Linux KVM backend.
//!
//! One VM, one vCPU, one flat memory slot covering all guest physical
//! memory. The vCPU is dropped straight into 64-bit mode: paging comes
//! from the address space the host already built, so no real-mode
//! trampoline is needed.

use crate::address::{Address, PhysAddr, VirtAddr};
use crate::error::HvError;
use crate::vcpu::{RegisterFrame, Vcpu, VmExit};

use kvm_bindings::{kvm_segment, kvm_userspace_memory_region};
use kvm_ioctls::Cap::UserMemory;
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

const CR0_PE: u64 = 1 << 0;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_AM: u64 = 1 << 18;
const CR0_PG: u64 = 1 << 31;

const CR4_PAE: u64 = 1 << 5;
const CR4_OSFXSR: u64 = 1 << 9;

const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const EFER_NX: u64 = 1 << 11;

const RFLAGS_RESERVED: u64 = 1 << 1;

/// Check if KVM is usable on this system.
pub fn is_available() -> bool {
    match Kvm::new() {
        Ok(kvm) => kvm.check_extension(UserMemory),
        Err(_) => false,
    }
}

pub struct KvmVcpu {
    _kvm: Kvm,
    _vm: VmFd,
    vcpu: VcpuFd,
}

impl KvmVcpu {
    /// Creates the VM and registers the host allocation backing guest
    /// physical memory as one slot at guest physical address 0.
    ///
    /// # Safety
    /// `host_base` must point at a live allocation of `mem_size` bytes
    /// that outlives the returned vCPU.
    pub unsafe fn new(host_base: *mut u8, mem_size: usize) -> Result<Self, HvError> {
        let kvm = Kvm::new().map_err(|_| HvError::Container("cannot open /dev/kvm"))?;
        if !kvm.check_extension(UserMemory) {
            return Err(HvError::Container("KVM lacks user memory support"));
        }
        let vm = kvm
            .create_vm()
            .map_err(|_| HvError::Container("cannot create VM"))?;

        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: mem_size as u64,
            userspace_addr: host_base as u64,
            flags: 0,
        };
        // SAFETY: the caller guarantees the region stays alive and
        // uniquely registered.
        unsafe {
            vm.set_user_memory_region(region)
                .map_err(|_| HvError::Container("cannot register guest memory"))?;
        }

        let vcpu = vm
            .create_vcpu(0)
            .map_err(|_| HvError::Container("cannot create vCPU"))?;

        Ok(Self {
            _kvm: kvm,
            _vm: vm,
            vcpu,
        })
    }

    fn code_segment() -> kvm_segment {
        kvm_segment {
            base: 0,
            limit: 0xffff_ffff,
            selector: 1 << 3,
            type_: 0b1011, // execute/read, accessed
            present: 1,
            dpl: 0,
            db: 0,
            s: 1,
            l: 1,
            g: 1,
            ..Default::default()
        }
    }

    fn data_segment() -> kvm_segment {
        kvm_segment {
            base: 0,
            limit: 0xffff_ffff,
            selector: 2 << 3,
            type_: 0b0011, // read/write, accessed
            present: 1,
            dpl: 0,
            db: 1,
            s: 1,
            g: 1,
            ..Default::default()
        }
    }
}

impl Vcpu for KvmVcpu {
    fn init(&mut self, root: PhysAddr, entry: VirtAddr, stack: VirtAddr) -> Result<(), HvError> {
        let mut sregs = self
            .vcpu
            .get_sregs()
            .map_err(|_| HvError::Container("get_sregs failed"))?;

        sregs.cr3 = root.bits();
        sregs.cr4 = CR4_PAE | CR4_OSFXSR;
        sregs.cr0 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;
        sregs.efer = EFER_LME | EFER_LMA | EFER_NX;

        sregs.cs = Self::code_segment();
        let data = Self::data_segment();
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;

        self.vcpu
            .set_sregs(&sregs)
            .map_err(|_| HvError::Container("set_sregs failed"))?;

        let frame = RegisterFrame {
            rip: entry.bits(),
            rsp: stack.bits(),
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        self.set_regs(&frame)
    }

    fn run(&mut self) -> Result<VmExit, HvError> {
        match self.vcpu.run() {
            Ok(VcpuExit::IoOut(port, data)) => Ok(VmExit::IoOut {
                port,
                value: data.first().copied().unwrap_or(0),
            }),
            Ok(VcpuExit::Hlt) => Ok(VmExit::Halt),
            Ok(VcpuExit::Shutdown) => Ok(VmExit::Shutdown),
            Ok(exit) => {
                log::error!("unhandled VM-exit: {exit:?}");
                Err(HvError::Container("unhandled VM-exit"))
            }
            Err(_) => Err(HvError::Container("KVM_RUN failed")),
        }
    }

    fn regs(&mut self) -> Result<RegisterFrame, HvError> {
        let regs = self
            .vcpu
            .get_regs()
            .map_err(|_| HvError::Container("get_regs failed"))?;
        Ok(RegisterFrame {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.rflags,
        })
    }

    fn set_regs(&mut self, frame: &RegisterFrame) -> Result<(), HvError> {
        let mut regs = kvm_bindings::kvm_regs {
            rax: frame.rax,
            rbx: frame.rbx,
            rcx: frame.rcx,
            rdx: frame.rdx,
            rsi: frame.rsi,
            rdi: frame.rdi,
            rsp: frame.rsp,
            rbp: frame.rbp,
            r8: frame.r8,
            r9: frame.r9,
            r10: frame.r10,
            r11: frame.r11,
            r12: frame.r12,
            r13: frame.r13,
            r14: frame.r14,
            r15: frame.r15,
            rip: frame.rip,
            rflags: frame.rflags,
        };
        if regs.rflags == 0 {
            regs.rflags = RFLAGS_RESERVED;
        }
        self.vcpu
            .set_regs(&regs)
            .map_err(|_| HvError::Container("set_regs failed"))
    }
}
