// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! The boundary to the raw virtualization container.
//!
//! The container itself (create the VM, run until VM-exit) is an external
//! collaborator; the core only depends on this trait. What the bridge
//! relies on is a stable register ordering: hypercall and syscall
//! arguments sit in the SysV argument registers, the dispatch number and
//! the return value travel in rax.

use crate::address::{PhysAddr, VirtAddr};
use crate::error::HvError;

/// General-purpose register state of the single vCPU at a VM-exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl RegisterFrame {
    /// The six arguments of a hypercall or syscall, in SysV order.
    pub fn args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    /// The dispatch-number/result register.
    pub fn result(&self) -> u64 {
        self.rax
    }

    pub fn set_result(&mut self, value: u64) {
        self.rax = value;
    }
}

/// Reason the container handed control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// The guest executed an OUT instruction.
    IoOut { port: u16, value: u8 },
    /// The guest halted without going through the bridge.
    Halt,
    /// The container shut the VM down.
    Shutdown,
}

/// One virtual CPU of the container.
pub trait Vcpu {
    /// Places the vCPU at the given entry state: page-table root, entry
    /// point and stack top.
    fn init(&mut self, root: PhysAddr, entry: VirtAddr, stack: VirtAddr) -> Result<(), HvError>;

    /// Runs the guest until the next VM-exit.
    fn run(&mut self) -> Result<VmExit, HvError>;

    fn regs(&mut self) -> Result<RegisterFrame, HvError>;

    fn set_regs(&mut self, regs: &RegisterFrame) -> Result<(), HvError>;
}
