// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Host half of the hypercall bridge.
//!
//! On a VM-exit at the hypercall port the dispatch number is read from
//! rax and the arguments from the SysV argument registers; the return
//! value replaces rax before the guest resumes. Every guest pointer is
//! validated against the process address space before dereference; a
//! violation turns the hypercall into a `BadAddress` fault ending the
//! run.

use crate::address::{Address, VirtAddr};
use crate::error::{HvError, MemError};
use crate::vcpu::RegisterFrame;
use crate::vm::{RunEnd, Vm};

use std::io::Write;

use vmdefs::{FaultInfo, FaultKind, Hypercall, VmInfo, FILE_NAME_MAX};

/// Documented cap on strings marshalled from guest memory.
pub const MAX_STR_LEN: usize = 4096;

/// Dispatches one hypercall. Returns `Some` when the run is over.
pub(crate) fn handle_hypercall(
    vm: &mut Vm,
    regs: &mut RegisterFrame,
) -> Result<Option<RunEnd>, HvError> {
    let nr = regs.result();
    let [arg0, arg1, ..] = regs.args();

    // The dispatch table is a frozen contract; a number outside it means
    // the guest image and the hypervisor disagree about the ABI, which
    // no run should survive.
    let hc = match Hypercall::try_from(nr) {
        Ok(hc) => hc,
        Err(nr) => panic!("unknown hypercall number {nr}"),
    };

    let outcome = match hc {
        Hypercall::Test => {
            log::debug!("test hypercall: arg {arg0:#x}");
            Ok(arg0)
        }
        Hypercall::Print => hc_print(vm, arg0),
        Hypercall::GetMemInfo => hc_get_mem_info(vm, arg0, arg1),
        Hypercall::GetKernelBrk => Ok(vm.kernel_brk.bits()),
        Hypercall::GetInfo => hc_get_info(vm, arg0),
        Hypercall::GetFileLen => Ok(hc_file(vm, arg0).len() as u64),
        Hypercall::GetFileName => hc_get_file_name(vm, arg0, arg1),
        Hypercall::SetFileBuf => hc_set_file_buf(vm, arg0, arg1),
        Hypercall::Fault => return Ok(Some(hc_fault(vm, regs, arg0))),
        Hypercall::PrintStacktrace => {
            vm.print_stacktrace(arg0, arg1);
            Ok(0)
        }
        Hypercall::EndRun => return Ok(Some(RunEnd::Exit)),
    };

    match outcome {
        Ok(value) => {
            regs.set_result(value);
            Ok(None)
        }
        // Marshalling failure: the run ends with a BadAddress fault
        // pointing at the offending argument.
        Err(_) => Ok(Some(RunEnd::Fault(FaultInfo::new(
            FaultKind::BadAddress,
            regs.rip,
            arg0,
        )))),
    }
}

fn hc_print(vm: &mut Vm, ptr: u64) -> Result<u64, MemError> {
    let text = vm.process.space.read_cstr(VirtAddr::new(ptr), MAX_STR_LEN)?;
    vm.output.extend_from_slice(text.as_bytes());
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
    Ok(0)
}

fn hc_get_mem_info(vm: &mut Vm, base_ptr: u64, len_ptr: u64) -> Result<u64, MemError> {
    let (base, len) = vm.guest_mem;
    vm.process.space.write_obj(VirtAddr::new(base_ptr), &base)?;
    vm.process.space.write_obj(VirtAddr::new(len_ptr), &len)?;
    Ok(0)
}

fn hc_get_info(vm: &mut Vm, ptr: u64) -> Result<u64, MemError> {
    let info: VmInfo = vm.vminfo;
    vm.process.space.write_obj(VirtAddr::new(ptr), &info)?;
    Ok(0)
}

/// File-table lookup shared by the file hypercalls. An index the host
/// never announced is an ABI violation and aborts the run.
fn hc_file(vm: &Vm, index: u64) -> &crate::files::FileInput {
    let index = index as usize;
    match vm.files.get(index) {
        Some(file) => file,
        None => panic!("guest requested unknown file index {index}"),
    }
}

fn hc_get_file_name(vm: &mut Vm, index: u64, buf: u64) -> Result<u64, MemError> {
    let mut name = hc_file(vm, index).name().as_bytes().to_vec();
    name.truncate(FILE_NAME_MAX - 1);
    name.push(0);
    vm.process.space.write_bytes(VirtAddr::new(buf), &name)?;
    Ok(0)
}

/// Binds the guest buffer for a file input and stages the file bytes
/// into it. Rebinding is allowed; the last binding wins.
fn hc_set_file_buf(vm: &mut Vm, index: u64, buf: u64) -> Result<u64, MemError> {
    let data = hc_file(vm, index).data().to_vec();
    let dest = VirtAddr::new(buf);
    vm.process.space.write_bytes(dest, &data)?;
    vm.files
        .get_mut(index as usize)
        .expect("file index checked above")
        .set_guest_buf(dest);
    Ok(0)
}

fn hc_fault(vm: &mut Vm, regs: &RegisterFrame, ptr: u64) -> RunEnd {
    match vm.process.space.read_obj::<FaultInfo>(VirtAddr::new(ptr)) {
        Ok(info) => {
            match vm.symbol_at(info.rip) {
                Some(sym) => log::error!(
                    "guest fault {:?} at {:#x} ({}) touching {:#x}",
                    info.kind(),
                    { info.rip },
                    sym.name,
                    { info.fault_addr },
                ),
                None => log::error!(
                    "guest fault {:?} at {:#x} touching {:#x}",
                    info.kind(),
                    { info.rip },
                    { info.fault_addr },
                ),
            }
            RunEnd::Fault(info)
        }
        // The fault report itself was unreadable.
        Err(_) => RunEnd::Fault(FaultInfo::new(FaultKind::BadAddress, regs.rip, ptr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileInput;
    use crate::vm::testutil::{test_vm, MockVcpu};

    const TEXT: u64 = 0x10000;
    const DATA: u64 = 0x12000;

    #[test]
    fn round_trip_result_register() {
        let mut vm = test_vm(vec![]);
        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::Test as u64, [0x1234, 0, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::GetKernelBrk as u64, [0; 6]);
        vcpu.push_hypercall(Hypercall::EndRun as u64, [0; 6]);
        assert_eq!(vm.run(&mut vcpu).unwrap(), RunEnd::Exit);

        // The guest observed exactly the host's return values: the echo
        // of its argument, then the kernel brk.
        assert_eq!(vcpu.written[0].rax, 0x1234);
        assert_eq!(vcpu.written[1].rax, vm.kernel_brk.bits());

        // The vCPU was placed at the kernel image entry.
        let (root, entry, stack) = vcpu.inited.unwrap();
        assert_eq!(entry, crate::address::VirtAddr::new(0x10040));
        assert!(!root.is_null());
        assert!(stack.bits() > 0);
    }

    #[test]
    fn print_reads_guest_string() {
        let mut vm = test_vm(vec![]);
        vm.process
            .space
            .write_bytes(VirtAddr::new(DATA), b"hello guest\n\0")
            .unwrap();

        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::Print as u64, [DATA, 0, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::EndRun as u64, [0; 6]);
        assert_eq!(vm.run(&mut vcpu).unwrap(), RunEnd::Exit);
        assert_eq!(vm.output(), b"hello guest\n");
    }

    #[test]
    fn print_with_bad_pointer_faults() {
        let mut vm = test_vm(vec![]);
        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::Print as u64, [0xdead_0000, 0, 0, 0, 0, 0]);

        match vm.run(&mut vcpu).unwrap() {
            RunEnd::Fault(info) => {
                assert_eq!(info.kind(), FaultKind::BadAddress);
                assert_eq!({ info.fault_addr }, 0xdead_0000);
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn get_info_writes_vminfo_blob() {
        let mut vm = test_vm(vec![]);
        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::GetInfo as u64, [DATA, 0, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::EndRun as u64, [0; 6]);
        vm.run(&mut vcpu).unwrap();

        let staged: VmInfo = vm.process.space.read_obj(VirtAddr::new(DATA)).unwrap();
        assert_eq!(staged, vm.vminfo);
        assert_eq!({ staged.user_entry }, 0x10040);
        assert_eq!({ staged.brk }, 0x14000);
    }

    #[test]
    fn get_mem_info_writes_base_and_length() {
        let mut vm = test_vm(vec![]);
        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::GetMemInfo as u64, [DATA, DATA + 8, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::EndRun as u64, [0; 6]);
        vm.run(&mut vcpu).unwrap();

        let base: u64 = vm.process.space.read_obj(VirtAddr::new(DATA)).unwrap();
        let len: u64 = vm.process.space.read_obj(VirtAddr::new(DATA + 8)).unwrap();
        assert_eq!((base, len), vm.guest_mem);
        assert!(len > 0);
    }

    #[test]
    fn file_hypercalls() {
        let mut vm = test_vm(vec![FileInput::new("input.bin", b"seed data".to_vec())]);
        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::GetFileLen as u64, [0, 0, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::GetFileName as u64, [0, DATA, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::SetFileBuf as u64, [0, DATA + 0x100, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::EndRun as u64, [0; 6]);
        vm.run(&mut vcpu).unwrap();

        assert_eq!(vcpu.written[0].rax, 9);
        let name = vm
            .process
            .space
            .read_cstr(VirtAddr::new(DATA), 64)
            .unwrap();
        assert_eq!(name, "input.bin");

        let mut staged = [0u8; 9];
        vm.process
            .space
            .read_bytes(VirtAddr::new(DATA + 0x100), &mut staged)
            .unwrap();
        assert_eq!(&staged, b"seed data");
        assert_eq!(
            vm.files.get(0).unwrap().guest_buf(),
            Some(VirtAddr::new(DATA + 0x100))
        );
    }

    #[test]
    fn fault_hypercall_classifies_the_run() {
        let mut vm = test_vm(vec![]);
        let report = FaultInfo::new(FaultKind::Write, 0x10044, 0xdead_beef);
        vm.process
            .space
            .write_obj(VirtAddr::new(DATA), &report)
            .unwrap();

        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::Fault as u64, [DATA, 0, 0, 0, 0, 0]);

        match vm.run(&mut vcpu).unwrap() {
            RunEnd::Fault(info) => {
                assert_eq!(info.kind(), FaultKind::Write);
                assert_eq!({ info.fault_addr }, 0xdead_beef);
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn stacktrace_hypercall_is_harmless() {
        let mut vm = test_vm(vec![]);
        let mut vcpu = MockVcpu::new();
        vcpu.push_hypercall(Hypercall::PrintStacktrace as u64, [DATA, TEXT, 0, 0, 0, 0]);
        vcpu.push_hypercall(Hypercall::EndRun as u64, [0; 6]);
        assert_eq!(vm.run(&mut vcpu).unwrap(), RunEnd::Exit);
    }
}
