// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! The syscall half of the bridge.
//!
//! Guest `syscall` instructions land here with the same argument-register
//! convention the hypercalls use. Handlers receive the scheduler (for the
//! process), the raw arguments and a mutable view of the register frame;
//! a blocking handler saves the frame, sets the waiting state and yields,
//! and its result register is rewritten on wake.

use crate::task::{Scheduler, TaskState, WaitFor};
use crate::usermem::{UserPtr, UserSlice};

pub const SYS_WRITE: u64 = 1;
pub const SYS_BRK: u64 = 12;
pub const SYS_EXIT: u64 = 60;
pub const SYS_WAIT4: u64 = 61;

pub const EBADF: i64 = 9;
pub const ECHILD: i64 = 10;
pub const EFAULT: i64 = 14;
pub const EINVAL: i64 = 22;
pub const ENOSYS: i64 = 38;

/// Heap growth allowed past the initial brk.
const BRK_LIMIT: u64 = 16 * 1024 * 1024;

/// User register state captured at syscall entry. Preserved in the task
/// when a handler parks the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SyscallFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl SyscallFrame {
    /// The six arguments, in the same SysV ordering the hypercalls use.
    pub fn args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    pub fn result(&self) -> u64 {
        self.rax
    }

    pub fn set_result(&mut self, value: u64) {
        self.rax = value;
    }
}

/// Outcome of one dispatched syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    /// The handler completed; the value is already in the result
    /// register.
    Done(i64),
    /// The caller was parked (or exited); another task runs now and the
    /// caller's saved frame receives its result on wake.
    Parked,
}

/// Dispatches one syscall for the current task.
pub fn dispatch(sched: &mut Scheduler, frame: &mut SyscallFrame) -> SyscallResult {
    let nr = frame.rax;
    let [arg0, arg1, arg2, _, _, _] = frame.args();

    let result = match nr {
        SYS_WRITE => SyscallResult::Done(sys_write(arg0, arg1, arg2)),
        SYS_BRK => SyscallResult::Done(sys_brk(sched, arg0)),
        SYS_EXIT => sys_exit(sched, arg0),
        SYS_WAIT4 => sys_wait4(sched, frame, arg0, arg1),
        _ => {
            log::warn!("unimplemented syscall {nr}");
            SyscallResult::Done(-ENOSYS)
        }
    };

    if let SyscallResult::Done(value) = result {
        frame.set_result(value as u64);
    }
    result
}

fn sys_write(fd: u64, buf: u64, len: u64) -> i64 {
    if fd != 1 && fd != 2 {
        return -EBADF;
    }
    let Ok(slice) = UserSlice::new(buf, len as usize) else {
        return -EFAULT;
    };

    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: range-checked above; an unmapped page takes the fault
        // path like any other user access.
        let bytes = unsafe { slice.as_slice() };
        crate::console::console_write(bytes);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = slice;

    len as i64
}

/// Moves the heap break within its window. Out-of-window requests leave
/// the break unchanged and report the current value, like Linux.
fn sys_brk(sched: &mut Scheduler, addr: u64) -> i64 {
    let task = sched.current();
    if addr != 0 && addr >= task.brk_start && addr <= task.brk_start + BRK_LIMIT {
        task.brk = addr;
    }
    task.brk as i64
}

fn sys_exit(sched: &mut Scheduler, code: u64) -> SyscallResult {
    let code = code as i32;
    let (pid, parent_pid) = {
        let current = sched.current();
        (current.pid, current.parent)
    };
    sched.current().state = TaskState::Zombie(code);

    // Wake and satisfy a parent already parked in wait4 on this child.
    let mut reaped = false;
    if let Some(parent) = sched.task_mut(parent_pid) {
        if let TaskState::Blocked(wait) = parent.state {
            let matches = match wait {
                WaitFor::AnyChild => true,
                WaitFor::Child(waited) => waited == pid,
            };
            if matches {
                parent.state = TaskState::Running;
                parent.frame.set_result(u64::from(pid));
                let status_ptr = parent.wait_status_ptr;
                parent.wait_status_ptr = 0;
                if status_ptr != 0 {
                    if let Ok(ptr) = UserPtr::<i32>::new(status_ptr) {
                        // SAFETY: validated when the waiter parked; the
                        // pointer came from its own address space.
                        unsafe { ptr.write((code & 0xff) << 8) };
                    }
                }
                reaped = true;
            }
        }
    }
    if reaped {
        sched.reap(pid);
    }

    if sched.any_runnable() {
        sched.schedule();
        SyscallResult::Parked
    } else {
        // Last runnable process gone: the run is over.
        #[cfg(target_arch = "x86_64")]
        crate::hypercalls::end_run();
        #[cfg(not(target_arch = "x86_64"))]
        panic!("last process exited");
    }
}

fn sys_wait4(
    sched: &mut Scheduler,
    frame: &mut SyscallFrame,
    pid_arg: u64,
    status_ptr: u64,
) -> SyscallResult {
    if status_ptr != 0 && UserPtr::<i32>::new(status_ptr).is_err() {
        return SyscallResult::Done(-EFAULT);
    }

    let wait = if pid_arg as i64 == -1 {
        WaitFor::AnyChild
    } else {
        WaitFor::Child(pid_arg as u32)
    };

    // TODO: reap an already-zombie child before parking. As is, waiting
    // on a child that exited earlier parks the caller with no wake
    // condition left, and the scheduler panics `deadlock` once nothing
    // else is runnable.
    let current = sched.current();
    current.frame = *frame;
    current.wait_status_ptr = status_ptr;
    current.state = TaskState::Blocked(wait);
    sched.schedule();
    SyscallResult::Parked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn frame(nr: u64, args: [u64; 3]) -> SyscallFrame {
        SyscallFrame {
            rax: nr,
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
            rip: 0x10040,
            rsp: 0x7f000,
            ..Default::default()
        }
    }

    #[test]
    fn unknown_syscall_returns_enosys() {
        let mut sched = Scheduler::new(Task::new(1, 0, 0x14000));
        let mut f = frame(999, [0; 3]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(-ENOSYS));
        assert_eq!(f.result() as i64, -ENOSYS);
    }

    #[test]
    fn write_validates_fd_and_pointer() {
        let mut sched = Scheduler::new(Task::new(1, 0, 0x14000));

        let mut f = frame(SYS_WRITE, [5, 0x20000, 4]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(-EBADF));

        // Below the user window.
        let mut f = frame(SYS_WRITE, [1, 0x100, 4]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(-EFAULT));
    }

    #[test]
    fn brk_moves_only_within_its_window() {
        let mut sched = Scheduler::new(Task::new(1, 0, 0x14000));

        let mut f = frame(SYS_BRK, [0, 0, 0]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(0x14000));

        let mut f = frame(SYS_BRK, [0x20000, 0, 0]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(0x20000));

        // Shrinking below the initial break is refused.
        let mut f = frame(SYS_BRK, [0x1000, 0, 0]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(0x20000));
    }

    #[test]
    fn wait4_parks_and_child_exit_wakes() {
        let mut sched = Scheduler::new(Task::new(1, 0, 0x14000));
        sched.spawn(Task::new(2, 1, 0x14000));

        let mut wait_frame = frame(SYS_WAIT4, [u64::MAX, 0, 0]);
        assert_eq!(
            dispatch(&mut sched, &mut wait_frame),
            SyscallResult::Parked
        );
        assert_eq!(sched.current_pid(), 2);
        assert_eq!(
            sched.task_mut(1).unwrap().state,
            TaskState::Blocked(WaitFor::AnyChild)
        );
        // The frame was preserved for resumption.
        assert_eq!(sched.task_mut(1).unwrap().frame.rax, SYS_WAIT4);

        let mut exit_frame = frame(SYS_EXIT, [5, 0, 0]);
        assert_eq!(dispatch(&mut sched, &mut exit_frame), SyscallResult::Parked);

        // The waiter is runnable again with the child pid in its result
        // register, and the zombie is gone.
        let parent = sched.task_mut(1).unwrap();
        assert_eq!(parent.state, TaskState::Running);
        assert_eq!(parent.frame.result(), 2);
        assert!(sched.task_mut(2).is_none());
        assert_eq!(sched.current_pid(), 1);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn wait4_with_no_children_deadlocks() {
        let mut sched = Scheduler::new(Task::new(1, 0, 0x14000));
        let mut f = frame(SYS_WAIT4, [u64::MAX, 0, 0]);
        dispatch(&mut sched, &mut f);
    }

    #[test]
    fn wait4_rejects_bad_status_pointer() {
        let mut sched = Scheduler::new(Task::new(1, 0, 0x14000));
        sched.spawn(Task::new(2, 1, 0x14000));

        let mut f = frame(SYS_WAIT4, [u64::MAX, 0x3, 0]);
        assert_eq!(dispatch(&mut sched, &mut f), SyscallResult::Done(-EFAULT));
        assert_eq!(sched.current().state, TaskState::Running);
    }
}
