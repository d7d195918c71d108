// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Guest processes and the cooperative scheduler hooks the syscall
//! bridge needs.
//!
//! A process yields only at a syscall. Blocking handlers set the waiting
//! state before calling [`Scheduler::schedule`]; if the scheduler comes
//! back around to a still-blocked caller with nothing else runnable, the
//! kernel cannot make progress and panics `deadlock`.

use crate::syscall::SyscallFrame;

use alloc::vec::Vec;

pub type Pid = u32;

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    AnyChild,
    Child(Pid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Blocked(WaitFor),
    Zombie(i32),
}

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: Pid,
    pub parent: Pid,
    pub state: TaskState,
    /// Register frame preserved across a parked syscall; the result
    /// register is rewritten on wake.
    pub frame: SyscallFrame,
    /// Heap window of the process.
    pub brk_start: u64,
    pub brk: u64,
    /// Guest address a woken wait4 stores the child status into, zero
    /// when the caller passed none.
    pub wait_status_ptr: u64,
}

impl Task {
    pub fn new(pid: Pid, parent: Pid, brk: u64) -> Self {
        Self {
            pid,
            parent,
            state: TaskState::Running,
            frame: SyscallFrame::default(),
            brk_start: brk,
            brk,
            wait_status_ptr: 0,
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    tasks: Vec<Task>,
    current: usize,
}

impl Scheduler {
    pub fn new(init: Task) -> Self {
        let mut tasks = Vec::new();
        tasks.push(init);
        Self { tasks, current: 0 }
    }

    pub fn spawn(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn current(&mut self) -> &mut Task {
        &mut self.tasks[self.current]
    }

    pub fn current_pid(&self) -> Pid {
        self.tasks[self.current].pid
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.pid == pid)
    }

    pub fn any_runnable(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| task.state == TaskState::Running)
    }

    /// Round-robin selection of the next runnable task, starting after
    /// the current one and wrapping around to it.
    ///
    /// # Panics
    /// Panics with `deadlock` when nothing is runnable: the current task
    /// blocked itself and no wake condition can ever fire.
    pub fn schedule(&mut self) -> Pid {
        let count = self.tasks.len();
        for offset in 1..=count {
            let idx = (self.current + offset) % count;
            if self.tasks[idx].state == TaskState::Running {
                self.current = idx;
                return self.tasks[idx].pid;
            }
        }
        panic!("deadlock");
    }

    /// Removes a reaped zombie from the table.
    pub fn reap(&mut self, pid: Pid) {
        if let Some(pos) = self.tasks.iter().position(|task| task.pid == pid) {
            assert!(matches!(self.tasks[pos].state, TaskState::Zombie(_)));
            self.tasks.remove(pos);
            if self.current > pos {
                self.current -= 1;
            } else if self.current >= self.tasks.len() {
                self.current = 0;
            }
        }
    }
}
