// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Guest-side runtime of the hypercall/syscall bridge.
//!
//! This crate holds everything the in-guest kernel needs to talk to the
//! host: the bare-register hypercall stubs, the line-buffered print path,
//! checked views of flat user pointers, and the syscall dispatcher with
//! its cooperative scheduling hooks.

#![no_std]

extern crate alloc;

pub mod console;
#[cfg(target_arch = "x86_64")]
pub mod hypercalls;
pub mod locking;
pub mod syscall;
pub mod task;
pub mod usermem;
