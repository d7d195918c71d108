// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! Virtualization-container backends implementing [`crate::vcpu::Vcpu`].

#[cfg(target_os = "linux")]
pub mod kvm;
