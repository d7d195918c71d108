// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

//! File-backed inputs surfaced to the guest.
//!
//! A run is pure between inputs: the only persistent state is this table
//! of named, read-only byte buffers. The guest discovers them via the
//! GetFileLen/GetFileName hypercalls and binds a destination buffer with
//! SetFileBuf; the host stages the bytes into that buffer.

use crate::address::VirtAddr;
use crate::error::HvError;

use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct FileInput {
    name: String,
    data: Vec<u8>,
    /// Guest buffer the contents get staged into, once bound.
    guest_buf: Option<VirtAddr>,
}

impl FileInput {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            guest_buf: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, HvError> {
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, data))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn guest_buf(&self) -> Option<VirtAddr> {
        self.guest_buf
    }

    /// Binds the guest destination buffer. Rebinding is allowed; the last
    /// binding wins.
    pub fn set_guest_buf(&mut self, buf: VirtAddr) {
        self.guest_buf = Some(buf);
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileTable {
    files: Vec<FileInput>,
}

impl FileTable {
    pub fn new(files: Vec<FileInput>) -> Self {
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FileInput> {
        self.files.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FileInput> {
        self.files.get_mut(index)
    }
}
