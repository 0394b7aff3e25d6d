// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions shared by the dispatch core, filesystems and drivers

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque file descriptor handed out by a filesystem instance (and, with a
/// separate number space, by the dispatch core).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fd(pub u64);

impl Fd {
    pub fn new(fd: u64) -> Self {
        Self(fd)
    }
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permission bits, POSIX layout (lower 9 bits).
pub type Mode = u32;

pub const MODE_DEFAULT_FILE: Mode = 0o644;
pub const MODE_DEFAULT_DIR: Mode = 0o755;
pub const MODE_DEFAULT_PIPE: Mode = 0o644;
pub const MODE_DEFAULT_DEV: Mode = 0o600;

/// Node kind as reported by `stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Directory,
    Device,
    Pipe,
}

/// Stat result for a single node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub kind: NodeType,
    pub size: u64,
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    /// Set for device nodes only.
    pub device: Option<DeviceId>,
}

/// Major/minor pair identifying a device instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub major: u8,
    pub minor: u8,
}

/// Directory entry information returned by `readdir`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeType,
    pub size: u64,
}

/// File open options.
///
/// There is deliberately no truncate flag: opening an existing file never
/// discards its content.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub append: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self { read: true, ..Default::default() }
    }

    pub fn write_only() -> Self {
        Self { write: true, ..Default::default() }
    }

    pub fn read_write() -> Self {
        Self { read: true, write: true, ..Default::default() }
    }

    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }

    pub fn append(mut self) -> Self {
        self.append = true;
        self
    }
}

/// Filesystem statistics reported by `statfs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub fs_name: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub files: u64,
}

/// Opaque identity of the calling task.
///
/// Tasks are modeled by host threads; the id is stable for the lifetime of
/// the thread and distinct between concurrently live threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn current() -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Current wall-clock time in whole seconds since the epoch.
pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
