// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! rtvfs-core: mount-aware virtual filesystem core for a small RTOS.
//!
//! The crate provides the dispatch core ([`Vfs`]), the in-memory node-tree
//! filesystem ([`TreeFs`]), the read-only process-info filesystem
//! ([`ProcFs`]), the named-pipe queue ([`Pipe`]) and the device driver
//! contract ([`DeviceDriver`], [`DeviceLock`], [`DeviceRegistry`]) that lets
//! drivers plug into the same file-style API.

pub mod config;
pub mod driver;
pub mod error;
pub mod fs;
pub mod mount;
pub mod path;
pub mod pipe;
pub mod procfs;
pub mod treefs;
pub mod types;

pub use config::TreeFsConfig;
pub use driver::{
    DeviceDriver, DeviceLock, DeviceModule, DeviceRegistry, DeviceStat, IoctlRequest,
};
pub use error::{FsError, FsResult};
pub use fs::FileSystem;
pub use mount::{MountPoint, Vfs};
pub use pipe::Pipe;
pub use procfs::{ProcFs, TaskMonitor, TaskStat};
pub use treefs::TreeFs;
pub use types::{
    DeviceId, DirEntry, Fd, FsInfo, Metadata, Mode, NodeType, OpenOptions, TaskId,
    MODE_DEFAULT_DEV, MODE_DEFAULT_DIR, MODE_DEFAULT_FILE, MODE_DEFAULT_PIPE,
};
