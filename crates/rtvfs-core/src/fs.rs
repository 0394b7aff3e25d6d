// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem contract implemented by every mountable filesystem.

use std::any::Any;
use std::sync::Arc;

use crate::driver::{DeviceDriver, IoctlRequest};
use crate::error::FsResult;
use crate::types::{DirEntry, Fd, FsInfo, Metadata, Mode, OpenOptions};

/// Contract between the dispatch core and a filesystem instance.
///
/// Paths given to these operations are instance-relative: the dispatch core
/// strips the mount prefix and always forwards an absolute path rooted at
/// the instance ("/" for the mount point itself). File descriptors are
/// instance-local; the core keeps its own mapping from public descriptors
/// to (instance, descriptor) pairs.
///
/// Every operation reports status via [`FsResult`]; implementations must
/// leave no partial state behind on failure.
pub trait FileSystem: Send + Sync {
    /// Short name reported in `statfs` results and logs.
    fn fs_name(&self) -> &'static str;

    /// Called by the core at mount time, before any operation is forwarded
    /// to the instance. A failure here refuses the mount.
    fn init(&self) -> FsResult<()> {
        Ok(())
    }

    /// Called by the core at umount time, after the open-file check passed.
    fn release(&self) -> FsResult<()> {
        Ok(())
    }

    fn open(&self, path: &str, opts: &OpenOptions) -> FsResult<Fd>;
    fn close(&self, fd: Fd) -> FsResult<()>;

    /// Read into `buf` at the handle's current offset, advancing it.
    /// Returns the number of bytes read; short reads happen only at
    /// end of file.
    fn read(&self, fd: Fd, buf: &mut [u8]) -> FsResult<usize>;

    /// Write `buf` at the handle's current offset, advancing it.
    fn write(&self, fd: Fd, buf: &[u8]) -> FsResult<usize>;

    /// Reposition the handle's byte offset.
    fn seek(&self, fd: Fd, pos: u64) -> FsResult<()>;

    fn ioctl(&self, fd: Fd, request: IoctlRequest, arg: &mut dyn Any) -> FsResult<()>;
    fn flush(&self, fd: Fd) -> FsResult<()>;
    fn fstat(&self, fd: Fd) -> FsResult<Metadata>;

    fn stat(&self, path: &str) -> FsResult<Metadata>;
    fn statfs(&self) -> FsResult<FsInfo>;

    fn mkdir(&self, path: &str, mode: Mode) -> FsResult<()>;
    fn mkfifo(&self, path: &str, mode: Mode) -> FsResult<()>;

    /// Create a device node bound to an already-initialized driver instance.
    fn mknod(&self, path: &str, driver: Arc<dyn DeviceDriver>) -> FsResult<()>;

    fn opendir(&self, path: &str) -> FsResult<Fd>;

    /// Next entry of an open directory handle, `None` at the end.
    fn readdir(&self, fd: Fd) -> FsResult<Option<DirEntry>>;
    fn closedir(&self, fd: Fd) -> FsResult<()>;

    fn remove(&self, path: &str) -> FsResult<()>;

    /// Rename within one directory. Moving between directories is not part
    /// of the contract and fails `Unsupported`.
    fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()>;

    fn chmod(&self, path: &str, mode: Mode) -> FsResult<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;

    /// Number of open file and directory handles; umount is refused while
    /// this is non-zero.
    fn open_file_count(&self) -> usize;
}
