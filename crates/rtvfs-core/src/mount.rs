// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount-aware dispatch core.
//!
//! The core owns the mount table and a mapping from public file descriptors
//! to (instance, instance-local descriptor) pairs. Every path operation
//! picks the mount entry with the longest matching prefix and forwards the
//! remaining path; statuses come back verbatim. The core takes no lock
//! across instance calls, so one filesystem blocking (a pipe transfer, a
//! device transaction) never stalls traffic to the others.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::{DeviceDriver, IoctlRequest};
use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::path;
use crate::types::{DirEntry, Fd, FsInfo, Metadata, Mode, OpenOptions};

struct MountEntry {
    path: String,
    fs: Arc<dyn FileSystem>,
}

struct FileRoute {
    fs: Arc<dyn FileSystem>,
    inner: Fd,
}

struct VfsState {
    mounts: Vec<MountEntry>,
    files: HashMap<Fd, FileRoute>,
    dirs: HashMap<Fd, FileRoute>,
    next_fd: u64,
}

/// One row of the mount table, for introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPoint {
    pub path: String,
    pub fs_name: &'static str,
}

/// The virtual filesystem dispatcher.
pub struct Vfs {
    state: Mutex<VfsState>,
}

impl Vfs {
    /// Create a dispatcher with `root_fs` mounted at "/".
    pub fn new(root_fs: Arc<dyn FileSystem>) -> Self {
        tracing::info!(fs = root_fs.fs_name(), "root filesystem mounted");
        Self {
            state: Mutex::new(VfsState {
                mounts: vec![MountEntry { path: "/".to_string(), fs: root_fs }],
                files: HashMap::new(),
                dirs: HashMap::new(),
                next_fd: 3,
            }),
        }
    }

    fn normalize_mount_path(p: &str) -> FsResult<String> {
        path::validate(p)?;
        Ok(path::trim_trailing(p).to_string())
    }

    /// Pick the mount entry with the longest prefix matching `p` and return
    /// the instance together with the remaining, instance-relative path.
    fn route_path(&self, p: &str) -> FsResult<(Arc<dyn FileSystem>, String)> {
        let state = self.state.lock().unwrap();
        Self::route_path_locked(&state, p)
    }

    fn route_path_locked(state: &VfsState, p: &str) -> FsResult<(Arc<dyn FileSystem>, String)> {
        let mut best: Option<&MountEntry> = None;
        for entry in &state.mounts {
            let matches = if entry.path == "/" {
                true
            } else {
                p == entry.path || p.starts_with(&format!("{}/", entry.path))
            };
            if matches && best.map_or(true, |b| entry.path.len() > b.path.len()) {
                best = Some(entry);
            }
        }
        let entry = best.ok_or(FsError::NotFound)?;
        let rest = if entry.path == "/" {
            p.to_string()
        } else {
            let rest = &p[entry.path.len()..];
            if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            }
        };
        Ok((entry.fs.clone(), rest))
    }

    fn file_route(&self, fd: Fd) -> FsResult<(Arc<dyn FileSystem>, Fd)> {
        let state = self.state.lock().unwrap();
        let route = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        Ok((route.fs.clone(), route.inner))
    }

    fn dir_route(&self, fd: Fd) -> FsResult<(Arc<dyn FileSystem>, Fd)> {
        let state = self.state.lock().unwrap();
        let route = state.dirs.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        Ok((route.fs.clone(), route.inner))
    }

    /// Mount a filesystem instance over an existing empty directory.
    pub fn mount(&self, p: &str, fs: Arc<dyn FileSystem>) -> FsResult<()> {
        let mount_path = Self::normalize_mount_path(p)?;
        let mut state = self.state.lock().unwrap();
        if state.mounts.iter().any(|m| m.path == mount_path) {
            return Err(FsError::Busy);
        }

        // The target must already exist as an empty directory of whichever
        // instance currently covers the path.
        let (target_fs, rest) = Self::route_path_locked(&state, &mount_path)?;
        let meta = target_fs.stat(&rest)?;
        if meta.kind != crate::types::NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let dir = target_fs.opendir(&rest)?;
        let first = target_fs.readdir(dir);
        target_fs.closedir(dir)?;
        if first?.is_some() {
            return Err(FsError::NotEmpty);
        }

        fs.init()?;
        tracing::info!(path = %mount_path, fs = fs.fs_name(), "filesystem mounted");
        state.mounts.push(MountEntry { path: mount_path, fs });
        Ok(())
    }

    /// Unmount the filesystem mounted exactly at `p`. Fails `Busy` while the
    /// instance has open files or another mount is nested beneath it.
    pub fn umount(&self, p: &str) -> FsResult<()> {
        let mount_path = Self::normalize_mount_path(p)?;
        let mut state = self.state.lock().unwrap();
        let index = state
            .mounts
            .iter()
            .position(|m| m.path == mount_path)
            .ok_or(FsError::NotFound)?;
        if mount_path == "/" && state.mounts.len() > 1 {
            return Err(FsError::Busy);
        }
        let nested_prefix = format!("{}/", mount_path);
        if state.mounts.iter().any(|m| m.path.starts_with(&nested_prefix)) {
            return Err(FsError::Busy);
        }
        if state.mounts[index].fs.open_file_count() > 0 {
            return Err(FsError::Busy);
        }
        state.mounts[index].fs.release()?;
        let entry = state.mounts.remove(index);
        tracing::info!(path = %entry.path, fs = entry.fs.fs_name(), "filesystem unmounted");
        Ok(())
    }

    /// Current mount table, in mount order.
    pub fn mount_table(&self) -> Vec<MountPoint> {
        let state = self.state.lock().unwrap();
        state
            .mounts
            .iter()
            .map(|m| MountPoint { path: m.path.clone(), fs_name: m.fs.fs_name() })
            .collect()
    }

    pub fn open(&self, p: &str, opts: &OpenOptions) -> FsResult<Fd> {
        let (fs, rest) = self.route_path(p)?;
        let inner = fs.open(&rest, opts)?;
        let mut state = self.state.lock().unwrap();
        let fd = Fd(state.next_fd);
        state.next_fd += 1;
        state.files.insert(fd, FileRoute { fs, inner });
        Ok(fd)
    }

    pub fn close(&self, fd: Fd) -> FsResult<()> {
        let (fs, inner) = self.file_route(fd)?;
        fs.close(inner)?;
        let mut state = self.state.lock().unwrap();
        state.files.remove(&fd);
        Ok(())
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        let (fs, inner) = self.file_route(fd)?;
        fs.read(inner, buf)
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> FsResult<usize> {
        let (fs, inner) = self.file_route(fd)?;
        fs.write(inner, buf)
    }

    pub fn seek(&self, fd: Fd, pos: u64) -> FsResult<()> {
        let (fs, inner) = self.file_route(fd)?;
        fs.seek(inner, pos)
    }

    pub fn ioctl(&self, fd: Fd, request: IoctlRequest, arg: &mut dyn Any) -> FsResult<()> {
        let (fs, inner) = self.file_route(fd)?;
        fs.ioctl(inner, request, arg)
    }

    pub fn flush(&self, fd: Fd) -> FsResult<()> {
        let (fs, inner) = self.file_route(fd)?;
        fs.flush(inner)
    }

    pub fn fstat(&self, fd: Fd) -> FsResult<Metadata> {
        let (fs, inner) = self.file_route(fd)?;
        fs.fstat(inner)
    }

    pub fn stat(&self, p: &str) -> FsResult<Metadata> {
        let (fs, rest) = self.route_path(p)?;
        fs.stat(&rest)
    }

    /// `statfs` of the filesystem covering `p`.
    pub fn statfs(&self, p: &str) -> FsResult<FsInfo> {
        let (fs, _) = self.route_path(p)?;
        fs.statfs()
    }

    pub fn mkdir(&self, p: &str, mode: Mode) -> FsResult<()> {
        let (fs, rest) = self.route_path(p)?;
        fs.mkdir(&rest, mode)
    }

    pub fn mkfifo(&self, p: &str, mode: Mode) -> FsResult<()> {
        let (fs, rest) = self.route_path(p)?;
        fs.mkfifo(&rest, mode)
    }

    pub fn mknod(&self, p: &str, driver: Arc<dyn DeviceDriver>) -> FsResult<()> {
        let (fs, rest) = self.route_path(p)?;
        fs.mknod(&rest, driver)
    }

    pub fn opendir(&self, p: &str) -> FsResult<Fd> {
        let (fs, rest) = self.route_path(p)?;
        let inner = fs.opendir(&rest)?;
        let mut state = self.state.lock().unwrap();
        let fd = Fd(state.next_fd);
        state.next_fd += 1;
        state.dirs.insert(fd, FileRoute { fs, inner });
        Ok(fd)
    }

    pub fn readdir(&self, fd: Fd) -> FsResult<Option<DirEntry>> {
        let (fs, inner) = self.dir_route(fd)?;
        fs.readdir(inner)
    }

    pub fn closedir(&self, fd: Fd) -> FsResult<()> {
        let (fs, inner) = self.dir_route(fd)?;
        fs.closedir(inner)?;
        let mut state = self.state.lock().unwrap();
        state.dirs.remove(&fd);
        Ok(())
    }

    pub fn remove(&self, p: &str) -> FsResult<()> {
        let (fs, rest) = self.route_path(p)?;
        fs.remove(&rest)
    }

    /// Rename within one directory of one instance. Paths routed to
    /// different mounts fail `Unsupported` before reaching any filesystem.
    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (old_fs, old_rest) = self.route_path(old_path)?;
        let (new_fs, new_rest) = self.route_path(new_path)?;
        if !Arc::ptr_eq(&old_fs, &new_fs) {
            return Err(FsError::Unsupported);
        }
        old_fs.rename(&old_rest, &new_rest)
    }

    pub fn chmod(&self, p: &str, mode: Mode) -> FsResult<()> {
        let (fs, rest) = self.route_path(p)?;
        fs.chmod(&rest, mode)
    }

    pub fn chown(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        let (fs, rest) = self.route_path(p)?;
        fs.chown(&rest, uid, gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeFsConfig;
    use crate::treefs::TreeFs;
    use crate::types::{NodeType, MODE_DEFAULT_DIR};

    fn create_test_vfs() -> (Vfs, Arc<TreeFs>) {
        let root = Arc::new(TreeFs::new(TreeFsConfig::default()));
        (Vfs::new(root.clone()), root)
    }

    fn rw_create() -> OpenOptions {
        OpenOptions::read_write().create()
    }

    #[test]
    fn test_mount_prefix_equivalence() {
        let (vfs, _root) = create_test_vfs();
        vfs.mkdir("/mnt", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let inner = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/mnt", inner.clone()).expect("mount should succeed");

        let fd = vfs.open("/mnt/file", &rw_create()).expect("open via vfs should succeed");
        vfs.write(fd, b"routed").expect("write should succeed");
        vfs.close(fd).expect("close should succeed");

        // The same node is visible to the instance under the remaining path.
        assert_eq!(inner.stat("/file").expect("direct stat should succeed").size, 6);
        assert_eq!(vfs.stat("/mnt/file").expect("vfs stat should succeed").size, 6);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (vfs, _root) = create_test_vfs();
        vfs.mkdir("/a", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let mid = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/a", mid.clone()).expect("mount should succeed");
        vfs.mkdir("/a/b", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let deep = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/a/b", deep.clone()).expect("nested mount should succeed");

        let fd = vfs.open("/a/b/x", &rw_create()).expect("open should succeed");
        vfs.close(fd).expect("close should succeed");

        // The file landed on the deepest mount, not the middle one.
        deep.stat("/x").expect("file should exist on the deep mount");
        assert!(matches!(mid.stat("/x"), Err(FsError::NotFound)));
        // Path without the nested prefix still routes to the middle mount.
        let fd = vfs.open("/a/y", &rw_create()).expect("open should succeed");
        vfs.close(fd).expect("close should succeed");
        mid.stat("/y").expect("file should exist on the middle mount");
    }

    #[test]
    fn test_mount_target_validation() {
        let (vfs, _root) = create_test_vfs();
        let extra: Arc<TreeFs> = Arc::new(TreeFs::new(TreeFsConfig::default()));

        assert!(matches!(
            vfs.mount("/missing", extra.clone()),
            Err(FsError::NotFound)
        ));

        let fd = vfs.open("/file", &rw_create()).expect("create should succeed");
        vfs.close(fd).expect("close should succeed");
        assert!(matches!(vfs.mount("/file", extra.clone()), Err(FsError::NotADirectory)));

        vfs.mkdir("/full", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let fd = vfs.open("/full/occupied", &rw_create()).expect("create should succeed");
        vfs.close(fd).expect("close should succeed");
        assert!(matches!(vfs.mount("/full", extra.clone()), Err(FsError::NotEmpty)));

        vfs.mkdir("/ok", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        vfs.mount("/ok", extra.clone()).expect("mount on empty dir should succeed");
        assert!(matches!(vfs.mount("/ok", extra), Err(FsError::Busy)));
    }

    #[test]
    fn test_umount_busy_rules() {
        let (vfs, _root) = create_test_vfs();
        vfs.mkdir("/mnt", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let inner = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/mnt", inner).expect("mount should succeed");

        let fd = vfs.open("/mnt/busy", &rw_create()).expect("open should succeed");
        assert!(matches!(vfs.umount("/mnt"), Err(FsError::Busy)));
        vfs.close(fd).expect("close should succeed");

        // Root cannot go while another mount exists.
        assert!(matches!(vfs.umount("/"), Err(FsError::Busy)));
        vfs.umount("/mnt").expect("umount should succeed after close");
        assert!(matches!(vfs.umount("/mnt"), Err(FsError::NotFound)));
        assert_eq!(vfs.mount_table().len(), 1);
    }

    /// Filesystem whose `init` outcome is scripted by the test; every other
    /// operation is irrelevant to mounting and reports `Unsupported`.
    struct FlakyFs {
        healthy: bool,
    }

    impl FileSystem for FlakyFs {
        fn fs_name(&self) -> &'static str {
            "flaky"
        }

        fn init(&self) -> FsResult<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(FsError::NoDevice)
            }
        }

        fn open(&self, _path: &str, _opts: &OpenOptions) -> FsResult<Fd> {
            Err(FsError::Unsupported)
        }

        fn close(&self, _fd: Fd) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn read(&self, _fd: Fd, _buf: &mut [u8]) -> FsResult<usize> {
            Err(FsError::Unsupported)
        }

        fn write(&self, _fd: Fd, _buf: &[u8]) -> FsResult<usize> {
            Err(FsError::Unsupported)
        }

        fn seek(&self, _fd: Fd, _pos: u64) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn ioctl(&self, _fd: Fd, _request: IoctlRequest, _arg: &mut dyn Any) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn flush(&self, _fd: Fd) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn fstat(&self, _fd: Fd) -> FsResult<Metadata> {
            Err(FsError::Unsupported)
        }

        fn stat(&self, _path: &str) -> FsResult<Metadata> {
            Err(FsError::Unsupported)
        }

        fn statfs(&self) -> FsResult<FsInfo> {
            Err(FsError::Unsupported)
        }

        fn mkdir(&self, _path: &str, _mode: Mode) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn mkfifo(&self, _path: &str, _mode: Mode) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn mknod(&self, _path: &str, _driver: Arc<dyn DeviceDriver>) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn opendir(&self, _path: &str) -> FsResult<Fd> {
            Err(FsError::Unsupported)
        }

        fn readdir(&self, _fd: Fd) -> FsResult<Option<DirEntry>> {
            Err(FsError::Unsupported)
        }

        fn closedir(&self, _fd: Fd) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn remove(&self, _path: &str) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn rename(&self, _old_path: &str, _new_path: &str) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn chmod(&self, _path: &str, _mode: Mode) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> FsResult<()> {
            Err(FsError::Unsupported)
        }

        fn open_file_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_mount_runs_init_and_refuses_failure() {
        let (vfs, _root) = create_test_vfs();
        vfs.mkdir("/m", MODE_DEFAULT_DIR).expect("mkdir should succeed");

        assert!(matches!(
            vfs.mount("/m", Arc::new(FlakyFs { healthy: false })),
            Err(FsError::NoDevice)
        ));
        // The failed mount registered nothing; only the root entry remains.
        assert_eq!(vfs.mount_table().len(), 1);

        vfs.mount("/m", Arc::new(FlakyFs { healthy: true }))
            .expect("mount should succeed once init passes");
        assert_eq!(vfs.mount_table().len(), 2);
    }

    #[test]
    fn test_umount_refuses_nested_mounts() {
        let (vfs, _root) = create_test_vfs();
        vfs.mkdir("/outer", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let outer = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/outer", outer).expect("mount should succeed");
        vfs.mkdir("/outer/inner", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let inner = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/outer/inner", inner).expect("nested mount should succeed");

        assert!(matches!(vfs.umount("/outer"), Err(FsError::Busy)));
        vfs.umount("/outer/inner").expect("inner umount should succeed");
        vfs.umount("/outer").expect("outer umount should succeed afterwards");
    }

    #[test]
    fn test_statuses_forwarded_verbatim() {
        let (vfs, _root) = create_test_vfs();
        assert!(matches!(vfs.remove("/nope"), Err(FsError::NotFound)));
        vfs.mkdir("/d", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        assert!(matches!(vfs.mkdir("/d", MODE_DEFAULT_DIR), Err(FsError::AlreadyExists)));
        assert!(matches!(
            vfs.rename("/d", "/other/road"),
            Err(FsError::NotFound) | Err(FsError::Unsupported)
        ));
    }

    #[test]
    fn test_fifo_end_to_end() {
        let (vfs, _root) = create_test_vfs();
        let vfs = Arc::new(vfs);
        vfs.mkdir("/ipc", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        vfs.mkfifo("/ipc/queue", 0o644).expect("mkfifo should succeed");
        assert_eq!(
            vfs.stat("/ipc/queue").expect("stat should succeed").kind,
            NodeType::Pipe
        );

        let producer = {
            let vfs = vfs.clone();
            std::thread::spawn(move || {
                let fd = vfs
                    .open("/ipc/queue", &OpenOptions::write_only())
                    .expect("producer open should succeed");
                vfs.write(fd, b"0123456789").expect("producer write should succeed");
                vfs.close(fd).expect("producer close should succeed");
            })
        };

        let fd = vfs
            .open("/ipc/queue", &OpenOptions::read_only())
            .expect("consumer open should succeed");
        let mut buf = [0u8; 10];
        vfs.read(fd, &mut buf).expect("consumer read should succeed");
        assert_eq!(&buf, b"0123456789");
        vfs.close(fd).expect("consumer close should succeed");
        producer.join().expect("producer should finish");

        assert_eq!(vfs.stat("/ipc/queue").expect("stat should succeed").size, 0);
    }

    #[test]
    fn test_directory_listing_through_mount() {
        let (vfs, _root) = create_test_vfs();
        vfs.mkdir("/mnt", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let inner = Arc::new(TreeFs::new(TreeFsConfig::default()));
        vfs.mount("/mnt", inner).expect("mount should succeed");
        vfs.mkdir("/mnt/sub", MODE_DEFAULT_DIR).expect("mkdir should succeed");
        let fd = vfs.open("/mnt/data", &rw_create()).expect("create should succeed");
        vfs.close(fd).expect("close should succeed");

        let dir = vfs.opendir("/mnt").expect("opendir should succeed");
        let mut names = Vec::new();
        while let Some(entry) = vfs.readdir(dir).expect("readdir should succeed") {
            names.push(entry.name);
        }
        vfs.closedir(dir).expect("closedir should succeed");
        assert_eq!(names, vec!["sub", "data"]);
    }
}
