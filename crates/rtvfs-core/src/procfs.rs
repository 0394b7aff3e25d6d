// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only synthetic filesystem exposing live task and program
//! information.
//!
//! Nothing is pre-created: every lookup, listing and read queries the task
//! registry at call time. A task exiting between a listing and a subsequent
//! read is reported as `NotFound` on the read; listings taken while tasks
//! start or exit may skip or duplicate an entry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::{DeviceDriver, IoctlRequest};
use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::path;
use crate::types::{current_timestamp, DirEntry, Fd, FsInfo, Metadata, Mode, NodeType, OpenOptions};

/// Snapshot of one task's accounting data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskStat {
    pub id: u64,
    pub name: String,
    pub priority: i32,
    pub free_stack: u32,
    pub memory_usage: u32,
    pub open_files: u32,
}

/// Live task and program registry the filesystem reads from.
#[cfg_attr(test, mockall::automock)]
pub trait TaskMonitor: Send + Sync {
    fn tasks(&self) -> Vec<TaskStat>;
    fn task_by_id(&self, id: u64) -> Option<TaskStat>;
    fn task_by_name(&self, name: &str) -> Option<TaskStat>;
    fn programs(&self) -> Vec<String>;
}

const DIR_TASKID: &str = "taskid";
const DIR_TASKNAME: &str = "taskname";
const DIR_BIN: &str = "bin";

const MODE_ATTR: Mode = 0o444;
const MODE_DIR: Mode = 0o555;
const MODE_PROGRAM: Mode = 0o555;

/// Per-task attribute files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskAttr {
    Name,
    Priority,
    FreeStack,
    UsedMem,
    OpenFiles,
}

impl TaskAttr {
    const ALL: [TaskAttr; 5] = [
        TaskAttr::Name,
        TaskAttr::Priority,
        TaskAttr::FreeStack,
        TaskAttr::UsedMem,
        TaskAttr::OpenFiles,
    ];

    fn file_name(&self) -> &'static str {
        match self {
            TaskAttr::Name => "name",
            TaskAttr::Priority => "priority",
            TaskAttr::FreeStack => "freestack",
            TaskAttr::UsedMem => "usedmem",
            TaskAttr::OpenFiles => "openfiles",
        }
    }

    fn parse(name: &str) -> Option<TaskAttr> {
        Self::ALL.iter().copied().find(|a| a.file_name() == name)
    }

    fn render(&self, stat: &TaskStat) -> String {
        match self {
            TaskAttr::Name => format!("{}\n", stat.name),
            TaskAttr::Priority => format!("{}\n", stat.priority),
            TaskAttr::FreeStack => format!("{}\n", stat.free_stack),
            TaskAttr::UsedMem => format!("{}\n", stat.memory_usage),
            TaskAttr::OpenFiles => format!("{}\n", stat.open_files),
        }
    }
}

/// How a task directory was addressed.
#[derive(Clone, Debug)]
enum TaskLookup {
    ById(u64),
    ByName(String),
}

/// Structural position of a path in the synthetic tree, before any
/// liveness check against the registry.
enum Entry {
    Root,
    TaskIdDir,
    TaskNameDir,
    BinDir,
    TaskDir(TaskLookup),
    AttrFile(TaskLookup, TaskAttr),
    ProgramFile(String),
}

struct ProcHandle {
    lookup: Option<(TaskLookup, TaskAttr)>,
    pos: u64,
}

struct ProcDirHandle {
    entries: Vec<DirEntry>,
    position: usize,
}

struct ProcState {
    files: HashMap<Fd, ProcHandle>,
    dirs: HashMap<Fd, ProcDirHandle>,
    next_fd: u64,
}

/// The process-info filesystem instance.
pub struct ProcFs {
    monitor: Arc<dyn TaskMonitor>,
    state: Mutex<ProcState>,
    mounted_at: i64,
}

impl ProcFs {
    pub fn new(monitor: Arc<dyn TaskMonitor>) -> Self {
        Self {
            monitor,
            state: Mutex::new(ProcState {
                files: HashMap::new(),
                dirs: HashMap::new(),
                next_fd: 3,
            }),
            mounted_at: current_timestamp(),
        }
    }

    fn classify(&self, p: &str) -> FsResult<Entry> {
        let segments: Vec<&str> = path::segments(path::trim_trailing(p)).collect();
        match segments.as_slice() {
            [] => Ok(Entry::Root),
            [DIR_TASKID] => Ok(Entry::TaskIdDir),
            [DIR_TASKNAME] => Ok(Entry::TaskNameDir),
            [DIR_BIN] => Ok(Entry::BinDir),
            [DIR_TASKID, id] => Ok(Entry::TaskDir(TaskLookup::ById(parse_task_id(id)?))),
            [DIR_TASKNAME, name] => Ok(Entry::TaskDir(TaskLookup::ByName(name.to_string()))),
            [DIR_BIN, program] => Ok(Entry::ProgramFile(program.to_string())),
            [DIR_TASKID, id, attr] => Ok(Entry::AttrFile(
                TaskLookup::ById(parse_task_id(id)?),
                TaskAttr::parse(attr).ok_or(FsError::NotFound)?,
            )),
            [DIR_TASKNAME, name, attr] => Ok(Entry::AttrFile(
                TaskLookup::ByName(name.to_string()),
                TaskAttr::parse(attr).ok_or(FsError::NotFound)?,
            )),
            _ => Err(FsError::NotFound),
        }
    }

    fn lookup_task(&self, lookup: &TaskLookup) -> FsResult<TaskStat> {
        match lookup {
            TaskLookup::ById(id) => self.monitor.task_by_id(*id),
            TaskLookup::ByName(name) => self.monitor.task_by_name(name),
        }
        .ok_or(FsError::NotFound)
    }

    /// Render the current content of an attribute file.
    fn render_attr(&self, lookup: &TaskLookup, attr: TaskAttr) -> FsResult<String> {
        Ok(attr.render(&self.lookup_task(lookup)?))
    }

    fn dir_entry(&self, name: &str, kind: NodeType, size: u64) -> DirEntry {
        DirEntry { name: name.to_string(), kind, size }
    }

    fn list_entries(&self, entry: &Entry) -> FsResult<Vec<DirEntry>> {
        match entry {
            Entry::Root => Ok(vec![
                self.dir_entry(DIR_TASKID, NodeType::Directory, 0),
                self.dir_entry(DIR_TASKNAME, NodeType::Directory, 0),
                self.dir_entry(DIR_BIN, NodeType::Directory, 0),
            ]),
            Entry::TaskIdDir => Ok(self
                .monitor
                .tasks()
                .iter()
                .map(|t| self.dir_entry(&format!("{:x}", t.id), NodeType::Directory, 0))
                .collect()),
            Entry::TaskNameDir => Ok(self
                .monitor
                .tasks()
                .iter()
                .map(|t| self.dir_entry(&t.name, NodeType::Directory, 0))
                .collect()),
            Entry::BinDir => Ok(self
                .monitor
                .programs()
                .iter()
                .map(|name| self.dir_entry(name, NodeType::File, 0))
                .collect()),
            Entry::TaskDir(lookup) => {
                let stat = self.lookup_task(lookup)?;
                Ok(TaskAttr::ALL
                    .iter()
                    .map(|attr| {
                        self.dir_entry(
                            attr.file_name(),
                            NodeType::File,
                            attr.render(&stat).len() as u64,
                        )
                    })
                    .collect())
            }
            Entry::AttrFile(..) | Entry::ProgramFile(_) => Err(FsError::NotADirectory),
        }
    }

    fn metadata(&self, entry: &Entry) -> FsResult<Metadata> {
        let (kind, size, mode) = match entry {
            Entry::Root | Entry::TaskIdDir | Entry::TaskNameDir | Entry::BinDir => {
                (NodeType::Directory, 0, MODE_DIR)
            }
            Entry::TaskDir(lookup) => {
                self.lookup_task(lookup)?;
                (NodeType::Directory, TaskAttr::ALL.len() as u64, MODE_DIR)
            }
            Entry::AttrFile(lookup, attr) => {
                let size = self.render_attr(lookup, *attr)?.len() as u64;
                (NodeType::File, size, MODE_ATTR)
            }
            Entry::ProgramFile(name) => {
                if !self.monitor.programs().iter().any(|p| p == name) {
                    return Err(FsError::NotFound);
                }
                (NodeType::File, 0, MODE_PROGRAM)
            }
        };
        Ok(Metadata {
            kind,
            size,
            mode,
            uid: 0,
            gid: 0,
            mtime: self.mounted_at,
            device: None,
        })
    }
}

impl FileSystem for ProcFs {
    fn fs_name(&self) -> &'static str {
        "procfs"
    }

    fn release(&self) -> FsResult<()> {
        if self.open_file_count() > 0 {
            return Err(FsError::Busy);
        }
        Ok(())
    }

    fn open(&self, p: &str, opts: &OpenOptions) -> FsResult<Fd> {
        path::validate(p)?;
        if opts.write || opts.append || opts.create {
            return Err(FsError::ReadOnly);
        }
        let lookup = match self.classify(p)? {
            Entry::AttrFile(lookup, attr) => {
                // Verify liveness at open; content is re-queried per read.
                self.lookup_task(&lookup)?;
                Some((lookup, attr))
            }
            Entry::ProgramFile(name) => {
                if !self.monitor.programs().iter().any(|prog| *prog == name) {
                    return Err(FsError::NotFound);
                }
                None
            }
            _ => return Err(FsError::IsADirectory),
        };
        let mut state = self.state.lock().unwrap();
        let fd = Fd(state.next_fd);
        state.next_fd += 1;
        state.files.insert(fd, ProcHandle { lookup, pos: 0 });
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.files.remove(&fd).map(|_| ()).ok_or(FsError::BadFileDescriptor)
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        let (lookup, pos) = {
            let state = self.state.lock().unwrap();
            let handle = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
            (handle.lookup.clone(), handle.pos)
        };
        // Program files have no content.
        let Some((lookup, attr)) = lookup else { return Ok(0) };

        let content = self.render_attr(&lookup, attr)?;
        let bytes = content.as_bytes();
        let start = (pos as usize).min(bytes.len());
        let n = (bytes.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&bytes[start..start + n]);

        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.files.get_mut(&fd) {
            handle.pos += n as u64;
        }
        Ok(n)
    }

    fn write(&self, _fd: Fd, _buf: &[u8]) -> FsResult<usize> {
        Err(FsError::ReadOnly)
    }

    fn seek(&self, fd: Fd, pos: u64) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.files.get_mut(&fd).ok_or(FsError::BadFileDescriptor)?;
        handle.pos = pos;
        Ok(())
    }

    fn ioctl(&self, fd: Fd, _request: IoctlRequest, _arg: &mut dyn Any) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        if !state.files.contains_key(&fd) {
            return Err(FsError::BadFileDescriptor);
        }
        Err(FsError::Unsupported)
    }

    fn flush(&self, fd: Fd) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        if !state.files.contains_key(&fd) {
            return Err(FsError::BadFileDescriptor);
        }
        Ok(())
    }

    fn fstat(&self, fd: Fd) -> FsResult<Metadata> {
        let lookup = {
            let state = self.state.lock().unwrap();
            let handle = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
            handle.lookup.clone()
        };
        let (size, mode) = match lookup {
            Some((lookup, attr)) => (self.render_attr(&lookup, attr)?.len() as u64, MODE_ATTR),
            None => (0, MODE_PROGRAM),
        };
        Ok(Metadata {
            kind: NodeType::File,
            size,
            mode,
            uid: 0,
            gid: 0,
            mtime: self.mounted_at,
            device: None,
        })
    }

    fn stat(&self, p: &str) -> FsResult<Metadata> {
        path::validate(p)?;
        let entry = self.classify(p)?;
        if path::wants_directory(p) {
            if let Entry::AttrFile(..) | Entry::ProgramFile(_) = entry {
                return Err(FsError::NotADirectory);
            }
        }
        self.metadata(&entry)
    }

    fn statfs(&self) -> FsResult<FsInfo> {
        let files = self.monitor.tasks().len() * TaskAttr::ALL.len()
            + self.monitor.programs().len();
        Ok(FsInfo {
            fs_name: "procfs".to_string(),
            total_bytes: 0,
            used_bytes: 0,
            files: files as u64,
        })
    }

    fn mkdir(&self, _path: &str, _mode: Mode) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn mkfifo(&self, _path: &str, _mode: Mode) -> FsResult<()> {
        Err(FsError::NotPermitted)
    }

    fn mknod(&self, _path: &str, _driver: Arc<dyn DeviceDriver>) -> FsResult<()> {
        Err(FsError::NotPermitted)
    }

    fn opendir(&self, p: &str) -> FsResult<Fd> {
        path::validate(p)?;
        let entry = self.classify(p)?;
        let entries = self.list_entries(&entry)?;
        let mut state = self.state.lock().unwrap();
        let fd = Fd(state.next_fd);
        state.next_fd += 1;
        state.dirs.insert(fd, ProcDirHandle { entries, position: 0 });
        Ok(fd)
    }

    fn readdir(&self, fd: Fd) -> FsResult<Option<DirEntry>> {
        let mut state = self.state.lock().unwrap();
        let handle = state.dirs.get_mut(&fd).ok_or(FsError::BadFileDescriptor)?;
        let entry = handle.entries.get(handle.position).cloned();
        if entry.is_some() {
            handle.position += 1;
        }
        Ok(entry)
    }

    fn closedir(&self, fd: Fd) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.dirs.remove(&fd).map(|_| ()).ok_or(FsError::BadFileDescriptor)
    }

    fn remove(&self, _path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn rename(&self, _old_path: &str, _new_path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn chmod(&self, _path: &str, _mode: Mode) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn open_file_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.files.len() + state.dirs.len()
    }
}

fn parse_task_id(hex: &str) -> FsResult<u64> {
    u64::from_str_radix(hex, 16).map_err(|_| FsError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> TaskStat {
        TaskStat {
            id: 0x2000_1000,
            name: "logger".to_string(),
            priority: 2,
            free_stack: 480,
            memory_usage: 2048,
            open_files: 3,
        }
    }

    fn monitor_with_task() -> MockTaskMonitor {
        let mut monitor = MockTaskMonitor::new();
        monitor.expect_task_by_id().returning(|id| {
            if id == 0x2000_1000 {
                Some(sample_task())
            } else {
                None
            }
        });
        monitor.expect_task_by_name().returning(|name| {
            if name == "logger" {
                Some(sample_task())
            } else {
                None
            }
        });
        monitor.expect_tasks().returning(|| vec![sample_task()]);
        monitor.expect_programs().returning(|| vec!["shell".to_string(), "cat".to_string()]);
        monitor
    }

    fn read_all(fs: &ProcFs, path: &str) -> String {
        let fd = fs.open(path, &OpenOptions::read_only()).expect("open should succeed");
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = fs.read(fd, &mut buf).expect("read should succeed");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        fs.close(fd).expect("close should succeed");
        String::from_utf8(out).expect("attribute content should be UTF-8")
    }

    #[test]
    fn test_attribute_reads() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));
        assert_eq!(read_all(&fs, "/taskid/20001000/name"), "logger\n");
        assert_eq!(read_all(&fs, "/taskid/20001000/priority"), "2\n");
        assert_eq!(read_all(&fs, "/taskname/logger/freestack"), "480\n");
        assert_eq!(read_all(&fs, "/taskname/logger/usedmem"), "2048\n");
        assert_eq!(read_all(&fs, "/taskname/logger/openfiles"), "3\n");
    }

    #[test]
    fn test_unknown_task_and_attribute() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));
        assert!(matches!(
            fs.open("/taskid/dead/name", &OpenOptions::read_only()),
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            fs.open("/taskid/20001000/bogus", &OpenOptions::read_only()),
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            fs.open("/taskname/ghost/name", &OpenOptions::read_only()),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_root_and_task_listings() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));

        let fd = fs.opendir("/").expect("opendir should succeed");
        let mut names = Vec::new();
        while let Some(e) = fs.readdir(fd).expect("readdir should succeed") {
            names.push(e.name);
        }
        fs.closedir(fd).expect("closedir should succeed");
        assert_eq!(names, vec!["taskid", "taskname", "bin"]);

        let fd = fs.opendir("/taskid").expect("opendir should succeed");
        let entry = fs.readdir(fd).expect("readdir should succeed").expect("entry expected");
        assert_eq!(entry.name, "20001000");
        assert_eq!(entry.kind, NodeType::Directory);
        fs.closedir(fd).expect("closedir should succeed");

        let fd = fs.opendir("/taskname/logger").expect("opendir should succeed");
        let mut attrs = Vec::new();
        while let Some(e) = fs.readdir(fd).expect("readdir should succeed") {
            attrs.push(e.name);
        }
        fs.closedir(fd).expect("closedir should succeed");
        assert_eq!(attrs, vec!["name", "priority", "freestack", "usedmem", "openfiles"]);
    }

    #[test]
    fn test_bin_lists_programs() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));
        let fd = fs.opendir("/bin").expect("opendir should succeed");
        let mut names = Vec::new();
        while let Some(e) = fs.readdir(fd).expect("readdir should succeed") {
            names.push(e.name);
        }
        fs.closedir(fd).expect("closedir should succeed");
        assert_eq!(names, vec!["shell", "cat"]);

        assert_eq!(read_all(&fs, "/bin/shell"), "");
        assert!(matches!(
            fs.open("/bin/vi", &OpenOptions::read_only()),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_partial_read_honors_offset() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));
        let fd = fs
            .open("/taskid/20001000/name", &OpenOptions::read_only())
            .expect("open should succeed");
        let mut buf = [0u8; 3];
        assert_eq!(fs.read(fd, &mut buf).expect("read should succeed"), 3);
        assert_eq!(&buf, b"log");
        assert_eq!(fs.read(fd, &mut buf).expect("read should succeed"), 3);
        assert_eq!(&buf, b"ger");
        assert_eq!(fs.read(fd, &mut buf).expect("read should succeed"), 1);
        assert_eq!(buf[0], b'\n');
        fs.close(fd).expect("close should succeed");
    }

    #[test]
    fn test_every_mutation_is_rejected() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));

        assert!(matches!(
            fs.open("/taskid/20001000/name", &OpenOptions::write_only()),
            Err(FsError::ReadOnly)
        ));
        assert!(matches!(fs.mkdir("/newdir", 0o755), Err(FsError::ReadOnly)));
        assert!(matches!(fs.mkfifo("/fifo", 0o644), Err(FsError::NotPermitted)));
        assert!(matches!(fs.remove("/taskid"), Err(FsError::ReadOnly)));
        assert!(matches!(fs.rename("/taskid", "/other"), Err(FsError::ReadOnly)));
        assert!(matches!(fs.chmod("/taskid", 0o777), Err(FsError::ReadOnly)));
        assert!(matches!(fs.chown("/taskid", 1, 1), Err(FsError::ReadOnly)));

        let fd = fs
            .open("/taskid/20001000/name", &OpenOptions::read_only())
            .expect("open should succeed");
        assert!(matches!(fs.write(fd, b"x"), Err(FsError::ReadOnly)));
        fs.close(fd).expect("close should succeed");
    }

    #[test]
    fn test_stat_shapes() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));
        let meta = fs.stat("/").expect("stat should succeed");
        assert_eq!(meta.kind, NodeType::Directory);

        let meta = fs.stat("/taskid/20001000/name").expect("stat should succeed");
        assert_eq!(meta.kind, NodeType::File);
        assert_eq!(meta.size, "logger\n".len() as u64);
        assert_eq!(meta.mode, 0o444);

        assert!(matches!(fs.stat("/taskid/20001000/name/"), Err(FsError::NotADirectory)));

        let info = fs.statfs().expect("statfs should succeed");
        assert_eq!(info.fs_name, "procfs");
        assert_eq!(info.files, 5 + 2);
    }

    #[test]
    fn test_release_busy_while_open() {
        let fs = ProcFs::new(Arc::new(monitor_with_task()));
        let fd = fs
            .open("/taskid/20001000/name", &OpenOptions::read_only())
            .expect("open should succeed");
        assert!(matches!(fs.release(), Err(FsError::Busy)));
        fs.close(fd).expect("close should succeed");
        fs.release().expect("release should succeed with no open files");
    }
}
