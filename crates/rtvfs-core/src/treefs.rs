// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory node-tree filesystem.
//!
//! Nodes live in an arena keyed by `NodeId`; each directory holds an ordered
//! list of child slots whose ids come from a monotonically increasing
//! per-instance counter and are never reused. Name lookup is a linear scan
//! in insertion order.
//!
//! All structural state is guarded by one resource mutex per instance.
//! Blocking pipe transfers and device transactions run outside it: the
//! relevant `Arc` is cloned under the lock and the call happens after the
//! guard is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::TreeFsConfig;
use crate::driver::{DeviceDriver, IoctlRequest};
use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::path;
use crate::pipe::Pipe;
use crate::types::{
    current_timestamp, DirEntry, Fd, FsInfo, Metadata, Mode, NodeType, OpenOptions,
    MODE_DEFAULT_DEV, MODE_DEFAULT_DIR, MODE_DEFAULT_FILE,
};

/// Internal node ID, allocated monotonically and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeId(u64);

/// Kind-specific node payload.
enum NodePayload {
    Directory { children: Vec<ChildSlot> },
    File { data: Vec<u8> },
    Device { driver: Arc<dyn DeviceDriver> },
    Pipe { pipe: Arc<Pipe> },
}

/// One entry of a directory's ordered child list.
struct ChildSlot {
    /// Monotonic slot id; stable for the lifetime of the entry.
    #[allow(dead_code)]
    slot: u64,
    name: String,
    node: NodeId,
}

struct Node {
    payload: NodePayload,
    mode: Mode,
    uid: u32,
    gid: u32,
    mtime: i64,
}

impl Node {
    fn node_type(&self) -> NodeType {
        match self.payload {
            NodePayload::Directory { .. } => NodeType::Directory,
            NodePayload::File { .. } => NodeType::File,
            NodePayload::Device { .. } => NodeType::Device,
            NodePayload::Pipe { .. } => NodeType::Pipe,
        }
    }
}

/// Open file handle state, owned by the instance.
struct OpenFile {
    node: NodeId,
    parent: NodeId,
    read: bool,
    write: bool,
    pos: u64,
    /// Deferred deletion: set by `remove` while the node is open; the last
    /// close of the node unlinks and frees it.
    remove_at_close: bool,
}

struct DirHandle {
    entries: Vec<DirEntry>,
    position: usize,
}

/// Where an I/O call goes after the handle and node were inspected under
/// the resource mutex. Pipe and device transfers may block, so they run
/// with the mutex released.
enum IoTarget {
    File,
    Pipe(Arc<Pipe>),
    Device(Arc<dyn DeviceDriver>),
}

struct TreeState {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_node: u64,
    next_slot: u64,
    files: HashMap<Fd, OpenFile>,
    dirs: HashMap<Fd, DirHandle>,
    next_fd: u64,
}

impl TreeState {
    /// Walk a path (already stripped of any trailing slash) from the root.
    fn resolve(&self, path: &str) -> FsResult<NodeId> {
        let mut current = self.root;
        for segment in path::segments(path) {
            let node = self.nodes.get(&current).ok_or(FsError::NotFound)?;
            match &node.payload {
                NodePayload::Directory { children } => {
                    current = children
                        .iter()
                        .find(|c| c.name == segment)
                        .map(|c| c.node)
                        .ok_or(FsError::NotFound)?;
                }
                _ => return Err(FsError::NotADirectory),
            }
        }
        Ok(current)
    }

    fn node(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    fn alloc_node(&mut self, payload: NodePayload, mode: Mode) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node { payload, mode: mode & 0o777, uid: 0, gid: 0, mtime: current_timestamp() },
        );
        id
    }

    fn alloc_fd(&mut self) -> Fd {
        let fd = Fd(self.next_fd);
        self.next_fd += 1;
        fd
    }

    /// Append a child slot with a fresh slot id.
    fn attach_child(&mut self, parent: NodeId, name: &str, node: NodeId) -> FsResult<()> {
        let slot = self.next_slot;
        self.next_slot += 1;
        let parent_node = self.node_mut(parent)?;
        match &mut parent_node.payload {
            NodePayload::Directory { children } => {
                children.push(ChildSlot { slot, name: name.to_string(), node });
                parent_node.mtime = current_timestamp();
                Ok(())
            }
            _ => Err(FsError::NotADirectory),
        }
    }

    /// Look up a child by name in a directory's slot list.
    fn find_child(&self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        let parent_node = self.node(parent)?;
        match &parent_node.payload {
            NodePayload::Directory { children } => children
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.node)
                .ok_or(FsError::NotFound),
            _ => Err(FsError::NotADirectory),
        }
    }

    /// Detach a node from its parent's slot list and free it from the arena.
    fn unlink(&mut self, parent: NodeId, node: NodeId) -> FsResult<()> {
        let parent_node = self.node_mut(parent)?;
        match &mut parent_node.payload {
            NodePayload::Directory { children } => {
                let index =
                    children.iter().position(|c| c.node == node).ok_or(FsError::NotFound)?;
                children.remove(index);
                parent_node.mtime = current_timestamp();
            }
            _ => return Err(FsError::NotADirectory),
        }
        self.nodes.remove(&node);
        Ok(())
    }

    fn open_handles_for(&self, node: NodeId) -> usize {
        self.files.values().filter(|h| h.node == node).count()
    }

    /// Size as tracked by the tree itself. Device sizes are queried live
    /// from the driver by the callers that need them.
    fn quick_size(&self, node: &Node) -> u64 {
        match &node.payload {
            NodePayload::Directory { children } => children.len() as u64,
            NodePayload::File { data } => data.len() as u64,
            NodePayload::Device { .. } => 0,
            NodePayload::Pipe { pipe } => pipe.len() as u64,
        }
    }

    fn metadata_for(&self, node: &Node) -> Metadata {
        Metadata {
            kind: node.node_type(),
            size: self.quick_size(node),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            mtime: node.mtime,
            device: None,
        }
    }

    /// Classify the node behind an open handle for a read or write call,
    /// returning the pieces needed once the mutex is released.
    fn io_target(&self, fd: Fd, write: bool) -> FsResult<(NodeId, u64, IoTarget)> {
        let handle = self.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        let allowed = if write { handle.write } else { handle.read };
        if !allowed {
            return Err(FsError::AccessDenied);
        }
        let target = match &self.node(handle.node)?.payload {
            NodePayload::Directory { .. } => return Err(FsError::IsADirectory),
            NodePayload::File { .. } => IoTarget::File,
            NodePayload::Pipe { pipe } => IoTarget::Pipe(pipe.clone()),
            NodePayload::Device { driver } => IoTarget::Device(driver.clone()),
        };
        Ok((handle.node, handle.pos, target))
    }
}

/// The in-memory node-tree filesystem instance.
pub struct TreeFs {
    config: TreeFsConfig,
    state: Mutex<TreeState>,
}

impl TreeFs {
    pub fn new(config: TreeFsConfig) -> Self {
        let mut nodes = HashMap::new();
        let root = NodeId(0);
        nodes.insert(
            root,
            Node {
                payload: NodePayload::Directory { children: Vec::new() },
                mode: MODE_DEFAULT_DIR,
                uid: 0,
                gid: 0,
                mtime: current_timestamp(),
            },
        );
        Self {
            config,
            state: Mutex::new(TreeState {
                nodes,
                root,
                next_node: 1,
                next_slot: 0,
                files: HashMap::new(),
                dirs: HashMap::new(),
                next_fd: 3,
            }),
        }
    }

    /// Shared creation path for mkdir/mkfifo/mknod: validates the parent,
    /// rejects name collisions and attaches a fresh node at a single
    /// success point.
    fn create_entry(&self, p: &str, payload: NodePayload, mode: Mode) -> FsResult<()> {
        path::validate(p)?;
        let (parent_path, name) = path::split_parent(p)?;
        let mut state = self.state.lock().unwrap();
        let parent = state.resolve(&parent_path)?;
        match state.find_child(parent, name) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let node = state.alloc_node(payload, mode);
        state.attach_child(parent, name, node)
    }

    /// Total number of nodes in the arena, including the root.
    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }
}

impl FileSystem for TreeFs {
    fn fs_name(&self) -> &'static str {
        "treefs"
    }

    fn open(&self, p: &str, opts: &OpenOptions) -> FsResult<Fd> {
        path::validate(p)?;
        if !opts.read && !opts.write {
            return Err(FsError::InvalidArgument);
        }
        if path::trim_trailing(p) == "/" {
            return Err(FsError::IsADirectory);
        }
        let wants_dir = path::wants_directory(p);
        let (parent_path, name) = path::split_parent(p)?;

        let mut state = self.state.lock().unwrap();
        if state.files.len() + state.dirs.len() >= self.config.max_open_handles {
            return Err(FsError::TooManyOpenFiles);
        }
        let parent = state.resolve(&parent_path)?;
        let node_id = match state.find_child(parent, name) {
            Ok(id) => id,
            Err(FsError::NotFound) if opts.create && !wants_dir => {
                let node =
                    state.alloc_node(NodePayload::File { data: Vec::new() }, MODE_DEFAULT_FILE);
                state.attach_child(parent, name, node)?;
                node
            }
            Err(e) => return Err(e),
        };

        let node = state.node(node_id)?;
        let pos = match &node.payload {
            NodePayload::Directory { .. } => return Err(FsError::IsADirectory),
            _ if wants_dir => return Err(FsError::NotADirectory),
            NodePayload::File { data } => {
                if opts.append {
                    data.len() as u64
                } else {
                    0
                }
            }
            NodePayload::Pipe { .. } => 0,
            NodePayload::Device { driver } => {
                // The driver takes its device lock here; Busy propagates and
                // no handle is registered.
                driver.open(opts)?;
                0
            }
        };

        let fd = state.alloc_fd();
        state.files.insert(
            fd,
            OpenFile {
                node: node_id,
                parent,
                read: opts.read,
                write: opts.write,
                pos,
                remove_at_close: false,
            },
        );
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        let node_id = handle.node;
        let parent = handle.parent;

        if let NodePayload::Device { driver } = &state.node(node_id)?.payload {
            // A close refused by the driver leaves the handle open.
            driver.close(false)?;
        }

        let handle = state.files.remove(&fd).ok_or(FsError::BadFileDescriptor)?;
        if handle.remove_at_close && state.open_handles_for(node_id) == 0 {
            tracing::debug!(node = node_id.0, "deferred removal at last close");
            state.unlink(parent, node_id)?;
        }
        Ok(())
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        let (node_id, pos, target) = state.io_target(fd, false)?;
        match target {
            IoTarget::File => {
                let node = state.node(node_id)?;
                let n = match &node.payload {
                    NodePayload::File { data } => {
                        // An offset past the end reads zero bytes; clamping on
                        // the wide type keeps the cast lossless.
                        let start = pos.min(data.len() as u64) as usize;
                        let n = (data.len() - start).min(buf.len());
                        buf[..n].copy_from_slice(&data[start..start + n]);
                        n
                    }
                    _ => return Err(FsError::BadFileDescriptor),
                };
                let handle = state.files.get_mut(&fd).ok_or(FsError::BadFileDescriptor)?;
                handle.pos += n as u64;
                Ok(n)
            }
            IoTarget::Pipe(pipe) => {
                drop(state);
                pipe.read(buf)
            }
            IoTarget::Device(driver) => {
                drop(state);
                let n = driver.read(buf, pos)?;
                let mut state = self.state.lock().unwrap();
                if let Some(handle) = state.files.get_mut(&fd) {
                    handle.pos += n as u64;
                }
                Ok(n)
            }
        }
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> FsResult<usize> {
        let mut state = self.state.lock().unwrap();
        let (node_id, pos, target) = state.io_target(fd, true)?;
        match target {
            IoTarget::File => {
                let node = state.node_mut(node_id)?;
                match &mut node.payload {
                    NodePayload::File { data } => {
                        // The offset is caller-controlled via seek; a buffer
                        // that cannot exist in memory is an out-of-space
                        // condition, not a panic.
                        let start = usize::try_from(pos).map_err(|_| FsError::NoSpace)?;
                        let end = start.checked_add(buf.len()).ok_or(FsError::NoSpace)?;
                        if end > data.len() {
                            data.try_reserve(end - data.len()).map_err(|_| FsError::NoSpace)?;
                            data.resize(end, 0);
                        }
                        data[start..end].copy_from_slice(buf);
                    }
                    _ => return Err(FsError::BadFileDescriptor),
                }
                node.mtime = current_timestamp();
                let handle = state.files.get_mut(&fd).ok_or(FsError::BadFileDescriptor)?;
                handle.pos += buf.len() as u64;
                Ok(buf.len())
            }
            IoTarget::Pipe(pipe) => {
                drop(state);
                pipe.write(buf)
            }
            IoTarget::Device(driver) => {
                drop(state);
                let n = driver.write(buf, pos)?;
                let mut state = self.state.lock().unwrap();
                if let Some(handle) = state.files.get_mut(&fd) {
                    handle.pos += n as u64;
                }
                Ok(n)
            }
        }
    }

    fn seek(&self, fd: Fd, pos: u64) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let handle = state.files.get_mut(&fd).ok_or(FsError::BadFileDescriptor)?;
        handle.pos = pos;
        Ok(())
    }

    fn ioctl(&self, fd: Fd, request: IoctlRequest, arg: &mut dyn Any) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        let handle = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        let driver = match &state.node(handle.node)?.payload {
            NodePayload::Device { driver } => driver.clone(),
            _ => return Err(FsError::Unsupported),
        };
        drop(state);
        driver.ioctl(request, arg)
    }

    fn flush(&self, fd: Fd) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        let handle = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        let driver = match &state.node(handle.node)?.payload {
            NodePayload::Device { driver } => Some(driver.clone()),
            _ => None,
        };
        drop(state);
        match driver {
            Some(driver) => driver.flush(),
            None => Ok(()),
        }
    }

    fn fstat(&self, fd: Fd) -> FsResult<Metadata> {
        let state = self.state.lock().unwrap();
        let handle = state.files.get(&fd).ok_or(FsError::BadFileDescriptor)?;
        let node = state.node(handle.node)?;
        let mut meta = state.metadata_for(node);
        let driver = match &node.payload {
            NodePayload::Device { driver } => Some(driver.clone()),
            _ => None,
        };
        drop(state);
        if let Some(driver) = driver {
            let dev = driver.stat()?;
            meta.size = dev.size;
            meta.device = Some(dev.device);
        }
        Ok(meta)
    }

    fn stat(&self, p: &str) -> FsResult<Metadata> {
        path::validate(p)?;
        let state = self.state.lock().unwrap();
        let node_id = state.resolve(path::trim_trailing(p))?;
        let node = state.node(node_id)?;
        if path::wants_directory(p) && node.node_type() != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut meta = state.metadata_for(node);
        let driver = match &node.payload {
            NodePayload::Device { driver } => Some(driver.clone()),
            _ => None,
        };
        drop(state);
        if let Some(driver) = driver {
            let dev = driver.stat()?;
            meta.size = dev.size;
            meta.device = Some(dev.device);
        }
        Ok(meta)
    }

    fn statfs(&self) -> FsResult<FsInfo> {
        let state = self.state.lock().unwrap();
        let used: u64 = state.nodes.values().map(|n| state.quick_size(n)).sum();
        Ok(FsInfo {
            fs_name: "treefs".to_string(),
            total_bytes: used,
            used_bytes: used,
            files: state.nodes.len() as u64,
        })
    }

    fn mkdir(&self, p: &str, mode: Mode) -> FsResult<()> {
        self.create_entry(p, NodePayload::Directory { children: Vec::new() }, mode)
    }

    fn mkfifo(&self, p: &str, mode: Mode) -> FsResult<()> {
        let pipe = Arc::new(Pipe::new(self.config.pipe_capacity));
        self.create_entry(p, NodePayload::Pipe { pipe }, mode)
    }

    fn mknod(&self, p: &str, driver: Arc<dyn DeviceDriver>) -> FsResult<()> {
        self.create_entry(p, NodePayload::Device { driver }, MODE_DEFAULT_DEV)
    }

    fn opendir(&self, p: &str) -> FsResult<Fd> {
        path::validate(p)?;
        let mut state = self.state.lock().unwrap();
        if state.files.len() + state.dirs.len() >= self.config.max_open_handles {
            return Err(FsError::TooManyOpenFiles);
        }
        let node_id = state.resolve(path::trim_trailing(p))?;
        let node = state.node(node_id)?;
        let entries = match &node.payload {
            NodePayload::Directory { children } => children
                .iter()
                .map(|child| {
                    let child_node = state.node(child.node)?;
                    Ok(DirEntry {
                        name: child.name.clone(),
                        kind: child_node.node_type(),
                        size: state.quick_size(child_node),
                    })
                })
                .collect::<FsResult<Vec<_>>>()?,
            _ => return Err(FsError::NotADirectory),
        };
        let fd = state.alloc_fd();
        state.dirs.insert(fd, DirHandle { entries, position: 0 });
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

    fn remove(&self, p: &str) -> FsResult<()> {
        path::validate(p)?;
        let wants_dir = path::wants_directory(p);
        let (parent_path, name) = path::split_parent(p)?;
        let mut state = self.state.lock().unwrap();
        let parent = state.resolve(&parent_path)?;
        let node_id = state.find_child(parent, name)?;
        match &state.node(node_id)?.payload {
            NodePayload::Directory { children } => {
                if !children.is_empty() {
                    return Err(FsError::NotEmpty);
                }
            }
            _ if wants_dir => return Err(FsError::NotADirectory),
            _ => {}
        }

        if state.open_handles_for(node_id) > 0 {
            // Deferred deletion: the node stays linked and resolvable until
            // the last handle closes.
            for handle in state.files.values_mut().filter(|h| h.node == node_id) {
                handle.remove_at_close = true;
            }
            tracing::debug!(node = node_id.0, "removal deferred to last close");
            return Ok(());
        }
        state.unlink(parent, node_id)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        path::validate(old_path)?;
        path::validate(new_path)?;
        if path::wants_directory(old_path) || path::wants_directory(new_path) {
            return Err(FsError::InvalidArgument);
        }
        let (old_parent, old_name) = path::split_parent(old_path)?;
        let (new_parent, new_name) = path::split_parent(new_path)?;
        if old_parent != new_parent {
            return Err(FsError::Unsupported);
        }
        let mut state = self.state.lock().unwrap();
        let parent = state.resolve(&old_parent)?;
        match state.find_child(parent, new_name) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let parent_node = state.node_mut(parent)?;
        match &mut parent_node.payload {
            NodePayload::Directory { children } => {
                let slot = children
                    .iter_mut()
                    .find(|c| c.name == old_name)
                    .ok_or(FsError::NotFound)?;
                // In-place replacement; the slot id and list position stay.
                slot.name = new_name.to_string();
                parent_node.mtime = current_timestamp();
                Ok(())
            }
            _ => Err(FsError::NotADirectory),
        }
    }

    fn chmod(&self, p: &str, mode: Mode) -> FsResult<()> {
        path::validate(p)?;
        let mut state = self.state.lock().unwrap();
        let node_id = state.resolve(path::trim_trailing(p))?;
        let node = state.node_mut(node_id)?;
        node.mode = mode & 0o777;
        Ok(())
    }

    fn chown(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        path::validate(p)?;
        let mut state = self.state.lock().unwrap();
        let node_id = state.resolve(path::trim_trailing(p))?;
        let node = state.node_mut(node_id)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    fn open_file_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.files.len() + state.dirs.len()
    }
}
