// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Device driver contract: the file-style interface every driver exposes,
//! the single-owner device lock, ioctl request packing and the module
//! registry that owns driver instances.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{FsError, FsResult};
use crate::types::{DeviceId, OpenOptions, TaskId};

/// Packed ioctl request number: a 16-bit group in the high half and a
/// 16-bit opcode in the low half. The group namespaces opcodes per driver
/// family; the argument type and direction are fixed per request constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IoctlRequest(pub u32);

impl IoctlRequest {
    pub const fn new(group: u16, opcode: u16) -> Self {
        Self(((group as u32) << 16) | (opcode as u32))
    }

    pub const fn group(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn opcode(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// Stat result for a device instance. Size is queried live from the driver,
/// not cached by the filesystem holding the device node.
#[derive(Clone, Copy, Debug)]
pub struct DeviceStat {
    pub size: u64,
    pub device: DeviceId,
}

/// The file-style interface a device driver exposes to filesystems.
///
/// `open` must acquire the instance's [`DeviceLock`] and fail `Busy` without
/// waiting when another task holds it. `close(force = true)` releases the
/// lock regardless of the owner; a transfer in flight on the evicted owner's
/// side surfaces as a timeout error there, never as corruption here.
pub trait DeviceDriver: Send + Sync {
    fn open(&self, opts: &OpenOptions) -> FsResult<()>;
    fn close(&self, force: bool) -> FsResult<()>;
    fn read(&self, buf: &mut [u8], pos: u64) -> FsResult<usize>;
    fn write(&self, buf: &[u8], pos: u64) -> FsResult<usize>;
    fn ioctl(&self, request: IoctlRequest, arg: &mut dyn Any) -> FsResult<()>;
    fn flush(&self) -> FsResult<()>;
    fn stat(&self) -> FsResult<DeviceStat>;
}

/// Single-owner, non-queuing access token for one device instance.
///
/// Acquisition never waits: if any task holds the lock, including the
/// caller, acquisition fails `Busy` immediately. There is no wait queue.
#[derive(Debug, Default)]
pub struct DeviceLock {
    owner: Mutex<Option<TaskId>>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> FsResult<()> {
        let mut owner = self.owner.lock().unwrap();
        if owner.is_some() {
            return Err(FsError::Busy);
        }
        *owner = Some(TaskId::current());
        Ok(())
    }

    /// Release the lock. Only the owning task may release it unless `force`
    /// is set, which clears ownership unconditionally.
    pub fn release(&self, force: bool) -> FsResult<()> {
        let mut owner = self.owner.lock().unwrap();
        match *owner {
            Some(task) if force || task == TaskId::current() => {
                if force && task != TaskId::current() {
                    tracing::warn!(owner = %task, "device lock force-released");
                }
                *owner = None;
                Ok(())
            }
            Some(_) => Err(FsError::NotPermitted),
            None => Err(FsError::NotPermitted),
        }
    }

    pub fn is_held(&self) -> bool {
        self.owner.lock().unwrap().is_some()
    }

    pub fn holder(&self) -> Option<TaskId> {
        *self.owner.lock().unwrap()
    }
}

/// Driver family lifecycle: creates and tears down driver instances for
/// concrete major/minor pairs.
pub trait DeviceModule: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(&self, id: DeviceId) -> FsResult<Arc<dyn DeviceDriver>>;
    fn release(&self, id: DeviceId) -> FsResult<()>;
}

struct DeviceSlot {
    driver: Arc<dyn DeviceDriver>,
    refs: u32,
}

#[derive(Default)]
struct RegistryState {
    modules: HashMap<&'static str, Arc<dyn DeviceModule>>,
    devices: HashMap<(&'static str, DeviceId), DeviceSlot>,
}

/// Explicit registry of driver modules and live device instances.
///
/// Instances are reference counted: repeated `init_device` for the same
/// major/minor returns the existing driver, and the module's `release` runs
/// only when the last reference is dropped.
#[derive(Default)]
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&self, module: Arc<dyn DeviceModule>) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = module.name();
        if state.modules.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        tracing::debug!(module = name, "driver module registered");
        state.modules.insert(name, module);
        Ok(())
    }

    pub fn init_device(&self, module: &str, id: DeviceId) -> FsResult<Arc<dyn DeviceDriver>> {
        let mut state = self.state.lock().unwrap();
        let module = state.modules.get(module).cloned().ok_or(FsError::NoDevice)?;
        let key = (module.name(), id);
        if let Some(slot) = state.devices.get_mut(&key) {
            slot.refs += 1;
            return Ok(slot.driver.clone());
        }
        let driver = module.init(id)?;
        tracing::debug!(module = key.0, major = id.major, minor = id.minor, "device initialized");
        state.devices.insert(key, DeviceSlot { driver: driver.clone(), refs: 1 });
        Ok(driver)
    }

    pub fn release_device(&self, module: &str, id: DeviceId) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let module = state.modules.get(module).cloned().ok_or(FsError::NoDevice)?;
        let key = (module.name(), id);
        let slot = state.devices.get_mut(&key).ok_or(FsError::NotFound)?;
        slot.refs -= 1;
        if slot.refs == 0 {
            state.devices.remove(&key);
            module.release(id)?;
            tracing::debug!(module = key.0, major = id.major, minor = id.minor, "device released");
        }
        Ok(())
    }

    /// Number of live device instances, across all modules.
    pub fn device_count(&self) -> usize {
        self.state.lock().unwrap().devices.len()
    }
}
