// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! EEPROM driver: a seek-addressable memory device behind a shared bus.
//!
//! The file position maps directly to the device sub-address, so reads and
//! writes at arbitrary offsets become positioned bus transfers. Open and
//! close go through the single-owner device lock; everything else forwards
//! to the bus controller.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rtvfs_core::{
    DeviceDriver, DeviceId, DeviceLock, DeviceModule, DeviceStat, FsError, FsResult, IoctlRequest,
    OpenOptions,
};

use crate::bus::{BusController, BusEvent, BusHardware, IrqLine};

/// Ioctl group for storage-class devices.
pub const GROUP_STORAGE: u16 = 0x0001;

/// Read the device capacity in bytes; argument `&mut u64`.
pub const IOCTL_EEPROM_CAPACITY: IoctlRequest = IoctlRequest::new(GROUP_STORAGE, 0x00);
/// Fill the whole device with the erased pattern (0xFF); no argument.
pub const IOCTL_EEPROM_ERASE: IoctlRequest = IoctlRequest::new(GROUP_STORAGE, 0x01);

const ERASED_BYTE: u8 = 0xFF;
const ERASE_CHUNK: usize = 32;

/// Module producing EEPROM driver instances. The minor number selects the
/// bus address relative to `base_address`.
pub struct EepromModule {
    bus: Arc<BusController>,
    base_address: u16,
    capacity: u64,
}

impl EepromModule {
    pub fn new(bus: Arc<BusController>, base_address: u16, capacity: u64) -> Self {
        Self { bus, base_address, capacity }
    }
}

impl DeviceModule for EepromModule {
    fn name(&self) -> &'static str {
        "eeprom"
    }

    fn init(&self, id: DeviceId) -> FsResult<Arc<dyn DeviceDriver>> {
        Ok(Arc::new(EepromDev {
            bus: self.bus.clone(),
            address: self.base_address + id.minor as u16,
            capacity: self.capacity,
            id,
            lock: DeviceLock::new(),
        }))
    }

    fn release(&self, id: DeviceId) -> FsResult<()> {
        tracing::debug!(major = id.major, minor = id.minor, "eeprom instance released");
        Ok(())
    }
}

/// One EEPROM instance on the bus.
pub struct EepromDev {
    bus: Arc<BusController>,
    address: u16,
    capacity: u64,
    id: DeviceId,
    lock: DeviceLock,
}

impl EepromDev {
    /// Clip a transfer to the device capacity.
    fn span(&self, pos: u64, len: usize) -> usize {
        if pos >= self.capacity {
            return 0;
        }
        ((self.capacity - pos) as usize).min(len)
    }
}

impl DeviceDriver for EepromDev {
    fn open(&self, _opts: &OpenOptions) -> FsResult<()> {
        self.lock.try_acquire()
    }

    fn close(&self, force: bool) -> FsResult<()> {
        self.lock.release(force)
    }

    fn read(&self, buf: &mut [u8], pos: u64) -> FsResult<usize> {
        let n = self.span(pos, buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.bus.read_transfer(self.address, pos as u16, &mut buf[..n])
    }

    fn write(&self, buf: &[u8], pos: u64) -> FsResult<usize> {
        let n = self.span(pos, buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.bus.write_transfer(self.address, pos as u16, &buf[..n])
    }

    fn ioctl(&self, request: IoctlRequest, arg: &mut dyn Any) -> FsResult<()> {
        match request {
            IOCTL_EEPROM_CAPACITY => {
                let out = arg.downcast_mut::<u64>().ok_or(FsError::InvalidArgument)?;
                *out = self.capacity;
                Ok(())
            }
            IOCTL_EEPROM_ERASE => {
                let pattern = [ERASED_BYTE; ERASE_CHUNK];
                let mut pos = 0u64;
                while pos < self.capacity {
                    let n = self.span(pos, ERASE_CHUNK);
                    self.bus.write_transfer(self.address, pos as u16, &pattern[..n])?;
                    pos += n as u64;
                }
                Ok(())
            }
            _ => Err(FsError::Unsupported),
        }
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn stat(&self) -> FsResult<DeviceStat> {
        Ok(DeviceStat { size: self.capacity, device: self.id })
    }
}

/// In-process bus hardware: a set of addressable memories with the pointer
/// semantics of a serial EEPROM. Every step completes immediately by
/// raising an event on the interrupt line.
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
}

struct MemoryBusState {
    devices: HashMap<u16, MemoryDevice>,
    selected: Option<u16>,
    last_read: u8,
}

struct MemoryDevice {
    memory: Vec<u8>,
    pointer: usize,
    addr_bytes: Vec<u8>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryBusState {
                devices: HashMap::new(),
                selected: None,
                last_read: 0,
            }),
        }
    }

    pub fn add_device(&self, address: u16, size: usize) {
        let mut state = self.state.lock().unwrap();
        state.devices.insert(
            address,
            MemoryDevice { memory: vec![0u8; size], pointer: 0, addr_bytes: Vec::new() },
        );
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusHardware for MemoryBus {
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.selected = None;
    }

    fn select(&self, line: &IrqLine, device: u16, write: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(dev) = state.devices.get_mut(&device) {
            if write {
                dev.addr_bytes.clear();
            }
            state.selected = Some(device);
            line.raise(BusEvent::Complete);
        } else {
            line.raise(BusEvent::AddressNack);
        }
    }

    fn transmit(&self, line: &IrqLine, byte: u8) {
        let mut state = self.state.lock().unwrap();
        let Some(address) = state.selected else {
            line.raise(BusEvent::BusFault);
            return;
        };
        if let Some(dev) = state.devices.get_mut(&address) {
            if dev.addr_bytes.len() < 2 {
                dev.addr_bytes.push(byte);
                if dev.addr_bytes.len() == 2 {
                    dev.pointer =
                        u16::from_be_bytes([dev.addr_bytes[0], dev.addr_bytes[1]]) as usize;
                }
            } else if dev.pointer < dev.memory.len() {
                dev.memory[dev.pointer] = byte;
                dev.pointer += 1;
            }
            line.raise(BusEvent::Complete);
        } else {
            line.raise(BusEvent::BusFault);
        }
    }

    fn request(&self, line: &IrqLine) {
        let mut state = self.state.lock().unwrap();
        let Some(address) = state.selected else {
            line.raise(BusEvent::BusFault);
            return;
        };
        if let Some(dev) = state.devices.get_mut(&address) {
            let byte = dev.memory.get(dev.pointer).copied().unwrap_or(ERASED_BYTE);
            dev.pointer += 1;
            state.last_read = byte;
            line.raise(BusEvent::Complete);
        } else {
            line.raise(BusEvent::BusFault);
        }
    }

    fn collect(&self) -> u8 {
        self.state.lock().unwrap().last_read
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.selected = None;
    }
}
