// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! rtvfs-drivers: device drivers for the rtvfs core.
//!
//! Ships a shared bus controller with interrupt-style completion signaling
//! and an EEPROM driver built on it, plus an in-process bus implementation
//! for hosts and tests.

pub mod bus;
pub mod eeprom;

pub use bus::{BusController, BusEvent, BusHardware, IrqLine, DEVICE_TIMEOUT};
pub use eeprom::{
    EepromDev, EepromModule, MemoryBus, GROUP_STORAGE, IOCTL_EEPROM_CAPACITY, IOCTL_EEPROM_ERASE,
};
