// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared bus controller.
//!
//! One controller serializes transactions to every device on its bus behind
//! a private mutex. Each step of a transaction (addressing, byte transfer)
//! completes asynchronously: the hardware raises an event on the interrupt
//! line and the controller waits for it with a bounded timeout. A timeout
//! or a run of unexpected events resets the peripheral before the error is
//! reported; this is the only place in the stack that retries or resets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use rtvfs_core::{FsError, FsResult};

/// Bound on a single hardware wait.
pub const DEVICE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Unexpected events tolerated before the controller declares the
/// peripheral wedged and reinitializes it.
const SPURIOUS_LIMIT: u32 = 16;

/// Completion events a bus peripheral can raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusEvent {
    /// The requested step finished.
    Complete,
    /// Lost arbitration against another master; the caller may retry.
    ArbitrationLost,
    /// No device acknowledged the address.
    AddressNack,
    /// Electrical or protocol fault.
    BusFault,
    /// Interrupt fired with no matching condition.
    Spurious,
}

/// Notification line between the (simulated) interrupt context and the
/// waiting task. `raise` never blocks, so it is safe to call from a context
/// that must not wait; `wait` blocks with a bounded timeout.
pub struct IrqLine {
    tx: Sender<BusEvent>,
    rx: Receiver<BusEvent>,
}

impl IrqLine {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Signal an event. Returns false when an event is already pending.
    pub fn raise(&self, event: BusEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    fn wait(&self, timeout: Duration) -> Option<BusEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// The electrical layer. Each step completes by raising an event on the
/// given line; `collect` fetches the byte latched by the last `request`.
pub trait BusHardware: Send + Sync {
    /// Reinitialize the peripheral into an idle state.
    fn reset(&self);
    /// Address a device for the given transfer direction.
    fn select(&self, line: &IrqLine, device: u16, write: bool);
    /// Transmit one byte to the selected device.
    fn transmit(&self, line: &IrqLine, byte: u8);
    /// Ask the selected device for one byte.
    fn request(&self, line: &IrqLine);
    /// Fetch the byte latched by the last completed `request`.
    fn collect(&self) -> u8;
    /// End the transaction and release the bus.
    fn stop(&self);
}

/// Serializing controller for one bus.
pub struct BusController {
    hw: Arc<dyn BusHardware>,
    transaction: Mutex<()>,
    line: IrqLine,
    spurious: AtomicU32,
    timeout: Duration,
}

impl BusController {
    pub fn new(hw: Arc<dyn BusHardware>, timeout: Duration) -> Self {
        Self {
            hw,
            transaction: Mutex::new(()),
            line: IrqLine::new(),
            spurious: AtomicU32::new(0),
            timeout,
        }
    }

    /// Write `data` to `device` at byte position `subaddr`.
    pub fn write_transfer(&self, device: u16, subaddr: u16, data: &[u8]) -> FsResult<usize> {
        let _guard = self.transaction.lock().unwrap();
        self.line.drain();
        let result = self.write_locked(device, subaddr, data);
        self.hw.stop();
        result
    }

    /// Fill `buf` from `device` starting at byte position `subaddr`.
    pub fn read_transfer(&self, device: u16, subaddr: u16, buf: &mut [u8]) -> FsResult<usize> {
        let _guard = self.transaction.lock().unwrap();
        self.line.drain();
        let result = self.read_locked(device, subaddr, buf);
        self.hw.stop();
        result
    }

    fn write_locked(&self, device: u16, subaddr: u16, data: &[u8]) -> FsResult<usize> {
        self.select_device(device, true)?;
        self.send_subaddr(subaddr)?;
        for &byte in data {
            self.hw.transmit(&self.line, byte);
            self.await_step(false)?;
        }
        Ok(data.len())
    }

    fn read_locked(&self, device: u16, subaddr: u16, buf: &mut [u8]) -> FsResult<usize> {
        // Position the device pointer with a write-mode addressing phase,
        // then re-select for reading.
        self.select_device(device, true)?;
        self.send_subaddr(subaddr)?;
        self.select_device(device, false)?;
        for slot in buf.iter_mut() {
            self.hw.request(&self.line);
            self.await_step(false)?;
            *slot = self.hw.collect();
        }
        Ok(buf.len())
    }

    fn select_device(&self, device: u16, write: bool) -> FsResult<()> {
        self.hw.select(&self.line, device, write);
        self.await_step(true)
    }

    fn send_subaddr(&self, subaddr: u16) -> FsResult<()> {
        for byte in subaddr.to_be_bytes() {
            self.hw.transmit(&self.line, byte);
            self.await_step(false)?;
        }
        Ok(())
    }

    /// Wait for the next completion event. `addressing` selects the error
    /// reported for a missing acknowledge.
    fn await_step(&self, addressing: bool) -> FsResult<()> {
        loop {
            match self.line.wait(self.timeout) {
                None => {
                    self.recover("bus step timed out");
                    return Err(FsError::TimedOut);
                }
                Some(BusEvent::Complete) => return Ok(()),
                Some(BusEvent::ArbitrationLost) => return Err(FsError::TryAgain),
                Some(BusEvent::AddressNack) => {
                    return Err(if addressing { FsError::NoDevice } else { FsError::Io(
                        std::io::Error::new(std::io::ErrorKind::Other, "unexpected nack"),
                    ) });
                }
                Some(BusEvent::BusFault) => {
                    return Err(FsError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "bus fault",
                    )));
                }
                Some(BusEvent::Spurious) => {
                    let seen = self.spurious.fetch_add(1, Ordering::Relaxed) + 1;
                    if seen >= SPURIOUS_LIMIT {
                        self.recover("spurious interrupt flood");
                        return Err(FsError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "peripheral wedged",
                        )));
                    }
                }
            }
        }
    }

    /// Defensive reinitialization after a hang or interrupt flood.
    fn recover(&self, cause: &str) {
        tracing::warn!(cause, "bus controller reset");
        self.line.drain();
        self.spurious.store(0, Ordering::Relaxed);
        self.hw.reset();
    }

    /// Interrupt line of this controller, for the hardware side.
    pub fn line(&self) -> &IrqLine {
        &self.line
    }
}
