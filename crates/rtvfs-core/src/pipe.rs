// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded blocking byte queue backing named pipes.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::FsResult;

/// FIFO byte queue with a fixed capacity.
///
/// Transfers move one byte at a time. A full queue blocks the writer until a
/// reader drains a byte; an empty queue blocks the reader until a writer
/// supplies one. A write with no reader on the other end therefore blocks
/// indefinitely once the queue fills; callers that cannot tolerate this must
/// arrange a reader first.
///
/// The live byte count is kept in an atomic, separate from any filesystem
/// structural lock, so `stat` on the pipe node can report it without
/// serializing against in-flight transfers.
pub struct Pipe {
    tx: Sender<u8>,
    rx: Receiver<u8>,
    len: AtomicUsize,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx, len: AtomicUsize::new(0) }
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all of `buf`, blocking per byte until the queue accepts it.
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        for &byte in buf {
            // Both channel ends live in self, so send cannot disconnect.
            let _ = self.tx.send(byte);
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        Ok(buf.len())
    }

    /// Fill all of `buf`, blocking per byte until the queue supplies it.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        for slot in buf.iter_mut() {
            let _ = self.rx.recv().map(|byte| *slot = byte);
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(buf.len())
    }
}
