// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Fixed pool of transfer buffers.
//!
//! The pool owns `N` equal-size byte regions, one per slot. A slot's index is
//! its identity for the whole lifetime of the pool and is the context tag
//! handed to the transport when the buffer is queued. Ownership of a slot is
//! tracked explicitly with a [`SlotState`] so that a buffer can never be
//! queued twice, or deregistered while a conversion is still reading it.

use crate::error::{GrabError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Default number of transfer buffers per pool.
pub const DEFAULT_BUFFER_COUNT: usize = 8;

/// Ownership state of a pool slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Owned by the pool, not known to the transport.
    Idle = 0,
    /// Queued with the transport, waiting to be filled.
    Queued = 1,
    /// Parked in the frame mailbox.
    Mailed = 2,
    /// Being read by the conversion handoff.
    Converting = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> SlotState {
        match value {
            0 => SlotState::Idle,
            1 => SlotState::Queued,
            2 => SlotState::Mailed,
            _ => SlotState::Converting,
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Handle to one transfer buffer.
///
/// Cloning the handle does not copy the memory; transports keep a clone for
/// every registered buffer and write completed transfers through it.
#[derive(Clone)]
pub struct TransferBuffer {
    slot: usize,
    len: usize,
    data: Arc<Mutex<Box<[u8]>>>,
}

impl TransferBuffer {
    fn allocate(slot: usize, len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            GrabError::Allocation(format!("slot {} of {} bytes: {}", slot, len, e))
        })?;
        data.resize(len, 0u8);
        Ok(Self {
            slot,
            len,
            data: Arc::new(Mutex::new(data.into_boxed_slice())),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locks the buffer memory. Held by the transport while writing a
    /// transfer and by the conversion while copying it out.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    /// Copies `src` into the start of the buffer, truncating to capacity.
    /// Returns the number of bytes written.
    pub fn write(&self, src: &[u8]) -> usize {
        let n = src.len().min(self.len);
        self.data.lock()[..n].copy_from_slice(&src[..n]);
        n
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

/// One pool entry: the buffer and its ownership state.
#[derive(Debug)]
pub struct Slot {
    buffer: TransferBuffer,
    state: AtomicU8,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.buffer.slot
    }

    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the slot from `from` to `to`. On mismatch the slot is left
    /// untouched and its actual state is returned.
    pub fn transition(&self, from: SlotState, to: SlotState) -> Result<(), SlotState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SlotState::from_u8)
    }

    /// Forces the slot back to `Idle`, used when a session is torn down.
    pub fn reset(&self) {
        self.state.store(SlotState::Idle as u8, Ordering::Release);
    }
}

/// Arena of transfer buffers indexed by slot number.
///
/// The pool handle is cheap to clone; clones share the same slots. An
/// acquisition session keeps a clone for as long as it runs.
#[derive(Clone)]
pub struct BufferPool {
    slots: Arc<[Slot]>,
    buffer_size: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Creates an empty pool. Call [`BufferPool::allocate`] to size it.
    pub fn new() -> Self {
        Self {
            slots: Arc::from(Vec::<Slot>::new()),
            buffer_size: 0,
        }
    }

    /// Reserves `count` buffers of `size` bytes each.
    ///
    /// Either every buffer is reserved or none is; on failure the pool is
    /// left empty. Any previous allocation is freed first.
    pub fn allocate(&mut self, count: usize, size: usize) -> Result<()> {
        self.free()?;

        if count < 1 {
            return Err(GrabError::Allocation("buffer count must be at least 1".into()));
        }
        if size < 1 {
            return Err(GrabError::Allocation("buffer size must be at least 1".into()));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|e| GrabError::Allocation(e.to_string()))?;
        for slot in 0..count {
            // Dropping `slots` on error releases everything reserved so far.
            let buffer = TransferBuffer::allocate(slot, size)?;
            slots.push(Slot {
                buffer,
                state: AtomicU8::new(SlotState::Idle as u8),
            });
        }

        self.slots = Arc::from(slots);
        self.buffer_size = size;
        debug!(count, size, "allocated transfer buffers");
        Ok(())
    }

    /// Releases all buffers. Freeing an empty pool is a no-op.
    ///
    /// Fails if any slot is still owned by a session; the session must cancel
    /// and deregister its transfers first.
    pub fn free(&mut self) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        if let Some(busy) = self.slots.iter().find(|s| s.state() != SlotState::Idle) {
            return Err(GrabError::Allocation(format!(
                "slot {} is still {}",
                busy.index(),
                busy.state()
            )));
        }
        self.slots = Arc::from(Vec::<Slot>::new());
        self.buffer_size = 0;
        debug!("freed transfer buffers");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn get(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Number of slots currently in `state`.
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state() == state).count()
    }

    pub fn all_idle(&self) -> bool {
        self.count(SlotState::Idle) == self.slots.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.slots.len())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}
