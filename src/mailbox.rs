// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Single-slot exchange between the acquisition thread and the consumer.
//!
//! The mailbox holds at most one pool slot index. The producer only ever
//! uses [`FrameMailbox::try_publish`], which never blocks: if the lock is
//! taken or a frame is already parked, the caller keeps the new buffer and
//! must re-queue it. Frames are sacrificed rather than queued so the
//! consumer always sees a recent frame. The parked frame is never displaced
//! by a newer one.

use parking_lot::Mutex;

/// Result of a non-blocking publish attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Publish {
    /// The slot is now parked in the mailbox.
    Published,
    /// A frame is already parked; the caller keeps the slot.
    Occupied,
    /// The consumer holds the lock; the caller keeps the slot.
    Contended,
}

#[derive(Debug, Default)]
pub struct FrameMailbox {
    held: Mutex<Option<usize>>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `slot` if the mailbox is free and uncontended.
    pub fn try_publish(&self, slot: usize) -> Publish {
        match self.held.try_lock() {
            Some(mut held) if held.is_none() => {
                *held = Some(slot);
                Publish::Published
            }
            Some(_) => Publish::Occupied,
            None => Publish::Contended,
        }
    }

    /// Parks `slot`, waiting for the lock if needed. Returns `false` if a
    /// frame is already parked.
    #[cfg(test)]
    pub(crate) fn publish(&self, slot: usize) -> bool {
        let mut held = self.held.lock();
        if held.is_some() {
            return false;
        }
        *held = Some(slot);
        true
    }

    /// Takes the parked slot, leaving the mailbox empty.
    pub fn try_take(&self) -> Option<usize> {
        self.held.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_none()
    }

    /// Empties the mailbox, returning whatever was parked.
    pub fn clear(&self) -> Option<usize> {
        self.try_take()
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> parking_lot::MutexGuard<'_, Option<usize>> {
        self.held.lock()
    }
}
