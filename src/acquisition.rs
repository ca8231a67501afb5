// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The acquisition thread.
//!
//! The producer blocks only on [`Transport::wait`], with a bounded timeout so
//! that it observes the stop flag at least once per interval. Each completed
//! transfer is either parked in the [`FrameMailbox`] or immediately handed
//! back to the transport; the producer never waits on the consumer.

use crate::{
    error::{GrabError, Result},
    mailbox::{FrameMailbox, Publish},
    pool::{BufferPool, Slot, SlotState},
    transport::{BufferHandle, GrabResult, GrabStatus, Transport},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// Default time the producer waits for a transfer before re-checking the
/// stop flag.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Counters shared between the producer, the consumer and observers.
#[derive(Debug, Default)]
pub struct CaptureStats {
    completed: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    pulled: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    /// Transfers retrieved from the transport, of any status.
    pub completed: u64,
    /// Frames parked in the mailbox.
    pub published: u64,
    /// Frames re-queued by the producer because the mailbox was busy.
    pub dropped: u64,
    /// Transfers that completed with an error status.
    pub failed: u64,
    /// Frames converted by the consumer.
    pub pulled: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            completed: self.completed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_pull(&self) {
        self.pulled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks `slot` queued and hands it back to the transport.
///
/// The slot moves to `Queued` before the transport call since the transfer
/// can complete before `queue` returns. If the transport refuses the buffer
/// the slot falls back to `Idle`.
pub(crate) fn requeue<T: Transport>(
    transport: &T,
    handles: &[BufferHandle],
    slot: &Slot,
    from: SlotState,
) -> Result<()> {
    if let Err(actual) = slot.transition(from, SlotState::Queued) {
        warn!(slot = slot.index(), %from, %actual, "refusing to re-queue slot");
        return Ok(());
    }
    if let Err(e) = transport.queue(handles[slot.index()], slot.index()) {
        slot.reset();
        return Err(e);
    }
    Ok(())
}

/// State owned by the acquisition thread.
pub(crate) struct Producer<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) pool: BufferPool,
    pub(crate) handles: Arc<[BufferHandle]>,
    pub(crate) mailbox: Arc<FrameMailbox>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) stats: Arc<CaptureStats>,
    pub(crate) wait_timeout: Duration,
}

impl<T: Transport> Producer<T> {
    /// Runs until the stop flag is set or the stream fails.
    pub(crate) fn run(self) -> Result<()> {
        info!(buffers = self.pool.len(), timeout = ?self.wait_timeout, "acquisition started");

        let res = self.run_loop();
        match &res {
            Ok(()) => info!(counters = ?self.stats.snapshot(), "acquisition stopped"),
            Err(e) => error!("acquisition aborted: {}", e),
        }
        res
    }

    fn run_loop(&self) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            if !self.transport.wait(self.wait_timeout)? {
                trace!("wait timed out");
                continue;
            }

            let Some(result) = self.transport.retrieve_result()? else {
                // Signalled without a result; nothing to do until the next wait.
                continue;
            };

            self.handle_result(result)?;
        }
        Ok(())
    }

    fn handle_result(&self, result: GrabResult) -> Result<()> {
        let slot = self
            .pool
            .get(result.context)
            .ok_or(GrabError::ProtocolViolation {
                context: result.context,
                pool_size: self.pool.len(),
            })?;
        self.stats.completed.fetch_add(1, Ordering::Relaxed);

        match result.status {
            GrabStatus::Grabbed => {}
            GrabStatus::Failed(code) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(slot = slot.index(), "grab failed with code {:#x}", code);
                return requeue(self.transport.as_ref(), &self.handles, slot, SlotState::Queued);
            }
            GrabStatus::Canceled => {
                debug!(slot = slot.index(), "transfer cancelled");
                let _ = slot.transition(SlotState::Queued, SlotState::Idle);
                return Ok(());
            }
        }

        // Mark the slot mailed before it becomes visible to the consumer.
        if let Err(actual) = slot.transition(SlotState::Queued, SlotState::Mailed) {
            warn!(slot = slot.index(), %actual, "completion for a buffer that was not queued");
            return Ok(());
        }

        match self.mailbox.try_publish(slot.index()) {
            Publish::Published => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                trace!(slot = slot.index(), len = result.payload_len, "frame published");
                Ok(())
            }
            Publish::Occupied | Publish::Contended => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(slot = slot.index(), "frame dropped");
                requeue(self.transport.as_ref(), &self.handles, slot, SlotState::Mailed)
            }
        }
    }
}
