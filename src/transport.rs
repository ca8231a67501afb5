// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capability traits for the camera SDK.
//!
//! The grabber core never talks to a vendor SDK directly. A camera backend
//! implements [`DeviceControl`] for feature access and stream setup, and
//! hands out a [`Transport`] for each opened stream channel. Both traits
//! mirror the GenICam/GigE Vision grab model: buffers are registered once,
//! queued with a context tag, and completed transfers are retrieved as
//! [`GrabResult`]s after the channel's wait object signals.

use crate::{error::Result, pool::TransferBuffer};
use std::{fmt, sync::Arc, time::Duration};

/// Opaque handle returned by [`Transport::register_buffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Outcome of a single transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GrabStatus {
    /// The buffer holds a complete image.
    Grabbed,
    /// The transfer failed, e.g. with lost packets. The buffer contents are
    /// undefined but the buffer itself may be queued again.
    Failed(u32),
    /// The transfer was cancelled by [`Transport::cancel_all`].
    Canceled,
}

/// A completed transfer as reported by [`Transport::retrieve_result`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GrabResult {
    /// The context tag passed to [`Transport::queue`]; the grabber uses the
    /// pool slot index.
    pub context: usize,
    pub status: GrabStatus,
    /// Number of valid bytes in the buffer.
    pub payload_len: usize,
}

/// An open stream channel of a camera.
///
/// Methods take `&self`: the acquisition thread waits and retrieves while
/// the consumer re-queues converted buffers. Implementations must be safe
/// to call concurrently from those two threads, as the vendor SDKs are.
pub trait Transport: Send + Sync + 'static {
    /// Declares the maximum number and size of buffers that will be
    /// registered.
    fn set_buffer_policy(&self, max_count: usize, max_size: usize) -> Result<()>;

    /// Allocates transport-side resources for the declared policy.
    fn prepare(&self) -> Result<()>;

    /// Registers a buffer with the channel. The transport may keep the
    /// handle and write transfers through it until the buffer is
    /// deregistered.
    fn register_buffer(&self, buffer: &TransferBuffer) -> Result<BufferHandle>;

    /// Queues a registered buffer for the next transfer. `context` is
    /// returned verbatim in the buffer's [`GrabResult`].
    fn queue(&self, handle: BufferHandle, context: usize) -> Result<()>;

    /// Waits up to `timeout` for a completed transfer. Returns `false` on
    /// timeout.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    /// Takes one completed transfer, or `None` if none is ready.
    fn retrieve_result(&self) -> Result<Option<GrabResult>>;

    /// Cancels every queued transfer. Cancelled buffers are reported through
    /// [`Transport::retrieve_result`] with [`GrabStatus::Canceled`].
    fn cancel_all(&self) -> Result<()>;

    fn deregister(&self, handle: BufferHandle) -> Result<()>;

    /// Releases the channel. Must be safe to call more than once.
    fn close(&self);
}

impl<T: Transport> Transport for Arc<T> {
    fn set_buffer_policy(&self, max_count: usize, max_size: usize) -> Result<()> {
        (**self).set_buffer_policy(max_count, max_size)
    }

    fn prepare(&self) -> Result<()> {
        (**self).prepare()
    }

    fn register_buffer(&self, buffer: &TransferBuffer) -> Result<BufferHandle> {
        (**self).register_buffer(buffer)
    }

    fn queue(&self, handle: BufferHandle, context: usize) -> Result<()> {
        (**self).queue(handle, context)
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        (**self).wait(timeout)
    }

    fn retrieve_result(&self) -> Result<Option<GrabResult>> {
        (**self).retrieve_result()
    }

    fn cancel_all(&self) -> Result<()> {
        (**self).cancel_all()
    }

    fn deregister(&self, handle: BufferHandle) -> Result<()> {
        (**self).deregister(handle)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Feature and stream access for one camera.
pub trait DeviceControl: Send {
    type Channel: Transport;

    /// Number of cameras visible to the SDK.
    fn enumerate(&mut self) -> Result<usize>;

    /// Opens the camera at `index` for control and streaming.
    fn open(&mut self, index: usize) -> Result<()>;

    /// Closes the camera. Must be safe to call when not open.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn is_feature_available(&self, name: &str) -> bool;

    fn is_feature_readable(&self, name: &str) -> bool;

    fn is_feature_writable(&self, name: &str) -> bool;

    /// Sets an enumeration or string feature from its textual value.
    fn set_feature(&mut self, name: &str, value: &str) -> Result<()>;

    fn set_integer(&mut self, name: &str, value: i64) -> Result<()>;

    fn get_integer(&self, name: &str) -> Result<i64>;

    /// Executes a command feature such as `AcquisitionStart`.
    fn execute(&mut self, command: &str) -> Result<()>;

    fn stream_channel_count(&self) -> Result<usize>;

    /// Opens stream channel `index`.
    fn open_channel(&mut self, index: usize) -> Result<Self::Channel>;
}
