// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Simulated camera backend.
//!
//! [`SimDevice`] and [`SimTransport`] implement the SDK capability traits in
//! memory. Transfers complete only when asked to, through
//! [`SimTransport::complete`] and friends, or at a fixed frame interval when
//! free-running. Every transport call is recorded as a [`SimEvent`] so tests
//! can assert on ordering, and any call can be made to fail once.
//!
//! The transport enforces the same rules a GigE Vision stream grabber does:
//! a buffer can be queued only once, queued buffers cannot be deregistered,
//! and nothing works after the channel is closed.

use crate::{
    config::features,
    error::{GrabError, Result},
    pool::TransferBuffer,
    transport::{BufferHandle, DeviceControl, GrabResult, GrabStatus, Transport},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Error code reported for calls on a closed channel.
pub const E_CLOSED: u32 = 0xE100_0003;
/// Error code reported for unknown buffer handles.
pub const E_INVALID_HANDLE: u32 = 0xE100_0005;
/// Error code reported when queueing a buffer that is already queued, or
/// deregistering one that is still queued.
pub const E_BUFFER_BUSY: u32 = 0xE100_0011;
/// Error code reported when the buffer policy is exceeded.
pub const E_POLICY: u32 = 0xE100_0012;
/// Error code reported when registering buffers before `prepare`.
pub const E_NOT_PREPARED: u32 = 0xE100_0013;

/// A recorded transport call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Registered { handle: BufferHandle, slot: usize },
    Queued { handle: BufferHandle, context: usize },
    Completed { context: usize, status: GrabStatus },
    CancelAll,
    Deregistered { handle: BufferHandle },
    Closed,
}

/// SMPTE-style colour bars used for synthetic frames.
const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235),
    (235, 235, 16),
    (16, 235, 235),
    (16, 235, 16),
    (235, 16, 235),
    (235, 16, 16),
    (16, 16, 235),
    (16, 16, 16),
];

#[derive(Default)]
struct TransportState {
    closed: bool,
    policy: Option<(usize, usize)>,
    prepared: bool,
    next_handle: u64,
    registered: HashMap<BufferHandle, TransferBuffer>,
    queue: VecDeque<(BufferHandle, usize)>,
    results: VecDeque<GrabResult>,
    queue_counts: HashMap<usize, usize>,
    failures: HashMap<&'static str, u32>,
    events: Vec<SimEvent>,
    geometry: Option<(u32, u32)>,
    frame_interval: Option<Duration>,
    next_due: Option<Instant>,
    frame: u64,
}

impl TransportState {
    fn check(&mut self, op: &'static str) -> Result<()> {
        if let Some(code) = self.failures.remove(op) {
            return Err(GrabError::Transport { op, code });
        }
        if self.closed {
            return Err(GrabError::Transport { op, code: E_CLOSED });
        }
        Ok(())
    }

    fn take_queued(&mut self, context: usize) -> Option<(BufferHandle, usize)> {
        let pos = self.queue.iter().position(|(_, ctx)| *ctx == context)?;
        self.queue.remove(pos)
    }

    fn finish(&mut self, handle: BufferHandle, context: usize, status: GrabStatus) {
        let mut payload_len = 0;
        if status == GrabStatus::Grabbed {
            if let Some(buffer) = self.registered.get(&handle) {
                payload_len = fill_frame(buffer, self.geometry, self.frame);
            }
            self.frame += 1;
        }
        self.events.push(SimEvent::Completed { context, status });
        self.results.push_back(GrabResult {
            context,
            status,
            payload_len,
        });
    }
}

/// Writes a Bayer BG colour-bar frame that scrolls with `frame`.
fn fill_frame(buffer: &TransferBuffer, geometry: Option<(u32, u32)>, frame: u64) -> usize {
    let mut data = buffer.lock();
    match geometry {
        Some((width, height)) if (width as usize * height as usize) <= data.len() && width > 0 => {
            let w = width as usize;
            for y in 0..height as usize {
                for x in 0..w {
                    let bar = ((x + frame as usize * 4) % w) * COLOR_BARS.len() / w;
                    let (r, g, b) = COLOR_BARS[bar];
                    data[y * w + x] = match (x % 2, y % 2) {
                        (0, 0) => b,
                        (1, 1) => r,
                        _ => g,
                    };
                }
            }
            w * height as usize
        }
        _ => {
            data.fill(frame as u8);
            data.len()
        }
    }
}

/// In-memory stream channel.
#[derive(Default)]
pub struct SimTransport {
    state: Mutex<TransportState>,
    ready: Condvar,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the channel to a freshly opened state.
    fn reopen(&self, geometry: Option<(u32, u32)>) {
        let mut st = self.state.lock();
        let failures = std::mem::take(&mut st.failures);
        let frame_interval = st.frame_interval;
        *st = TransportState {
            failures,
            frame_interval,
            geometry,
            ..TransportState::default()
        };
    }

    /// Sets the frame size used to render synthetic Bayer frames. Without a
    /// geometry, completed buffers are filled with the frame number.
    pub fn set_geometry(&self, width: u32, height: u32) {
        self.state.lock().geometry = Some((width, height));
    }

    /// Completes the oldest queued buffer every `interval` while someone is
    /// waiting. `None` returns to manual completion.
    pub fn set_frame_interval(&self, interval: Option<Duration>) {
        let mut st = self.state.lock();
        st.frame_interval = interval;
        st.next_due = None;
    }

    /// Completes the queued buffer with context `context`. Returns `false`
    /// if no such buffer is queued.
    pub fn complete(&self, context: usize) -> bool {
        self.finish_queued(context, GrabStatus::Grabbed)
    }

    /// Completes the queued buffer with context `context` with an error.
    pub fn fail_transfer(&self, context: usize, code: u32) -> bool {
        self.finish_queued(context, GrabStatus::Failed(code))
    }

    /// Aborts the queued buffer with context `context`, as a driver does
    /// when it drops a transfer on its own.
    pub fn cancel(&self, context: usize) -> bool {
        self.finish_queued(context, GrabStatus::Canceled)
    }

    fn finish_queued(&self, context: usize, status: GrabStatus) -> bool {
        let mut st = self.state.lock();
        let Some((handle, context)) = st.take_queued(context) else {
            return false;
        };
        st.finish(handle, context, status);
        self.ready.notify_all();
        true
    }

    /// Completes the oldest queued buffer, returning its context.
    pub fn complete_next(&self) -> Option<usize> {
        let mut st = self.state.lock();
        let (handle, context) = st.queue.pop_front()?;
        st.finish(handle, context, GrabStatus::Grabbed);
        self.ready.notify_all();
        Some(context)
    }

    /// Pushes a result without touching the queue, as a misbehaving driver
    /// would.
    pub fn inject(&self, result: GrabResult) {
        let mut st = self.state.lock();
        st.events.push(SimEvent::Completed {
            context: result.context,
            status: result.status,
        });
        st.results.push_back(result);
        self.ready.notify_all();
    }

    /// Makes the next call of `op` (e.g. `"queue"`, `"wait"`) fail with `code`.
    pub fn fail_next(&self, op: &'static str, code: u32) {
        self.state.lock().failures.insert(op, code);
    }

    pub fn is_queued(&self, context: usize) -> bool {
        self.state.lock().queue.iter().any(|(_, ctx)| *ctx == context)
    }

    /// Contexts currently queued, oldest first.
    pub fn queued(&self) -> Vec<usize> {
        self.state.lock().queue.iter().map(|(_, ctx)| *ctx).collect()
    }

    /// Number of successful `queue` calls made with `context`.
    pub fn queue_count(&self, context: usize) -> usize {
        self.state
            .lock()
            .queue_counts
            .get(&context)
            .copied()
            .unwrap_or(0)
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    pub fn pending_results(&self) -> usize {
        self.state.lock().results.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

impl Transport for SimTransport {
    fn set_buffer_policy(&self, max_count: usize, max_size: usize) -> Result<()> {
        let mut st = self.state.lock();
        st.check("set_buffer_policy")?;
        st.policy = Some((max_count, max_size));
        Ok(())
    }

    fn prepare(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.check("prepare")?;
        if st.policy.is_none() {
            return Err(GrabError::Transport {
                op: "prepare",
                code: E_POLICY,
            });
        }
        st.prepared = true;
        Ok(())
    }

    fn register_buffer(&self, buffer: &TransferBuffer) -> Result<BufferHandle> {
        let mut st = self.state.lock();
        st.check("register_buffer")?;
        if !st.prepared {
            return Err(GrabError::Transport {
                op: "register_buffer",
                code: E_NOT_PREPARED,
            });
        }
        if let Some((max_count, max_size)) = st.policy {
            if st.registered.len() >= max_count || buffer.len() > max_size {
                return Err(GrabError::Transport {
                    op: "register_buffer",
                    code: E_POLICY,
                });
            }
        }
        st.next_handle += 1;
        let handle = BufferHandle(st.next_handle);
        st.registered.insert(handle, buffer.clone());
        st.events.push(SimEvent::Registered {
            handle,
            slot: buffer.slot(),
        });
        Ok(handle)
    }

    fn queue(&self, handle: BufferHandle, context: usize) -> Result<()> {
        let mut st = self.state.lock();
        st.check("queue")?;
        if !st.registered.contains_key(&handle) {
            return Err(GrabError::Transport {
                op: "queue",
                code: E_INVALID_HANDLE,
            });
        }
        if st.queue.iter().any(|(h, _)| *h == handle) {
            return Err(GrabError::Transport {
                op: "queue",
                code: E_BUFFER_BUSY,
            });
        }
        st.queue.push_back((handle, context));
        *st.queue_counts.entry(context).or_default() += 1;
        st.events.push(SimEvent::Queued { handle, context });
        trace!(%handle, context, "queued");
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut st = self.state.lock();
        st.check("wait")?;
        let deadline = Instant::now() + timeout;
        loop {
            if !st.results.is_empty() {
                return Ok(true);
            }
            if st.closed {
                return Ok(false);
            }

            let now = Instant::now();
            let mut wake = deadline;
            if let Some(interval) = st.frame_interval {
                if st.queue.is_empty() {
                    st.next_due = None;
                } else {
                    let due = *st.next_due.get_or_insert(now + interval);
                    if now >= due {
                        if let Some((handle, context)) = st.queue.pop_front() {
                            st.finish(handle, context, GrabStatus::Grabbed);
                        }
                        st.next_due = Some(now + interval);
                        continue;
                    }
                    wake = wake.min(due);
                }
            }

            if now >= deadline {
                return Ok(false);
            }
            self.ready.wait_until(&mut st, wake);
        }
    }

    fn retrieve_result(&self) -> Result<Option<GrabResult>> {
        let mut st = self.state.lock();
        st.check("retrieve_result")?;
        Ok(st.results.pop_front())
    }

    fn cancel_all(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.check("cancel_all")?;
        st.events.push(SimEvent::CancelAll);
        while let Some((handle, context)) = st.queue.pop_front() {
            st.finish(handle, context, GrabStatus::Canceled);
        }
        self.ready.notify_all();
        Ok(())
    }

    fn deregister(&self, handle: BufferHandle) -> Result<()> {
        let mut st = self.state.lock();
        st.check("deregister")?;
        if st.queue.iter().any(|(h, _)| *h == handle) {
            return Err(GrabError::Transport {
                op: "deregister",
                code: E_BUFFER_BUSY,
            });
        }
        if st.registered.remove(&handle).is_none() {
            return Err(GrabError::Transport {
                op: "deregister",
                code: E_INVALID_HANDLE,
            });
        }
        st.events.push(SimEvent::Deregistered { handle });
        Ok(())
    }

    fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.queue.clear();
        st.results.clear();
        st.registered.clear();
        st.events.push(SimEvent::Closed);
        self.ready.notify_all();
        debug!("simulated channel closed");
    }
}

/// In-memory camera exposing the GenICam features the grabber configures.
///
/// Every feature is available, readable and writable unless removed with
/// [`SimDevice::without_feature`]; writes can be made to fail with
/// [`SimDevice::reject_feature`].
pub struct SimDevice {
    width: u32,
    height: u32,
    cameras: usize,
    channels: usize,
    locked: bool,
    open: bool,
    missing: HashSet<String>,
    rejected: HashSet<String>,
    failing_commands: HashSet<String>,
    strings: HashMap<String, String>,
    integers: HashMap<String, i64>,
    commands: Vec<String>,
    transport: Arc<SimTransport>,
}

impl SimDevice {
    /// A single camera with one stream channel and an 8-bit Bayer sensor of
    /// `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cameras: 1,
            channels: 1,
            locked: false,
            open: false,
            missing: HashSet::new(),
            rejected: HashSet::new(),
            failing_commands: HashSet::new(),
            strings: HashMap::new(),
            integers: HashMap::new(),
            commands: Vec::new(),
            transport: Arc::new(SimTransport::new()),
        }
    }

    pub fn with_cameras(mut self, cameras: usize) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn with_stream_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Makes `open` fail as if another application held the camera.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Removes a feature (or enumeration entry) from the device.
    pub fn without_feature(mut self, name: &str) -> Self {
        self.missing.insert(name.to_string());
        self
    }

    /// Makes writes to `name` fail.
    pub fn reject_feature(mut self, name: &str) -> Self {
        self.rejected.insert(name.to_string());
        self
    }

    /// Makes executing `command` fail.
    pub fn fail_command(mut self, command: &str) -> Self {
        self.failing_commands.insert(command.to_string());
        self
    }

    /// Free-running frame interval of the stream channel.
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.transport.set_frame_interval(Some(interval));
        self
    }

    pub fn transport(&self) -> Arc<SimTransport> {
        self.transport.clone()
    }

    /// Last value written to a string or enumeration feature.
    pub fn feature(&self, name: &str) -> Option<&str> {
        self.strings.get(name).map(String::as_str)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.integers.get(name).copied()
    }

    /// Commands executed so far, oldest first.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    fn has(&self, name: &str) -> bool {
        self.open && !self.missing.contains(name)
    }

    fn unsupported(name: &str) -> GrabError {
        GrabError::configuration(name, "feature not available")
    }
}

impl DeviceControl for SimDevice {
    type Channel = Arc<SimTransport>;

    fn enumerate(&mut self) -> Result<usize> {
        Ok(self.cameras)
    }

    fn open(&mut self, index: usize) -> Result<()> {
        if index >= self.cameras {
            return Err(GrabError::NotFound {
                index,
                count: self.cameras,
            });
        }
        if self.locked {
            return Err(GrabError::AccessDenied(index));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_feature_available(&self, name: &str) -> bool {
        self.has(name)
    }

    fn is_feature_readable(&self, name: &str) -> bool {
        self.has(name)
    }

    fn is_feature_writable(&self, name: &str) -> bool {
        self.has(name) && !self.rejected.contains(name)
    }

    fn set_feature(&mut self, name: &str, value: &str) -> Result<()> {
        if !self.has(name) {
            return Err(Self::unsupported(name));
        }
        if self.rejected.contains(name) {
            return Err(GrabError::configuration(name, "feature not writable"));
        }
        self.strings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn set_integer(&mut self, name: &str, value: i64) -> Result<()> {
        if !self.has(name) {
            return Err(Self::unsupported(name));
        }
        if self.rejected.contains(name) {
            return Err(GrabError::configuration(name, "feature not writable"));
        }
        self.integers.insert(name.to_string(), value);
        Ok(())
    }

    fn get_integer(&self, name: &str) -> Result<i64> {
        if !self.has(name) {
            return Err(Self::unsupported(name));
        }
        match name {
            features::WIDTH => Ok(self.width as i64),
            features::HEIGHT => Ok(self.height as i64),
            features::PAYLOAD_SIZE => Ok(self.width as i64 * self.height as i64),
            _ => self
                .integers
                .get(name)
                .copied()
                .ok_or_else(|| Self::unsupported(name)),
        }
    }

    fn execute(&mut self, command: &str) -> Result<()> {
        if !self.has(command) {
            return Err(Self::unsupported(command));
        }
        if self.failing_commands.contains(command) {
            return Err(GrabError::configuration(command, "command rejected"));
        }
        self.commands.push(command.to_string());
        Ok(())
    }

    fn stream_channel_count(&self) -> Result<usize> {
        if !self.open {
            return Err(GrabError::NotOpen);
        }
        Ok(self.channels)
    }

    fn open_channel(&mut self, index: usize) -> Result<Self::Channel> {
        if index >= self.channels {
            return Err(GrabError::configuration(
                "StreamChannel",
                format!("channel {} of {}", index, self.channels),
            ));
        }
        self.transport.reopen(Some((self.width, self.height)));
        Ok(self.transport.clone())
    }
}
