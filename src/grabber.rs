// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Camera lifecycle and the consumer side of the frame exchange.
//!
//! A [`Grabber`] owns one camera. [`Grabber::open`] configures it and sizes
//! the buffer pool, [`Grabber::start_capture`] arms the stream channel and
//! spawns the acquisition thread, and [`Grabber::pull_frame`] converts the
//! most recent frame, if any, into the caller's image.
//!
//! ```
//! use edgefirst_grabber::{
//!     config::GrabberConfig,
//!     grabber::Grabber,
//!     image::{Image, RGB3},
//!     sim::SimDevice,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = SimDevice::new(64, 48).with_frame_interval(Duration::from_millis(5));
//! let mut grabber = Grabber::new(device, GrabberConfig::default());
//! grabber.open()?;
//! grabber.start_capture()?;
//!
//! let mut rgb = Image::new(64, 48, RGB3)?;
//! while !grabber.pull_frame(&mut rgb)? {
//!     std::thread::sleep(Duration::from_millis(1));
//! }
//!
//! grabber.stop_capture()?;
//! grabber.close()?;
//! # Ok(())
//! # }
//! ```

use crate::{
    acquisition::{requeue, CaptureCounters, CaptureStats, Producer},
    config::{configure, features, GrabberConfig, ImageGeometry},
    demosaic::{Demosaic, QuadDemosaic},
    error::{GrabError, Result},
    image::{Image, RGB3, RGBA},
    mailbox::FrameMailbox,
    pool::{BufferPool, Slot, SlotState},
    transport::{BufferHandle, DeviceControl, Transport},
};
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};

/// Interval at which `stop_capture` polls the acquisition thread.
const JOIN_POLL: Duration = Duration::from_millis(100);

/// Shortest time `stop_capture` waits for consumers to hand back buffers.
const MIN_RELEASE_WAIT: Duration = Duration::from_secs(1);

/// Something a consumer can pull frames from.
trait FrameSource: Send + Sync {
    fn pull(&self, output: &mut Image) -> Result<bool>;
}

/// State shared by the acquisition thread, consumers and the stop path for
/// one capture session.
struct Session<T: Transport> {
    transport: Arc<T>,
    pool: BufferPool,
    handles: Arc<[BufferHandle]>,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    geometry: ImageGeometry,
    /// Requeue gate. While true, converted buffers go back to the transport;
    /// once the session is stopping they are returned to the pool instead.
    accepting: Mutex<bool>,
    raw: Mutex<Image>,
    demosaic: Arc<dyn Demosaic>,
    config: GrabberConfig,
    /// Consumer-side transport error that ended the session.
    fault: Mutex<Option<GrabError>>,
}

/// Marks a slot as being converted and hands it back when dropped, including
/// when the conversion panics.
struct Converting<'a, T: Transport> {
    session: &'a Session<T>,
    slot: &'a Slot,
}

impl<T: Transport> Drop for Converting<'_, T> {
    fn drop(&mut self) {
        self.session.release(self.slot);
    }
}

impl<T: Transport> Session<T> {
    fn check_output(&self, output: &Image) -> Result<()> {
        if output.format() != RGB3 && output.format() != RGBA {
            return Err(GrabError::Image(format!(
                "output must be RGB3 or RGBA, not {}",
                output.format()
            )));
        }
        if output.width() != self.geometry.width || output.height() != self.geometry.height {
            return Err(GrabError::Image(format!(
                "output is {}x{} but camera delivers {}x{}",
                output.width(),
                output.height(),
                self.geometry.width,
                self.geometry.height
            )));
        }
        Ok(())
    }

    fn convert(&self, slot: &Slot, output: &mut Image) -> Result<()> {
        let mut raw = self.raw.lock();
        {
            let data = slot.buffer().lock();
            raw.copy_from(&data);
        }
        self.demosaic
            .convert(&raw, self.config.pattern, &self.config.white_balance, output)
    }

    /// Hands a converted buffer back, to the transport if the session is
    /// still running and to the pool otherwise.
    ///
    /// If the transport refuses the buffer the slot is left `Idle` and the
    /// session is ended: the acquisition thread is told to stop and
    /// `stop_capture` reports the error.
    fn release(&self, slot: &Slot) {
        let mut accepting = self.accepting.lock();
        if !*accepting {
            let _ = slot.transition(SlotState::Converting, SlotState::Idle);
            trace!(slot = slot.index(), "returned to pool");
            return;
        }

        if let Err(e) = requeue(self.transport.as_ref(), &self.handles, slot, SlotState::Converting) {
            error!(slot = slot.index(), "re-queue failed, ending capture: {}", e);
            *accepting = false;
            self.stop.store(true, Ordering::Release);
            self.fault.lock().get_or_insert(e);
        }
    }

    fn busy_slots(&self) -> usize {
        self.pool.count(SlotState::Mailed) + self.pool.count(SlotState::Converting)
    }

    /// Takes every buffer back from the transport and releases the channel.
    /// The acquisition thread must already have exited.
    fn teardown(&self) {
        *self.accepting.lock() = false;

        if let Some(index) = self.mailbox.clear() {
            if let Some(slot) = self.pool.get(index) {
                let _ = slot.transition(SlotState::Mailed, SlotState::Idle);
            }
        }

        if let Err(e) = self.transport.cancel_all() {
            warn!("cancel failed: {}", e);
        }
        self.drain();

        // A consumer may still be reading a buffer it took before the gate
        // closed; it returns the slot to Idle when done.
        let limit = (self.config.wait_timeout * 2).max(MIN_RELEASE_WAIT);
        let start = Instant::now();
        while self.busy_slots() > 0 {
            if start.elapsed() > limit {
                warn!(
                    busy = self.busy_slots(),
                    elapsed = ?start.elapsed(),
                    "conversion still holds buffers, deregistering anyway"
                );
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        let queued = self.pool.count(SlotState::Queued);
        if queued > 0 {
            warn!(queued, "transport did not report every cancelled buffer");
        }

        for (index, handle) in self.handles.iter().enumerate() {
            if let Err(e) = self.transport.deregister(*handle) {
                warn!(slot = index, %handle, "deregister failed: {}", e);
            }
        }
        self.transport.close();

        for slot in self.pool.iter() {
            slot.reset();
        }
        debug!("session torn down");
    }

    fn drain(&self) {
        loop {
            match self.transport.retrieve_result() {
                Ok(Some(result)) => {
                    if let Some(slot) = self.pool.get(result.context) {
                        let _ = slot.transition(SlotState::Queued, SlotState::Idle);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("drain failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl<T: Transport> FrameSource for Session<T> {
    fn pull(&self, output: &mut Image) -> Result<bool> {
        self.check_output(output)?;

        let Some(index) = self.mailbox.try_take() else {
            return Ok(false);
        };
        let Some(slot) = self.pool.get(index) else {
            return Err(GrabError::ProtocolViolation {
                context: index,
                pool_size: self.pool.len(),
            });
        };
        if let Err(actual) = slot.transition(SlotState::Mailed, SlotState::Converting) {
            warn!(slot = index, %actual, "mailbox held a slot that was not mailed");
            return Ok(false);
        }

        let converting = Converting {
            session: self,
            slot,
        };
        let converted = self.convert(slot, output);
        drop(converting);
        converted?;

        self.stats.record_pull();
        trace!(slot = index, "frame pulled");
        Ok(true)
    }
}

/// Cloneable handle for pulling frames from another thread.
///
/// A reader is bound to the capture session that was running when it was
/// created. Once that session stops, [`FrameReader::pull_frame`] always
/// returns `Ok(false)`.
#[derive(Clone)]
pub struct FrameReader {
    session: Weak<dyn FrameSource>,
}

impl FrameReader {
    /// See [`Grabber::pull_frame`].
    pub fn pull_frame(&self, output: &mut Image) -> Result<bool> {
        match self.session.upgrade() {
            Some(session) => session.pull(output),
            None => Ok(false),
        }
    }

    /// True while the session the reader was created from is running.
    pub fn is_live(&self) -> bool {
        self.session.strong_count() > 0
    }
}

/// Latest-frame grabber for one camera.
pub struct Grabber<D: DeviceControl> {
    device: D,
    config: GrabberConfig,
    demosaic: Arc<dyn Demosaic>,
    pool: BufferPool,
    geometry: Option<ImageGeometry>,
    stats: Arc<CaptureStats>,
    session: Option<Arc<Session<D::Channel>>>,
    producer: Option<JoinHandle<Result<()>>>,
}

impl<D: DeviceControl> Grabber<D> {
    /// Creates a grabber using the built-in [`QuadDemosaic`].
    pub fn new(device: D, config: GrabberConfig) -> Self {
        Self {
            device,
            config,
            demosaic: Arc::new(QuadDemosaic::new()),
            pool: BufferPool::new(),
            geometry: None,
            stats: Arc::new(CaptureStats::default()),
            session: None,
            producer: None,
        }
    }

    /// Replaces the demosaic routine used by subsequent capture sessions.
    pub fn with_demosaic(mut self, demosaic: impl Demosaic + 'static) -> Self {
        self.demosaic = Arc::new(demosaic);
        self
    }

    pub fn config(&self) -> &GrabberConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_open(&self) -> bool {
        self.geometry.is_some()
    }

    /// Frame geometry of the open camera.
    pub fn geometry(&self) -> Option<ImageGeometry> {
        self.geometry
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_some()
    }

    /// True if the acquisition thread has exited on its own. This happens
    /// when the stream failed, or when the transport refused a buffer handed
    /// back by [`Grabber::pull_frame`]. [`Grabber::stop_capture`] reports
    /// the cause.
    pub fn producer_finished(&self) -> bool {
        self.producer.as_ref().is_some_and(|p| p.is_finished())
    }

    pub fn stats(&self) -> CaptureCounters {
        self.stats.snapshot()
    }

    /// Ownership state of every pool slot, by slot index.
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.pool.iter().map(Slot::state).collect()
    }

    /// Opens and configures the camera and allocates the buffer pool.
    ///
    /// Opening an open grabber does nothing. On failure the camera is closed
    /// again.
    #[instrument(skip_all, fields(index = self.config.device_index))]
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let count = self.device.enumerate()?;
        let index = self.config.device_index;
        if index >= count {
            return Err(GrabError::NotFound { index, count });
        }
        self.device.open(index)?;

        match self.setup() {
            Ok(geometry) => {
                self.geometry = Some(geometry);
                info!(
                    width = geometry.width,
                    height = geometry.height,
                    buffers = self.pool.len(),
                    "camera opened"
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.pool.free();
                self.device.close();
                warn!("open failed: {}", e);
                Err(e)
            }
        }
    }

    fn setup(&mut self) -> Result<ImageGeometry> {
        let geometry = configure(&mut self.device, &self.config)?;
        let frame = geometry.width as usize * geometry.height as usize;
        if geometry.payload_size < frame {
            warn!(
                payload = geometry.payload_size,
                frame, "payload is smaller than one 8-bit frame"
            );
        }
        self.pool
            .allocate(self.config.buffer_count, geometry.payload_size)?;
        Ok(geometry)
    }

    /// Stops capture if running, closes the camera and frees the pool.
    ///
    /// Safe to call on a closed grabber. The camera is closed even when
    /// stopping fails; the stop error is returned.
    #[instrument(skip_all)]
    pub fn close(&mut self) -> Result<()> {
        let stopped = self.stop_capture();
        if self.geometry.take().is_some() || self.device.is_open() {
            if let Err(e) = self.pool.free() {
                warn!("{}", e);
            }
            self.device.close();
            info!("camera closed");
        }
        stopped
    }

    /// Arms the stream channel and starts the acquisition thread.
    ///
    /// Every transfer buffer is registered and queued before the camera is
    /// told to start. If any step fails the channel is unwound and the
    /// grabber stays open but idle.
    #[instrument(skip_all)]
    pub fn start_capture(&mut self) -> Result<()> {
        let geometry = self.geometry.ok_or(GrabError::NotOpen)?;
        if self.session.is_some() {
            return Err(GrabError::AlreadyStreaming);
        }

        if self.device.stream_channel_count()? == 0 {
            return Err(GrabError::configuration(
                "StreamChannel",
                "camera has no stream channels",
            ));
        }
        let raw = Image::new(geometry.width, geometry.height, self.config.pattern.fourcc())?;
        let transport = Arc::new(self.device.open_channel(0)?);

        let mut handles = Vec::with_capacity(self.pool.len());
        if let Err(e) = arm(&mut self.device, transport.as_ref(), &self.pool, &mut handles) {
            warn!("start failed: {}", e);
            unwind(transport.as_ref(), &self.pool, &handles);
            return Err(e);
        }

        let session = Arc::new(Session {
            transport,
            pool: self.pool.clone(),
            handles: Arc::from(handles),
            mailbox: Arc::new(FrameMailbox::new()),
            stop: Arc::new(AtomicBool::new(false)),
            stats: self.stats.clone(),
            geometry,
            accepting: Mutex::new(true),
            raw: Mutex::new(raw),
            demosaic: self.demosaic.clone(),
            config: self.config.clone(),
            fault: Mutex::new(None),
        });

        let producer = Producer {
            transport: session.transport.clone(),
            pool: session.pool.clone(),
            handles: session.handles.clone(),
            mailbox: session.mailbox.clone(),
            stop: session.stop.clone(),
            stats: session.stats.clone(),
            wait_timeout: self.config.wait_timeout,
        };
        let spawned = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || producer.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("cannot spawn acquisition thread: {}", e);
                let _ = self.device.execute(features::ACQUISITION_STOP);
                session.teardown();
                return Err(e.into());
            }
        };

        self.session = Some(session);
        self.producer = Some(handle);
        info!(buffers = self.pool.len(), "capture started");
        Ok(())
    }

    /// Stops the acquisition thread and returns every buffer to the pool.
    ///
    /// Does nothing when not streaming. Returns the error that ended the
    /// session early, if any; the session is torn down either way. Buffers
    /// still held by a stuck conversion are waited for at most twice the wait
    /// timeout (at least one second) before the channel is released.
    #[instrument(skip_all)]
    pub fn stop_capture(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.stop.store(true, Ordering::Release);
        let res = match self.producer.take() {
            Some(handle) => join_producer(handle, self.config.wait_timeout),
            None => Ok(()),
        };

        if let Err(e) = self.device.execute(features::ACQUISITION_STOP) {
            warn!("{}", e);
        }
        session.teardown();
        info!(counters = ?self.stats.snapshot(), "capture stopped");

        let fault = session.fault.lock().take();
        match fault {
            Some(e) if res.is_ok() => Err(e),
            _ => res,
        }
    }

    /// Converts the most recent frame into `output`.
    ///
    /// Returns `Ok(false)` without touching `output` if no new frame has
    /// arrived since the last pull, or if capture is not running. `output`
    /// must be `RGB3` or `RGBA` and match the camera geometry.
    ///
    /// If the transport refuses the buffer afterwards, the frame is still
    /// returned but capture ends; see [`Grabber::producer_finished`].
    pub fn pull_frame(&self, output: &mut Image) -> Result<bool> {
        match &self.session {
            Some(session) => session.pull(output),
            None => Ok(false),
        }
    }

    /// A handle for pulling frames from the running session on another
    /// thread.
    pub fn reader(&self) -> Option<FrameReader> {
        let session = self.session.as_ref()?;
        let session: Arc<dyn FrameSource> = session.clone();
        Some(FrameReader {
            session: Arc::downgrade(&session),
        })
    }
}

impl<D: DeviceControl> Drop for Grabber<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing grabber: {}", e);
        }
    }
}

/// Registers and queues every buffer, then starts the camera. Registered
/// handles are pushed to `handles` as they are obtained so a failure can be
/// unwound.
fn arm<D: DeviceControl, T: Transport>(
    device: &mut D,
    transport: &T,
    pool: &BufferPool,
    handles: &mut Vec<BufferHandle>,
) -> Result<()> {
    transport.set_buffer_policy(pool.len(), pool.buffer_size())?;
    transport.prepare()?;
    for slot in pool.iter() {
        handles.push(transport.register_buffer(slot.buffer())?);
    }
    for slot in pool.iter() {
        requeue(transport, handles, slot, SlotState::Idle)?;
    }
    device.execute(features::ACQUISITION_START)
}

/// Releases whatever [`arm`] managed to set up.
fn unwind<T: Transport>(transport: &T, pool: &BufferPool, handles: &[BufferHandle]) {
    if let Err(e) = transport.cancel_all() {
        debug!("cancel during unwind: {}", e);
    }
    while let Ok(Some(_)) = transport.retrieve_result() {}
    for handle in handles {
        if let Err(e) = transport.deregister(*handle) {
            debug!(%handle, "deregister during unwind: {}", e);
        }
    }
    transport.close();
    for slot in pool.iter() {
        slot.reset();
    }
}

/// Waits for the acquisition thread, polling so a stuck transport shows up
/// in the logs.
fn join_producer(handle: JoinHandle<Result<()>>, wait_timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let mut warned = false;
    while !handle.is_finished() {
        if !warned && start.elapsed() > wait_timeout * 2 {
            warn!(elapsed = ?start.elapsed(), "acquisition thread is slow to stop");
            warned = true;
        }
        thread::sleep(JOIN_POLL.min(wait_timeout));
    }

    match handle.join() {
        Ok(res) => res,
        Err(_) => Err(io::Error::other("acquisition thread panicked").into()),
    }
}
