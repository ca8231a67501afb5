// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_grabber::{
    config::{features, GrabberConfig},
    demosaic::{BayerPattern, Demosaic, QuadDemosaic, WhiteBalance},
    error::GrabError,
    grabber::Grabber,
    image::{Image, RGB3, RGBA},
    pool::SlotState,
    sim::{SimDevice, SimEvent},
    transport::{DeviceControl, GrabResult, GrabStatus},
};
use serial_test::serial;
use std::{
    error::Error,
    sync::{mpsc, Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

fn config(wait_ms: u64) -> GrabberConfig {
    GrabberConfig {
        wait_timeout: Duration::from_millis(wait_ms),
        ..Default::default()
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn streaming(device: SimDevice) -> Result<Grabber<SimDevice>, Box<dyn Error>> {
    let mut grabber = Grabber::new(device, config(20));
    grabber.open()?;
    grabber.start_capture()?;
    Ok(grabber)
}

#[test]
#[serial]
fn test_latest_frame_held() -> Result<(), Box<dyn Error>> {
    let mut grabber = streaming(SimDevice::new(640, 480))?;
    let transport = grabber.device().transport();
    assert_eq!(grabber.slot_states(), vec![SlotState::Queued; 8]);

    assert!(transport.complete(2));
    wait_for("slot 2 mailed", || grabber.slot_states()[2] == SlotState::Mailed);

    assert!(transport.complete(5));
    wait_for("slot 5 re-queued", || grabber.stats().dropped == 1);
    assert!(transport.is_queued(5));

    // A second completion for the parked slot is ignored.
    transport.inject(GrabResult {
        context: 2,
        status: GrabStatus::Grabbed,
        payload_len: 640 * 480,
    });
    wait_for("duplicate handled", || grabber.stats().completed == 3);

    assert_eq!(grabber.slot_states()[2], SlotState::Mailed);
    assert_eq!(transport.queue_count(2), 1);
    assert_eq!(transport.queue_count(5), 2);
    assert!(!transport.is_queued(2));

    let mut rgb = Image::new(640, 480, RGB3)?;
    assert!(grabber.pull_frame(&mut rgb)?);
    // First colour bar is white, blue boosted by the default white balance.
    assert_eq!(&rgb.as_slice()[..3], &[235, 235, 255]);
    assert!(transport.is_queued(2));
    assert_eq!(transport.queue_count(2), 2);
    assert!(!grabber.pull_frame(&mut rgb)?);

    let counters = grabber.stats();
    assert_eq!(counters.published, 1);
    assert_eq!(counters.pulled, 1);

    grabber.close()?;
    Ok(())
}

#[test]
#[serial]
fn test_empty_pull_leaves_output() -> Result<(), Box<dyn Error>> {
    let grabber = streaming(SimDevice::new(64, 48))?;
    let mut rgba = Image::new(64, 48, RGBA)?;
    rgba.as_slice_mut().fill(7);

    assert!(!grabber.pull_frame(&mut rgba)?);
    assert!(rgba.as_slice().iter().all(|&v| v == 7));
    Ok(())
}

#[test]
#[serial]
fn test_slot_zero_round_trip() -> Result<(), Box<dyn Error>> {
    let mut grabber = streaming(SimDevice::new(64, 48))?;
    let transport = grabber.device().transport();

    assert!(transport.complete(0));
    wait_for("slot 0 mailed", || grabber.slot_states()[0] == SlotState::Mailed);

    let mut rgb = Image::new(64, 48, RGB3)?;
    assert!(grabber.pull_frame(&mut rgb)?);
    assert_eq!(grabber.slot_states()[0], SlotState::Queued);
    assert_eq!(transport.queue_count(0), 2);

    grabber.stop_capture()?;
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    Ok(())
}

/// Blocks inside the conversion until the test lets it continue.
struct BlockingDemosaic(Arc<Barrier>);

impl Demosaic for BlockingDemosaic {
    fn convert(
        &self,
        raw: &Image,
        pattern: BayerPattern,
        white_balance: &WhiteBalance,
        output: &mut Image,
    ) -> edgefirst_grabber::Result<()> {
        self.0.wait();
        self.0.wait();
        QuadDemosaic.convert(raw, pattern, white_balance, output)
    }
}

#[test]
#[serial]
fn test_stop_during_pull() -> Result<(), Box<dyn Error>> {
    let barrier = Arc::new(Barrier::new(2));
    let mut grabber = Grabber::new(SimDevice::new(64, 48), config(20))
        .with_demosaic(BlockingDemosaic(barrier.clone()));
    grabber.open()?;
    grabber.start_capture()?;
    let transport = grabber.device().transport();

    assert!(transport.complete(3));
    wait_for("slot 3 mailed", || grabber.slot_states()[3] == SlotState::Mailed);

    let reader = grabber.reader().ok_or("not streaming")?;
    let consumer = thread::spawn(move || {
        let mut rgb = Image::new(64, 48, RGB3)?;
        reader.pull_frame(&mut rgb)
    });

    // The consumer is now converting slot 3.
    barrier.wait();
    assert_eq!(grabber.slot_states()[3], SlotState::Converting);

    let releaser = {
        let barrier = barrier.clone();
        let transport = transport.clone();
        thread::spawn(move || {
            wait_for("cancel", || transport.events().contains(&SimEvent::CancelAll));
            let early = transport
                .events()
                .iter()
                .any(|e| matches!(e, SimEvent::Deregistered { .. }));
            barrier.wait();
            early
        })
    };

    grabber.stop_capture()?;

    assert!(!releaser.join().map_err(|_| "releaser panicked")?);
    assert!(consumer.join().map_err(|_| "consumer panicked")??);

    let events = transport.events();
    let cancel = events
        .iter()
        .position(|e| *e == SimEvent::CancelAll)
        .ok_or("no cancel")?;
    assert!(!events[cancel..]
        .iter()
        .any(|e| matches!(e, SimEvent::Queued { .. })));
    assert_eq!(transport.registered_count(), 0);
    assert!(transport.is_closed());
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    Ok(())
}

/// Fails every conversion by panicking.
struct PanickingDemosaic;

impl Demosaic for PanickingDemosaic {
    fn convert(
        &self,
        _raw: &Image,
        _pattern: BayerPattern,
        _white_balance: &WhiteBalance,
        _output: &mut Image,
    ) -> edgefirst_grabber::Result<()> {
        panic!("conversion failed");
    }
}

#[test]
#[serial]
fn test_panicking_conversion_returns_slot() -> Result<(), Box<dyn Error>> {
    let mut grabber =
        Grabber::new(SimDevice::new(64, 48), config(20)).with_demosaic(PanickingDemosaic);
    grabber.open()?;
    grabber.start_capture()?;
    let transport = grabber.device().transport();

    assert!(transport.complete(1));
    wait_for("slot 1 mailed", || grabber.slot_states()[1] == SlotState::Mailed);

    let reader = grabber.reader().ok_or("not streaming")?;
    let consumer = thread::spawn(move || {
        let mut rgb = Image::new(64, 48, RGB3).unwrap();
        let _ = reader.pull_frame(&mut rgb);
    });
    assert!(consumer.join().is_err());

    assert_eq!(grabber.slot_states()[1], SlotState::Queued);
    assert_eq!(transport.queue_count(1), 2);

    // Stop on another thread so a regression fails instead of hanging.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let res = grabber.stop_capture().map_err(|e| e.to_string());
        let _ = tx.send((res, grabber.slot_states()));
    });
    let (res, states) = rx
        .recv_timeout(Duration::from_secs(3))
        .map_err(|_| "stop_capture blocked")?;
    res?;
    assert_eq!(states, vec![SlotState::Idle; 8]);
    assert_eq!(transport.registered_count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_stuck_conversion_bounded_stop() -> Result<(), Box<dyn Error>> {
    let barrier = Arc::new(Barrier::new(2));
    let mut grabber = Grabber::new(SimDevice::new(64, 48), config(20))
        .with_demosaic(BlockingDemosaic(barrier.clone()));
    grabber.open()?;
    grabber.start_capture()?;
    let transport = grabber.device().transport();

    assert!(transport.complete(3));
    wait_for("slot 3 mailed", || grabber.slot_states()[3] == SlotState::Mailed);

    let reader = grabber.reader().ok_or("not streaming")?;
    let consumer = thread::spawn(move || {
        let mut rgb = Image::new(64, 48, RGB3)?;
        reader.pull_frame(&mut rgb)
    });
    barrier.wait();

    // The conversion never finishes while stopping.
    let start = Instant::now();
    grabber.stop_capture()?;
    assert!(start.elapsed() < Duration::from_secs(3), "stop took {:?}", start.elapsed());
    assert!(transport.is_closed());
    assert_eq!(transport.registered_count(), 0);
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);

    barrier.wait();
    assert!(consumer.join().map_err(|_| "consumer panicked")??);
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    Ok(())
}

#[test]
#[serial]
fn test_requeue_failure_ends_capture() -> Result<(), Box<dyn Error>> {
    let mut grabber = streaming(SimDevice::new(64, 48))?;
    let transport = grabber.device().transport();

    assert!(transport.complete(4));
    wait_for("slot 4 mailed", || grabber.slot_states()[4] == SlotState::Mailed);

    transport.fail_next("queue", 0xE100_0004);
    let mut rgb = Image::new(64, 48, RGB3)?;
    // The frame itself was converted and is still delivered.
    assert!(grabber.pull_frame(&mut rgb)?);
    assert_eq!(grabber.slot_states()[4], SlotState::Idle);
    assert_eq!(grabber.stats().pulled, 1);

    wait_for("producer exit", || grabber.producer_finished());
    assert!(matches!(
        grabber.stop_capture(),
        Err(GrabError::Transport { op: "queue", .. })
    ));
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    assert_eq!(transport.registered_count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_cancelled_transfer_mid_stream() -> Result<(), Box<dyn Error>> {
    let mut grabber = streaming(SimDevice::new(64, 48))?;
    let transport = grabber.device().transport();

    assert!(transport.cancel(6));
    wait_for("cancel handled", || grabber.stats().completed == 1);
    assert_eq!(grabber.slot_states()[6], SlotState::Idle);
    assert!(!transport.is_queued(6));

    assert!(transport.complete(2));
    wait_for("slot 2 mailed", || grabber.slot_states()[2] == SlotState::Mailed);
    let mut rgb = Image::new(64, 48, RGB3)?;
    assert!(grabber.pull_frame(&mut rgb)?);
    assert!(!grabber.producer_finished());

    grabber.stop_capture()?;
    assert_eq!(transport.registered_count(), 0);
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    Ok(())
}

#[test]
#[serial]
fn test_stop_latency() -> Result<(), Box<dyn Error>> {
    let timeout = Duration::from_millis(100);
    let mut grabber = Grabber::new(SimDevice::new(64, 48), config(100));
    grabber.open()?;
    grabber.start_capture()?;
    thread::sleep(Duration::from_millis(30));

    let start = Instant::now();
    grabber.stop_capture()?;
    assert!(start.elapsed() < timeout * 4, "stop took {:?}", start.elapsed());
    assert!(!grabber.is_streaming());
    Ok(())
}

#[test]
#[serial]
fn test_start_failure_unwinds() -> Result<(), Box<dyn Error>> {
    let mut grabber = Grabber::new(SimDevice::new(64, 48), config(20));
    grabber.open()?;
    let transport = grabber.device().transport();

    transport.fail_next("register_buffer", 0xE100_0001);
    assert!(matches!(
        grabber.start_capture(),
        Err(GrabError::Transport {
            op: "register_buffer",
            ..
        })
    ));
    assert!(grabber.is_open());
    assert!(!grabber.is_streaming());
    assert!(transport.is_closed());
    assert_eq!(transport.registered_count(), 0);
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);

    // The failure was one-shot, so the next attempt succeeds.
    grabber.start_capture()?;
    assert!(grabber.is_streaming());
    grabber.close()?;
    Ok(())
}

#[test]
#[serial]
fn test_start_command_rejected() -> Result<(), Box<dyn Error>> {
    let mut grabber = Grabber::new(
        SimDevice::new(64, 48).fail_command(features::ACQUISITION_START),
        config(20),
    );
    grabber.open()?;
    let transport = grabber.device().transport();

    assert!(matches!(
        grabber.start_capture(),
        Err(GrabError::Configuration { .. })
    ));
    assert!(transport.events().contains(&SimEvent::CancelAll));
    assert_eq!(transport.registered_count(), 0);
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    Ok(())
}

#[test]
fn test_open_failures() {
    let mut grabber = Grabber::new(SimDevice::new(64, 48).with_cameras(0), config(20));
    assert!(matches!(
        grabber.open(),
        Err(GrabError::NotFound { index: 0, count: 0 })
    ));

    let mut grabber = Grabber::new(
        SimDevice::new(64, 48),
        GrabberConfig {
            device_index: 1,
            ..Default::default()
        },
    );
    assert!(matches!(grabber.open(), Err(GrabError::NotFound { .. })));

    let mut grabber = Grabber::new(SimDevice::new(64, 48).locked(), config(20));
    assert!(matches!(grabber.open(), Err(GrabError::AccessDenied(0))));

    let mut grabber = Grabber::new(
        SimDevice::new(64, 48).without_feature(features::BAYER_BG8_ENTRY),
        config(20),
    );
    assert!(matches!(
        grabber.open(),
        Err(GrabError::Configuration { .. })
    ));
    assert!(!grabber.is_open());
    assert!(!grabber.device().is_open());
    assert!(grabber.slot_states().is_empty());
}

#[test]
fn test_open_is_idempotent() -> Result<(), Box<dyn Error>> {
    let mut grabber = Grabber::new(SimDevice::new(64, 48), config(20));
    grabber.open()?;
    grabber.open()?;
    let geometry = grabber.geometry().ok_or("not open")?;
    assert_eq!((geometry.width, geometry.height), (64, 48));
    assert_eq!(geometry.payload_size, 64 * 48);

    grabber.close()?;
    grabber.close()?;
    assert!(!grabber.is_open());
    assert!(grabber.geometry().is_none());
    Ok(())
}

#[test]
#[serial]
fn test_start_requirements() -> Result<(), Box<dyn Error>> {
    let mut grabber = Grabber::new(SimDevice::new(64, 48).with_stream_channels(0), config(20));
    grabber.open()?;
    assert!(matches!(
        grabber.start_capture(),
        Err(GrabError::Configuration { .. })
    ));

    let mut grabber = streaming(SimDevice::new(64, 48))?;
    assert!(matches!(
        grabber.start_capture(),
        Err(GrabError::AlreadyStreaming)
    ));
    grabber.stop_capture()?;
    grabber.stop_capture()?;
    Ok(())
}

#[test]
#[serial]
fn test_stream_failure_reported_on_stop() -> Result<(), Box<dyn Error>> {
    let mut grabber = streaming(SimDevice::new(64, 48))?;
    let transport = grabber.device().transport();

    transport.fail_next("wait", 0xE100_0002);
    wait_for("producer exit", || grabber.producer_finished());
    assert!(grabber.is_streaming());

    let err = grabber.stop_capture().err().ok_or("stop should fail")?;
    assert!(err.is_fatal());
    assert!(matches!(err, GrabError::Transport { op: "wait", .. }));
    assert_eq!(grabber.slot_states(), vec![SlotState::Idle; 8]);
    Ok(())
}

#[test]
#[serial]
fn test_drop_while_streaming() -> Result<(), Box<dyn Error>> {
    let grabber = streaming(SimDevice::new(64, 48))?;
    let transport = grabber.device().transport();
    drop(grabber);
    assert!(transport.is_closed());
    assert_eq!(transport.registered_count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_free_running_slow_consumer() -> Result<(), Box<dyn Error>> {
    let device = SimDevice::new(64, 48).with_frame_interval(Duration::from_millis(2));
    let mut grabber = streaming(device)?;

    let reader = grabber.reader().ok_or("not streaming")?;
    let consumer = thread::spawn(move || -> edgefirst_grabber::Result<u64> {
        let mut rgb = Image::new(64, 48, RGB3)?;
        let mut pulled = 0;
        while pulled < 10 {
            if reader.pull_frame(&mut rgb)? {
                pulled += 1;
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(pulled)
    });

    assert_eq!(consumer.join().map_err(|_| "consumer panicked")??, 10);
    grabber.stop_capture()?;

    let counters = grabber.stats();
    assert_eq!(counters.pulled, 10);
    assert!(counters.dropped > 0);
    assert!(counters.completed >= counters.published + counters.dropped);
    Ok(())
}
