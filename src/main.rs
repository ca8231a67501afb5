// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_grabber::{config::GrabberConfig, grabber::Grabber, image::Image, sim::SimDevice};
use std::{
    error::Error,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    LogTracer::init()?;

    let (width, height) = (args.camera_size[0], args.camera_size[1]);
    let device = SimDevice::new(width, height)
        .with_frame_interval(Duration::from_millis(args.frame_interval.max(1)));
    let mut grabber = Grabber::new(device, GrabberConfig::from(&args));

    grabber.open()?;
    grabber.start_capture()?;

    let res = stream(&grabber, &args);

    let stopped = grabber.stop_capture();
    let counters = grabber.stats();
    info!(
        completed = counters.completed,
        published = counters.published,
        dropped = counters.dropped,
        failed = counters.failed,
        pulled = counters.pulled,
        "capture summary"
    );

    let last = res?;
    stopped?;

    match (&args.snapshot, last) {
        (Some(path), Some(img)) => {
            img.save(path)?;
            info!("saved {} to {}", img, path.display());
        }
        (Some(_), None) => warn!("no frame was pulled, snapshot skipped"),
        _ => {}
    }

    grabber.close()?;
    Ok(())
}

/// Pulls frames at the consumer interval until enough have been converted.
/// Returns the last converted frame.
fn stream(grabber: &Grabber<SimDevice>, args: &Args) -> Result<Option<Image>, Box<dyn Error>> {
    let geometry = grabber.geometry().ok_or("camera is not open")?;
    let mut img = Image::new(geometry.width, geometry.height, args.format.into())?;
    let interval = Duration::from_millis(args.consumer_interval);

    let mut pulled = 0;
    let start = Instant::now();
    while pulled < args.frames {
        if grabber.producer_finished() {
            warn!("acquisition ended early");
            break;
        }

        if grabber.pull_frame(&mut img)? {
            pulled += 1;
            debug!(frame = pulled, elapsed = ?start.elapsed(), "pulled {}", img);
        }
        thread::sleep(interval);
    }

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        info!("consumed {} frames at {:.1} fps", pulled, pulled as f64 / elapsed);
    }

    Ok((pulled > 0).then_some(img))
}
