// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Latest-Frame Grabber
//!
//! This library continuously acquires raw Bayer frames from a GigE Vision
//! style camera and hands the most recent one, converted to colour, to the
//! application. Frames the application is too slow to consume are dropped
//! rather than queued, so a pulled frame is never older than the newest
//! completed transfer at the time it was parked.
//!
//! ## Features
//!
//! - **Buffer Pool**: A fixed set of transfer buffers with explicit
//!   per-slot ownership, registered once with the stream channel.
//! - **Acquisition Thread**: Waits on the transport with a bounded timeout
//!   and re-queues buffers without ever waiting on the consumer.
//! - **Frame Mailbox**: Single-slot, try-lock exchange of the newest frame.
//! - **Demosaic**: Pluggable colour reconstruction with white-balance gains.
//! - **Simulation**: An in-memory camera for tests, benches and demos.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_grabber::{
//!     config::GrabberConfig,
//!     grabber::Grabber,
//!     image::{Image, RGBA},
//!     sim::SimDevice,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut grabber = Grabber::new(SimDevice::new(1920, 1080), GrabberConfig::default());
//! grabber.open()?;
//! grabber.start_capture()?;
//!
//! let mut rgba = Image::new(1920, 1080, RGBA)?;
//! if grabber.pull_frame(&mut rgba)? {
//!     println!("got {}", rgba);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Camera Backends
//!
//! Vendor SDKs are reached through the [`transport::DeviceControl`] and
//! [`transport::Transport`] traits. The crate ships only the simulated
//! backend in [`sim`].

pub mod acquisition;
pub mod config;
pub mod demosaic;
pub mod error;
pub mod grabber;
pub mod image;
pub mod mailbox;
pub mod pool;
pub mod sim;
pub mod transport;

pub use error::{GrabError, Result};
pub use grabber::{FrameReader, Grabber};
