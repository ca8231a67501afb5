// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_grabber::{
    config::GrabberConfig,
    demosaic::{BayerPattern, WhiteBalance},
    image::{FourCC, RGB3, RGBA},
};
use std::{path::PathBuf, time::Duration};

/// Colour filter layout of the sensor.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum PatternSetting {
    /// B G / G R
    Bg,
    /// G B / R G
    Gb,
    /// G R / B G
    Gr,
    /// R G / G B
    Rg,
}

impl From<PatternSetting> for BayerPattern {
    fn from(setting: PatternSetting) -> Self {
        match setting {
            PatternSetting::Bg => BayerPattern::BG,
            PatternSetting::Gb => BayerPattern::GB,
            PatternSetting::Gr => BayerPattern::GR,
            PatternSetting::Rg => BayerPattern::RG,
        }
    }
}

/// Pixel format of the converted frames.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum OutputFormat {
    /// 24-bit RGB
    Rgb,
    /// 32-bit RGBA with opaque alpha
    Rgba,
}

impl From<OutputFormat> for FourCC {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Rgb => RGB3,
            OutputFormat::Rgba => RGBA,
        }
    }
}

/// Command-line arguments for the EdgeFirst grabber demo.
///
/// The demo streams from a simulated camera, pulls frames at a fixed
/// consumer rate and reports how many frames were dropped along the way.
/// Arguments can be specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Slow consumer against a 30 fps camera
/// edgefirst-grabber --frame-interval 33 --consumer-interval 200
///
/// # Via environment variables
/// export FRAMES=10
/// export SNAPSHOT=last.png
/// edgefirst-grabber
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Index of the camera to open
    #[arg(short, long, env = "DEVICE", default_value = "0")]
    pub device: usize,

    /// Simulated sensor resolution in pixels (width height)
    #[arg(
        long,
        env = "CAMERA_SIZE",
        default_value = "640 480",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub camera_size: Vec<u32>,

    /// Number of transfer buffers
    #[arg(short, long, env = "BUFFERS", default_value = "8")]
    pub buffers: usize,

    /// GigE Vision stream packet size in bytes
    #[arg(long, env = "PACKET_SIZE", default_value = "8192")]
    pub packet_size: i64,

    /// Acquisition wait timeout in milliseconds
    #[arg(long, env = "WAIT_TIMEOUT", default_value = "1000")]
    pub wait_timeout: u64,

    /// Sensor Bayer pattern
    #[arg(long, env = "BAYER_PATTERN", default_value = "bg", value_enum)]
    pub pattern: PatternSetting,

    /// White balance gains (red green blue)
    #[arg(
        long,
        env = "WHITE_BALANCE",
        default_value = "1.0 1.0 1.45",
        value_delimiter = ' ',
        num_args = 3
    )]
    pub white_balance: Vec<f32>,

    /// Output pixel format
    #[arg(long, env = "FORMAT", default_value = "rgb", value_enum)]
    pub format: OutputFormat,

    /// Simulated camera frame interval in milliseconds
    #[arg(long, env = "FRAME_INTERVAL", default_value = "33")]
    pub frame_interval: u64,

    /// Delay between pulls in milliseconds
    #[arg(long, env = "CONSUMER_INTERVAL", default_value = "100")]
    pub consumer_interval: u64,

    /// Number of frames to pull before exiting
    #[arg(short, long, env = "FRAMES", default_value = "50")]
    pub frames: u64,

    /// Save the last pulled frame as PNG
    #[arg(long, env = "SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl From<&Args> for GrabberConfig {
    fn from(args: &Args) -> Self {
        let mut white_balance = WhiteBalance::default();
        for (gain, arg) in white_balance.0.iter_mut().zip(&args.white_balance) {
            *gain = *arg;
        }

        GrabberConfig {
            device_index: args.device,
            buffer_count: args.buffers,
            packet_size: args.packet_size,
            wait_timeout: Duration::from_millis(args.wait_timeout),
            pattern: args.pattern.into(),
            white_balance,
        }
    }
}
