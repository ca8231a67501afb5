// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Grabber settings and the device configuration applied on open.

use crate::{
    acquisition::DEFAULT_WAIT_TIMEOUT,
    demosaic::{BayerPattern, WhiteBalance},
    error::{GrabError, Result},
    pool::DEFAULT_BUFFER_COUNT,
    transport::DeviceControl,
};
use std::time::Duration;
use tracing::{debug, info};

/// GenICam feature names used by the grabber.
pub mod features {
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const BAYER_BG8: &str = "BayerBG8";
    pub const BAYER_BG8_ENTRY: &str = "EnumEntry_PixelFormat_BayerBG8";
    pub const TRIGGER_SELECTOR: &str = "TriggerSelector";
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const ACQUISITION_MODE: &str = "AcquisitionMode";
    pub const PACKET_SIZE: &str = "GevSCPSPacketSize";
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
    pub const FRAME_START: &str = "FrameStart";

    /// Trigger selectors switched to free-running, when the camera has them.
    pub const TRIGGER_SELECTORS: [&str; 2] = [ACQUISITION_START, FRAME_START];

    /// Name of the enumeration entry for `TriggerSelector = selector`.
    pub fn trigger_selector_entry(selector: &str) -> String {
        format!("EnumEntry_TriggerSelector_{}", selector)
    }
}

/// Default GigE Vision stream packet size, which requires jumbo frames on the
/// link.
pub const DEFAULT_PACKET_SIZE: i64 = 8192;

/// Grabber tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct GrabberConfig {
    /// Index of the camera to open.
    pub device_index: usize,
    /// Number of transfer buffers in the pool.
    pub buffer_count: usize,
    /// `GevSCPSPacketSize`, applied only when the camera exposes it.
    pub packet_size: i64,
    /// How long the acquisition thread waits before re-checking the stop
    /// flag.
    pub wait_timeout: Duration,
    pub pattern: BayerPattern,
    pub white_balance: WhiteBalance,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            buffer_count: DEFAULT_BUFFER_COUNT,
            packet_size: DEFAULT_PACKET_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            pattern: BayerPattern::default(),
            white_balance: WhiteBalance::default(),
        }
    }
}

/// Frame geometry read from the camera on open.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per transfer as reported by the camera, which may exceed
    /// `width * height` when chunk data is enabled.
    pub payload_size: usize,
}

fn read_positive(device: &impl DeviceControl, feature: &str) -> Result<i64> {
    if !device.is_feature_readable(feature) {
        return Err(GrabError::configuration(feature, "feature not readable"));
    }
    let value = device.get_integer(feature)?;
    if value < 1 {
        return Err(GrabError::configuration(
            feature,
            format!("invalid value {}", value),
        ));
    }
    Ok(value)
}

fn to_u32(feature: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| GrabError::configuration(feature, format!("{} out of range", value)))
}

/// Applies the acquisition feature set to an open camera and reads the frame
/// geometry.
///
/// The camera is switched to 8-bit BG Bayer output, free-running continuous
/// acquisition and, where supported, the configured stream packet size.
pub fn configure(device: &mut impl DeviceControl, config: &GrabberConfig) -> Result<ImageGeometry> {
    if !device.is_feature_available(features::BAYER_BG8_ENTRY) {
        return Err(GrabError::configuration(
            features::PIXEL_FORMAT,
            "camera does not support BayerBG8",
        ));
    }
    device.set_feature(features::PIXEL_FORMAT, features::BAYER_BG8)?;

    for selector in features::TRIGGER_SELECTORS {
        if !device.is_feature_available(&features::trigger_selector_entry(selector)) {
            debug!(selector, "trigger selector not available");
            continue;
        }
        device.set_feature(features::TRIGGER_SELECTOR, selector)?;
        device.set_feature(features::TRIGGER_MODE, "Off")?;
    }

    device.set_feature(features::ACQUISITION_MODE, "Continuous")?;

    if device.is_feature_writable(features::PACKET_SIZE) {
        device.set_integer(features::PACKET_SIZE, config.packet_size)?;
    } else {
        debug!("packet size not writable, keeping camera default");
    }

    let payload = read_positive(&*device, features::PAYLOAD_SIZE)?;
    let width = read_positive(&*device, features::WIDTH)?;
    let height = read_positive(&*device, features::HEIGHT)?;

    let geometry = ImageGeometry {
        width: to_u32(features::WIDTH, width)?,
        height: to_u32(features::HEIGHT, height)?,
        payload_size: usize::try_from(payload)
            .map_err(|_| GrabError::configuration(features::PAYLOAD_SIZE, "out of range"))?,
    };
    info!(
        width = geometry.width,
        height = geometry.height,
        payload = geometry.payload_size,
        "camera configured"
    );
    Ok(geometry)
}
