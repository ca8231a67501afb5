// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::io;
use thiserror::Error;

/// Errors reported by the grabber and its collaborators.
///
/// "No new frame yet" is not an error: [`crate::grabber::Grabber::pull_frame`]
/// reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum GrabError {
    /// The device rejected a feature write, or a required feature is missing.
    #[error("configuration of {feature} failed: {reason}")]
    Configuration { feature: String, reason: String },

    /// The buffer pool could not be sized or released.
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    /// A transport call returned an error code.
    #[error("transport {op} failed with code {code:#x}")]
    Transport { op: &'static str, code: u32 },

    /// The transport reported a buffer context outside the pool.
    #[error("transport returned buffer context {context} outside pool of {pool_size}")]
    ProtocolViolation { context: usize, pool_size: usize },

    #[error("no camera at index {index} ({count} found)")]
    NotFound { index: usize, count: usize },

    #[error("camera at index {0} is already in use")]
    AccessDenied(usize),

    #[error("camera is not open")]
    NotOpen,

    #[error("capture is already running")]
    AlreadyStreaming,

    /// Output image does not match the session geometry or format.
    #[error("image error: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GrabError {
    pub fn configuration(feature: &str, reason: impl Into<String>) -> Self {
        GrabError::Configuration {
            feature: feature.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that mean the stream itself is unusable, as opposed
    /// to a bad argument from the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GrabError::Transport { .. } | GrabError::ProtocolViolation { .. }
        )
    }
}

pub type Result<T, E = GrabError> = std::result::Result<T, E>;
