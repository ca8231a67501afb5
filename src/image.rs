// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{GrabError, Result};
use std::{fmt, path::Path};
use tracing::debug;

/// Four character code identifying a pixel format, as used by V4L2.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// 8-bit Bayer mosaic, BGGR order (top-left pixel is blue)
pub const BA81: FourCC = FourCC(*b"BA81");

/// 8-bit Bayer mosaic, GBRG order
pub const GBRG: FourCC = FourCC(*b"GBRG");

/// 8-bit Bayer mosaic, GRBG order
pub const GRBG: FourCC = FourCC(*b"GRBG");

/// 8-bit Bayer mosaic, RGGB order
pub const RGGB: FourCC = FourCC(*b"RGGB");

/// RGB 24-bit pixel format (8 bits per channel, no alpha)
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// Returns true for the single-channel Bayer mosaic formats.
pub const fn is_bayer(format: FourCC) -> bool {
    matches!(&format.0, b"BA81" | b"GBRG" | b"GRBG" | b"RGGB")
}

const fn bytes_per_pixel(format: FourCC) -> Option<usize> {
    match &format.0 {
        b"BA81" | b"GBRG" | b"GRBG" | b"RGGB" => Some(1),
        b"RGB3" => Some(3),
        b"RGBA" => Some(4),
        _ => None,
    }
}

fn image_size(width: u32, height: u32, format: FourCC) -> Result<usize> {
    let bpp = bytes_per_pixel(format)
        .ok_or_else(|| GrabError::Image(format!("unsupported format {}", format)))?;
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(bpp))
        .ok_or_else(|| GrabError::Image(format!("{}x{} {} is too large", width, height, format)))
}

/// Host-memory image buffer.
///
/// Used both as the raw mosaic container handed to the demosaic routine and
/// as the color output the caller passes to
/// [`crate::grabber::Grabber::pull_frame`]. Pixels are packed row-major with
/// no row padding.
///
/// # Example
///
/// ```
/// use edgefirst_grabber::image::{Image, RGB3};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let img = Image::new(640, 480, RGB3)?;
/// assert_eq!(img.size(), 640 * 480 * 3);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Image {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: FourCC,
}

impl Image {
    /// Allocates a zeroed image.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is not supported or the buffer cannot
    /// be reserved.
    pub fn new(width: u32, height: u32, format: FourCC) -> Result<Self> {
        let size = image_size(width, height, format)?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|e| GrabError::Allocation(format!("{}x{} {}: {}", width, height, format, e)))?;
        data.resize(size, 0);
        debug!(width, height, %format, "image allocated");
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    /// Wraps existing pixel data. `data` must be exactly the image size.
    pub fn from_vec(width: u32, height: u32, format: FourCC, data: Vec<u8>) -> Result<Self> {
        let size = image_size(width, height, format)?;
        if data.len() != size {
            return Err(GrabError::Image(format!(
                "{}x{} {} needs {} bytes, got {}",
                width,
                height,
                format,
                size,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> FourCC {
        self.format
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * bytes_per_pixel(self.format).unwrap_or(1)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies `src` into the image. A short source fills the leading bytes
    /// and leaves the remainder untouched. Returns the number of bytes
    /// copied.
    pub fn copy_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Writes the image as PNG. Bayer images are written as greyscale.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let color = match self.format {
            RGB3 => ::image::ExtendedColorType::Rgb8,
            RGBA => ::image::ExtendedColorType::Rgba8,
            _ => ::image::ExtendedColorType::L8,
        };
        ::image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            color,
            ::image::ImageFormat::Png,
        )?;
        Ok(())
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}
