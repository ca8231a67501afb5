// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Colour reconstruction of raw Bayer frames.
//!
//! The grabber only needs [`Demosaic::convert`]; a vendor imaging library can
//! be plugged in through the trait. [`QuadDemosaic`] is the built-in software
//! implementation.

use crate::{
    error::{GrabError, Result},
    image::{self, FourCC, Image, RGB3, RGBA},
};
use std::fmt;

/// Colour filter array layout, named by the first two pixels of the first
/// row followed by the remaining colour.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BayerPattern {
    /// B G / G R
    #[default]
    BG,
    /// G B / R G
    GB,
    /// G R / B G
    GR,
    /// R G / G B
    RG,
}

impl BayerPattern {
    /// The V4L2 code of the 8-bit mosaic with this layout.
    pub const fn fourcc(self) -> FourCC {
        match self {
            BayerPattern::BG => image::BA81,
            BayerPattern::GB => image::GBRG,
            BayerPattern::GR => image::GRBG,
            BayerPattern::RG => image::RGGB,
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match fourcc {
            image::BA81 => Some(BayerPattern::BG),
            image::GBRG => Some(BayerPattern::GB),
            image::GRBG => Some(BayerPattern::GR),
            image::RGGB => Some(BayerPattern::RG),
            _ => None,
        }
    }

    /// Positions of the red and blue samples within a 2x2 cell, counted
    /// row-major from the top-left.
    const fn red_blue(self) -> (usize, usize) {
        match self {
            BayerPattern::BG => (3, 0),
            BayerPattern::GB => (2, 1),
            BayerPattern::GR => (1, 2),
            BayerPattern::RG => (0, 3),
        }
    }
}

impl fmt::Display for BayerPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BayerPattern::BG => "BayerBG",
            BayerPattern::GB => "BayerGB",
            BayerPattern::GR => "BayerGR",
            BayerPattern::RG => "BayerRG",
        };
        f.write_str(name)
    }
}

/// Per-channel gains applied after reconstruction, in R, G, B order.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WhiteBalance(pub [f32; 3]);

impl WhiteBalance {
    /// Gains of 1.0 on every channel.
    pub const UNITY: WhiteBalance = WhiteBalance([1.0, 1.0, 1.0]);

    fn lut(gain: f32) -> [u8; 256] {
        let mut lut = [0u8; 256];
        for (v, out) in lut.iter_mut().enumerate() {
            *out = (v as f32 * gain).round().clamp(0.0, 255.0) as u8;
        }
        lut
    }
}

impl Default for WhiteBalance {
    /// Gains tuned for the BG sensors this grabber targets, which read cold
    /// under typical indoor lighting.
    fn default() -> Self {
        WhiteBalance([1.0, 1.0, 1.45])
    }
}

/// Converts a raw Bayer frame into a colour image.
pub trait Demosaic: Send + Sync {
    /// Reconstructs `raw` into `output`.
    ///
    /// # Errors
    ///
    /// Returns [`GrabError::Image`] if `raw` is not a Bayer image, the sizes
    /// differ, or `output` is not `RGB3` or `RGBA`.
    fn convert(
        &self,
        raw: &Image,
        pattern: BayerPattern,
        white_balance: &WhiteBalance,
        output: &mut Image,
    ) -> Result<()>;
}

/// Nearest-cell demosaic.
///
/// Each 2x2 cell of the mosaic yields one colour, with green the mean of the
/// cell's two green samples, written to all four output pixels. A trailing
/// odd row or column reuses the colour of its neighbouring cell.
#[derive(Copy, Clone, Debug, Default)]
pub struct QuadDemosaic;

impl QuadDemosaic {
    pub fn new() -> Self {
        QuadDemosaic
    }
}

/// Validates the pair of images handed to a demosaic routine. Returns the
/// output channel count.
pub fn check_images(raw: &Image, output: &Image) -> Result<usize> {
    if !image::is_bayer(raw.format()) {
        return Err(GrabError::Image(format!(
            "raw image must be a Bayer mosaic, not {}",
            raw.format()
        )));
    }
    let channels = match output.format() {
        RGB3 => 3,
        RGBA => 4,
        other => {
            return Err(GrabError::Image(format!(
                "output must be RGB3 or RGBA, not {}",
                other
            )))
        }
    };
    if raw.width() != output.width() || raw.height() != output.height() {
        return Err(GrabError::Image(format!(
            "output is {}x{} but frame is {}x{}",
            output.width(),
            output.height(),
            raw.width(),
            raw.height()
        )));
    }
    if raw.width() < 2 || raw.height() < 2 {
        return Err(GrabError::Image(format!(
            "{}x{} is smaller than one Bayer cell",
            raw.width(),
            raw.height()
        )));
    }
    Ok(channels)
}

impl Demosaic for QuadDemosaic {
    fn convert(
        &self,
        raw: &Image,
        pattern: BayerPattern,
        white_balance: &WhiteBalance,
        output: &mut Image,
    ) -> Result<()> {
        let channels = check_images(raw, output)?;
        let width = raw.width() as usize;
        let height = raw.height() as usize;
        let (red, blue) = pattern.red_blue();
        let [gain_r, gain_g, gain_b] = white_balance.0;
        let luts = [
            WhiteBalance::lut(gain_r),
            WhiteBalance::lut(gain_g),
            WhiteBalance::lut(gain_b),
        ];

        // Origin of the last complete cell along each axis.
        let last_x = (width & !1) - 2;
        let last_y = (height & !1) - 2;

        let src = raw.as_slice();
        let dst = output.as_slice_mut();
        let out_stride = width * channels;

        for y in 0..height {
            let cy = (y & !1).min(last_y);
            let top = &src[cy * width..(cy + 1) * width];
            let bottom = &src[(cy + 1) * width..(cy + 2) * width];
            let row = &mut dst[y * out_stride..(y + 1) * out_stride];

            for (x, px) in row.chunks_exact_mut(channels).enumerate() {
                let cx = (x & !1).min(last_x);
                let cell = [top[cx], top[cx + 1], bottom[cx], bottom[cx + 1]];
                let sum: u16 = cell.iter().map(|&v| v as u16).sum();
                let r = cell[red];
                let b = cell[blue];
                let g = ((sum - r as u16 - b as u16 + 1) / 2) as u8;

                px[0] = luts[0][r as usize];
                px[1] = luts[1][g as usize];
                px[2] = luts[2][b as usize];
                if channels == 4 {
                    px[3] = 255;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mosaic(width: u32, height: u32, pattern: BayerPattern, rgb: (u8, u8, u8)) -> Image {
        let (red, blue) = pattern.red_blue();
        let mut img = Image::new(width, height, pattern.fourcc()).unwrap();
        let w = width as usize;
        for (i, v) in img.as_slice_mut().iter_mut().enumerate() {
            let pos = (i / w % 2) * 2 + i % w % 2;
            *v = if pos == red {
                rgb.0
            } else if pos == blue {
                rgb.2
            } else {
                rgb.1
            };
        }
        img
    }

    #[test]
    fn test_flat_colour_every_pattern() {
        for pattern in [
            BayerPattern::BG,
            BayerPattern::GB,
            BayerPattern::GR,
            BayerPattern::RG,
        ] {
            let raw = mosaic(8, 4, pattern, (200, 100, 50));
            let mut out = Image::new(8, 4, RGB3).unwrap();
            QuadDemosaic
                .convert(&raw, pattern, &WhiteBalance::UNITY, &mut out)
                .unwrap();
            for px in out.as_slice().chunks_exact(3) {
                assert_eq!(px, &[200, 100, 50], "{}", pattern);
            }
        }
    }

    #[test]
    fn test_white_balance_saturates() {
        let raw = mosaic(4, 4, BayerPattern::BG, (10, 20, 200));
        let mut out = Image::new(4, 4, RGBA).unwrap();
        QuadDemosaic
            .convert(&raw, BayerPattern::BG, &WhiteBalance::default(), &mut out)
            .unwrap();
        assert_eq!(&out.as_slice()[..4], &[10, 20, 255, 255]);

        let raw = mosaic(4, 4, BayerPattern::BG, (10, 20, 100));
        QuadDemosaic
            .convert(&raw, BayerPattern::BG, &WhiteBalance::default(), &mut out)
            .unwrap();
        assert_eq!(&out.as_slice()[..4], &[10, 20, 145, 255]);
    }

    #[test]
    fn test_green_is_averaged() {
        // B G / G R with greens 10 and 30.
        let raw = Image::from_vec(2, 2, image::BA81, vec![0, 10, 30, 0]).unwrap();
        let mut out = Image::new(2, 2, RGB3).unwrap();
        QuadDemosaic
            .convert(&raw, BayerPattern::BG, &WhiteBalance::UNITY, &mut out)
            .unwrap();
        assert_eq!(&out.as_slice()[..3], &[0, 20, 0]);
    }

    #[test]
    fn test_odd_edges_reuse_last_cell() {
        let mut raw = mosaic(5, 3, BayerPattern::BG, (0, 0, 0));
        // Red sample of the cell at (2, 0).
        raw.as_slice_mut()[5 + 3] = 90;
        let mut out = Image::new(5, 3, RGB3).unwrap();
        QuadDemosaic
            .convert(&raw, BayerPattern::BG, &WhiteBalance::UNITY, &mut out)
            .unwrap();
        let px = |x: usize, y: usize| out.as_slice()[(y * 5 + x) * 3];
        assert_eq!(px(2, 0), 90);
        assert_eq!(px(4, 0), 90);
        assert_eq!(px(4, 2), 90);
        assert_eq!(px(0, 2), 0);
    }

    #[test]
    fn test_rejects_mismatched_images() {
        let raw = Image::new(4, 4, image::BA81).unwrap();
        let mut small = Image::new(2, 2, RGB3).unwrap();
        assert!(matches!(
            QuadDemosaic.convert(&raw, BayerPattern::BG, &WhiteBalance::UNITY, &mut small),
            Err(GrabError::Image(_))
        ));

        let mut bayer = Image::new(4, 4, image::BA81).unwrap();
        assert!(QuadDemosaic
            .convert(&raw, BayerPattern::BG, &WhiteBalance::UNITY, &mut bayer)
            .is_err());

        let rgb = Image::new(4, 4, RGB3).unwrap();
        let mut out = Image::new(4, 4, RGB3).unwrap();
        assert!(QuadDemosaic
            .convert(&rgb, BayerPattern::BG, &WhiteBalance::UNITY, &mut out)
            .is_err());
    }

    #[test]
    fn test_fourcc_mapping() {
        for pattern in [
            BayerPattern::BG,
            BayerPattern::GB,
            BayerPattern::GR,
            BayerPattern::RG,
        ] {
            assert_eq!(BayerPattern::from_fourcc(pattern.fourcc()), Some(pattern));
        }
        assert_eq!(BayerPattern::from_fourcc(RGB3), None);
    }
}
