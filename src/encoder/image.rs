//! # Bitmap Images
//!
//! Converts a picture into 1-bit raster bands for the printer.
//!
//! ## Pipeline
//!
//! 1. Flatten to grayscale; fully transparent pixels count as white
//! 2. Threshold at the image's mean luminance (darker than the mean prints)
//! 3. Pack 8 dots per byte, MSB = leftmost dot
//! 4. Emit one `GS v 0` command per band of `band_rows` rows
//!
//! Each band is one chunk, so a long image streams as many small writes.

use std::path::Path;

use image::{DynamicImage, GrayImage, imageops::FilterType};

use super::commands;
use super::text::HEAD_WIDTH_DOTS;
use super::{CharacterEncoding, PayloadEncoder};
use crate::error::TicketlineError;

/// Default rows per raster band
pub const DEFAULT_BAND_ROWS: u16 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapImage {
    width: u16,
    height: u16,
    /// Packed rows, `width_bytes()` per row
    data: Vec<u8>,
    band_rows: u16,
}

impl BitmapImage {
    /// Load an image file, shrinking it to `max_width` dots if wider.
    pub fn open<P: AsRef<Path>>(path: P, max_width: u32) -> Result<Self, TicketlineError> {
        let path = path.as_ref();
        let img = image::open(path).map_err(|e| {
            TicketlineError::Image(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::from_image(&img, max_width)
    }

    pub fn from_image(img: &DynamicImage, max_width: u32) -> Result<Self, TicketlineError> {
        let img = if img.width() > max_width {
            let height = (img.height() as u64 * max_width as u64 / img.width() as u64).max(1);
            img.resize_exact(max_width, height as u32, FilterType::Triangle)
        } else {
            img.clone()
        };

        let rgba = img.to_luma_alpha8();
        let gray = GrayImage::from_fn(img.width(), img.height(), |x, y| {
            let [luma, alpha] = rgba.get_pixel(x, y).0;
            image::Luma([if alpha == 0 { 255 } else { luma }])
        });
        Self::from_gray(&gray)
    }

    /// Threshold a grayscale image at its mean luminance.
    pub fn from_gray(gray: &GrayImage) -> Result<Self, TicketlineError> {
        let width = u16::try_from(gray.width())
            .map_err(|_| TicketlineError::Image(format!("image too wide: {}", gray.width())))?;
        let height = u16::try_from(gray.height())
            .map_err(|_| TicketlineError::Image(format!("image too tall: {}", gray.height())))?;
        if width == 0 || height == 0 {
            return Err(TicketlineError::Image("image is empty".to_string()));
        }

        let total: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
        let mean = (total / (width as u64 * height as u64)) as u8;

        let width_bytes = (width as usize).div_ceil(8);
        let mut data = vec![0u8; width_bytes * height as usize];
        for (x, y, pixel) in gray.enumerate_pixels() {
            if is_dark(pixel.0[0], mean) {
                let idx = y as usize * width_bytes + x as usize / 8;
                data[idx] |= 0x80 >> (x % 8);
            }
        }

        Ok(Self {
            width,
            height,
            data,
            band_rows: DEFAULT_BAND_ROWS,
        })
    }

    /// Rows per emitted band; 1 sends every row as its own chunk.
    pub fn band_rows(mut self, rows: u16) -> Self {
        self.band_rows = rows.max(1);
        self
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn width_bytes(&self) -> usize {
        (self.width as usize).div_ceil(8)
    }

    /// Packed 1-bit rows
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Uniform images print black only when they are dark.
fn is_dark(pixel: u8, mean: u8) -> bool {
    pixel < mean || (pixel == mean && pixel < 128)
}

impl PayloadEncoder for BitmapImage {
    fn encode(&self, _encoding: CharacterEncoding) -> Vec<Vec<u8>> {
        let row_bytes = self.width_bytes();
        self.data
            .chunks(row_bytes * self.band_rows as usize)
            .map(|band| {
                let rows = (band.len() / row_bytes) as u16;
                let mut chunk = commands::raster_header(row_bytes as u16, rows);
                chunk.extend_from_slice(band);
                chunk
            })
            .collect()
    }
}

/// Width to shrink pictures to for a 58mm head.
pub fn default_max_width() -> u32 {
    HEAD_WIDTH_DOTS as u32
}
