//! Image buffer filled by camera bindings.
//!
//! The buffer is owned by the caller and lent mutably to `GuideCamera::capture`.
//! Bindings never write into it directly while the device is reading out; they
//! assemble a complete frame in scratch storage and swap it in on success, so a
//! failed capture leaves the caller's buffer exactly as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GuideError, GuideResult};

/// Rectangular sensor region, in (binned) pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subframe {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Subframe {
    /// Create a subframe.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Subframe covering a whole sensor.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Whether the region is non-empty and lies within a `width` x `height` sensor.
    pub fn is_valid_for(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    /// Validate against sensor dimensions.
    pub fn validate_for_sensor(&self, width: u32, height: u32) -> GuideResult<()> {
        if self.is_valid_for(width, height) {
            Ok(())
        } else {
            Err(GuideError::InvalidSubframe {
                x: self.x,
                y: self.y,
                width: self.width,
                height: self.height,
                sensor_width: width,
                sensor_height: height,
            })
        }
    }

    /// Number of pixels in the region.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether this region covers the whole `width` x `height` sensor.
    pub fn is_full(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

/// Owned 16-bit image with capture metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    bits_per_pixel: u8,
    pixels: Vec<u16>,
    /// Region that holds valid data when the frame was read as a subframe.
    /// Pixels outside it are zero.
    pub subframe: Option<Subframe>,
    /// Exposure duration of the frame in milliseconds
    pub exposure_ms: u32,
    /// Time the exposure started
    pub timestamp: Option<DateTime<Utc>>,
    /// Sequence number assigned by the camera binding
    pub frame_number: u64,
}

impl Default for ImageBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl ImageBuffer {
    /// Empty buffer with no pixels.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            bits_per_pixel: 16,
            pixels: Vec::new(),
            subframe: None,
            exposure_ms: 0,
            timestamp: None,
            frame_number: 0,
        }
    }

    /// Zero-filled buffer of the given size.
    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Self {
        Self {
            width,
            height,
            bits_per_pixel,
            pixels: vec![0; width as usize * height as usize],
            ..Self::empty()
        }
    }

    /// Build a buffer from existing pixel data.
    pub fn from_pixels(
        width: u32,
        height: u32,
        bits_per_pixel: u8,
        pixels: Vec<u16>,
    ) -> GuideResult<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(GuideError::CaptureFailure(format!(
                "pixel count {} does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            bits_per_pixel,
            pixels,
            ..Self::empty()
        })
    }

    /// Image width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)`
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel depth of the data
    pub fn bits_per_pixel(&self) -> u8 {
        self.bits_per_pixel
    }

    /// Row-major pixel data
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Mutable row-major pixel data
    pub fn pixels_mut(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    /// Whether the buffer holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Pixel at `(x, y)`, if inside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Copy a `region`-sized block of row-major `data` into this image at the
    /// region's offset. The region must lie inside the image.
    pub fn blit(&mut self, region: Subframe, data: &[u16]) -> GuideResult<()> {
        region.validate_for_sensor(self.width, self.height)?;
        if data.len() != region.pixel_count() {
            return Err(GuideError::CaptureFailure(format!(
                "readout returned {} pixels for a {}x{} region",
                data.len(),
                region.width,
                region.height
            )));
        }
        let stride = self.width as usize;
        let row_len = region.width as usize;
        for (row, src) in data.chunks_exact(row_len).enumerate() {
            let start = (region.y as usize + row) * stride + region.x as usize;
            self.pixels[start..start + row_len].copy_from_slice(src);
        }
        Ok(())
    }

    /// Subtract `dark` pixel by pixel, clamping at zero. Dimensions must match.
    pub fn subtract(&mut self, dark: &ImageBuffer) -> GuideResult<()> {
        if dark.dimensions() != self.dimensions() {
            return Err(GuideError::CaptureFailure(format!(
                "dark frame is {}x{}, image is {}x{}",
                dark.width, dark.height, self.width, self.height
            )));
        }
        for (p, d) in self.pixels.iter_mut().zip(dark.pixels.iter()) {
            *p = p.saturating_sub(*d);
        }
        Ok(())
    }
}
