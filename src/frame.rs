//! Frame container.
//!
//! - `Frame`: RGB pixels plus dimensions, produced by a frame source each tick.
//!
//! A frame with zero width or height (or a pixel buffer that does not match its
//! dimensions) is "not ready": the control loop skips detection and rendering
//! for that tick.

use image::RgbImage;
use std::time::{Duration, Instant};

/// Bytes per RGB pixel.
pub const RGB_CHANNELS: usize = 3;

/// One captured frame. Pixels are packed RGB, row-major.
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic capture instant (for staleness checks, not exported).
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    /// A zero-dimension frame (e.g. a camera still negotiating its stream).
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, 0)
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Frame can be drawn and handed to a detector.
    pub fn is_ready(&self) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        expected_len(self.width, self.height) == Some(self.data.len())
    }

    /// Read-only pixel access for detector backends and surfaces.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Copy into an `RgbImage` for drawing. `None` when not ready.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        if !self.is_ready() {
            return None;
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never dump pixel content into logs.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub(crate) fn expected_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimension_frame_is_not_ready() {
        assert!(!Frame::empty().is_ready());
        assert!(!Frame::new(vec![0; 12], 0, 4).is_ready());
    }

    #[test]
    fn mismatched_buffer_is_not_ready() {
        assert!(!Frame::new(vec![0; 10], 2, 2).is_ready());
        assert!(Frame::new(vec![0; 12], 2, 2).is_ready());
    }

    #[test]
    fn rgb_image_round_trip_keeps_dimensions() {
        let image = RgbImage::new(4, 3);
        let frame = Frame::from_rgb_image(image);
        assert_eq!(frame.dimensions(), (4, 3));
        assert!(frame.is_ready());
        let back = frame.to_rgb_image().expect("ready frame converts");
        assert_eq!(back.dimensions(), (4, 3));
    }

    #[test]
    fn debug_output_omits_pixels() {
        let frame = Frame::new(vec![7; 12], 2, 2);
        let text = format!("{:?}", frame);
        assert!(text.contains("bytes: 12"));
        assert!(!text.contains("[7"));
    }
}
