use anyhow::Result;

use crate::detect::result::Prediction;

/// Detector backend trait.
///
/// Backends receive packed RGB pixels for one frame and return every
/// prediction they make. Filtering by class and threshold happens later, in
/// one place, so backends must not pre-filter by the dashboard threshold.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// One-time model load. Must succeed before `detect` is called.
    fn initialize(&mut self) -> Result<()>;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the pixel slice as read-only and must not
    /// retain it beyond the call.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Prediction>>;
}
