//! Frame sources.
//!
//! `FrameSource` owns the single active visual input, one of:
//! - `Camera(facing)`: local camera (V4L2 devices with feature camera-v4l2)
//! - `RemoteImage(url)`: continuously updated remote image (MJPEG/JPEG over
//!   HTTP with feature remote-http)
//!
//! Both variants accept `stub://` locations for synthetic input.
//!
//! Switching variants always releases the previous source before the next
//! one is acquired. Acquisition failures are returned as `DashboardError`s;
//! they never reach the control loop's tick path.

pub mod camera;
#[cfg(any(test, feature = "camera-v4l2"))]
mod normalize;
pub mod remote;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CameraSettings;
use crate::error::DashboardError;
use crate::frame::Frame;

pub use camera::{CameraConfig, CameraSource};
pub use remote::{RemoteConfig, RemoteImageSource};

/// Which camera the dashboard is looking through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Environment,
    User,
}

impl Facing {
    pub fn toggled(self) -> Self {
        match self {
            Facing::Environment => Facing::User,
            Facing::User => Facing::Environment,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "environment" => Some(Facing::Environment),
            "user" => Some(Facing::User),
            _ => None,
        }
    }
}

/// A source the dashboard can be switched to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceVariant {
    Camera(Facing),
    RemoteImage(String),
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Serializable description of the active source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub variant: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facing: Option<Facing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub location: String,
    pub width: u32,
    pub height: u32,
    pub healthy: bool,
    pub frames_captured: u64,
}

enum ActiveSource {
    Camera(CameraSource),
    RemoteImage(RemoteImageSource),
}

impl ActiveSource {
    fn next_frame(&mut self) -> anyhow::Result<Frame> {
        match self {
            ActiveSource::Camera(source) => source.next_frame(),
            ActiveSource::RemoteImage(source) => source.next_frame(),
        }
    }

    fn stop(&mut self) {
        match self {
            ActiveSource::Camera(source) => source.stop(),
            ActiveSource::RemoteImage(source) => source.stop(),
        }
    }

    fn is_healthy(&self) -> bool {
        match self {
            ActiveSource::Camera(source) => source.is_healthy(),
            ActiveSource::RemoteImage(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match self {
            ActiveSource::Camera(source) => source.stats(),
            ActiveSource::RemoteImage(source) => source.stats(),
        }
    }
}

pub struct FrameSource {
    settings: CameraSettings,
    facing: Facing,
    active: Option<ActiveSource>,
    dimensions: (u32, u32),
}

impl FrameSource {
    /// No source is acquired until `switch_to`.
    pub fn new(settings: CameraSettings) -> Self {
        let facing = settings.facing;
        Self {
            settings,
            facing,
            active: None,
            dimensions: (0, 0),
        }
    }

    /// Release the current source, then acquire `variant`.
    ///
    /// An empty or unparseable remote URL is rejected before anything is
    /// torn down. On acquisition failure no source is active afterwards.
    pub fn switch_to(&mut self, variant: SourceVariant) -> Result<(), DashboardError> {
        match variant {
            SourceVariant::Camera(facing) => {
                self.facing = facing;
                let device = self.settings.device_for(facing).to_string();
                let config = CameraConfig {
                    device: device.clone(),
                    facing,
                    width: self.settings.width,
                    height: self.settings.height,
                    target_fps: self.settings.target_fps,
                };
                let mut source = CameraSource::new(config).map_err(|e| DashboardError::camera(&e))?;
                self.stop();
                log::info!("FrameSource: acquiring camera {} ({:?})", device, facing);
                source.connect().map_err(|e| DashboardError::camera(&e))?;
                self.active = Some(ActiveSource::Camera(source));
                Ok(())
            }
            SourceVariant::RemoteImage(url) => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(DashboardError::RemoteStreamFailure(
                        "enter a valid stream URL".to_string(),
                    ));
                }
                let mut source = RemoteImageSource::new(RemoteConfig::new(url))
                    .map_err(|e| DashboardError::remote(&e))?;
                self.stop();
                log::info!("FrameSource: connecting to remote stream {}", url);
                source.connect().map_err(|e| DashboardError::remote(&e))?;
                self.active = Some(ActiveSource::RemoteImage(source));
                Ok(())
            }
        }
    }

    /// Flip the camera facing mode and reacquire the camera.
    pub fn switch_camera(&mut self) -> Result<(), DashboardError> {
        self.switch_to(SourceVariant::Camera(self.facing.toggled()))
    }

    /// The current frame, or `None` when no ready frame is available.
    pub fn current(&mut self) -> Option<Frame> {
        let active = self.active.as_mut()?;
        match active.next_frame() {
            Ok(frame) if frame.is_ready() => {
                self.dimensions = frame.dimensions();
                Some(frame)
            }
            Ok(_) => None,
            Err(err) => {
                log::warn!("FrameSource: capture failed: {:#}", err);
                None
            }
        }
    }

    /// Dimensions of the last ready frame.
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    /// True exactly when the user-facing camera is active.
    pub fn mirrored(&self) -> bool {
        matches!(self.active, Some(ActiveSource::Camera(_))) && self.facing == Facing::User
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn variant(&self) -> Option<SourceVariant> {
        match self.active.as_ref()? {
            ActiveSource::Camera(source) => Some(SourceVariant::Camera(source.facing())),
            ActiveSource::RemoteImage(source) => {
                Some(SourceVariant::RemoteImage(source.url().to_string()))
            }
        }
    }

    pub fn describe(&self) -> Option<SourceInfo> {
        let active = self.active.as_ref()?;
        let stats = active.stats();
        let (variant, facing, url) = match active {
            ActiveSource::Camera(source) => ("camera", Some(source.facing()), None),
            ActiveSource::RemoteImage(source) => ("remote", None, Some(source.url().to_string())),
        };
        Some(SourceInfo {
            variant,
            facing,
            url,
            location: stats.source,
            width: self.dimensions.0,
            height: self.dimensions.1,
            healthy: active.is_healthy(),
            frames_captured: stats.frames_captured,
        })
    }

    /// Release the active source, if any.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stop();
        }
        self.dimensions = (0, 0);
    }
}

#[cfg_attr(not(feature = "camera-v4l2"), allow(dead_code))]
pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
