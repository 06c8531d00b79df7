//! Local camera source.
//!
//! `CameraSource` captures frames from a local camera device. Device paths
//! starting with `stub://` select a synthetic camera used by tests and the
//! demo:
//! - `stub://blank` connects but only ever yields zero-dimension frames
//!   (a camera that has not negotiated its stream yet).
//! - `stub://denied` fails to connect (permission refused / device busy).
//! - any other `stub://` path yields a moving test pattern.
//!
//! Real devices are opened through V4L2 (feature: camera-v4l2).

use anyhow::{anyhow, Result};
#[cfg(feature = "camera-v4l2")]
use anyhow::Context;
#[cfg(feature = "camera-v4l2")]
use ouroboros::self_referencing;
#[cfg(feature = "camera-v4l2")]
use std::time::Instant;

use super::{Facing, SourceStats};
use crate::frame::{expected_len, Frame};

/// Configuration for one camera acquisition.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0") or `stub://...`.
    pub device: String,
    pub facing: Facing,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Requested capture rate; 0 leaves the device default.
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://environment".to_string(),
            facing: Facing::Environment,
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

pub struct CameraSource {
    backend: CameraBackend,
    facing: Facing,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "camera-v4l2")]
    Device(DeviceCamera),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let facing = config.facing;
        if config.device.starts_with("stub://") {
            return Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCamera::new(config)),
                facing,
            });
        }
        Self::device(config)
    }

    #[cfg(feature = "camera-v4l2")]
    fn device(config: CameraConfig) -> Result<Self> {
        let facing = config.facing;
        Ok(Self {
            backend: CameraBackend::Device(DeviceCamera::new(config)),
            facing,
        })
    }

    #[cfg(not(feature = "camera-v4l2"))]
    fn device(config: CameraConfig) -> Result<Self> {
        Err(anyhow!(
            "camera device {} requires the camera-v4l2 feature",
            config.device
        ))
    }

    /// Acquire the device.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::Device(source) => source.connect(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::Device(source) => source.next_frame(),
        }
    }

    /// Release the device. Safe to call more than once.
    pub fn stop(&mut self) {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.stop(),
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::Device(source) => source.stop(),
        }
    }

    pub fn is_active(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::Device(source) => source.state.is_some(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::Device(source) => source.is_healthy(),
        }
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::Device(source) => source.stats(),
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Synthetic camera (stub://)
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    config: CameraConfig,
    connected: bool,
    frame_count: u64,
}

impl SyntheticCamera {
    fn new(config: CameraConfig) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.config.device == "stub://denied" {
            return Err(anyhow!(
                "permission denied for camera {}",
                self.config.device
            ));
        }
        self.connected = true;
        log::info!(
            "CameraSource: connected to {} ({:?}, synthetic)",
            self.config.device,
            self.config.facing
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("camera {} not connected", self.config.device));
        }
        self.frame_count += 1;
        if self.config.device == "stub://blank" {
            return Ok(Frame::empty());
        }
        Ok(Frame::new(
            self.pattern()?,
            self.config.width,
            self.config.height,
        ))
    }

    /// Diagonal gradient that drifts one step per frame.
    fn pattern(&self) -> Result<Vec<u8>> {
        let len = expected_len(self.config.width, self.config.height)
            .ok_or_else(|| anyhow!("synthetic frame dimensions overflow"))?;
        let width = self.config.width.max(1) as usize;
        let mut pixels = vec![0u8; len];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            let v = ((x + y) as u64 + self.frame_count) % 256;
            px[0] = v as u8;
            px[1] = (255 - v) as u8;
            px[2] = (y % 256) as u8;
        }
        Ok(pixels)
    }

    fn stop(&mut self) {
        if self.connected {
            log::info!("CameraSource: released {}", self.config.device);
        }
        self.connected = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// V4L2 device camera
// ----------------------------------------------------------------------------

#[cfg(feature = "camera-v4l2")]
struct DeviceCamera {
    config: CameraConfig,
    state: Option<DeviceCameraState>,
    format: super::normalize::PixelFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[cfg(feature = "camera-v4l2")]
#[self_referencing]
struct DeviceCameraState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "camera-v4l2")]
impl DeviceCamera {
    fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: super::normalize::PixelFormat::Rgb24,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        use super::normalize::PixelFormat;
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open camera {}", self.config.device))?;
        let mut format = device.format().context("read camera format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "CameraSource: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read camera format after set failure")?
            }
        };
        self.format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "camera {} negotiated unsupported pixel format {}",
                self.config.device,
                format.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "CameraSource: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = DeviceCameraStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create camera buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "CameraSource: connected to {} ({}x{}, {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.config.facing
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("camera not connected")?;
        let (buf, meta) = state
            .with_mut(|fields| fields.stream.next())
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                anyhow::Error::new(err).context("capture camera frame")
            })?;
        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };

        let frame = super::normalize::to_frame(
            &buf[..used],
            self.active_width,
            self.active_height,
            self.format,
        )?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            log::info!("CameraSource: released {}", self.config.device);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= super::health_grace(self.config.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(device: &str) -> CameraConfig {
        CameraConfig {
            device: device.to_string(),
            width: 64,
            height: 48,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn synthetic_camera_produces_ready_frames() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://environment"))?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.dimensions(), (64, 48));
        assert!(frame.is_ready());
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn blank_camera_yields_not_ready_frames() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://blank"))?;
        source.connect()?;
        assert!(!source.next_frame()?.is_ready());
        Ok(())
    }

    #[test]
    fn denied_camera_fails_to_connect() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://denied"))?;
        let err = source.connect().unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert!(!source.is_active());
        Ok(())
    }

    #[test]
    fn stopped_camera_refuses_frames() -> Result<()> {
        let mut source = CameraSource::new(stub_config("stub://user"))?;
        source.connect()?;
        source.stop();
        assert!(!source.is_active());
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[cfg(not(feature = "camera-v4l2"))]
    #[test]
    fn device_paths_need_v4l2_feature() {
        assert!(CameraSource::new(stub_config("/dev/video0")).is_err());
    }
}
