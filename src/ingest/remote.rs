//! Remote pushed-image source.
//!
//! `RemoteImageSource` follows a continuously updating image resource:
//! - `http(s)://` MJPEG multipart streams or single JPEG snapshots (feature: remote-http)
//! - `stub://...` synthetic streams for tests and the demo (`stub://offline`
//!   refuses to connect, `stub://blank` yields zero-dimension frames,
//!   `stub://once` ends after a single frame)
//!
//! Dimensions always come from the most recently decoded image. A transient
//! read error on a connected stream re-serves the last good frame. Once the
//! stream ends the source disconnects and yields no frames until it is
//! activated again.

use anyhow::{anyhow, Context, Result};
#[cfg(feature = "remote-http")]
use std::io::Read;
use std::time::{Duration, Instant};
use url::Url;

use super::SourceStats;
use crate::frame::{expected_len, Frame};

#[cfg(feature = "remote-http")]
const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Frame size produced by synthetic remote streams.
pub const SYNTHETIC_REMOTE_SIZE: (u32, u32) = (320, 240);

/// A cached frame older than this no longer counts as a healthy stream.
const STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Stream URL. Supported schemes: http(s):// and stub://.
    pub url: String,
}

impl RemoteConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

pub struct RemoteImageSource {
    backend: RemoteBackend,
    url: String,
    last_frame: Option<Frame>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum RemoteBackend {
    Synthetic(SyntheticRemote),
    #[cfg(feature = "remote-http")]
    Http(HttpRemote),
}

impl RemoteImageSource {
    /// Validate the URL and pick a backend. Nothing is fetched until `connect`.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .with_context(|| format!("invalid stream URL '{}'", config.url))?;
        let backend = match url.scheme() {
            "stub" => RemoteBackend::Synthetic(SyntheticRemote::new(&config.url)),
            "http" | "https" => http_backend(&config)?,
            other => {
                return Err(anyhow!(
                    "unsupported stream scheme '{}'; expected http(s)",
                    other
                ))
            }
        };
        Ok(Self {
            backend,
            url: config.url,
            last_frame: None,
            last_frame_at: None,
            frame_count: 0,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RemoteBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "remote-http")]
            RemoteBackend::Http(source) => source.connect(),
        }?;
        log::info!("RemoteImageSource: connected to {}", self.url);
        Ok(())
    }

    /// Latest image from the stream.
    pub fn next_frame(&mut self) -> Result<Frame> {
        let fetched = match &mut self.backend {
            RemoteBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "remote-http")]
            RemoteBackend::Http(source) => source.next_frame(),
        };
        match fetched {
            Ok(frame) => {
                self.frame_count += 1;
                self.last_frame_at = Some(Instant::now());
                self.last_frame = Some(frame.clone());
                Ok(frame)
            }
            Err(err) if !self.is_connected() => {
                self.last_frame = None;
                Err(err)
            }
            Err(err) => match &self.last_frame {
                Some(cached) => {
                    log::warn!(
                        "RemoteImageSource: {} read failed, reusing last frame: {:#}",
                        self.url,
                        err
                    );
                    Ok(cached.clone())
                }
                None => Err(err),
            },
        }
    }

    pub fn stop(&mut self) {
        let was_connected = self.is_connected();
        match &mut self.backend {
            RemoteBackend::Synthetic(source) => source.connected = false,
            #[cfg(feature = "remote-http")]
            RemoteBackend::Http(source) => source.stream = None,
        }
        self.last_frame = None;
        if was_connected {
            log::info!("RemoteImageSource: disconnected from {}", self.url);
        }
    }

    fn is_connected(&self) -> bool {
        match &self.backend {
            RemoteBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "remote-http")]
            RemoteBackend::Http(source) => source.stream.is_some(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_connected()
    }

    pub fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= STALE_AFTER,
            None => true,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

impl Drop for RemoteImageSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "remote-http")]
fn http_backend(config: &RemoteConfig) -> Result<RemoteBackend> {
    Ok(RemoteBackend::Http(HttpRemote::new(&config.url)))
}

#[cfg(not(feature = "remote-http"))]
fn http_backend(config: &RemoteConfig) -> Result<RemoteBackend> {
    Err(anyhow!(
        "stream {} requires the remote-http feature",
        config.url
    ))
}

// ----------------------------------------------------------------------------
// Synthetic stream (stub://)
// ----------------------------------------------------------------------------

struct SyntheticRemote {
    url: String,
    connected: bool,
    tick: u64,
}

impl SyntheticRemote {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            connected: false,
            tick: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.url == "stub://offline" {
            return Err(anyhow!("stream {} is not reachable", self.url));
        }
        self.connected = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("stream {} not connected", self.url));
        }
        self.tick += 1;
        if self.url == "stub://once" && self.tick > 1 {
            self.connected = false;
            return Err(anyhow!("stream {} ended", self.url));
        }
        if self.url == "stub://blank" {
            return Ok(Frame::empty());
        }
        let (width, height) = SYNTHETIC_REMOTE_SIZE;
        let len = expected_len(width, height)
            .ok_or_else(|| anyhow!("synthetic frame dimensions overflow"))?;
        let shade = (self.tick % 256) as u8;
        Ok(Frame::new(vec![shade; len], width, height))
    }
}

// ----------------------------------------------------------------------------
// HTTP MJPEG / JPEG snapshot
// ----------------------------------------------------------------------------

#[cfg(feature = "remote-http")]
struct HttpRemote {
    url: String,
    stream: Option<HttpStream>,
}

#[cfg(feature = "remote-http")]
enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

#[cfg(feature = "remote-http")]
impl HttpRemote {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let response = ureq::get(&self.url)
            .call()
            .with_context(|| format!("connect to stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("stream {} not connected", self.url))?;
        let jpeg = match stream {
            HttpStream::Mjpeg(mjpeg) => match mjpeg.read_next_jpeg()? {
                Some(jpeg) => jpeg,
                None => {
                    self.stream = None;
                    return Err(anyhow!("stream {} ended", self.url));
                }
            },
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.url)?,
        };
        decode_jpeg(&jpeg)
    }
}

#[cfg(feature = "remote-http")]
struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

#[cfg(feature = "remote-http")]
impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// `None` once the server closed the stream.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

#[cfg(feature = "remote-http")]
fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

#[cfg(feature = "remote-http")]
fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(Frame::from_rgb_image(image.into_rgb8()))
}

/// Locate the first complete SOI..EOI JPEG in `buffer`.
#[cfg_attr(not(feature = "remote-http"), allow(dead_code))]
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_stream_reports_image_dimensions() -> Result<()> {
        let mut source = RemoteImageSource::new(RemoteConfig::new("stub://cam-1"))?;
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!(frame.dimensions(), SYNTHETIC_REMOTE_SIZE);
        assert!(source.is_healthy());
        Ok(())
    }

    #[test]
    fn offline_stream_fails_to_connect() -> Result<()> {
        let mut source = RemoteImageSource::new(RemoteConfig::new("stub://offline"))?;
        assert!(source.connect().is_err());
        assert!(!source.is_active());
        Ok(())
    }

    #[test]
    fn unsupported_scheme_is_rejected_up_front() {
        assert!(RemoteImageSource::new(RemoteConfig::new("ftp://cam/stream")).is_err());
        assert!(RemoteImageSource::new(RemoteConfig::new("not a url")).is_err());
    }

    #[test]
    fn stop_disconnects() -> Result<()> {
        let mut source = RemoteImageSource::new(RemoteConfig::new("stub://cam-1"))?;
        source.connect()?;
        source.next_frame()?;
        source.stop();
        assert!(!source.is_active());
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn ended_stream_stops_serving_cached_frame() -> Result<()> {
        let mut source = RemoteImageSource::new(RemoteConfig::new("stub://once"))?;
        source.connect()?;
        assert!(source.next_frame()?.is_ready());

        assert!(source.next_frame().is_err());
        assert!(!source.is_active());
        assert!(!source.is_healthy());
        assert!(source.next_frame().is_err());
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn jpeg_bounds_found_inside_multipart_noise() {
        let mut buffer = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let start = buffer.len();
        buffer.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        buffer.extend_from_slice(b"\r\n--frame");
        assert_eq!(find_jpeg_bounds(&buffer), Some((start, start + 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]), None);
    }
}
