//! Pixel format normalisation for camera buffers.

use anyhow::{anyhow, Result};

use crate::frame::{expected_len, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
    Yuyv,
}

impl PixelFormat {
    /// Map a V4L2 fourcc to a supported format.
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"NV12" => Some(Self::Nv12),
            b"YUYV" => Some(Self::Yuyv),
            _ => None,
        }
    }
}

/// Convert a captured buffer into an RGB `Frame`.
pub(crate) fn to_frame(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Frame> {
    let rgb = match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame too short: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            pixels[..expected].to_vec()
        }
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height)?,
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height)?,
    };
    Ok(Frame::new(rgb, width, height))
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    expected_len(width, height).ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane + y_plane / 2;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame too short: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; rgb_len(width, height)?];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i];
            let uv = y_plane + (j / 2) * w + (i / 2) * 2;
            let offset = (j * w + i) * 3;
            write_yuv(&mut rgb[offset..offset + 3], y, pixels[uv], pixels[uv + 1]);
        }
    }
    Ok(rgb)
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if count % 2 != 0 || pixels.len() < count * 2 {
        return Err(anyhow!(
            "YUYV frame too short: expected {}, got {}",
            count * 2,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; count * 3];
    for (pair, out) in pixels[..count * 2]
        .chunks_exact(4)
        .zip(rgb.chunks_exact_mut(6))
    {
        let (y0, u, y1, v) = (pair[0], pair[1], pair[2], pair[3]);
        write_yuv(&mut out[..3], y0, u, v);
        write_yuv(&mut out[3..], y1, u, v);
    }
    Ok(rgb)
}

fn write_yuv(out: &mut [u8], y: u8, u: u8, v: u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    out[0] = clamp_to_u8(y + 1.402 * v);
    out[1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
    out[2] = clamp_to_u8(y + 1.772 * u);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
