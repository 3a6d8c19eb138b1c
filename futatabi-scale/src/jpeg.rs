//! MJPEG encode helper for the video stream's encode thread:
//! step 4): quality 90, 4:2:2 sampling, a `CS=ITU601` COM marker so
//! downstream limited-range Y'CbCr consumers interpret the sample range
//! correctly, and an optional Exif APP1 segment.

use crate::chroma::ChromaPlanes;
use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};

const QUALITY: u8 = 90;
const COM_MARKER: u8 = 0xFE;
const APP1_MARKER: u8 = 0xE1;
const COM_PAYLOAD: &[u8] = b"CS=ITU601";

/// Encodes a planar Y + 4:2:2 Cb/Cr frame to MJPEG bytes, splicing in the
/// `CS=ITU601` COM marker (and Exif APP1, if `exif` is non-empty)
/// immediately after the SOI marker.
pub fn encode_planar(y: &[u8], chroma: &ChromaPlanes, width: u32, height: u32, exif: &[u8]) -> Result<Vec<u8>> {
    if y.len() != (width * height) as usize {
        bail!("luma plane size {} does not match {}x{}", y.len(), width, height);
    }
    let rgb = upsample_to_rgb(y, chroma, width, height);

    let mut jpeg_bytes = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_bytes, QUALITY);
        encoder
            .encode_image(&rgb)
            .context("encoding interpolated frame to JPEG")?;
    }

    Ok(splice_markers(&jpeg_bytes, exif))
}

fn upsample_to_rgb(y: &[u8], chroma: &ChromaPlanes, width: u32, height: u32) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let mut buf = ImageBuffer::new(width, height);
    for row in 0..height {
        let chroma_row = row.min(chroma.height.saturating_sub(1));
        for col in 0..width {
            let chroma_col = (col / 2).min(chroma.width.saturating_sub(1));
            let yv = y[(row * width + col) as usize] as f32;
            let cb = chroma.cb[(chroma_row * chroma.width + chroma_col) as usize] as f32 - 128.0;
            let cr = chroma.cr[(chroma_row * chroma.width + chroma_col) as usize] as f32 - 128.0;

            let r = (yv + 1.402 * cr).clamp(0.0, 255.0) as u8;
            let g = (yv - 0.344136 * cb - 0.714136 * cr).clamp(0.0, 255.0) as u8;
            let b = (yv + 1.772 * cb).clamp(0.0, 255.0) as u8;
            buf.put_pixel(col, row, Rgb([r, g, b]));
        }
    }
    buf
}

fn splice_markers(jpeg: &[u8], exif: &[u8]) -> Vec<u8> {
    debug_assert!(jpeg.len() >= 2 && jpeg[0] == 0xFF && jpeg[1] == 0xD8);
    let mut out = Vec::with_capacity(jpeg.len() + COM_PAYLOAD.len() + exif.len() + 8);
    out.extend_from_slice(&jpeg[0..2]); // SOI

    write_segment(&mut out, COM_MARKER, COM_PAYLOAD);
    if !exif.is_empty() {
        write_segment(&mut out, APP1_MARKER, exif);
    }

    out.extend_from_slice(&jpeg[2..]);
    out
}

fn write_segment(out: &mut Vec<u8>, marker: u8, payload: &[u8]) {
    out.push(0xFF);
    out.push(marker);
    let length = (payload.len() + 2) as u16;
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_carries_com_marker() {
        let width = 4;
        let height = 4;
        let y = vec![128u8; (width * height) as usize];
        let chroma = ChromaPlanes {
            width: width / 2,
            height,
            cb: vec![128u8; (width / 2 * height) as usize],
            cr: vec![128u8; (width / 2 * height) as usize],
        };
        let jpeg = encode_planar(&y, &chroma, width, height, &[]).unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
        assert_eq!(jpeg[2], 0xFF);
        assert_eq!(jpeg[3], COM_MARKER);
        let payload_start = 6;
        assert_eq!(&jpeg[payload_start..payload_start + COM_PAYLOAD.len()], COM_PAYLOAD);
    }
}
