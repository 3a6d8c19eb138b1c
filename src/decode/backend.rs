//! JPEG decode contract: converts compressed bytes into a planar
//! Y,Cb,Cr frame, with a hardware path attempted first and a software
//! fallback.
//!
//! `DecodeBackend` is the seam: a hardware-accelerated implementation can be
//! dropped in without touching [`super::DecodeCache`]. The only
//! implementation carried here is a software one built on the `image`
//! crate, matching `other_examples`'s convention of decoding user-supplied
//! image bytes with `image::load_from_memory` rather than a hand-rolled
//! JPEG parser.

use crate::error::{FutatabiError, FutatabiResult};

/// Planar decode result. Chroma planes are subsampled by `(cx, cy)`
/// relative to luma (`cx=cy=2` for 4:2:0, `cx=2,cy=1` for 4:2:2).
#[derive(Debug, Clone)]
pub struct PlanarFrame {
    pub width: u32,
    pub height: u32,
    pub cx: u32,
    pub cy: u32,
    pub y: Vec<u8>,
    pub cb: Vec<u8>,
    pub cr: Vec<u8>,
    /// Raw Exif APP1 payload, if present.
    pub exif: Vec<u8>,
}

impl PlanarFrame {
    /// The 1x1 black frame substituted when decoding is uncorrectably
    /// broken.
    pub fn black_1x1() -> Self {
        Self {
            width: 1,
            height: 1,
            cx: 1,
            cy: 1,
            y: vec![0],
            cb: vec![128],
            cr: vec![128],
            exif: Vec::new(),
        }
    }
}

pub trait DecodeBackend: Send + Sync {
    /// Attempts a hardware-accelerated decode. `Ok(None)` means "not
    /// available, fall back"; `Err` means the bytes are bad regardless of
    /// path.
    fn try_hardware(&self, _jpeg: &[u8]) -> FutatabiResult<Option<PlanarFrame>> {
        Ok(None)
    }

    fn software(&self, jpeg: &[u8]) -> FutatabiResult<PlanarFrame>;

    /// Full contract: hardware first, software fallback, black frame on
    /// uncorrectable failure.
    fn decode(&self, jpeg: &[u8]) -> PlanarFrame {
        match self.try_hardware(jpeg) {
            Ok(Some(frame)) => return frame,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "hardware JPEG decode failed, falling back to software"),
        }
        match self.software(jpeg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "software JPEG decode failed, substituting black frame");
                PlanarFrame::black_1x1()
            }
        }
    }
}

/// Software-only backend. `try_hardware` keeps the default `Ok(None)`.
pub struct SoftwareJpegBackend;

impl DecodeBackend for SoftwareJpegBackend {
    fn software(&self, jpeg: &[u8]) -> FutatabiResult<PlanarFrame> {
        let exif = extract_exif(jpeg);

        let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
            .map_err(|e| FutatabiError::decode(format!("jpeg decode failed: {e}")))?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();

        // 4:2:2, matching the core's fixed output chroma layout.
        let cx = 2;
        let cy = 1;
        let chroma_width = width.div_ceil(cx);

        let mut y = vec![0u8; (width * height) as usize];
        let mut cb = vec![0u8; (chroma_width * height) as usize];
        let mut cr = vec![0u8; (chroma_width * height) as usize];

        for row in 0..height {
            for col in 0..width {
                let px = rgb.get_pixel(col, row);
                let (yv, cbv, crv) = rgb_to_ycbcr(px[0], px[1], px[2]);
                y[(row * width + col) as usize] = yv;
                if col % cx == 0 {
                    let c_col = col / cx;
                    let idx = (row * chroma_width + c_col) as usize;
                    cb[idx] = cbv;
                    cr[idx] = crv;
                }
            }
        }

        Ok(PlanarFrame {
            width,
            height,
            cx,
            cy,
            y,
            cb,
            cr,
            exif,
        })
    }
}

fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;
    let y = 16.0 + (65.481 * r + 128.553 * g + 24.966 * b) / 255.0;
    let cb = 128.0 + (-37.797 * r - 74.203 * g + 112.0 * b) / 255.0;
    let cr = 128.0 + (112.0 * r - 93.786 * g - 18.214 * b) / 255.0;
    (y.clamp(0.0, 255.0) as u8, cb.clamp(0.0, 255.0) as u8, cr.clamp(0.0, 255.0) as u8)
}

fn extract_exif(jpeg: &[u8]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(jpeg);
    let reader = exif::Reader::new();
    match reader.read_from_container(&mut cursor) {
        Ok(exif_data) => exif_data.buf().to_vec(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFailsHardware;
    impl DecodeBackend for AlwaysFailsHardware {
        fn try_hardware(&self, _jpeg: &[u8]) -> FutatabiResult<Option<PlanarFrame>> {
            Err(FutatabiError::decode("no hardware decoder on this host"))
        }
        fn software(&self, _jpeg: &[u8]) -> FutatabiResult<PlanarFrame> {
            Err(FutatabiError::decode("not a real jpeg"))
        }
    }

    #[test]
    fn uncorrectable_failure_yields_black_frame() {
        let backend = AlwaysFailsHardware;
        let frame = backend.decode(b"not actually jpeg bytes");
        assert_eq!(frame.width, 1);
        assert_eq!(frame.height, 1);
    }
}
