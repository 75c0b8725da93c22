//! Planar bitmap codec
//!
//! Splits a 32bpp tile into color planes and run-length codes each plane
//! separately, the shape the bitmap-update path uses at 32bpp. Honors the
//! skip-alpha negotiation by omitting the alpha plane entirely.

use super::image::PixelFormat;
use super::rle;
use super::CodecError;

/// Encoder context for the planar bitmap codec.
#[derive(Debug)]
pub struct PlanarContext {
    skip_alpha: bool,
    max_width: usize,
    max_height: usize,
}

impl PlanarContext {
    /// Create a context for tiles up to `max_width`×`max_height`.
    pub fn new(skip_alpha: bool, max_width: usize, max_height: usize) -> Self {
        Self {
            skip_alpha,
            max_width,
            max_height,
        }
    }

    /// Whether the alpha plane is omitted.
    pub fn skip_alpha(&self) -> bool {
        self.skip_alpha
    }

    /// Compress a `width`×`height` region whose top-left pixel is at
    /// `data[offset]`, reading `stride` bytes per row.
    ///
    /// Output layout: `[flags: u8]` then per plane `[mode: u8][len: u32 LE][payload]`.
    pub fn compress(
        &self,
        data: &[u8],
        format: PixelFormat,
        width: usize,
        height: usize,
        stride: usize,
        offset: usize,
    ) -> Result<Vec<u8>, CodecError> {
        if width > self.max_width || height > self.max_height {
            return Err(CodecError::TileTooLarge { width, height });
        }
        debug_assert_eq!(format.bytes_per_pixel(), 4);

        let plane_len = width * height;
        let mut planes = [
            Vec::with_capacity(plane_len),
            Vec::with_capacity(plane_len),
            Vec::with_capacity(plane_len),
            Vec::with_capacity(plane_len),
        ];

        for row in 0..height {
            let off = offset + row * stride;
            let end = off + width * 4;
            if end > data.len() {
                return Err(CodecError::SourceTooSmall {
                    needed: end,
                    available: data.len(),
                });
            }
            for px in data[off..end].chunks_exact(4) {
                planes[0].push(px[0]);
                planes[1].push(px[1]);
                planes[2].push(px[2]);
                planes[3].push(px[3]);
            }
        }

        let plane_count = if self.skip_alpha { 3 } else { 4 };
        let mut out = Vec::with_capacity(plane_len);
        let mut flags = 0u8;
        if self.skip_alpha {
            flags |= 0x01;
        }
        out.push(flags);

        for plane in planes.iter().take(plane_count) {
            let packed = rle::compress_with_fallback(plane, 1);
            out.push(packed[0]);
            out.extend_from_slice(&((packed.len() - 1) as u32).to_le_bytes());
            out.extend_from_slice(&packed[1..]);
        }

        Ok(out)
    }

    /// Expand a buffer produced by [`compress`] back into 32bpp pixels.
    /// A skipped alpha plane decodes as opaque.
    pub fn decompress(data: &[u8], width: usize, height: usize) -> Result<Vec<u8>, CodecError> {
        let plane_len = width * height;
        let (&flags, mut rest) = data.split_first().ok_or(CodecError::Truncated)?;
        let skip_alpha = flags & 0x01 != 0;
        let plane_count = if skip_alpha { 3 } else { 4 };

        let mut planes: Vec<Vec<u8>> = Vec::with_capacity(4);
        for _ in 0..plane_count {
            if rest.len() < 5 {
                return Err(CodecError::Truncated);
            }
            let mode = rest[0];
            let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            rest = &rest[5..];
            if rest.len() < len {
                return Err(CodecError::Truncated);
            }
            let mut packed = Vec::with_capacity(len + 1);
            packed.push(mode);
            packed.extend_from_slice(&rest[..len]);
            rest = &rest[len..];

            let plane = rle::decompress_with_fallback(&packed, 1);
            if plane.len() != plane_len {
                return Err(CodecError::Truncated);
            }
            planes.push(plane);
        }
        if skip_alpha {
            planes.push(vec![0xff; plane_len]);
        }

        let mut out = Vec::with_capacity(plane_len * 4);
        for i in 0..plane_len {
            out.push(planes[0][i]);
            out.push(planes[1][i]);
            out.push(planes[2][i]);
            out.push(planes[3][i]);
        }
        Ok(out)
    }
}
