//! Interleaved bitmap codec
//!
//! Used for sub-32bpp clients: quantizes each tile down to the client color
//! depth and run-length codes the packed samples. The bitmap-update path
//! selects this codec whenever the negotiated color depth is below 32.

use super::image::{copy_rect, PixelFormat};
use super::rle;
use super::CodecError;

/// Encoder context for the interleaved bitmap codec.
#[derive(Debug, Default)]
pub struct InterleavedContext;

impl InterleavedContext {
    /// Create a context.
    pub fn new() -> Self {
        Self
    }

    /// Compress a `width`×`height` region at `(x, y)` of a 32bpp surface
    /// down to `bits_per_pixel` (15 or 16) and run-length code it.
    #[allow(clippy::too_many_arguments)]
    pub fn compress(
        &self,
        data: &[u8],
        src_format: PixelFormat,
        stride: usize,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        bits_per_pixel: u32,
    ) -> Result<Vec<u8>, CodecError> {
        let target = match bits_per_pixel {
            16 => PixelFormat::Bgr16,
            15 => PixelFormat::ABgr15,
            other => return Err(CodecError::UnsupportedDepth(other)),
        };

        // Quantize into a tight 16bpp buffer, then entropy-code it.
        let mut packed = vec![0u8; width * height * 2];
        let tight_stride = width * 2;

        // copy_rect addresses both buffers in the same coordinate space, so
        // copy row by row into the origin of the tight buffer.
        for row in 0..height {
            let src_off = (y + row) * stride + x * src_format.bytes_per_pixel();
            let src_end = src_off + width * src_format.bytes_per_pixel();
            if src_end > data.len() {
                return Err(CodecError::SourceTooSmall {
                    needed: src_end,
                    available: data.len(),
                });
            }
            copy_rect(
                &mut packed[row * tight_stride..(row + 1) * tight_stride],
                target,
                tight_stride,
                0,
                0,
                width,
                1,
                &data[src_off..src_end],
                src_format,
                width * src_format.bytes_per_pixel(),
            );
        }

        Ok(rle::compress_with_fallback(&packed, 2))
    }

    /// Expand a buffer produced by [`compress`] back into packed samples.
    pub fn decompress(data: &[u8]) -> Vec<u8> {
        rle::decompress_with_fallback(data, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_tile_compresses_and_restores() {
        let ctx = InterleavedContext::new();
        let tile = vec![0xffu8; 64 * 64 * 4];

        let packed = ctx
            .compress(&tile, PixelFormat::XRgb32, 64 * 4, 0, 0, 64, 64, 16)
            .unwrap();
        assert!(packed.len() < 64 * 64 * 2);

        let samples = InterleavedContext::decompress(&packed);
        assert_eq!(samples.len(), 64 * 64 * 2);
        // white quantizes to all-ones in 5-6-5
        assert_eq!(&samples[..2], &0xffffu16.to_le_bytes());
    }

    #[test]
    fn rejects_unsupported_depth() {
        let ctx = InterleavedContext::new();
        let tile = vec![0u8; 16 * 16 * 4];
        assert!(matches!(
            ctx.compress(&tile, PixelFormat::XRgb32, 16 * 4, 0, 0, 16, 16, 24),
            Err(CodecError::UnsupportedDepth(24))
        ));
    }

    #[test]
    fn output_fits_tile_slot() {
        // Worst case must stay under the 64·64·4 staging slot.
        let ctx = InterleavedContext::new();
        let mut tile = vec![0u8; 64 * 64 * 4];
        for (i, b) in tile.iter_mut().enumerate() {
            *b = (i * 37 % 251) as u8;
        }

        let packed = ctx
            .compress(&tile, PixelFormat::XRgb32, 64 * 4, 0, 0, 64, 64, 16)
            .unwrap();
        assert!(packed.len() <= 64 * 64 * 4);
    }
}
