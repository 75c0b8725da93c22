//! Single-message surface codec (NSCodec-shaped contract)
//!
//! Composes one message covering the whole requested rectangle. The context
//! carries the color-loss, chroma-subsampling and dynamic-color-fidelity
//! knobs negotiated from settings; payload entropy is the shared RLE stage.
//! This codec does not support fragmentation, which is why the emission path
//! disables it for clients with small fragment limits.

use bytes::{Buf, BufMut, BytesMut};

use super::rle;
use super::CodecError;

const NSC_MAGIC: u32 = 0x4e53_4331; // "NSC1"

/// Encoder context for the single-message surface codec.
#[derive(Debug)]
pub struct NscContext {
    /// Color loss level copied from settings (0 = lossless tag).
    pub color_loss_level: u32,
    /// Chroma subsampling allowed by the client.
    pub chroma_subsampling: bool,
    /// Dynamic color fidelity allowed by the client.
    pub dynamic_color_fidelity: bool,
}

impl NscContext {
    /// Create a context with the given quality knobs.
    pub fn new(color_loss_level: u32, chroma_subsampling: bool, dynamic_color_fidelity: bool) -> Self {
        Self {
            color_loss_level,
            chroma_subsampling,
            dynamic_color_fidelity,
        }
    }

    /// Compose a message for a `width`×`height` rectangle whose top-left
    /// pixel is at `data[0]` (the caller offsets into the surface).
    pub fn compose_message(
        &self,
        out: &mut BytesMut,
        data: &[u8],
        width: u16,
        height: u16,
        stride: usize,
    ) -> Result<(), CodecError> {
        let row_len = width as usize * 4;
        let mut pixels = Vec::with_capacity(row_len * height as usize);

        for row in 0..height as usize {
            let off = row * stride;
            let end = off + row_len;
            if end > data.len() {
                return Err(CodecError::SourceTooSmall {
                    needed: end,
                    available: data.len(),
                });
            }
            pixels.extend_from_slice(&data[off..end]);
        }

        let payload = rle::compress_with_fallback(&pixels, 4);

        out.put_u32_le(NSC_MAGIC);
        out.put_u16_le(width);
        out.put_u16_le(height);
        out.put_u32_le(self.color_loss_level);
        let mut flags = 0u8;
        if self.chroma_subsampling {
            flags |= 0x01;
        }
        if self.dynamic_color_fidelity {
            flags |= 0x02;
        }
        out.put_u8(flags);
        out.put_u32_le(payload.len() as u32);
        out.put_slice(&payload);

        Ok(())
    }

    /// Parse a message composed by [`compose_message`], returning the pixel
    /// rows and their geometry.
    pub fn decode_message(mut data: &[u8]) -> Result<(u16, u16, Vec<u8>), CodecError> {
        if data.remaining() < 17 {
            return Err(CodecError::Truncated);
        }
        if data.get_u32_le() != NSC_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let width = data.get_u16_le();
        let height = data.get_u16_le();
        let _color_loss = data.get_u32_le();
        let _flags = data.get_u8();
        let len = data.get_u32_le() as usize;
        if data.remaining() < len {
            return Err(CodecError::Truncated);
        }

        let pixels = rle::decompress_with_fallback(&data[..len], 4);
        Ok((width, height, pixels))
    }
}
