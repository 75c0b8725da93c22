//! Tile-based surface codec (RemoteFX-shaped contract)
//!
//! Splits a rectangle into 64×64 tiles and packs them into one or more
//! messages bounded by the client's maximum fragment size. The entropy stage
//! is run-length coding rather than RLGR, which keeps the messages exactly
//! decodable by [`decode_message`]; the geometry, fragmentation and framing
//! are the contract the emission path relies on.

use bytes::{Buf, BufMut, BytesMut};

use super::region::Rectangle16;
use super::rle;
use super::CodecError;

const RFX_MAGIC: u32 = 0x5246_5831; // "RFX1"

/// Tile edge length in pixels.
pub const TILE_SIZE: usize = 64;

/// Entropy mode tag carried in each message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlgrMode {
    /// One-pass mode
    Rlgr1 = 1,
    /// Three-pass mode
    Rlgr3 = 3,
}

/// Pixel variant the context encodes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfxPixelVariant {
    /// Encode-format memory order `[b, g, r, x]`
    Bgra32,
    /// Encode-format memory order `[r, g, b, x]`
    Rgba32,
}

/// One encoded 64×64 (or edge-cropped) tile.
#[derive(Debug, Clone, PartialEq)]
pub struct RfxTile {
    /// X offset of the tile within the surface
    pub x: u16,
    /// Y offset of the tile within the surface
    pub y: u16,
    /// Tile width (≤ 64, cropped at the surface edge)
    pub width: u16,
    /// Tile height (≤ 64, cropped at the surface edge)
    pub height: u16,
    /// Entropy-coded pixel payload
    pub data: Vec<u8>,
}

impl RfxTile {
    fn encoded_len(&self) -> usize {
        // x, y, w, h + length prefix + payload
        8 + 4 + self.data.len()
    }
}

/// A group of tiles that fits within one wire fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct RfxMessage {
    /// The rectangle this message covers
    pub rect: Rectangle16,
    /// Encoded tiles
    pub tiles: Vec<RfxTile>,
}

/// Encoder context for the tile-based surface codec.
#[derive(Debug)]
pub struct RfxContext {
    mode: RlgrMode,
    variant: RfxPixelVariant,
    width: u16,
    height: u16,
}

impl RfxContext {
    /// Create a context for a surface of the given size.
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            mode: RlgrMode::Rlgr3,
            variant: RfxPixelVariant::Bgra32,
            width,
            height,
        }
    }

    /// Select the entropy mode tag.
    pub fn set_mode(&mut self, mode: RlgrMode) {
        self.mode = mode;
    }

    /// Current entropy mode.
    pub fn mode(&self) -> RlgrMode {
        self.mode
    }

    /// Select the pixel variant encoded from.
    pub fn set_pixel_variant(&mut self, variant: RfxPixelVariant) {
        self.variant = variant;
    }

    /// Current pixel variant.
    pub fn pixel_variant(&self) -> RfxPixelVariant {
        self.variant
    }

    /// Re-seed the context for a new surface geometry.
    pub fn reset(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
    }

    /// Encode `rect` out of a 32bpp surface into messages no larger than
    /// `max_message_size` bytes each.
    ///
    /// `data` is the full surface buffer with `stride` bytes per row. Returns
    /// at least one message for a non-empty rectangle.
    pub fn encode_messages(
        &self,
        rect: &Rectangle16,
        data: &[u8],
        stride: usize,
        max_message_size: usize,
    ) -> Result<Vec<RfxMessage>, CodecError> {
        if rect.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        let mut current: Vec<RfxTile> = Vec::new();
        let mut current_size = 16usize; // message header estimate

        let mut ty = rect.top as usize;
        while ty < rect.bottom as usize {
            let th = TILE_SIZE.min(rect.bottom as usize - ty);
            let mut tx = rect.left as usize;
            while tx < rect.right as usize {
                let tw = TILE_SIZE.min(rect.right as usize - tx);
                let tile = self.encode_tile(data, stride, tx, ty, tw, th)?;

                if !current.is_empty() && current_size + tile.encoded_len() > max_message_size {
                    messages.push(RfxMessage {
                        rect: *rect,
                        tiles: std::mem::take(&mut current),
                    });
                    current_size = 16;
                }

                current_size += tile.encoded_len();
                current.push(tile);
                tx += tw;
            }
            ty += th;
        }

        if !current.is_empty() {
            messages.push(RfxMessage {
                rect: *rect,
                tiles: current,
            });
        }

        Ok(messages)
    }

    fn encode_tile(
        &self,
        data: &[u8],
        stride: usize,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<RfxTile, CodecError> {
        let mut pixels = Vec::with_capacity(width * height * 4);

        for row in 0..height {
            let off = (y + row) * stride + x * 4;
            let end = off + width * 4;
            if end > data.len() {
                return Err(CodecError::SourceTooSmall {
                    needed: end,
                    available: data.len(),
                });
            }
            pixels.extend_from_slice(&data[off..end]);
        }

        Ok(RfxTile {
            x: x as u16,
            y: y as u16,
            width: width as u16,
            height: height as u16,
            data: rle::compress_with_fallback(&pixels, 4),
        })
    }

    /// Serialize a message into `out`. The stream layout is
    /// `magic, mode, variant, tile count, rect, tiles`.
    pub fn write_message(&self, message: &RfxMessage, out: &mut BytesMut) {
        out.put_u32_le(RFX_MAGIC);
        out.put_u8(self.mode as u8);
        out.put_u8(match self.variant {
            RfxPixelVariant::Bgra32 => 0,
            RfxPixelVariant::Rgba32 => 1,
        });
        out.put_u16_le(message.tiles.len() as u16);
        out.put_u16_le(message.rect.left);
        out.put_u16_le(message.rect.top);
        out.put_u16_le(message.rect.right);
        out.put_u16_le(message.rect.bottom);

        for tile in &message.tiles {
            out.put_u16_le(tile.x);
            out.put_u16_le(tile.y);
            out.put_u16_le(tile.width);
            out.put_u16_le(tile.height);
            out.put_u32_le(tile.data.len() as u32);
            out.put_slice(&tile.data);
        }
    }

    /// Parse a message serialized by [`write_message`].
    pub fn decode_message(mut data: &[u8]) -> Result<RfxMessage, CodecError> {
        if data.remaining() < 16 {
            return Err(CodecError::Truncated);
        }
        if data.get_u32_le() != RFX_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let _mode = data.get_u8();
        let _variant = data.get_u8();
        let count = data.get_u16_le() as usize;
        let rect = Rectangle16::new(
            data.get_u16_le(),
            data.get_u16_le(),
            data.get_u16_le(),
            data.get_u16_le(),
        );

        let mut tiles = Vec::with_capacity(count);
        for _ in 0..count {
            if data.remaining() < 12 {
                return Err(CodecError::Truncated);
            }
            let x = data.get_u16_le();
            let y = data.get_u16_le();
            let width = data.get_u16_le();
            let height = data.get_u16_le();
            let len = data.get_u32_le() as usize;
            if data.remaining() < len {
                return Err(CodecError::Truncated);
            }
            let payload = data[..len].to_vec();
            data.advance(len);
            tiles.push(RfxTile {
                x,
                y,
                width,
                height,
                data: payload,
            });
        }

        Ok(RfxMessage { rect, tiles })
    }

    /// Expand a decoded tile back into 32bpp pixel rows.
    pub fn decode_tile_pixels(tile: &RfxTile) -> Vec<u8> {
        rle::decompress_with_fallback(&tile.data, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_surface(width: usize, height: usize, pixel: [u8; 4]) -> Vec<u8> {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_exact_mut(4) {
            px.copy_from_slice(&pixel);
        }
        data
    }

    #[test]
    fn single_tile_round_trips() {
        let ctx = RfxContext::new(64, 64);
        let surface = solid_surface(64, 64, [0x10, 0x20, 0x30, 0xff]);
        let rect = Rectangle16::new(0, 0, 64, 64);

        let messages = ctx
            .encode_messages(&rect, &surface, 64 * 4, 0x3f_0000)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tiles.len(), 1);

        let mut stream = BytesMut::new();
        ctx.write_message(&messages[0], &mut stream);
        let decoded = RfxContext::decode_message(&stream).unwrap();
        assert_eq!(decoded, messages[0]);

        let pixels = RfxContext::decode_tile_pixels(&decoded.tiles[0]);
        assert_eq!(pixels, surface);
    }

    #[test]
    fn tile_grid_covers_rect() {
        let ctx = RfxContext::new(256, 128);
        let surface = solid_surface(256, 128, [1, 2, 3, 0xff]);
        let rect = Rectangle16::new(0, 0, 256, 128);

        let messages = ctx
            .encode_messages(&rect, &surface, 256 * 4, usize::MAX)
            .unwrap();
        let tiles: usize = messages.iter().map(|m| m.tiles.len()).sum();
        assert_eq!(tiles, 4 * 2);
    }

    #[test]
    fn small_fragment_size_splits_messages() {
        let ctx = RfxContext::new(256, 64);
        let surface = solid_surface(256, 64, [9, 9, 9, 0xff]);
        let rect = Rectangle16::new(0, 0, 256, 64);

        // Force one tile per message.
        let messages = ctx.encode_messages(&rect, &surface, 64, 64 * 4).unwrap();
        assert_eq!(messages.len(), 4);
        for message in &messages {
            assert_eq!(message.tiles.len(), 1);
        }
    }

    #[test]
    fn edge_tiles_are_cropped() {
        let ctx = RfxContext::new(80, 80);
        let surface = solid_surface(80, 80, [5, 5, 5, 0xff]);
        let rect = Rectangle16::new(0, 0, 80, 80);

        let messages = ctx
            .encode_messages(&rect, &surface, 80 * 4, usize::MAX)
            .unwrap();
        let tiles: Vec<_> = messages.iter().flat_map(|m| m.tiles.iter()).collect();
        assert_eq!(tiles.len(), 4);
        assert!(tiles.iter().any(|t| t.width == 16 && t.height == 16));
    }
}
