//! Bitmap codec primitives
//!
//! The contract surface the tile encoder drives: region arithmetic, one-pass
//! rectangle copies with pixel format conversion, and the four bitmap codecs
//! (tile-based surface codec, single-message surface codec, planar,
//! interleaved). The encoder owns one context per codec and prepares them
//! lazily as clients negotiate capabilities.

pub mod image;
pub mod interleaved;
pub mod nsc;
pub mod planar;
pub mod region;
pub mod rfx;
mod rle;

pub use image::{copy_rect, PixelFormat};
pub use interleaved::InterleavedContext;
pub use nsc::NscContext;
pub use planar::PlanarContext;
pub use region::{align16_clamped, Rectangle16, Region16};
pub use rfx::{RfxContext, RfxMessage, RfxPixelVariant, RfxTile, RlgrMode, TILE_SIZE};

use thiserror::Error;

/// Errors surfaced by the codec layer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The source buffer does not cover the requested rectangle.
    #[error("source buffer too small: need {needed} bytes, have {available}")]
    SourceTooSmall {
        /// Bytes the read would require
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// A tile exceeded the context's maximum tile geometry.
    #[error("tile {width}x{height} exceeds the context maximum")]
    TileTooLarge {
        /// Requested tile width
        width: usize,
        /// Requested tile height
        height: usize,
    },

    /// The color depth has no interleaved representation.
    #[error("unsupported color depth: {0}")]
    UnsupportedDepth(u32),

    /// A serialized message ended before its declared length.
    #[error("truncated codec message")]
    Truncated,

    /// A serialized message did not start with the expected magic.
    #[error("bad codec message magic")]
    BadMagic,
}
