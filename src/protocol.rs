//! Guest message-bus wire protocol
//!
//! Messages travel over the router's datagram socket. The datagram source
//! address is the sender's transport-level identity; the datagram body is the
//! 36-byte lower-case UUID followed by the payload, a length-prefixed array
//! of little-endian `u32` words whose first word is the message tag.
//!
//! Outbound messages are built as `u16` vectors by the peers and widened into
//! the same `u32` array format on send.

use thiserror::Error;

use crate::codec::PixelFormat;

/// Protocol version agreed with guests out of band. `Register` calls carrying
/// any other version are refused.
pub const PROTOCOL_VERSION: i32 = 5;

/// Text form of a guest UUID: 36 lower-case bytes.
pub const UUID_LEN: usize = 36;

/// Message tags, first word of every payload.
pub mod tag {
    /// Guest wrote a rectangle of the framebuffer
    pub const DISPLAY_UPDATE: u32 = 1;
    /// Guest changed display geometry or pixel format
    pub const DISPLAY_SWITCH: u32 = 2;
    /// Mouse input toward the guest (outbound only)
    pub const MOUSE: u32 = 3;
    /// Keyboard input toward the guest (outbound only)
    pub const KEYBOARD: u32 = 4;
    /// Display update acknowledgement (outbound only)
    pub const DISPLAY_UPDATE_COMPLETE: u32 = 5;
    /// Guest is shutting down
    pub const SHUTDOWN: u32 = 6;
}

/// Errors raised while decoding guest messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The datagram is shorter than a UUID plus payload header.
    #[error("short frame: {0} bytes")]
    ShortFrame(usize),

    /// The UUID bytes are not valid UTF-8.
    #[error("uuid is not valid utf-8")]
    BadUuid,

    /// The payload's declared word count exceeds the available bytes.
    #[error("payload length mismatch: declared {declared} words, {available} bytes available")]
    LengthMismatch {
        /// Words the header declared
        declared: usize,
        /// Bytes following the header
        available: usize,
    },

    /// The payload is empty or its tag/argument shape is wrong.
    #[error("malformed payload for tag {tag}: expected {expected} words, got {got}")]
    MalformedPayload {
        /// Leading tag word
        tag: u32,
        /// Words the tag requires
        expected: usize,
        /// Words present
        got: usize,
    },

    /// The leading tag word is not part of the protocol.
    #[error("unknown message tag {0}")]
    UnknownTag(u32),
}

/// Serialize a word array as `count, words…`, all little-endian.
pub fn encode_payload(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + words.len() * 4);
    out.extend_from_slice(&(words.len() as u32).to_le_bytes());
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Parse a payload serialized by [`encode_payload`].
pub fn decode_payload(data: &[u8]) -> Result<Vec<u32>, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::ShortFrame(data.len()));
    }
    let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let body = &data[4..];
    if body.len() < count * 4 {
        return Err(ProtocolError::LengthMismatch {
            declared: count,
            available: body.len(),
        });
    }

    Ok(body
        .chunks_exact(4)
        .take(count)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Build a datagram body: UUID text followed by the encoded payload.
pub fn encode_frame(uuid: &str, words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(UUID_LEN + 4 + words.len() * 4);
    out.extend_from_slice(uuid.as_bytes());
    out.extend_from_slice(&encode_payload(words));
    out
}

/// Split a datagram body into the UUID and the decoded word array.
pub fn decode_frame(data: &[u8]) -> Result<(String, Vec<u32>), ProtocolError> {
    if data.len() < UUID_LEN + 4 {
        return Err(ProtocolError::ShortFrame(data.len()));
    }
    let uuid = std::str::from_utf8(&data[..UUID_LEN])
        .map_err(|_| ProtocolError::BadUuid)?
        .to_owned();
    let words = decode_payload(&data[UUID_LEN..])?;
    Ok((uuid, words))
}

/// Widen an outbound `u16` vector into the payload word format.
pub fn widen(words: &[u16]) -> Vec<u32> {
    words.iter().map(|&w| u32::from(w)).collect()
}

/// Typed view of an inbound guest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    /// A dirty rectangle in framebuffer coordinates.
    DisplayUpdate {
        /// Left edge
        x: u32,
        /// Top edge
        y: u32,
        /// Width in pixels
        w: u32,
        /// Height in pixels
        h: u32,
    },
    /// New geometry and pixel format.
    DisplaySwitch {
        /// Pixman format code (see [`GuestFormat`])
        format: u32,
        /// New width
        width: u32,
        /// New height
        height: u32,
    },
    /// The guest is going away.
    Shutdown,
}

impl GuestEvent {
    /// Parse a decoded word array into a typed event.
    pub fn parse(words: &[u32]) -> Result<Self, ProtocolError> {
        let &tag = words.first().ok_or(ProtocolError::MalformedPayload {
            tag: 0,
            expected: 1,
            got: 0,
        })?;

        let need = |n: usize| -> Result<(), ProtocolError> {
            if words.len() < n {
                Err(ProtocolError::MalformedPayload {
                    tag,
                    expected: n,
                    got: words.len(),
                })
            } else {
                Ok(())
            }
        };

        match tag {
            tag::DISPLAY_UPDATE => {
                need(5)?;
                Ok(GuestEvent::DisplayUpdate {
                    x: words[1],
                    y: words[2],
                    w: words[3],
                    h: words[4],
                })
            }
            tag::DISPLAY_SWITCH => {
                need(4)?;
                Ok(GuestEvent::DisplaySwitch {
                    format: words[1],
                    width: words[2],
                    height: words[3],
                })
            }
            tag::SHUTDOWN => Ok(GuestEvent::Shutdown),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Guest pixel formats, numeric codes from the canonical pixman set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum GuestFormat {
    /// 32bpp RGBA byte order
    r8g8b8a8,
    /// 32bpp RGBX byte order
    r8g8b8x8,
    /// 32bpp ARGB packed
    a8r8g8b8,
    /// 32bpp XRGB packed
    x8r8g8b8,
    /// 24bpp RGB packed
    r8g8b8,
    /// 24bpp BGR packed
    b8g8r8,
    /// 16bpp 5-6-5 packed
    r5g6b5,
    /// 15bpp 1-5-5-5 packed
    x1r5g5b5,
}

impl GuestFormat {
    /// Decode a pixman format code; unknown codes are rejected so the
    /// listener can drop the switch event.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x2006_8888 => Some(Self::r8g8b8a8),
            0x2006_0888 => Some(Self::r8g8b8x8),
            0x2002_8888 => Some(Self::a8r8g8b8),
            0x2002_0888 => Some(Self::x8r8g8b8),
            0x1802_0888 => Some(Self::r8g8b8),
            0x1803_0888 => Some(Self::b8g8r8),
            0x1002_0565 => Some(Self::r5g6b5),
            0x1002_0555 => Some(Self::x1r5g5b5),
            _ => None,
        }
    }

    /// The conversion triple the capture path uses:
    /// (source format, encode format, source bytes per pixel).
    pub fn conversion(self) -> (PixelFormat, PixelFormat, usize) {
        match self {
            Self::r8g8b8a8 | Self::r8g8b8x8 => (PixelFormat::XBgr32, PixelFormat::XBgr32, 4),
            Self::a8r8g8b8 | Self::x8r8g8b8 => (PixelFormat::XRgb32, PixelFormat::XRgb32, 4),
            Self::r8g8b8 => (PixelFormat::Bgr24, PixelFormat::XRgb32, 3),
            Self::b8g8r8 => (PixelFormat::Rgb24, PixelFormat::XRgb32, 3),
            Self::r5g6b5 => (PixelFormat::Bgr16, PixelFormat::XRgb32, 2),
            Self::x1r5g5b5 => (PixelFormat::ABgr15, PixelFormat::XRgb32, 2),
        }
    }
}
