//! Peer wire PDUs
//!
//! Framing is `[type: u8][length: u32 LE][body]` in both directions. Client
//! PDUs carry capability negotiation, activation, input and frame
//! acknowledgements; server PDUs carry resize notices, surface-bits commands
//! (optionally wrapped in frame markers) and bitmap updates.

use bytes::{Buf, BufMut, BytesMut};

use super::RdpError;
use crate::codec::Rectangle16;

// Client → server
pub(super) const PDU_CAPABILITIES: u8 = 0x01;
pub(super) const PDU_ACTIVATE: u8 = 0x02;
pub(super) const PDU_KEYBOARD: u8 = 0x03;
pub(super) const PDU_MOUSE: u8 = 0x04;
pub(super) const PDU_REFRESH_RECT: u8 = 0x05;
pub(super) const PDU_SUPPRESS_OUTPUT: u8 = 0x06;
pub(super) const PDU_FRAME_ACK: u8 = 0x07;
pub(super) const PDU_SYNCHRONIZE: u8 = 0x08;

// Server → client
pub(super) const PDU_DESKTOP_RESIZE: u8 = 0x81;
pub(super) const PDU_SURFACE_BITS: u8 = 0x82;
pub(super) const PDU_SURFACE_FRAME_BITS: u8 = 0x83;
pub(super) const PDU_BITMAP_UPDATE: u8 = 0x84;

/// Hard ceiling on a single PDU body; anything larger is a protocol error.
pub(super) const MAX_PDU_BODY: u32 = 16 * 1024 * 1024;

/// Capability set a client advertises at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Requested desktop width
    pub width: u16,
    /// Requested desktop height
    pub height: u16,
    /// Requested color depth
    pub color_depth: u32,
    /// Client can decode the tile-based surface codec
    pub supports_remotefx: bool,
    /// Client can decode the single-message surface codec
    pub supports_nsc: bool,
    /// Client handles frame markers
    pub frame_marker: bool,
    /// Largest update fragment the client accepts
    pub multifrag_max_request_size: u32,
    /// Client directory identification string
    pub client_dir: Option<String>,
}

/// Typed client → server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Capability advertisement, first PDU on the wire.
    Capabilities(ClientCapabilities),
    /// The client is ready to receive frames.
    Activate,
    /// Keyboard input.
    Keyboard {
        /// Key flags (press/release, extended)
        flags: u16,
        /// Scan code
        code: u16,
    },
    /// Pointer input.
    Mouse {
        /// Button and motion flags
        flags: u16,
        /// X position
        x: u16,
        /// Y position
        y: u16,
    },
    /// Keyboard state synchronization; logged and ignored.
    Synchronize {
        /// Toggle-key flags
        flags: u32,
    },
    /// Client asks for regions to be resent.
    RefreshRect(Vec<Rectangle16>),
    /// Client pauses or resumes output.
    SuppressOutput {
        /// True to restore output
        allow: bool,
    },
    /// Client acknowledges a surface frame.
    FrameAcknowledge {
        /// The acknowledged frame id
        frame_id: u32,
    },
}

/// Which surface codec produced a surface-bits payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceCodec {
    /// Tile-based surface codec
    RemoteFx,
    /// Single-message surface codec
    Nsc,
}

/// A codec-compressed rectangle bound for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceBitsCommand {
    /// Destination rectangle on the client surface
    pub dest: Rectangle16,
    /// Bits per pixel of the decoded payload
    pub bpp: u8,
    /// Codec that produced `data`
    pub codec: SurfaceCodec,
    /// Payload width
    pub width: u16,
    /// Payload height
    pub height: u16,
    /// Payload is already compressed; the transport must not re-compress
    pub skip_compression: bool,
    /// Serialized codec message
    pub data: Vec<u8>,
}

/// One compressed 64×64 (or edge-cropped) tile of a bitmap update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapData {
    /// Left edge on the client surface
    pub dest_left: u16,
    /// Top edge on the client surface
    pub dest_top: u16,
    /// Tile width
    pub width: u16,
    /// Tile height
    pub height: u16,
    /// Bits per pixel of the decoded tile
    pub bits_per_pixel: u16,
    /// Payload is compressed
    pub compressed: bool,
    /// Compressed tile payload
    pub data: Vec<u8>,
}

impl BitmapData {
    /// Wire-size estimate used by the multifrag splitter.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + 16
    }
}

/// A batch of compressed tiles emitted as one update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitmapUpdate {
    /// Tile records in row-major order
    pub rectangles: Vec<BitmapData>,
}

/// Server → client updates, as recorded by sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUpdate {
    /// Desktop geometry change
    DesktopResize {
        /// New width
        width: u16,
        /// New height
        height: u16,
        /// New color depth
        bpp: u32,
    },
    /// Plain surface-bits command
    SurfaceBits(SurfaceBitsCommand),
    /// Surface-bits command wrapped in frame markers
    SurfaceFrameBits {
        /// The wrapped command
        cmd: SurfaceBitsCommand,
        /// First fragment of the frame
        first: bool,
        /// Last fragment of the frame
        last: bool,
        /// Frame id the client should acknowledge
        frame_id: u32,
    },
    /// Bitmap update
    Bitmap(BitmapUpdate),
}

fn put_rect(out: &mut BytesMut, rect: &Rectangle16) {
    out.put_u16_le(rect.left);
    out.put_u16_le(rect.top);
    out.put_u16_le(rect.right);
    out.put_u16_le(rect.bottom);
}

fn get_rect(body: &mut &[u8]) -> Rectangle16 {
    Rectangle16::new(
        body.get_u16_le(),
        body.get_u16_le(),
        body.get_u16_le(),
        body.get_u16_le(),
    )
}

fn put_surface_cmd(out: &mut BytesMut, cmd: &SurfaceBitsCommand) {
    put_rect(out, &cmd.dest);
    out.put_u8(cmd.bpp);
    out.put_u8(match cmd.codec {
        SurfaceCodec::RemoteFx => 0,
        SurfaceCodec::Nsc => 1,
    });
    out.put_u16_le(cmd.width);
    out.put_u16_le(cmd.height);
    out.put_u8(cmd.skip_compression as u8);
    out.put_u32_le(cmd.data.len() as u32);
    out.put_slice(&cmd.data);
}

/// Serialize a server update with its frame header into `out`.
pub(super) fn write_server_update(update: &ServerUpdate, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    let pdu_type = match update {
        ServerUpdate::DesktopResize { width, height, bpp } => {
            body.put_u16_le(*width);
            body.put_u16_le(*height);
            body.put_u32_le(*bpp);
            PDU_DESKTOP_RESIZE
        }
        ServerUpdate::SurfaceBits(cmd) => {
            put_surface_cmd(&mut body, cmd);
            PDU_SURFACE_BITS
        }
        ServerUpdate::SurfaceFrameBits {
            cmd,
            first,
            last,
            frame_id,
        } => {
            body.put_u8(*first as u8);
            body.put_u8(*last as u8);
            body.put_u32_le(*frame_id);
            put_surface_cmd(&mut body, cmd);
            PDU_SURFACE_FRAME_BITS
        }
        ServerUpdate::Bitmap(update) => {
            body.put_u16_le(update.rectangles.len() as u16);
            for bitmap in &update.rectangles {
                body.put_u16_le(bitmap.dest_left);
                body.put_u16_le(bitmap.dest_top);
                body.put_u16_le(bitmap.width);
                body.put_u16_le(bitmap.height);
                body.put_u16_le(bitmap.bits_per_pixel);
                body.put_u8(bitmap.compressed as u8);
                body.put_u32_le(bitmap.data.len() as u32);
                body.put_slice(&bitmap.data);
            }
            PDU_BITMAP_UPDATE
        }
    };

    out.put_u8(pdu_type);
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
}

/// Parse one server PDU body. The client side of the wire; used by tests
/// and diagnostic tooling.
pub fn parse_server_update(pdu_type: u8, mut body: &[u8]) -> Result<ServerUpdate, RdpError> {
    fn need(body: &[u8], n: usize) -> Result<(), RdpError> {
        if body.remaining() < n {
            Err(RdpError::Truncated)
        } else {
            Ok(())
        }
    }

    fn get_surface_cmd(body: &mut &[u8]) -> Result<SurfaceBitsCommand, RdpError> {
        if body.remaining() < 18 {
            return Err(RdpError::Truncated);
        }
        let dest = get_rect(body);
        let bpp = body.get_u8();
        let codec = match body.get_u8() {
            0 => SurfaceCodec::RemoteFx,
            _ => SurfaceCodec::Nsc,
        };
        let width = body.get_u16_le();
        let height = body.get_u16_le();
        let skip_compression = body.get_u8() != 0;
        let len = body.get_u32_le() as usize;
        if body.remaining() < len {
            return Err(RdpError::Truncated);
        }
        let data = body[..len].to_vec();
        body.advance(len);
        Ok(SurfaceBitsCommand {
            dest,
            bpp,
            codec,
            width,
            height,
            skip_compression,
            data,
        })
    }

    match pdu_type {
        PDU_DESKTOP_RESIZE => {
            need(body, 8)?;
            Ok(ServerUpdate::DesktopResize {
                width: body.get_u16_le(),
                height: body.get_u16_le(),
                bpp: body.get_u32_le(),
            })
        }
        PDU_SURFACE_BITS => Ok(ServerUpdate::SurfaceBits(get_surface_cmd(&mut body)?)),
        PDU_SURFACE_FRAME_BITS => {
            need(body, 6)?;
            let first = body.get_u8() != 0;
            let last = body.get_u8() != 0;
            let frame_id = body.get_u32_le();
            Ok(ServerUpdate::SurfaceFrameBits {
                cmd: get_surface_cmd(&mut body)?,
                first,
                last,
                frame_id,
            })
        }
        PDU_BITMAP_UPDATE => {
            need(body, 2)?;
            let count = body.get_u16_le() as usize;
            let mut rectangles = Vec::with_capacity(count);
            for _ in 0..count {
                need(body, 15)?;
                let dest_left = body.get_u16_le();
                let dest_top = body.get_u16_le();
                let width = body.get_u16_le();
                let height = body.get_u16_le();
                let bits_per_pixel = body.get_u16_le();
                let compressed = body.get_u8() != 0;
                let len = body.get_u32_le() as usize;
                if body.remaining() < len {
                    return Err(RdpError::Truncated);
                }
                let data = body[..len].to_vec();
                body.advance(len);
                rectangles.push(BitmapData {
                    dest_left,
                    dest_top,
                    width,
                    height,
                    bits_per_pixel,
                    compressed,
                    data,
                });
            }
            Ok(ServerUpdate::Bitmap(BitmapUpdate { rectangles }))
        }
        other => Err(RdpError::UnknownPdu(other)),
    }
}

/// Serialize a client event with its frame header into `out`. Used by the
/// tests that play the client side of the wire.
pub fn write_client_input(input: &ClientInput, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    let pdu_type = match input {
        ClientInput::Capabilities(caps) => {
            body.put_u16_le(caps.width);
            body.put_u16_le(caps.height);
            body.put_u32_le(caps.color_depth);
            let mut flags = 0u8;
            if caps.supports_remotefx {
                flags |= 0x01;
            }
            if caps.supports_nsc {
                flags |= 0x02;
            }
            if caps.frame_marker {
                flags |= 0x04;
            }
            body.put_u8(flags);
            body.put_u32_le(caps.multifrag_max_request_size);
            let dir = caps.client_dir.as_deref().unwrap_or("");
            body.put_u16_le(dir.len() as u16);
            body.put_slice(dir.as_bytes());
            PDU_CAPABILITIES
        }
        ClientInput::Activate => PDU_ACTIVATE,
        ClientInput::Keyboard { flags, code } => {
            body.put_u16_le(*flags);
            body.put_u16_le(*code);
            PDU_KEYBOARD
        }
        ClientInput::Mouse { flags, x, y } => {
            body.put_u16_le(*flags);
            body.put_u16_le(*x);
            body.put_u16_le(*y);
            PDU_MOUSE
        }
        ClientInput::Synchronize { flags } => {
            body.put_u32_le(*flags);
            PDU_SYNCHRONIZE
        }
        ClientInput::RefreshRect(areas) => {
            body.put_u8(areas.len() as u8);
            for rect in areas {
                put_rect(&mut body, rect);
            }
            PDU_REFRESH_RECT
        }
        ClientInput::SuppressOutput { allow } => {
            body.put_u8(*allow as u8);
            PDU_SUPPRESS_OUTPUT
        }
        ClientInput::FrameAcknowledge { frame_id } => {
            body.put_u32_le(*frame_id);
            PDU_FRAME_ACK
        }
    };

    out.put_u8(pdu_type);
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
}

/// Parse one client PDU body.
pub(super) fn parse_client_input(pdu_type: u8, mut body: &[u8]) -> Result<ClientInput, RdpError> {
    let need = |body: &[u8], n: usize| -> Result<(), RdpError> {
        if body.remaining() < n {
            Err(RdpError::Truncated)
        } else {
            Ok(())
        }
    };

    match pdu_type {
        PDU_CAPABILITIES => {
            need(body, 15)?;
            let width = body.get_u16_le();
            let height = body.get_u16_le();
            let color_depth = body.get_u32_le();
            let flags = body.get_u8();
            let multifrag = body.get_u32_le();
            let dir_len = body.get_u16_le() as usize;
            need(body, dir_len)?;
            let client_dir = if dir_len == 0 {
                None
            } else {
                Some(
                    String::from_utf8_lossy(&body[..dir_len])
                        .into_owned(),
                )
            };

            Ok(ClientInput::Capabilities(ClientCapabilities {
                width,
                height,
                color_depth,
                supports_remotefx: flags & 0x01 != 0,
                supports_nsc: flags & 0x02 != 0,
                frame_marker: flags & 0x04 != 0,
                multifrag_max_request_size: multifrag,
                client_dir,
            }))
        }
        PDU_ACTIVATE => Ok(ClientInput::Activate),
        PDU_KEYBOARD => {
            need(body, 4)?;
            Ok(ClientInput::Keyboard {
                flags: body.get_u16_le(),
                code: body.get_u16_le(),
            })
        }
        PDU_MOUSE => {
            need(body, 6)?;
            Ok(ClientInput::Mouse {
                flags: body.get_u16_le(),
                x: body.get_u16_le(),
                y: body.get_u16_le(),
            })
        }
        PDU_SYNCHRONIZE => {
            need(body, 4)?;
            Ok(ClientInput::Synchronize {
                flags: body.get_u32_le(),
            })
        }
        PDU_REFRESH_RECT => {
            need(body, 1)?;
            let count = body.get_u8() as usize;
            need(body, count * 8)?;
            let mut areas = Vec::with_capacity(count);
            for _ in 0..count {
                areas.push(get_rect(&mut body));
            }
            Ok(ClientInput::RefreshRect(areas))
        }
        PDU_SUPPRESS_OUTPUT => {
            need(body, 1)?;
            Ok(ClientInput::SuppressOutput {
                allow: body.get_u8() != 0,
            })
        }
        PDU_FRAME_ACK => {
            need(body, 4)?;
            Ok(ClientInput::FrameAcknowledge {
                frame_id: body.get_u32_le(),
            })
        }
        other => Err(RdpError::UnknownPdu(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: ClientInput) {
        let mut framed = BytesMut::new();
        write_client_input(&input, &mut framed);

        let pdu_type = framed[0];
        let len = u32::from_le_bytes([framed[1], framed[2], framed[3], framed[4]]) as usize;
        let body = &framed[5..5 + len];
        let parsed = parse_client_input(pdu_type, body).unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn client_inputs_round_trip() {
        round_trip(ClientInput::Capabilities(ClientCapabilities {
            width: 1024,
            height: 768,
            color_depth: 32,
            supports_remotefx: true,
            supports_nsc: false,
            frame_marker: true,
            multifrag_max_request_size: 0x3f_0000,
            client_dir: Some("mstsc".to_owned()),
        }));
        round_trip(ClientInput::Activate);
        round_trip(ClientInput::Keyboard {
            flags: 0x8000,
            code: 0x1e,
        });
        round_trip(ClientInput::Mouse {
            flags: 0x1000,
            x: 100,
            y: 200,
        });
        round_trip(ClientInput::RefreshRect(vec![
            Rectangle16::new(0, 0, 64, 64),
            Rectangle16::new(64, 64, 128, 128),
        ]));
        round_trip(ClientInput::SuppressOutput { allow: false });
        round_trip(ClientInput::FrameAcknowledge { frame_id: 7 });
        round_trip(ClientInput::Synchronize { flags: 2 });
    }

    #[test]
    fn unknown_pdu_type_is_rejected() {
        assert!(matches!(
            parse_client_input(0x7f, &[]),
            Err(RdpError::UnknownPdu(0x7f))
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert!(matches!(
            parse_client_input(PDU_MOUSE, &[1, 2]),
            Err(RdpError::Truncated)
        ));
    }

    #[test]
    fn server_update_frames_have_length() {
        let mut out = BytesMut::new();
        write_server_update(
            &ServerUpdate::DesktopResize {
                width: 1280,
                height: 720,
                bpp: 32,
            },
            &mut out,
        );
        assert_eq!(out[0], PDU_DESKTOP_RESIZE);
        let len = u32::from_le_bytes([out[1], out[2], out[3], out[4]]) as usize;
        assert_eq!(out.len(), 5 + len);
    }
}
