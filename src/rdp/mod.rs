//! Peer wire-driver contract
//!
//! The slice of the remote display protocol the multiplexer needs from its
//! protocol library: per-peer settings seeded at context creation, typed
//! client events (capabilities, activation, input, refresh, frame
//! acknowledgements), the update commands the emission path produces, and
//! the transport that frames both directions over the peer's TCP connection.

mod pdu;
mod transport;

pub use pdu::{
    parse_server_update, write_client_input, BitmapData, BitmapUpdate, ClientCapabilities,
    ClientInput, ServerUpdate, SurfaceBitsCommand, SurfaceCodec,
};
pub use transport::PeerTransport;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Compression level tag seeded into new peer contexts.
pub const COMPRESSION_LEVEL_RDP61: u32 = 0x02;

/// Multifrag threshold below which the single-message surface codec is
/// disabled (it cannot be fragmented).
pub const NSC_MIN_MULTIFRAG: u32 = 0x3f_0000;

/// Errors raised by the peer wire layer.
#[derive(Debug, Error)]
pub enum RdpError {
    /// Socket-level failure.
    #[error("peer transport error: {0}")]
    Io(#[from] io::Error),

    /// The client closed the connection.
    #[error("peer closed the connection")]
    Closed,

    /// A frame declared an unreasonable length.
    #[error("oversized pdu: {0} bytes")]
    Oversized(u32),

    /// An unknown PDU type arrived.
    #[error("unknown pdu type {0:#04x}")]
    UnknownPdu(u8),

    /// A PDU body ended before its declared length.
    #[error("truncated pdu body")]
    Truncated,

    /// The codec layer failed while building an update.
    #[error("codec failure: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

/// Per-peer protocol settings.
///
/// Seeded at context creation the way the listener's security posture
/// dictates, then amended by capability negotiation and post-connect fixups.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Negotiated color depth (32; 24 is rewritten to 16 post-connect)
    pub color_depth: u32,
    /// Desktop width last told to the client
    pub desktop_width: u16,
    /// Desktop height last told to the client
    pub desktop_height: u16,

    /// Tile-based surface codec enabled
    pub remotefx: bool,
    /// Single-message surface codec enabled
    pub nsc: bool,
    /// Frame marker commands enabled
    pub frame_marker_enabled: bool,
    /// Surface frame markers (frame-ack protocol) enabled
    pub surface_frame_marker_enabled: bool,

    /// Color loss level handed to the single-message codec
    pub nsc_color_loss_level: u32,
    /// Chroma subsampling allowance handed to the single-message codec
    pub nsc_allow_subsampling: bool,
    /// Dynamic color fidelity allowance handed to the single-message codec
    pub nsc_allow_dynamic_color_fidelity: bool,
    /// Planar codec may omit the alpha plane
    pub draw_allow_skip_alpha: bool,

    /// Bulk compression level tag
    pub compression_level: u32,
    /// Largest update fragment the client accepts
    pub multifrag_max_request_size: u32,

    /// Client may suppress output
    pub suppress_output: bool,
    /// Client may request region refreshes
    pub refresh_rect: bool,

    /// Standard RDP security accepted
    pub rdp_security: bool,
    /// TLS security accepted
    pub tls_security: bool,
    /// Network-level authentication required
    pub nla_security: bool,
    /// Credential file consulted when NLA is on
    pub credential_file: Option<PathBuf>,

    /// Client directory string, used for thin-client quirks
    pub client_dir: Option<String>,
}

impl PeerSettings {
    /// Seed settings for a newly accepted connection.
    ///
    /// Color depth 32, tile-based surface codec on, single-message codec
    /// off, TLS on, NLA only when the listener authenticates, frame markers
    /// on, bulk compression tagged.
    pub fn new(authentication: bool) -> Self {
        Self {
            color_depth: 32,
            desktop_width: 0,
            desktop_height: 0,
            remotefx: true,
            nsc: false,
            frame_marker_enabled: true,
            surface_frame_marker_enabled: true,
            nsc_color_loss_level: 3,
            nsc_allow_subsampling: true,
            nsc_allow_dynamic_color_fidelity: true,
            draw_allow_skip_alpha: true,
            compression_level: COMPRESSION_LEVEL_RDP61,
            multifrag_max_request_size: NSC_MIN_MULTIFRAG,
            suppress_output: true,
            refresh_rect: true,
            rdp_security: true,
            tls_security: true,
            nla_security: authentication,
            credential_file: None,
            client_dir: None,
        }
    }

    /// Toggle the security posture. Authentication on selects the stronger
    /// tier and binds the credential file; off selects the lower tier.
    pub fn set_authentication(&mut self, enabled: bool, credential_file: Option<PathBuf>) {
        self.nla_security = enabled;
        if enabled {
            self.credential_file = credential_file;
        }
    }

    /// Fold the client's advertised capabilities in.
    pub fn apply_capabilities(&mut self, caps: &ClientCapabilities) {
        self.color_depth = caps.color_depth;
        self.desktop_width = caps.width;
        self.desktop_height = caps.height;
        self.remotefx &= caps.supports_remotefx;
        self.nsc = caps.supports_nsc;
        self.surface_frame_marker_enabled &= caps.frame_marker;
        if caps.multifrag_max_request_size > 0 {
            self.multifrag_max_request_size = caps.multifrag_max_request_size;
        }
        self.client_dir = caps.client_dir.clone();
    }

    /// Post-connect fixups: 24bpp is silently rewritten to 16, and the
    /// single-message surface codec is dropped for clients whose fragment
    /// limit cannot carry it.
    pub fn post_connect_fixups(&mut self) {
        if self.color_depth == 24 {
            self.color_depth = 16;
        }
        if self.multifrag_max_request_size < NSC_MIN_MULTIFRAG {
            self.nsc = false;
        }
    }

    /// Quirks for known thin clients: their codec support claims are wrong,
    /// so surface codecs and frame markers are disabled outright.
    pub fn apply_client_dir_quirks(&mut self) {
        if self.client_dir.as_deref() == Some("librdp") {
            self.remotefx = false;
            self.nsc = false;
            self.nsc_allow_subsampling = false;
            self.surface_frame_marker_enabled = false;
        }
    }
}

/// The update emitters the peer session drives. Implemented by the real
/// transport and by test recorders.
pub trait UpdateSink: Send {
    /// Tell the client the desktop changed size.
    fn desktop_resize(&mut self, width: u16, height: u16, bpp: u32) -> Result<(), RdpError>;

    /// Emit one surface-bits command.
    fn surface_bits(&mut self, cmd: &SurfaceBitsCommand) -> Result<(), RdpError>;

    /// Emit one surface-bits command wrapped in frame markers.
    fn surface_frame_bits(
        &mut self,
        cmd: &SurfaceBitsCommand,
        first: bool,
        last: bool,
        frame_id: u32,
    ) -> Result<(), RdpError>;

    /// Emit one bitmap update.
    fn bitmap_update(&mut self, update: &BitmapUpdate) -> Result<(), RdpError>;
}

/// A live peer connection: an update sink plus the inbound event stream.
pub trait PeerConnection: UpdateSink {
    /// Wait up to `timeout` for the next client event. `Ok(None)` means the
    /// wait timed out with the connection still healthy.
    fn poll_input(&mut self, timeout: Duration) -> Result<Option<ClientInput>, RdpError>;

    /// Close the transport. Idempotent.
    fn disconnect(&mut self);
}

/// In-memory sink that records every update, used to exercise the emission
/// paths without a live connection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// Updates in emission order.
    pub updates: Vec<ServerUpdate>,
}

impl RecordingSink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl UpdateSink for RecordingSink {
    fn desktop_resize(&mut self, width: u16, height: u16, bpp: u32) -> Result<(), RdpError> {
        self.updates
            .push(ServerUpdate::DesktopResize { width, height, bpp });
        Ok(())
    }

    fn surface_bits(&mut self, cmd: &SurfaceBitsCommand) -> Result<(), RdpError> {
        self.updates.push(ServerUpdate::SurfaceBits(cmd.clone()));
        Ok(())
    }

    fn surface_frame_bits(
        &mut self,
        cmd: &SurfaceBitsCommand,
        first: bool,
        last: bool,
        frame_id: u32,
    ) -> Result<(), RdpError> {
        self.updates.push(ServerUpdate::SurfaceFrameBits {
            cmd: cmd.clone(),
            first,
            last,
            frame_id,
        });
        Ok(())
    }

    fn bitmap_update(&mut self, update: &BitmapUpdate) -> Result<(), RdpError> {
        self.updates.push(ServerUpdate::Bitmap(update.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_settings_follow_security_posture() {
        let open = PeerSettings::new(false);
        assert!(open.rdp_security && open.tls_security);
        assert!(!open.nla_security);
        assert_eq!(open.color_depth, 32);
        assert!(open.remotefx);
        assert!(!open.nsc);

        let auth = PeerSettings::new(true);
        assert!(auth.nla_security);
    }

    #[test]
    fn post_connect_rewrites_depth_and_nsc() {
        let mut s = PeerSettings::new(false);
        s.color_depth = 24;
        s.nsc = true;
        s.multifrag_max_request_size = 0x1_0000;

        s.post_connect_fixups();
        assert_eq!(s.color_depth, 16);
        assert!(!s.nsc);
    }

    #[test]
    fn nsc_survives_large_multifrag() {
        let mut s = PeerSettings::new(false);
        s.nsc = true;
        s.multifrag_max_request_size = NSC_MIN_MULTIFRAG;
        s.post_connect_fixups();
        assert!(s.nsc);
    }

    #[test]
    fn librdp_quirks_disable_surface_codecs() {
        let mut s = PeerSettings::new(false);
        s.client_dir = Some("librdp".to_owned());
        s.apply_client_dir_quirks();
        assert!(!s.remotefx);
        assert!(!s.nsc);
        assert!(!s.surface_frame_marker_enabled);
    }

    #[test]
    fn capabilities_clamp_codecs() {
        let mut s = PeerSettings::new(false);
        let caps = ClientCapabilities {
            width: 800,
            height: 600,
            color_depth: 32,
            supports_remotefx: false,
            supports_nsc: true,
            frame_marker: true,
            multifrag_max_request_size: 0x10_0000,
            client_dir: None,
        };
        s.apply_capabilities(&caps);
        assert!(!s.remotefx);
        assert!(s.nsc);
        assert_eq!(s.desktop_width, 800);
        assert_eq!(s.multifrag_max_request_size, 0x10_0000);
    }
}
