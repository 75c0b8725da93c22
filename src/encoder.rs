//! Per-peer tile encoder
//!
//! Owns the codec contexts, the 64×64 tile grid, the scratch stream and the
//! frame-id / acknowledgement bookkeeping for one connected peer. Frame-rate
//! adaptation lives here: every new frame id re-derives the preferred fps
//! from how many frames the client has not yet acknowledged, which is the
//! producer's only backpressure signal.

use bytes::BytesMut;
use enumflags2::{bitflags, BitFlags};
use tracing::trace;

use crate::codec::{
    InterleavedContext, NscContext, PixelFormat, PlanarContext, Rectangle16, RfxContext,
    RfxPixelVariant, RlgrMode, TILE_SIZE,
};
use crate::rdp::PeerSettings;

/// Codecs the encoder can drive, negotiated per client capability.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Tile-based surface codec
    RemoteFx = 0b0001,
    /// Single-message surface codec
    Nsc = 0b0010,
    /// Planar bitmap codec (32bpp)
    Planar = 0b0100,
    /// Interleaved bitmap codec (sub-32bpp)
    Interleaved = 0b1000,
}

/// Bytes in one tile slot of the grid.
const TILE_SLOT: usize = TILE_SIZE * TILE_SIZE * 4;

/// The 64×64 tile partitioning of the surface, backed by one contiguous
/// buffer. Slots stage tile pixels on their way into the bitmap codecs.
#[derive(Debug, Default)]
pub struct TileGrid {
    width: usize,
    height: usize,
    buffer: Vec<u8>,
}

impl TileGrid {
    fn init(&mut self, surface_width: u16, surface_height: u16) {
        self.width = (surface_width as usize).div_ceil(TILE_SIZE);
        self.height = (surface_height as usize).div_ceil(TILE_SIZE);
        self.buffer = vec![0u8; TILE_SLOT * self.width * self.height];
    }

    fn uninit(&mut self) {
        self.width = 0;
        self.height = 0;
        self.buffer = Vec::new();
    }

    /// Tiles per row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Tile rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// View of tile slot `k` in row-major order.
    pub fn slot(&self, k: usize) -> &[u8] {
        &self.buffer[k * TILE_SLOT..(k + 1) * TILE_SLOT]
    }

    /// Mutable view of tile slot `k` in row-major order.
    pub fn slot_mut(&mut self, k: usize) -> &mut [u8] {
        &mut self.buffer[k * TILE_SLOT..(k + 1) * TILE_SLOT]
    }
}

/// Per-peer codec state, tile grid and frame bookkeeping.
pub struct TileEncoder {
    width: u16,
    height: u16,
    format: PixelFormat,
    codecs: BitFlags<Codec>,

    grid: TileGrid,
    scratch: BytesMut,

    rfx: Option<RfxContext>,
    nsc: Option<NscContext>,
    planar: Option<PlanarContext>,
    interleaved: Option<InterleavedContext>,

    frame_id: u32,
    last_ack_frame_id: u32,
    fps: i32,
    max_fps: i32,
    frame_ack: bool,
}

impl TileEncoder {
    /// Create an encoder with no codecs prepared yet.
    pub fn new(settings: &PeerSettings) -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::XRgb32,
            codecs: BitFlags::empty(),
            grid: TileGrid::default(),
            scratch: BytesMut::new(),
            rfx: None,
            nsc: None,
            planar: None,
            interleaved: None,
            frame_id: 0,
            last_ack_frame_id: 0,
            fps: 16,
            max_fps: 32,
            frame_ack: settings.surface_frame_marker_enabled,
        }
    }

    /// Lazily initialize contexts for any newly requested codec. Codecs
    /// already prepared are left untouched, so this is idempotent.
    pub fn prepare(&mut self, requested: BitFlags<Codec>, settings: &PeerSettings) {
        if requested.contains(Codec::RemoteFx) && !self.codecs.contains(Codec::RemoteFx) {
            let mut ctx = RfxContext::new(self.width, self.height);
            ctx.set_mode(RlgrMode::Rlgr3);
            ctx.set_pixel_variant(match self.format {
                PixelFormat::XRgb32 => RfxPixelVariant::Rgba32,
                _ => RfxPixelVariant::Bgra32,
            });
            self.rfx = Some(ctx);
            self.seed_frame_state(settings);
            self.codecs |= Codec::RemoteFx;
        }

        if requested.contains(Codec::Nsc) && !self.codecs.contains(Codec::Nsc) {
            self.nsc = Some(NscContext::new(
                settings.nsc_color_loss_level,
                settings.nsc_allow_subsampling,
                settings.nsc_allow_dynamic_color_fidelity,
            ));
            self.seed_frame_state(settings);
            self.codecs |= Codec::Nsc;
        }

        if requested.contains(Codec::Planar) && !self.codecs.contains(Codec::Planar) {
            self.planar = Some(PlanarContext::new(
                settings.draw_allow_skip_alpha,
                TILE_SIZE,
                TILE_SIZE,
            ));
            self.codecs |= Codec::Planar;
        }

        if requested.contains(Codec::Interleaved) && !self.codecs.contains(Codec::Interleaved) {
            self.interleaved = Some(InterleavedContext::new());
            self.codecs |= Codec::Interleaved;
        }
    }

    fn seed_frame_state(&mut self, settings: &PeerSettings) {
        self.fps = 16;
        self.max_fps = 32;
        self.frame_id = 0;
        self.last_ack_frame_id = 0;
        self.frame_ack = settings.surface_frame_marker_enabled;
    }

    /// Tear down the grid and every context, re-initialize for the new
    /// geometry and re-prepare the codecs that were enabled before.
    pub fn reset(&mut self, width: u16, height: u16, settings: &PeerSettings) {
        let codecs = self.codecs;

        self.grid.uninit();
        self.rfx = None;
        self.nsc = None;
        self.planar = None;
        self.interleaved = None;
        self.codecs = BitFlags::empty();

        self.width = width;
        self.height = height;
        self.grid.init(width, height);
        self.scratch = BytesMut::with_capacity(TILE_SLOT);

        self.prepare(codecs, settings);

        if let Some(rfx) = &mut self.rfx {
            rfx.reset(width, height);
        }
    }

    /// Update the encode pixel format; takes effect on the next prepare or
    /// reset.
    pub fn set_pixel_format(&mut self, format: PixelFormat) {
        self.format = format;
    }

    /// Current encode pixel format.
    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    /// Current surface geometry.
    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Codecs currently prepared.
    pub fn codecs(&self) -> BitFlags<Codec> {
        self.codecs
    }

    /// The tile grid.
    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Tile-based surface codec context, if prepared.
    pub fn rfx(&self) -> Option<&RfxContext> {
        self.rfx.as_ref()
    }

    /// Single-message surface codec context, if prepared.
    pub fn nsc(&self) -> Option<&NscContext> {
        self.nsc.as_ref()
    }

    /// Planar context, if prepared.
    pub fn planar(&self) -> Option<&PlanarContext> {
        self.planar.as_ref()
    }

    /// Interleaved context, if prepared.
    pub fn interleaved(&self) -> Option<&InterleavedContext> {
        self.interleaved.as_ref()
    }

    /// Whether frame ids wrap outgoing surface commands.
    pub fn frame_ack(&self) -> bool {
        self.frame_ack
    }

    /// Last frame id handed out.
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Record a client acknowledgement. Clamped to the last frame id handed
    /// out, so a bogus ack can never push `last_ack_frame_id` past
    /// `frame_id`.
    pub fn acknowledge_frame(&mut self, frame_id: u32) {
        self.last_ack_frame_id = frame_id.min(self.frame_id);
    }

    /// Last frame id the client acknowledged.
    pub fn last_ack_frame_id(&self) -> u32 {
        self.last_ack_frame_id
    }

    /// Frames sent but not yet acknowledged.
    pub fn inflight_frames(&self) -> u32 {
        self.frame_id - self.last_ack_frame_id
    }

    /// The producer-side frame rate suggestion.
    pub fn preferred_fps(&self) -> i32 {
        self.fps
    }

    /// Allocate the next frame id, re-deriving the preferred fps from the
    /// inflight count first: a backlog scales fps down toward `maxFps /
    /// (inflight + 1)`, an empty pipe creeps it back up two per frame.
    pub fn create_frame_id(&mut self) -> u32 {
        self.frame_id += 1;
        let inflight = self.inflight_frames() as i32;

        if inflight > 1 {
            self.fps = (100 / (inflight + 1)) * self.max_fps / 100;
        } else {
            self.fps = (self.fps + 2).min(self.max_fps);
        }

        if self.fps < 1 {
            self.fps = 1;
        }

        trace!(
            frame_id = self.frame_id,
            inflight,
            fps = self.fps,
            "frame id allocated"
        );
        self.frame_id
    }

    /// Serialize a tile-codec message through the scratch stream.
    /// Returns an empty vector if the codec is not prepared.
    pub fn write_rfx_message(&mut self, message: &crate::codec::RfxMessage) -> Vec<u8> {
        let Some(rfx) = &self.rfx else {
            return Vec::new();
        };
        self.scratch.clear();
        rfx.write_message(message, &mut self.scratch);
        self.scratch.to_vec()
    }

    /// Compose a single-message surface codec payload through the scratch
    /// stream. `data` starts at the rectangle's top-left pixel.
    pub fn compose_nsc_message(
        &mut self,
        data: &[u8],
        width: u16,
        height: u16,
        stride: usize,
    ) -> Result<Vec<u8>, crate::codec::CodecError> {
        let Some(nsc) = &self.nsc else {
            return Ok(Vec::new());
        };
        self.scratch.clear();
        nsc.compose_message(&mut self.scratch, data, width, height, stride)?;
        Ok(self.scratch.to_vec())
    }

    /// Copy a `width`×`height` tile at `(x, y)` of `surface` into grid slot
    /// `k`, packed with a `width × 4` pitch. Returns the packed byte count;
    /// the pixels are read back through [`TileGrid::slot`].
    #[allow(clippy::too_many_arguments)]
    pub fn stage_tile(
        &mut self,
        surface: &[u8],
        stride: usize,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        k: usize,
    ) -> usize {
        let pitch = width * 4;
        let slot = self.grid.slot_mut(k);
        for row in 0..height {
            let src = (y + row) * stride + x * 4;
            slot[row * pitch..(row + 1) * pitch].copy_from_slice(&surface[src..src + pitch]);
        }
        height * pitch
    }

    /// Find the smallest rectangle covering every 16×16 cell that differs
    /// between two equal-geometry 32bpp buffers. Used to infer a dirty
    /// region when no damage hint is available.
    pub fn compare(
        data1: &[u8],
        stride1: usize,
        width: u16,
        height: u16,
        data2: &[u8],
        stride2: usize,
    ) -> Option<Rectangle16> {
        let nrow = (height as usize).div_ceil(16);
        let ncol = (width as usize).div_ceil(16);

        let mut left = ncol;
        let mut right = 0usize;
        let mut top = nrow;
        let mut bottom = 0usize;
        let mut any = false;

        for ty in 0..nrow {
            let th = 16.min(height as usize - ty * 16);
            for tx in 0..ncol {
                let tw = 16.min(width as usize - tx * 16);
                let mut equal = true;

                for row in 0..th {
                    let o1 = (ty * 16 + row) * stride1 + tx * 16 * 4;
                    let o2 = (ty * 16 + row) * stride2 + tx * 16 * 4;
                    if data1[o1..o1 + tw * 4] != data2[o2..o2 + tw * 4] {
                        equal = false;
                        break;
                    }
                }

                if !equal {
                    any = true;
                    left = left.min(tx);
                    right = right.max(tx);
                    top = top.min(ty);
                    bottom = bottom.max(ty);
                }
            }
        }

        if !any {
            return None;
        }

        let rect = Rectangle16::new(
            (left * 16) as u16,
            (top * 16) as u16,
            (((right + 1) * 16).min(width as usize)) as u16,
            (((bottom + 1) * 16).min(height as usize)) as u16,
        );
        Some(rect)
    }
}
