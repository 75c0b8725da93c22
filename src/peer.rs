//! Peer session
//!
//! One session per accepted RDP connection. The session owns the protocol
//! state machine, the tile buffer and the encoder; it translates client
//! input into guest-bound messages and turns accumulated damage into surface
//! or bitmap updates.
//!
//! The session runs on its own thread. The listener interacts with it
//! through a shared [`PeerHandle`]: the frame tick pushes capture rectangles
//! into the handle's dirty region, and teardown raises its stop flag. A peer
//! never outlives its listener.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::codec::{align16_clamped, PixelFormat, Rectangle16, Region16, TILE_SIZE};
use crate::encoder::{Codec, TileEncoder};
use crate::listener::RdpListener;
use crate::protocol::{tag, GuestFormat};
use crate::rdp::{
    BitmapData, BitmapUpdate, ClientInput, PeerConnection, PeerSettings, RdpError,
    SurfaceBitsCommand, SurfaceCodec,
};

/// How long one loop turn waits on the transport.
const POLL_TIMEOUT: Duration = Duration::from_millis(5);

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Protocol state as observed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Connection accepted, context allocated, settings seeded
    Init,
    /// Client capability set received and accepted
    CapabilitiesNegotiated,
    /// Post-connect fixups applied, geometry agreed
    PostConnect,
    /// May emit frames
    Activated,
    /// Geometry changed, waiting for the client to re-activate
    Resizing,
    /// Stop flag set or transport failed
    Terminated,
}

/// The listener-facing half of a peer: damage intake, activation state and
/// the stop flag.
pub struct PeerHandle {
    id: u64,
    dirty: Mutex<Region16>,
    active: AtomicBool,
    stop: Mutex<bool>,
}

impl PeerHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            dirty: Mutex::new(Region16::new()),
            active: AtomicBool::new(false),
            stop: Mutex::new(false),
        })
    }

    /// Stable id of this peer within its listener.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the client is activated and may receive frames.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Add a capture rectangle to the peer's dirty region.
    pub fn push_damage(&self, rect: &Rectangle16) {
        self.dirty.lock().union_rect(rect);
    }

    /// Ask the session loop to exit.
    pub fn request_stop(&self) {
        *self.stop.lock() = true;
    }

    fn stop_requested(&self) -> bool {
        *self.stop.lock()
    }
}

/// One RDP client of a VM. Owned by its connection thread.
pub struct PeerSession {
    handle: Arc<PeerHandle>,
    listener: Arc<RdpListener>,
    conn: Box<dyn PeerConnection>,
    settings: PeerSettings,
    encoder: TileEncoder,
    state: PeerState,

    tile_buffer: Vec<u8>,
    /// Tile buffer row width in pixels (16-aligned surface width)
    buf_width: u16,
    /// Tile buffer rows (4-aligned surface height)
    buf_height: u16,
    source_format: PixelFormat,
    encode_format: PixelFormat,
    source_bpp: usize,

    next_frame: Instant,
}

fn align16(v: u16) -> u16 {
    v.div_ceil(16) * 16
}

fn align4(v: u16) -> u16 {
    v.div_ceil(4) * 4
}

impl PeerSession {
    /// Build a session around an accepted connection.
    pub fn new(conn: Box<dyn PeerConnection>, listener: Arc<RdpListener>) -> Self {
        let mut settings = PeerSettings::new(listener.requires_authentication());
        settings.credential_file = listener.credential_path();
        let encoder = TileEncoder::new(&settings);

        Self {
            handle: PeerHandle::new(),
            listener,
            conn,
            settings,
            encoder,
            state: PeerState::Init,
            tile_buffer: Vec::new(),
            buf_width: 0,
            buf_height: 0,
            source_format: PixelFormat::XRgb32,
            encode_format: PixelFormat::XRgb32,
            source_bpp: 4,
            next_frame: Instant::now(),
        }
    }

    /// The shared handle the listener keeps in its registry.
    pub fn handle(&self) -> Arc<PeerHandle> {
        Arc::clone(&self.handle)
    }

    /// Current protocol state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Settings as currently negotiated.
    pub fn settings(&self) -> &PeerSettings {
        &self.settings
    }

    /// Encoder state, exposed for inspection.
    pub fn encoder(&self) -> &TileEncoder {
        &self.encoder
    }

    /// Tile buffer capacity in bytes.
    pub fn tile_buffer_len(&self) -> usize {
        self.tile_buffer.len()
    }

    /// Run the session until the client disconnects or the stop flag is
    /// raised. Registers with the listener on entry; unregisters on exit
    /// unless the listener itself initiated the stop.
    pub fn run(mut self) {
        self.listener.register_peer(self.handle());
        info!(peer = self.handle.id, "peer session started");

        loop {
            if self.handle.stop_requested() {
                break;
            }

            match self.conn.poll_input(POLL_TIMEOUT) {
                Ok(Some(input)) => {
                    if let Err(e) = self.handle_input(input) {
                        warn!(peer = self.handle.id, "input handling failed: {e}");
                        break;
                    }
                    continue; // drain queued input before capturing
                }
                Ok(None) => {}
                Err(RdpError::Closed) => {
                    debug!(peer = self.handle.id, "client closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = self.handle.id, "transport failed: {e}");
                    break;
                }
            }

            if let Err(e) = self.check_resize() {
                warn!(peer = self.handle.id, "resize failed: {e}");
                break;
            }

            if self.frame_due() {
                if let Err(e) = self.send_surface_update(None) {
                    warn!(peer = self.handle.id, "surface update failed: {e}");
                    break;
                }
            }
        }

        self.state = PeerState::Terminated;
        self.handle.set_active(false);
        self.conn.disconnect();

        // The listener closes its peers before destroying itself; only a
        // self-initiated exit needs to unregister.
        if !self.handle.stop_requested() {
            self.listener.unregister_peer(self.handle.id);
        }
        info!(peer = self.handle.id, "peer session ended");
    }

    /// Process one client event through the state machine.
    pub fn handle_input(&mut self, input: ClientInput) -> Result<(), RdpError> {
        match input {
            ClientInput::Capabilities(caps) => {
                debug!(
                    peer = self.handle.id,
                    width = caps.width,
                    height = caps.height,
                    depth = caps.color_depth,
                    "client capabilities"
                );
                self.settings.apply_capabilities(&caps);
                self.state = PeerState::CapabilitiesNegotiated;
                self.post_connect()
            }
            ClientInput::Activate => self.activate(),
            ClientInput::Keyboard { flags, code } => {
                self.listener
                    .process_outgoing(vec![tag::KEYBOARD as u16, code, flags]);
                Ok(())
            }
            ClientInput::Mouse { flags, x, y } => {
                self.listener
                    .process_outgoing(vec![tag::MOUSE as u16, x, y, flags]);
                Ok(())
            }
            ClientInput::Synchronize { flags } => {
                debug!(peer = self.handle.id, flags, "synchronize event");
                Ok(())
            }
            ClientInput::RefreshRect(areas) => {
                let bounds = self.surface_bounds();
                let mut dirty = self.handle.dirty.lock();
                for area in &areas {
                    let clipped = area.intersect(&bounds);
                    if !clipped.is_empty() {
                        trace!(peer = self.handle.id, ?clipped, "refresh rect");
                        dirty.union_rect(&clipped);
                    }
                }
                Ok(())
            }
            ClientInput::SuppressOutput { allow } => {
                if allow {
                    debug!(peer = self.handle.id, "client requested to restore output");
                } else {
                    debug!(peer = self.handle.id, "client requested to suppress output");
                }
                Ok(())
            }
            ClientInput::FrameAcknowledge { frame_id } => {
                self.encoder.acknowledge_frame(frame_id);
                Ok(())
            }
        }
    }

    /// Post-connect fixups: clamp the color depth, drop codecs the client's
    /// fragment limit cannot carry, and resize the client if its requested
    /// geometry differs from the listener's.
    fn post_connect(&mut self) -> Result<(), RdpError> {
        self.settings.post_connect_fixups();

        let (width, height, _, _) = self.listener.display_params();
        let (width, height) = (width as u16, height as u16);

        if width > 0
            && (width != self.settings.desktop_width || height != self.settings.desktop_height)
        {
            debug!(
                peer = self.handle.id,
                width, height, "resizing client desktop at connect"
            );
            self.settings.desktop_width = width;
            self.settings.desktop_height = height;
            self.conn
                .desktop_resize(width, height, self.settings.color_depth)?;
        }

        self.state = PeerState::PostConnect;
        Ok(())
    }

    /// Client activation: apply thin-client quirks, size the surface to the
    /// listener and schedule a full refresh.
    fn activate(&mut self) -> Result<(), RdpError> {
        self.settings.apply_client_dir_quirks();

        let (width, height, format, _) = self.listener.display_params();
        debug!(peer = self.handle.id, width, height, "peer activate");

        self.state = PeerState::Activated;
        self.handle.set_active(true);

        if let Some(format) = format {
            self.full_display_update(width as u16, height as u16, format)?;
        }
        Ok(())
    }

    /// Detect a listener resize the client has not been told about yet, or
    /// a first display switch that arrived after activation.
    fn check_resize(&mut self) -> Result<(), RdpError> {
        if self.state != PeerState::Activated {
            return Ok(());
        }

        let (width, height, format, _) = self.listener.display_params();
        let (width, height) = (width as u16, height as u16);
        if width == 0 || height == 0 {
            return Ok(());
        }

        if self.tile_buffer.is_empty()
            || width != self.settings.desktop_width
            || height != self.settings.desktop_height
        {
            if let Some(format) = format {
                self.full_display_update(width, height, format)?;
            }
        }
        Ok(())
    }

    /// Recreate the surface for a new geometry or format and schedule a full
    /// refresh. Sends `DesktopResize` and drops out of the activated state
    /// when the geometry actually changed.
    pub fn full_display_update(
        &mut self,
        width: u16,
        height: u16,
        format: GuestFormat,
    ) -> Result<(), RdpError> {
        let resized =
            width != self.settings.desktop_width || height != self.settings.desktop_height;

        if self.tile_buffer.is_empty() || resized {
            self.create_surface(width, height, format);

            if resized {
                self.settings.desktop_width = width;
                self.settings.desktop_height = height;
                self.conn
                    .desktop_resize(width, height, self.settings.color_depth)?;
                self.handle.set_active(false);
                self.state = PeerState::Resizing;
                info!(
                    peer = self.handle.id,
                    width, height, "desktop resized, waiting for re-activation"
                );
            }
        }

        self.handle
            .push_damage(&Rectangle16::new(0, 0, width, height));
        Ok(())
    }

    /// Reallocate the tile buffer and reset the encoder for a new geometry.
    fn create_surface(&mut self, width: u16, height: u16, format: GuestFormat) {
        let (source, encode, bpp) = format.conversion();
        self.source_format = source;
        self.encode_format = encode;
        self.source_bpp = bpp;

        self.buf_width = align16(width);
        self.buf_height = align4(height);
        self.tile_buffer = vec![0u8; self.buf_width as usize * self.buf_height as usize * 4];

        debug!(
            peer = self.handle.id,
            width,
            height,
            buffer = self.tile_buffer.len(),
            "surface created"
        );

        self.encoder.set_pixel_format(encode);
        self.encoder.reset(width, height, &self.settings);
    }

    fn surface_bounds(&self) -> Rectangle16 {
        Rectangle16::new(
            0,
            0,
            self.settings.desktop_width,
            self.settings.desktop_height,
        )
    }

    fn frame_due(&mut self) -> bool {
        if !self.handle.is_active() {
            return false;
        }
        let now = Instant::now();
        if now < self.next_frame {
            return false;
        }
        let fps = self.encoder.preferred_fps().max(1) as u64;
        self.next_frame = now + Duration::from_millis(1000 / fps);
        true
    }

    /// Emit a surface update for `rect`, or for the accumulated dirty region
    /// when `rect` is `None`.
    pub fn send_surface_update(&mut self, rect: Option<Rectangle16>) -> Result<(), RdpError> {
        let bounds = self.surface_bounds();

        {
            let mut dirty = self.handle.dirty.lock();
            if let Some(rect) = rect {
                dirty.union_rect(&rect);
            }
            dirty.intersect_rect(&bounds);
        }

        if !self.handle.is_active() || self.tile_buffer.is_empty() {
            return Ok(());
        }

        let extents = {
            let mut dirty = self.handle.dirty.lock();
            let extents = dirty.extents();
            if extents.is_some() {
                dirty.clear();
            }
            extents
        };
        let Some(extents) = extents else {
            return Ok(());
        };

        let aligned = align16_clamped(
            &extents,
            self.settings.desktop_width,
            self.settings.desktop_height,
        );
        if aligned.is_empty() {
            return Ok(());
        }

        // The guest may switch geometry between the damage report and this
        // capture; skip the torn frame, the pending resize re-triggers.
        let (lw, lh, _, framebuffer) = self.listener.display_params();
        if lw as u16 != self.settings.desktop_width || lh as u16 != self.settings.desktop_height {
            return Ok(());
        }
        let Some(framebuffer) = framebuffer else {
            return Ok(());
        };

        framebuffer.copy_rect(
            aligned.left as usize,
            aligned.top as usize,
            aligned.width() as usize,
            aligned.height() as usize,
            self.source_format,
            lw as usize * self.source_bpp,
            &mut self.tile_buffer,
            self.encode_format,
            self.buf_width as usize * 4,
        );

        if self.settings.remotefx || self.settings.nsc {
            self.send_surface_bits(&aligned)
        } else {
            self.send_bitmap_update(&aligned)
        }
    }

    /// Surface-bits emission: codec-compressed rectangles, wrapped in frame
    /// markers when the frame-ack protocol is on.
    fn send_surface_bits(&mut self, rect: &Rectangle16) -> Result<(), RdpError> {
        let frame_id = if self.encoder.frame_ack() {
            Some(self.encoder.create_frame_id())
        } else {
            None
        };
        let stride = self.buf_width as usize * 4;

        if self.settings.remotefx {
            self.encoder.prepare(Codec::RemoteFx.into(), &self.settings);
            let max_size = self.settings.multifrag_max_request_size as usize;

            let messages = {
                let rfx = self.encoder.rfx().expect("prepared above");
                rfx.encode_messages(rect, &self.tile_buffer, stride, max_size)?
            };
            let count = messages.len();

            for (i, message) in messages.iter().enumerate() {
                let data = self.encoder.write_rfx_message(message);

                let cmd = SurfaceBitsCommand {
                    dest: Rectangle16::new(
                        0,
                        0,
                        self.settings.desktop_width,
                        self.settings.desktop_height,
                    ),
                    bpp: 32,
                    codec: SurfaceCodec::RemoteFx,
                    width: self.settings.desktop_width,
                    height: self.settings.desktop_height,
                    skip_compression: true,
                    data,
                };

                match frame_id {
                    Some(id) => {
                        let first = i == 0;
                        let last = i + 1 == count;
                        self.conn.surface_frame_bits(&cmd, first, last, id)?;
                    }
                    None => self.conn.surface_bits(&cmd)?,
                }
            }
        } else if self.settings.nsc {
            self.encoder.prepare(Codec::Nsc.into(), &self.settings);

            let offset = rect.top as usize * stride + rect.left as usize * 4;
            let tile_buffer = std::mem::take(&mut self.tile_buffer);
            let composed = self.encoder.compose_nsc_message(
                &tile_buffer[offset..],
                rect.width(),
                rect.height(),
                stride,
            );
            self.tile_buffer = tile_buffer;
            let data = composed?;

            let cmd = SurfaceBitsCommand {
                dest: *rect,
                bpp: 32,
                codec: SurfaceCodec::Nsc,
                width: rect.width(),
                height: rect.height(),
                skip_compression: true,
                data,
            };

            match frame_id {
                Some(id) => self.conn.surface_frame_bits(&cmd, true, true, id)?,
                None => self.conn.surface_bits(&cmd)?,
            }
        }

        Ok(())
    }

    /// Bitmap-update emission: 64×64 tiles staged through the encoder grid,
    /// compressed planar at 32bpp or interleaved below, split greedily when
    /// the size estimate exceeds the client's fragment limit.
    fn send_bitmap_update(&mut self, rect: &Rectangle16) -> Result<(), RdpError> {
        let interleaved = self.settings.color_depth < 32;
        let codec = if interleaved {
            Codec::Interleaved
        } else {
            Codec::Planar
        };
        self.encoder.prepare(codec.into(), &self.settings);

        // 4-align the origin outward, then pad the extent to 4.
        let mut left = rect.left as usize;
        let mut top = rect.top as usize;
        let mut width = rect.width() as usize;
        let mut height = rect.height() as usize;

        width += left % 4;
        left -= left % 4;
        height += top % 4;
        top -= top % 4;
        width = width.div_ceil(4) * 4;
        height = height.div_ceil(4) * 4;

        let stride = self.buf_width as usize * 4;
        let buf_w = self.buf_width as usize;
        let buf_h = self.buf_height as usize;
        let rows = height.div_ceil(TILE_SIZE);
        let cols = width.div_ceil(TILE_SIZE);

        let mut tiles = Vec::with_capacity(rows * cols);
        let grid_width = self.encoder.grid().width();

        for row in 0..rows {
            for col in 0..cols {
                let dest_left = left + col * TILE_SIZE;
                let dest_top = top + row * TILE_SIZE;
                let tile_w = TILE_SIZE
                    .min(left + width - dest_left)
                    .min(buf_w.saturating_sub(dest_left));
                let tile_h = TILE_SIZE
                    .min(top + height - dest_top)
                    .min(buf_h.saturating_sub(dest_top));

                if tile_w < 4 || tile_h < 4 {
                    continue;
                }

                // stage the tile through its grid slot, then compress
                let k = (dest_top / TILE_SIZE) * grid_width + dest_left / TILE_SIZE;
                let tile_buffer = std::mem::take(&mut self.tile_buffer);
                self.encoder
                    .stage_tile(&tile_buffer, stride, dest_left, dest_top, tile_w, tile_h, k);
                self.tile_buffer = tile_buffer;
                let staged_pitch = tile_w * 4;

                let (data, bits_per_pixel) = if interleaved {
                    let bits = self.settings.color_depth;
                    let ctx = self.encoder.interleaved().expect("prepared above");
                    let slot = self.encoder.grid().slot(k);
                    let data = ctx.compress(
                        slot,
                        self.encode_format,
                        staged_pitch,
                        0,
                        0,
                        tile_w,
                        tile_h,
                        bits,
                    )?;
                    (data, bits as u16)
                } else {
                    let ctx = self.encoder.planar().expect("prepared above");
                    let slot = self.encoder.grid().slot(k);
                    let data =
                        ctx.compress(slot, self.encode_format, tile_w, tile_h, staged_pitch, 0)?;
                    (data, 32)
                };

                tiles.push(BitmapData {
                    dest_left: dest_left as u16,
                    dest_top: dest_top as u16,
                    width: tile_w as u16,
                    height: tile_h as u16,
                    bits_per_pixel,
                    compressed: true,
                    data,
                });
            }
        }

        let max_update_size = self.settings.multifrag_max_request_size as usize;
        let estimate: usize = tiles.iter().map(|t| t.estimated_size()).sum::<usize>() + 16;

        if estimate > max_update_size {
            // greedy split: pack tiles until the next one would overflow
            let mut batch = Vec::new();
            let mut batch_size = 1024usize;

            for tile in tiles {
                let next = batch_size + tile.estimated_size();
                if !batch.is_empty() && next > max_update_size {
                    self.conn.bitmap_update(&BitmapUpdate {
                        rectangles: std::mem::take(&mut batch),
                    })?;
                    batch_size = 1024;
                }
                batch_size += tile.estimated_size();
                batch.push(tile);
            }
            if !batch.is_empty() {
                self.conn.bitmap_update(&BitmapUpdate { rectangles: batch })?;
            }
        } else if !tiles.is_empty() {
            self.conn.bitmap_update(&BitmapUpdate { rectangles: tiles })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdp::{ClientCapabilities, RecordingSink, ServerUpdate, UpdateSink};
    use crate::router::VmRouter;
    use crate::shmem::{create_test_region, unlink_region, FramebufferView};
    use std::collections::VecDeque;

    /// Scripted connection: hands out queued inputs and shares its recorder
    /// with the test.
    struct ScriptedConnection {
        inputs: VecDeque<ClientInput>,
        sink: Arc<Mutex<RecordingSink>>,
    }

    impl ScriptedConnection {
        fn new() -> (Box<Self>, Arc<Mutex<RecordingSink>>) {
            let sink = Arc::new(Mutex::new(RecordingSink::new()));
            (
                Box::new(Self {
                    inputs: VecDeque::new(),
                    sink: Arc::clone(&sink),
                }),
                sink,
            )
        }
    }

    impl UpdateSink for ScriptedConnection {
        fn desktop_resize(&mut self, w: u16, h: u16, bpp: u32) -> Result<(), RdpError> {
            self.sink.lock().desktop_resize(w, h, bpp)
        }
        fn surface_bits(&mut self, cmd: &SurfaceBitsCommand) -> Result<(), RdpError> {
            self.sink.lock().surface_bits(cmd)
        }
        fn surface_frame_bits(
            &mut self,
            cmd: &SurfaceBitsCommand,
            first: bool,
            last: bool,
            frame_id: u32,
        ) -> Result<(), RdpError> {
            self.sink.lock().surface_frame_bits(cmd, first, last, frame_id)
        }
        fn bitmap_update(&mut self, update: &BitmapUpdate) -> Result<(), RdpError> {
            self.sink.lock().bitmap_update(update)
        }
    }

    impl PeerConnection for ScriptedConnection {
        fn poll_input(&mut self, _timeout: Duration) -> Result<Option<ClientInput>, RdpError> {
            Ok(self.inputs.pop_front())
        }
        fn disconnect(&mut self) {}
    }

    struct Fixture {
        router: Arc<VmRouter>,
        listener: Arc<RdpListener>,
        region: Option<String>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(region) = &self.region {
                unlink_region(region);
            }
        }
    }

    fn fixture(tag: &str) -> Fixture {
        let path =
            std::env::temp_dir().join(format!("rdpmux-peer-{tag}-{}", std::process::id()));
        let router = VmRouter::bind(&path, 39900, false, None).expect("bind router");
        let listener = Arc::new(RdpListener::new(
            "11111111-1111-1111-1111-111111111111",
            1,
            0,
            Arc::downgrade(&router),
            false,
            None,
            None,
        ));
        Fixture {
            router,
            listener,
            region: None,
        }
    }

    /// Give the listener a real mapped framebuffer of the given geometry.
    fn with_display(fixture: &mut Fixture, tag: &str, width: u32, height: u32) {
        let name = format!("/rdpmux-peer-{tag}-{}", std::process::id());
        let data = vec![0x40u8; (width * height * 4) as usize];
        create_test_region(&name, &data);
        let view = FramebufferView::open(&name, data.len()).expect("open view");
        fixture.listener.set_display_for_tests(
            width,
            height,
            GuestFormat::a8r8g8b8,
            Some(Arc::new(view)),
        );
        fixture.region = Some(name);
    }

    fn caps(width: u16, height: u16) -> ClientInput {
        ClientInput::Capabilities(ClientCapabilities {
            width,
            height,
            color_depth: 32,
            supports_remotefx: true,
            supports_nsc: false,
            frame_marker: true,
            multifrag_max_request_size: 0x3f_0000,
            client_dir: None,
        })
    }

    #[test]
    fn capabilities_move_state_forward() {
        let mut fx = fixture("caps");
        with_display(&mut fx, "caps", 1024, 768);

        let (conn, sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));
        assert_eq!(session.state(), PeerState::Init);

        session.handle_input(caps(800, 600)).unwrap();
        assert_eq!(session.state(), PeerState::PostConnect);

        // client asked for 800x600, listener is 1024x768
        let updates = sink.lock();
        assert_eq!(
            updates.updates[0],
            ServerUpdate::DesktopResize {
                width: 1024,
                height: 768,
                bpp: 32
            }
        );
        assert_eq!(session.settings().desktop_width, 1024);
    }

    #[test]
    fn activation_allocates_surface_and_emits_frame() {
        let mut fx = fixture("activate");
        with_display(&mut fx, "activate", 1024, 768);

        let (conn, sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));

        session.handle_input(caps(1024, 768)).unwrap();
        session.handle_input(ClientInput::Activate).unwrap();
        assert_eq!(session.state(), PeerState::Activated);
        assert!(session.handle().is_active());
        assert_eq!(session.tile_buffer_len(), 1024 * 768 * 4);
        assert_eq!(session.encoder().grid().width(), 16);
        assert_eq!(session.encoder().grid().height(), 12);

        // full refresh is pending in the dirty region
        session.send_surface_update(None).unwrap();
        assert!(sink
            .lock()
            .updates
            .iter()
            .any(|u| matches!(u, ServerUpdate::SurfaceFrameBits { .. })));
    }

    #[test]
    fn frame_ids_wrap_fragments_of_one_frame() {
        let mut fx = fixture("frames");
        with_display(&mut fx, "frames", 256, 256);

        let (conn, sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));
        session.handle_input(caps(256, 256)).unwrap();
        session.handle_input(ClientInput::Activate).unwrap();
        session.send_surface_update(None).unwrap();

        let updates = sink.lock();
        let frames: Vec<_> = updates
            .updates
            .iter()
            .filter_map(|u| match u {
                ServerUpdate::SurfaceFrameBits {
                    first,
                    last,
                    frame_id,
                    ..
                } => Some((*first, *last, *frame_id)),
                _ => None,
            })
            .collect();
        assert!(!frames.is_empty());
        assert!(frames.first().unwrap().0);
        assert!(frames.last().unwrap().1);
        assert!(frames.iter().all(|(_, _, id)| *id == frames[0].2));
    }

    #[test]
    fn resize_recreates_surface_and_deactivates() {
        let mut fx = fixture("resize");
        with_display(&mut fx, "resize", 1024, 768);

        let (conn, sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));
        session.handle_input(caps(1024, 768)).unwrap();
        session.handle_input(ClientInput::Activate).unwrap();

        // guest switches to 1280x720
        fx.listener
            .set_display_for_tests(1280, 720, GuestFormat::a8r8g8b8, None);
        session.check_resize().unwrap();

        assert_eq!(session.state(), PeerState::Resizing);
        assert!(!session.handle().is_active());
        assert_eq!(session.tile_buffer_len(), 1280 * 720 * 4);
        assert_eq!(session.encoder().grid().width(), 20);
        assert_eq!(session.encoder().grid().height(), 12);

        assert!(sink.lock().updates.contains(&ServerUpdate::DesktopResize {
            width: 1280,
            height: 720,
            bpp: 32
        }));
    }

    #[test]
    fn input_events_reach_outbound_queue() {
        let fx = fixture("input");
        let (conn, _sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));

        session
            .handle_input(ClientInput::Mouse {
                flags: 0x1000,
                x: 10,
                y: 20,
            })
            .unwrap();
        session
            .handle_input(ClientInput::Keyboard {
                flags: 0x8000,
                code: 0x1e,
            })
            .unwrap();

        let items = fx.router.drain_outbound();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].payload, vec![3, 10, 20, 0x1000]);
        assert_eq!(items[1].payload, vec![4, 0x1e, 0x8000]);
    }

    #[test]
    fn frame_ack_updates_encoder() {
        let mut fx = fixture("ack");
        with_display(&mut fx, "ack", 256, 256);

        let (conn, _sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));
        session.handle_input(caps(256, 256)).unwrap();
        session.handle_input(ClientInput::Activate).unwrap();

        // stream a few frames so there are real ids to acknowledge
        for _ in 0..3 {
            session
                .send_surface_update(Some(Rectangle16::new(0, 0, 64, 64)))
                .unwrap();
        }
        let sent = session.encoder().frame_id();
        assert!(sent >= 3);

        session
            .handle_input(ClientInput::FrameAcknowledge { frame_id: sent - 1 })
            .unwrap();
        assert_eq!(session.encoder().last_ack_frame_id(), sent - 1);

        // an ack for a frame that was never sent is clamped, keeping
        // last_ack_frame_id <= frame_id
        session
            .handle_input(ClientInput::FrameAcknowledge {
                frame_id: sent + 1000,
            })
            .unwrap();
        assert_eq!(session.encoder().last_ack_frame_id(), sent);
        assert!(session.encoder().last_ack_frame_id() <= session.encoder().frame_id());
        assert_eq!(session.encoder().inflight_frames(), 0);
    }

    #[test]
    fn inactive_peer_emits_nothing() {
        let mut fx = fixture("inactive");
        with_display(&mut fx, "inactive", 256, 256);

        let (conn, sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));
        session.handle_input(caps(256, 256)).unwrap();

        // not activated: updates beyond the initial resize must not appear
        session
            .send_surface_update(Some(Rectangle16::new(0, 0, 64, 64)))
            .unwrap();
        assert!(sink
            .lock()
            .updates
            .iter()
            .all(|u| matches!(u, ServerUpdate::DesktopResize { .. })));
    }

    #[test]
    fn refresh_rect_is_clipped_to_surface() {
        let mut fx = fixture("refresh");
        with_display(&mut fx, "refresh", 256, 256);

        let (conn, _sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));
        session.handle_input(caps(256, 256)).unwrap();

        session
            .handle_input(ClientInput::RefreshRect(vec![Rectangle16::new(
                128, 128, 512, 512,
            )]))
            .unwrap();

        let dirty = session.handle().dirty.lock().extents().unwrap();
        assert_eq!(dirty, Rectangle16::new(128, 128, 256, 256));
    }

    #[test]
    fn bitmap_path_splits_on_small_multifrag() {
        let mut fx = fixture("bitmap");
        with_display(&mut fx, "bitmap", 256, 256);

        let (conn, sink) = ScriptedConnection::new();
        let mut session = PeerSession::new(conn, Arc::clone(&fx.listener));

        // no surface codec support, tiny fragment limit
        session
            .handle_input(ClientInput::Capabilities(ClientCapabilities {
                width: 256,
                height: 256,
                color_depth: 32,
                supports_remotefx: false,
                supports_nsc: false,
                frame_marker: false,
                multifrag_max_request_size: 256,
                client_dir: None,
            }))
            .unwrap();
        session.handle_input(ClientInput::Activate).unwrap();
        session.send_surface_update(None).unwrap();

        let updates = sink.lock();
        let batches: Vec<_> = updates
            .updates
            .iter()
            .filter_map(|u| match u {
                ServerUpdate::Bitmap(b) => Some(b),
                _ => None,
            })
            .collect();
        assert!(batches.len() > 1, "expected multifrag split");
        let tiles: usize = batches.iter().map(|b| b.rectangles.len()).sum();
        assert_eq!(tiles, 4 * 4); // 256/64 per side
    }
}
