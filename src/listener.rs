//! Per-VM listener
//!
//! One listener per registered guest. It owns the framebuffer view, the
//! dirty-region set, the current display geometry and the peer registry; its
//! loop accepts RDP connections on the VM's TCP port and drives the periodic
//! frame tick that fans capture rectangles out to every connected peer.
//!
//! Incoming guest messages are dispatched here by the router; outgoing input
//! messages are handed back to the router's outbound queue.

use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{align16_clamped, Rectangle16, Region16};
use crate::peer::{PeerHandle, PeerSession};
use crate::protocol::{GuestEvent, GuestFormat, ProtocolError};
use crate::rdp::PeerTransport;
use crate::router::VmRouter;
use crate::shmem::{region_name, FramebufferView, ShmError, MAX_HEIGHT, MAX_WIDTH, SHM_CAPACITY};

/// Default capture tick rate.
pub const DEFAULT_TICK_FPS: u32 = 30;

/// How long the accept loop sleeps when idle.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Display geometry, dirty region and the shared-memory view, all guarded by
/// one short-held mutex.
struct DisplayState {
    width: u32,
    height: u32,
    format: Option<GuestFormat>,
    dirty: Region16,
    framebuffer: Option<Arc<FramebufferView>>,
}

/// Per-VM listener: TCP port owner, framebuffer owner, peer registry.
pub struct RdpListener {
    uuid: String,
    vm_id: i32,
    port: u16,
    router: Weak<VmRouter>,
    tls: Option<Arc<rustls::ServerConfig>>,

    display: Mutex<DisplayState>,
    peers: Mutex<Vec<Arc<PeerHandle>>>,
    peer_threads: Mutex<Vec<JoinHandle<()>>>,

    authenticating: Mutex<bool>,
    credential_path: Mutex<Option<PathBuf>>,
    target_fps: AtomicU32,
    stop: Mutex<bool>,
}

impl RdpListener {
    /// Create a listener for a registered VM. No I/O happens here; call
    /// [`bind`](Self::bind) and [`run`](Self::run) afterwards.
    pub fn new(
        uuid: &str,
        vm_id: i32,
        port: u16,
        router: Weak<VmRouter>,
        authenticating: bool,
        credential_path: Option<PathBuf>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            uuid: uuid.to_owned(),
            vm_id,
            port,
            router,
            tls,
            display: Mutex::new(DisplayState {
                width: 0,
                height: 0,
                format: None,
                dirty: Region16::new(),
                framebuffer: None,
            }),
            peers: Mutex::new(Vec::new()),
            peer_threads: Mutex::new(Vec::new()),
            authenticating: Mutex::new(authenticating),
            credential_path: Mutex::new(credential_path),
            target_fps: AtomicU32::new(DEFAULT_TICK_FPS),
            stop: Mutex::new(false),
        }
    }

    /// Bind the listener's TCP port. Port-in-use is fatal for the listener
    /// and reported to the caller before any thread is spawned.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let socket = TcpListener::bind(("0.0.0.0", self.port))?;
        socket.set_nonblocking(true)?;
        info!(uuid = %self.uuid, port = self.port, "listener bound");
        Ok(socket)
    }

    /// Accept connections and drive the frame tick until stopped. On exit,
    /// closes every peer, releases the framebuffer mapping and unregisters
    /// from the router.
    pub fn run(self: &Arc<Self>, socket: TcpListener) {
        info!(uuid = %self.uuid, port = self.port, "listener running");
        let mut next_tick = Instant::now();

        loop {
            if *self.stop.lock() {
                break;
            }

            match socket.accept() {
                Ok((stream, addr)) => {
                    info!(uuid = %self.uuid, %addr, "rdp client connected");
                    self.spawn_peer(stream);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!(uuid = %self.uuid, "accept failed: {e}"),
            }

            let now = Instant::now();
            if now >= next_tick {
                self.frame_tick();
                let fps = self.target_fps.load(Ordering::Relaxed).max(1);
                next_tick = now + Duration::from_millis(1000 / fps as u64);
            }

            // wake on the soonest of stop, accept poll and frame deadline
            let wait = next_tick
                .saturating_duration_since(Instant::now())
                .min(ACCEPT_POLL);
            std::thread::sleep(wait);
        }

        self.teardown();
    }

    fn spawn_peer(self: &Arc<Self>, stream: std::net::TcpStream) {
        let tls = self.tls.clone();
        let listener = Arc::clone(self);

        // transport setup, including the TLS handshake, runs on the peer's
        // own thread; the accept loop never blocks on a client
        let handle = std::thread::spawn(move || {
            let transport = match tls {
                Some(config) => PeerTransport::new_tls(stream, config),
                None => PeerTransport::new(stream),
            };

            match transport {
                Ok(t) => PeerSession::new(Box::new(t), listener).run(),
                Err(e) => {
                    warn!(uuid = %listener.uuid, "peer transport setup failed: {e}");
                }
            }
        });
        self.peer_threads.lock().push(handle);
    }

    /// One capture tick: take the dirty extents, clip them to the surface,
    /// 16-align outward and hand the rectangle to every connected peer.
    fn frame_tick(&self) {
        let peers = self.peers.lock().clone();
        if peers.is_empty() {
            return;
        }

        let aligned = {
            let mut display = self.display.lock();
            if display.framebuffer.is_none() {
                return;
            }
            let bounds = Rectangle16::new(0, 0, display.width as u16, display.height as u16);
            display.dirty.intersect_rect(&bounds);

            let Some(extents) = display.dirty.extents() else {
                return;
            };
            display.dirty.clear();

            align16_clamped(&extents, bounds.right, bounds.bottom)
        };

        if aligned.is_empty() {
            return;
        }

        for peer in &peers {
            peer.push_damage(&aligned);
        }
    }

    fn teardown(self: &Arc<Self>) {
        info!(uuid = %self.uuid, "listener stopping");

        for peer in self.peers.lock().iter() {
            peer.request_stop();
        }
        let threads: Vec<_> = self.peer_threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        self.peers.lock().clear();

        {
            let mut display = self.display.lock();
            display.framebuffer = None;
        }

        if let Some(router) = self.router.upgrade() {
            router.unregister_vm(&self.uuid, self.port);
        }
        info!(uuid = %self.uuid, "listener stopped");
    }

    /// Dispatch one decoded guest message.
    pub fn handle_incoming(&self, words: &[u32]) {
        match GuestEvent::parse(words) {
            Ok(GuestEvent::DisplayUpdate { x, y, w, h }) => self.process_display_update(x, y, w, h),
            Ok(GuestEvent::DisplaySwitch {
                format,
                width,
                height,
            }) => self.process_display_switch(format, width, height),
            Ok(GuestEvent::Shutdown) => {
                info!(uuid = %self.uuid, "shutdown event received");
                *self.stop.lock() = true;
            }
            Err(ProtocolError::UnknownTag(tag)) => {
                warn!(uuid = %self.uuid, tag, "invalid message type sent");
            }
            Err(e) => {
                warn!(uuid = %self.uuid, "malformed guest message: {e}");
            }
        }
    }

    fn process_display_update(&self, x: u32, y: u32, w: u32, h: u32) {
        let mut display = self.display.lock();

        // clamp to the current framebuffer bounds; guest-supplied extents
        // can be arbitrary, the edge math saturates rather than wraps
        let x = x.min(display.width);
        let y = y.min(display.height);
        let right = x.saturating_add(w).min(display.width) as u16;
        let bottom = y.saturating_add(h).min(display.height) as u16;

        let rect = Rectangle16::new(x as u16, y as u16, right, bottom);
        if !rect.is_empty() {
            display.dirty.union_rect(&rect);
        }
    }

    fn process_display_switch(&self, format_code: u32, width: u32, height: u32) {
        let Some(format) = GuestFormat::from_code(format_code) else {
            warn!(uuid = %self.uuid, format_code, "unknown pixel format, ignoring display switch");
            return;
        };

        if width > MAX_WIDTH || height > MAX_HEIGHT {
            warn!(
                uuid = %self.uuid,
                width, height, "display switch exceeds framebuffer capacity, ignoring"
            );
            return;
        }

        let mut display = self.display.lock();

        if display.framebuffer.is_none() {
            let name = region_name(self.vm_id);
            debug!(uuid = %self.uuid, %name, "mapping framebuffer region");
            match FramebufferView::open(&name, SHM_CAPACITY) {
                Ok(view) => display.framebuffer = Some(Arc::new(view)),
                Err(e @ ShmError::Open { .. }) | Err(e @ ShmError::Map { .. }) => {
                    // surfaced once per event; the next switch retries
                    warn!(uuid = %self.uuid, "framebuffer mapping failed: {e}");
                    return;
                }
            }
        }

        display.width = width;
        display.height = height;
        display.format = Some(format);
        debug!(uuid = %self.uuid, width, height, ?format, "display switch processed");
    }

    /// Queue an input or acknowledgement message toward the guest.
    pub fn process_outgoing(&self, payload: Vec<u16>) {
        match self.router.upgrade() {
            Some(router) => router.queue_outbound(crate::router::OutboundItem {
                uuid: self.uuid.clone(),
                payload,
            }),
            None => warn!(uuid = %self.uuid, "router gone, dropping outgoing message"),
        }
    }

    /// Add a peer to the registry.
    pub fn register_peer(&self, peer: Arc<PeerHandle>) {
        debug!(uuid = %self.uuid, peer = peer.id(), "peer registered");
        self.peers.lock().push(peer);
    }

    /// Remove a peer from the registry. Idempotent.
    pub fn unregister_peer(&self, id: u64) {
        debug!(uuid = %self.uuid, peer = id, "peer unregistered");
        self.peers.lock().retain(|p| p.id() != id);
    }

    /// Current display parameters: geometry, guest format and the mapped
    /// framebuffer, if any.
    pub fn display_params(
        &self,
    ) -> (u32, u32, Option<GuestFormat>, Option<Arc<FramebufferView>>) {
        let display = self.display.lock();
        (
            display.width,
            display.height,
            display.format,
            display.framebuffer.clone(),
        )
    }

    /// Ask the listener loop to exit.
    pub fn shutdown(&self) {
        *self.stop.lock() = true;
    }

    /// Whether the loop has been asked to stop.
    pub fn stopping(&self) -> bool {
        *self.stop.lock()
    }

    /// The VM's UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The listener's TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of connected peers.
    pub fn connected_peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether new peers must authenticate.
    pub fn requires_authentication(&self) -> bool {
        *self.authenticating.lock()
    }

    /// Toggle authentication. On selects the stronger security tier for
    /// subsequently accepted peers; off selects the lower tier.
    pub fn set_authentication(&self, enabled: bool) {
        info!(uuid = %self.uuid, enabled, "authentication toggled");
        *self.authenticating.lock() = enabled;
    }

    /// Path of the credential file handed to authenticating peers.
    pub fn credential_path(&self) -> Option<PathBuf> {
        self.credential_path.lock().clone()
    }

    /// Bind a credential file for subsequently accepted peers.
    pub fn set_credential_path(&self, path: PathBuf) {
        info!(uuid = %self.uuid, path = %path.display(), "credential file set");
        *self.credential_path.lock() = Some(path);
    }

    /// Capture tick rate.
    pub fn target_fps(&self) -> u32 {
        self.target_fps.load(Ordering::Relaxed)
    }

    /// Adjust the capture tick rate.
    pub fn set_target_fps(&self, fps: u32) {
        self.target_fps.store(fps.max(1), Ordering::Relaxed);
    }

    /// Dirty-region extents, exposed for inspection.
    pub fn dirty_extents(&self) -> Option<Rectangle16> {
        self.display.lock().dirty.extents()
    }

    #[cfg(test)]
    pub(crate) fn set_display_for_tests(
        &self,
        width: u32,
        height: u32,
        format: GuestFormat,
        framebuffer: Option<Arc<FramebufferView>>,
    ) {
        let mut display = self.display.lock();
        display.width = width;
        display.height = height;
        display.format = Some(format);
        display.framebuffer = framebuffer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tag;

    fn listener() -> Arc<RdpListener> {
        Arc::new(RdpListener::new(
            "11111111-1111-1111-1111-111111111111",
            1,
            0,
            Weak::new(),
            false,
            None,
            None,
        ))
    }

    #[test]
    fn display_update_merges_into_dirty_region() {
        let l = listener();
        l.set_display_for_tests(1024, 768, GuestFormat::a8r8g8b8, None);

        l.handle_incoming(&[tag::DISPLAY_UPDATE, 0, 0, 64, 64]);
        assert_eq!(l.dirty_extents().unwrap(), Rectangle16::new(0, 0, 64, 64));

        // applying the same update twice leaves the set unchanged
        l.handle_incoming(&[tag::DISPLAY_UPDATE, 0, 0, 64, 64]);
        assert_eq!(l.dirty_extents().unwrap(), Rectangle16::new(0, 0, 64, 64));
    }

    #[test]
    fn display_update_is_clamped_to_bounds() {
        let l = listener();
        l.set_display_for_tests(640, 480, GuestFormat::a8r8g8b8, None);

        l.handle_incoming(&[tag::DISPLAY_UPDATE, 600, 400, 200, 200]);
        assert_eq!(
            l.dirty_extents().unwrap(),
            Rectangle16::new(600, 400, 640, 480)
        );
    }

    #[test]
    fn display_update_with_huge_extent_saturates() {
        let l = listener();
        l.set_display_for_tests(640, 480, GuestFormat::a8r8g8b8, None);

        // widths near u32::MAX must clamp to the surface, not wrap
        l.handle_incoming(&[tag::DISPLAY_UPDATE, 16, 16, u32::MAX, u32::MAX - 7]);
        assert_eq!(
            l.dirty_extents().unwrap(),
            Rectangle16::new(16, 16, 640, 480)
        );

        // an origin past the bounds collapses to an empty rect
        l.handle_incoming(&[tag::DISPLAY_UPDATE, u32::MAX, u32::MAX, 64, 64]);
        assert_eq!(
            l.dirty_extents().unwrap(),
            Rectangle16::new(16, 16, 640, 480)
        );
    }

    #[test]
    fn unknown_format_drops_switch() {
        let l = listener();
        l.handle_incoming(&[tag::DISPLAY_SWITCH, 0xdead_beef, 800, 600]);
        let (w, h, format, _) = l.display_params();
        assert_eq!((w, h), (0, 0));
        assert!(format.is_none());
    }

    #[test]
    fn oversized_switch_is_ignored() {
        let l = listener();
        l.handle_incoming(&[tag::DISPLAY_SWITCH, 0x2002_8888, 8192, 600]);
        let (w, _, _, _) = l.display_params();
        assert_eq!(w, 0);
    }

    #[test]
    fn shutdown_event_sets_stop() {
        let l = listener();
        assert!(!l.stopping());
        l.handle_incoming(&[tag::SHUTDOWN]);
        assert!(l.stopping());
    }

    #[test]
    fn unknown_tag_is_dropped() {
        let l = listener();
        l.handle_incoming(&[99, 1, 2, 3]);
        assert!(!l.stopping());
        assert!(l.dirty_extents().is_none());
    }

    #[test]
    fn authentication_toggles() {
        let l = listener();
        assert!(!l.requires_authentication());
        l.set_authentication(true);
        assert!(l.requires_authentication());
        l.set_credential_path(PathBuf::from("/etc/rdpmux/creds"));
        assert_eq!(
            l.credential_path(),
            Some(PathBuf::from("/etc/rdpmux/creds"))
        );
    }

    #[test]
    fn tick_rate_is_adjustable() {
        let l = listener();
        assert_eq!(l.target_fps(), DEFAULT_TICK_FPS);
        l.set_target_fps(60);
        assert_eq!(l.target_fps(), 60);
        l.set_target_fps(0);
        assert_eq!(l.target_fps(), 1);
    }
}
