//! VM router
//!
//! Owns the guest-facing datagram socket and the process-wide VM state: the
//! UUID → listener map, the UUID → identity map used to address replies, and
//! the allocated-port set. A single loop drains the outbound queue and polls
//! the socket with a short timeout; per-message failures are logged and
//! dropped, socket failures other than timeouts end the loop.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::TcpListener;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::listener::RdpListener;
use crate::protocol::{decode_frame, encode_frame, widen};
use crate::utils::MessageQueue;

/// Socket poll timeout; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors surfaced by VM registration.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Every port from the base up is taken.
    #[error("no free port at or above {0}")]
    NoFreePort(u16),

    /// The UUID already has a listener.
    #[error("vm {0} is already registered")]
    AlreadyRegistered(String),

    /// The listener could not bind its port.
    #[error("listener start failed: {0}")]
    ListenerStart(#[from] io::Error),
}

/// An outbound message: a typed input or acknowledgement payload tagged with
/// the destination VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundItem {
    /// Destination VM
    pub uuid: String,
    /// Payload words, widened on send
    pub payload: Vec<u16>,
}

/// Owner of the guest socket and the per-process VM state.
pub struct VmRouter {
    socket: UnixDatagram,
    socket_path: PathBuf,
    base_port: u16,
    authenticate: bool,
    tls: Option<Arc<rustls::ServerConfig>>,

    listeners: Mutex<HashMap<String, Arc<RdpListener>>>,
    identities: Mutex<HashMap<String, PathBuf>>,
    ports: Mutex<BTreeSet<u16>>,
    outbound: MessageQueue<OutboundItem>,
    listener_threads: Mutex<Vec<JoinHandle<()>>>,
    capture_fps: AtomicU32,
    stop: Mutex<bool>,
}

impl VmRouter {
    /// Bind the router socket at `path`. A stale socket file from a previous
    /// run is removed first.
    pub fn bind(
        path: &Path,
        base_port: u16,
        authenticate: bool,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> io::Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let socket = UnixDatagram::bind(path)?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        info!(path = %path.display(), base_port, "router socket bound");

        Ok(Arc::new(Self {
            socket,
            socket_path: path.to_owned(),
            base_port,
            authenticate,
            tls,
            listeners: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
            ports: Mutex::new(BTreeSet::new()),
            outbound: MessageQueue::new(),
            listener_threads: Mutex::new(Vec::new()),
            capture_fps: AtomicU32::new(crate::listener::DEFAULT_TICK_FPS),
            stop: Mutex::new(false),
        }))
    }

    /// The bound socket path, returned to guests at registration.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Capture tick rate handed to newly registered listeners.
    pub fn set_capture_fps(&self, fps: u32) {
        self.capture_fps.store(fps.max(1), Ordering::Relaxed);
    }

    /// Register a VM: allocate a port, construct its listener, run it on a
    /// dedicated thread. No partially-registered state survives a failure.
    pub fn register_vm(
        self: &Arc<Self>,
        uuid: &str,
        vm_id: i32,
        credential_path: Option<PathBuf>,
        port_hint: u16,
    ) -> Result<u16, RouterError> {
        if self.listeners.lock().contains_key(uuid) {
            return Err(RouterError::AlreadyRegistered(uuid.to_owned()));
        }

        let port = self.allocate_port(port_hint)?;

        let listener = Arc::new(RdpListener::new(
            uuid,
            vm_id,
            port,
            Arc::downgrade(self),
            self.authenticate,
            credential_path,
            self.tls.clone(),
        ));
        listener.set_target_fps(self.capture_fps.load(Ordering::Relaxed));

        let socket = match listener.bind() {
            Ok(s) => s,
            Err(e) => {
                self.ports.lock().remove(&port);
                return Err(RouterError::ListenerStart(e));
            }
        };

        self.listeners.lock().insert(uuid.to_owned(), Arc::clone(&listener));

        let worker = Arc::clone(&listener);
        let handle = std::thread::spawn(move || worker.run(socket));
        self.listener_threads.lock().push(handle);

        info!(uuid, port, "vm registered");
        Ok(port)
    }

    /// Pick the smallest free port `p ≥ base` (or the hint, when given) that
    /// actually binds, and claim it.
    fn allocate_port(&self, hint: u16) -> Result<u16, RouterError> {
        let mut ports = self.ports.lock();

        let probe = |p: u16, ports: &BTreeSet<u16>| -> bool {
            !ports.contains(&p) && TcpListener::bind(("0.0.0.0", p)).is_ok()
        };

        if hint != 0 && probe(hint, &ports) {
            ports.insert(hint);
            return Ok(hint);
        }

        for p in self.base_port..u16::MAX {
            if probe(p, &ports) {
                ports.insert(p);
                return Ok(p);
            }
        }

        Err(RouterError::NoFreePort(self.base_port))
    }

    /// Remove a VM from the maps and release its port. Idempotent.
    pub fn unregister_vm(&self, uuid: &str, port: u16) {
        self.listeners.lock().remove(uuid);
        self.identities.lock().remove(uuid);
        self.ports.lock().remove(&port);
        debug!(uuid, port, "vm unregistered");
    }

    /// Look up a VM's listener.
    pub fn listener(&self, uuid: &str) -> Option<Arc<RdpListener>> {
        self.listeners.lock().get(uuid).cloned()
    }

    /// Registered VM count.
    pub fn vm_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether a port is currently claimed.
    pub fn port_in_use(&self, port: u16) -> bool {
        self.ports.lock().contains(&port)
    }

    /// Push an outbound message; the loop drains the queue on its next turn.
    pub fn queue_outbound(&self, item: OutboundItem) {
        self.outbound.enqueue(item);
    }

    /// Take every queued outbound item.
    pub fn drain_outbound(&self) -> Vec<OutboundItem> {
        self.outbound.try_drain()
    }

    /// Send one outbound message to the last identity seen for its UUID.
    /// With no identity on file yet the message is logged and dropped; the
    /// next inbound message from that VM repopulates the map.
    fn send(&self, item: &OutboundItem) {
        let target = self.identities.lock().get(&item.uuid).cloned();
        let Some(target) = target else {
            warn!(uuid = %item.uuid, "no identity known yet, dropping outbound message");
            return;
        };

        let frame = encode_frame(&item.uuid, &widen(&item.payload));
        if let Err(e) = self.socket.send_to(&frame, &target) {
            warn!(uuid = %item.uuid, "outbound send failed: {e}");
        }
    }

    /// The router loop: drain outbound, poll the socket, dispatch. Returns
    /// when the stop flag is raised or the socket fails hard.
    pub fn run(&self) {
        info!("router loop running");
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            if *self.stop.lock() {
                info!("router loop terminating on stop");
                break;
            }

            for item in self.drain_outbound() {
                self.send(&item);
            }

            match self.socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let identity = addr.as_pathname().map(Path::to_owned);
                    self.dispatch(&buf[..len], identity);
                }
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
                Err(e) => {
                    error!("router socket failed: {e}");
                    break;
                }
            }
        }
    }

    /// Decode one inbound frame and hand it to the addressed listener.
    /// Malformed frames and unknown UUIDs are logged and dropped. The
    /// identity map is only written for UUIDs with a registered listener.
    fn dispatch(&self, data: &[u8], identity: Option<PathBuf>) {
        let (uuid, words) = match decode_frame(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("malformed guest frame: {e}");
                return;
            }
        };

        let Some(listener) = self.listener(&uuid) else {
            warn!(%uuid, "listener does not exist in map");
            return;
        };

        if let Some(identity) = identity {
            self.identities.lock().insert(uuid.clone(), identity);
        }

        listener.handle_incoming(&words);
    }

    /// Stop the router loop and every listener, then wait for the listener
    /// threads to finish. Listener teardown unregisters each VM in turn.
    pub fn shutdown(&self) {
        info!("router shutting down");
        *self.stop.lock() = true;

        let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener.shutdown();
        }

        let threads: Vec<_> = self.listener_threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for VmRouter {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
