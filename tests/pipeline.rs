//! End-to-end pipeline tests
//!
//! Drives the whole display path over real sockets and shared memory: a fake
//! guest registers through the management surface, publishes a framebuffer
//! and damage over the router socket, and a fake RDP client connects over
//! TCP, activates and receives encoded updates while its input flows back to
//! the guest.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::num::NonZeroUsize;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rdpmux::management::MuxInterface;
use rdpmux::protocol::{self, tag, PROTOCOL_VERSION};
use rdpmux::rdp::{
    parse_server_update, write_client_input, ClientCapabilities, ClientInput, ServerUpdate,
};
use rdpmux::router::VmRouter;
use rdpmux::shmem::{region_name, unlink_region, SHM_CAPACITY};

const UUID: &str = "11111111-1111-1111-1111-111111111111";
const FORMAT_A8R8G8B8: u32 = 0x2002_8888;

/// A fake guest: its own datagram socket plus the published framebuffer.
struct Guest {
    socket: UnixDatagram,
    router_path: PathBuf,
    region: String,
}

impl Guest {
    fn new(tag: &str, vm_id: i32, router_path: &PathBuf) -> Self {
        // create and size the shared framebuffer region
        let region = region_name(vm_id);
        unlink_region(&region);
        create_region(&region, SHM_CAPACITY);

        let path = std::env::temp_dir().join(format!(
            "rdpmux-guest-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path).expect("bind guest socket");
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("guest read timeout");

        Self {
            socket,
            router_path: router_path.clone(),
            region,
        }
    }

    fn send(&self, words: &[u32]) {
        let frame = protocol::encode_frame(UUID, words);
        self.socket
            .send_to(&frame, &self.router_path)
            .expect("guest send");
    }

    fn fill(&self, width: usize, height: usize, pixel: [u8; 4]) {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_exact_mut(4) {
            px.copy_from_slice(&pixel);
        }
        write_region(&self.region, &data);
    }

    /// Wait for one outbound message addressed to this guest.
    fn recv(&self, deadline: Duration) -> Option<Vec<u32>> {
        let until = Instant::now() + deadline;
        let mut buf = vec![0u8; 64 * 1024];
        while Instant::now() < until {
            match self.socket.recv(&mut buf) {
                Ok(len) => {
                    let (uuid, words) = protocol::decode_frame(&buf[..len]).expect("guest frame");
                    assert_eq!(uuid, UUID);
                    return Some(words);
                }
                Err(_) => continue,
            }
        }
        None
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        unlink_region(&self.region);
    }
}

/// A fake RDP client over the real TCP transport.
struct Client {
    stream: TcpStream,
    inbound: BytesMut,
}

impl Client {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect client");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("client read timeout");
        Self {
            stream,
            inbound: BytesMut::new(),
        }
    }

    fn send(&mut self, input: &ClientInput) {
        let mut out = BytesMut::new();
        write_client_input(input, &mut out);
        self.stream.write_all(&out).expect("client send");
    }

    /// Read one server update, waiting up to `deadline`.
    fn recv(&mut self, deadline: Duration) -> Option<ServerUpdate> {
        let until = Instant::now() + deadline;
        loop {
            if self.inbound.len() >= 5 {
                let len = u32::from_le_bytes([
                    self.inbound[1],
                    self.inbound[2],
                    self.inbound[3],
                    self.inbound[4],
                ]) as usize;
                if self.inbound.len() >= 5 + len {
                    let pdu_type = self.inbound[0];
                    let body = self.inbound[5..5 + len].to_vec();
                    let _ = self.inbound.split_to(5 + len);
                    return Some(parse_server_update(pdu_type, &body).expect("server update"));
                }
            }

            if Instant::now() >= until {
                return None;
            }

            let mut buf = [0u8; 64 * 1024];
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                Err(_) => continue,
            }
        }
    }

    /// Drain updates until one matches, or the deadline passes.
    fn expect_update<F: Fn(&ServerUpdate) -> bool>(
        &mut self,
        deadline: Duration,
        what: &str,
        matches: F,
    ) -> ServerUpdate {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if let Some(update) = self.recv(Duration::from_millis(200)) {
                if matches(&update) {
                    return update;
                }
            }
        }
        panic!("timed out waiting for {what}");
    }
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

fn create_region(name: &str, capacity: usize) {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    let fd = nix::sys::mman::shm_open(
        name,
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .expect("shm_open create");
    nix::unistd::ftruncate(fd, capacity as i64).expect("ftruncate");
    nix::unistd::close(fd).expect("close");
}

fn write_region(name: &str, data: &[u8]) {
    use nix::fcntl::OFlag;
    use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
    use nix::sys::stat::Mode;

    let fd = nix::sys::mman::shm_open(name, OFlag::O_RDWR, Mode::empty()).expect("shm_open rw");
    let base = unsafe {
        mmap(
            None,
            NonZeroUsize::new(data.len()).unwrap(),
            ProtFlags::PROT_WRITE | ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
        .expect("mmap rw")
    };
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), base as *mut u8, data.len());
        munmap(base, data.len()).expect("munmap");
    }
    nix::unistd::close(fd).expect("close");
}

struct Harness {
    router: Arc<VmRouter>,
    iface: MuxInterface,
    router_thread: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn start(tag: &str, base_port: u16) -> Self {
        let path =
            std::env::temp_dir().join(format!("rdpmux-e2e-{tag}-{}", std::process::id()));
        let router = VmRouter::bind(&path, base_port, false, None).expect("bind router");

        let loop_router = Arc::clone(&router);
        let router_thread = Some(std::thread::spawn(move || loop_router.run()));

        Self {
            iface: MuxInterface::new(Arc::clone(&router)),
            router,
            router_thread,
        }
    }

    fn register(&self, vm_id: i32) -> u16 {
        let reply = self
            .iface
            .handle_register(vm_id, PROTOCOL_VERSION, UUID, 0);
        assert!(reply.starts_with("ipc://"), "registration refused: {reply:?}");
        let listener = self.router.listener(UUID).expect("listener registered");
        listener.port()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.router.shutdown();
        if let Some(handle) = self.router_thread.take() {
            let _ = handle.join();
        }
    }
}

fn wait_for<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn register_switch_update_and_stream() {
    let harness = Harness::start("stream", 40200);
    let port = harness.register(901);

    let guest = Guest::new("stream", 901, &PathBuf::from(harness.router.socket_path()));
    guest.fill(640, 480, [0x20, 0x40, 0x60, 0xff]);

    // display switch: the listener maps the region and adopts the geometry
    guest.send(&[tag::DISPLAY_SWITCH, FORMAT_A8R8G8B8, 640, 480]);
    let listener = harness.router.listener(UUID).expect("listener");
    assert!(
        wait_for(Duration::from_secs(2), || listener.display_params().0 == 640),
        "display switch not processed"
    );

    // client connects, negotiates and activates
    let mut client = Client::connect(port);
    client.send(&caps(640, 480));
    client.send(&ClientInput::Activate);

    // activation triggers a full refresh
    let update = client.expect_update(Duration::from_secs(3), "initial frame", |u| {
        matches!(u, ServerUpdate::SurfaceFrameBits { .. })
    });
    if let ServerUpdate::SurfaceFrameBits { cmd, .. } = &update {
        assert_eq!(cmd.width, 640);
        assert_eq!(cmd.height, 480);
    }

    // a damage report flows through the tick into another update
    guest.send(&[tag::DISPLAY_UPDATE, 0, 0, 64, 64]);
    client.expect_update(Duration::from_secs(3), "damage frame", |u| {
        matches!(u, ServerUpdate::SurfaceFrameBits { .. })
    });

    // client input is forwarded to the guest as a typed message
    client.send(&ClientInput::Mouse {
        flags: 0x1000,
        x: 100,
        y: 120,
    });
    let words = guest
        .recv(Duration::from_secs(3))
        .expect("mouse message toward guest");
    assert_eq!(words, vec![tag::MOUSE, 100, 120, 0x1000]);

    // guest shutdown tears the listener down and releases the port
    guest.send(&[tag::SHUTDOWN]);
    assert!(
        wait_for(Duration::from_secs(3), || harness.router.vm_count() == 0),
        "listener did not unregister after shutdown"
    );
    assert!(!harness.router.port_in_use(port));
}

#[test]
fn resize_during_streaming() {
    let harness = Harness::start("resize", 40300);
    let port = harness.register(902);

    let guest = Guest::new("resize", 902, &PathBuf::from(harness.router.socket_path()));
    guest.fill(1024, 768, [0x11, 0x22, 0x33, 0xff]);
    guest.send(&[tag::DISPLAY_SWITCH, FORMAT_A8R8G8B8, 1024, 768]);

    let listener = harness.router.listener(UUID).expect("listener");
    assert!(wait_for(Duration::from_secs(2), || {
        listener.display_params().0 == 1024
    }));

    let mut client = Client::connect(port);
    client.send(&caps(1024, 768));
    client.send(&ClientInput::Activate);
    client.expect_update(Duration::from_secs(3), "initial frame", |u| {
        matches!(u, ServerUpdate::SurfaceFrameBits { .. })
    });

    // the guest switches to 1280x720; the peer must resize and wait for
    // re-activation
    guest.fill(1280, 720, [0x44, 0x55, 0x66, 0xff]);
    guest.send(&[tag::DISPLAY_SWITCH, FORMAT_A8R8G8B8, 1280, 720]);

    let resize = client.expect_update(Duration::from_secs(3), "desktop resize", |u| {
        matches!(u, ServerUpdate::DesktopResize { .. })
    });
    assert_eq!(
        resize,
        ServerUpdate::DesktopResize {
            width: 1280,
            height: 720,
            bpp: 32
        }
    );

    // re-activate and expect a full frame at the new geometry
    client.send(&ClientInput::Activate);
    let update = client.expect_update(Duration::from_secs(3), "post-resize frame", |u| {
        matches!(u, ServerUpdate::SurfaceFrameBits { cmd, .. } if cmd.width == 1280)
    });
    if let ServerUpdate::SurfaceFrameBits { cmd, .. } = &update {
        assert_eq!(cmd.height, 720);
    }

    guest.send(&[tag::SHUTDOWN]);
    assert!(wait_for(Duration::from_secs(3), || {
        harness.router.vm_count() == 0
    }));
}

#[test]
fn version_mismatch_is_refused() {
    let harness = Harness::start("version", 40400);

    let reply = harness
        .iface
        .handle_register(903, PROTOCOL_VERSION - 1, UUID, 0);
    assert_eq!(reply, "");
    assert_eq!(harness.router.vm_count(), 0);
}

#[test]
fn frame_acks_feed_rate_adaptation() {
    let harness = Harness::start("acks", 40500);
    let port = harness.register(904);

    let guest = Guest::new("acks", 904, &PathBuf::from(harness.router.socket_path()));
    guest.fill(256, 256, [0xaa, 0xbb, 0xcc, 0xff]);
    guest.send(&[tag::DISPLAY_SWITCH, FORMAT_A8R8G8B8, 256, 256]);

    let listener = harness.router.listener(UUID).expect("listener");
    assert!(wait_for(Duration::from_secs(2), || {
        listener.display_params().0 == 256
    }));

    let mut client = Client::connect(port);
    client.send(&caps(256, 256));
    client.send(&ClientInput::Activate);

    let update = client.expect_update(Duration::from_secs(3), "first frame", |u| {
        matches!(u, ServerUpdate::SurfaceFrameBits { .. })
    });
    let ServerUpdate::SurfaceFrameBits { frame_id, .. } = update else {
        unreachable!();
    };

    // acknowledge and keep streaming: frame ids must increase
    client.send(&ClientInput::FrameAcknowledge { frame_id });
    guest.send(&[tag::DISPLAY_UPDATE, 0, 0, 128, 128]);

    let update = client.expect_update(Duration::from_secs(3), "second frame", |u| {
        matches!(u, ServerUpdate::SurfaceFrameBits { frame_id: id, .. } if *id > frame_id)
    });
    drop(update);

    guest.send(&[tag::SHUTDOWN]);
    assert!(wait_for(Duration::from_secs(3), || {
        harness.router.vm_count() == 0
    }));
}
