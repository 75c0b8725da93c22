//! Peer TCP transport
//!
//! Frames client events in and server updates out over the accepted
//! connection, optionally wrapped in TLS. Reads are bounded: `poll_input`
//! waits at most the caller's timeout so the peer loop stays responsive to
//! its stop flag.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rustls::{ServerConnection, StreamOwned};
use tracing::{debug, warn};

use super::pdu::{self, MAX_PDU_BODY};
use super::{ClientInput, PeerConnection, RdpError, ServerUpdate, UpdateSink};
use crate::rdp::{BitmapUpdate, SurfaceBitsCommand};

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// Framed transport for one peer connection.
pub struct PeerTransport {
    stream: Stream,
    /// Cloned handle used for timeout control and shutdown, valid for both
    /// the plain and TLS paths.
    socket: TcpStream,
    inbound: BytesMut,
    closed: bool,
}

impl PeerTransport {
    /// Wrap an accepted connection in plain framing.
    pub fn new(stream: TcpStream) -> Result<Self, RdpError> {
        let socket = stream.try_clone()?;
        Ok(Self {
            stream: Stream::Plain(stream),
            socket,
            inbound: BytesMut::with_capacity(4096),
            closed: false,
        })
    }

    /// Wrap an accepted connection in TLS framing. The handshake completes
    /// on a blocking socket before any timeout is applied.
    pub fn new_tls(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<Self, RdpError> {
        let socket = stream.try_clone()?;
        let conn = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut tls = StreamOwned::new(conn, stream);

        socket.set_read_timeout(None)?;
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(RdpError::Io)?;
        }
        debug!("tls handshake complete");

        Ok(Self {
            stream: Stream::Tls(Box::new(tls)),
            socket,
            inbound: BytesMut::with_capacity(4096),
            closed: false,
        })
    }

    fn fill(&mut self, timeout: Duration) -> Result<(), RdpError> {
        self.socket.set_read_timeout(Some(timeout))?;

        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                Err(RdpError::Closed)
            }
            Ok(n) => {
                self.inbound.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => {
                self.closed = true;
                Err(RdpError::Io(e))
            }
        }
    }

    fn drain_one(&mut self) -> Result<Option<ClientInput>, RdpError> {
        loop {
            if self.inbound.len() < 5 {
                return Ok(None);
            }

            let body_len = u32::from_le_bytes([
                self.inbound[1],
                self.inbound[2],
                self.inbound[3],
                self.inbound[4],
            ]);
            if body_len > MAX_PDU_BODY {
                return Err(RdpError::Oversized(body_len));
            }
            if self.inbound.len() < 5 + body_len as usize {
                return Ok(None);
            }

            let pdu_type = self.inbound[0];
            self.inbound.advance(5);
            let body = self.inbound.split_to(body_len as usize);

            match pdu::parse_client_input(pdu_type, &body) {
                Ok(input) => return Ok(Some(input)),
                Err(RdpError::UnknownPdu(t)) => {
                    // tolerate unknown client PDUs, the body is already consumed
                    warn!("ignoring unknown client pdu {t:#04x}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_update(&mut self, update: &ServerUpdate) -> Result<(), RdpError> {
        let mut out = BytesMut::new();
        pdu::write_server_update(update, &mut out);
        self.stream.write_all(&out)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl UpdateSink for PeerTransport {
    fn desktop_resize(&mut self, width: u16, height: u16, bpp: u32) -> Result<(), RdpError> {
        self.send_update(&ServerUpdate::DesktopResize { width, height, bpp })
    }

    fn surface_bits(&mut self, cmd: &SurfaceBitsCommand) -> Result<(), RdpError> {
        self.send_update(&ServerUpdate::SurfaceBits(cmd.clone()))
    }

    fn surface_frame_bits(
        &mut self,
        cmd: &SurfaceBitsCommand,
        first: bool,
        last: bool,
        frame_id: u32,
    ) -> Result<(), RdpError> {
        self.send_update(&ServerUpdate::SurfaceFrameBits {
            cmd: cmd.clone(),
            first,
            last,
            frame_id,
        })
    }

    fn bitmap_update(&mut self, update: &BitmapUpdate) -> Result<(), RdpError> {
        self.send_update(&ServerUpdate::Bitmap(update.clone()))
    }
}

impl PeerConnection for PeerTransport {
    fn poll_input(&mut self, timeout: Duration) -> Result<Option<ClientInput>, RdpError> {
        if self.closed {
            return Err(RdpError::Closed);
        }

        if let Some(input) = self.drain_one()? {
            return Ok(Some(input));
        }
        self.fill(timeout)?;
        self.drain_one()
    }

    fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
