//! Diagnostic peer client
//!
//! Connects to a listener port, negotiates as a plain client, activates and
//! prints a summary of every update the server emits. Useful for checking a
//! listener end to end without a full RDP client.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::Parser;

use rdpmux::rdp::{
    parse_server_update, write_client_input, ClientCapabilities, ClientInput, ServerUpdate,
};

#[derive(Parser, Debug)]
#[command(name = "rdpmux-probe")]
#[command(about = "Connect to an rdpmux listener and print its updates", long_about = None)]
struct Args {
    /// Listener host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listener port
    #[arg(short, long)]
    port: u16,

    /// Desktop size to request, WIDTHxHEIGHT
    #[arg(short, long, default_value = "1024x768")]
    geometry: String,

    /// How many seconds to keep printing updates
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Acknowledge surface frames as they arrive
    #[arg(long, default_value_t = true)]
    ack: bool,
}

fn parse_geometry(s: &str) -> Result<(u16, u16)> {
    let (w, h) = s
        .split_once('x')
        .context("geometry must look like 1024x768")?;
    Ok((w.parse()?, h.parse()?))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (width, height) = parse_geometry(&args.geometry)?;

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    println!("connected to {}:{}", args.host, args.port);

    let mut out = BytesMut::new();
    write_client_input(
        &ClientInput::Capabilities(ClientCapabilities {
            width,
            height,
            color_depth: 32,
            supports_remotefx: true,
            supports_nsc: false,
            frame_marker: true,
            multifrag_max_request_size: 0x3f_0000,
            client_dir: Some("rdpmux-probe".to_owned()),
        }),
        &mut out,
    );
    write_client_input(&ClientInput::Activate, &mut out);
    stream.write_all(&out)?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut inbound = BytesMut::new();
    let mut frames = 0u64;
    let mut bytes = 0u64;

    while Instant::now() < deadline {
        // parse complete PDUs out of the buffer
        while inbound.len() >= 5 {
            let len = u32::from_le_bytes([inbound[1], inbound[2], inbound[3], inbound[4]]) as usize;
            if inbound.len() < 5 + len {
                break;
            }
            let pdu_type = inbound[0];
            let body = inbound[5..5 + len].to_vec();
            let _ = inbound.split_to(5 + len);

            match parse_server_update(pdu_type, &body) {
                Ok(update) => {
                    bytes += 5 + len as u64;
                    describe(&update);
                    if let ServerUpdate::SurfaceFrameBits { last, frame_id, .. } = &update {
                        frames += 1;
                        if args.ack && *last {
                            let mut ack = BytesMut::new();
                            write_client_input(
                                &ClientInput::FrameAcknowledge {
                                    frame_id: *frame_id,
                                },
                                &mut ack,
                            );
                            stream.write_all(&ack)?;
                        }
                    }

                    // a resize drops us out of activation; re-activate
                    if matches!(update, ServerUpdate::DesktopResize { .. }) {
                        let mut reactivate = BytesMut::new();
                        write_client_input(&ClientInput::Activate, &mut reactivate);
                        stream.write_all(&reactivate)?;
                    }
                }
                Err(e) => {
                    eprintln!("undecodable update: {e}");
                }
            }
        }

        let mut buf = [0u8; 64 * 1024];
        match stream.read(&mut buf) {
            Ok(0) => {
                println!("server closed the connection");
                break;
            }
            Ok(n) => inbound.extend_from_slice(&buf[..n]),
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) => {}
            Err(e) => return Err(e.into()),
        }
    }

    println!("{frames} frames, {bytes} bytes in {}s", args.seconds);
    Ok(())
}

fn describe(update: &ServerUpdate) {
    match update {
        ServerUpdate::DesktopResize { width, height, bpp } => {
            println!("desktop resize: {width}x{height}x{bpp}");
        }
        ServerUpdate::SurfaceBits(cmd) => {
            println!(
                "surface bits: {:?} {}x{} ({} bytes)",
                cmd.codec,
                cmd.width,
                cmd.height,
                cmd.data.len()
            );
        }
        ServerUpdate::SurfaceFrameBits {
            cmd,
            first,
            last,
            frame_id,
        } => {
            println!(
                "surface frame {frame_id} [{}{}]: {:?} {}x{} ({} bytes)",
                if *first { "F" } else { "-" },
                if *last { "L" } else { "-" },
                cmd.codec,
                cmd.width,
                cmd.height,
                cmd.data.len()
            );
        }
        ServerUpdate::Bitmap(update) => {
            let total: usize = update.rectangles.iter().map(|r| r.data.len()).sum();
            println!(
                "bitmap update: {} tiles ({} bytes)",
                update.rectangles.len(),
                total
            );
        }
    }
}
