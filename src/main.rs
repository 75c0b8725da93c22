//! rdpmux - VM display multiplexer
//!
//! Entry point for the server binary.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use rdpmux::config::{Args, Config};
use rdpmux::management;
use rdpmux::router::VmRouter;
use rdpmux::security::TlsConfig;
use rdpmux::utils::format_user_error;

/// Exit code for a management-surface registration failure.
const EXIT_BUS_FAILURE: u8 = 129;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(1);
        }
        Err(e) => {
            // --help and --version land here
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    init_logging(&args);

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", format_user_error(&e));
            return ExitCode::from(1);
        }
    };

    if config.base_port < 1024 {
        warn!(
            port = config.base_port,
            "port number is low (below 1024), may conflict with other system services"
        );
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", format_user_error(&e));
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    info!("rdpmux v{} starting", env!("CARGO_PKG_VERSION"));

    let tls = match TlsConfig::from_files(&config.cert_path(), &config.key_path()) {
        Ok(tls) => Some(tls.server_config()),
        Err(e) => {
            warn!("tls unavailable, peers will use plain transport: {e:#}");
            None
        }
    };

    let router = VmRouter::bind(
        &config.socket_path,
        config.base_port,
        config.authenticate,
        tls,
    )?;
    router.set_capture_fps(config.capture_fps);

    let loop_router = Arc::clone(&router);
    let router_thread = std::thread::spawn(move || loop_router.run());

    let surface = match management::serve(Arc::clone(&router), &config).await {
        Ok(surface) => surface,
        Err(e) => {
            eprintln!("{}", format_user_error(&e));
            router.shutdown();
            let _ = router_thread.join();
            return Ok(ExitCode::from(EXIT_BUS_FAILURE));
        }
    };

    info!("rdpmux initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, cleaning up");

    drop(surface);
    router.shutdown();
    let _ = router_thread.join();
    drop(router);

    // restore the default handler and re-raise so the exit status reflects
    // the signal
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGINT,
            nix::sys::signal::SigHandler::SigDfl,
        );
    }
    let _ = nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT);

    Ok(ExitCode::SUCCESS)
}

fn init_logging(args: &Args) {
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("rdpmux={level},warn")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
