use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::error;
use tunnel_core::TunnelServer;

/// Multi-client TCP tunnel sender: accepts downstream connections on
/// LISTEN_PORT and multiplexes their payload over a single upstream
/// connection to DEST_IP:DEST_PORT.
#[derive(Parser, Debug)]
#[command(name = "tunnel-sender")]
struct Args {
    listen_port: u16,
    dest_ip: String,
    dest_port: u16,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();

    let listen_addr: SocketAddr = match format!("127.0.0.1:{}", args.listen_port).parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid listen port");
            return ExitCode::FAILURE;
        }
    };
    let dest_addr = match tunnel_core::socket::parse_address(&args.dest_ip, args.dest_port) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid destination address");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));

    let (mut server, waker) = match TunnelServer::new(listen_addr, dest_addr, Arc::clone(&shutdown)) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to start tunnel sender");
            return ExitCode::FAILURE;
        }
    };

    let shutdown_for_handler = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown_for_handler.store(true, Ordering::Relaxed);
        let _ = waker.wake();
    }) {
        error!(error = %e, "failed to install SIGINT handler");
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tunnel sender exited with an error");
            ExitCode::FAILURE
        }
    }
}
