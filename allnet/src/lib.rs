#![forbid(unsafe_code)]

//! Shared wiring for the `allnet` component binaries: the handshake each
//! component uses to identify itself to `ad` over its TCP pipe, and the
//! SIGINT/SIGTERM-driven shutdown watch every long-running binary selects
//! on, mirroring `tcp::handler::TcpHandler::run`'s
//! `shutdown: &mut watch::Receiver<bool>` parameter.
//!
//! `astart.c` wires sibling processes together with inherited pipe file
//! descriptors passed as positional CLI arguments. Under
//! `#![forbid(unsafe_code)]` this crate cannot duplicate or pass raw fds, so
//! each component instead dials `ad`'s pipe-listener address and announces
//! which [`allnet_core::forwarder::PipeLabel`] it is with a 4-byte
//! handshake before the framed pipe protocol begins.

use std::net::SocketAddr;

use allnet_core::pipe::multiplexer::FdId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::info;

/// Dial `ad`'s pipe-listener address and announce this component's
/// [`FdId`] as a 4-byte big-endian handshake before the framed pipe
/// protocol begins.
pub async fn connect_to_forwarder(addr: SocketAddr, fd_id: FdId) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&fd_id.to_be_bytes()).await?;
    Ok(stream)
}

/// Accept side of [`connect_to_forwarder`]: read the 4-byte handshake off a
/// freshly-accepted socket and return the [`FdId`] it announced.
pub async fn read_pipe_handshake(stream: &mut TcpStream) -> std::io::Result<FdId> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(FdId::from_be_bytes(buf))
}

/// A `watch::Receiver<bool>` that flips to `true` the moment this process
/// receives `SIGINT` (or, on Unix, `SIGTERM`) — the supervisor's shutdown
/// signal (§5 "Cancellation").
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Initialize tracing from a component's resolved config, exiting the
/// process on failure the way `main` exits on any other fatal startup error
/// (§2 "`exit` for control flow").
pub fn init_tracing_or_exit(level: &str, show_target: bool) {
    if let Err(e) = allnet_core::telemetry::init_tracing(level, show_target) {
        eprintln!("failed to initialize tracing: {e}");
        std::process::exit(1);
    }
}

/// Load the config file named by `--config`, exiting on a parse or
/// validation error.
pub fn load_config_or_exit(path: Option<&std::path::Path>) -> allnet_core::config::Config {
    match allnet_core::config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    }
}
