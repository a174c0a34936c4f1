#![forbid(unsafe_code)]

//! `abc`: the per-interface wireless broadcaster (§4.I). Connects to `ad`
//! as a `Wireless(index)` pipe, broadcasting every frame the forwarder hands
//! it and forwarding every frame the interface receives back upstream.

use std::path::PathBuf;

use allnet_core::forwarder::PipeLabel;
use allnet_core::iface::wifi::WifiIface;
use allnet_core::iface::BroadcastIface;
use allnet_core::pipe::framing::{self, FrameReader, RecvOutcome, PRIORITY_MAX};
use clap::Parser;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "AllNet wireless interface broadcaster")]
struct Cli {
    /// Address `ad`'s pipe listener is bound to.
    #[arg(long, default_value = "127.0.0.1:6900")]
    forwarder: std::net::SocketAddr,

    /// Network interface name (e.g. `wlan0`).
    #[arg(long)]
    interface: String,

    /// Which `Wireless(index)` pipe this process registers as, when more
    /// than one interface is broadcasting.
    #[arg(long, default_value_t = 0)]
    index: u8,

    /// Path to an optional TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = allnet::load_config_or_exit(cli.config.as_deref());
    allnet::init_tracing_or_exit(&config.logging.level, config.logging.show_target);

    let forwarder_stream =
        match allnet::connect_to_forwarder(cli.forwarder, PipeLabel::Wireless(cli.index).fd_id()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to forwarder");
                std::process::exit(1);
            }
        };
    let (forwarder_read, mut forwarder_write) = forwarder_stream.into_split();
    let mut framed = FrameReader::new(forwarder_read);

    let mut iface = WifiIface::new(cli.interface.clone(), config.wifi.port);
    let handles = match iface.init().await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to initialize wireless interface");
            std::process::exit(1);
        }
    };
    if let Err(e) = iface.set_enabled(true).await {
        error!(error = %e, "failed to enable wireless interface");
        std::process::exit(1);
    }
    info!(interface = %cli.interface, local = %handles.local_addr, broadcast = %handles.broadcast_addr, "wireless interface up");

    let mut shutdown = allnet::shutdown_signal();
    loop {
        tokio::select! {
            outcome = framed.recv() => {
                match outcome {
                    Ok(RecvOutcome::Frame { payload, .. }) => {
                        if let Err(e) = iface.send(&payload).await {
                            warn!(error = %e, "failed to broadcast packet");
                        }
                    }
                    Ok(RecvOutcome::BadFrame) => {
                        warn!("resynced after bad frame from forwarder pipe");
                    }
                    Ok(RecvOutcome::Closed) => {
                        debug!("forwarder pipe closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "error reading from forwarder pipe");
                        break;
                    }
                }
            }
            inbound = iface.recv() => {
                match inbound {
                    Ok(payload) => {
                        if let Err(e) = framing::send(&mut forwarder_write, &payload, PRIORITY_MAX).await {
                            warn!(error = %e, "forwarder pipe write failed, dropping received packet");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "error receiving from wireless interface");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    let _ = iface.set_enabled(false).await;
    info!("wireless broadcaster shut down");
}
