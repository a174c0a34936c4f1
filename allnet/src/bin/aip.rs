#![forbid(unsafe_code)]

//! `aip`: the Internet peer gateway process (§4.H). Connects to `ad` as the
//! `IpGateway` pipe, accepts and dials TCP peers, and exchanges
//! `MGMT_PEERS` with them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use allnet_core::forwarder::PipeLabel;
use allnet_core::gateway::ip::{IpGateway, IpGatewayConfig, KnownPeers};
use allnet_core::peer::table::PeerTable;
use allnet_core::peer::{bind_dual_stack, PeerListener, PeerListenerConfig};
use allnet_core::pipe::framing::{self, PRIORITY_MAX};
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "AllNet Internet peer gateway")]
struct Cli {
    /// Address `ad`'s pipe listener is bound to.
    #[arg(long, default_value = "127.0.0.1:6900")]
    forwarder: std::net::SocketAddr,

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
        match allnet::connect_to_forwarder(cli.forwarder, PipeLabel::IpGateway.fd_id()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to forwarder");
                std::process::exit(1);
            }
        };
    let (forwarder_read, mut forwarder_write) = forwarder_stream.into_split();

    let known = KnownPeers::new();
    if let Err(e) = known.load(&config.ip_gateway.known_peers_path).await {
        info!(error = %e, "no prior known-peers file to load, starting empty");
    }

    let table = Arc::new(Mutex::new(PeerTable::new(config.peer.capacity, config.peer.reservation_capacity)));
    let listener_config = PeerListenerConfig {
        port: config.peer.port,
        local_only: false,
        nodelay: config.peer.nodelay,
        unique_ip_required: config.peer.unique_ip_required,
    };
    let peer_listener = Arc::new(PeerListener::new(table.clone(), listener_config));

    let gateway_config = IpGatewayConfig {
        port: config.peer.port,
        target_peer_count: config.ip_gateway.target_peer_count,
        dial_interval: Duration::from_millis(config.ip_gateway.dial_interval_ms),
        mgmt_interval: Duration::from_millis(config.ip_gateway.mgmt_interval_ms),
        known_peers_path: config.ip_gateway.known_peers_path.clone(),
    };
    let gateway = Arc::new(IpGateway::new(table, peer_listener, known, gateway_config));

    let (v6_listener, v4_listener) = match bind_dual_stack(config.peer.port, false) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to bind peer listener");
            std::process::exit(1);
        }
    };
    info!(port = config.peer.port, "peer listener bound");

    let shutdown = allnet::shutdown_signal();
    let (to_forwarder_tx, mut to_forwarder_rx) = mpsc::channel::<Vec<u8>>(256);

    tokio::spawn(gateway.clone().run_accept_loop(v6_listener, shutdown.clone(), to_forwarder_tx.clone()));
    if let Some(v4_listener) = v4_listener {
        tokio::spawn(gateway.clone().run_accept_loop(v4_listener, shutdown.clone(), to_forwarder_tx.clone()));
    }
    tokio::spawn(gateway.clone().run_dial_loop(shutdown.clone(), to_forwarder_tx.clone()));
    tokio::spawn(gateway.clone().run_mgmt_loop(shutdown.clone()));
    tokio::spawn(gateway.clone().run_downlink(forwarder_read, shutdown.clone()));
    drop(to_forwarder_tx);

    let uplink = tokio::spawn(async move {
        while let Some(payload) = to_forwarder_rx.recv().await {
            if let Err(e) = framing::send(&mut forwarder_write, &payload, PRIORITY_MAX).await {
                error!(error = %e, "forwarder pipe write failed, dropping peer packet");
            }
        }
    });

    let mut shutdown_wait = shutdown.clone();
    let _ = shutdown_wait.changed().await;
    let _ = uplink.await;
    if let Err(e) = gateway.save_known_peers().await {
        error!(error = %e, "failed to save known peers on shutdown");
    }
    info!("ip gateway shut down");
}
