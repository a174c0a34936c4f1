#![forbid(unsafe_code)]

//! `ad`: the central forwarder process (§4.F). Accepts a fixed pipe from
//! each sibling component — the local gateway, the cache, the IP gateway,
//! the trace responder, and one per wireless interface — then runs the
//! routing loop until shutdown.
//!
//! Grounded on `astart.c`'s fixed pipe topology (`NUM_FIXED_PIPES` plus two
//! pipes per wireless interface); where the original inherits pipe file
//! descriptors at exec time, this binary instead accepts that many TCP
//! connections, each announcing its [`PipeLabel`] with the handshake from
//! [`allnet::read_pipe_handshake`].

use std::net::SocketAddr;
use std::path::PathBuf;

use std::sync::Arc;

use allnet_core::bloom::PidCache;
use allnet_core::forwarder::{Forwarder, PipeLabel};
use allnet_core::metrics::{serve_metrics, ForwarderMetrics};
use allnet_core::rate::SourceRateTracker;
use clap::Parser;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "AllNet central forwarder")]
struct Cli {
    /// Address sibling components dial to register their pipe.
    #[arg(long, default_value = "127.0.0.1:6900")]
    listen: SocketAddr,

    /// Number of wireless interface broadcasters (`abc`) expected to
    /// register before the routing loop starts.
    #[arg(long, default_value_t = 0)]
    wireless_count: u8,

    /// Path to an optional TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = allnet::load_config_or_exit(cli.config.as_deref());
    allnet::init_tracing_or_exit(&config.logging.level, config.logging.show_target);

    let mut expected: Vec<PipeLabel> =
        vec![PipeLabel::LocalGateway, PipeLabel::Cache, PipeLabel::IpGateway, PipeLabel::Trace];
    for i in 0..cli.wireless_count {
        expected.push(PipeLabel::Wireless(i));
    }

    let listener = match TcpListener::bind(cli.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind pipe listener");
            std::process::exit(1);
        }
    };
    info!(addr = %cli.listen, expecting = expected.len(), "waiting for sibling components to register");

    let mut pid_cache = PidCache::new(config.bloom.family_size, config.bloom.filter_bits, config.bloom.filter_slices);
    if let Some(dir) = &config.bloom.persist_dir {
        if let Err(e) = pid_cache.load(dir).await {
            info!(error = %e, "no prior bloom cache to load, starting empty");
        }
    }
    let rate_tracker = SourceRateTracker::new(Duration::from_millis(config.rate.window_ms), config.rate.capacity);
    let metrics = Arc::new(ForwarderMetrics::default());
    let mut forwarder = Forwarder::new(pid_cache, rate_tracker).with_metrics(metrics.clone());

    if config.metrics.enabled {
        let listen = config.metrics.listen;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(listen, metrics, "allnet_ad").await {
                warn!(error = %e, "metrics server stopped");
            }
        });
        info!(%listen, "metrics server started");
    }

    let mut remaining = expected;
    while !remaining.is_empty() {
        let (mut stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed while waiting for pipes");
                continue;
            }
        };
        let fd = match allnet::read_pipe_handshake(&mut stream).await {
            Ok(fd) => fd,
            Err(e) => {
                error!(%addr, error = %e, "pipe handshake failed");
                continue;
            }
        };
        let Some(label) = PipeLabel::from_fd_id(fd) else {
            error!(%addr, fd, "unrecognized pipe handshake, dropping connection");
            continue;
        };
        if let Some(pos) = remaining.iter().position(|l| *l == label) {
            remaining.remove(pos);
            let (read_half, write_half) = stream.into_split();
            forwarder.attach(label, read_half, Box::new(write_half));
            info!(?label, %addr, "pipe registered");
        } else {
            error!(?label, %addr, "pipe already registered or unexpected, dropping");
        }
    }

    info!("all pipes registered, starting routing loop");
    let shutdown = allnet::shutdown_signal();
    forwarder.run(shutdown).await;
    info!("forwarder shut down");
}
