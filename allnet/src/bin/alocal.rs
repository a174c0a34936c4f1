#![forbid(unsafe_code)]

//! `alocal`: the local client gateway process (§4.G). Connects to `ad` as
//! the `LocalGateway` pipe and fans frames out to every connected local
//! application (xchat and friends), with no bloom cache or rate tracker of
//! its own — the forwarder already ran both.

use std::path::PathBuf;

use allnet_core::forwarder::PipeLabel;
use allnet_core::gateway::local::{register_app, run_downlink, run_uplink, AppFanout};
use allnet_core::peer::bind_dual_stack;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "AllNet local client gateway")]
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
        match allnet::connect_to_forwarder(cli.forwarder, PipeLabel::LocalGateway.fd_id()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to forwarder");
                std::process::exit(1);
            }
        };
    let (forwarder_read, forwarder_write) = forwarder_stream.into_split();

    let apps = AppFanout::new();
    let (uplink_tx, uplink_rx) = mpsc::channel(256);
    tokio::spawn(run_uplink(forwarder_write, uplink_rx));

    let shutdown = allnet::shutdown_signal();
    tokio::spawn(run_downlink(forwarder_read, apps.clone(), shutdown.clone()));

    let (v6_listener, v4_listener) = match bind_dual_stack(config.local_gateway.port, true) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to bind local app listener");
            std::process::exit(1);
        }
    };
    info!(port = config.local_gateway.port, "local app listener bound");

    let mut shutdown_v6 = shutdown.clone();
    let v6_apps = apps.clone();
    let v6_uplink = uplink_tx.clone();
    let v6_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = v6_listener.accept() => {
                    if let Ok((stream, _addr)) = accepted {
                        let fd = next_app_fd();
                        register_app(fd, stream, v6_apps.clone(), v6_uplink.clone()).await;
                    }
                }
                changed = shutdown_v6.changed() => {
                    if changed.is_ok() && *shutdown_v6.borrow() {
                        return;
                    }
                }
            }
        }
    });

    if let Some(v4_listener) = v4_listener {
        let mut shutdown_v4 = shutdown.clone();
        let v4_apps = apps.clone();
        let v4_uplink = uplink_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = v4_listener.accept() => {
                        if let Ok((stream, _addr)) = accepted {
                            let fd = next_app_fd();
                            register_app(fd, stream, v4_apps.clone(), v4_uplink.clone()).await;
                        }
                    }
                    changed = shutdown_v4.changed() => {
                        if changed.is_ok() && *shutdown_v4.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    let _ = v6_handle.await;
    info!("local gateway shut down");
}

fn next_app_fd() -> allnet_core::pipe::multiplexer::FdId {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
