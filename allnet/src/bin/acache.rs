#![forbid(unsafe_code)]

//! `acache`: the packet cache process (§4 "packet cache"). Connects to `ad`
//! as the `Cache` pipe, retains every packet the forwarder hands it, and
//! answers `DataReq`s whose payload names a packet id this process still
//! holds.

use std::path::PathBuf;

use allnet_core::cache::PacketStore;
use allnet_core::forwarder::PipeLabel;
use allnet_core::packet::{Packet, PacketType};
use allnet_core::pipe::framing::{self, FrameReader, RecvOutcome};
use clap::Parser;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "AllNet packet cache")]
struct Cli {
    /// Address `ad`'s pipe listener is bound to.
    #[arg(long, default_value = "127.0.0.1:6900")]
    forwarder: std::net::SocketAddr,

    /// Maximum number of packets retained at once.
    #[arg(long, default_value_t = 4096)]
    capacity: usize,

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
        match allnet::connect_to_forwarder(cli.forwarder, PipeLabel::Cache.fd_id()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to forwarder");
                std::process::exit(1);
            }
        };
    let (forwarder_read, mut forwarder_write) = forwarder_stream.into_split();

    let mut store = PacketStore::new(cli.capacity);
    let mut framed = FrameReader::new(forwarder_read);
    let mut shutdown = allnet::shutdown_signal();

    info!(capacity = cli.capacity, "cache ready");
    loop {
        tokio::select! {
            outcome = framed.recv() => {
                match outcome {
                    Ok(RecvOutcome::Frame { payload, priority }) => {
                        let Ok(packet) = Packet::parse(&payload) else {
                            debug!("dropping unparseable packet");
                            continue;
                        };
                        if packet.header.packet_type == PacketType::DataReq {
                            if let Some(id) = requested_id(&packet.payload) {
                                if let Some(found) = store.get(&id) {
                                    let encoded = found.encode();
                                    if let Err(e) = framing::send(&mut forwarder_write, &encoded, priority).await {
                                        warn!(error = %e, "failed to reply to data request");
                                    }
                                }
                            }
                        } else {
                            store.insert(packet);
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
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(retained = store.len(), "cache shut down");
}

fn requested_id(payload: &[u8]) -> Option<[u8; 16]> {
    payload.get(..16)?.try_into().ok()
}
