#![forbid(unsafe_code)]

//! `traced`: the trace responder. Connects to `ad` as the `Trace` pipe and
//! answers whatever diagnostic packets arrive on it, appending a hop record
//! before handing a reply back upstream.
//!
//! The forwarder's fan-out step never targets the `Trace` pipe on ordinary
//! traffic — a trace packet only reaches this process when something
//! addresses it directly, the same way `traced.c` only ever sees packets a
//! caller explicitly routed to it rather than every packet in flight.

use std::path::PathBuf;

use allnet_core::forwarder::PipeLabel;
use allnet_core::packet::Packet;
use allnet_core::pipe::framing::{self, FrameReader, RecvOutcome};
use clap::Parser;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "AllNet trace responder")]
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
        match allnet::connect_to_forwarder(cli.forwarder, PipeLabel::Trace.fd_id()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to connect to forwarder");
                std::process::exit(1);
            }
        };
    let (forwarder_read, mut forwarder_write) = forwarder_stream.into_split();
    let mut framed = FrameReader::new(forwarder_read);
    let mut shutdown = allnet::shutdown_signal();

    info!("trace responder ready");
    loop {
        tokio::select! {
            outcome = framed.recv() => {
                match outcome {
                    Ok(RecvOutcome::Frame { payload, priority }) => {
                        let Ok(packet) = Packet::parse(&payload) else {
                            debug!("dropping unparseable trace packet");
                            continue;
                        };
                        let reply = packet.clone_with_incremented_hop().encode();
                        if let Err(e) = framing::send(&mut forwarder_write, &reply, priority).await {
                            warn!(error = %e, "failed to send trace reply");
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
    info!("trace responder shut down");
}
