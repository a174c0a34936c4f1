#![forbid(unsafe_code)]

//! `astop`: signals every pid recorded by a prior `astart` run to shut down,
//! mirroring `astart.c`'s `stop_all`.

use std::path::PathBuf;

use allnet_core::supervisor;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stop the AllNet component processes")]
struct Cli {
    /// Path to the pid file written by `astart`.
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    allnet::init_tracing_or_exit("info", false);

    let pid_file = match cli.pid_file {
        Some(p) => p,
        None => supervisor::default_pid_file_path().await,
    };

    match supervisor::stop_all(&pid_file).await {
        Ok(()) => info!(path = %pid_file.display(), "stop signal sent to all recorded processes"),
        Err(e) => {
            error!(error = %e, path = %pid_file.display(), "failed to stop components");
            std::process::exit(1);
        }
    }
}
