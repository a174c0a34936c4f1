#![forbid(unsafe_code)]

//! `astart`: launches the fixed set of AllNet component binaries and
//! records their pids, mirroring `astart.c`'s `main`.

use std::path::PathBuf;

use allnet_core::supervisor::{self, ComponentSpec, Supervisor};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Launch the AllNet component processes")]
struct Cli {
    /// Address `ad` binds its pipe listener to; every sibling dials this.
    #[arg(long, default_value = "127.0.0.1:6900")]
    forwarder: String,

    /// Wireless interface to broadcast on; repeat for more than one.
    #[arg(long = "interface")]
    interfaces: Vec<String>,

    /// Path to the pid file recording this run's spawned processes.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Path to an optional TOML configuration file, forwarded to every
    /// component.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    allnet::init_tracing_or_exit("info", false);

    let program_dir = match supervisor::program_dir() {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "failed to determine component binary directory");
            std::process::exit(1);
        }
    };

    let mut specs = supervisor::fixed_topology(&cli.forwarder, &cli.interfaces);
    if let Some(config) = &cli.config {
        for spec in &mut specs {
            spec.args.push("--config".into());
            spec.args.push(config.display().to_string());
        }
    }
    // `ad` must bind before any sibling dials it.
    let ad_pos = specs.iter().position(|s: &ComponentSpec| s.name == "ad").expect("fixed_topology always includes ad");
    let ad_spec = specs.remove(ad_pos);

    let mut supervisor = match Supervisor::spawn(&program_dir, vec![ad_spec]) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start forwarder");
            std::process::exit(1);
        }
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut siblings = match Supervisor::spawn(&program_dir, specs) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start sibling components");
            std::process::exit(1);
        }
    };

    let mut pids = supervisor.pids();
    pids.extend(siblings.pids());
    let pid_file = match &cli.pid_file {
        Some(p) => p.clone(),
        None => supervisor::default_pid_file_path().await,
    };
    if let Err(e) = supervisor::write_pid_file(&pid_file, &pids).await {
        error!(error = %e, path = %pid_file.display(), "failed to write pid file");
    }
    info!(pid_file = %pid_file.display(), count = pids.len(), "all components started");

    tokio::join!(supervisor.wait_all(), siblings.wait_all());
}
