//! Process supervision for the multi-binary deployment (§6/§9, "astart"/
//! "astop"): spawn every component binary, record their pids, and later
//! signal them all to shut down.
//!
//! Grounded on `astart.c`'s `main`/`my_exec2`/`my_exec3`/`stop_all`, with two
//! deliberate substitutions this crate makes consistently wherever the
//! original reaches for a raw OS primitive under `#![forbid(unsafe_code)]`:
//! inter-process wiring is left to the component binaries themselves to
//! establish over loopback TCP (the same [`crate::pipe::framing`] transport
//! they already speak) via CLI flags, rather than the supervisor creating
//! anonymous pipes and passing the fds as positional arguments; and process
//! termination goes through the `kill` binary rather than an `unsafe` call
//! into libc, the same way [`crate::iface::wifi`] trades a raw socket for a
//! UDP broadcast.
//!
//! `astart.c`'s `read_pid` has no `return` after its scan loop falls through
//! on EOF, so a partially-written or truncated pid file yields whatever was
//! left on the stack. [`read_pid_file`] fixes this: a short or malformed
//! line is simply skipped rather than fed to the caller as a pid.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// One component to spawn: the sibling binary name and its CLI arguments.
pub struct ComponentSpec {
    pub name: &'static str,
    pub args: Vec<String>,
}

impl ComponentSpec {
    pub fn new(name: &'static str, args: Vec<String>) -> Self {
        Self { name, args }
    }
}

/// A running fleet of spawned components, in spawn order.
pub struct Supervisor {
    children: Vec<(&'static str, Child)>,
}

impl Supervisor {
    /// Spawn every `spec` in order, resolving each program against
    /// `program_dir` the way `find_path`/`make_program_path` do in the
    /// original: same directory as the supervisor's own binary.
    pub fn spawn(program_dir: &Path, specs: Vec<ComponentSpec>) -> Result<Supervisor> {
        let mut children = Vec::with_capacity(specs.len());
        for spec in specs {
            let program = program_dir.join(spec.name);
            let child = Command::new(&program)
                .args(&spec.args)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    CoreError::Fatal(format!("failed to start {}: {e}", program.display()))
                })?;
            debug!(component = spec.name, pid = child.id(), "spawned component");
            children.push((spec.name, child));
        }
        Ok(Supervisor { children })
    }

    /// The pids of every still-tracked child, in spawn order.
    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().filter_map(|(_, c)| c.id()).collect()
    }

    /// Wait for every child to exit, logging non-zero exits. Used by a
    /// supervising binary that wants to stay alive only as long as its
    /// children do.
    pub async fn wait_all(&mut self) {
        for (name, child) in &mut self.children {
            match child.wait().await {
                Ok(status) if status.success() => debug!(component = *name, "exited cleanly"),
                Ok(status) => warn!(component = *name, code = ?status.code(), "exited with failure"),
                Err(e) => warn!(component = *name, error = %e, "failed to wait on child"),
            }
        }
    }
}

/// The directory containing the currently running binary, used to locate
/// sibling component binaries the way `find_path` locates `argv[0]`'s peers.
pub fn program_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(CoreError::Io)?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| CoreError::Fatal("current executable has no parent directory".into()))
}

/// `/var/run/allnet-pids` if writable, else `/tmp/allnet-pids`, mirroring
/// `pid_file_name`'s root-vs-non-root split without an explicit `geteuid`
/// check: a non-root process simply can't open the `/var/run` path.
pub async fn default_pid_file_path() -> PathBuf {
    let preferred = PathBuf::from("/var/run/allnet-pids");
    if try_create(&preferred).await {
        return preferred;
    }
    PathBuf::from("/tmp/allnet-pids")
}

#[cfg(unix)]
async fn try_create(path: &Path) -> bool {
    use std::os::unix::fs::OpenOptionsExt;
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .await
        .is_ok()
}

#[cfg(not(unix))]
async fn try_create(path: &Path) -> bool {
    tokio::fs::OpenOptions::new().write(true).create(true).open(path).await.is_ok()
}

/// Write one pid per line, overwriting any previous contents.
pub async fn write_pid_file(path: &Path, pids: &[u32]) -> Result<()> {
    let mut content = String::new();
    for pid in pids {
        content.push_str(&pid.to_string());
        content.push('\n');
    }
    tokio::fs::write(path, content).await.map_err(CoreError::Io)
}

/// Parse one pid per line. Unlike the original's `read_pid`, a short,
/// blank, or non-numeric line is skipped rather than treated as a pid —
/// there is no path that hands the caller a garbage value.
pub async fn read_pid_file(path: &Path) -> Result<Vec<u32>> {
    let text = tokio::fs::read_to_string(path).await.map_err(CoreError::Io)?;
    Ok(text.lines().filter_map(|line| line.trim().parse::<u32>().ok()).collect())
}

/// Signal every pid recorded in `path` with `SIGINT` and remove the file,
/// mirroring `stop_all`. Each pid is signalled independently; one failure
/// does not stop the sweep.
pub async fn stop_all(path: &Path) -> Result<()> {
    let pids = read_pid_file(path).await?;
    if pids.is_empty() {
        return Ok(());
    }
    for pid in pids {
        match Command::new("kill").arg("-INT").arg(pid.to_string()).status().await {
            Ok(status) if status.success() => debug!(pid, "sent SIGINT"),
            Ok(status) => warn!(pid, code = ?status.code(), "kill exited non-zero"),
            Err(e) => warn!(pid, error = %e, "failed to run kill"),
        }
    }
    tokio::fs::remove_file(path).await.ok();
    Ok(())
}

/// Build the `ad`/`alocal`/`acache`/`aip`/`abc`/`traced` spec list for the
/// fixed topology `astart.c`'s `main` wires up: one `ad` at the center, a
/// local gateway, a cache, an IP gateway, one interface broadcaster per
/// `interfaces` entry, and a trace responder. Each spec's `args` carries the
/// loopback address its peer(s) expect it to use, which is how this port
/// replaces the original's inherited pipe file descriptors.
pub fn fixed_topology(forwarder_addr: &str, interfaces: &[String]) -> Vec<ComponentSpec> {
    let mut specs = vec![
        ComponentSpec::new("ad", vec!["--listen".into(), forwarder_addr.into()]),
        ComponentSpec::new("alocal", vec!["--forwarder".into(), forwarder_addr.into()]),
        ComponentSpec::new("acache", vec!["--forwarder".into(), forwarder_addr.into()]),
        ComponentSpec::new("aip", vec!["--forwarder".into(), forwarder_addr.into()]),
    ];
    for iface in interfaces {
        specs.push(ComponentSpec::new(
            "abc",
            vec!["--forwarder".into(), forwarder_addr.into(), "--interface".into(), iface.clone()],
        ));
    }
    specs.push(ComponentSpec::new("traced", vec!["--forwarder".into(), forwarder_addr.into()]));
    specs
}
