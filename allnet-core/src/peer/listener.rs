//! Dual-stack peer listener (§4.E): one IPv6 and one optional IPv4 accept
//! socket, feeding accepted connections into a shared [`PeerTable`].
//!
//! The accept-loop-with-shutdown-watch shape is the teacher's
//! `tcp::handler::TcpHandler::run`; the bind/`SO_REUSEADDR`/dual-stack
//! mechanics and the IPv4-mapped-address normalization are from `listen.c`'s
//! `init_listen_socket` and `listen_loop`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::packet::PeerAddr;
use crate::peer::table::{AddOutcome, PeerEntry, PeerTable};
use crate::pipe::multiplexer::FdId;

pub struct PeerListenerConfig {
    pub port: u16,
    pub local_only: bool,
    pub nodelay: bool,
    pub unique_ip_required: bool,
}

/// What the caller should do with a freshly-accepted socket.
pub enum AcceptAction {
    /// Register `fd` as a new peer, wired into the multiplexer.
    Register { fd: FdId, stream: TcpStream, addr: SocketAddr },
    /// Register `fd` as a new peer, and separately notify `evicted` (the
    /// peer the table's LRU policy bumped to make room for it) with
    /// `survivors` as an `ALLNET_MGMT_PEERS` message before closing it.
    RegisterAndEvict { fd: FdId, stream: TcpStream, addr: SocketAddr, evicted: PeerEntry, survivors: Vec<PeerAddr> },
    /// Table admission pressure or a duplicate IP: send `peers` (if
    /// non-empty) as an `ALLNET_MGMT_PEERS` message, then drop `stream`.
    SendPeersAndClose { stream: TcpStream, peers: Vec<PeerAddr> },
}

pub struct PeerListener {
    table: Arc<Mutex<PeerTable>>,
    config: PeerListenerConfig,
    next_fd: AtomicU32,
}

fn bind_socket(domain: Domain, addr: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if domain == Domain::IPV6 {
        // accept IPv4-mapped connections on the same socket when possible.
        let _ = socket.set_only_v6(false);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket)
}

/// Bind the IPv6 listener (mandatory) and, best-effort, an IPv4 listener.
/// A failed IPv4 bind is tolerated (commonly because IPv6 is already
/// handling IPv4-mapped connections); a failed IPv6 bind is fatal.
pub fn bind_dual_stack(port: u16, local_only: bool) -> Result<(TcpListener, Option<TcpListener>)> {
    let v6_ip = if local_only { Ipv6Addr::LOCALHOST } else { Ipv6Addr::UNSPECIFIED };
    let v6_addr = SocketAddr::new(IpAddr::V6(v6_ip), port);
    let v6_socket = bind_socket(Domain::IPV6, v6_addr)
        .map_err(|e| CoreError::Fatal(format!("unable to bind ipv6 listener on port {port}: {e}")))?;
    let v6_listener = TcpListener::from_std(v6_socket.into())?;

    let v4_ip = if local_only { Ipv4Addr::LOCALHOST } else { Ipv4Addr::UNSPECIFIED };
    let v4_addr = SocketAddr::new(IpAddr::V4(v4_ip), port);
    let v4_listener = match bind_socket(Domain::IPV4, v4_addr) {
        Ok(socket) => match TcpListener::from_std(socket.into()) {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(error = %e, "failed to wrap ipv4 listener, relying on ipv6 for ipv4-mapped peers");
                None
            }
        },
        Err(e) => {
            info!(error = %e, "ipv4 bind failed, probably handled by ipv6");
            None
        }
    };

    Ok((v6_listener, v4_listener))
}

/// IPv4-mapped IPv6 addresses ("::ffff:a.b.c.d") are recorded as plain IPv4,
/// matching `standardize_ip` in `listen.c`.
pub fn normalize_peer_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

fn is_loopback(addr: SocketAddr) -> bool {
    addr.ip().is_loopback()
}

impl PeerListener {
    pub fn new(table: Arc<Mutex<PeerTable>>, config: PeerListenerConfig) -> Self {
        Self { table, config, next_fd: AtomicU32::new(1) }
    }

    async fn accept_one(&self, stream: TcpStream, addr: SocketAddr) -> Option<AcceptAction> {
        let addr = normalize_peer_addr(addr);
        if self.config.local_only && !is_loopback(addr) {
            warn!(%addr, "dropping non-loopback connection while local_only is set");
            return None;
        }
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "unable to set TCP_NODELAY");
            }
        }

        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock().await;
        match table.add_fd(fd, Some(addr), [0; 8], 0, self.config.unique_ip_required) {
            AddOutcome::Added => Some(AcceptAction::Register { fd, stream, addr }),
            AddOutcome::DuplicateIp => {
                Some(AcceptAction::SendPeersAndClose { stream, peers: Vec::new() })
            }
            AddOutcome::RejectedAdmissionPressure => {
                let peers = peer_addrs(&table);
                Some(AcceptAction::SendPeersAndClose { stream, peers })
            }
            AddOutcome::Evicted { evicted } => {
                let survivors = peer_addrs(&table);
                Some(AcceptAction::RegisterAndEvict { fd, stream, addr, evicted, survivors })
            }
        }
    }

    /// Accept loop for one bound listener, terminating when `shutdown`
    /// fires. Emits one [`AcceptAction`] per handled connection via
    /// `on_action`.
    pub async fn run<F, Fut>(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        mut on_action: F,
    ) where
        F: FnMut(AcceptAction) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, addr)) => {
                            if let Some(action) = self.accept_one(stream, addr).await {
                                on_action(action).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        info!("peer listener shutting down");
                        return;
                    }
                }
            }
        }
    }
}

fn peer_addrs(table: &PeerTable) -> Vec<PeerAddr> {
    table
        .entries()
        .filter_map(|e| e.addr)
        .map(|addr| PeerAddr { ip: addr.ip(), port: addr.port() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_v4_mapped_addresses() {
        let mapped: SocketAddr = "[::ffff:10.0.0.5]:4000".parse().unwrap();
        let normalized = normalize_peer_addr(mapped);
        assert_eq!(normalized, "10.0.0.5:4000".parse().unwrap());
    }

    #[test]
    fn leaves_plain_v6_addresses_alone() {
        let addr: SocketAddr = "[::1]:4000".parse().unwrap();
        assert_eq!(normalize_peer_addr(addr), addr);
    }

    #[tokio::test]
    async fn binds_an_ephemeral_dual_stack_port() {
        let (v6, v4) = bind_dual_stack(0, true).unwrap();
        assert!(v6.local_addr().is_ok());
        assert!(v4.is_none() || v4.unwrap().local_addr().is_ok());
    }
}
