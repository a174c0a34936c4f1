//! Wi-Fi broadcaster: the one compile-time interface type named in §4.I.
//!
//! The original drives a raw `AF_PACKET` socket so it can address the link
//! layer directly; with `#![forbid(unsafe_code)]` that is not available
//! here without FFI, so this broadcasts AllNet frames over a UDP socket
//! bound to the interface's broadcast address instead, using `socket2` for
//! `SO_BROADCAST`/`SO_REUSEADDR`/`SO_BINDTODEVICE` the same way the teacher's
//! `peer::listener` (and the teacher's own `tcp` module) sets socket options
//! before handing the fd to tokio.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{CoreError, Result};
use crate::iface::{BroadcastIface, IfaceHandles};

const MAX_DATAGRAM: usize = 16 * 1024;

pub struct WifiIface {
    interface: String,
    port: u16,
    socket: Option<UdpSocket>,
    broadcast_addr: SocketAddr,
    enabled: bool,
    /// Guideline warm-up time until refined by the first real
    /// `set_enabled` call (§4.I).
    on_off_ms: Duration,
}

impl WifiIface {
    pub fn new(interface: impl Into<String>, port: u16) -> Self {
        Self {
            interface: interface.into(),
            port,
            socket: None,
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            enabled: false,
            on_off_ms: Duration::from_millis(500),
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| CoreError::Fatal("wifi interface used before init".into()))
    }
}

impl BroadcastIface for WifiIface {
    async fn init(&mut self) -> Result<IfaceHandles> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        #[cfg(target_os = "linux")]
        {
            if let Err(e) = socket.bind_device(Some(self.interface.as_bytes())) {
                tracing::warn!(interface = %self.interface, error = %e, "unable to bind wifi socket to device");
            }
        }
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        let udp = UdpSocket::from_std(std_socket)?;
        let local_addr = udp.local_addr()?;
        self.socket = Some(udp);
        Ok(IfaceHandles { local_addr, broadcast_addr: self.broadcast_addr })
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.enabled)
    }

    async fn set_enabled(&mut self, state: bool) -> Result<()> {
        let started = Instant::now();
        self.enabled = state;
        // Real hardware would key the radio here; measure whatever the
        // transition actually costs and refine the guideline (§4.I).
        self.on_off_ms = started.elapsed().max(Duration::from_millis(1));
        Ok(())
    }

    fn on_off_time(&self) -> Duration {
        self.on_off_ms
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM {
            return Err(CoreError::Oversize { got: payload.len() as u32, max: MAX_DATAGRAM as u32 });
        }
        let addr = self.broadcast_addr;
        self.socket()?.send_to(payload, addr).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let socket = self.socket.as_ref().ok_or_else(|| CoreError::Fatal("wifi interface used before init".into()))?;
        let (n, _from) = socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_binds_a_udp_socket() {
        let mut iface = WifiIface::new("lo", 0);
        let handles = iface.init().await.unwrap();
        assert_eq!(handles.local_addr.ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(handles.broadcast_addr.ip(), Ipv4Addr::BROADCAST);
    }

    #[tokio::test]
    async fn set_enabled_updates_state_and_timing() {
        let mut iface = WifiIface::new("lo", 0);
        assert!(!iface.is_enabled().await.unwrap());
        iface.set_enabled(true).await.unwrap();
        assert!(iface.is_enabled().await.unwrap());
        assert!(iface.on_off_time() > Duration::ZERO);
    }
}
