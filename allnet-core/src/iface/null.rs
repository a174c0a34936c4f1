//! A no-op interface, standing in for hardware in tests the way the
//! teacher's `tcp::handler` tests stand up an in-memory listener instead of
//! a real NIC.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Result;
use crate::iface::{BroadcastIface, IfaceHandles};

pub struct NullIface {
    enabled: bool,
    inbox: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
}

impl NullIface {
    pub fn new() -> Self {
        Self { enabled: false, inbox: VecDeque::new(), sent: Vec::new() }
    }

    /// Queue a frame to be handed back by the next `recv`.
    pub fn push_inbound(&mut self, payload: Vec<u8>) {
        self.inbox.push_back(payload);
    }
}

impl Default for NullIface {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastIface for NullIface {
    async fn init(&mut self) -> Result<IfaceHandles> {
        Ok(IfaceHandles {
            local_addr: "0.0.0.0:0".parse().unwrap(),
            broadcast_addr: "255.255.255.255:0".parse().unwrap(),
        })
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.enabled)
    }

    async fn set_enabled(&mut self, state: bool) -> Result<()> {
        self.enabled = state;
        Ok(())
    }

    fn on_off_time(&self) -> Duration {
        Duration::from_millis(0)
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.sent.push(payload.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self.inbox.pop_front() {
            Some(payload) => Ok(payload),
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_records_outgoing_frames() {
        let mut iface = NullIface::new();
        iface.send(b"hello").await.unwrap();
        assert_eq!(iface.sent, vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn recv_returns_queued_frame() {
        let mut iface = NullIface::new();
        iface.push_inbound(b"inbound".to_vec());
        assert_eq!(iface.recv().await.unwrap(), b"inbound".to_vec());
    }

    #[tokio::test]
    async fn set_enabled_round_trips() {
        let mut iface = NullIface::new();
        assert!(!iface.is_enabled().await.unwrap());
        iface.set_enabled(true).await.unwrap();
        assert!(iface.is_enabled().await.unwrap());
    }
}
