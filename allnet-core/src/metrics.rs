//! Lock-free packet counters, one instance per long-running component.
//!
//! Grounded directly on `tcp::metrics::ConnectionCount`: a small struct of
//! `AtomicUsize` fields plus a snapshot type and a Prometheus exposition
//! renderer, served on a loopback port. No metrics crate dependency is
//! pulled in for this, matching the teacher's own hand-rolled counters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

#[derive(Debug, Default)]
pub struct ForwarderMetrics {
    forwarded: AtomicUsize,
    dropped_duplicate: AtomicUsize,
    dropped_rate_limited: AtomicUsize,
    dropped_malformed: AtomicUsize,
    peers_connected: AtomicUsize,
    peers_total: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwarderSnapshot {
    pub forwarded: usize,
    pub dropped_duplicate: usize,
    pub dropped_rate_limited: usize,
    pub dropped_malformed: usize,
    pub peers_connected: usize,
    pub peers_total: usize,
}

impl ForwarderMetrics {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_duplicate(&self) {
        self.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_rate_limited(&self) {
        self.dropped_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
        self.peers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        self.peers_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .ok();
    }

    pub fn snapshot(&self) -> ForwarderSnapshot {
        ForwarderSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_rate_limited: self.dropped_rate_limited.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
            peers_total: self.peers_total.load(Ordering::Relaxed),
        }
    }

    pub fn to_prometheus(&self, prefix: &str) -> String {
        let snap = self.snapshot();
        format!(
            "# HELP {p}_packets_forwarded_total Packets forwarded to at least one pipe\n\
             # TYPE {p}_packets_forwarded_total counter\n\
             {p}_packets_forwarded_total {forwarded}\n\
             # HELP {p}_packets_dropped_duplicate_total Packets dropped as duplicates\n\
             # TYPE {p}_packets_dropped_duplicate_total counter\n\
             {p}_packets_dropped_duplicate_total {dup}\n\
             # HELP {p}_packets_dropped_rate_limited_total Packets dropped by the rate limiter\n\
             # TYPE {p}_packets_dropped_rate_limited_total counter\n\
             {p}_packets_dropped_rate_limited_total {rate}\n\
             # HELP {p}_packets_dropped_malformed_total Packets dropped as unparseable\n\
             # TYPE {p}_packets_dropped_malformed_total counter\n\
             {p}_packets_dropped_malformed_total {malformed}\n\
             # HELP {p}_peers_connected Currently connected peers\n\
             # TYPE {p}_peers_connected gauge\n\
             {p}_peers_connected {connected}\n\
             # HELP {p}_peers_total Peers ever connected\n\
             # TYPE {p}_peers_total counter\n\
             {p}_peers_total {total}\n",
            p = prefix,
            forwarded = snap.forwarded,
            dup = snap.dropped_duplicate,
            rate = snap.dropped_rate_limited,
            malformed = snap.dropped_malformed,
            connected = snap.peers_connected,
            total = snap.peers_total,
        )
    }
}

/// Serve the counters in Prometheus exposition format on a loopback port
/// until the process exits.
pub async fn serve_metrics(addr: SocketAddr, metrics: Arc<ForwarderMetrics>, prefix: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (mut stream, _peer) = listener.accept().await?;
        let body = metrics.to_prometheus(prefix);
        let resp = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        tokio::spawn(async move {
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
