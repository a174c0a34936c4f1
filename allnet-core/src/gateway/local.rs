//! Local gateway (§4.G): a pure fan-out between connected local applications
//! and the forwarder pipe. No bloom cache, no rate tracker — every app gets
//! every packet the forwarder hands back, and every packet an app sends goes
//! straight up with the priority it was tagged with.
//!
//! Grounded on `tcp::handler`'s accept loop (reused here via
//! [`crate::peer::PeerListener`]) composed with
//! `proxy::connection::manager`'s bounded fan-out set, trading the teacher's
//! "one inbound stream, one chosen backend" for "one inbound stream per app,
//! fan out to all of them".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::pipe::framing::{self, FrameReader, Priority, RecvOutcome};
use crate::pipe::multiplexer::FdId;

pub struct LocalGatewayConfig {
    pub port: u16,
    pub nodelay: bool,
}

struct OutboundFrame {
    payload: Vec<u8>,
    priority: Priority,
}

/// Shared table of connected apps' write halves, keyed by the fd the peer
/// listener assigned them.
#[derive(Default, Clone)]
pub struct AppFanout {
    writers: Arc<Mutex<HashMap<FdId, OwnedWriteHalf>>>,
}

impl AppFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, fd: FdId, writer: OwnedWriteHalf) {
        self.writers.lock().await.insert(fd, writer);
    }

    pub async fn remove(&self, fd: FdId) {
        self.writers.lock().await.remove(&fd);
    }

    /// Send to every connected app; a blocked or broken app only drops its
    /// own delivery (same backpressure policy as the forwarder, §4.F).
    async fn fan_out(&self, payload: &[u8], priority: Priority) {
        let mut writers = self.writers.lock().await;
        let mut dead = Vec::new();
        for (fd, writer) in writers.iter_mut() {
            if let Err(e) = framing::send(writer, payload, priority).await {
                warn!(fd, error = %e, "dropping local app on blocked/broken connection");
                dead.push(*fd);
            }
        }
        for fd in dead {
            writers.remove(&fd);
        }
    }
}

/// Read one app's frames and forward them to the shared uplink channel,
/// tagged with the fd they arrived on (purely for logging; the gateway does
/// not otherwise distinguish senders).
pub async fn run_app_reader<R>(fd: FdId, reader: R, uplink: mpsc::Sender<(FdId, Vec<u8>, Priority)>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FrameReader::new(reader);
    loop {
        match framed.recv().await {
            Ok(RecvOutcome::Frame { payload, priority }) => {
                if uplink.send((fd, payload, priority)).await.is_err() {
                    return;
                }
            }
            Ok(RecvOutcome::BadFrame) => {
                warn!(fd, "resynced after bad frame from local app");
            }
            Ok(RecvOutcome::Closed) => {
                debug!(fd, "local app disconnected");
                return;
            }
            Err(e) => {
                warn!(fd, error = %e, "error reading from local app");
                return;
            }
        }
    }
}

/// Drain the uplink channel and forward every frame to the forwarder pipe,
/// priority-tagged exactly as the app sent it (§4.G).
pub async fn run_uplink<W>(mut writer: W, mut uplink: mpsc::Receiver<(FdId, Vec<u8>, Priority)>)
where
    W: AsyncWrite + Unpin,
{
    while let Some((fd, payload, priority)) = uplink.recv().await {
        if let Err(e) = framing::send(&mut writer, &payload, priority).await {
            warn!(fd, error = %e, "forwarder pipe write failed, dropping app packet");
        }
    }
}

/// Drain frames from the forwarder pipe and fan them out to every connected
/// app (§4.G).
pub async fn run_downlink<R>(reader: R, apps: AppFanout, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FrameReader::new(reader);
    loop {
        tokio::select! {
            outcome = framed.recv() => {
                match outcome {
                    Ok(RecvOutcome::Frame { payload, priority }) => {
                        apps.fan_out(&payload, priority).await;
                    }
                    Ok(RecvOutcome::BadFrame) => {
                        warn!("resynced after bad frame from forwarder pipe");
                    }
                    Ok(RecvOutcome::Closed) => {
                        debug!("forwarder pipe closed");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading from forwarder pipe");
                        return;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Wire up a freshly-accepted app connection: split it, register the writer
/// half for fan-out, and spawn its reader task.
pub async fn register_app(
    fd: FdId,
    stream: TcpStream,
    apps: AppFanout,
    uplink: mpsc::Sender<(FdId, Vec<u8>, Priority)>,
) {
    let (read_half, write_half) = stream.into_split();
    apps.insert(fd, write_half).await;
    tokio::spawn(async move {
        run_app_reader(fd, read_half, uplink).await;
        apps.remove(fd).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_connected_app() {
        let apps = AppFanout::new();
        let (mut client_a, server_a) = connected_pair().await;
        let (mut client_b, server_b) = connected_pair().await;
        apps.insert(1, server_a.into_split().1).await;
        apps.insert(2, server_b.into_split().1).await;

        apps.fan_out(b"broadcast", 9).await;

        let mut reader_a = FrameReader::new(&mut client_a);
        let mut reader_b = FrameReader::new(&mut client_b);
        match reader_a.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"broadcast");
                assert_eq!(priority, 9);
            }
            other => panic!("unexpected: {other:?}"),
        }
        match reader_b.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"broadcast");
                assert_eq!(priority, 9);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn uplink_forwards_app_frames_with_their_priority() {
        let (tx, rx) = mpsc::channel(8);
        let (mut forwarder_reader, forwarder_writer) = duplex(4096);
        tokio::spawn(run_uplink(forwarder_writer, rx));
        tx.send((1, b"hi".to_vec(), 42)).await.unwrap();
        drop(tx);

        let mut framed = FrameReader::new(&mut forwarder_reader);
        match framed.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"hi");
                assert_eq!(priority, 42);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn app_reader_forwards_frames_to_uplink_channel() {
        let (mut client, server) = duplex(4096);
        let (tx, mut rx) = mpsc::channel(8);
        framing::send(&mut client, b"from app", 7).await.unwrap();
        drop(client);
        run_app_reader(5, server, tx).await;
        let (fd, payload, priority) = rx.recv().await.unwrap();
        assert_eq!(fd, 5);
        assert_eq!(payload, b"from app");
        assert_eq!(priority, 7);
    }
}
