//! Pipe multiplexer (§4.B): wait on an open set of pipes, return whichever
//! produces a complete frame first.
//!
//! Grounded on the teacher's `tcp::handler::TcpHandler::run` accept loop,
//! which already combines "wait on one socket" with "react to a shutdown
//! signal" via `tokio::select!`; here that idea is generalized to an open,
//! dynamically-changing set of pipes by giving each one its own task that
//! feeds a shared `mpsc` channel, which is exactly the fan-in tokio's
//! ecosystem reaches for when the set of awaited things isn't fixed at
//! compile time.
//!
//! Per §5, only the forwarder ever owns a [`Multiplexer`], and it does so
//! from a single task, so `add`/`remove`/`recv_any` are always called
//! sequentially from that one task — no internal locking is needed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pipe::framing::{FrameReader, Priority, RecvOutcome};

/// Identifies one registered pipe. Callers pick these (e.g. a small enum
/// cast to `u32`, or an index into a `Vec` of module handles).
pub type FdId = u32;

enum MuxEvent {
    Frame { id: FdId, payload: Vec<u8>, priority: Priority },
    BadFrame { id: FdId },
    Closed { id: FdId },
}

/// What `recv_any` waited for.
pub enum MuxOutcome {
    Frame { id: FdId, payload: Vec<u8>, priority: Priority },
    Timeout,
    ClosedFd(FdId),
}

/// How long `recv_any` should wait.
pub enum Wait {
    Forever,
    Millis(u64),
}

pub struct Multiplexer {
    events_tx: mpsc::Sender<MuxEvent>,
    events_rx: mpsc::Receiver<MuxEvent>,
    tasks: HashMap<FdId, JoinHandle<()>>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self { events_tx, events_rx, tasks: HashMap::new() }
    }

    /// Register a pipe half under `id`, replacing any prior registration
    /// under the same id (its task is aborted first).
    pub fn add<R>(&mut self, id: FdId, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        self.remove(id);
        let tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let mut framed = FrameReader::new(reader);
            loop {
                match framed.recv().await {
                    Ok(RecvOutcome::Frame { payload, priority }) => {
                        if tx.send(MuxEvent::Frame { id, payload, priority }).await.is_err() {
                            return;
                        }
                    }
                    Ok(RecvOutcome::BadFrame) => {
                        tracing::warn!(fd = id, "resynced after bad frame");
                        if tx.send(MuxEvent::BadFrame { id }).await.is_err() {
                            return;
                        }
                    }
                    Ok(RecvOutcome::Closed) | Err(_) => {
                        let _ = tx.send(MuxEvent::Closed { id }).await;
                        return;
                    }
                }
            }
        });
        self.tasks.insert(id, handle);
    }

    /// Idempotent: removing an id that was never added (or already removed)
    /// is a no-op.
    pub fn remove(&mut self, id: FdId) {
        if let Some(handle) = self.tasks.remove(&id) {
            handle.abort();
        }
    }

    pub fn is_registered(&self, id: FdId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Wait for the next complete frame across every registered pipe.
    pub async fn recv_any(&mut self, wait: Wait) -> MuxOutcome {
        let event = match wait {
            Wait::Forever => self.events_rx.recv().await,
            Wait::Millis(ms) => match tokio::time::timeout(Duration::from_millis(ms), self.events_rx.recv()).await {
                Ok(event) => event,
                Err(_) => return MuxOutcome::Timeout,
            },
        };
        match event {
            Some(MuxEvent::Frame { id, payload, priority }) => MuxOutcome::Frame { id, payload, priority },
            Some(MuxEvent::BadFrame { .. }) => MuxOutcome::Timeout, // logged already; caller just loops again
            Some(MuxEvent::Closed { id }) => {
                self.tasks.remove(&id);
                MuxOutcome::ClosedFd(id)
            }
            None => MuxOutcome::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::framing::send;
    use tokio::io::duplex;

    #[tokio::test]
    async fn delivers_frame_from_registered_pipe() {
        let mut mux = Multiplexer::new();
        let (mut client, server) = duplex(4096);
        mux.add(1, server);
        send(&mut client, b"hi", 7).await.unwrap();
        match mux.recv_any(Wait::Millis(1000)).await {
            MuxOutcome::Frame { id, payload, priority } => {
                assert_eq!(id, 1);
                assert_eq!(payload, b"hi");
                assert_eq!(priority, 7);
            }
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn reports_closed_fd_on_eof() {
        let mut mux = Multiplexer::new();
        let (client, server) = duplex(4096);
        mux.add(2, server);
        drop(client);
        match mux.recv_any(Wait::Millis(1000)).await {
            MuxOutcome::ClosedFd(id) => assert_eq!(id, 2),
            _ => panic!("expected closed fd"),
        }
        assert!(!mux.is_registered(2));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let mut mux = Multiplexer::new();
        mux.remove(99);
        mux.remove(99);
    }

    #[tokio::test]
    async fn times_out_with_no_data() {
        let mut mux = Multiplexer::new();
        let (_client, server) = duplex(4096);
        mux.add(3, server);
        matches!(mux.recv_any(Wait::Millis(20)).await, MuxOutcome::Timeout);
    }

    #[tokio::test]
    async fn delivers_frames_in_send_order_on_one_fd() {
        let mut mux = Multiplexer::new();
        let (mut client, server) = duplex(8192);
        mux.add(1, server);
        send(&mut client, b"first", 1).await.unwrap();
        send(&mut client, b"second", 2).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let MuxOutcome::Frame { payload, .. } = mux.recv_any(Wait::Millis(1000)).await {
                seen.push(payload);
            }
        }
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
    }
}
