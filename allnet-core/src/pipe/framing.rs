//! Inter-module pipe framing (§4.A, §6): `magic(8) || length(4, BE) ||
//! priority(4, BE) || payload(length bytes)`.
//!
//! Grounded on the teacher's `tcp::handler` boxed-stream pattern (a trait
//! object over anything that is both readable and writable), generalized
//! from "one HTTP connection" to "one length-prefixed frame on a pipe".

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, Result};
use crate::packet::MAX_PACKET;

/// Compile-time constant distinguishing frames from stray bytes on a reused
/// socket (§6).
pub const FRAME_MAGIC: [u8; 8] = *b"ALnetF01";

/// Priority carried alongside a message; interpreted only at forwarding
/// time (§4.A). `0` is reserved and never sent.
pub type Priority = u32;

pub const PRIORITY_RESERVED: Priority = 0;
pub const PRIORITY_MIN: Priority = 1;
pub const PRIORITY_MAX: Priority = (1u32 << 31) - 1;

/// Anything a pipe half can be backed by: an OS pipe fd, a TCP socket, or (in
/// tests) an in-memory duplex stream.
pub trait PipeIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PipeIo for T {}

/// Result of one `recv` call on a [`FrameReader`].
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Frame { payload: Vec<u8>, priority: Priority },
    /// EOF observed at a frame boundary.
    Closed,
    /// The stream did not start with a valid frame; the reader resynced (or,
    /// for an oversize length field, is about to). Logged once per resync;
    /// callers should call `recv` again to get the next frame.
    BadFrame,
}

/// Write one frame, retrying partial writes until the whole frame is sent or
/// an error occurs (§4.A `send`).
pub async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    priority: Priority,
) -> Result<()> {
    if payload.len() > MAX_PACKET {
        return Err(CoreError::Oversize { got: payload.len() as u32, max: MAX_PACKET as u32 });
    }
    let mut buf = Vec::with_capacity(8 + 4 + 4 + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&priority.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Stateful frame reader over one pipe half. Keeps track of whether the
/// magic for an in-progress frame has already been matched, so an oversize
/// or malformed length can force exactly one resync on the next call without
/// losing already-read bytes.
pub struct FrameReader<R> {
    inner: R,
    magic_matched: bool,
}

enum SyncResult {
    MatchedImmediately,
    Resynced,
    Closed,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, magic_matched: false }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn sync_to_magic(&mut self) -> Result<SyncResult> {
        let mut window = [0u8; FRAME_MAGIC.len()];
        let mut filled = 0usize;
        while filled < window.len() {
            let n = self.inner.read(&mut window[filled..]).await?;
            if n == 0 {
                return Ok(if filled == 0 {
                    SyncResult::Closed
                } else {
                    // EOF mid-magic: not a frame boundary, treat like closed
                    // since there is nothing more to resync against.
                    SyncResult::Closed
                });
            }
            filled += n;
        }
        if window == FRAME_MAGIC {
            return Ok(SyncResult::MatchedImmediately);
        }
        loop {
            window.copy_within(1.., 0);
            let mut b = [0u8; 1];
            let n = self.inner.read(&mut b).await?;
            if n == 0 {
                return Ok(SyncResult::Closed);
            }
            *window.last_mut().unwrap() = b[0];
            if window == FRAME_MAGIC {
                return Ok(SyncResult::Resynced);
            }
        }
    }

    /// Read one frame, resyncing transparently on garbage bytes (§4.A).
    pub async fn recv(&mut self) -> Result<RecvOutcome> {
        if !self.magic_matched {
            match self.sync_to_magic().await? {
                SyncResult::Closed => return Ok(RecvOutcome::Closed),
                SyncResult::Resynced => {
                    self.magic_matched = true;
                    return Ok(RecvOutcome::BadFrame);
                }
                SyncResult::MatchedImmediately => {
                    self.magic_matched = true;
                }
            }
        }
        // Consume the matched magic for this attempt; any failure below
        // forces a fresh sync on the next call.
        self.magic_matched = false;

        let mut len_buf = [0u8; 4];
        if self.inner.read_exact(&mut len_buf).await.is_err() {
            return Ok(RecvOutcome::Closed);
        }
        let length = u32::from_be_bytes(len_buf);
        if length as usize > MAX_PACKET {
            return Ok(RecvOutcome::BadFrame);
        }

        let mut prio_buf = [0u8; 4];
        if self.inner.read_exact(&mut prio_buf).await.is_err() {
            return Ok(RecvOutcome::Closed);
        }
        let priority = u32::from_be_bytes(prio_buf);

        let mut payload = vec![0u8; length as usize];
        if self.inner.read_exact(&mut payload).await.is_err() {
            return Ok(RecvOutcome::Closed);
        }

        Ok(RecvOutcome::Frame { payload, priority })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_payload_and_priority() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server);
        send(&mut client, b"hello overlay", 1234).await.unwrap();
        match reader.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"hello overlay");
                assert_eq!(priority, 1234);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recv_returns_closed_at_frame_boundary() {
        let (client, server) = duplex(4096);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert_eq!(reader.recv().await.unwrap(), RecvOutcome::Closed);
    }

    #[tokio::test]
    async fn garbage_prefix_resyncs_with_one_bad_frame_signal() {
        let (mut client, server) = duplex(8192);
        let mut reader = FrameReader::new(server);
        client.write_all(b"random garbage bytes here").await.unwrap();
        send(&mut client, b"payload", 5).await.unwrap();
        drop(client);

        assert_eq!(reader.recv().await.unwrap(), RecvOutcome::BadFrame);
        match reader.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"payload");
                assert_eq!(priority, 5);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_length_is_treated_as_bad_frame() {
        let (mut client, server) = duplex(8192);
        let mut reader = FrameReader::new(server);
        client.write_all(&FRAME_MAGIC).await.unwrap();
        client.write_all(&(MAX_PACKET as u32 + 1).to_be_bytes()).await.unwrap();
        send(&mut client, b"next frame", 7).await.unwrap();
        drop(client);

        assert_eq!(reader.recv().await.unwrap(), RecvOutcome::BadFrame);
        match reader.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"next frame");
                assert_eq!(priority, 7);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_writes_still_reassemble() {
        let (mut client, server) = duplex(8192);
        let mut reader = FrameReader::new(server);
        let mut frame = Vec::new();
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&5u32.to_be_bytes());
        frame.extend_from_slice(&42u32.to_be_bytes());
        frame.extend_from_slice(b"abcde");
        for chunk in frame.chunks(3) {
            client.write_all(chunk).await.unwrap();
        }
        match reader.recv().await.unwrap() {
            RecvOutcome::Frame { payload, priority } => {
                assert_eq!(payload, b"abcde");
                assert_eq!(priority, 42);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
