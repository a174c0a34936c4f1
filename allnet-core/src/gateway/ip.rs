//! IP gateway (§4.H): a peer listener plus an outbound dial set, a
//! known-peer set persisted to disk, and periodic `MGMT_PEERS` exchange.
//!
//! Grounded on `tcp::handler`'s accept loop composed with
//! `proxy::connection::manager`'s bounded fan-out set (here, connected
//! peers rather than connected apps), layered over the peer listener/table
//! from §4.E. The known-peer persistence follows the same temp-file-then-
//! rename idiom [`crate::bloom::family::BloomFamily`] uses, serialized with
//! `toml` (the teacher's config-file format) instead of the bloom family's
//! packed binary layout, since this is a small human-inspectable list.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::packet::{decode_mgmt_peers, encode_mgmt_peers, Header, PacketType, Packet, PeerAddr};
use crate::peer::listener::{normalize_peer_addr, AcceptAction, PeerListener};
use crate::peer::table::{AddOutcome, PeerTable, Reservation};
use crate::pipe::framing::{self, FrameReader, Priority, RecvOutcome, PRIORITY_RESERVED};
use crate::pipe::multiplexer::FdId;

#[derive(Debug, Serialize, Deserialize, Default)]
struct KnownPeersFile {
    peers: Vec<String>,
}

/// The set of peer addresses this node knows about, independent of which
/// ones are currently connected (§4.H "known-peer set persisted to disk").
#[derive(Clone)]
pub struct KnownPeers {
    inner: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl KnownPeers {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub async fn record(&self, addr: SocketAddr) {
        self.inner.lock().await.insert(addr);
    }

    pub async fn record_many(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut set = self.inner.lock().await;
        set.extend(addrs);
    }

    /// Pick an address not already in `exclude`, arbitrarily (no ordering
    /// guarantee is promised by §4.H beyond "the next peer").
    pub async fn next_undialed(&self, exclude: &HashSet<SocketAddr>) -> Option<SocketAddr> {
        self.inner.lock().await.iter().find(|a| !exclude.contains(*a)).copied()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let set = self.inner.lock().await;
        let file = KnownPeersFile { peers: set.iter().map(|a| a.to_string()).collect() };
        let text = toml::to_string_pretty(&file).map_err(|e| CoreError::Persistence(e.to_string()))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, text.as_bytes()).await.map_err(|e| CoreError::Persistence(e.to_string()))?;
        fs::rename(&tmp_path, path).await.map_err(|e| CoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn load(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).await.map_err(|e| CoreError::Persistence(e.to_string()))?;
        let file: KnownPeersFile = toml::from_str(&text).map_err(|e| CoreError::Persistence(e.to_string()))?;
        let mut set = self.inner.lock().await;
        for raw in file.peers {
            if let Ok(addr) = raw.parse::<SocketAddr>() {
                set.insert(addr);
            } else {
                warn!(addr = %raw, "ignoring unparseable known-peer entry");
            }
        }
        Ok(())
    }
}

impl Default for KnownPeers {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IpGatewayConfig {
    pub port: u16,
    pub target_peer_count: usize,
    pub dial_interval: Duration,
    pub mgmt_interval: Duration,
    pub known_peers_path: PathBuf,
}

/// One connected peer socket's write half, shared across the fan-out and
/// periodic `MGMT_PEERS` tasks.
type PeerWriter = Box<dyn AsyncWrite + Unpin + Send>;

pub struct IpGateway {
    table: Arc<Mutex<PeerTable>>,
    listener: Arc<PeerListener>,
    known: KnownPeers,
    writers: Arc<Mutex<std::collections::HashMap<FdId, PeerWriter>>>,
    readers: Arc<Mutex<std::collections::HashMap<FdId, tokio::task::AbortHandle>>>,
    config: IpGatewayConfig,
}

impl IpGateway {
    pub fn new(table: Arc<Mutex<PeerTable>>, listener: Arc<PeerListener>, known: KnownPeers, config: IpGatewayConfig) -> Self {
        Self {
            table,
            listener,
            known,
            writers: Arc::new(Mutex::new(std::collections::HashMap::new())),
            readers: Arc::new(Mutex::new(std::collections::HashMap::new())),
            config,
        }
    }

    /// Wire up one peer connection in both directions: inbound frames go to
    /// the forwarder pipe with priority forced to 0 (the forwarder
    /// recomputes it, §4.H); `MGMT_PEERS` payloads are additionally
    /// recorded into the known-peer set before being passed along.
    pub fn register_peer(
        &self,
        fd: FdId,
        stream: TcpStream,
        to_forwarder: mpsc::Sender<Vec<u8>>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let writers_cleanup = self.writers.clone();
        let readers_cleanup = self.readers.clone();
        let known = self.known.clone();
        let reader_handle = tokio::spawn(async move {
            run_peer_reader(fd, read_half, to_forwarder, known).await;
            writers_cleanup.lock().await.remove(&fd);
            readers_cleanup.lock().await.remove(&fd);
        });
        let writers = self.writers.clone();
        let readers = self.readers.clone();
        let abort = reader_handle.abort_handle();
        tokio::spawn(async move {
            writers.lock().await.insert(fd, Box::new(write_half));
            readers.lock().await.insert(fd, abort);
        });
    }

    /// Tear down an evicted peer (§4.E eviction protocol): send it
    /// `survivors` as an `ALLNET_MGMT_PEERS` message, then drop its write
    /// half and abort its reader task so the socket doesn't outlive its
    /// table slot.
    async fn evict_peer(&self, fd: FdId, survivors: &[PeerAddr]) {
        let writer = self.writers.lock().await.remove(&fd);
        if let Some(mut writer) = writer {
            if !survivors.is_empty() {
                let packet = mgmt_peers_packet(survivors);
                if let Err(e) = framing::send(&mut writer, &packet.encode(), PRIORITY_RESERVED + 1).await {
                    debug!(fd, error = %e, "failed to notify evicted peer");
                }
            }
        }
        if let Some(abort) = self.readers.lock().await.remove(&fd) {
            abort.abort();
        }
    }

    /// Send `payload` (already framed-ready bytes) to every connected peer
    /// except `skip_fd`, if given.
    async fn broadcast(&self, payload: &[u8], priority: Priority, skip_fd: Option<FdId>) {
        let mut writers = self.writers.lock().await;
        let mut dead = Vec::new();
        for (fd, writer) in writers.iter_mut() {
            if Some(*fd) == skip_fd {
                continue;
            }
            if let Err(e) = framing::send(writer, payload, priority).await {
                warn!(fd, error = %e, "dropping peer on blocked/broken connection");
                dead.push(*fd);
            }
        }
        for fd in dead {
            writers.remove(&fd);
        }
    }

    /// Accept loop: wires newly-registered peers into the fan-out set,
    /// drops connections the table rejected.
    pub async fn run_accept_loop(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        shutdown: watch::Receiver<bool>,
        to_forwarder: mpsc::Sender<Vec<u8>>,
    ) {
        let this = self.clone();
        self.listener
            .run(listener, shutdown, move |action| {
                let this = this.clone();
                let to_forwarder = to_forwarder.clone();
                async move {
                    match action {
                        AcceptAction::Register { fd, stream, addr } => {
                            this.known.record(addr).await;
                            this.register_peer(fd, stream, to_forwarder);
                        }
                        AcceptAction::RegisterAndEvict { fd, stream, addr, evicted, survivors } => {
                            this.known.record(addr).await;
                            this.register_peer(fd, stream, to_forwarder);
                            this.evict_peer(evicted.fd, &survivors).await;
                        }
                        AcceptAction::SendPeersAndClose { mut stream, peers } => {
                            if !peers.is_empty() {
                                let _ = send_mgmt_peers(&mut stream, &peers).await;
                            }
                        }
                    }
                }
            })
            .await;
    }

    /// Periodically dial out until `target_peer_count` connections are
    /// held, respecting in-flight reservations (§4.E/§4.H).
    pub async fn run_dial_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, to_forwarder: mpsc::Sender<Vec<u8>>) {
        let mut ticker = tokio::time::interval(self.config.dial_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dial_one_if_needed(&to_forwarder).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn dial_one_if_needed(&self, to_forwarder: &mpsc::Sender<Vec<u8>>) {
        let connected: HashSet<SocketAddr> = {
            let table = self.table.lock().await;
            if table.len() >= self.config.target_peer_count {
                return;
            }
            table.entries().filter_map(|e| e.addr).collect()
        };
        let Some(candidate) = self.known.next_undialed(&connected).await else {
            return;
        };
        {
            let mut table = self.table.lock().await;
            match table.already_listening(candidate) {
                Reservation::ExistingFd(_) | Reservation::ReservedByOther => return,
                // `already_listening` reserves the address for us as a side
                // effect of returning `ReservedByMe`.
                Reservation::ReservedByMe => {}
            }
        }

        match TcpStream::connect(candidate).await {
            Ok(stream) => {
                let addr = normalize_peer_addr(stream.peer_addr().unwrap_or(candidate));
                let fd = fd_placeholder();
                let mut table = self.table.lock().await;
                let outcome = table.add_fd(fd, Some(addr), [0; 8], 0, false);
                table.clear_reservation(candidate);
                let survivors = matches!(outcome, AddOutcome::Evicted { .. }).then(|| connected_peer_addrs(&table));
                drop(table);
                match outcome {
                    AddOutcome::Added => {
                        self.register_peer(fd, stream, to_forwarder.clone());
                    }
                    AddOutcome::Evicted { evicted } => {
                        self.register_peer(fd, stream, to_forwarder.clone());
                        self.evict_peer(evicted.fd, &survivors.unwrap_or_default()).await;
                    }
                    AddOutcome::DuplicateIp | AddOutcome::RejectedAdmissionPressure => {
                        debug!(%candidate, "dial succeeded but table rejected the peer");
                    }
                }
            }
            Err(e) => {
                debug!(%candidate, error = %e, "dial failed");
                self.table.lock().await.clear_reservation(candidate);
            }
        }
    }

    /// Periodically advertise the currently-connected peer set to every
    /// peer, and fold any `MGMT_PEERS` we've received (via `register_peer`)
    /// into the known-peer set — the latter happens continuously in
    /// `run_peer_reader`, this loop only handles the outbound half.
    pub async fn run_mgmt_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.mgmt_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let peers: Vec<PeerAddr> = {
                        let table = self.table.lock().await;
                        connected_peer_addrs(&table)
                    };
                    if peers.is_empty() {
                        continue;
                    }
                    let packet = mgmt_peers_packet(&peers);
                    let encoded = packet.encode();
                    self.broadcast(&encoded, PRIORITY_RESERVED + 1, None).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Drain frames arriving from the forwarder pipe and fan them out to
    /// every connected peer: the forwarder has already deduplicated and
    /// rate-limited, so this side only relays.
    pub async fn run_downlink<R>(self: Arc<Self>, reader: R, mut shutdown: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        let mut framed = FrameReader::new(reader);
        loop {
            tokio::select! {
                outcome = framed.recv() => {
                    match outcome {
                        Ok(RecvOutcome::Frame { payload, priority }) => {
                            self.broadcast(&payload, priority, None).await;
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

    pub async fn save_known_peers(&self) -> Result<()> {
        self.known.save(&self.config.known_peers_path).await
    }

    pub async fn load_known_peers(&self) -> Result<()> {
        self.known.load(&self.config.known_peers_path).await
    }
}

/// Placeholder fd allocation for dialed (as opposed to accepted)
/// connections; production wiring assigns this from the same counter the
/// peer listener uses. Kept as a distinct seam so tests can supply their
/// own allocator without touching `PeerListener`.
fn fd_placeholder() -> FdId {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(1 << 16);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

async fn send_mgmt_peers(stream: &mut TcpStream, peers: &[PeerAddr]) -> Result<()> {
    let packet = mgmt_peers_packet(peers);
    framing::send(stream, &packet.encode(), PRIORITY_RESERVED + 1).await
}

fn connected_peer_addrs(table: &PeerTable) -> Vec<PeerAddr> {
    table.entries().filter_map(|e| e.addr).map(|a| PeerAddr { ip: a.ip(), port: a.port() }).collect()
}

fn mgmt_peers_packet(peers: &[PeerAddr]) -> Packet {
    let header = Header {
        version: crate::packet::ALLNET_VERSION,
        packet_type: PacketType::Mgmt,
        hop_count: 0,
        max_hops: 1,
        source_nbits: 0,
        destination_nbits: 0,
        sig_algo: 0,
        transport: 0,
        source: [0; 8],
        destination: [0; 8],
        message_id: None,
        expiration_ms: None,
    };
    Packet { header, payload: encode_mgmt_peers(peers) }
}

/// Read frames from one peer socket, forward every one to the forwarder
/// pipe with priority forced to 0, and snoop `MGMT_PEERS` payloads into the
/// known-peer set (§4.H).
async fn run_peer_reader<R>(fd: FdId, reader: R, to_forwarder: mpsc::Sender<Vec<u8>>, known: KnownPeers)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FrameReader::new(reader);
    loop {
        match framed.recv().await {
            Ok(RecvOutcome::Frame { payload, priority: _ }) => {
                if let Ok(packet) = Packet::parse(&payload) {
                    if packet.header.packet_type == PacketType::Mgmt {
                        if let Ok(peers) = decode_mgmt_peers(&packet.payload) {
                            let addrs = peers.into_iter().map(|p| SocketAddr::new(p.ip, p.port));
                            known.record_many(addrs).await;
                        }
                    }
                }
                if to_forwarder.send(payload).await.is_err() {
                    return;
                }
            }
            Ok(RecvOutcome::BadFrame) => {
                warn!(fd, "resynced after bad frame from peer");
            }
            Ok(RecvOutcome::Closed) => {
                debug!(fd, "peer disconnected");
                return;
            }
            Err(e) => {
                warn!(fd, error = %e, "error reading from peer");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_peers_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.toml");
        let known = KnownPeers::new();
        known.record("127.0.0.1:4000".parse().unwrap()).await;
        known.record("10.0.0.5:5000".parse().unwrap()).await;
        known.save(&path).await.unwrap();

        let restored = KnownPeers::new();
        restored.load(&path).await.unwrap();
        let exclude: HashSet<SocketAddr> = HashSet::new();
        let mut found = HashSet::new();
        for _ in 0..2 {
            if let Some(addr) = restored.next_undialed(&found).await {
                found.insert(addr);
            }
        }
        let _ = exclude;
        assert!(found.contains(&"127.0.0.1:4000".parse().unwrap()));
        assert!(found.contains(&"10.0.0.5:5000".parse().unwrap()));
    }

    #[tokio::test]
    async fn next_undialed_skips_excluded_addresses() {
        let known = KnownPeers::new();
        known.record("127.0.0.1:1".parse().unwrap()).await;
        let mut exclude = HashSet::new();
        exclude.insert("127.0.0.1:1".parse().unwrap());
        assert_eq!(known.next_undialed(&exclude).await, None);
    }

    #[tokio::test]
    async fn mgmt_peers_packet_round_trips_through_wire_encoding() {
        let peers = vec![PeerAddr { ip: "10.0.0.9".parse().unwrap(), port: 4111 }];
        let packet = mgmt_peers_packet(&peers);
        let encoded = packet.encode();
        let decoded = Packet::parse(&encoded).unwrap();
        assert_eq!(decoded.header.packet_type, PacketType::Mgmt);
        assert_eq!(decode_mgmt_peers(&decoded.payload).unwrap(), peers);
    }
}
