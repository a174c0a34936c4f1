//! The central router (§4.F): reads `(pipe, packet, priority)` from every
//! attached module, deduplicates, rate-limits, and fans out to the right
//! subset of pipes.
//!
//! Grounded on the teacher's `tcp::handler::TcpHandler::run` accept-and-
//! dispatch loop shape, generalized from "accept connections, pick one
//! backend" to "read frames from N pipes, pick a subset of outbound pipes",
//! with duplicate suppression and rate limiting layered in from
//! [`crate::bloom`]/[`crate::rate`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bloom::PidCache;
use crate::metrics::ForwarderMetrics;
use crate::packet::{Packet, PacketType};
use crate::pipe::framing::{self, Priority, PRIORITY_RESERVED};
use crate::pipe::multiplexer::{FdId, MuxOutcome, Multiplexer, Wait};
use crate::rate::{SourceKey, SourceRateTracker};

/// Origin class for an attached pipe (§4.F "each pipe is labelled with an
/// origin class").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeLabel {
    LocalGateway,
    Cache,
    IpGateway,
    Trace,
    Wireless(u8),
}

impl PipeLabel {
    const LOCAL_GATEWAY_FD: FdId = 0;
    const CACHE_FD: FdId = 1;
    const IP_GATEWAY_FD: FdId = 2;
    const TRACE_FD: FdId = 3;
    const WIRELESS_BASE_FD: FdId = 100;

    pub fn fd_id(self) -> FdId {
        match self {
            PipeLabel::LocalGateway => Self::LOCAL_GATEWAY_FD,
            PipeLabel::Cache => Self::CACHE_FD,
            PipeLabel::IpGateway => Self::IP_GATEWAY_FD,
            PipeLabel::Trace => Self::TRACE_FD,
            PipeLabel::Wireless(i) => Self::WIRELESS_BASE_FD + i as FdId,
        }
    }

    pub fn from_fd_id(fd: FdId) -> Option<PipeLabel> {
        Some(match fd {
            Self::LOCAL_GATEWAY_FD => PipeLabel::LocalGateway,
            Self::CACHE_FD => PipeLabel::Cache,
            Self::IP_GATEWAY_FD => PipeLabel::IpGateway,
            Self::TRACE_FD => PipeLabel::Trace,
            fd if fd >= Self::WIRELESS_BASE_FD => PipeLabel::Wireless((fd - Self::WIRELESS_BASE_FD) as u8),
            _ => return None,
        })
    }
}

type Writer = Box<dyn AsyncWrite + Unpin + Send>;

pub struct Forwarder {
    mux: Multiplexer,
    writers: HashMap<FdId, Writer>,
    pid_cache: PidCache,
    rate_tracker: SourceRateTracker,
    metrics: Arc<ForwarderMetrics>,
}

impl Forwarder {
    pub fn new(pid_cache: PidCache, rate_tracker: SourceRateTracker) -> Self {
        Self {
            mux: Multiplexer::new(),
            writers: HashMap::new(),
            pid_cache,
            rate_tracker,
            metrics: Arc::new(ForwarderMetrics::default()),
        }
    }

    /// Share this forwarder's counters with, e.g., a metrics-serving task.
    pub fn metrics(&self) -> Arc<ForwarderMetrics> {
        self.metrics.clone()
    }

    pub fn with_metrics(mut self, metrics: Arc<ForwarderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach a bidirectional module pipe under `label`, replacing any
    /// previous pipe with the same label.
    pub fn attach<R>(&mut self, label: PipeLabel, reader: R, writer: Writer)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let fd = label.fd_id();
        self.mux.add(fd, reader);
        self.writers.insert(fd, writer);
    }

    pub fn detach(&mut self, label: PipeLabel) {
        let fd = label.fd_id();
        self.mux.remove(fd);
        self.writers.remove(&fd);
    }

    /// Run the routing loop until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                outcome = self.mux.recv_any(Wait::Millis(1000)) => {
                    match outcome {
                        MuxOutcome::Frame { id, payload, priority } => {
                            if let Some(label) = PipeLabel::from_fd_id(id) {
                                self.handle_frame(label, payload, priority).await;
                            }
                        }
                        MuxOutcome::ClosedFd(id) => {
                            self.writers.remove(&id);
                            debug!(fd = id, "module pipe closed");
                        }
                        MuxOutcome::Timeout => {}
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

    async fn handle_frame(&mut self, origin: PipeLabel, payload: Vec<u8>, priority: Priority) {
        // Step 1: parse and validate.
        let packet = match Packet::parse(&payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(?origin, error = %e, "dropping unparseable packet");
                self.metrics.record_dropped_malformed();
                return;
            }
        };

        // Step 2/3: packet id and duplicate suppression.
        let id = packet.packet_id();
        let is_ack = packet.header.packet_type == PacketType::DataAck;
        if self.pid_cache.is_duplicate(&id, is_ack) {
            debug!(?origin, "dropping duplicate packet");
            self.metrics.record_dropped_duplicate();
            return;
        }
        self.pid_cache.insert(&id, is_ack);

        // Step 4: rate limit.
        let src = SourceKey { bytes: packet.header.source, nbits: packet.header.source_nbits };
        let observed = self.rate_tracker.observe(src, payload.len() as u64);
        let effective_priority = priority.min(observed);
        if effective_priority == PRIORITY_RESERVED {
            debug!(?origin, "dropping packet: rate limited to zero priority");
            self.metrics.record_dropped_rate_limited();
            return;
        }

        // Step 5: choose outbound set.
        let mut targets: Vec<PipeLabel> = vec![PipeLabel::Cache, PipeLabel::LocalGateway];
        let fan_out_no_hairpin = self.writers.keys().copied().filter_map(PipeLabel::from_fd_id).filter(|label| {
            matches!(label, PipeLabel::IpGateway | PipeLabel::Wireless(_)) && *label != origin
        });
        targets.extend(fan_out_no_hairpin);
        targets.retain(|t| *t != origin || matches!(t, PipeLabel::Cache | PipeLabel::LocalGateway));

        // Step 6: increment hop count on the forwarded copy only.
        let mut forwarded = packet.clone_with_incremented_hop();

        // Step 7: send on each chosen pipe; a blocked pipe only drops its
        // own delivery (backpressure policy, §4.F).
        let encoded = forwarded.encode();
        let mut delivered = false;
        for target in targets {
            let fd = target.fd_id();
            if let Some(writer) = self.writers.get_mut(&fd) {
                match framing::send(writer, &encoded, effective_priority).await {
                    Ok(()) => delivered = true,
                    Err(e) => warn!(?target, error = %e, "dropping on blocked/broken pipe"),
                }
            }
        }
        if delivered {
            self.metrics.record_forwarded();
        }
        let _ = &mut forwarded; // silence unused-mut if targets is empty
    }
}

impl Packet {
    pub fn clone_with_incremented_hop(&self) -> Packet {
        let mut copy = self.clone();
        copy.header.hop_count = copy.header.hop_count.saturating_add(1);
        copy
    }
}
