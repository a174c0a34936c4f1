//! AllNet wire packet: header layout, packet IDs, and the `MGMT_PEERS`
//! management message used by the peer listener (§4.E) and IP gateway
//! (§4.H) to advertise peers.
//!
//! Layout is taken from the original `lib/packet.h`/`lib/mgmt.h` family
//! (referenced throughout `original_source/src/listen.c`, not itself
//! excerpted in the retrieval pack): a fixed 24-byte header, optionally
//! extended by transport fields gated by a bitflag byte.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha512};

use crate::error::{CoreError, Result};

/// Number of bytes in a packet ID (§3: "Packet ID. A 16-byte value.").
pub const PACKET_ID_SIZE: usize = 16;

/// Maximum overlay packet size, matching `MAX_PACKET` in §4.A.
pub const MAX_PACKET: usize = 16 * 1024;

/// Fixed portion of the header: version, type, hop_count, max_hops,
/// source_nbits, destination_nbits, sig_algo, transport, source(8), dest(8).
pub const FIXED_HEADER_SIZE: usize = 8 + 8 + 8;

/// Transport flag bit: an explicit 16-byte message/packet ID follows the
/// fixed header.
pub const TRANSPORT_ID: u8 = 0x01;
/// Transport flag bit: an 8-byte (u64 millis) expiration follows the ID, if
/// present, else immediately follows the fixed header.
pub const TRANSPORT_EXPIRATION: u8 = 0x02;

pub const ALLNET_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    DataAck = 2,
    DataReq = 3,
    KeyXchg = 4,
    Clear = 5,
    Mgmt = 6,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Data,
            2 => Self::DataAck,
            3 => Self::DataReq,
            4 => Self::KeyXchg,
            5 => Self::Clear,
            6 => Self::Mgmt,
            _ => return None,
        })
    }
}

/// A parsed AllNet header. `nbits` fields count the meaningful leading bits
/// of the corresponding 8-byte address; the rest is padding.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub packet_type: PacketType,
    pub hop_count: u8,
    pub max_hops: u8,
    pub source_nbits: u8,
    pub destination_nbits: u8,
    pub sig_algo: u8,
    pub transport: u8,
    pub source: [u8; 8],
    pub destination: [u8; 8],
    pub message_id: Option<[u8; PACKET_ID_SIZE]>,
    pub expiration_ms: Option<u64>,
}

impl Header {
    pub fn has_id(&self) -> bool {
        self.transport & TRANSPORT_ID != 0
    }

    pub fn has_expiration(&self) -> bool {
        self.transport & TRANSPORT_EXPIRATION != 0
    }

    /// Size in bytes of this header as it would be written (`ALLNET_SIZE`).
    pub fn encoded_len(&self) -> usize {
        let mut n = FIXED_HEADER_SIZE;
        if self.has_id() {
            n += PACKET_ID_SIZE;
        }
        if self.has_expiration() {
            n += 8;
        }
        n
    }

    /// Parse a header from the front of `buf`. Returns the header and the
    /// byte offset of the payload that follows it.
    ///
    /// Drops (returns `Err`) on a packet too short to hold a fixed header,
    /// a bad version, or `hop_count >= max_hops`, per §4.F step 1.
    pub fn parse(buf: &[u8]) -> Result<(Header, usize)> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(CoreError::Parse(format!(
                "packet too short: {} < {FIXED_HEADER_SIZE}",
                buf.len()
            )));
        }
        let version = buf[0];
        if version != ALLNET_VERSION {
            return Err(CoreError::Parse(format!("unsupported version {version}")));
        }
        let packet_type = PacketType::from_u8(buf[1])
            .ok_or_else(|| CoreError::Parse(format!("unknown packet type {}", buf[1])))?;
        let hop_count = buf[2];
        let max_hops = buf[3];
        if hop_count >= max_hops {
            return Err(CoreError::Parse(format!(
                "hop_count {hop_count} >= max_hops {max_hops}"
            )));
        }
        let source_nbits = buf[4];
        let destination_nbits = buf[5];
        let sig_algo = buf[6];
        let transport = buf[7];
        let mut source = [0u8; 8];
        source.copy_from_slice(&buf[8..16]);
        let mut destination = [0u8; 8];
        destination.copy_from_slice(&buf[16..24]);

        let mut offset = FIXED_HEADER_SIZE;
        let message_id = if transport & TRANSPORT_ID != 0 {
            if buf.len() < offset + PACKET_ID_SIZE {
                return Err(CoreError::Parse("truncated message id".into()));
            }
            let mut id = [0u8; PACKET_ID_SIZE];
            id.copy_from_slice(&buf[offset..offset + PACKET_ID_SIZE]);
            offset += PACKET_ID_SIZE;
            Some(id)
        } else {
            None
        };
        let expiration_ms = if transport & TRANSPORT_EXPIRATION != 0 {
            if buf.len() < offset + 8 {
                return Err(CoreError::Parse("truncated expiration".into()));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[offset..offset + 8]);
            offset += 8;
            Some(u64::from_be_bytes(raw))
        } else {
            None
        };

        Ok((
            Header {
                version,
                packet_type,
                hop_count,
                max_hops,
                source_nbits,
                destination_nbits,
                sig_algo,
                transport,
                source,
                destination,
                message_id,
                expiration_ms,
            },
            offset,
        ))
    }

    pub fn write_into(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.packet_type as u8);
        out.push(self.hop_count);
        out.push(self.max_hops);
        out.push(self.source_nbits);
        out.push(self.destination_nbits);
        out.push(self.sig_algo);
        out.push(self.transport);
        out.extend_from_slice(&self.source);
        out.extend_from_slice(&self.destination);
        if let Some(id) = self.message_id {
            out.extend_from_slice(&id);
        }
        if let Some(exp) = self.expiration_ms {
            out.extend_from_slice(&exp.to_be_bytes());
        }
    }
}

/// A parsed packet: header plus payload bytes following it.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Packet> {
        let (header, offset) = Header::parse(buf)?;
        Ok(Packet { header, payload: buf[offset..].to_vec() })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.encoded_len() + self.payload.len());
        self.header.write_into(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Extract or compute this packet's ID (§3, §4.F step 2).
    ///
    /// When the transport carries an explicit ID, that is authoritative.
    /// Otherwise it is derived from the payload: for `DataAck` packets the
    /// ID is the first 16 bytes of SHA-512 over the whole ack payload; for
    /// every other type it is the first 16 bytes of SHA-512 over the first
    /// 16 bytes of the payload (the packet's random nonce prefix).
    pub fn packet_id(&self) -> [u8; PACKET_ID_SIZE] {
        if let Some(id) = self.header.message_id {
            return id;
        }
        match self.header.packet_type {
            PacketType::DataAck => sha512_prefix(&self.payload),
            _ => {
                let nonce_len = self.payload.len().min(16);
                sha512_prefix(&self.payload[..nonce_len])
            }
        }
    }
}

fn sha512_prefix(data: &[u8]) -> [u8; PACKET_ID_SIZE] {
    let digest = Sha512::digest(data);
    let mut id = [0u8; PACKET_ID_SIZE];
    id.copy_from_slice(&digest[..PACKET_ID_SIZE]);
    id
}

/// `ALLNET_MGMT_PEERS` payload type, carried in the payload of a `Mgmt`
/// packet advertising the sender's other connected peers (§4.E, §4.H).
pub const MGMT_TYPE_PEERS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddr {
    fn encode(&self, out: &mut Vec<u8>) {
        match self.ip {
            IpAddr::V4(v4) => {
                out.push(4);
                out.extend_from_slice(&[0u8; 12]);
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.push(6);
                out.extend_from_slice(&v6.octets());
            }
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&[0u8; 2]); // pad
    }

    fn decode(buf: &[u8]) -> Result<PeerAddr> {
        if buf.len() < 20 {
            return Err(CoreError::Parse("truncated peer address record".into()));
        }
        let version = buf[0];
        let ip = match version {
            4 => {
                let mut oct = [0u8; 4];
                oct.copy_from_slice(&buf[13..17]);
                IpAddr::V4(Ipv4Addr::from(oct))
            }
            6 => {
                let mut oct = [0u8; 16];
                oct.copy_from_slice(&buf[1..17]);
                IpAddr::V6(Ipv6Addr::from(oct))
            }
            other => return Err(CoreError::Parse(format!("bad ip version {other}"))),
        };
        let port = u16::from_be_bytes([buf[17], buf[18]]);
        Ok(PeerAddr { ip, port })
    }

    /// Bytes consumed by one record.
    const RECORD_SIZE: usize = 20;
}

/// Build the payload of an `ALLNET_MGMT_PEERS` message listing up to 255
/// peer addresses, matching `listen.c`'s `send_peer_message`.
pub fn encode_mgmt_peers(peers: &[PeerAddr]) -> Vec<u8> {
    let n = peers.len().min(255);
    let mut out = Vec::with_capacity(2 + n * PeerAddr::RECORD_SIZE);
    out.push(MGMT_TYPE_PEERS);
    out.push(n as u8);
    for p in &peers[..n] {
        p.encode(&mut out);
    }
    out
}

pub fn decode_mgmt_peers(payload: &[u8]) -> Result<Vec<PeerAddr>> {
    if payload.len() < 2 {
        return Err(CoreError::Parse("mgmt payload too short".into()));
    }
    if payload[0] != MGMT_TYPE_PEERS {
        return Err(CoreError::Parse(format!("not a peers message: {}", payload[0])));
    }
    let n = payload[1] as usize;
    let mut out = Vec::with_capacity(n);
    let mut offset = 2;
    for _ in 0..n {
        let rec = payload
            .get(offset..offset + PeerAddr::RECORD_SIZE)
            .ok_or_else(|| CoreError::Parse("truncated peers list".into()))?;
        out.push(PeerAddr::decode(rec)?);
        offset += PeerAddr::RECORD_SIZE;
    }
    Ok(out)
}

/// Count the number of leading bits that `a` (with `abits` meaningful bits)
/// shares with `b` (with `bbits` meaningful bits), per `matching_bits` in
/// `listen.c`, used by top-k destination lookup (§4.E) and MGMT narrowing
/// (§4.F step 5).
pub fn matching_bits(a: &[u8], abits: u8, b: &[u8], bbits: u8) -> u32 {
    let max_bits = (abits as u32).min(bbits as u32).min((a.len().min(b.len()) as u32) * 8);
    let mut count = 0u32;
    for bit in 0..max_bits {
        let byte = (bit / 8) as usize;
        let shift = 7 - (bit % 8);
        let abit = (a[byte] >> shift) & 1;
        let bbit = (b[byte] >> shift) & 1;
        if abit != bbit {
            break;
        }
        count += 1;
    }
    count
}
