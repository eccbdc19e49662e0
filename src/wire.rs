use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, PeerAddr, Snapshot};

/// Wire protocol version carried in every header.
pub const WIRE_VERSION: u8 = 1;

/// Fixed header: `[version:u8][type:u8][seq:u32 BE][checksum:u32 BE]`.
pub const HEADER_LEN: usize = 10;

/// Largest payload that fits a single UDP datagram alongside the header.
pub const MAX_PAYLOAD: usize = 65507 - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    SyncRequest = 2,
    SyncResponse = 3,
    Heartbeat = 4,
    Discovery = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => PacketType::Data,
            1 => PacketType::Ack,
            2 => PacketType::SyncRequest,
            3 => PacketType::SyncResponse,
            4 => PacketType::Heartbeat,
            5 => PacketType::Discovery,
            other => bail!("unknown packet type {other}"),
        })
    }
}

/// A framed datagram: fixed header plus a UTF-8 JSON payload.
///
/// The checksum is the first four bytes of an MD5 digest over
/// `version || type || seq || payload` — an integrity check against
/// corruption, not an authenticity measure.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            seq,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            bail!(
                "payload of {} bytes exceeds datagram capacity ({MAX_PAYLOAD})",
                self.payload.len()
            );
        }
        let checksum = checksum(WIRE_VERSION, self.packet_type as u8, self.seq, &self.payload);
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(WIRE_VERSION);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            bail!("datagram of {} bytes is shorter than the header", data.len());
        }
        let version = data[0];
        if version != WIRE_VERSION {
            bail!("unsupported wire version {version}");
        }
        let packet_type = PacketType::try_from(data[1])?;
        let seq = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let claimed = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        let payload = &data[HEADER_LEN..];
        if checksum(version, data[1], seq, payload) != claimed {
            bail!("checksum mismatch on {packet_type:?} seq {seq}");
        }
        Ok(Self {
            packet_type,
            seq,
            payload: payload.to_vec(),
        })
    }
}

fn checksum(version: u8, packet_type: u8, seq: u32, payload: &[u8]) -> u32 {
    let mut covered = Vec::with_capacity(6 + payload.len());
    covered.push(version);
    covered.push(packet_type);
    covered.extend_from_slice(&seq.to_be_bytes());
    covered.extend_from_slice(payload);
    let digest = md5::compute(&covered);
    u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}

// Payload schemas, one per packet type. `Data` payloads are application
// defined (`{from, ...}`) and pass through undecoded.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMsg {
    pub ack_seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub node_id: NodeId,
    pub address: PeerAddr,
    pub state_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
    pub node_id: NodeId,
    pub address: PeerAddr,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMsg {
    pub node_id: NodeId,
    pub address: PeerAddr,
    pub known_peers: Vec<KnownPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestMsg {
    pub node_id: NodeId,
    pub state_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponseMsg {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}
