use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node identifiers are opaque strings; byte order breaks LWW ties.
pub type NodeId = String;

/// A replicated register write: `[value, timestamp, origin]` on the wire.
///
/// The timestamp is wall-clock seconds with fractional part, captured at the
/// originating write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register(pub Value, pub f64, pub NodeId);

impl Register {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn stamp(&self) -> WriteStamp<'_> {
        WriteStamp {
            ts: self.1,
            origin: &self.2,
        }
    }
}

/// A deletion marker: `[timestamp, origin]` on the wire. Retained so stale
/// writes cannot resurrect a deleted key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone(pub f64, pub NodeId);

impl Tombstone {
    pub fn stamp(&self) -> WriteStamp<'_> {
        WriteStamp {
            ts: self.0,
            origin: &self.1,
        }
    }
}

/// The `(timestamp, origin)` pair that totally orders concurrent writes.
///
/// Ordered by timestamp first (`f64::total_cmp`; stamps come from the
/// process clock and are never NaN), then by origin id bytes.
#[derive(Debug, Clone, Copy)]
pub struct WriteStamp<'a> {
    pub ts: f64,
    pub origin: &'a str,
}

impl PartialEq for WriteStamp<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WriteStamp<'_> {}

impl PartialOrd for WriteStamp<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriteStamp<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .total_cmp(&other.ts)
            .then_with(|| self.origin.cmp(other.origin))
    }
}

/// Full replica state exchanged during anti-entropy sync.
///
/// `BTreeMap` keys keep the serialized form deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: BTreeMap<String, Register>,
    pub tombstones: BTreeMap<String, Tombstone>,
    pub vector_clock: BTreeMap<NodeId, u64>,
}

/// A transport endpoint as it appears in wire payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What kind of local state change a callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Delete,
    Merge,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Set => "set",
            ChangeKind::Delete => "delete",
            ChangeKind::Merge => "merge",
        };
        f.write_str(s)
    }
}

/// Callback surface injected at node construction.
///
/// Implementations must be cheap and non-blocking; callbacks fire after the
/// store and registry locks are released, never inside them.
pub trait MeshEvents: Send + Sync {
    fn on_state_change(&self, _key: &str, _value: Option<&Value>, _change: ChangeKind) {}
    fn on_peer_discovered(&self, _node_id: &str, _addr: SocketAddr) {}
    fn on_peer_failed(&self, _node_id: &str) {}
}

/// Default no-op event sink.
pub struct NoEvents;

impl MeshEvents for NoEvents {}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn wall_clock_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
