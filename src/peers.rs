use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::types::{MeshEvents, NodeId};

/// Everything the node knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub state_version: u64,
    pub alive: bool,
    pub last_sync: Option<Instant>,
}

#[derive(Default)]
struct RegistryState {
    peers: BTreeMap<NodeId, PeerRecord>,
    bootstrap: Vec<SocketAddr>,
}

/// Address book and liveness tracker for the mesh.
///
/// Peers are created on first contact and never deleted; they only move
/// between alive and dead. Dead peers keep receiving heartbeats (the node
/// handles that), which is what heals a partition.
pub struct PeerRegistry {
    self_id: NodeId,
    peer_timeout: Duration,
    events: Arc<dyn MeshEvents>,
    state: Mutex<RegistryState>,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, peer_timeout: Duration, events: Arc<dyn MeshEvents>) -> Self {
        Self {
            self_id,
            peer_timeout,
            events,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry mutex poisoned")
    }

    /// Remember a seed address to send discovery probes to. No node id is
    /// known yet; the peer record appears once the address answers.
    pub fn add_bootstrap(&self, addr: SocketAddr) {
        let mut state = self.lock();
        if !state.bootstrap.contains(&addr) {
            info!(%addr, "added bootstrap address");
            state.bootstrap.push(addr);
        }
    }

    pub fn bootstrap_addresses(&self) -> Vec<SocketAddr> {
        self.lock().bootstrap.clone()
    }

    /// Record evidence that a peer is reachable at `addr`.
    ///
    /// Fires `on_peer_discovered` for a first sighting and again whenever a
    /// dead peer comes back.
    pub fn observe(&self, node_id: &str, addr: SocketAddr, state_version: u64) {
        if node_id == self.self_id {
            return;
        }

        let discovered = {
            let mut state = self.lock();
            match state.peers.get_mut(node_id) {
                Some(peer) => {
                    let revived = !peer.alive;
                    peer.addr = addr;
                    peer.last_seen = Instant::now();
                    peer.alive = true;
                    if state_version > peer.state_version {
                        peer.state_version = state_version;
                    }
                    if revived {
                        info!(node_id, %addr, "peer is back");
                    }
                    revived
                }
                None => {
                    info!(node_id, %addr, "discovered new peer");
                    state.peers.insert(
                        node_id.to_string(),
                        PeerRecord {
                            node_id: node_id.to_string(),
                            addr,
                            last_seen: Instant::now(),
                            state_version,
                            alive: true,
                            last_sync: None,
                        },
                    );
                    true
                }
            }
        };

        if discovered {
            self.events.on_peer_discovered(node_id, addr);
        }
    }

    /// Note a completed state exchange with a peer.
    pub fn mark_synced(&self, node_id: &str) {
        let mut state = self.lock();
        if let Some(peer) = state.peers.get_mut(node_id) {
            peer.last_sync = Some(Instant::now());
        }
    }

    pub fn peer(&self, node_id: &str) -> Option<PeerRecord> {
        self.lock().peers.get(node_id).cloned()
    }

    pub fn peer_by_address(&self, addr: SocketAddr) -> Option<PeerRecord> {
        self.lock().peers.values().find(|p| p.addr == addr).cloned()
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.lock().peers.values().cloned().collect()
    }

    pub fn alive_peers(&self) -> Vec<PeerRecord> {
        self.lock()
            .peers
            .values()
            .filter(|p| p.alive)
            .cloned()
            .collect()
    }

    /// `(alive, total)` counts for the status snapshot.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        let alive = state.peers.values().filter(|p| p.alive).count();
        (alive, state.peers.len())
    }

    /// Flip peers that have been silent for longer than the timeout to dead.
    /// Driven by the node's liveness ticker.
    pub fn check_liveness(&self) {
        let failed = {
            let mut state = self.lock();
            let now = Instant::now();
            let mut failed = Vec::new();
            for peer in state.peers.values_mut() {
                if peer.alive && now.duration_since(peer.last_seen) > self.peer_timeout {
                    peer.alive = false;
                    warn!(node_id = %peer.node_id, "peer timed out, marking dead");
                    failed.push(peer.node_id.clone());
                }
            }
            failed
        };

        for node_id in failed {
            self.events.on_peer_failed(&node_id);
        }
    }
}
