use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::peers::PeerRegistry;
use crate::store::CrdtStore;
use crate::transport::{Inbound, ReliableUdp};
use crate::types::{MeshEvents, NodeId, PeerAddr};
use crate::wire::{
    DiscoveryMsg, HeartbeatMsg, KnownPeer, PacketType, SyncRequestMsg, SyncResponseMsg,
};

/// Tunables for one mesh node. The defaults match the protocol's intended
/// cadence; tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub port: u16,
    /// Host advertised in heartbeat and discovery payloads.
    pub advertise_host: String,
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub discovery_interval: Duration,
    pub peer_timeout: Duration,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, port: u16) -> Self {
        let heartbeat_interval = Duration::from_secs(5);
        Self {
            node_id: node_id.into(),
            port,
            advertise_host: "127.0.0.1".to_string(),
            sync_interval: Duration::from_secs(10),
            heartbeat_interval,
            discovery_interval: Duration::from_secs(30),
            peer_timeout: 3 * heartbeat_interval,
        }
    }
}

/// Observability snapshot returned by [`MeshNode::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub port: u16,
    pub state_version: u64,
    pub data_keys: usize,
    pub peers: PeerCounts,
    pub pending_acks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerCounts {
    pub alive: usize,
    pub total: usize,
}

/// A replica in the mesh: accepts local reads and writes, reconciles state
/// with peers on a timer, detects failed peers, and gossips membership.
///
/// Wiring: local mutations go to the CRDT store; periodic ticks push sync
/// requests, heartbeats, and discovery probes through the reliable endpoint;
/// inbound packets are dispatched by type on a single task.
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    store: CrdtStore,
    peers: PeerRegistry,
    endpoint: OnceLock<Arc<ReliableUdp>>,
    bound_port: OnceLock<u16>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    pub fn new(config: NodeConfig, events: Arc<dyn MeshEvents>) -> Self {
        let store = CrdtStore::new(config.node_id.clone(), events.clone());
        let peers = PeerRegistry::new(config.node_id.clone(), config.peer_timeout, events);
        let (shutdown, _) = watch::channel(false);

        info!(node_id = %config.node_id, port = config.port, "mesh node created");

        Self {
            inner: Arc::new(NodeInner {
                config,
                store,
                peers,
                endpoint: OnceLock::new(),
                bound_port: OnceLock::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// The CRDT store, for direct inspection and tombstone maintenance.
    pub fn store(&self) -> &CrdtStore {
        &self.inner.store
    }

    /// The reliable endpoint, once started. Exposed so simulators can attach
    /// packet filters.
    pub fn transport(&self) -> Option<Arc<ReliableUdp>> {
        self.inner.endpoint.get().cloned()
    }

    /// Address the node's socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .endpoint
            .get()
            .and_then(|ep| ep.local_addr().ok())
    }

    /// Seed the registry with a peer address to probe during discovery.
    pub fn add_bootstrap_peer(&self, host: &str, port: u16) -> Result<()> {
        let addr = resolve(host, port)
            .with_context(|| format!("cannot resolve bootstrap peer {host}:{port}"))?;
        self.inner.peers.add_bootstrap(addr);
        Ok(())
    }

    /// Bind the socket and spawn the background workers. A bind failure is
    /// fatal; everything after that recovers via retries and timers.
    pub async fn start(&self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.inner.config.port))
            .await
            .with_context(|| format!("failed to bind udp port {}", self.inner.config.port))?;
        let endpoint = Arc::new(ReliableUdp::new(socket));
        let port = endpoint.local_addr()?.port();

        if self.inner.endpoint.set(endpoint.clone()).is_err() {
            bail!("node already started");
        }
        let _ = self.inner.bound_port.set(port);

        let (inbound, mut tasks) = endpoint.clone().start(self.inner.shutdown.subscribe());

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(inner.dispatch_loop(inbound)));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(inner.sync_loop()));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(inner.heartbeat_loop()));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(inner.discovery_loop()));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(inner.liveness_loop()));

        self.inner
            .tasks
            .lock()
            .expect("task list mutex poisoned")
            .extend(tasks);

        info!(node_id = %self.inner.config.node_id, port, "mesh node started");
        Ok(())
    }

    /// Signal shutdown and wait for every worker to drain. Idempotent.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .expect("task list mutex poisoned"),
        );
        for task in tasks {
            let _ = task.await;
        }
        info!(node_id = %self.inner.config.node_id, "mesh node stopped");
    }

    pub fn set(&self, key: &str, value: Value) {
        self.inner.store.set(key, value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.store.get(key)
    }

    pub fn delete(&self, key: &str) {
        self.inner.store.delete(key);
    }

    pub fn list(&self) -> BTreeMap<String, Value> {
        self.inner.store.list()
    }

    pub fn status(&self) -> NodeStatus {
        let (alive, total) = self.inner.peers.counts();
        NodeStatus {
            node_id: self.inner.config.node_id.clone(),
            port: self.inner.bound_port(),
            state_version: self.inner.store.version(),
            data_keys: self.inner.store.key_count(),
            peers: PeerCounts { alive, total },
            pending_acks: self
                .inner
                .endpoint
                .get()
                .map_or(0, |ep| ep.pending_count()),
        }
    }
}

impl NodeInner {
    fn bound_port(&self) -> u16 {
        self.bound_port.get().copied().unwrap_or(self.config.port)
    }

    fn endpoint(&self) -> Option<&Arc<ReliableUdp>> {
        self.endpoint.get()
    }

    fn heartbeat(&self) -> HeartbeatMsg {
        HeartbeatMsg {
            node_id: self.config.node_id.clone(),
            address: PeerAddr::new(self.config.advertise_host.clone(), self.bound_port()),
            state_version: self.store.version(),
        }
    }

    fn known_peers(&self) -> Vec<KnownPeer> {
        self.peers
            .all_peers()
            .into_iter()
            .map(|peer| KnownPeer {
                node_id: peer.node_id,
                address: PeerAddr::from(peer.addr),
                alive: peer.alive,
            })
            .collect()
    }

    fn discovery(&self) -> DiscoveryMsg {
        DiscoveryMsg {
            node_id: self.config.node_id.clone(),
            address: PeerAddr::new(self.config.advertise_host.clone(), self.bound_port()),
            known_peers: self.known_peers(),
        }
    }

    async fn send(&self, dest: SocketAddr, packet_type: PacketType, payload: &impl Serialize) {
        let Some(endpoint) = self.endpoint() else {
            return;
        };
        if let Err(err) = endpoint.send_reliable(dest, packet_type, payload).await {
            warn!(%dest, ?packet_type, %err, "failed to send packet");
        }
    }

    async fn request_sync(&self, dest: SocketAddr) {
        let request = SyncRequestMsg {
            node_id: self.config.node_id.clone(),
            state_version: self.store.version(),
        };
        self.send(dest, PacketType::SyncRequest, &request).await;
    }

    // ── inbound dispatch ──────────────────────────────────────────────

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    self.dispatch(msg).await;
                }
            }
        }
    }

    async fn dispatch(&self, msg: Inbound) {
        match msg.packet_type {
            PacketType::Heartbeat => self.on_heartbeat(msg).await,
            PacketType::Discovery => self.on_discovery(msg).await,
            PacketType::SyncRequest => self.on_sync_request(msg).await,
            PacketType::SyncResponse => self.on_sync_response(msg),
            PacketType::Data => {
                debug!(from = %msg.from, "ignoring application data packet");
            }
            PacketType::Ack => {
                // ACKs are consumed by the endpoint; nothing reaches here.
                debug!(from = %msg.from, "stray ack in dispatch");
            }
        }
    }

    async fn on_heartbeat(&self, msg: Inbound) {
        let beat: HeartbeatMsg = match serde_json::from_value(msg.payload) {
            Ok(beat) => beat,
            Err(err) => {
                debug!(from = %msg.from, %err, "dropping malformed heartbeat");
                return;
            }
        };
        debug!(from = %beat.node_id, version = beat.state_version, "heartbeat");
        self.peers.observe(&beat.node_id, msg.from, beat.state_version);

        // A peer that is ahead of us has state we lack; pull it now rather
        // than waiting out the sync interval.
        if self.store.version() < beat.state_version {
            debug!(peer = %beat.node_id, "peer is ahead, requesting sync early");
            self.request_sync(msg.from).await;
        }
    }

    async fn on_discovery(&self, msg: Inbound) {
        let disco: DiscoveryMsg = match serde_json::from_value(msg.payload) {
            Ok(disco) => disco,
            Err(err) => {
                debug!(from = %msg.from, %err, "dropping malformed discovery");
                return;
            }
        };
        debug!(from = %disco.node_id, peers = disco.known_peers.len(), "discovery");

        let sender_was_alive = self
            .peers
            .peer(&disco.node_id)
            .is_some_and(|peer| peer.alive);
        self.peers.observe(&disco.node_id, msg.from, 0);

        let mut learned = !sender_was_alive;
        for known in &disco.known_peers {
            if known.node_id == self.config.node_id || self.peers.peer(&known.node_id).is_some() {
                continue;
            }
            match resolve(&known.address.host, known.address.port) {
                Ok(addr) => {
                    self.peers.observe(&known.node_id, addr, 0);
                    learned = true;
                }
                Err(err) => {
                    debug!(peer = %known.node_id, addr = %known.address, %err, "cannot resolve gossiped peer");
                }
            }
        }

        // Reply with our own peer list, but only when this probe told us
        // something new; answering every reply would have two nodes echoing
        // discovery at each other forever.
        if learned {
            let reply = self.discovery();
            self.send(msg.from, PacketType::Discovery, &reply).await;
        }
    }

    async fn on_sync_request(&self, msg: Inbound) {
        let request: SyncRequestMsg = match serde_json::from_value(msg.payload) {
            Ok(request) => request,
            Err(err) => {
                debug!(from = %msg.from, %err, "dropping malformed sync request");
                return;
            }
        };
        debug!(from = %request.node_id, "sync request");
        self.peers
            .observe(&request.node_id, msg.from, request.state_version);

        let response = SyncResponseMsg {
            node_id: self.config.node_id.clone(),
            snapshot: self.store.snapshot(),
        };
        self.send(msg.from, PacketType::SyncResponse, &response).await;
    }

    fn on_sync_response(&self, msg: Inbound) {
        let response: SyncResponseMsg = match serde_json::from_value(msg.payload) {
            Ok(response) => response,
            Err(err) => {
                debug!(from = %msg.from, %err, "discarding malformed sync response");
                return;
            }
        };
        self.peers.observe(&response.node_id, msg.from, 0);

        let changed = self.store.merge(&response.snapshot);
        if changed > 0 {
            info!(from = %response.node_id, keys = changed, "state updated from peer");
        }
        self.peers.mark_synced(&response.node_id);
    }

    // ── outbound timers ───────────────────────────────────────────────

    async fn sync_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.sync_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            for peer in self.peers.alive_peers() {
                debug!(peer = %peer.node_id, "requesting sync");
                self.request_sync(peer.addr).await;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            // Dead peers are included on purpose: a heartbeat landing on the
            // far side of a healed partition is what revives the link.
            let beat = self.heartbeat();
            for peer in self.peers.all_peers() {
                self.send(peer.addr, PacketType::Heartbeat, &beat).await;
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.discovery_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let probe = self.discovery();
            for addr in self.peers.bootstrap_addresses() {
                debug!(%addr, "sending discovery probe");
                self.send(addr, PacketType::Discovery, &probe).await;
            }
        }
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.peers.check_liveness();
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no addresses for {host}:{port}"))
}
