use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, warn};

use crate::wire::{AckMsg, Packet, PacketType};

const RETRY_SCAN_INTERVAL: Duration = Duration::from_millis(100);
const INITIAL_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_RETRIES: u32 = 5;

/// Soft cap on remembered sequence numbers per peer. On overflow the oldest
/// half is forgotten; a forgotten duplicate re-applies, which is harmless
/// because merges are idempotent.
const DEDUP_LIMIT: usize = 10_000;

/// Outbound drop filter for tests and simulators: return `true` to drop the
/// datagram before it reaches the socket.
pub type PacketFilter = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Invoked when a reliable send exhausts its retries.
pub type DeliveryFailureHook = Arc<dyn Fn(u32, SocketAddr) + Send + Sync>;

/// A packet received, checksum-verified, deduplicated, and acknowledged.
#[derive(Debug)]
pub struct Inbound {
    pub packet_type: PacketType,
    pub payload: serde_json::Value,
    pub from: SocketAddr,
}

struct PendingSend {
    data: Vec<u8>,
    dest: SocketAddr,
    attempts: u32,
    deadline: Instant,
}

#[derive(Default)]
struct Tracking {
    pending: HashMap<u32, PendingSend>,
    received: HashMap<SocketAddr, BTreeSet<u32>>,
}

/// At-least-once, duplicate-suppressed delivery of typed messages over a
/// best-effort datagram socket.
///
/// Every non-ACK packet is acknowledged by the receiver; unacknowledged sends
/// are retransmitted with exponential backoff until acked or abandoned. The
/// endpoint stays connectionless: there is no handshake and no per-peer
/// session state beyond the dedup window.
pub struct ReliableUdp {
    socket: Arc<UdpSocket>,
    next_seq: AtomicU32,
    tracking: Mutex<Tracking>,
    filter: Mutex<Option<PacketFilter>>,
    on_delivery_failed: Mutex<Option<DeliveryFailureHook>>,
}

impl ReliableUdp {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            next_seq: AtomicU32::new(0),
            tracking: Mutex::new(Tracking::default()),
            filter: Mutex::new(None),
            on_delivery_failed: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("socket has no local address")
    }

    /// Install or clear the outbound drop filter.
    pub fn set_packet_filter(&self, filter: Option<PacketFilter>) {
        *self.filter.lock().expect("filter mutex poisoned") = filter;
    }

    /// Install the hook fired when a reliable send is abandoned.
    pub fn set_delivery_failure_hook(&self, hook: Option<DeliveryFailureHook>) {
        *self
            .on_delivery_failed
            .lock()
            .expect("hook mutex poisoned") = hook;
    }

    /// Number of sends still awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.track().pending.len()
    }

    /// Spawn the receive and retry workers. Returns the channel on which
    /// deduplicated inbound packets are delivered.
    pub fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<Inbound>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(256);

        let recv = tokio::spawn(self.clone().receive_loop(tx, shutdown.clone()));
        let retry = tokio::spawn(self.retry_loop(shutdown));

        (rx, vec![recv, retry])
    }

    /// Send a typed message with delivery tracking. Returns the sequence
    /// number assigned to the packet; delivery itself is asynchronous.
    pub async fn send_reliable(
        &self,
        dest: SocketAddr,
        packet_type: PacketType,
        payload: &impl Serialize,
    ) -> Result<u32> {
        let payload = serde_json::to_vec(payload).context("failed to encode payload")?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let data = Packet::new(packet_type, seq, payload).encode()?;

        {
            let mut track = self.track();
            track.pending.insert(
                seq,
                PendingSend {
                    data: data.clone(),
                    dest,
                    attempts: 0,
                    deadline: Instant::now() + INITIAL_TIMEOUT,
                },
            );
        }

        self.raw_send(&data, dest).await;
        Ok(seq)
    }

    /// Best-effort acknowledgement; never itself acknowledged or retried.
    /// The ACK reuses the acknowledged sequence number as its own.
    pub async fn send_ack(&self, dest: SocketAddr, seq: u32) -> Result<()> {
        let payload = serde_json::to_vec(&AckMsg { ack_seq: seq })?;
        let data = Packet::new(PacketType::Ack, seq, payload).encode()?;
        self.raw_send(&data, dest).await;
        Ok(())
    }

    fn track(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().expect("tracking mutex poisoned")
    }

    /// Single transmission attempt, subject to the drop filter. Send errors
    /// are logged and swallowed; the retry scanner provides the recovery.
    async fn raw_send(&self, data: &[u8], dest: SocketAddr) {
        let dropped = {
            let filter = self.filter.lock().expect("filter mutex poisoned");
            filter.as_ref().is_some_and(|f| f(&dest))
        };
        if dropped {
            debug!(%dest, "packet filter dropped outbound datagram");
            return;
        }
        if let Err(err) = self.socket.send_to(data, dest).await {
            warn!(%dest, %err, "datagram send failed");
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        inbound: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf[..len], from, &inbound).await;
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        error!(%err, "datagram receive failed");
                    }
                },
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr, inbound: &mpsc::Sender<Inbound>) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%from, %err, "dropping undecodable datagram");
                return;
            }
        };

        if packet.packet_type == PacketType::Ack {
            let ack: AckMsg = match serde_json::from_slice(&packet.payload) {
                Ok(ack) => ack,
                Err(err) => {
                    debug!(%from, %err, "dropping malformed ack payload");
                    return;
                }
            };
            if self.track().pending.remove(&ack.ack_seq).is_some() {
                debug!(%from, seq = ack.ack_seq, "delivery acknowledged");
            }
            return;
        }

        // Acknowledge before the duplicate check so a lost ACK is repaired
        // by the sender's retry.
        if let Err(err) = self.send_ack(from, packet.seq).await {
            debug!(%from, %err, "failed to send ack");
        }

        {
            let mut track = self.track();
            let seen = track.received.entry(from).or_default();
            if !seen.insert(packet.seq) {
                debug!(%from, seq = packet.seq, "suppressing duplicate packet");
                return;
            }
            if seen.len() > DEDUP_LIMIT {
                if let Some(&mid) = seen.iter().nth(seen.len() / 2) {
                    *seen = seen.split_off(&mid);
                }
            }
        }

        let payload: serde_json::Value = match serde_json::from_slice(&packet.payload) {
            Ok(value) => value,
            Err(err) => {
                debug!(%from, %err, "dropping packet with malformed json payload");
                return;
            }
        };

        if inbound
            .send(Inbound {
                packet_type: packet.packet_type,
                payload,
                from,
            })
            .await
            .is_err()
        {
            debug!("inbound channel closed, dropping packet");
        }
    }

    async fn retry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(RETRY_SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let mut resend = Vec::new();
            let mut abandoned = Vec::new();
            {
                let mut track = self.track();
                track.pending.retain(|&seq, send| {
                    if now < send.deadline {
                        return true;
                    }
                    if send.attempts >= MAX_RETRIES {
                        abandoned.push((seq, send.dest));
                        return false;
                    }
                    send.attempts += 1;
                    send.deadline = now + backoff(send.attempts);
                    resend.push((seq, send.data.clone(), send.dest));
                    true
                });
            }

            for (seq, data, dest) in resend {
                debug!(%dest, seq, "retransmitting unacknowledged packet");
                self.raw_send(&data, dest).await;
            }

            if abandoned.is_empty() {
                continue;
            }
            let hook = self
                .on_delivery_failed
                .lock()
                .expect("hook mutex poisoned")
                .clone();
            for (seq, dest) in abandoned {
                warn!(%dest, seq, "giving up on unacknowledged packet");
                if let Some(hook) = &hook {
                    hook(seq, dest);
                }
            }
        }
    }
}

pub(crate) fn backoff(attempts: u32) -> Duration {
    let timeout = INITIAL_TIMEOUT * 2u32.saturating_pow(attempts);
    timeout.min(MAX_TIMEOUT)
}
