//! Reliable Messaging: sequence numbers, checksums, ACKs, duplicate
//! suppression and bounded retransmits over the unreliable datagram bus
//! (spec §4.5).
//!
//! The message-timeout scan is described under the Fault Detector in
//! spec §4.4, but spec §3's Ownership section gives `PendingMessage` to
//! Reliable Messaging; since no component holds two locks at once (spec
//! §5), the scan is implemented here, against the map it actually owns.

use crate::config::{MESSAGE_MAX_RETRIES, MESSAGE_RETRY_DEADLINE, MESSAGE_TIMEOUT_SCAN_INTERVAL};
use crate::error::FaultCounters;
use crate::group_view::GroupView;
use crate::transport::DatagramBus;
use crate::types::{unix_timestamp, PeerId, ReliableEnvelope, WireMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// spec §3's `PendingMessage`, plus the addressing needed to retransmit.
#[derive(Debug, Clone)]
struct Pending {
    envelope: ReliableEnvelope,
    targets: Option<Vec<SocketAddr>>,
    first_tx_time: Instant,
    retry_count: u8,
}

/// DeliveredSet TTL: 2x the full retry window.
fn delivered_ttl() -> Duration {
    MESSAGE_RETRY_DEADLINE * 2 * (MESSAGE_MAX_RETRIES as u32 + 1)
}

type UpstreamHandler = Box<dyn Fn(ReliableEnvelope, SocketAddr) + Send + Sync>;

/// Reliable delivery layered atop the datagram bus.
pub struct ReliableMessaging {
    node_id: PeerId,
    bus: Arc<DatagramBus>,
    group: Arc<GroupView>,
    counters: Arc<FaultCounters>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    delivered: Mutex<HashMap<Uuid, Instant>>,
    sequence: AtomicU64,
    upstream: Mutex<Option<UpstreamHandler>>,
}

impl ReliableMessaging {
    pub fn new(
        node_id: PeerId,
        bus: Arc<DatagramBus>,
        group: Arc<GroupView>,
        counters: Arc<FaultCounters>,
    ) -> Self {
        Self {
            node_id,
            bus,
            group,
            counters,
            pending: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            upstream: Mutex::new(None),
        }
    }

    /// Register the handler invoked for each newly-delivered message.
    pub fn set_upstream_handler<F>(&self, handler: F)
    where
        F: Fn(ReliableEnvelope, SocketAddr) + Send + Sync + 'static,
    {
        *self.upstream.lock() = Some(Box::new(handler));
    }

    /// Create, store, and broadcast a new reliable envelope.
    pub async fn reliable_send(
        &self,
        msg_type: &str,
        payload: serde_json::Value,
        targets: Option<Vec<PeerId>>,
    ) -> crate::error::Result<Uuid> {
        let msg_id = Uuid::new_v4();
        let timestamp = unix_timestamp();
        let checksum =
            ReliableEnvelope::compute_checksum(self.node_id, msg_type, &payload, timestamp);
        let sequence_num = self.sequence.fetch_add(1, Ordering::Relaxed);

        let envelope = ReliableEnvelope {
            msg_id,
            sender_id: self.node_id,
            msg_type: msg_type.to_string(),
            payload,
            timestamp,
            sequence_num,
            checksum,
        };

        let target_addrs = targets.as_ref().map(|ids| {
            ids.iter()
                .filter_map(|id| self.group.get(*id).map(|p| p.addr))
                .collect::<Vec<_>>()
        });

        self.pending.lock().insert(
            msg_id,
            Pending {
                envelope: envelope.clone(),
                targets: target_addrs,
                first_tx_time: Instant::now(),
                retry_count: 0,
            },
        );

        self.transmit(&envelope, targets.as_deref()).await?;
        Ok(msg_id)
    }

    async fn transmit(
        &self,
        envelope: &ReliableEnvelope,
        targets: Option<&[PeerId]>,
    ) -> crate::error::Result<()> {
        let msg = WireMessage::Reliable {
            message: envelope.clone(),
            target_nodes: targets.map(|t| t.to_vec()),
        };
        let bytes = msg.to_bytes()?;
        self.bus.broadcast(&bytes).await
    }

    /// Decode and process an inbound `RELIABLE_MSG` or `ACK` envelope.
    pub async fn handle_inbound(&self, msg: WireMessage, src: SocketAddr) {
        match msg {
            WireMessage::Reliable { message, .. } => self.handle_envelope(message, src).await,
            WireMessage::Ack { msg_id, .. } => self.handle_ack(msg_id),
            _ => {}
        }
    }

    async fn handle_envelope(&self, envelope: ReliableEnvelope, src: SocketAddr) {
        if envelope.sender_id == self.node_id {
            return;
        }

        if self.delivered.lock().contains_key(&envelope.msg_id) {
            self.send_ack(envelope.msg_id, src).await;
            return;
        }

        if !envelope.verify_checksum() {
            self.counters.record_byzantine();
            warn!(
                "reliable: checksum mismatch from {} for {}, dropping",
                envelope.sender_id, envelope.msg_id
            );
            return;
        }

        self.prune_delivered();
        self.delivered.lock().insert(envelope.msg_id, Instant::now());
        self.send_ack(envelope.msg_id, src).await;

        debug!("reliable: delivering {} from {}", envelope.msg_id, envelope.sender_id);
        if let Some(handler) = self.upstream.lock().as_ref() {
            handler(envelope, src);
        }
    }

    async fn send_ack(&self, msg_id: Uuid, src: SocketAddr) {
        let ack = WireMessage::Ack {
            msg_id,
            sender_id: self.node_id,
        };
        if let Ok(bytes) = ack.to_bytes() {
            let _ = self.bus.send_to(&bytes, src).await;
        }
    }

    fn handle_ack(&self, msg_id: Uuid) {
        if self.pending.lock().remove(&msg_id).is_some() {
            debug!("reliable: {msg_id} acknowledged");
        }
    }

    fn prune_delivered(&self) {
        let ttl = delivered_ttl();
        let now = Instant::now();
        self.delivered.lock().retain(|_, seen| now.duration_since(*seen) <= ttl);
    }

    /// Scan pending messages every `MESSAGE_TIMEOUT_SCAN_INTERVAL`,
    /// retransmitting or dropping as omissions once retries are exhausted.
    pub async fn run_timeout_loop(self: Arc<Self>, running: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(MESSAGE_TIMEOUT_SCAN_INTERVAL);
        loop {
            ticker.tick().await;
            if !running.load(Ordering::Relaxed) {
                break;
            }
            self.scan_timeouts().await;
        }
    }

    async fn scan_timeouts(&self) {
        let now = Instant::now();
        let due: Vec<Uuid> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.first_tx_time) > MESSAGE_RETRY_DEADLINE)
                .map(|(id, _)| *id)
                .collect()
        };

        for msg_id in due {
            let action = {
                let mut pending = self.pending.lock();
                pending.get_mut(&msg_id).map(|p| {
                    if p.retry_count < MESSAGE_MAX_RETRIES {
                        p.retry_count += 1;
                        p.first_tx_time = Instant::now();
                        (Some(p.envelope.clone()), None)
                    } else {
                        (None, Some(()))
                    }
                })
            };

            match action {
                Some((Some(envelope), _)) => {
                    debug!("reliable: retransmitting {msg_id}");
                    let _ = self.transmit(&envelope, None).await;
                }
                Some((None, Some(()))) => {
                    self.pending.lock().remove(&msg_id);
                    self.counters.record_omission();
                    warn!("reliable: {msg_id} exhausted retries, dropping as omission");
                }
                _ => {}
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl std::fmt::Debug for ReliableMessaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableMessaging")
            .field("node_id", &self.node_id)
            .field("pending", &self.pending_count())
            .field("delivered", &self.delivered_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultCounters;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn harness() -> (Arc<DatagramBus>, Arc<GroupView>, Arc<FaultCounters>) {
        let bus = Arc::new(DatagramBus::open_ephemeral().await.expect("bind loopback bus"));
        (bus, Arc::new(GroupView::new()), Arc::new(FaultCounters::new()))
    }

    #[tokio::test]
    async fn duplicate_envelope_delivers_once_and_acks_twice() {
        let (bus, group, counters) = harness().await;
        let rm = ReliableMessaging::new(PeerId(1), bus, group, counters);

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        rm.set_upstream_handler(move |_, _| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let payload = serde_json::json!({"text": "hi"});
        let ts = unix_timestamp();
        let checksum = ReliableEnvelope::compute_checksum(PeerId(2), "chat", &payload, ts);
        let envelope = ReliableEnvelope {
            msg_id: Uuid::new_v4(),
            sender_id: PeerId(2),
            msg_type: "chat".into(),
            payload,
            timestamp: ts,
            sequence_num: 0,
            checksum,
        };

        rm.handle_envelope(envelope.clone(), addr()).await;
        rm.handle_envelope(envelope, addr()).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupted_checksum_is_not_delivered() {
        let (bus, group, counters) = harness().await;
        let rm = ReliableMessaging::new(PeerId(1), bus, group, counters.clone());

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        rm.set_upstream_handler(move |_, _| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let payload = serde_json::json!({"text": "hi"});
        let ts = unix_timestamp();
        let mut envelope = ReliableEnvelope {
            msg_id: Uuid::new_v4(),
            sender_id: PeerId(2),
            msg_type: "chat".into(),
            payload,
            timestamp: ts,
            sequence_num: 0,
            checksum: "bogus".into(),
        };
        envelope.checksum = "bogus".into();

        rm.handle_envelope(envelope, addr()).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(counters.snapshot().byzantine, 1);
    }

    #[tokio::test]
    async fn ack_removes_pending() {
        let (bus, group, counters) = harness().await;
        let rm = ReliableMessaging::new(PeerId(1), bus, group, counters);
        let msg_id = rm
            .reliable_send("chat", serde_json::json!({"text": "hi"}), None)
            .await
            .unwrap();
        assert_eq!(rm.pending_count(), 1);
        rm.handle_ack(msg_id);
        assert_eq!(rm.pending_count(), 0);
    }
}
