//! Fault Detector: heartbeat emission, crash detection, partition
//! detection, and leader-liveness monitoring (spec §4.4).
//!
//! Shape grounded in the teacher's `PartitionHandler`
//! (`roj-core-rs/src/partition.rs`): a `tick()`-driven state struct with a
//! state-change callback and a probe/ack message pair. The decision rule
//! is replaced: majority-of-known-peers with a startup grace period
//! (spec invariant 5), not quorum-vs-cluster_size with epoch
//! reconciliation — there is no replicated log here to resync, so the
//! teacher's `Epoch`/`PartitionHealed`/`SyncRequest` machinery has no
//! counterpart and is dropped (see DESIGN.md).

use crate::config::{
    CRASH_SCAN_INTERVAL, H_HEARTBEAT, PARTITION_PROBE_DEADLINE, PARTITION_SCAN_INTERVAL, T_FAILURE,
    T_GRACE, T_LEADER_HEARTBEAT,
};
use crate::election::Election;
use crate::error::FaultCounters;
use crate::group_view::GroupView;
use crate::transport::DatagramBus;
use crate::types::{unix_timestamp, PeerId, PeerKind, WireMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-process partition state (spec §3's `PartitionState`).
#[derive(Debug, Clone)]
pub struct PartitionState {
    pub known_nodes: usize,
    pub reachable_nodes: usize,
    pub in_partition: bool,
    pub partition_start: Option<Instant>,
    pub detection_enabled: bool,
}

type CrashCallback = Box<dyn Fn(PeerId) + Send + Sync>;
type PartitionCallback = Box<dyn Fn(PartitionState) + Send + Sync>;

struct Shared {
    partition: Mutex<PartitionState>,
    on_crash: Mutex<Option<CrashCallback>>,
    on_partition: Mutex<Option<PartitionCallback>>,
}

/// Cheap handle for registering callbacks and reading fault state.
pub struct FaultDetector {
    node_id: PeerId,
    self_kind: PeerKind,
    startup_time: Instant,
    counters: Arc<FaultCounters>,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<WireMessage>,
}

impl FaultDetector {
    pub fn new(
        node_id: PeerId,
        self_kind: PeerKind,
        group: Arc<GroupView>,
        bus: Arc<DatagramBus>,
        election: Arc<Election>,
        counters: Arc<FaultCounters>,
    ) -> (Self, FaultActor) {
        let startup_time = Instant::now();
        let shared = Arc::new(Shared {
            partition: Mutex::new(PartitionState {
                known_nodes: 0,
                reachable_nodes: 0,
                in_partition: false,
                partition_start: None,
                detection_enabled: false,
            }),
            on_crash: Mutex::new(None),
            on_partition: Mutex::new(None),
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let actor = FaultActor {
            node_id,
            self_kind,
            startup_time,
            group,
            bus,
            election,
            shared: shared.clone(),
            counters: counters.clone(),
            inbound_rx,
            failed: HashSet::new(),
            reachable: HashSet::new(),
            pending_probes: HashSet::new(),
        };

        (
            Self {
                node_id,
                self_kind,
                startup_time,
                counters,
                shared,
                inbound_tx,
            },
            actor,
        )
    }

    pub fn set_on_crash<F>(&self, cb: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        *self.shared.on_crash.lock() = Some(Box::new(cb));
    }

    pub fn set_on_partition<F>(&self, cb: F)
    where
        F: Fn(PartitionState) + Send + Sync + 'static,
    {
        *self.shared.on_partition.lock() = Some(Box::new(cb));
    }

    pub fn deliver(&self, msg: WireMessage) {
        let _ = self.inbound_tx.try_send(msg);
    }

    pub fn counters(&self) -> &FaultCounters {
        &self.counters
    }

    pub fn partition_state(&self) -> PartitionState {
        self.shared.partition.lock().clone()
    }

    pub fn node_id(&self) -> PeerId {
        self.node_id
    }

    pub fn self_kind(&self) -> PeerKind {
        self.self_kind
    }

    pub fn startup_time(&self) -> Instant {
        self.startup_time
    }
}

/// Owns the four periodic sub-tasks as one `tokio::select!` actor.
pub struct FaultActor {
    node_id: PeerId,
    self_kind: PeerKind,
    startup_time: Instant,
    group: Arc<GroupView>,
    bus: Arc<DatagramBus>,
    election: Arc<Election>,
    shared: Arc<Shared>,
    counters: Arc<FaultCounters>,
    inbound_rx: mpsc::Receiver<WireMessage>,
    failed: HashSet<PeerId>,
    reachable: HashSet<PeerId>,
    pending_probes: HashSet<PeerId>,
}

impl FaultActor {
    pub async fn run(mut self, running: Arc<AtomicBool>) {
        let mut heartbeat_ticker = tokio::time::interval(H_HEARTBEAT);
        let mut crash_ticker = tokio::time::interval(CRASH_SCAN_INTERVAL);
        let mut partition_ticker = tokio::time::interval(PARTITION_SCAN_INTERVAL);
        let mut leader_monitor_ticker = tokio::time::interval(T_LEADER_HEARTBEAT / 2);

        loop {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            tokio::select! {
                _ = heartbeat_ticker.tick() => self.emit_heartbeat().await,
                _ = crash_ticker.tick() => self.scan_for_crashes(),
                _ = partition_ticker.tick() => self.run_partition_round().await,
                _ = leader_monitor_ticker.tick() => self.monitor_leader(),
                Some(msg) = self.inbound_rx.recv() => self.handle_message(msg).await,
            }
        }
    }

    async fn emit_heartbeat(&self) {
        let msg = WireMessage::Heartbeat {
            sender_id: self.node_id,
            node_type: self.self_kind,
            timestamp: unix_timestamp(),
        };
        if let Ok(bytes) = msg.to_bytes() {
            let _ = self.bus.broadcast(&bytes).await;
        }
    }

    fn scan_for_crashes(&mut self) {
        let now = Instant::now();
        let candidates = self.group.snapshot(|_| true);
        for peer in candidates {
            let silent = now.duration_since(peer.last_seen) > T_FAILURE;
            if silent {
                if self.failed.insert(peer.id) {
                    self.counters.record_crash();
                    warn!("fault: peer {} crashed (silent for > {:?})", peer.id, T_FAILURE);
                    if let Some(cb) = self.shared.on_crash.lock().as_ref() {
                        cb(peer.id);
                    }
                }
            } else {
                self.failed.remove(&peer.id);
            }
        }
    }

    fn monitor_leader(&self) {
        if self.self_kind != PeerKind::Server {
            return;
        }
        let Some(_leader) = self.election.current_leader() else {
            return;
        };
        let Some(last) = self.election.last_leader_heartbeat() else {
            return;
        };
        if Instant::now().duration_since(last) > T_LEADER_HEARTBEAT {
            warn!("fault: leader heartbeat lost, triggering election");
            self.election.clear_leader();
            self.election.trigger();
        }
    }

    async fn run_partition_round(&mut self) {
        let grace_elapsed = Instant::now().duration_since(self.startup_time) >= T_GRACE;
        {
            let mut partition = self.shared.partition.lock();
            partition.detection_enabled = grace_elapsed;
        }
        if !grace_elapsed {
            let mut partition = self.shared.partition.lock();
            partition.in_partition = false;
            return;
        }

        let known: Vec<PeerId> = self
            .group
            .servers()
            .into_iter()
            .map(|p| p.id)
            .filter(|id| *id != self.node_id)
            .collect();
        let known_count = known.len();

        if known_count == 0 {
            let mut partition = self.shared.partition.lock();
            partition.known_nodes = 0;
            partition.reachable_nodes = 0;
            partition.in_partition = false;
            return;
        }

        self.reachable.clear();
        self.pending_probes = known.iter().copied().collect();

        for target in &known {
            if let Some(peer) = self.group.get(*target) {
                let probe = WireMessage::PartitionProbe {
                    sender_id: self.node_id,
                    target_id: *target,
                    timestamp: unix_timestamp(),
                };
                if let Ok(bytes) = probe.to_bytes() {
                    let _ = self.bus.send_to(&bytes, peer.addr).await;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + PARTITION_PROBE_DEADLINE;
        loop {
            if self.pending_probes.is_empty() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, self.inbound_rx.recv()).await {
                Ok(Some(msg)) => self.handle_message(msg).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        let reachable_count = self.reachable.len();
        let majority = (known_count + 1) / 2;
        let was_partitioned = self.shared.partition.lock().in_partition;
        let now_partitioned = reachable_count < majority && known_count >= 2;

        {
            let mut partition = self.shared.partition.lock();
            partition.known_nodes = known_count;
            partition.reachable_nodes = reachable_count;
        }

        if !was_partitioned && now_partitioned {
            let start = Instant::now();
            {
                let mut partition = self.shared.partition.lock();
                partition.in_partition = true;
                partition.partition_start = Some(start);
            }
            self.counters.record_partition();
            warn!(
                "fault: partition detected, {reachable_count}/{known_count} reachable (need {majority})"
            );
            let snapshot = self.partition_snapshot();
            if let Some(cb) = self.shared.on_partition.lock().as_ref() {
                cb(snapshot);
            }
            self.election.set_partition_active(true);
        } else if was_partitioned && !now_partitioned {
            {
                let mut partition = self.shared.partition.lock();
                partition.in_partition = false;
                partition.partition_start = None;
            }
            info!("fault: partition healed, re-triggering election");
            let snapshot = self.partition_snapshot();
            if let Some(cb) = self.shared.on_partition.lock().as_ref() {
                cb(snapshot);
            }
            self.election.set_partition_active(false);
        }
    }

    fn partition_snapshot(&self) -> PartitionState {
        self.shared.partition.lock().clone()
    }

    async fn handle_message(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::Heartbeat { sender_id, .. } => {
                self.group.touch(sender_id);
                self.failed.remove(&sender_id);
            }
            WireMessage::LeaderHeartbeat { sender_id, .. } => {
                self.group.touch(sender_id);
                self.failed.remove(&sender_id);
                self.election.record_leader_heartbeat(sender_id);
            }
            WireMessage::PartitionProbe { sender_id, target_id, .. } => {
                self.group.touch(sender_id);
                if target_id == self.node_id {
                    if self.pending_probes.remove(&sender_id) {
                        self.reachable.insert(sender_id);
                        debug!("fault: {sender_id} reachable");
                    } else {
                        let reply = WireMessage::PartitionProbe {
                            sender_id: self.node_id,
                            target_id: sender_id,
                            timestamp: unix_timestamp(),
                        };
                        if let (Ok(bytes), Some(peer)) =
                            (reply.to_bytes(), self.group.get(sender_id))
                        {
                            let _ = self.bus.send_to(&bytes, peer.addr).await;
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::Election;
    use crate::types::Peer;
    use std::sync::atomic::AtomicUsize;

    async fn harness(node_id: u32) -> (FaultDetector, FaultActor, Arc<GroupView>, Arc<Election>) {
        let bus = Arc::new(DatagramBus::open_ephemeral().await.expect("bind loopback bus"));
        let group = Arc::new(GroupView::new());
        let (election, _election_actor) = Election::new(PeerId(node_id), group.clone(), bus.clone());
        let election = Arc::new(election);
        let (fd, actor) = FaultDetector::new(
            PeerId(node_id),
            PeerKind::Server,
            group.clone(),
            bus,
            election.clone(),
            Arc::new(FaultCounters::new()),
        );
        (fd, actor, group, election)
    }

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn silent_peer_is_declared_crashed_once() {
        let (fd, mut actor, group, _election) = harness(1).await;
        let crashed = Arc::new(AtomicUsize::new(0));
        let c = crashed.clone();
        fd.set_on_crash(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut peer = Peer::new(PeerId(2), PeerKind::Server, addr(9100), "h2".into());
        peer.last_seen = Instant::now() - (T_FAILURE + Duration::from_secs(1));
        group.add(peer);

        actor.scan_for_crashes();
        actor.scan_for_crashes();

        assert_eq!(crashed.load(Ordering::SeqCst), 1);
        assert_eq!(fd.counters().snapshot().crash, 1);
    }

    #[tokio::test]
    async fn heartbeat_clears_failed_state() {
        let (_fd, mut actor, group, _election) = harness(1).await;
        let mut peer = Peer::new(PeerId(2), PeerKind::Server, addr(9101), "h2".into());
        peer.last_seen = Instant::now() - (T_FAILURE + Duration::from_secs(1));
        group.add(peer);
        actor.scan_for_crashes();
        assert!(actor.failed.contains(&PeerId(2)));

        actor
            .handle_message(WireMessage::Heartbeat {
                sender_id: PeerId(2),
                node_type: PeerKind::Server,
                timestamp: unix_timestamp(),
            })
            .await;

        assert!(!actor.failed.contains(&PeerId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn partition_round_flags_minority_after_grace_period() {
        let (fd, mut actor, group, _election) = harness(1).await;
        actor.startup_time = Instant::now() - (T_GRACE + Duration::from_secs(1));

        group.add(Peer::new(PeerId(2), PeerKind::Server, addr(9102), "h2".into()));
        group.add(Peer::new(PeerId(3), PeerKind::Server, addr(9103), "h3".into()));

        actor.run_partition_round().await;

        assert!(fd.partition_state().in_partition);
        assert_eq!(fd.counters().snapshot().partition, 1);
    }

    #[tokio::test]
    async fn zero_known_peers_never_reports_a_partition() {
        let (fd, mut actor, _group, _election) = harness(1).await;
        actor.startup_time = Instant::now() - (T_GRACE + Duration::from_secs(1));

        actor.run_partition_round().await;

        assert!(!fd.partition_state().in_partition);
    }
}
