//! `Node`: the single owned aggregate that threads GV/LeaderState/FD/RM
//! through every component (spec §9's "Global mutable state" design note
//! — replacing the original's module-level globals with one struct).

use crate::discovery::{Discovery, DiscoveryActor, TextMessage};
use crate::election::{Election, ElectionActor};
use crate::error::{FaultCounters, Result};
use crate::fault::{FaultActor, FaultDetector};
use crate::group_view::{self, GroupView};
use crate::reliable::ReliableMessaging;
use crate::transport::DatagramBus;
use crate::types::{Peer, PeerId, PeerKind, WireMessage};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handler for text datagrams that belong to neither Discovery's wire
/// protocol nor the JSON `WireMessage` catalog — the external chat layer's
/// `join`/`leave`/`status`/group-message commands (spec §1's "out of core
/// scope" surface, wired in by the `coterie` binary).
type ExternalTextHandler = Box<dyn Fn(&str, SocketAddr) + Send + Sync>;

/// Best-effort discovery of the outbound-facing local IP address, the
/// way a node would identify itself on the wire. Falls back to loopback
/// if no route is available (e.g. sandboxed CI).
pub fn local_ip() -> IpAddr {
    StdUdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Anything the external chat layer needs after bootstrapping the core.
pub struct Node {
    pub node_id: PeerId,
    pub kind: PeerKind,
    pub hostname: String,
    pub self_ip: IpAddr,
    pub group: Arc<GroupView>,
    pub bus: Arc<DatagramBus>,
    pub discovery: Arc<Discovery>,
    pub election: Arc<Election>,
    pub fault: Arc<FaultDetector>,
    pub reliable: Arc<ReliableMessaging>,
    pub counters: Arc<FaultCounters>,
    external_text: Mutex<Option<ExternalTextHandler>>,
    running: Arc<AtomicBool>,
}

/// Owned actors that must be moved into spawned tasks; kept separate from
/// `Node` so `Node` itself stays cheaply cloneable-by-reference.
struct Actors {
    discovery: DiscoveryActor,
    election: ElectionActor,
    fault: FaultActor,
}

impl Node {
    /// Open the datagram bus and wire up every component. Does not yet
    /// start any background task — call `run` for that.
    pub async fn bootstrap(kind: PeerKind, hostname: Option<String>) -> Result<(Self, RunHandle)> {
        let hostname = hostname.unwrap_or_else(local_hostname);
        let self_ip = local_ip();
        let node_id = PeerId::derive(&self_ip.to_string(), &hostname);

        let bus = Arc::new(DatagramBus::open().await?);
        bus.start_receive();

        let group = Arc::new(GroupView::new());

        let (discovery, discovery_actor) = Discovery::new(
            node_id,
            kind,
            self_ip.to_string(),
            hostname.clone(),
            group.clone(),
            bus.clone(),
        );
        let discovery = Arc::new(discovery);

        let (election, election_actor) = Election::new(node_id, group.clone(), bus.clone());
        let election = Arc::new(election);

        let counters = Arc::new(crate::error::FaultCounters::new());

        let (fault, fault_actor) = FaultDetector::new(
            node_id,
            kind,
            group.clone(),
            bus.clone(),
            election.clone(),
            counters.clone(),
        );
        let fault = Arc::new(fault);

        let reliable = Arc::new(ReliableMessaging::new(
            node_id,
            bus.clone(),
            group.clone(),
            counters,
        ));

        // Wire the callback cycle described in spec §9: FD -> LE via
        // callback registration rather than direct internals access.
        let election_for_crash = election.clone();
        fault.set_on_crash(move |id| {
            if election_for_crash.current_leader() == Some(id) {
                election_for_crash.clear_leader();
                election_for_crash.trigger();
            }
        });

        let discovery_for_startup = discovery.clone();
        let election_for_startup = election.clone();
        discovery.set_startup_complete_callback(move || {
            let election = election_for_startup.clone();
            tokio::spawn(async move {
                tokio::time::sleep(crate::config::STARTUP_SETTLE_DELAY).await;
                election.trigger();
            });
            let _ = &discovery_for_startup;
        });

        let running = Arc::new(AtomicBool::new(true));

        // Self-entry in the group view, per spec §2's control flow.
        group.add(Peer::new(
            node_id,
            kind,
            SocketAddr::new(self_ip, crate::config::MULTICAST_PORT),
            hostname.clone(),
        ));

        let node = Self {
            node_id,
            kind,
            hostname,
            self_ip,
            group,
            bus,
            discovery,
            election,
            fault,
            reliable,
            counters,
            external_text: Mutex::new(None),
            running: running.clone(),
        };

        let handle = RunHandle {
            actors: Actors {
                discovery: discovery_actor,
                election: election_actor,
                fault: fault_actor,
            },
            running,
        };

        Ok((node, handle))
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register the chat layer's handler for text the core doesn't own
    /// (anything that isn't a Discovery line or a JSON `WireMessage`).
    pub fn set_external_text_handler<F>(&self, handler: F)
    where
        F: Fn(&str, SocketAddr) + Send + Sync + 'static,
    {
        *self.external_text.lock() = Some(Box::new(handler));
    }

    /// Route one inbound datagram to the component that owns its wire
    /// format (spec §9's "replace ad-hoc prefix matching with a
    /// tagged-variant decoded once at ingress").
    pub fn dispatch_inbound(&self, bytes: &[u8], src: SocketAddr) {
        let text = std::str::from_utf8(bytes).ok();

        if let Some(line) = text {
            if Discovery::owns(line) {
                if let Some(msg) = TextMessage::parse(line) {
                    self.discovery.deliver(msg, src);
                }
                return;
            }
        }

        match WireMessage::from_bytes(bytes) {
            Ok(msg) => {
                self.route_wire_message(msg, src);
                return;
            }
            Err(e) => {
                if text.is_none() {
                    self.counters.record_byzantine();
                    warn!("node: unparseable binary datagram from {src} ({} bytes)", bytes.len());
                    return;
                }
                debug!("node: {src} sent non-discovery, non-JSON text ({e}), trying chat layer");
            }
        }

        if let Some(line) = text {
            if let Some(handler) = self.external_text.lock().as_ref() {
                handler(line, src);
            } else {
                debug!("node: no external text handler registered, dropping {line:?} from {src}");
            }
        }
    }

    fn route_wire_message(&self, msg: WireMessage, src: SocketAddr) {
        if let Some(sender) = msg.sender() {
            if sender != self.node_id && self.group.get(sender).is_some() {
                self.group.touch(sender);
            }
        }
        match &msg {
            WireMessage::Election { .. } | WireMessage::Ok { .. } | WireMessage::Coordinator { .. } => {
                self.election.deliver(msg, src);
            }
            WireMessage::Heartbeat { .. }
            | WireMessage::LeaderHeartbeat { .. }
            | WireMessage::PartitionProbe { .. } => {
                self.fault.deliver(msg);
            }
            WireMessage::Reliable { .. } | WireMessage::Ack { .. } => {
                let reliable = self.reliable.clone();
                tokio::spawn(async move {
                    reliable.handle_inbound(msg, src).await;
                });
            }
        }
    }
}

/// Actors and the shutdown flag, consumed by `run`.
pub struct RunHandle {
    actors: Actors,
    running: Arc<AtomicBool>,
}

/// Spawn every background task: the central dispatcher plus each
/// component's actor loop (spec §5's "per-incoming-datagram dispatcher
/// task" alongside the long-lived periodic tasks).
pub async fn run(node: Arc<Node>, handle: RunHandle) {
    let RunHandle { actors, running } = handle;

    let dispatcher = {
        let node = node.clone();
        let running = running.clone();
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match node.bus.recv().await {
                    Some(inbound) => node.dispatch_inbound(&inbound.bytes, inbound.src),
                    None => break,
                }
            }
        })
    };

    let cleanup = {
        let group = node.group.clone();
        let running = running.clone();
        tokio::spawn(group_view::run_cleanup_loop(group, crate::config::GV_CLEANUP_INTERVAL, running))
    };

    let discovery_task = {
        let election = node.election.clone();
        let running = running.clone();
        tokio::spawn(actors.discovery.run(election, running))
    };

    let election_task = tokio::spawn(actors.election.run());

    let fault_task = {
        let running = running.clone();
        tokio::spawn(actors.fault.run(running))
    };

    let reliable_task = {
        let reliable = node.reliable.clone();
        let running = running.clone();
        tokio::spawn(reliable.run_timeout_loop(running))
    };

    let results = tokio::join!(
        dispatcher,
        cleanup,
        discovery_task,
        election_task,
        fault_task,
        reliable_task,
    );
    if let Err(e) = results.0 {
        warn!("node: dispatcher task failed: {e}");
    }
}
