//! Discovery Service: bootstraps a node into the group and keeps
//! membership fresh (spec §4.2).

use crate::config::{
    ANNOUNCE_INTERVAL, PROBE_RETRY_DELAY, PROBE_ROUNDS, PROBE_ROUND_DEADLINE, STARTUP_BUDGET,
};
use crate::election::Election;
use crate::group_view::{AddOutcome, GroupView};
use crate::transport::DatagramBus;
use crate::types::{Peer, PeerId, PeerKind};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Discovery phase (spec §4.2's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Startup,
    Running,
    Joining,
}

/// Parsed text-wire discovery message (spec §6's colon-delimited formats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMessage {
    ServerAlive {
        ip: String,
        hostname: String,
        phase: Option<String>,
    },
    ServerProbe {
        ip: String,
        server_id: PeerId,
    },
    ServerResponse {
        hostname: String,
        ip: String,
    },
    ServerProbeCapable {
        ip: String,
        hostname: String,
        server_id: PeerId,
    },
    ClientHeartbeat {
        client_id: PeerId,
    },
}

impl TextMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.trim().split(':').collect();
        match parts.as_slice() {
            ["SERVER_ALIVE", ip, hostname] => Some(TextMessage::ServerAlive {
                ip: ip.to_string(),
                hostname: hostname.to_string(),
                phase: None,
            }),
            ["SERVER_ALIVE", ip, hostname, phase] => Some(TextMessage::ServerAlive {
                ip: ip.to_string(),
                hostname: hostname.to_string(),
                phase: Some(phase.to_string()),
            }),
            ["SERVER_PROBE", ip, server_id] => Some(TextMessage::ServerProbe {
                ip: ip.to_string(),
                server_id: server_id.parse().ok()?,
            }),
            ["SERVER_RESPONSE", hostname, ip] => Some(TextMessage::ServerResponse {
                hostname: hostname.to_string(),
                ip: ip.to_string(),
            }),
            ["SERVER_PROBE_CAPABLE", ip, hostname, server_id] => {
                Some(TextMessage::ServerProbeCapable {
                    ip: ip.to_string(),
                    hostname: hostname.to_string(),
                    server_id: server_id.parse().ok()?,
                })
            }
            ["CLIENT_HEARTBEAT", client_id] => Some(TextMessage::ClientHeartbeat {
                client_id: client_id.parse().ok()?,
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            TextMessage::ServerAlive { ip, hostname, phase } => match phase {
                Some(p) => format!("SERVER_ALIVE:{ip}:{hostname}:{p}"),
                None => format!("SERVER_ALIVE:{ip}:{hostname}"),
            },
            TextMessage::ServerProbe { ip, server_id } => {
                format!("SERVER_PROBE:{ip}:{server_id}")
            }
            TextMessage::ServerResponse { hostname, ip } => {
                format!("SERVER_RESPONSE:{hostname}:{ip}")
            }
            TextMessage::ServerProbeCapable { ip, hostname, server_id } => {
                format!("SERVER_PROBE_CAPABLE:{ip}:{hostname}:{server_id}")
            }
            TextMessage::ClientHeartbeat { client_id } => {
                format!("CLIENT_HEARTBEAT:{client_id}")
            }
        }
    }
}

type StartupCompleteCallback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    phase: Mutex<Phase>,
    on_startup_complete: Mutex<Option<StartupCompleteCallback>>,
}

/// Cheap, cloneable handle used by the rest of the node to query phase and
/// feed inbound discovery text messages.
pub struct Discovery {
    node_id: PeerId,
    self_ip: String,
    hostname: String,
    self_kind: PeerKind,
    group: Arc<GroupView>,
    bus: Arc<DatagramBus>,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<(TextMessage, SocketAddr)>,
}

impl Discovery {
    pub fn new(
        node_id: PeerId,
        self_kind: PeerKind,
        self_ip: String,
        hostname: String,
        group: Arc<GroupView>,
        bus: Arc<DatagramBus>,
    ) -> (Self, DiscoveryActor) {
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Startup),
            on_startup_complete: Mutex::new(None),
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let actor = DiscoveryActor {
            node_id,
            self_ip: self_ip.clone(),
            hostname: hostname.clone(),
            self_kind,
            group: group.clone(),
            bus: bus.clone(),
            shared: shared.clone(),
            inbound_rx,
        };

        (
            Self {
                node_id,
                self_ip,
                hostname,
                self_kind,
                group,
                bus,
                shared,
                inbound_tx,
            },
            actor,
        )
    }

    pub fn set_startup_complete_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_startup_complete.lock() = Some(Box::new(callback));
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }

    pub fn self_kind(&self) -> PeerKind {
        self.self_kind
    }

    /// Route an inbound text message (already identified as a discovery
    /// message by the central dispatcher) to the actor.
    pub fn deliver(&self, msg: TextMessage, src: SocketAddr) {
        let _ = self.inbound_tx.try_send((msg, src));
    }

    /// `true` iff the text payload is one this service owns. Anything else
    /// (join/leave/status) belongs to the external chat layer.
    pub fn owns(line: &str) -> bool {
        TextMessage::parse(line).is_some()
    }
}

/// Owns the phase state machine and the inbound channel.
pub struct DiscoveryActor {
    node_id: PeerId,
    self_ip: String,
    hostname: String,
    self_kind: PeerKind,
    group: Arc<GroupView>,
    bus: Arc<DatagramBus>,
    shared: Arc<Shared>,
    inbound_rx: mpsc::Receiver<(TextMessage, SocketAddr)>,
}

impl DiscoveryActor {
    pub async fn run(mut self, election: Arc<Election>, running: Arc<AtomicBool>) {
        self.run_startup(&election).await;

        *self.shared.phase.lock() = Phase::Running;
        info!("discovery: startup complete, entering RUNNING phase");
        if let Some(cb) = self.shared.on_startup_complete.lock().as_ref() {
            cb();
        }

        let mut announce_ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
        loop {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            tokio::select! {
                _ = announce_ticker.tick() => {
                    self.announce().await;
                }
                Some((msg, src)) = self.inbound_rx.recv() => {
                    self.handle_text_message(msg, src, &election).await;
                }
            }
        }
    }

    async fn run_startup(&mut self, election: &Election) {
        self.announce().await;
        let start = Instant::now();
        for round in 0..PROBE_ROUNDS {
            if start.elapsed() >= STARTUP_BUDGET {
                break;
            }
            debug!("discovery: startup probe round {}", round + 1);
            self.probe_round(election).await;
            tokio::time::sleep(PROBE_RETRY_DELAY).await;
        }
    }

    async fn probe_round(&mut self, election: &Election) {
        let probe = TextMessage::ServerProbe {
            ip: self.self_ip.clone(),
            server_id: self.node_id,
        };
        let _ = self.bus.broadcast(probe.encode().as_bytes()).await;

        let deadline = Instant::now() + PROBE_ROUND_DEADLINE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.inbound_rx.recv()).await {
                Ok(Some((msg, src))) => self.handle_text_message(msg, src, election).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    async fn announce(&self) {
        let phase = *self.shared.phase.lock();
        let phase_tag = match phase {
            Phase::Startup => "startup",
            Phase::Running => "running",
            Phase::Joining => "joining",
        };
        let msg = TextMessage::ServerAlive {
            ip: self.self_ip.clone(),
            hostname: self.hostname.clone(),
            phase: Some(phase_tag.to_string()),
        };
        let _ = self.bus.broadcast(msg.encode().as_bytes()).await;
    }

    /// Short discovery burst for a late joiner, then return to RUNNING.
    pub async fn late_join_burst(&mut self, election: &Election) {
        *self.shared.phase.lock() = Phase::Joining;
        info!("discovery: running late-join burst");
        self.probe_round(election).await;
        *self.shared.phase.lock() = Phase::Running;
    }

    async fn handle_text_message(&mut self, msg: TextMessage, src: SocketAddr, election: &Election) {
        match msg {
            TextMessage::ServerAlive { ip, hostname, .. } => {
                let id = PeerId::derive(&ip, &hostname);
                self.observe_server(id, src, hostname, election);
            }
            TextMessage::ServerProbe { ip: _, server_id } => {
                if server_id == self.node_id {
                    // Self-probes are ignored by the responder.
                    return;
                }
                let response = TextMessage::ServerResponse {
                    hostname: self.hostname.clone(),
                    ip: self.self_ip.clone(),
                };
                let _ = self.bus.send_to(response.encode().as_bytes(), src).await;
            }
            TextMessage::ServerResponse { hostname, ip } => {
                let id = PeerId::derive(&ip, &hostname);
                self.observe_server(id, src, hostname, election);
            }
            TextMessage::ServerProbeCapable { hostname, server_id, .. } => {
                if server_id == self.node_id {
                    return;
                }
                self.observe_server(server_id, src, hostname, election);
            }
            TextMessage::ClientHeartbeat { client_id } => {
                if client_id == self.node_id {
                    return;
                }
                if self.group.get(client_id).is_some() {
                    self.group.touch(client_id);
                } else {
                    self.group.add(Peer::new(
                        client_id,
                        PeerKind::Client,
                        src,
                        src.ip().to_string(),
                    ));
                }
            }
        }
    }

    fn observe_server(&self, id: PeerId, src: SocketAddr, hostname: String, election: &Election) {
        if id == self.node_id {
            return;
        }
        let peer = Peer::new(id, PeerKind::Server, src, hostname);
        let outcome = self.group.add(peer);

        let phase = *self.shared.phase.lock();
        if outcome == AddOutcome::Joined && phase == Phase::Running {
            if let Some(leader) = election.current_leader() {
                if id > leader {
                    info!("discovery: higher-priority server {id} joined, re-triggering election");
                    election.trigger();
                }
            }
        }
    }

    pub fn self_kind(&self) -> PeerKind {
        self.self_kind
    }
}

/// A node with zero known servers is, by definition, not partitioned.
pub fn is_trivially_connected(known_servers: usize) -> bool {
    known_servers == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_alive_without_phase() {
        let msg = TextMessage::parse("SERVER_ALIVE:10.0.0.1:alpha").unwrap();
        assert_eq!(
            msg,
            TextMessage::ServerAlive {
                ip: "10.0.0.1".into(),
                hostname: "alpha".into(),
                phase: None,
            }
        );
    }

    #[test]
    fn parses_server_alive_with_phase() {
        let msg = TextMessage::parse("SERVER_ALIVE:10.0.0.1:alpha:running").unwrap();
        assert_eq!(
            msg,
            TextMessage::ServerAlive {
                ip: "10.0.0.1".into(),
                hostname: "alpha".into(),
                phase: Some("running".into()),
            }
        );
    }

    #[test]
    fn rejects_malformed_probe() {
        assert!(TextMessage::parse("SERVER_PROBE:not-an-id").is_none());
        assert!(TextMessage::parse("garbage").is_none());
    }

    #[test]
    fn discovery_owns_server_prefixed_lines_only() {
        assert!(Discovery::owns("SERVER_ALIVE:1.2.3.4:host"));
        assert!(!Discovery::owns("join:alice"));
        assert!(!Discovery::owns("status"));
    }

    #[test]
    fn zero_known_servers_is_not_partitioned() {
        assert!(is_trivially_connected(0));
        assert!(!is_trivially_connected(1));
    }
}
