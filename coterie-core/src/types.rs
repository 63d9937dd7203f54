//! Core data model: peer identity, peer records, and the wire message
//! catalog (spec §3, §6).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Stable peer identifier, derived deterministically from (ip, hostname).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// `SHA-256(ip ":" hostname)[0..4] mod 10_000`.
    pub fn derive(ip: &str, hostname: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ip.as_bytes());
        hasher.update(b":");
        hasher.update(hostname.as_bytes());
        let digest = hasher.finalize();
        let truncated = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        PeerId(truncated % 10_000)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(s.parse()?))
    }
}

/// Whether a peer is a server (election-eligible) or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Server,
    Client,
}

impl PeerKind {
    /// `T_kind` per spec §3: 30s for servers, 60s for clients.
    pub fn active_timeout(self) -> std::time::Duration {
        match self {
            PeerKind::Server => crate::config::T_SERVER,
            PeerKind::Client => crate::config::T_CLIENT,
        }
    }
}

/// A known peer and its liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub kind: PeerKind,
    pub addr: SocketAddr,
    pub hostname: String,
    pub join_time: Instant,
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(id: PeerId, kind: PeerKind, addr: SocketAddr, hostname: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind,
            addr,
            hostname,
            join_time: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_active(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) <= self.kind.active_timeout()
    }
}

/// Current Unix timestamp in seconds, used on wire envelopes.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// JSON-tagged coordination messages (election, reliability, faults).
/// Colon-delimited discovery/chat text messages are parsed separately in
/// `discovery` and the `coterie` chat layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "ELECTION")]
    Election { sender_id: PeerId },

    #[serde(rename = "OK")]
    Ok { sender_id: PeerId },

    #[serde(rename = "COORDINATOR")]
    Coordinator { sender_id: PeerId },

    #[serde(rename = "RELIABLE_MSG")]
    Reliable {
        message: ReliableEnvelope,
        target_nodes: Option<Vec<PeerId>>,
    },

    #[serde(rename = "ACK")]
    Ack { msg_id: uuid::Uuid, sender_id: PeerId },

    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        sender_id: PeerId,
        node_type: PeerKind,
        timestamp: u64,
    },

    #[serde(rename = "LEADER_HEARTBEAT")]
    LeaderHeartbeat { sender_id: PeerId, timestamp: u64 },

    #[serde(rename = "PARTITION_PROBE")]
    PartitionProbe {
        sender_id: PeerId,
        target_id: PeerId,
        timestamp: u64,
    },
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn sender(&self) -> Option<PeerId> {
        match self {
            WireMessage::Election { sender_id }
            | WireMessage::Ok { sender_id }
            | WireMessage::Coordinator { sender_id }
            | WireMessage::Ack { sender_id, .. }
            | WireMessage::Heartbeat { sender_id, .. }
            | WireMessage::LeaderHeartbeat { sender_id, .. }
            | WireMessage::PartitionProbe { sender_id, .. } => Some(*sender_id),
            WireMessage::Reliable { message, .. } => Some(message.sender_id),
        }
    }
}

/// A reliable-delivery envelope: spec §4.5 / §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableEnvelope {
    pub msg_id: uuid::Uuid,
    pub sender_id: PeerId,
    pub msg_type: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
    pub sequence_num: u64,
    pub checksum: String,
}

impl ReliableEnvelope {
    /// `SHA-256(sender‖type‖payload‖timestamp)[0:16]`.
    pub fn compute_checksum(
        sender_id: PeerId,
        msg_type: &str,
        payload: &serde_json::Value,
        timestamp: u64,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sender_id.0.to_be_bytes());
        hasher.update(msg_type.as_bytes());
        hasher.update(payload.to_string().as_bytes());
        hasher.update(timestamp.to_be_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    pub fn verify_checksum(&self) -> bool {
        let expected =
            Self::compute_checksum(self.sender_id, &self.msg_type, &self.payload, self.timestamp);
        expected == self.checksum
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_deterministic() {
        let a = PeerId::derive("10.0.0.1", "alpha");
        let b = PeerId::derive("10.0.0.1", "alpha");
        assert_eq!(a, b);
        assert!(a.0 < 10_000);
    }

    #[test]
    fn peer_id_round_trips_through_decimal() {
        let id = PeerId::derive("192.168.1.5", "bravo");
        let text = id.to_string();
        let parsed: PeerId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn wire_message_round_trips() {
        let msg = WireMessage::Election {
            sender_id: PeerId(1234),
        };
        let bytes = msg.to_bytes().unwrap();
        let parsed = WireMessage::from_bytes(&bytes).unwrap();
        match parsed {
            WireMessage::Election { sender_id } => assert_eq!(sender_id, PeerId(1234)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn envelope_checksum_detects_corruption() {
        let payload = serde_json::json!({"text": "hi"});
        let ts = 1_700_000_000;
        let checksum = ReliableEnvelope::compute_checksum(PeerId(1), "chat", &payload, ts);
        let mut envelope = ReliableEnvelope {
            msg_id: uuid::Uuid::new_v4(),
            sender_id: PeerId(1),
            msg_type: "chat".to_string(),
            payload,
            timestamp: ts,
            sequence_num: 0,
            checksum,
        };
        assert!(envelope.verify_checksum());
        envelope.checksum = "deadbeef".to_string();
        assert!(!envelope.verify_checksum());
    }
}
