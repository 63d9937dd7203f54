//! Datagram Bus: the abstract best-effort broadcast channel (spec §2, §6).
//!
//! A single multicast UDP socket stands in for "every peer both sends and
//! listens". Pure collaborator — no membership/election/fault logic lives
//! here, mirroring the teacher's `Transport` (`roj-core-rs/src/transport.rs`),
//! generalized from unicast-send/broadcast-to-address-list onto a joined
//! multicast group.

use crate::config::{DATAGRAM_BUFFER, MULTICAST_GROUP, MULTICAST_PORT, MULTICAST_TTL};
use crate::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A datagram delivered from the bus, with its source address.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub bytes: Vec<u8>,
    pub src: SocketAddr,
}

/// Multicast datagram bus. Every node both publishes to and subscribes
/// from the same multicast group.
pub struct DatagramBus {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    incoming_tx: mpsc::Sender<Inbound>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
}

impl DatagramBus {
    /// Bind and join the multicast group described in `config`.
    pub async fn open() -> Result<Self> {
        let bind_addr: SocketAddr = format!("0.0.0.0:{MULTICAST_PORT}")
            .parse()
            .expect("static bind address is valid");
        let socket = UdpSocket::bind(bind_addr).await.map_err(|source| Error::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

        let group: Ipv4Addr = MULTICAST_GROUP.parse().expect("static multicast group is valid");
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.set_multicast_loop_v4(true)?;

        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        Ok(Self {
            socket: Arc::new(socket),
            group: SocketAddr::new(group.into(), MULTICAST_PORT),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    /// Bind to an ephemeral loopback port without joining the multicast
    /// group, for tests that exercise protocol logic without binding the
    /// well-known port (which a real node elsewhere on the host may hold).
    #[cfg(test)]
    pub async fn open_ephemeral() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            group: local,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn group_addr(&self) -> SocketAddr {
        self.group
    }

    /// Spawn the background receive loop, feeding `recv`.
    pub fn start_receive(&self) {
        let socket = self.socket.clone();
        let tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        let inbound = Inbound {
                            bytes: buf[..len].to_vec(),
                            src,
                        };
                        if tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("datagram bus receive error: {e}");
                    }
                }
            }
        });
    }

    pub async fn recv(&self) -> Option<Inbound> {
        self.incoming_rx.lock().await.recv().await
    }

    /// Publish to the whole group.
    pub async fn broadcast(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, self.group).await?;
        Ok(())
    }

    /// Send to a single peer address (used for unicast ACKs, probe responses).
    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<()> {
        debug!("sending {} bytes to {addr}", bytes.len());
        self.socket.send_to(bytes, addr).await?;
        Ok(())
    }
}
