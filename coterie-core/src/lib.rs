//! Coterie Core
//!
//! Peer-to-peer group-membership and coordination substrate: discovery,
//! priority-based leader election, fault/partition detection, and
//! reliable messaging over a shared multicast datagram bus.

pub mod config;
pub mod discovery;
pub mod election;
pub mod error;
pub mod fault;
pub mod group_view;
pub mod node;
pub mod reliable;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use node::Node;
pub use types::{Peer, PeerId, PeerKind};
