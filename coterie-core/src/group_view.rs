//! Group View: the authoritative in-memory registry of known peers
//! (spec §3, §4.1).

use crate::types::{Peer, PeerId, PeerKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of `GroupView::add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Joined,
    Refreshed,
}

/// Kind of membership-change event delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Join,
    Leave,
    Timeout,
}

/// A membership event: always carries a snapshot of the affected peer,
/// taken after the guarding mutex has been released.
#[derive(Debug, Clone)]
pub struct GroupViewEvent {
    pub kind: EventKind,
    pub peer: Peer,
}

type Listener = Box<dyn Fn(GroupViewEvent) + Send + Sync>;

struct Inner {
    peers: HashMap<PeerId, Peer>,
    view_id: u64,
}

/// Registry of known peers, guarded by a single mutex. Listener dispatch
/// always happens after the mutex guard is dropped, carrying an owned
/// snapshot, so a listener can never reenter the map while it is locked.
pub struct GroupView {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Listener>>,
}

impl Default for GroupView {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupView {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                view_id: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener invoked on every join/leave/timeout event.
    /// Listener panics are caught and logged; they never propagate to the
    /// caller that triggered the mutation.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(GroupViewEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Insert a newly-observed peer, or refresh `last_seen` if already known.
    pub fn add(&self, peer: Peer) -> AddOutcome {
        let (outcome, event) = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(&peer.id) {
                Some(existing) => {
                    existing.touch();
                    (AddOutcome::Refreshed, None)
                }
                None => {
                    inner.view_id += 1;
                    inner.peers.insert(peer.id, peer.clone());
                    (
                        AddOutcome::Joined,
                        Some(GroupViewEvent {
                            kind: EventKind::Join,
                            peer,
                        }),
                    )
                }
            }
        };
        if let Some(event) = event {
            self.dispatch(event);
        }
        outcome
    }

    /// Touch a peer's `last_seen` without changing any other field.
    pub fn touch(&self, id: PeerId) {
        let mut inner = self.inner.lock();
        if let Some(peer) = inner.peers.get_mut(&id) {
            peer.touch();
        }
    }

    /// Remove a peer, firing `kind` to listeners. Returns whether it was present.
    pub fn remove(&self, id: PeerId, kind: EventKind) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            inner.peers.remove(&id).map(|peer| {
                inner.view_id += 1;
                GroupViewEvent { kind, peer }
            })
        };
        let present = event.is_some();
        if let Some(event) = event {
            self.dispatch(event);
        }
        present
    }

    pub fn get(&self, id: PeerId) -> Option<Peer> {
        self.inner.lock().peers.get(&id).cloned()
    }

    /// Copy of all peers matching `filter`.
    pub fn snapshot<F>(&self, filter: F) -> Vec<Peer>
    where
        F: Fn(&Peer) -> bool,
    {
        self.inner
            .lock()
            .peers
            .values()
            .filter(|p| filter(p))
            .cloned()
            .collect()
    }

    pub fn servers(&self) -> Vec<Peer> {
        self.snapshot(|p| p.kind == PeerKind::Server)
    }

    pub fn count_by_kind(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let servers = inner.peers.values().filter(|p| p.kind == PeerKind::Server).count();
        let clients = inner.peers.values().filter(|p| p.kind == PeerKind::Client).count();
        (servers, clients)
    }

    pub fn view_id(&self) -> u64 {
        self.inner.lock().view_id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan for peers whose `T_kind` has elapsed and remove them, firing
    /// `Timeout` events. Called by the 15s cleanup sweep.
    pub fn sweep_timeouts(&self) -> Vec<GroupViewEvent> {
        let now = Instant::now();
        let expired: Vec<PeerId> = {
            let inner = self.inner.lock();
            inner
                .peers
                .values()
                .filter(|p| !p.is_active(now))
                .map(|p| p.id)
                .collect()
        };
        expired
            .into_iter()
            .filter_map(|id| {
                let event = {
                    let mut inner = self.inner.lock();
                    inner.peers.remove(&id).map(|peer| {
                        inner.view_id += 1;
                        GroupViewEvent {
                            kind: EventKind::Timeout,
                            peer,
                        }
                    })
                };
                if let Some(event) = event.clone() {
                    self.dispatch(event);
                }
                event
            })
            .collect()
    }

    fn dispatch(&self, event: GroupViewEvent) {
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            let event = event.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event)));
            if let Err(_) = result {
                warn!("group view listener panicked; continuing");
            }
        }
        debug!(kind = ?event.kind, peer = %event.peer.id, "group view event dispatched");
    }
}

/// Background cleanup task: sweeps for timed-out peers every `interval`.
pub async fn run_cleanup_loop(view: Arc<GroupView>, interval: std::time::Duration, running: Arc<std::sync::atomic::AtomicBool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !running.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        let expired = view.sweep_timeouts();
        for event in expired {
            debug!(peer = %event.peer.id, "peer timed out and was removed from group view");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerKind;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn add_then_refresh() {
        let gv = GroupView::new();
        let peer = Peer::new(PeerId(1), PeerKind::Server, addr(), "h1".into());
        assert_eq!(gv.add(peer.clone()), AddOutcome::Joined);
        assert_eq!(gv.add(peer), AddOutcome::Refreshed);
        assert_eq!(gv.len(), 1);
    }

    #[test]
    fn listeners_fire_on_join_and_remove() {
        let gv = GroupView::new();
        let joins = Arc::new(AtomicUsize::new(0));
        let leaves = Arc::new(AtomicUsize::new(0));
        let j = joins.clone();
        let l = leaves.clone();
        gv.subscribe(move |event| match event.kind {
            EventKind::Join => {
                j.fetch_add(1, Ordering::SeqCst);
            }
            EventKind::Leave | EventKind::Timeout => {
                l.fetch_add(1, Ordering::SeqCst);
            }
        });

        let peer = Peer::new(PeerId(2), PeerKind::Client, addr(), "h2".into());
        gv.add(peer);
        gv.remove(PeerId(2), EventKind::Leave);

        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn view_id_increases_monotonically() {
        let gv = GroupView::new();
        assert_eq!(gv.view_id(), 0);
        gv.add(Peer::new(PeerId(3), PeerKind::Server, addr(), "h3".into()));
        assert_eq!(gv.view_id(), 1);
        gv.remove(PeerId(3), EventKind::Leave);
        assert_eq!(gv.view_id(), 2);
    }
}
