//! Error taxonomy and per-node fault counters.
//!
//! Transport and decode errors are swallowed at the I/O layer, counted,
//! and logged; they never abort a task loop. Only startup socket-bind
//! failures propagate to `main`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to bind datagram bus on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fault kinds counted per spec.md §7's taxonomy.
#[derive(Debug, Default)]
pub struct FaultCounters {
    pub crash: AtomicU64,
    pub omission: AtomicU64,
    pub byzantine: AtomicU64,
    pub partition: AtomicU64,
}

impl FaultCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_crash(&self) {
        self.crash.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_omission(&self) {
        self.omission.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_byzantine(&self) {
        self.byzantine.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partition(&self) {
        self.partition.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FaultSnapshot {
        FaultSnapshot {
            crash: self.crash.load(Ordering::Relaxed),
            omission: self.omission.load(Ordering::Relaxed),
            byzantine: self.byzantine.load(Ordering::Relaxed),
            partition: self.partition.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultSnapshot {
    pub crash: u64,
    pub omission: u64,
    pub byzantine: u64,
    pub partition: u64,
}
