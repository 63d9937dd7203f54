//! Timing and transport constants shared by every component.

use std::time::Duration;

/// Multicast group all peers join.
pub const MULTICAST_GROUP: &str = "224.1.1.1";
/// Multicast port all peers bind.
pub const MULTICAST_PORT: u16 = 5008;
/// Multicast TTL for outbound datagrams.
pub const MULTICAST_TTL: u32 = 2;
/// Max datagram size we read/write.
pub const DATAGRAM_BUFFER: usize = 10_240;

/// Active-peer timeout for server peers.
pub const T_SERVER: Duration = Duration::from_secs(30);
/// Active-peer timeout for client peers.
pub const T_CLIENT: Duration = Duration::from_secs(60);

/// Group view cleanup sweep interval.
pub const GV_CLEANUP_INTERVAL: Duration = Duration::from_secs(15);

/// Discovery announce interval during RUNNING.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);
/// Number of probe rounds during STARTUP.
pub const PROBE_ROUNDS: u32 = 3;
/// Delay between probe rounds.
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Inactivity deadline while reading probe responses.
pub const PROBE_ROUND_DEADLINE: Duration = Duration::from_secs(5);
/// Overall startup phase budget.
pub const STARTUP_BUDGET: Duration = Duration::from_secs(15);
/// Settling delay after startup_complete before the first election fires.
pub const STARTUP_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Election timeout: time to wait for any OK before self-declaring leader.
pub const T_ELECTION: Duration = Duration::from_secs(5);
/// Coordinator timeout: time to wait for COORDINATOR after receiving an OK.
pub const T_COORDINATOR: Duration = Duration::from_secs(10);
/// Leader heartbeat emission interval.
pub const H_LEADER: Duration = Duration::from_secs(3);

/// Generic heartbeat emission interval (all peers).
pub const H_HEARTBEAT: Duration = Duration::from_secs(5);
/// Crash detector scan interval.
pub const CRASH_SCAN_INTERVAL: Duration = Duration::from_secs(5);
/// Crash timeout: peer silence before it is declared failed.
pub const T_FAILURE: Duration = Duration::from_secs(15);
/// Partition detector probe interval.
pub const PARTITION_SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// Startup grace period: partition/crash decisions are suppressed for this long.
pub const T_GRACE: Duration = Duration::from_secs(30);
/// Deadline to await a partition-probe response.
pub const PARTITION_PROBE_DEADLINE: Duration = Duration::from_secs(5);
/// Leader-heartbeat timeout before a follower declares the leader lost.
pub const T_LEADER_HEARTBEAT: Duration = Duration::from_secs(10);

/// Reliable-message retransmit scan interval.
pub const MESSAGE_TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(2);
/// Time since first send before a retransmit is attempted.
pub const MESSAGE_RETRY_DEADLINE: Duration = Duration::from_secs(5);
/// Maximum retransmit attempts before a message is dropped as an omission.
pub const MESSAGE_MAX_RETRIES: u8 = 3;

/// Reconnect backoff base for the client CLI (2^attempt seconds).
pub const RECONNECT_BACKOFF_BASE: u64 = 2;
/// Maximum reconnect attempts before giving up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;
