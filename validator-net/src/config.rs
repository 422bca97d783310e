//! Configuration for the validator networking layer.

use {
    crate::error::{NetworkError, Result},
    serde::{Deserialize, Serialize},
    std::{net::SocketAddr, time::Duration},
};

/// Default number of skipped half-life periods after which an uptime meter
/// jumps straight to its steady-state value.
pub const DEFAULT_UPTIME_MAX_SKIPPED_PERIODS: u32 = 32;

/// Configuration for the validator P2P network.
///
/// Controls connection limits, timeouts, gossip and the policy
/// collaborators (benchlist, throttlers, uptime tracking).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind the listener on.
    /// Default: `0.0.0.0:9651`
    pub bind_addr: SocketAddr,

    /// Address advertised to peers in the handshake and in peer lists.
    /// Falls back to the listener's local address when unset.
    pub advertised_addr: Option<SocketAddr>,

    /// Network identifier exchanged during the handshake. Peers on a
    /// different network are never promoted to connected.
    pub network_id: u32,

    /// Maximum number of peers, connected or handshaking.
    pub max_peers: usize,

    /// Capacity of each peer's outbound message queue.
    pub send_queue_size: usize,

    /// Maximum size of a single serialized message in bytes.
    pub max_message_size: usize,

    /// Write out still-queued messages when a peer closes.
    pub flush_on_close: bool,

    /// Upper bound on the close-time flush (ms).
    pub close_flush_timeout_ms: u64,

    /// Deadline for the TLS upgrade and for the version exchange (ms).
    pub handshake_timeout_ms: u64,

    /// Deadline for establishing an outbound TCP connection (ms).
    pub dial_timeout_ms: u64,

    /// Largest tolerated difference between our clock and a peer's (ms).
    pub max_clock_difference_ms: u64,

    /// Interval between keep-alive pings (ms).
    pub ping_frequency_ms: u64,

    /// A peer silent for this long is closed (ms).
    pub read_timeout_ms: u64,

    /// Deadline for writing one frame. A peer whose writes stall this long
    /// is closed (ms).
    pub write_timeout_ms: u64,

    /// Interval between peer-list gossip rounds (ms).
    pub gossip_frequency_ms: u64,

    /// Number of addresses sampled into one gossiped peer list.
    pub gossip_peer_list_size: usize,

    /// Number of connected peers each gossip round is sent to.
    pub gossip_peer_list_to: usize,

    /// Maximum number of remembered peer addresses.
    pub max_known_addrs: usize,

    /// Dial addresses learned from peer lists.
    pub dial_gossiped_peers: bool,

    /// Attempts made by a tracked dial before giving up.
    pub max_dial_attempts: u32,

    /// First backoff between tracked dial attempts (ms).
    pub dial_backoff_initial_ms: u64,

    /// Ceiling on the tracked dial backoff (ms).
    pub dial_backoff_max_ms: u64,

    /// Ceiling on the backoff after transient accept errors (ms).
    pub accept_backoff_max_ms: u64,

    /// Half-life of the uptime meters (ms).
    pub uptime_halflife_ms: u64,

    /// Skipped half-life periods after which an uptime meter resets to its
    /// steady-state value instead of decaying step by step.
    pub uptime_max_skipped_periods: u32,

    /// Maximum number of uptime meters kept, connected peers included. When
    /// full, the lowest meter of a disconnected peer makes room.
    pub max_tracked_uptimes: usize,

    /// Benchlist policy.
    pub benchlist: BenchlistConfig,

    /// Connection and message throttling.
    pub throttle: ThrottleConfig,
}

/// Benchlist policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchlistConfig {
    /// Failures inside `window_ms` that bench a peer.
    pub threshold: usize,
    /// Sliding window over which failures are counted (ms).
    pub window_ms: u64,
    /// How long a benched peer stays benched (ms).
    pub duration_ms: u64,
    /// Maximum number of peers benched at the same time.
    pub max_benched_peers: usize,
    /// Interval of the background sweep that drops expired entries (ms).
    pub sweep_interval_ms: u64,
}

/// Throttler limits. A zero rate or cooldown disables that throttler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum spacing between inbound connection upgrades from one IP (ms).
    pub inbound_conn_cooldown_ms: u64,
    /// Sustained inbound consensus messages per second, per peer.
    pub inbound_msgs_per_sec: u32,
    /// Inbound burst allowance, per peer.
    pub inbound_msg_burst: u32,
    /// Sustained outbound consensus messages per second, per peer.
    pub outbound_msgs_per_sec: u32,
    /// Outbound burst allowance, per peer.
    pub outbound_msg_burst: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9651)),
            advertised_addr: None,
            network_id: 1,
            max_peers: 200,
            send_queue_size: 1 << 10,
            max_message_size: 2 * 1_048_576, // 2 MB
            flush_on_close: true,
            close_flush_timeout_ms: 1_000,
            handshake_timeout_ms: 15_000,
            dial_timeout_ms: 30_000,
            max_clock_difference_ms: 60_000,
            ping_frequency_ms: 15_000,
            read_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            gossip_frequency_ms: 60_000,
            gossip_peer_list_size: 50,
            gossip_peer_list_to: 25,
            max_known_addrs: 2_000,
            dial_gossiped_peers: true,
            max_dial_attempts: 8,
            dial_backoff_initial_ms: 1_000,
            dial_backoff_max_ms: 60_000,
            accept_backoff_max_ms: 1_000,
            uptime_halflife_ms: 60 * 60 * 1_000, // 1 hour
            uptime_max_skipped_periods: DEFAULT_UPTIME_MAX_SKIPPED_PERIODS,
            max_tracked_uptimes: 4_096,
            benchlist: BenchlistConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Default for BenchlistConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window_ms: 10_000,
            duration_ms: 30 * 60 * 1_000, // 30 minutes
            max_benched_peers: 50,
            sweep_interval_ms: 5_000,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            inbound_conn_cooldown_ms: 10_000,
            inbound_msgs_per_sec: 1_024,
            inbound_msg_burst: 4_096,
            outbound_msgs_per_sec: 1_024,
            outbound_msg_burst: 4_096,
        }
    }
}

impl NetworkConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertised_addr: None,
            network_id: 12345,
            max_peers: 10,
            send_queue_size: 64,
            max_message_size: 1_048_576,
            flush_on_close: true,
            close_flush_timeout_ms: 200,
            handshake_timeout_ms: 2_000,
            dial_timeout_ms: 2_000,
            max_clock_difference_ms: 60_000,
            ping_frequency_ms: 200,
            read_timeout_ms: 5_000,
            write_timeout_ms: 2_000,
            gossip_frequency_ms: 100,
            gossip_peer_list_size: 10,
            gossip_peer_list_to: 5,
            max_known_addrs: 100,
            dial_gossiped_peers: false,
            max_dial_attempts: 3,
            dial_backoff_initial_ms: 50,
            dial_backoff_max_ms: 200,
            accept_backoff_max_ms: 100,
            uptime_halflife_ms: 1_000,
            uptime_max_skipped_periods: DEFAULT_UPTIME_MAX_SKIPPED_PERIODS,
            max_tracked_uptimes: 100,
            benchlist: BenchlistConfig {
                threshold: 3,
                window_ms: 1_000,
                duration_ms: 500,
                max_benched_peers: 5,
                sweep_interval_ms: 50,
            },
            throttle: ThrottleConfig {
                inbound_conn_cooldown_ms: 0,
                inbound_msgs_per_sec: 0,
                inbound_msg_burst: 0,
                outbound_msgs_per_sec: 0,
                outbound_msg_burst: 0,
            },
        }
    }

    /// Reject configurations the network cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(NetworkError::InvalidConfig(what.to_string()));
        if self.max_peers == 0 {
            return invalid("max_peers must be positive");
        }
        if self.send_queue_size == 0 {
            return invalid("send_queue_size must be positive");
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return invalid("max_message_size must fit a u32 length prefix");
        }
        if self.handshake_timeout_ms == 0 || self.dial_timeout_ms == 0 {
            return invalid("handshake and dial timeouts must be positive");
        }
        if self.write_timeout_ms == 0 {
            return invalid("write_timeout_ms must be positive");
        }
        if self.ping_frequency_ms == 0 || self.ping_frequency_ms >= self.read_timeout_ms {
            return invalid("ping_frequency_ms must be positive and below read_timeout_ms");
        }
        if self.gossip_frequency_ms == 0 {
            return invalid("gossip_frequency_ms must be positive");
        }
        if self.uptime_halflife_ms == 0 {
            return invalid("uptime_halflife_ms must be positive");
        }
        if self.max_tracked_uptimes < self.max_peers {
            return invalid("max_tracked_uptimes must be at least max_peers");
        }
        if self.benchlist.threshold == 0 || self.benchlist.sweep_interval_ms == 0 {
            return invalid("benchlist threshold and sweep interval must be positive");
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn ping_frequency(&self) -> Duration {
        Duration::from_millis(self.ping_frequency_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn gossip_frequency(&self) -> Duration {
        Duration::from_millis(self.gossip_frequency_ms)
    }

    pub fn close_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.close_flush_timeout_ms)
    }

    pub fn max_clock_difference(&self) -> Duration {
        Duration::from_millis(self.max_clock_difference_ms)
    }

    pub fn uptime_halflife(&self) -> Duration {
        Duration::from_millis(self.uptime_halflife_ms)
    }
}

impl BenchlistConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
