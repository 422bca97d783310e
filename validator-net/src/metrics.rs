//! Read-only counters and gauges exposed by the network.
//!
//! Collection is left to the embedding node: [`NetworkMetrics::snapshot`]
//! returns plain values that can be exported in any format.

use {
    serde::Serialize,
    std::sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

// ---------------------------------------------------------------------------
// Metric primitives
// ---------------------------------------------------------------------------

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A value that can go up or down.
#[derive(Debug)]
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
        }
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Network metrics
// ---------------------------------------------------------------------------

/// Metrics for one [`Network`](crate::network::Network).
#[derive(Debug)]
pub struct NetworkMetrics {
    /// Peers in the connected state.
    pub connected_peers: Gauge,
    /// Connections accepted or dialed but not yet connected.
    pub pending_peers: Gauge,
    pub handshake_failures: Counter,
    pub messages_sent: Counter,
    pub messages_received: Counter,
    /// Sends refused because the queue was full or the peer was closing.
    pub messages_dropped: Counter,
    /// Messages refused by a message throttler.
    pub messages_throttled: Counter,
    /// Inbound connections refused by the connection throttler.
    pub connections_throttled: Counter,
    pub benched_peers: Gauge,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMetrics {
    pub const fn new() -> Self {
        Self {
            connected_peers: Gauge::new("validator_net_connected_peers"),
            pending_peers: Gauge::new("validator_net_pending_peers"),
            handshake_failures: Counter::new("validator_net_handshake_failures_total"),
            messages_sent: Counter::new("validator_net_messages_sent_total"),
            messages_received: Counter::new("validator_net_messages_received_total"),
            messages_dropped: Counter::new("validator_net_messages_dropped_total"),
            messages_throttled: Counter::new("validator_net_messages_throttled_total"),
            connections_throttled: Counter::new("validator_net_connections_throttled_total"),
            benched_peers: Gauge::new("validator_net_benched_peers"),
        }
    }

    pub fn snapshot(&self) -> NetworkMetricsSnapshot {
        NetworkMetricsSnapshot {
            connected_peers: self.connected_peers.get(),
            pending_peers: self.pending_peers.get(),
            handshake_failures: self.handshake_failures.get(),
            messages_sent: self.messages_sent.get(),
            messages_received: self.messages_received.get(),
            messages_dropped: self.messages_dropped.get(),
            messages_throttled: self.messages_throttled.get(),
            connections_throttled: self.connections_throttled.get(),
            benched_peers: self.benched_peers.get(),
        }
    }
}

/// Point-in-time copy of [`NetworkMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkMetricsSnapshot {
    pub connected_peers: i64,
    pub pending_peers: i64,
    pub handshake_failures: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_throttled: u64,
    pub connections_throttled: u64,
    pub benched_peers: i64,
}
