//! Failure tracking and temporary exclusion of misbehaving peers.
//!
//! Every failure attributed to a peer (a timed-out query, an invalid
//! response) is recorded with its timestamp. When `threshold` failures land
//! inside the sliding `window`, the peer is benched for `duration`: it stays
//! connected, but callers should stop issuing it new requests. Benching is
//! independent of transport health.

use {
    crate::{config::BenchlistConfig, ids::PeerId},
    log::{debug, info},
    parking_lot::Mutex,
    std::{
        collections::{HashMap, VecDeque},
        time::{Duration, Instant},
    },
};

/// Per-peer failure record.
#[derive(Debug, Default)]
struct BenchEntry {
    /// Failure timestamps inside the window, oldest first.
    failures: VecDeque<Instant>,
    /// Set while the peer is benched.
    benched_until: Option<Instant>,
}

impl BenchEntry {
    fn is_benched(&self, now: Instant) -> bool {
        self.benched_until.is_some_and(|until| until > now)
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_clean(&self, now: Instant) -> bool {
        self.failures.is_empty() && !self.is_benched(now)
    }
}

/// Tracks recent failures per peer and decides exclusion.
#[derive(Debug)]
pub struct Benchlist {
    config: BenchlistConfig,
    entries: Mutex<HashMap<PeerId, BenchEntry>>,
}

impl Benchlist {
    pub fn new(config: BenchlistConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BenchlistConfig {
        &self.config
    }

    /// Record a failure. Returns `true` if this failure benched the peer.
    pub fn register_failure(&self, peer: PeerId) -> bool {
        self.register_failure_at(peer, Instant::now())
    }

    pub fn register_failure_at(&self, peer: PeerId, now: Instant) -> bool {
        let window = self.config.window();
        let mut entries = self.entries.lock();
        let benched = entries.values().filter(|e| e.is_benched(now)).count();

        let entry = entries.entry(peer).or_default();
        if entry.is_benched(now) {
            return false;
        }
        entry.prune(now, window);
        entry.failures.push_back(now);
        if entry.failures.len() < self.config.threshold {
            debug!(
                "peer {peer} failure {}/{}",
                entry.failures.len(),
                self.config.threshold
            );
            return false;
        }
        if benched >= self.config.max_benched_peers {
            let excess = entry
                .failures
                .len()
                .saturating_sub(self.config.threshold);
            entry.failures.drain(..excess);
            debug!("peer {peer} over failure threshold, but benchlist is full");
            return false;
        }

        entry.failures.clear();
        entry.benched_until = now.checked_add(self.config.duration());
        info!(
            "benched peer {peer} for {}ms",
            self.config.duration().as_millis()
        );
        true
    }

    /// A successful response wipes the peer's failure history. It does not
    /// lift an active bench.
    pub fn register_response(&self, peer: &PeerId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(peer) {
            entry.failures.clear();
            if entry.benched_until.is_none() {
                entries.remove(peer);
            }
        }
    }

    pub fn is_benched(&self, peer: &PeerId) -> bool {
        self.is_benched_at(peer, Instant::now())
    }

    pub fn is_benched_at(&self, peer: &PeerId, now: Instant) -> bool {
        self.entries
            .lock()
            .get(peer)
            .is_some_and(|entry| entry.is_benched(now))
    }

    /// Forget everything about `peer`.
    pub fn clear(&self, peer: &PeerId) {
        self.entries.lock().remove(peer);
    }

    /// Drop expired benches and stale failures. Returns the peers whose bench
    /// expired.
    pub fn sweep(&self, now: Instant) -> Vec<PeerId> {
        let window = self.config.window();
        let mut released = Vec::new();
        self.entries.lock().retain(|peer, entry| {
            if entry.benched_until.is_some_and(|until| until <= now) {
                entry.benched_until = None;
                released.push(*peer);
            }
            entry.prune(now, window);
            !entry.is_clean(now)
        });
        for peer in &released {
            info!("peer {peer} released from benchlist");
        }
        released
    }

    pub fn benched(&self) -> Vec<PeerId> {
        self.benched_at(Instant::now())
    }

    pub fn benched_at(&self, now: Instant) -> Vec<PeerId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.is_benched(now))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn benched_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_benched(now))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BenchlistConfig {
        BenchlistConfig {
            threshold: 3,
            window_ms: 1_000,
            duration_ms: 5_000,
            max_benched_peers: 2,
            sweep_interval_ms: 100,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_benched_after_threshold() {
        let benchlist = Benchlist::new(config());
        let peer = PeerId::new_unique();
        let t0 = Instant::now();

        assert!(!benchlist.register_failure_at(peer, t0));
        assert!(!benchlist.register_failure_at(peer, t0 + ms(10)));
        assert!(!benchlist.is_benched_at(&peer, t0 + ms(10)));
        assert!(benchlist.register_failure_at(peer, t0 + ms(20)));
        assert!(benchlist.is_benched_at(&peer, t0 + ms(20)));
        // Already benched: further failures do not re-bench.
        assert!(!benchlist.register_failure_at(peer, t0 + ms(30)));
    }

    #[test]
    fn test_failures_outside_window_are_forgotten() {
        let benchlist = Benchlist::new(config());
        let peer = PeerId::new_unique();
        let t0 = Instant::now();

        benchlist.register_failure_at(peer, t0);
        benchlist.register_failure_at(peer, t0 + ms(100));
        assert!(!benchlist.register_failure_at(peer, t0 + ms(1_500)));
        assert!(!benchlist.is_benched_at(&peer, t0 + ms(1_500)));
    }

    #[test]
    fn test_bench_expires() {
        let benchlist = Benchlist::new(config());
        let peer = PeerId::new_unique();
        let t0 = Instant::now();
        for i in 0..3 {
            benchlist.register_failure_at(peer, t0 + ms(i));
        }
        assert!(benchlist.is_benched_at(&peer, t0 + ms(4_000)));
        assert!(!benchlist.is_benched_at(&peer, t0 + ms(6_000)));

        assert_eq!(benchlist.sweep(t0 + ms(6_000)), vec![peer]);
        assert!(benchlist.entries.lock().is_empty());
    }

    #[test]
    fn test_response_clears_failures() {
        let benchlist = Benchlist::new(config());
        let peer = PeerId::new_unique();
        let t0 = Instant::now();
        benchlist.register_failure_at(peer, t0);
        benchlist.register_failure_at(peer, t0 + ms(1));
        benchlist.register_response(&peer);
        assert!(!benchlist.register_failure_at(peer, t0 + ms(2)));
        assert!(!benchlist.is_benched_at(&peer, t0 + ms(2)));
    }

    #[test]
    fn test_max_benched_peers() {
        let benchlist = Benchlist::new(config());
        let t0 = Instant::now();
        let peers: Vec<_> = (0..3).map(|_| PeerId::new_unique()).collect();
        for peer in &peers {
            for i in 0..3 {
                benchlist.register_failure_at(*peer, t0 + ms(i));
            }
        }
        assert!(benchlist.is_benched_at(&peers[0], t0 + ms(5)));
        assert!(benchlist.is_benched_at(&peers[1], t0 + ms(5)));
        assert!(!benchlist.is_benched_at(&peers[2], t0 + ms(5)));
        assert_eq!(benchlist.benched_at(t0 + ms(5)).len(), 2);
    }

    #[test]
    fn test_full_benchlist_bounds_failure_history() {
        let benchlist = Benchlist::new(config());
        let t0 = Instant::now();
        for _ in 0..2 {
            let peer = PeerId::new_unique();
            for i in 0..3 {
                benchlist.register_failure_at(peer, t0 + ms(i));
            }
        }
        let unlucky = PeerId::new_unique();
        for i in 0..100 {
            assert!(!benchlist.register_failure_at(unlucky, t0 + ms(i)));
        }
        assert_eq!(benchlist.entries.lock()[&unlucky].failures.len(), 3);

        // Once slots free up, a fresh run of failures benches it.
        assert_eq!(benchlist.sweep(t0 + ms(5_500)).len(), 2);
        let benched = (0..3)
            .map(|i| benchlist.register_failure_at(unlucky, t0 + ms(5_500 + i)))
            .last();
        assert_eq!(benched, Some(true));
    }

    #[test]
    fn test_sweep_drops_stale_failures() {
        let benchlist = Benchlist::new(config());
        let peer = PeerId::new_unique();
        let t0 = Instant::now();
        benchlist.register_failure_at(peer, t0);
        assert!(benchlist.sweep(t0 + ms(2_000)).is_empty());
        assert!(benchlist.entries.lock().is_empty());
    }
}
