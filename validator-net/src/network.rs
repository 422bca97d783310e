//! The peer registry and its background tasks.
//!
//! A [`Network`] owns the listener and the dialer, keeps the set of live
//! peers, and enforces admission policy: capacity, self-connections,
//! duplicate identities, benched peers and inbound throttling. It also runs
//! peer-list gossip and the benchlist sweep.
//!
//! The registry is a single mutex. Every critical section is short and no
//! I/O happens while it is held.

use {
    crate::{
        benchlist::Benchlist,
        config::NetworkConfig,
        error::{HandshakeError, NetworkError, Result},
        ids::PeerId,
        message::{Message, VersionInfo},
        metrics::{NetworkMetrics, NetworkMetricsSnapshot},
        peer::{Direction, Peer, PeerInfo},
        throttle::Throttlers,
        tls::{TlsClientUpgrader, TlsIdentity, TlsServerUpgrader, Upgrader},
        transport::{BoxedStream, Dialer, Listener, TcpDialer, TcpTransportListener},
        uptime::{IntervalMeter, Meter},
        version::{Compatibility, Version, VersionCheck},
    },
    log::{debug, info, warn},
    parking_lot::Mutex,
    rand::seq::IndexedRandom,
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
    tokio::sync::oneshot,
    tokio_util::{sync::CancellationToken, task::TaskTracker},
};

/// First delay after a failed accept.
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);

/// Consumer of decoded consensus messages.
///
/// `handle_message` runs on the peer's read task: calls for one peer are
/// sequential and in arrival order, calls for different peers may run
/// concurrently. Implementations should hand work off rather than block.
pub trait Handler: Send + Sync + 'static {
    fn handle_message(&self, peer: PeerId, msg: Message);

    /// A peer completed the handshake.
    fn connected(&self, _peer: PeerId) {}

    /// A connected peer closed. Called once per `connected`.
    fn disconnected(&self, _peer: PeerId) {}
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    closed: bool,
    /// Accepted or dialed, not yet connected. Keyed by connection id.
    pending: HashMap<u64, Arc<Peer>>,
    connected: HashMap<PeerId, Arc<Peer>>,
    uptimes: HashMap<PeerId, IntervalMeter>,
    known_addrs: HashSet<SocketAddr>,
    /// Addresses with a tracked dial in flight.
    dialing: HashSet<SocketAddr>,
    /// Peers live at shutdown. The listener is held until they close.
    draining: Vec<Arc<Peer>>,
}

impl Registry {
    fn peer_count(&self) -> usize {
        self.pending.len().saturating_add(self.connected.len())
    }

    fn is_connected_to(&self, addr: SocketAddr) -> bool {
        self.connected
            .values()
            .any(|peer| peer.addr() == addr || peer.advertised_addr() == Some(addr))
    }

    /// Drop the meters of disconnected peers that have decayed to zero.
    /// Returns how many were dropped.
    fn prune_uptimes(&mut self, now: Instant) -> usize {
        let before = self.uptimes.len();
        self.uptimes
            .retain(|_, meter| meter.is_running() || meter.read(now) > 0.0);
        before.saturating_sub(self.uptimes.len())
    }

    /// Evict the lowest meter of a disconnected peer, if there is one.
    fn evict_uptime(&mut self, now: Instant) -> Option<PeerId> {
        let lowest = self
            .uptimes
            .iter_mut()
            .filter(|(_, meter)| !meter.is_running())
            .map(|(id, meter)| (*id, meter.read(now)))
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(id, _)| id)?;
        self.uptimes.remove(&lowest);
        Some(lowest)
    }
}

// ── Shared state ────────────────────────────────────────────────────────────

/// State shared by the network handle, its background tasks and its peers.
pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    local_id: PeerId,
    local_addr: SocketAddr,
    advertised_addr: SocketAddr,
    compatibility: Compatibility,
    server_upgrader: Box<dyn Upgrader>,
    client_upgrader: Box<dyn Upgrader>,
    dialer: Box<dyn Dialer>,
    pub(crate) handler: Arc<dyn Handler>,
    benchlist: Benchlist,
    pub(crate) throttlers: Throttlers,
    pub(crate) metrics: NetworkMetrics,
    registry: Mutex<Registry>,
    next_conn_id: AtomicU64,
    pub(crate) tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn upgrader(&self, direction: Direction) -> &dyn Upgrader {
        match direction {
            Direction::Inbound => self.server_upgrader.as_ref(),
            Direction::Outbound => self.client_upgrader.as_ref(),
        }
    }

    fn update_peer_gauges(&self, registry: &Registry) {
        self.metrics
            .connected_peers
            .set(i64::try_from(registry.connected.len()).unwrap_or(i64::MAX));
        self.metrics
            .pending_peers
            .set(i64::try_from(registry.pending.len()).unwrap_or(i64::MAX));
    }

    /// Register a raw connection as a pending peer.
    pub(crate) fn new_peer(
        self: &Arc<Self>,
        conn: BoxedStream,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<Arc<Peer>> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(NetworkError::Closed);
        }
        if registry.peer_count() >= self.config.max_peers {
            return Err(NetworkError::MaxPeersReached(self.config.max_peers));
        }
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer::new(
            conn_id,
            conn,
            addr,
            direction,
            self.config.send_queue_size,
            self.cancel.child_token(),
            Arc::downgrade(self),
        ));
        registry.pending.insert(conn_id, Arc::clone(&peer));
        self.update_peer_gauges(&registry);
        Ok(peer)
    }

    /// Reject identities that must not be connected, before the version
    /// exchange.
    pub(crate) fn check_identity(&self, id: &PeerId) -> Result<()> {
        if *id == self.local_id {
            return Err(NetworkError::SelfConnection);
        }
        if self.benchlist.is_benched(id) {
            return Err(NetworkError::Benched(*id));
        }
        if self.registry.lock().connected.contains_key(id) {
            return Err(NetworkError::AlreadyConnected(*id));
        }
        Ok(())
    }

    pub(crate) fn version_message(&self) -> Message {
        Message::version(VersionInfo {
            network_id: self.config.network_id,
            my_time_ms: unix_time_ms(),
            ip: self.advertised_addr,
            version: self.compatibility.current().to_string(),
        })
    }

    pub(crate) fn validate_version(&self, remote: &VersionInfo) -> Result<()> {
        if remote.network_id != self.config.network_id {
            return Err(HandshakeError::NetworkMismatch {
                local: self.config.network_id,
                remote: remote.network_id,
            }
            .into());
        }
        let version: Version = remote
            .version
            .parse()
            .map_err(|_| HandshakeError::InvalidVersion(remote.version.clone()))?;
        match self.compatibility.check(&version) {
            VersionCheck::Compatible => {}
            VersionCheck::Deprecated => {
                warn!(
                    "peer at {} runs deprecated version {version}",
                    remote.ip
                );
            }
            VersionCheck::Incompatible => {
                return Err(HandshakeError::IncompatibleVersion {
                    local: self.compatibility.current().to_string(),
                    remote: remote.version.clone(),
                }
                .into());
            }
        }
        let skew_ms = unix_time_ms().abs_diff(remote.my_time_ms);
        if skew_ms > self.config.max_clock_difference_ms {
            return Err(HandshakeError::ClockSkew {
                skew_ms,
                max_ms: self.config.max_clock_difference_ms,
            }
            .into());
        }
        Ok(())
    }

    /// Move a handshaken peer from pending to connected.
    pub(crate) fn promote(&self, peer: &Arc<Peer>) -> Result<()> {
        let id = peer.id().ok_or(NetworkError::Closed)?;
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(NetworkError::Closed);
        }
        if registry.connected.contains_key(&id) {
            return Err(NetworkError::AlreadyConnected(id));
        }
        if !peer.mark_connected() {
            return Err(NetworkError::Closed);
        }
        registry.pending.remove(&peer.conn_id());
        registry.connected.insert(id, Arc::clone(peer));

        let now = Instant::now();
        if !registry.uptimes.contains_key(&id)
            && registry.uptimes.len() >= self.config.max_tracked_uptimes
        {
            if let Some(evicted) = registry.evict_uptime(now) {
                debug!("evicted uptime of {evicted} to track {id}");
            }
        }
        let (halflife, max_skipped) = (
            self.config.uptime_halflife(),
            self.config.uptime_max_skipped_periods,
        );
        registry
            .uptimes
            .entry(id)
            .or_insert_with(|| IntervalMeter::with_max_skipped_periods(halflife, max_skipped))
            .start(now);

        if let Some(addr) = peer.advertised_addr() {
            if registry.known_addrs.len() < self.config.max_known_addrs {
                registry.known_addrs.insert(addr);
            }
        }
        self.update_peer_gauges(&registry);
        Ok(())
    }

    /// Remove a finished peer from the registry.
    pub(crate) fn deregister(&self, peer: &Peer) {
        let released = {
            let mut registry = self.registry.lock();
            registry.pending.remove(&peer.conn_id());
            let released = peer.id().filter(|id| {
                registry
                    .connected
                    .get(id)
                    .is_some_and(|current| current.conn_id() == peer.conn_id())
            });
            if let Some(id) = released {
                registry.connected.remove(&id);
                if let Some(meter) = registry.uptimes.get_mut(&id) {
                    meter.stop(Instant::now());
                }
            }
            self.update_peer_gauges(&registry);
            released
        };
        if let Some(id) = released {
            self.throttlers.inbound_msgs.release(&id);
            self.throttlers.outbound_msgs.release(&id);
        }
    }

    fn connected_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.registry.lock().connected.get(id).cloned()
    }

    fn sample_connected(&self, count: usize) -> Vec<Arc<Peer>> {
        let peers: Vec<_> = self.registry.lock().connected.values().cloned().collect();
        peers
            .choose_multiple(&mut rand::rng(), count)
            .cloned()
            .collect()
    }

    /// A sample of addresses we know, excluding `recipient`'s own.
    pub(crate) fn peer_list_message(&self, recipient: Option<PeerId>) -> Message {
        let addrs: Vec<SocketAddr> = {
            let registry = self.registry.lock();
            let excluded = recipient
                .and_then(|id| registry.connected.get(&id))
                .and_then(|peer| peer.advertised_addr());
            let mut addrs: HashSet<SocketAddr> = registry
                .connected
                .values()
                .filter_map(|peer| peer.advertised_addr())
                .collect();
            addrs.extend(registry.known_addrs.iter().copied());
            addrs
                .into_iter()
                .filter(|addr| Some(*addr) != excluded)
                .collect()
        };
        let sample = addrs
            .choose_multiple(&mut rand::rng(), self.config.gossip_peer_list_size)
            .copied()
            .collect();
        Message::peer_list(sample)
    }

    /// Remember gossiped addresses, and dial the new ones if configured.
    pub(crate) fn learn_addrs(self: &Arc<Self>, addrs: &[SocketAddr]) {
        let fresh: Vec<SocketAddr> = {
            let mut registry = self.registry.lock();
            let mut fresh = Vec::new();
            for addr in addrs {
                if *addr == self.advertised_addr
                    || addr.ip().is_unspecified()
                    || addr.port() == 0
                {
                    continue;
                }
                if registry.known_addrs.len() >= self.config.max_known_addrs {
                    break;
                }
                if registry.known_addrs.insert(*addr) {
                    fresh.push(*addr);
                }
            }
            fresh
        };
        if !fresh.is_empty() {
            debug!("learned {} new peer addresses", fresh.len());
        }
        if self.config.dial_gossiped_peers {
            for addr in fresh {
                self.track(addr);
            }
        }
    }

    async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId> {
        {
            let registry = self.registry.lock();
            if registry.closed {
                return Err(NetworkError::Closed);
            }
            if registry.peer_count() >= self.config.max_peers {
                return Err(NetworkError::MaxPeersReached(self.config.max_peers));
            }
        }
        let conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetworkError::Closed),
            conn = self.dialer.dial(addr, self.config.dial_timeout()) => conn,
        }?;
        let peer = self.new_peer(conn, addr, Direction::Outbound)?;
        let (outcome, result) = oneshot::channel();
        peer.start(Some(outcome));
        result.await.unwrap_or(Err(NetworkError::Closed))
    }

    /// Keep dialing `addr` with bounded exponential backoff until it
    /// connects, fails a handshake, or runs out of attempts.
    fn track(self: &Arc<Self>, addr: SocketAddr) {
        {
            let mut registry = self.registry.lock();
            if registry.closed || registry.is_connected_to(addr) || !registry.dialing.insert(addr)
            {
                return;
            }
        }
        let shared = Arc::clone(self);
        self.tracker.spawn(async move {
            shared.dial_with_backoff(addr).await;
            shared.registry.lock().dialing.remove(&addr);
        });
    }

    async fn dial_with_backoff(self: &Arc<Self>, addr: SocketAddr) {
        let max_backoff = Duration::from_millis(self.config.dial_backoff_max_ms);
        let mut backoff = Duration::from_millis(self.config.dial_backoff_initial_ms);
        for attempt in 1..=self.config.max_dial_attempts {
            if self.registry.lock().is_connected_to(addr) {
                return;
            }
            match self.dial(addr).await {
                Ok(id) => {
                    debug!("tracked dial to {addr} connected to {id}");
                    return;
                }
                Err(err) if err.is_handshake() || matches!(err, NetworkError::Closed) => {
                    debug!("not retrying {addr}: {err}");
                    return;
                }
                Err(err) => {
                    debug!(
                        "dial {attempt}/{} to {addr} failed: {err}",
                        self.config.max_dial_attempts
                    );
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
        info!("giving up on {addr} after {} attempts", self.config.max_dial_attempts);
    }

    /// Mark closed and close every peer. Returns the peers that were live.
    fn shutdown(&self) -> Vec<Arc<Peer>> {
        let peers: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            let live: Vec<_> = registry
                .pending
                .values()
                .chain(registry.connected.values())
                .cloned()
                .collect();
            registry.draining.extend(live.iter().cloned());
            live
        };
        self.cancel.cancel();
        for peer in &peers {
            peer.close();
        }
        peers
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

// ── Background tasks ────────────────────────────────────────────────────────

async fn accept_loop(shared: Arc<Shared>, listener: Box<dyn Listener>) {
    let max_backoff = Duration::from_millis(shared.config.accept_backoff_max_ms);
    let mut backoff = Duration::ZERO;
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, addr)) => {
                backoff = Duration::ZERO;
                if !shared.throttlers.inbound_conns.allow(addr.ip()) {
                    shared.metrics.connections_throttled.inc();
                    debug!("{}", NetworkError::Throttled(addr.ip()));
                    continue;
                }
                match shared.new_peer(conn, addr, Direction::Inbound) {
                    Ok(peer) => peer.start(None),
                    Err(err) => debug!("rejected inbound connection from {addr}: {err}"),
                }
            }
            Err(err) => {
                backoff = if backoff.is_zero() {
                    ACCEPT_BACKOFF_INITIAL
                } else {
                    backoff.saturating_mul(2)
                }
                .min(max_backoff);
                warn!("accept failed: {err}, retrying in {}ms", backoff.as_millis());
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    let draining = std::mem::take(&mut shared.registry.lock().draining);
    for peer in draining {
        peer.closed().await;
    }
    drop(listener);
    debug!("accept loop stopped");
}

async fn gossip_loop(shared: Arc<Shared>) {
    let frequency = shared.config.gossip_frequency();
    let mut ticker = tokio::time::interval(frequency);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for peer in shared.sample_connected(shared.config.gossip_peer_list_to) {
            let msg = shared.peer_list_message(peer.id());
            if !peer.try_send(msg) {
                debug!("skipped gossip to {:?}: queue full", peer.id());
            }
        }
    }
}

async fn sweep_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.benchlist.sweep_interval());
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        shared.benchlist.sweep(now);
        let pruned = shared.registry.lock().prune_uptimes(now);
        if pruned > 0 {
            debug!("dropped {pruned} decayed uptime meters");
        }
        shared.metrics.benched_peers.set(
            i64::try_from(shared.benchlist.benched_count()).unwrap_or(i64::MAX),
        );
        shared.throttlers.inbound_conns.prune();
    }
}

// ── Network ─────────────────────────────────────────────────────────────────

/// Handle to a running validator network.
///
/// Dropping the handle stops accepting and closes every peer without
/// waiting; [`Network::close`] does the same and waits for all of it.
pub struct Network {
    shared: Arc<Shared>,
}

impl Network {
    /// Bind a TCP listener on `config.bind_addr` and start the network.
    pub async fn bind(
        config: NetworkConfig,
        identity: &TlsIdentity,
        compatibility: Compatibility,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpTransportListener::bind(config.bind_addr).await?;
        Self::with_transport(
            config,
            identity,
            compatibility,
            handler,
            Box::new(listener),
            Box::new(TcpDialer),
        )
    }

    /// Start the network on an existing listener and dialer. Must be called
    /// from within a Tokio runtime.
    pub fn with_transport(
        config: NetworkConfig,
        identity: &TlsIdentity,
        compatibility: Compatibility,
        handler: Arc<dyn Handler>,
        listener: Box<dyn Listener>,
        dialer: Box<dyn Dialer>,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = listener.local_addr()?;
        let advertised_addr = config.advertised_addr.unwrap_or(local_addr);
        let shared = Arc::new(Shared {
            local_id: identity.peer_id(),
            local_addr,
            advertised_addr,
            compatibility,
            server_upgrader: Box::new(TlsServerUpgrader::new(identity)?),
            client_upgrader: Box::new(TlsClientUpgrader::new(identity)?),
            dialer,
            handler,
            benchlist: Benchlist::new(config.benchlist.clone()),
            throttlers: Throttlers::from_config(&config.throttle),
            metrics: NetworkMetrics::new(),
            registry: Mutex::new(Registry::default()),
            next_conn_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            config,
        });

        shared
            .tracker
            .spawn(accept_loop(Arc::clone(&shared), listener));
        shared.tracker.spawn(gossip_loop(Arc::clone(&shared)));
        shared.tracker.spawn(sweep_loop(Arc::clone(&shared)));

        info!(
            "validator network {} started on {local_addr} (network id {})",
            shared.local_id, shared.config.network_id
        );
        Ok(Self { shared })
    }

    pub fn id(&self) -> PeerId {
        self.shared.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        self.shared.advertised_addr
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    /// Connect to `addr` and wait for the handshake to settle.
    ///
    /// Fails with [`NetworkError::DeadlineExceeded`] if the TCP connect,
    /// TLS upgrade or version exchange does not finish in time, and with a
    /// handshake classification if the peer is rejected.
    pub async fn dial(&self, addr: SocketAddr) -> Result<PeerId> {
        self.shared.dial(addr).await
    }

    /// Dial `addr` in the background, retrying transient failures.
    pub fn track(&self, addr: SocketAddr) {
        self.shared.track(addr);
    }

    /// Queue `msg` to a connected peer.
    ///
    /// Returns `Ok(false)` when the message was dropped by backpressure or
    /// the outbound throttler. Requests to a benched peer are refused.
    pub async fn send(&self, peer_id: &PeerId, msg: Message, can_block: bool) -> Result<bool> {
        let peer = self
            .shared
            .connected_peer(peer_id)
            .ok_or(NetworkError::UnknownPeer(*peer_id))?;
        if msg.op().is_request() && self.shared.benchlist.is_benched(peer_id) {
            return Err(NetworkError::Benched(*peer_id));
        }
        if msg.op().is_consensus() && !self.shared.throttlers.outbound_msgs.allow(peer_id) {
            self.shared.metrics.messages_throttled.inc();
            return Ok(false);
        }
        let sent = peer.send(msg, can_block).await;
        if !sent {
            self.shared.metrics.messages_dropped.inc();
        }
        Ok(sent)
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .registry
            .lock()
            .connected
            .values()
            .filter_map(|peer| peer.info())
            .collect()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.shared
            .connected_peer(peer_id)
            .and_then(|peer| peer.info())
    }

    pub fn peer_count(&self) -> usize {
        self.shared.registry.lock().connected.len()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.shared.registry.lock().connected.contains_key(peer_id)
    }

    /// Close one connected peer.
    pub fn disconnect(&self, peer_id: &PeerId) -> Result<()> {
        let peer = self
            .shared
            .connected_peer(peer_id)
            .ok_or(NetworkError::UnknownPeer(*peer_id))?;
        peer.close();
        Ok(())
    }

    /// Record a failure attributed to `peer_id`. Returns `true` if the peer
    /// was benched by it.
    pub fn register_failure(&self, peer_id: &PeerId) -> bool {
        let benched = self.shared.benchlist.register_failure(*peer_id);
        if benched {
            self.shared.metrics.benched_peers.inc();
        }
        benched
    }

    pub fn register_response(&self, peer_id: &PeerId) {
        self.shared.benchlist.register_response(peer_id);
    }

    pub fn is_benched(&self, peer_id: &PeerId) -> bool {
        self.shared.benchlist.is_benched(peer_id)
    }

    /// Lift a bench early and forget the peer's failures.
    pub fn unbench(&self, peer_id: &PeerId) {
        self.shared.benchlist.clear(peer_id);
        self.shared.metrics.benched_peers.set(
            i64::try_from(self.shared.benchlist.benched_count()).unwrap_or(i64::MAX),
        );
    }

    /// Up to `k` random connected peers that are not benched.
    pub fn query_targets(&self, k: usize) -> Vec<PeerId> {
        let candidates: Vec<PeerId> = {
            let registry = self.shared.registry.lock();
            registry.connected.keys().copied().collect()
        };
        let candidates: Vec<PeerId> = candidates
            .into_iter()
            .filter(|id| !self.shared.benchlist.is_benched(id))
            .collect();
        candidates
            .choose_multiple(&mut rand::rng(), k)
            .copied()
            .collect()
    }

    /// Current uptime estimate for a peer that has ever connected.
    pub fn uptime(&self, peer_id: &PeerId) -> Option<f64> {
        self.shared
            .registry
            .lock()
            .uptimes
            .get_mut(peer_id)
            .map(|meter| meter.read(Instant::now()))
    }

    pub fn metrics(&self) -> NetworkMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stop accepting, close every peer and wait for all tasks to exit.
    /// The listener is released only after every peer reports closed.
    /// Idempotent.
    pub async fn close(&self) {
        let peers = self.shared.shutdown();
        for peer in peers {
            peer.closed().await;
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!("validator network {} closed", self.shared.local_id);
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shared.shutdown();
        self.shared.tracker.close();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            message::{ConsensusFields, Op},
            peer::PeerState,
            version::APPLICATION_NAME,
        },
        assert_matches::assert_matches,
        std::sync::atomic::AtomicUsize,
    };

    #[derive(Default)]
    struct CountingHandler {
        messages: AtomicUsize,
    }

    impl Handler for CountingHandler {
        fn handle_message(&self, _peer: PeerId, _msg: Message) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn compatibility() -> Compatibility {
        let v = Version::new(APPLICATION_NAME, 1, 0, 0);
        Compatibility::new(v.clone(), v)
    }

    async fn network(config: NetworkConfig) -> Network {
        let identity = TlsIdentity::generate().unwrap();
        Network::bind(
            config,
            &identity,
            compatibility(),
            Arc::new(CountingHandler::default()),
        )
        .await
        .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..250 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 5s");
    }

    fn remote_version(network_id: u32, version: &str) -> VersionInfo {
        VersionInfo {
            network_id,
            my_time_ms: unix_time_ms(),
            ip: SocketAddr::from(([127, 0, 0, 1], 9651)),
            version: version.to_string(),
        }
    }

    #[tokio::test]
    async fn test_peer_close_races_network_close() {
        let remote = network(NetworkConfig::dev_default()).await;
        let local = network(NetworkConfig::dev_default()).await;

        let conn = tokio::net::TcpStream::connect(remote.local_addr())
            .await
            .unwrap();
        let peer = local
            .shared
            .new_peer(Box::new(conn), remote.local_addr(), Direction::Outbound)
            .unwrap();
        let msg = Message::consensus(Op::Get, ConsensusFields::default()).unwrap();
        assert!(peer.send(msg, true).await);

        tokio::join!(local.close(), async { peer.close() });
        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(local.peer_count(), 0);
        remote.close().await;
    }

    #[tokio::test]
    async fn test_validate_version() {
        let net = network(NetworkConfig::dev_default()).await;
        let id = net.config().network_id;
        let shared = &net.shared;

        shared.validate_version(&remote_version(id, "trv1/1.0.0")).unwrap();
        shared.validate_version(&remote_version(id, "trv1/1.2.0")).unwrap();
        assert_matches!(
            shared.validate_version(&remote_version(id + 1, "trv1/1.0.0")),
            Err(NetworkError::Handshake(HandshakeError::NetworkMismatch { .. }))
        );
        assert_matches!(
            shared.validate_version(&remote_version(id, "trv1/0.9.0")),
            Err(NetworkError::Handshake(HandshakeError::IncompatibleVersion { .. }))
        );
        assert_matches!(
            shared.validate_version(&remote_version(id, "garbage")),
            Err(NetworkError::Handshake(HandshakeError::InvalidVersion(_)))
        );

        let mut skewed = remote_version(id, "trv1/1.0.0");
        skewed.my_time_ms = skewed.my_time_ms.saturating_sub(10 * 60 * 1_000);
        assert_matches!(
            shared.validate_version(&skewed),
            Err(NetworkError::Handshake(HandshakeError::ClockSkew { .. }))
        );
        net.close().await;
    }

    #[tokio::test]
    async fn test_self_identity_rejected() {
        let net = network(NetworkConfig::dev_default()).await;
        assert_matches!(
            net.shared.check_identity(&net.id()),
            Err(NetworkError::SelfConnection)
        );
        assert!(net.shared.check_identity(&PeerId::new_unique()).is_ok());
        net.close().await;
    }

    #[tokio::test]
    async fn test_capacity_counts_pending_peers() {
        let config = NetworkConfig {
            max_peers: 1,
            ..NetworkConfig::dev_default()
        };
        let net = network(config).await;
        let (a, _a) = tokio::io::duplex(64);
        let (b, _b) = tokio::io::duplex(64);
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let first = net
            .shared
            .new_peer(Box::new(a), addr, Direction::Inbound)
            .unwrap();
        assert_matches!(
            net.shared.new_peer(Box::new(b), addr, Direction::Inbound),
            Err(NetworkError::MaxPeersReached(1))
        );
        first.close();
        assert_eq!(net.metrics().pending_peers, 0);
        net.close().await;
    }

    #[tokio::test]
    async fn test_learn_addrs_is_bounded() {
        let config = NetworkConfig {
            max_known_addrs: 3,
            ..NetworkConfig::dev_default()
        };
        let net = network(config).await;
        let addrs: Vec<SocketAddr> = (1..=10)
            .map(|port| SocketAddr::from(([10, 0, 0, 1], port)))
            .chain([
                SocketAddr::from(([0, 0, 0, 0], 5)),
                net.advertised_addr(),
            ])
            .collect();
        net.shared.learn_addrs(&addrs);
        assert_eq!(net.shared.registry.lock().known_addrs.len(), 3);

        let list = net.shared.peer_list_message(None);
        assert_eq!(list.peers().unwrap().len(), 3);
        net.close().await;
    }

    #[test]
    fn test_prune_uptimes_drops_decayed_meters() {
        let halflife = Duration::from_secs(1);
        let t0 = Instant::now();
        let mut registry = Registry::default();
        let (gone, online) = (PeerId::new_unique(), PeerId::new_unique());
        for id in [gone, online] {
            let mut meter = IntervalMeter::new(halflife);
            meter.start(t0);
            registry.uptimes.insert(id, meter);
        }
        registry
            .uptimes
            .get_mut(&gone)
            .unwrap()
            .stop(t0 + halflife);

        // Still decaying.
        assert_eq!(registry.prune_uptimes(t0 + 2 * halflife), 0);
        // Past the skip ceiling a stopped meter reads exactly zero.
        assert_eq!(registry.prune_uptimes(t0 + 100 * halflife), 1);
        assert!(!registry.uptimes.contains_key(&gone));
        assert!(registry.uptimes.contains_key(&online));
    }

    #[test]
    fn test_evict_uptime_prefers_lowest_disconnected() {
        let halflife = Duration::from_secs(1);
        let t0 = Instant::now();
        let mut registry = Registry::default();
        let (brief, steady, online) = (
            PeerId::new_unique(),
            PeerId::new_unique(),
            PeerId::new_unique(),
        );
        for (id, stop_after) in [(brief, Some(1u32)), (steady, Some(4)), (online, None)] {
            let mut meter = IntervalMeter::new(halflife);
            meter.start(t0);
            if let Some(secs) = stop_after {
                meter.stop(t0 + secs * halflife);
            }
            registry.uptimes.insert(id, meter);
        }

        let now = t0 + 5 * halflife;
        assert_eq!(registry.evict_uptime(now), Some(brief));
        assert_eq!(registry.evict_uptime(now), Some(steady));
        // Running meters are never evicted.
        assert_eq!(registry.evict_uptime(now), None);
        assert!(registry.uptimes.contains_key(&online));
    }

    #[tokio::test]
    async fn test_uptimes_capped_across_reconnecting_identities() {
        let config = NetworkConfig {
            max_peers: 2,
            max_tracked_uptimes: 2,
            ..NetworkConfig::dev_default()
        };
        let hub = network(config).await;
        for _ in 0..5 {
            let spoke = network(NetworkConfig::dev_default()).await;
            let hub_id = spoke.dial(hub.local_addr()).await.unwrap();
            assert_eq!(hub_id, hub.id());
            spoke.close().await;
            wait_for(|| hub.peer_count() == 0).await;
        }
        assert!(hub.shared.registry.lock().uptimes.len() <= 2);
        hub.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_every_peer_then_releases_listener() {
        let hub = network(NetworkConfig::dev_default()).await;
        let mut spokes = Vec::new();
        for _ in 0..3 {
            let spoke = network(NetworkConfig::dev_default()).await;
            spoke.dial(hub.local_addr()).await.unwrap();
            spokes.push(spoke);
        }
        wait_for(|| hub.peer_count() == 3).await;
        let peers: Vec<Arc<Peer>> = hub
            .shared
            .registry
            .lock()
            .connected
            .values()
            .cloned()
            .collect();

        hub.close().await;
        assert_eq!(peers.len(), 3);
        assert!(peers.iter().all(|peer| peer.state() == PeerState::Closed));
        assert!(hub.shared.registry.lock().draining.is_empty());
        // The listening socket is gone once close returns.
        TcpTransportListener::bind(hub.local_addr()).await.unwrap();

        for spoke in spokes {
            spoke.close().await;
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let net = network(NetworkConfig::dev_default()).await;
        net.close().await;
        net.close().await;
        assert_matches!(
            net.dial(SocketAddr::from(([127, 0, 0, 1], 1))).await,
            Err(NetworkError::Closed)
        );
    }
}
