//! Per-connection actor.
//!
//! A [`Peer`] owns one connection from accept/dial until close. It runs the
//! TLS upgrade and version handshake, then a read loop and a write loop
//! that share nothing but a cancellation token and the bounded outbound
//! queue. Lifecycle only moves forward:
//!
//! ```text
//! Connecting -> Handshaking -> Connected -> Closing -> Closed
//!      \______________\_____________________/^
//! ```
//!
//! Any state can move to `Closing`; `Closed` is reached exactly once.

use {
    crate::{
        error::{HandshakeError, NetworkError, Result},
        ids::PeerId,
        message::{read_frame, write_frame, Message, Op, VersionInfo},
        network::Shared,
        tls::SecureStream,
        transport::BoxedStream,
    },
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    serde::Serialize,
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, OnceLock, Weak,
        },
    },
    tokio::{
        io::{AsyncWriteExt, ReadHalf, WriteHalf},
        sync::{mpsc, oneshot, watch},
        time::{interval_at, timeout, Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
};

type Reader = ReadHalf<SecureStream>;
type Writer = WriteHalf<SecureStream>;

/// Receives the result of a dial once the handshake settles.
pub(crate) type DialOutcome = oneshot::Sender<Result<PeerId>>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PeerState {
    /// Raw connection established, TLS not started.
    Connecting,
    /// TLS upgrade or version exchange in progress.
    Handshaking,
    /// Registered with the network, loops running.
    Connected,
    /// Close requested, loops winding down.
    Closing,
    /// Terminal.
    Closed,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of a peer for callers outside the network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Transport address of the connection.
    pub addr: SocketAddr,
    /// Address the peer accepts connections on, from its handshake.
    pub advertised_addr: Option<SocketAddr>,
    pub version: Option<String>,
    pub direction: Direction,
    pub state: PeerState,
    /// Messages waiting in the outbound queue.
    pub queue_len: usize,
}

pub struct Peer {
    conn_id: u64,
    addr: SocketAddr,
    direction: Direction,
    id: OnceLock<PeerId>,
    remote_version: OnceLock<VersionInfo>,
    state: watch::Sender<PeerState>,
    connected: AtomicBool,
    started: AtomicBool,
    conn: Mutex<Option<BoxedStream>>,
    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
    network: Weak<Shared>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("conn_id", &self.conn_id)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("id", &self.id.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub(crate) fn new(
        conn_id: u64,
        conn: BoxedStream,
        addr: SocketAddr,
        direction: Direction,
        queue_size: usize,
        cancel: CancellationToken,
        network: Weak<Shared>,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::channel(queue_size);
        let (state, _) = watch::channel(PeerState::Connecting);
        Self {
            conn_id,
            addr,
            direction,
            id: OnceLock::new(),
            remote_version: OnceLock::new(),
            state,
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            conn: Mutex::new(Some(conn)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            cancel,
            network,
        }
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Remote identity, known once the TLS upgrade completes.
    pub fn id(&self) -> Option<PeerId> {
        self.id.get().copied()
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        self.remote_version.get().map(|v| v.ip)
    }

    pub fn queue_len(&self) -> usize {
        self.send_tx
            .max_capacity()
            .saturating_sub(self.send_tx.capacity())
    }

    pub fn info(&self) -> Option<PeerInfo> {
        Some(PeerInfo {
            id: self.id()?,
            addr: self.addr,
            advertised_addr: self.advertised_addr(),
            version: self.remote_version.get().map(|v| v.version.clone()),
            direction: self.direction,
            state: self.state(),
            queue_len: self.queue_len(),
        })
    }

    fn is_closing(&self) -> bool {
        self.state() >= PeerState::Closing
    }

    /// Move the state forward. Returns `false` if `to` is not ahead of the
    /// current state.
    fn transition(&self, to: PeerState) -> bool {
        self.state.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Queue `msg` for transmission.
    ///
    /// With `can_block` the call waits for queue space, but returns `false`
    /// as soon as the peer starts closing. Without it a full queue drops
    /// the message. Returns whether the message was queued.
    pub async fn send(&self, msg: Message, can_block: bool) -> bool {
        if self.is_closing() {
            return false;
        }
        if !can_block {
            return self.try_send(msg);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.send_tx.send(msg) => sent.is_ok(),
        }
    }

    pub(crate) fn try_send(&self, msg: Message) -> bool {
        !self.is_closing() && self.send_tx.try_send(msg).is_ok()
    }

    // ── Closing ─────────────────────────────────────────────────────────

    /// Begin closing. Unblocks pending sends and stops both loops. Safe to
    /// call any number of times from any task.
    pub fn close(&self) {
        if self.transition(PeerState::Closing) {
            debug!("closing peer {} ({})", self.display_id(), self.addr);
        }
        self.cancel.cancel();
        // Nobody will drive a peer that was never started.
        if !self.started.swap(true, Ordering::SeqCst) {
            self.conn.lock().take();
            self.finish(self.network.upgrade().as_deref());
        }
    }

    /// Wait until the peer reaches [`PeerState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == PeerState::Closed).await;
    }

    fn finish(&self, shared: Option<&Shared>) {
        self.transition(PeerState::Closing);
        if let Some(shared) = shared {
            shared.deregister(self);
            if self.connected.load(Ordering::SeqCst) {
                if let Some(id) = self.id() {
                    shared.handler.disconnected(id);
                    info!("peer {id} disconnected");
                }
            }
        }
        self.transition(PeerState::Closed);
    }

    fn display_id(&self) -> String {
        self.id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unidentified>".to_string())
    }

    // ── Driving ─────────────────────────────────────────────────────────

    /// Spawn the task that drives this peer. `outcome` receives the
    /// handshake result.
    pub(crate) fn start(self: &Arc<Self>, outcome: Option<DialOutcome>) {
        if self.started.swap(true, Ordering::SeqCst) {
            // Closed before it could start; dropping `outcome` reports that.
            return;
        }
        match self.network.upgrade() {
            Some(shared) => {
                let tracker = shared.tracker.clone();
                tracker.spawn(Arc::clone(self).run(shared, outcome));
            }
            None => {
                self.conn.lock().take();
                self.finish(None);
            }
        }
    }

    /// Mark as promoted. Called by the network under its registry lock.
    pub(crate) fn mark_connected(&self) -> bool {
        if self.transition(PeerState::Connected) {
            self.connected.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    async fn run(self: Arc<Self>, shared: Arc<Shared>, outcome: Option<DialOutcome>) {
        let established = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetworkError::Closed),
            established = self.establish(&shared) => established,
        };

        match established {
            Ok((id, reader, writer, queue)) => {
                info!("peer {id} connected ({:?}, {})", self.direction, self.addr);
                shared.handler.connected(id);
                if let Some(outcome) = outcome {
                    let _ = outcome.send(Ok(id));
                }
                self.try_send(shared.peer_list_message(Some(id)));
                tokio::join!(
                    self.read_loop(&shared, id, reader),
                    self.write_loop(&shared, writer, queue),
                );
            }
            Err(err) => {
                if !matches!(err, NetworkError::Closed) {
                    shared.metrics.handshake_failures.inc();
                    debug!("handshake with {} failed: {err}", self.addr);
                }
                if let Some(outcome) = outcome {
                    let _ = outcome.send(Err(err));
                }
            }
        }
        self.close_quietly();
        self.finish(Some(&shared));
    }

    fn close_quietly(&self) {
        self.transition(PeerState::Closing);
        self.cancel.cancel();
    }

    async fn establish(
        self: &Arc<Self>,
        shared: &Arc<Shared>,
    ) -> Result<(PeerId, Reader, Writer, mpsc::Receiver<Message>)> {
        let conn = self.conn.lock().take().ok_or(NetworkError::Closed)?;
        let queue = self.send_rx.lock().take().ok_or(NetworkError::Closed)?;
        self.transition(PeerState::Handshaking);

        let handshake_timeout = shared.config.handshake_timeout();
        let upgrader = shared.upgrader(self.direction);
        let (stream, id) = timeout(handshake_timeout, upgrader.upgrade(conn))
            .await
            .map_err(|_| NetworkError::deadline("tls upgrade", handshake_timeout))??;
        let _ = self.id.set(id);
        shared.check_identity(&id)?;

        let (mut reader, mut writer) = tokio::io::split(stream);
        let remote = timeout(
            handshake_timeout,
            exchange_versions(shared, &mut reader, &mut writer),
        )
        .await
        .map_err(|_| NetworkError::deadline("version handshake", handshake_timeout))??;
        shared.validate_version(&remote)?;
        let _ = self.remote_version.set(remote);

        shared.promote(self)?;
        Ok((id, reader, writer, queue))
    }

    async fn read_loop(&self, shared: &Arc<Shared>, id: PeerId, mut reader: Reader) {
        let max_message_size = shared.config.max_message_size;
        let read_timeout = shared.config.read_timeout();
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = timeout(read_timeout, read_frame(&mut reader, max_message_size)) => frame,
            };
            let msg = match frame {
                Ok(Ok(msg)) => msg,
                Ok(Err(err)) => {
                    debug!("read from peer {id} failed: {err}");
                    break;
                }
                Err(_) => {
                    warn!("peer {id} silent for {}ms, closing", read_timeout.as_millis());
                    break;
                }
            };
            shared.metrics.messages_received.inc();
            trace!("received {:?} from peer {id}", msg.op());

            match msg.op() {
                Op::Ping => {
                    self.try_send(Message::pong());
                }
                Op::Pong | Op::Version => {}
                Op::GetVersion => {
                    self.try_send(shared.version_message());
                }
                Op::GetPeerList => {
                    self.try_send(shared.peer_list_message(Some(id)));
                }
                Op::PeerList => {
                    if let Some(addrs) = msg.peers() {
                        shared.learn_addrs(addrs);
                    }
                }
                _ => {
                    if shared.throttlers.inbound_msgs.allow(&id) {
                        shared.handler.handle_message(id, msg);
                    } else {
                        shared.metrics.messages_throttled.inc();
                        debug!("dropped inbound {:?} from throttled peer {id}", msg.op());
                    }
                }
            }
        }
        self.close_quietly();
    }

    async fn write_loop(
        &self,
        shared: &Shared,
        mut writer: Writer,
        mut queue: mpsc::Receiver<Message>,
    ) {
        let config = &shared.config;
        let max_message_size = config.max_message_size;
        let write_timeout = config.write_timeout();
        let ping_frequency = config.ping_frequency();
        let first_ping = Instant::now()
            .checked_add(ping_frequency)
            .unwrap_or_else(Instant::now);
        let mut ping = interval_at(first_ping, ping_frequency);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = queue.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = ping.tick() => Message::ping(),
            };
            match timeout(write_timeout, write_frame(&mut writer, &msg, max_message_size)).await
            {
                Ok(Ok(())) => shared.metrics.messages_sent.inc(),
                Ok(Err(NetworkError::MessageTooLarge { size, max })) => {
                    warn!("dropping {:?} of {size} bytes (max {max})", msg.op());
                    shared.metrics.messages_dropped.inc();
                }
                Ok(Err(err)) => {
                    debug!("write to {} failed: {err}", self.addr);
                    break;
                }
                Err(_) => {
                    warn!("write to {} stalled, closing", self.addr);
                    break;
                }
            }
        }
        self.close_quietly();

        queue.close();
        if config.flush_on_close {
            let flushed = timeout(config.close_flush_timeout(), async {
                let mut count = 0usize;
                while let Ok(msg) = queue.try_recv() {
                    if write_frame(&mut writer, &msg, max_message_size).await.is_err() {
                        break;
                    }
                    count = count.saturating_add(1);
                }
                count
            })
            .await;
            if let Ok(count) = flushed {
                shared.metrics.messages_sent.add(count as u64);
            }
        }
        let dropped = queue.len();
        if dropped > 0 {
            shared.metrics.messages_dropped.add(dropped as u64);
        }
        let _ = timeout(config.close_flush_timeout(), writer.shutdown()).await;
    }
}

/// Send our version and read the peer's. The first message must be a
/// version message.
async fn exchange_versions(
    shared: &Shared,
    reader: &mut Reader,
    writer: &mut Writer,
) -> Result<VersionInfo> {
    let max_message_size = shared.config.max_message_size;
    write_frame(writer, &shared.version_message(), max_message_size).await?;
    let msg = read_frame(reader, max_message_size).await?;
    match msg.version_info() {
        Some(info) => Ok(info.clone()),
        None => Err(HandshakeError::UnexpectedMessage(msg.op()).into()),
    }
}
