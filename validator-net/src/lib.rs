//! TRv1 Validator Networking Layer
//!
//! Authenticated, long-lived peer connections between validators:
//!
//! - **TLS upgrade**: every raw connection is upgraded to mutually
//!   authenticated TLS; the remote [`PeerId`] is derived from its
//!   certificate key.
//! - **Version handshake**: peers exchange network id, clock and
//!   application version, and are only promoted to connected when all
//!   three are acceptable.
//! - **Peers**: each connection is driven by its own read and write loops
//!   with a bounded, FIFO outbound queue. Senders choose between blocking
//!   and dropping when the queue is full.
//! - **Policy**: capacity limits, inbound throttling, a benchlist for
//!   misbehaving peers, and half-life uptime meters per peer.
//! - **Gossip**: periodic exchange of known peer addresses.
//!
//! Decoded consensus messages are delivered to an external [`Handler`];
//! what they mean is up to the consensus engine.
//!
//! ## Architecture
//!
//! ```text
//!   Handler (consensus engine)
//!        ^ handle_message / connected / disconnected
//!        |
//!   Network ---- Benchlist, Throttlers, uptime meters, metrics
//!     |   \
//!     |    accept loop / dialer --> TLS upgrader --> Peer
//!     |                                              | read loop
//!     gossip + sweep tasks                           | write loop (queue)
//!                                                    v
//!                                   [u32-le len][bincode message]
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]    | `NetworkConfig` defaults, dev overrides, validation |
//! | [`error`]     | Crate-wide error enum and handshake classification |
//! | [`ids`]       | `PeerId` derived from certificate keys |
//! | [`version`]   | Application versions and compatibility policy |
//! | [`message`]   | Opcodes, message bodies, framing |
//! | [`transport`] | Listener/dialer seams and their TCP implementations |
//! | [`tls`]       | Certificates and the mutual TLS upgrade |
//! | [`uptime`]    | Exponentially decaying uptime meters |
//! | [`benchlist`] | Failure tracking and temporary exclusion |
//! | [`throttle`]  | Connection and message rate limits |
//! | [`metrics`]   | Counters and gauges |
//! | [`peer`]      | Per-connection actor |
//! | [`network`]   | Registry, admission policy and background tasks |

pub mod benchlist;
pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod throttle;
pub mod tls;
pub mod transport;
pub mod uptime;
pub mod version;

pub use {
    config::NetworkConfig,
    error::{HandshakeError, NetworkError, Result},
    ids::PeerId,
    message::{Message, Op},
    network::{Handler, Network},
    peer::{Peer, PeerInfo, PeerState},
    tls::TlsIdentity,
    version::{Compatibility, Version},
};
