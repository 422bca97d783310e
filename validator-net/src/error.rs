//! Error types for the validator networking layer.

use {
    crate::{ids::PeerId, message::Op},
    std::net::{IpAddr, SocketAddr},
    thiserror::Error,
};

/// Reasons a peer is not promoted to connected after the TLS upgrade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The remote end completed TLS without presenting a certificate.
    #[error("peer presented no certificate")]
    NoCertificate,

    /// The remote end is on a different network.
    #[error("network id mismatch: local {local}, remote {remote}")]
    NetworkMismatch {
        /// Our network id.
        local: u32,
        /// The id the peer advertised.
        remote: u32,
    },

    /// The remote application version is below our minimum.
    #[error("incompatible version: local {local}, remote {remote}")]
    IncompatibleVersion {
        /// Our application version.
        local: String,
        /// The version the peer advertised.
        remote: String,
    },

    /// The advertised version string could not be parsed.
    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),

    /// The peer's clock is too far from ours.
    #[error("clock skew of {skew_ms}ms exceeds {max_ms}ms")]
    ClockSkew {
        /// Observed difference.
        skew_ms: u64,
        /// Configured maximum.
        max_ms: u64,
    },

    /// The first message after the TLS upgrade was not a version message.
    #[error("expected version message, got {0:?}")]
    UnexpectedMessage(Op),
}

/// Errors that can occur in the validator networking layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer sent a frame that does not decode to a valid message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// TLS configuration or protocol failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A certificate could not be generated or parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The version exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// A dial or handshake did not complete within its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    DeadlineExceeded {
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// Maximum peer count has been reached.
    #[error("maximum peers reached: {0}")]
    MaxPeersReached(usize),

    /// The peer is already connected.
    #[error("peer already connected: {0}")]
    AlreadyConnected(PeerId),

    /// The remote identity is our own.
    #[error("connected to self")]
    SelfConnection,

    /// The peer is on the benchlist.
    #[error("peer is benched: {0}")]
    Benched(PeerId),

    /// An inbound connection was rejected by the connection throttler.
    #[error("connection from {0} throttled")]
    Throttled(IpAddr),

    /// The peer is not known to the network.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The peer or network is closing or closed.
    #[error("closed")]
    Closed,

    /// The listener could not be bound at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration was rejected by [`NetworkConfig::validate`].
    ///
    /// [`NetworkConfig::validate`]: crate::config::NetworkConfig::validate
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NetworkError {
    /// Whether the operation failed because its deadline elapsed, as opposed
    /// to failing outright.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Whether the failure happened while negotiating a connection.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_)
                | Self::Tls(_)
                | Self::Certificate(_)
                | Self::SelfConnection
                | Self::AlreadyConnected(_)
                | Self::Benched(_)
                | Self::MaxPeersReached(_)
        )
    }

    pub(crate) fn deadline(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::DeadlineExceeded {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Convenience result type for networking operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[test]
    fn test_deadline_classification() {
        let err = NetworkError::deadline("dial", Duration::from_millis(1_500));
        assert!(err.is_deadline_exceeded());
        assert!(!err.is_handshake());
        assert_eq!(err.to_string(), "dial timed out after 1500ms");
    }

    #[test]
    fn test_handshake_classification() {
        let err = NetworkError::from(HandshakeError::NetworkMismatch {
            local: 1,
            remote: 2,
        });
        assert!(err.is_handshake());
        assert!(!err.is_deadline_exceeded());

        let io = NetworkError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!io.is_handshake());
    }
}
