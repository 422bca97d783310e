//! Raw byte-stream transport: listening and dialing.
//!
//! The network never touches sockets directly. It accepts from a
//! [`Listener`] and dials through a [`Dialer`], and hands the resulting
//! [`BoxedStream`] to the TLS upgrader. The TCP implementations are the
//! production ones; tests can substitute in-memory streams.

use {
    crate::error::{NetworkError, Result},
    async_trait::async_trait,
    log::{debug, info},
    std::{net::SocketAddr, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, TcpStream},
    },
};

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased connection handed to the upgrader.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> std::io::Result<(BoxedStream, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, failing with [`NetworkError::DeadlineExceeded`]
    /// if the connection is not established within `timeout`.
    async fn dial(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedStream>;
}

// ── TCP ─────────────────────────────────────────────────────────────────────

/// TCP [`Listener`].
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    /// Bind to `addr`. Failure is reported as [`NetworkError::Bind`].
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind { addr, source })?;
        info!("validator network listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> std::io::Result<(BoxedStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("accepted connection from {addr}");
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// TCP [`Dialer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::deadline("dial", timeout))??;
        stream.set_nodelay(true)?;
        debug!("dialed {addr}");
        Ok(Box::new(stream))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        tokio::io::{AsyncReadExt, AsyncWriteExt},
    };

    #[tokio::test]
    async fn test_listen_and_dial() {
        let listener = TcpTransportListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (dialed, accepted) = tokio::join!(
            TcpDialer.dial(addr, Duration::from_secs(2)),
            listener.accept()
        );
        let mut dialed = dialed.unwrap();
        let (mut accepted, _) = accepted.unwrap();

        dialed.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = TcpTransportListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();
        assert_matches!(
            TcpTransportListener::bind(addr).await,
            Err(NetworkError::Bind { .. })
        );
    }

    #[tokio::test]
    async fn test_dial_refused_is_not_deadline() {
        // Bind then drop to find a port nothing listens on.
        let addr = {
            let l = TcpTransportListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap();
            l.local_addr().unwrap()
        };
        let err = TcpDialer
            .dial(addr, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(!err.is_deadline_exceeded());
        assert_matches!(err, NetworkError::Transport(_));
    }
}
