//! Mutually authenticated TLS upgrade of raw connections.
//!
//! Every node holds a self-signed certificate. There is no CA: a peer is
//! identified by its public key, so the verifiers accept any well-formed,
//! currently valid certificate, check the handshake signature against it,
//! and leave identity checks to the network layer. Both sides must present
//! a certificate.

use {
    crate::{
        error::{HandshakeError, NetworkError, Result},
        ids::PeerId,
        transport::BoxedStream,
    },
    async_trait::async_trait,
    log::debug,
    rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
        server::danger::{ClientCertVerified, ClientCertVerifier},
        CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
        SignatureScheme,
    },
    std::sync::Arc,
    tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream},
};

/// Name placed in generated certificates and sent as SNI. Never verified.
pub const TLS_SERVER_NAME: &str = "trv1-validator";

/// An upgraded, authenticated connection.
pub type SecureStream = TlsStream<BoxedStream>;

/// Extract the [`PeerId`] of a DER-encoded X.509 certificate.
pub fn peer_id_from_cert(cert: &CertificateDer<'_>) -> Result<PeerId> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| NetworkError::Certificate(e.to_string()))?;
    Ok(PeerId::from_public_key_der(parsed.public_key().raw))
}

// ── Identity ────────────────────────────────────────────────────────────────

/// Certificate and private key this node authenticates with.
#[derive(Clone)]
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key_pkcs8: Vec<u8>,
    peer_id: PeerId,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Generate a fresh self-signed identity.
    pub fn generate() -> Result<Self> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()])
                .map_err(|e| NetworkError::Certificate(e.to_string()))?;
        Self::from_der(cert.der().clone(), key_pair.serialize_der())
    }

    /// Load an identity from a DER certificate and a PKCS#8 DER key.
    pub fn from_der(cert: CertificateDer<'static>, key_pkcs8: Vec<u8>) -> Result<Self> {
        let peer_id = peer_id_from_cert(&cert)?;
        Ok(Self {
            cert,
            key_pkcs8,
            peer_id,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn cert(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()))
    }
}

// ── Upgraders ───────────────────────────────────────────────────────────────

/// Turns a raw connection into an authenticated one.
#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Run the TLS handshake and return the stream together with the
    /// remote identity.
    async fn upgrade(&self, conn: BoxedStream) -> Result<(SecureStream, PeerId)>;
}

/// Server side of the upgrade, used for accepted connections.
pub struct TlsServerUpgrader {
    acceptor: TlsAcceptor,
}

impl TlsServerUpgrader {
    pub fn new(identity: &TlsIdentity) -> Result<Self> {
        let provider = crypto_provider();
        let config = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(PeerCertVerifier { provider }))
            .with_single_cert(vec![identity.cert.clone()], identity.key())?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Upgrader for TlsServerUpgrader {
    async fn upgrade(&self, conn: BoxedStream) -> Result<(SecureStream, PeerId)> {
        let stream = self.acceptor.accept(conn).await.map_err(tls_error)?;
        let peer_id = remote_peer_id(stream.get_ref().1.peer_certificates())?;
        debug!("accepted tls session from {peer_id}");
        Ok((TlsStream::Server(stream), peer_id))
    }
}

/// Client side of the upgrade, used for dialed connections.
pub struct TlsClientUpgrader {
    connector: TlsConnector,
}

impl TlsClientUpgrader {
    pub fn new(identity: &TlsIdentity) -> Result<Self> {
        let provider = crypto_provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerCertVerifier { provider }))
            .with_client_auth_cert(vec![identity.cert.clone()], identity.key())?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Upgrader for TlsClientUpgrader {
    async fn upgrade(&self, conn: BoxedStream) -> Result<(SecureStream, PeerId)> {
        let server_name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| NetworkError::Certificate(e.to_string()))?;
        let stream = self
            .connector
            .connect(server_name, conn)
            .await
            .map_err(tls_error)?;
        let peer_id = remote_peer_id(stream.get_ref().1.peer_certificates())?;
        debug!("established tls session with {peer_id}");
        Ok((TlsStream::Client(stream), peer_id))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn remote_peer_id(certs: Option<&[CertificateDer<'static>]>) -> Result<PeerId> {
    let leaf = certs
        .and_then(|certs| certs.first())
        .ok_or(HandshakeError::NoCertificate)?;
    peer_id_from_cert(leaf)
}

/// tokio-rustls reports handshake failures as I/O errors wrapping the
/// rustls error.
fn tls_error(err: std::io::Error) -> NetworkError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => NetworkError::Tls(tls.clone()),
        None => NetworkError::Transport(err),
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Accepts any well-formed, unexpired certificate and verifies handshake
/// signatures against it. Used on both sides of the connection.
#[derive(Debug)]
struct PeerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl PeerCertVerifier {
    fn check_cert(&self, cert: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        if !parsed.validity().is_valid() {
            return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
        }
        Ok(())
    }

    fn tls12(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check_cert(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ClientCertVerifier for PeerCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check_cert(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        tokio::io::{AsyncReadExt, AsyncWriteExt},
    };

    #[test]
    fn test_identity_peer_id_is_stable() {
        let identity = TlsIdentity::generate().unwrap();
        assert_eq!(
            peer_id_from_cert(identity.cert()).unwrap(),
            identity.peer_id()
        );
        assert_ne!(
            TlsIdentity::generate().unwrap().peer_id(),
            identity.peer_id()
        );
    }

    #[test]
    fn test_garbage_certificate_rejected() {
        let err = peer_id_from_cert(&CertificateDer::from(vec![1u8, 2, 3])).unwrap_err();
        assert!(matches!(err, NetworkError::Certificate(_)));
    }

    #[tokio::test]
    async fn test_mutual_upgrade_exchanges_identities() {
        let server_id = TlsIdentity::generate().unwrap();
        let client_id = TlsIdentity::generate().unwrap();
        let server = TlsServerUpgrader::new(&server_id).unwrap();
        let client = TlsClientUpgrader::new(&client_id).unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (server_side, client_side) = tokio::join!(
            server.upgrade(Box::new(a)),
            client.upgrade(Box::new(b))
        );
        let (mut server_stream, seen_by_server) = server_side.unwrap();
        let (mut client_stream, seen_by_client) = client_side.unwrap();
        assert_eq!(seen_by_server, client_id.peer_id());
        assert_eq!(seen_by_client, server_id.peer_id());

        client_stream.write_all(b"ping").await.unwrap();
        client_stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
