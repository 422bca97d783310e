//! Peer identities.
//!
//! A [`PeerId`] is the SHA-256 digest of the DER-encoded
//! `SubjectPublicKeyInfo` of the peer's TLS certificate. It is bound to the
//! key, not to the transport address, so a peer keeps its identity across
//! reconnects and address changes, and re-issuing a certificate for the same
//! key does not change it.

use {
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{fmt, str::FromStr},
};

/// Length of a [`PeerId`] in bytes.
pub const PEER_ID_BYTES: usize = 32;

/// Stable identifier of a remote node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    pub const fn new(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier from a DER-encoded `SubjectPublicKeyInfo`.
    pub fn from_public_key_der(spki_der: &[u8]) -> Self {
        Self(Sha256::digest(spki_der).into())
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// A unique id for tests; never derived from a real key.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn new_unique() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::from_public_key_der(&n.to_le_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Error returned when parsing a base58 [`PeerId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParsePeerIdError {
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("expected {PEER_ID_BYTES} bytes, got {0}")]
    Length(usize),
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ParsePeerIdError::Base58(e.to_string()))?;
        let bytes: [u8; PEER_ID_BYTES] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| ParsePeerIdError::Length(v.len()))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = PeerId::from_public_key_der(b"spki");
        let b = PeerId::from_public_key_der(b"spki");
        let c = PeerId::from_public_key_der(b"other spki");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_parse() {
        let id = PeerId::new_unique();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let short = bs58::encode([1u8; 4]).into_string();
        assert_eq!(
            short.parse::<PeerId>(),
            Err(ParsePeerIdError::Length(4))
        );
        assert!(matches!(
            "0OIl".parse::<PeerId>(),
            Err(ParsePeerIdError::Base58(_))
        ));
    }
}
