//! Message types and framing for validator network communication.
//!
//! A [`Message`] is an [`Op`] plus the fields that opcode carries. It is
//! serialized once, at construction, with bincode; the encoded bytes are
//! shared by every clone so the same message can be queued to many peers
//! without copying.
//!
//! ## Wire format
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode (Op, MessageBody)]
//! ```
//!
//! Readers reject frames whose declared length exceeds the configured
//! `max_message_size` before allocating the payload.

use {
    crate::error::{NetworkError, Result},
    bytes::Bytes,
    serde::{Deserialize, Serialize},
    std::{net::SocketAddr, sync::Arc},
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// 32-byte identifier used for chains and containers.
pub type Id = [u8; 32];

// ── Opcodes ─────────────────────────────────────────────────────────────────

/// Protocol operation. The discriminants are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Op {
    // Handshake
    GetVersion = 0,
    Version = 1,
    GetPeerList = 2,
    PeerList = 3,
    Ping = 4,
    Pong = 5,
    // Bootstrapping
    GetAcceptedFrontier = 6,
    AcceptedFrontier = 7,
    GetAccepted = 8,
    Accepted = 9,
    GetAncestors = 10,
    MultiPut = 11,
    // Consensus
    Get = 12,
    Put = 13,
    PushQuery = 14,
    PullQuery = 15,
    Chits = 16,
}

impl Op {
    /// Opcodes consumed by the transport itself.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            Self::GetVersion
                | Self::Version
                | Self::GetPeerList
                | Self::PeerList
                | Self::Ping
                | Self::Pong
        )
    }

    /// Opcodes delivered to the external handler.
    pub fn is_consensus(self) -> bool {
        !self.is_network()
    }

    /// Consensus opcodes that ask the remote for work. Benched peers are not
    /// sent these.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::GetAcceptedFrontier
                | Self::GetAccepted
                | Self::GetAncestors
                | Self::Get
                | Self::PushQuery
                | Self::PullQuery
        )
    }

    fn accepts(self, body: &MessageBody) -> bool {
        match body {
            MessageBody::Empty => matches!(
                self,
                Self::GetVersion | Self::GetPeerList | Self::Ping | Self::Pong
            ),
            MessageBody::Version(_) => self == Self::Version,
            MessageBody::PeerList(_) => self == Self::PeerList,
            MessageBody::Consensus(_) => self.is_consensus(),
        }
    }
}

// ── Fields ──────────────────────────────────────────────────────────────────

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Network the sender belongs to.
    pub network_id: u32,
    /// Sender wall-clock time, unix milliseconds.
    pub my_time_ms: u64,
    /// Address the sender accepts connections on.
    pub ip: SocketAddr,
    /// Application version, `"<app>/<major>.<minor>.<patch>"`.
    pub version: String,
}

/// Fields shared by the bootstrapping and consensus opcodes. Their meaning
/// belongs to the consensus engine; the transport only carries them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusFields {
    pub chain_id: Id,
    pub request_id: u32,
    /// Unix nanoseconds after which the sender stops waiting; zero for
    /// responses.
    pub deadline_ns: u64,
    pub container_ids: Vec<Id>,
    pub containers: Vec<Vec<u8>>,
}

/// Field set carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Empty,
    Version(VersionInfo),
    PeerList(Vec<SocketAddr>),
    Consensus(ConsensusFields),
}

// ── Message ─────────────────────────────────────────────────────────────────

/// An immutable, pre-serialized protocol message. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Message {
    op: Op,
    body: Arc<MessageBody>,
    bytes: Bytes,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Message {}

impl Message {
    /// Build and serialize a message. Fails when `body` is not the field set
    /// `op` carries.
    pub fn new(op: Op, body: MessageBody) -> Result<Self> {
        if !op.accepts(&body) {
            return Err(NetworkError::InvalidMessage(format!(
                "{op:?} cannot carry {}",
                body_kind(&body)
            )));
        }
        let bytes = bincode::serialize(&(op, &body))?;
        Ok(Self {
            op,
            body: Arc::new(body),
            bytes: Bytes::from(bytes),
        })
    }

    /// Decode a frame payload.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let (op, body): (Op, MessageBody) = bincode::deserialize(&bytes)?;
        if !op.accepts(&body) {
            return Err(NetworkError::InvalidMessage(format!(
                "{op:?} arrived with {}",
                body_kind(&body)
            )));
        }
        Ok(Self {
            op,
            body: Arc::new(body),
            bytes,
        })
    }

    pub fn version(info: VersionInfo) -> Self {
        Self::infallible(Op::Version, MessageBody::Version(info))
    }

    pub fn get_version() -> Self {
        Self::infallible(Op::GetVersion, MessageBody::Empty)
    }

    pub fn peer_list(peers: Vec<SocketAddr>) -> Self {
        Self::infallible(Op::PeerList, MessageBody::PeerList(peers))
    }

    pub fn get_peer_list() -> Self {
        Self::infallible(Op::GetPeerList, MessageBody::Empty)
    }

    pub fn ping() -> Self {
        Self::infallible(Op::Ping, MessageBody::Empty)
    }

    pub fn pong() -> Self {
        Self::infallible(Op::Pong, MessageBody::Empty)
    }

    /// Wrap consensus fields under a consensus opcode.
    pub fn consensus(op: Op, fields: ConsensusFields) -> Result<Self> {
        Self::new(op, MessageBody::Consensus(fields))
    }

    // The constructors above pair each opcode with its own body, and bincode
    // cannot fail on these types.
    fn infallible(op: Op, body: MessageBody) -> Self {
        let bytes = bincode::serialize(&(op, &body)).unwrap_or_default();
        Self {
            op,
            body: Arc::new(body),
            bytes: Bytes::from(bytes),
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// The serialized payload (without the length prefix).
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn version_info(&self) -> Option<&VersionInfo> {
        match self.body() {
            MessageBody::Version(info) => Some(info),
            _ => None,
        }
    }

    pub fn peers(&self) -> Option<&[SocketAddr]> {
        match self.body() {
            MessageBody::PeerList(peers) => Some(peers),
            _ => None,
        }
    }

    pub fn consensus_fields(&self) -> Option<&ConsensusFields> {
        match self.body() {
            MessageBody::Consensus(fields) => Some(fields),
            _ => None,
        }
    }
}

fn body_kind(body: &MessageBody) -> &'static str {
    match body {
        MessageBody::Empty => "no fields",
        MessageBody::Version(_) => "version fields",
        MessageBody::PeerList(_) => "a peer list",
        MessageBody::Consensus(_) => "consensus fields",
    }
}

// ── Framing ─────────────────────────────────────────────────────────────────

/// Read the length prefix from a 4-byte buffer.
pub fn read_frame_len(header: &[u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_le_bytes(*header) as usize
}

/// Write one length-prefixed message and flush.
pub async fn write_frame<W>(writer: &mut W, msg: &Message, max_message_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = msg.bytes().len();
    if len > max_message_size {
        return Err(NetworkError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }
    let header = u32::try_from(len)
        .map_err(|_| NetworkError::MessageTooLarge {
            size: len,
            max: u32::MAX as usize,
        })?
        .to_le_bytes();
    writer.write_all(&header).await?;
    writer.write_all(msg.bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = read_frame_len(&header);
    if len > max_message_size {
        return Err(NetworkError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Message::decode(Bytes::from(payload))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn version_info() -> VersionInfo {
        VersionInfo {
            network_id: 5,
            my_time_ms: 1_700_000_000_000,
            ip: SocketAddr::from(([10, 0, 0, 1], 9651)),
            version: "trv1/1.0.0".to_string(),
        }
    }

    #[test]
    fn test_decode_matches_encoded() {
        let msg = Message::version(version_info());
        let decoded = Message::decode(msg.bytes().clone()).unwrap();
        assert_eq!(decoded.op(), Op::Version);
        assert_eq!(decoded.version_info(), Some(&version_info()));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_op_body_mismatch_rejected() {
        assert_matches!(
            Message::new(Op::Ping, MessageBody::PeerList(vec![])),
            Err(NetworkError::InvalidMessage(_))
        );
        assert_matches!(
            Message::consensus(Op::Pong, ConsensusFields::default()),
            Err(NetworkError::InvalidMessage(_))
        );
        assert!(Message::consensus(Op::PushQuery, ConsensusFields::default()).is_ok());
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let bytes = bincode::serialize(&(Op::Version, MessageBody::Empty)).unwrap();
        assert_matches!(
            Message::decode(Bytes::from(bytes)),
            Err(NetworkError::InvalidMessage(_))
        );
        assert_matches!(
            Message::decode(Bytes::from_static(&[0xff, 0xff])),
            Err(NetworkError::Serialization(_))
        );
    }

    #[test]
    fn test_op_classes() {
        assert!(Op::Ping.is_network());
        assert!(Op::Chits.is_consensus());
        assert!(Op::PullQuery.is_request());
        assert!(!Op::Chits.is_request());
        assert!(!Op::PeerList.is_request());
    }

    #[test]
    fn test_clones_share_bytes() {
        let msg = Message::peer_list(vec![SocketAddr::from(([127, 0, 0, 1], 1))]);
        let clone = msg.clone();
        assert_eq!(msg.bytes().as_ptr(), clone.bytes().as_ptr());
    }

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msgs = [Message::ping(), Message::get_peer_list(), Message::pong()];
        for msg in &msgs {
            write_frame(&mut a, msg, 1024).await.unwrap();
        }
        for msg in &msgs {
            assert_eq!(&read_frame(&mut b, 1024).await.unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(10_000u32).to_le_bytes()).await.unwrap();
        assert_matches!(
            read_frame(&mut b, 1_000).await,
            Err(NetworkError::MessageTooLarge { size: 10_000, max: 1_000 })
        );
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_message() {
        let (mut a, _b) = tokio::io::duplex(64);
        let msg = Message::consensus(
            Op::Put,
            ConsensusFields {
                containers: vec![vec![0u8; 512]],
                ..ConsensusFields::default()
            },
        )
        .unwrap();
        assert_matches!(
            write_frame(&mut a, &msg, 128).await,
            Err(NetworkError::MessageTooLarge { .. })
        );
    }
}
