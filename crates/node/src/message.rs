//! Binary wire messages.
//!
//! Every message starts with the shared header `{magic, version range, type,
//! flags}` and is self-delimited. The transport that moves them is injected
//! through [`MessageSender`]; the node core only defines the codecs and the
//! handlers.

use std::net::SocketAddr;
use strand_types::{
    Account, Amount, Block, BlockHash, BootstrapError, CodecError, Signature, StreamReader,
    StreamWriter, U256, U512,
};

/// Protocol magic, first two bytes of every message.
pub const MAGIC: [u8; 2] = *b"SR";
/// Current protocol version.
pub const VERSION: u8 = 1;
/// Oldest version this node still speaks.
pub const VERSION_MIN: u8 = 1;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid = 0,
    Handshake = 1,
    Keeplive = 2,
    Publish = 3,
    Confirm = 4,
    Query = 5,
    Fork = 6,
    Conflict = 7,
    Relay = 8,
    Weight = 9,
    Bootstrap = 10,
    Crosschain = 11,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Handshake,
            2 => Self::Keeplive,
            3 => Self::Publish,
            4 => Self::Confirm,
            5 => Self::Query,
            6 => Self::Fork,
            7 => Self::Conflict,
            8 => Self::Relay,
            9 => Self::Weight,
            10 => Self::Bootstrap,
            11 => Self::Crosschain,
            _ => return None,
        })
    }
}

/// Header flag bits.
pub mod flags {
    pub const ACK: u16 = 1 << 0;
    pub const RELAY: u16 = 1 << 1;
    pub const PROXY: u16 = 1 << 2;
    pub const CONFIRM: u16 = 1 << 3;
}

/// The shared message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub version_min: u8,
    pub message_type: MessageType,
    pub flags: u16,
}

impl MessageHeader {
    pub fn new(message_type: MessageType) -> Self {
        MessageHeader {
            version: VERSION,
            version_min: VERSION_MIN,
            message_type,
            flags: 0,
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_bytes(&MAGIC);
        w.write_u8(self.version);
        w.write_u8(self.version_min);
        w.write_u8(self.message_type as u8);
        w.write_u16(self.flags);
    }

    pub const SIZE: usize = 2 + 1 + 1 + 1 + 2;

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, CodecError> {
        let magic = r.read_array::<2>()?;
        if magic != MAGIC {
            return Err(CodecError::Stream);
        }
        let version = r.read_u8()?;
        let version_min = r.read_u8()?;
        let message_type = MessageType::from_u8(r.read_u8()?).ok_or(CodecError::Stream)?;
        let flags = r.read_u16()?;
        Ok(MessageHeader {
            version,
            version_min,
            message_type,
            flags,
        })
    }
}

/// What a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryBy {
    Hash = 1,
    Height = 2,
    Previous = 3,
}

impl QueryBy {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Hash,
            2 => Self::Height,
            3 => Self::Previous,
            _ => return None,
        })
    }
}

/// Server-side answer status of a query ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending = 0,
    Success = 1,
    Miss = 2,
    Pruned = 3,
    Fork = 4,
    Timeout = 5,
}

impl QueryStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Pending,
            1 => Self::Success,
            2 => Self::Miss,
            3 => Self::Pruned,
            4 => Self::Fork,
            5 => Self::Timeout,
            _ => return None,
        })
    }
}

/// Bootstrap pull modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Full = 1,
    Light = 2,
    Fork = 3,
}

impl BootstrapMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Full,
            2 => Self::Light,
            3 => Self::Fork,
            _ => return None,
        })
    }
}

/// Challenge/response binding a peer endpoint to an account identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub header: MessageHeader,
    pub timestamp: u64,
    pub account: Account,
    /// Request carries the 256-bit cookie; response signs the peer's cookie.
    pub cookie: U256,
    pub signature: Signature,
}

impl HandshakeMessage {
    pub fn request(timestamp: u64, account: Account, cookie: U256) -> Self {
        HandshakeMessage {
            header: MessageHeader::new(MessageType::Handshake),
            timestamp,
            account,
            cookie,
            signature: U512::ZERO,
        }
    }

    pub fn response(timestamp: u64, account: Account, signature: Signature) -> Self {
        let mut header = MessageHeader::new(MessageType::Handshake);
        header.set_flag(flags::ACK);
        HandshakeMessage {
            header,
            timestamp,
            account,
            cookie: U256::ZERO,
            signature,
        }
    }

    pub fn is_request(&self) -> bool {
        !self.header.has_flag(flags::ACK)
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_u64(self.timestamp);
        w.write_bytes(self.account.as_bytes());
        if self.is_request() {
            w.write_bytes(self.cookie.as_bytes());
        } else {
            w.write_bytes(self.signature.as_bytes());
        }
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        let timestamp = r.read_u64()?;
        let account = U256(r.read_array::<32>()?);
        let mut message = HandshakeMessage {
            header,
            timestamp,
            account,
            cookie: U256::ZERO,
            signature: U512::ZERO,
        };
        if message.is_request() {
            message.cookie = U256(r.read_array::<32>()?);
        } else {
            message.signature = U512(r.read_array::<64>()?);
        }
        Ok(message)
    }
}

/// Periodic liveness probe carrying a sample of known peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepliveMessage {
    pub header: MessageHeader,
    pub timestamp: u64,
    pub account: Account,
    pub peers: Vec<(Account, SocketAddr)>,
}

fn write_endpoint(w: &mut StreamWriter, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            w.write_bytes(&v4.ip().octets());
            w.write_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            // The wire format is v4-only; mapped addresses are truncated.
            let octets = v6.ip().to_ipv4_mapped().unwrap_or_else(|| [0, 0, 0, 0].into());
            w.write_bytes(&octets.octets());
            w.write_u16(v6.port());
        }
    }
}

fn read_endpoint(r: &mut StreamReader) -> Result<SocketAddr, CodecError> {
    let octets = r.read_array::<4>()?;
    let port = r.read_u16()?;
    Ok(SocketAddr::from((octets, port)))
}

impl KeepliveMessage {
    pub const MAX_PEERS: usize = 8;

    pub fn new(timestamp: u64, account: Account, peers: Vec<(Account, SocketAddr)>) -> Self {
        KeepliveMessage {
            header: MessageHeader::new(MessageType::Keeplive),
            timestamp,
            account,
            peers,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_u64(self.timestamp);
        w.write_bytes(self.account.as_bytes());
        w.write_u8(self.peers.len().min(Self::MAX_PEERS) as u8);
        for (account, endpoint) in self.peers.iter().take(Self::MAX_PEERS) {
            w.write_bytes(account.as_bytes());
            write_endpoint(w, endpoint);
        }
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        let timestamp = r.read_u64()?;
        let account = U256(r.read_array::<32>()?);
        let count = r.read_u8()? as usize;
        if count > Self::MAX_PEERS {
            return Err(CodecError::Stream);
        }
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            let peer = U256(r.read_array::<32>()?);
            let endpoint = read_endpoint(r)?;
            peers.push((peer, endpoint));
        }
        Ok(KeepliveMessage {
            header,
            timestamp,
            account,
            peers,
        })
    }
}

/// A freshly produced block, gossiped through the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub header: MessageHeader,
    /// Publisher account when a confirm is requested.
    pub account: Account,
    pub block: Block,
}

impl PublishMessage {
    pub fn new(block: Block) -> Self {
        PublishMessage {
            header: MessageHeader::new(MessageType::Publish),
            account: U256::ZERO,
            block,
        }
    }

    pub fn with_confirm(account: Account, block: Block) -> Self {
        let mut header = MessageHeader::new(MessageType::Publish);
        header.set_flag(flags::CONFIRM);
        PublishMessage {
            header,
            account,
            block,
        }
    }

    pub fn need_confirm(&self) -> bool {
        self.header.has_flag(flags::CONFIRM)
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        if self.need_confirm() {
            w.write_bytes(self.account.as_bytes());
        }
        self.block.serialize(w);
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        let account = if header.has_flag(flags::CONFIRM) {
            U256(r.read_array::<32>()?)
        } else {
            U256::ZERO
        };
        let block = Block::deserialize(r).map_err(|_| CodecError::Stream)?;
        Ok(PublishMessage {
            header,
            account,
            block,
        })
    }
}

/// A representative's signed vote on a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmMessage {
    pub header: MessageHeader,
    pub representative: Account,
    pub timestamp: u64,
    pub signature: Signature,
    pub block: Block,
}

impl ConfirmMessage {
    pub fn new(representative: Account, timestamp: u64, signature: Signature, block: Block) -> Self {
        ConfirmMessage {
            header: MessageHeader::new(MessageType::Confirm),
            representative,
            timestamp,
            signature,
            block,
        }
    }

    /// The digest a representative signs: timestamp ‖ block hash.
    pub fn vote_hash(timestamp: u64, block_hash: &BlockHash) -> BlockHash {
        let mut w = StreamWriter::with_capacity(8 + 32);
        w.write_u64(timestamp);
        w.write_bytes(block_hash.as_bytes());
        strand_types::block::hash_bytes(w.as_slice())
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_bytes(self.representative.as_bytes());
        w.write_u64(self.timestamp);
        w.write_bytes(self.signature.as_bytes());
        self.block.serialize(w);
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        Ok(ConfirmMessage {
            header,
            representative: U256(r.read_array::<32>()?),
            timestamp: r.read_u64()?,
            signature: U512(r.read_array::<64>()?),
            block: Block::deserialize(r).map_err(|_| CodecError::Stream)?,
        })
    }
}

/// Block lookup request and its ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub header: MessageHeader,
    pub sequence: u64,
    pub by: QueryBy,
    pub status: QueryStatus,
    pub account: Account,
    pub height: u64,
    pub hash: BlockHash,
    pub block: Option<Block>,
}

impl QueryMessage {
    pub fn request(sequence: u64, by: QueryBy, account: Account, height: u64, hash: BlockHash) -> Self {
        QueryMessage {
            header: MessageHeader::new(MessageType::Query),
            sequence,
            by,
            status: QueryStatus::Pending,
            account,
            height,
            hash,
            block: None,
        }
    }

    pub fn ack_of(request: &QueryMessage, status: QueryStatus, block: Option<Block>) -> Self {
        let mut header = request.header;
        header.clear_flag(flags::RELAY);
        header.set_flag(flags::ACK);
        QueryMessage {
            header,
            sequence: request.sequence,
            by: request.by,
            status,
            account: request.account,
            height: request.height,
            hash: request.hash,
            block,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.header.has_flag(flags::ACK)
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_u64(self.sequence);
        w.write_u8(self.by as u8);
        w.write_u8(self.status as u8);
        w.write_bytes(self.account.as_bytes());
        w.write_u64(self.height);
        w.write_bytes(self.hash.as_bytes());
        match &self.block {
            Some(block) => {
                w.write_u8(1);
                block.serialize(w);
            }
            None => w.write_u8(0),
        }
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        let sequence = r.read_u64()?;
        let by = QueryBy::from_u8(r.read_u8()?).ok_or(CodecError::Stream)?;
        let status = QueryStatus::from_u8(r.read_u8()?).ok_or(CodecError::Stream)?;
        let account = U256(r.read_array::<32>()?);
        let height = r.read_u64()?;
        let hash = U256(r.read_array::<32>()?);
        let block = match r.read_u8()? {
            0 => None,
            1 => Some(Block::deserialize(r).map_err(|_| CodecError::Stream)?),
            _ => return Err(CodecError::Stream),
        };
        Ok(QueryMessage {
            header,
            sequence,
            by,
            status,
            account,
            height,
            hash,
            block,
        })
    }
}

/// Two competing blocks for the same (account, height).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkMessage {
    pub header: MessageHeader,
    pub first: Block,
    pub second: Block,
}

impl ForkMessage {
    pub fn new(first: Block, second: Block) -> Self {
        ForkMessage {
            header: MessageHeader::new(MessageType::Fork),
            first,
            second,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        self.first.serialize(w);
        self.second.serialize(w);
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        Ok(ForkMessage {
            header,
            first: Block::deserialize(r).map_err(|_| CodecError::Stream)?,
            second: Block::deserialize(r).map_err(|_| CodecError::Stream)?,
        })
    }
}

/// Proof of a representative voting twice at one (account, height). Both
/// signed votes travel together so any peer can verify the misbehavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMessage {
    pub header: MessageHeader,
    pub representative: Account,
    pub timestamp_first: u64,
    pub timestamp_second: u64,
    pub signature_first: Signature,
    pub signature_second: Signature,
    pub block_first: Block,
    pub block_second: Block,
}

impl ConflictMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        representative: Account,
        timestamp_first: u64,
        timestamp_second: u64,
        signature_first: Signature,
        signature_second: Signature,
        block_first: Block,
        block_second: Block,
    ) -> Self {
        ConflictMessage {
            header: MessageHeader::new(MessageType::Conflict),
            representative,
            timestamp_first,
            timestamp_second,
            signature_first,
            signature_second,
            block_first,
            block_second,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_bytes(self.representative.as_bytes());
        w.write_u64(self.timestamp_first);
        w.write_u64(self.timestamp_second);
        w.write_bytes(self.signature_first.as_bytes());
        w.write_bytes(self.signature_second.as_bytes());
        self.block_first.serialize(w);
        self.block_second.serialize(w);
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        Ok(ConflictMessage {
            header,
            representative: U256(r.read_array::<32>()?),
            timestamp_first: r.read_u64()?,
            timestamp_second: r.read_u64()?,
            signature_first: U512(r.read_array::<64>()?),
            signature_second: U512(r.read_array::<64>()?),
            block_first: Block::deserialize(r).map_err(|_| CodecError::Stream)?,
            block_second: Block::deserialize(r).map_err(|_| CodecError::Stream)?,
        })
    }
}

/// Representative weight query and ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightMessage {
    pub header: MessageHeader,
    pub representative: Account,
    pub epoch: u64,
    pub weight: Amount,
    pub replier: Account,
}

impl WeightMessage {
    pub fn request(representative: Account, epoch: u64) -> Self {
        WeightMessage {
            header: MessageHeader::new(MessageType::Weight),
            representative,
            epoch,
            weight: Amount::ZERO,
            replier: U256::ZERO,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_bytes(self.representative.as_bytes());
        w.write_u64(self.epoch);
        w.write_u128(self.weight.0);
        w.write_bytes(self.replier.as_bytes());
    }

    pub fn deserialize(r: &mut StreamReader, header: MessageHeader) -> Result<Self, CodecError> {
        Ok(WeightMessage {
            header,
            representative: U256(r.read_array::<32>()?),
            epoch: r.read_u64()?,
            weight: Amount(r.read_u128()?),
            replier: U256(r.read_array::<32>()?),
        })
    }
}

/// Bootstrap pull request: mode, cursor and batch cap. `max_size = 0` is the
/// pause/resume heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapMessage {
    pub header: MessageHeader,
    pub mode: BootstrapMode,
    pub start: Account,
    pub height: u64,
    pub max_size: u16,
}

impl BootstrapMessage {
    pub const SIZE: usize = MessageHeader::SIZE + 1 + 32 + 8 + 2;

    pub fn new(mode: BootstrapMode, start: Account, height: u64, max_size: u16) -> Self {
        BootstrapMessage {
            header: MessageHeader::new(MessageType::Bootstrap),
            mode,
            start,
            height,
            max_size,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.header.serialize(w);
        w.write_u8(self.mode as u8);
        w.write_bytes(self.start.as_bytes());
        w.write_u64(self.height);
        w.write_u16(self.max_size);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = StreamWriter::with_capacity(Self::SIZE);
        self.serialize(&mut w);
        w.into_vec()
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, BootstrapError> {
        let mut r = StreamReader::new(bytes);
        let header = MessageHeader::deserialize(&mut r).map_err(|_| BootstrapError::Stream)?;
        if header.message_type != MessageType::Bootstrap {
            return Err(BootstrapError::MessageType);
        }
        let mode = BootstrapMode::from_u8(r.read_u8().map_err(|_| BootstrapError::Stream)?)
            .ok_or(BootstrapError::Mode)?;
        let start = U256(r.read_array::<32>().map_err(|_| BootstrapError::Stream)?);
        let height = r.read_u64().map_err(|_| BootstrapError::Stream)?;
        let max_size = r.read_u16().map_err(|_| BootstrapError::Stream)?;
        if !r.at_end() {
            return Err(BootstrapError::Stream);
        }
        Ok(BootstrapMessage {
            header,
            mode,
            start,
            height,
            max_size,
        })
    }
}

/// Any outbound message, for the injected transport.
#[derive(Debug, Clone)]
pub enum Message {
    Handshake(HandshakeMessage),
    Keeplive(KeepliveMessage),
    Publish(PublishMessage),
    Confirm(ConfirmMessage),
    Query(QueryMessage),
    Fork(ForkMessage),
    Conflict(ConflictMessage),
    Weight(WeightMessage),
    Bootstrap(BootstrapMessage),
    /// Opaque payload for the credential subsystems; relayed, never parsed.
    Crosschain(Vec<u8>),
}

impl Message {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = StreamWriter::new();
        match self {
            Message::Handshake(m) => m.serialize(&mut w),
            Message::Keeplive(m) => m.serialize(&mut w),
            Message::Publish(m) => m.serialize(&mut w),
            Message::Confirm(m) => m.serialize(&mut w),
            Message::Query(m) => m.serialize(&mut w),
            Message::Fork(m) => m.serialize(&mut w),
            Message::Conflict(m) => m.serialize(&mut w),
            Message::Weight(m) => m.serialize(&mut w),
            Message::Bootstrap(m) => m.serialize(&mut w),
            Message::Crosschain(payload) => {
                let mut header = MessageHeader::new(MessageType::Crosschain);
                header.set_flag(flags::RELAY);
                header.serialize(&mut w);
                w.write_bytes(payload);
            }
        }
        w.into_vec()
    }

    /// Parses one message from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = StreamReader::new(bytes);
        let header = MessageHeader::deserialize(&mut r)?;
        Ok(match header.message_type {
            MessageType::Handshake => Message::Handshake(HandshakeMessage::deserialize(&mut r, header)?),
            MessageType::Keeplive => Message::Keeplive(KeepliveMessage::deserialize(&mut r, header)?),
            MessageType::Publish => Message::Publish(PublishMessage::deserialize(&mut r, header)?),
            MessageType::Confirm => Message::Confirm(ConfirmMessage::deserialize(&mut r, header)?),
            MessageType::Query => Message::Query(QueryMessage::deserialize(&mut r, header)?),
            MessageType::Fork => Message::Fork(ForkMessage::deserialize(&mut r, header)?),
            MessageType::Conflict => Message::Conflict(ConflictMessage::deserialize(&mut r, header)?),
            MessageType::Weight => Message::Weight(WeightMessage::deserialize(&mut r, header)?),
            MessageType::Bootstrap => {
                let message = BootstrapMessage::deserialize_bytes(bytes)
                    .map_err(|_| CodecError::Stream)?;
                Message::Bootstrap(message)
            }
            MessageType::Crosschain => Message::Crosschain(r.read_bytes(r.remaining())?),
            MessageType::Relay | MessageType::Invalid => return Err(CodecError::Stream),
        })
    }
}

/// Injected transport. The UDP plumbing lives outside the core; tests use a
/// recording fake.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: &Message, to: SocketAddr);
    fn broadcast(&self, message: &Message);
}

/// Transport that drops everything; used by tests and the light wallet.
pub struct NullSender;

impl MessageSender for NullSender {
    fn send(&self, _message: &Message, _to: SocketAddr) {}
    fn broadcast(&self, _message: &Message) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_crypto::KeyPair;
    use strand_types::block::{BlockOpcode, Note, TxBlock};
    use strand_types::params;

    fn sample_block() -> Block {
        let key = KeyPair::generate();
        Block::Tx(TxBlock::new(
            BlockOpcode::Send,
            1,
            1,
            params::EPOCH_TIMESTAMP + 5,
            1,
            key.public_key,
            U256::from_u64(3),
            U256::from_u64(4),
            Amount(10),
            U256::from_u64(5),
            Note::empty(),
            &key.private_key.signing_key(),
        ))
    }

    #[test]
    fn header_roundtrip() {
        let mut header = MessageHeader::new(MessageType::Confirm);
        header.set_flag(flags::ACK);
        let mut w = StreamWriter::new();
        header.serialize(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), MessageHeader::SIZE);
        let decoded = MessageHeader::deserialize(&mut StreamReader::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has_flag(flags::ACK));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut w = StreamWriter::new();
        MessageHeader::new(MessageType::Publish).serialize(&mut w);
        let mut bytes = w.into_vec();
        bytes[0] = b'X';
        assert!(MessageHeader::deserialize(&mut StreamReader::new(&bytes)).is_err());
    }

    #[test]
    fn publish_roundtrip() {
        let block = sample_block();
        let message = Message::Publish(PublishMessage::with_confirm(U256::from_u64(1), block));
        let bytes = message.to_bytes();
        match Message::from_bytes(&bytes).unwrap() {
            Message::Publish(decoded) => {
                assert!(decoded.need_confirm());
                assert_eq!(decoded.account, U256::from_u64(1));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn query_roundtrip() {
        let request = QueryMessage::request(42, QueryBy::Previous, U256::from_u64(1), 7, U256::from_u64(2));
        let bytes = Message::Query(request.clone()).to_bytes();
        let Message::Query(decoded) = Message::from_bytes(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded, request);
        assert!(!decoded.is_ack());

        let ack = QueryMessage::ack_of(&request, QueryStatus::Success, Some(sample_block()));
        let bytes = Message::Query(ack.clone()).to_bytes();
        let Message::Query(decoded) = Message::from_bytes(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded, ack);
        assert!(decoded.is_ack());
    }

    #[test]
    fn bootstrap_message_is_fixed_size() {
        let message = BootstrapMessage::new(BootstrapMode::Full, U256::from_u64(1), 0, 1000);
        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), BootstrapMessage::SIZE);
        let decoded = BootstrapMessage::deserialize_bytes(&bytes).unwrap();
        assert_eq!(decoded, message);

        // Trailing bytes are a framing violation.
        let mut long = bytes.clone();
        long.push(0);
        assert_eq!(
            BootstrapMessage::deserialize_bytes(&long),
            Err(BootstrapError::Stream)
        );
    }

    #[test]
    fn conflict_roundtrip() {
        let first = sample_block();
        let second = sample_block();
        let message = ConflictMessage::new(
            U256::from_u64(9),
            1,
            2,
            U512([1; 64]),
            U512([2; 64]),
            first,
            second,
        );
        let bytes = Message::Conflict(message.clone()).to_bytes();
        let Message::Conflict(decoded) = Message::from_bytes(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded, message);
    }
}
