//! The block sum type: transaction, representative and airdrop variants.
//!
//! Each variant has a fixed big-endian binary layout, self-delimited by the
//! leading type byte, and a structured JSON form with decimal-string
//! numerics. The canonical hash is Blake2b-256 over the serialized prefix,
//! excluding the signature; Ed25519 signs the hash directly.

use crate::address;
use crate::error::BlockError;
use crate::model::Chain;
use crate::numbers::{Account, Amount, BlockHash, Signature, U256, U512};
use crate::stream::{StreamReader, StreamWriter};
use crate::util;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde_json::{json, Map, Value};

/// Wire tag of each block variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Full-featured account chain block.
    Transaction = 1,
    /// Compact block for representative-only chains.
    Representative = 2,
    /// Airdrop chain block carrying a price and validity window.
    Airdrop = 3,
}

impl BlockType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Transaction),
            2 => Some(Self::Representative),
            3 => Some(Self::Airdrop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Representative => "representative",
            Self::Airdrop => "airdrop",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transaction" => Some(Self::Transaction),
            "representative" => Some(Self::Representative),
            "airdrop" => Some(Self::Airdrop),
            _ => None,
        }
    }
}

/// Operation a block performs on its account chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOpcode {
    Send = 1,
    Receive = 2,
    Change = 3,
    Credit = 4,
    Reward = 5,
    Destroy = 6,
    Bind = 7,
}

impl BlockOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Send),
            2 => Some(Self::Receive),
            3 => Some(Self::Change),
            4 => Some(Self::Credit),
            5 => Some(Self::Reward),
            6 => Some(Self::Destroy),
            7 => Some(Self::Bind),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Change => "change",
            Self::Credit => "credit",
            Self::Reward => "reward",
            Self::Destroy => "destroy",
            Self::Bind => "bind",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "send" => Some(Self::Send),
            "receive" => Some(Self::Receive),
            "change" => Some(Self::Change),
            "credit" => Some(Self::Credit),
            "reward" => Some(Self::Reward),
            "destroy" => Some(Self::Destroy),
            "bind" => Some(Self::Bind),
            _ => None,
        }
    }
}

/// What the link field refers to under a given opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSemantics {
    /// Destination account of a send.
    Destination,
    /// Hash of the source block being received or rewarded.
    Source,
    /// Unused; must be zero except for bind.
    None,
}

impl BlockOpcode {
    pub fn link_semantics(&self) -> LinkSemantics {
        match self {
            Self::Send => LinkSemantics::Destination,
            Self::Receive | Self::Reward => LinkSemantics::Source,
            _ => LinkSemantics::None,
        }
    }
}

fn opcode_allowed(block_type: BlockType, opcode: BlockOpcode) -> bool {
    use BlockOpcode::*;
    match block_type {
        BlockType::Transaction => true,
        BlockType::Representative => matches!(opcode, Send | Receive | Reward),
        BlockType::Airdrop => matches!(opcode, Send | Receive | Change | Destroy),
    }
}

/// Free-form payload of a transaction block: a type byte, an encoding byte
/// and the data. The empty note is valid and serializes as length zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Note {
    bytes: Vec<u8>,
}

impl Note {
    /// Maximum raw note length, header bytes included.
    pub const MAX_LENGTH: usize = 256;

    const TYPE_TEXT: u8 = 1;
    const ENCODE_UTF8: u8 = 1;
    const ENCODE_HEX: u8 = 2;

    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a UTF-8 text note.
    pub fn text(data: &str) -> Result<Self, BlockError> {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.push(Self::TYPE_TEXT);
        bytes.push(Self::ENCODE_UTF8);
        bytes.extend_from_slice(data.as_bytes());
        if bytes.len() > Self::MAX_LENGTH {
            return Err(BlockError::NoteLength);
        }
        Ok(Note { bytes })
    }

    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, BlockError> {
        if bytes.len() > Self::MAX_LENGTH {
            return Err(BlockError::NoteLength);
        }
        if bytes.len() == 1 {
            return Err(BlockError::NoteLength);
        }
        Ok(Note { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.bytes
    }

    fn type_str(&self) -> Option<&'static str> {
        match self.bytes.first() {
            Some(&Self::TYPE_TEXT) => Some("text"),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        if self.is_empty() {
            return Value::Null;
        }
        let data = &self.bytes[2..];
        let (encode, data_str) = match self.bytes.get(1) {
            Some(&Self::ENCODE_UTF8) => (
                "utf8",
                String::from_utf8_lossy(data).into_owned(),
            ),
            _ => ("hex", hex::encode_upper(data)),
        };
        json!({
            "type": self.type_str().unwrap_or("text"),
            "encode": encode,
            "data": data_str,
        })
    }

    fn from_json(value: &Value, expected_len: u32) -> Result<Self, BlockError> {
        if expected_len == 0 {
            return Ok(Note::empty());
        }
        let obj = value.as_object().ok_or(BlockError::JsonNoteData)?;
        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(BlockError::JsonNoteType)?;
        let type_byte = match type_str {
            "text" => Self::TYPE_TEXT,
            _ => return Err(BlockError::JsonNoteType),
        };
        let encode_str = obj
            .get("encode")
            .and_then(Value::as_str)
            .ok_or(BlockError::JsonNoteEncode)?;
        let data_str = obj
            .get("data")
            .and_then(Value::as_str)
            .ok_or(BlockError::JsonNoteData)?;
        let (encode_byte, data) = match encode_str {
            "utf8" => (Self::ENCODE_UTF8, data_str.as_bytes().to_vec()),
            "hex" => (
                Self::ENCODE_HEX,
                hex::decode(data_str).map_err(|_| BlockError::JsonNoteData)?,
            ),
            _ => return Err(BlockError::JsonNoteEncode),
        };
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.push(type_byte);
        bytes.push(encode_byte);
        bytes.extend_from_slice(&data);
        if bytes.len() > Self::MAX_LENGTH {
            return Err(BlockError::NoteLength);
        }
        // The declared length must equal the byte length of the data under
        // the stated encoding.
        if bytes.len() as u32 != expected_len {
            return Err(BlockError::JsonNoteLength);
        }
        Ok(Note { bytes })
    }
}

/// Full-featured block for ordinary account chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBlock {
    pub opcode: BlockOpcode,
    pub credit: u16,
    pub counter: u32,
    pub timestamp: u64,
    pub height: u64,
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub link: U256,
    pub note: Note,
    pub signature: Signature,
}

/// Compact block for representative chains: no note, no representative
/// delegation of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepBlock {
    pub opcode: BlockOpcode,
    pub credit: u16,
    pub counter: u32,
    pub timestamp: u64,
    pub height: u64,
    pub account: Account,
    pub previous: BlockHash,
    pub balance: Amount,
    pub link: U256,
    pub signature: Signature,
}

/// Airdrop chain block with a price and validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdBlock {
    pub opcode: BlockOpcode,
    pub credit: u16,
    pub counter: u32,
    pub timestamp: u64,
    pub height: u64,
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub price: Amount,
    pub begin_time: u64,
    pub end_time: u64,
    pub link: U256,
    pub signature: Signature,
}

/// A block of any variant. Dispatch is by match; common accessors are on this
/// enum so callers never need the concrete variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Tx(TxBlock),
    Rep(RepBlock),
    Ad(AdBlock),
}

fn blake2b_256(bytes: &[u8]) -> BlockHash {
    let mut hasher = Blake2bVar::new(32).expect("32-byte output is valid");
    hasher.update(bytes);
    let mut out = [0u8; 32];
    hasher
        .finalize_variable(&mut out)
        .expect("output length matches");
    U256(out)
}

/// Blake2b-256 over arbitrary bytes; used wherever a non-block digest is
/// signed (vote hashes, handshake cookies).
pub fn hash_bytes(bytes: &[u8]) -> BlockHash {
    blake2b_256(bytes)
}

/// Signs a block hash with the given key. The account must be the key's
/// public half for the signature to verify.
pub fn sign_hash(hash: &BlockHash, key: &SigningKey) -> Signature {
    U512(key.sign(hash.as_bytes()).to_bytes())
}

/// Verifies an Ed25519 signature over a block hash against an account key.
pub fn verify_hash(hash: &BlockHash, account: &Account, signature: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(account.as_bytes()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify_strict(hash.as_bytes(), &sig).is_ok()
}

impl TxBlock {
    /// Builds and signs a transaction block.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opcode: BlockOpcode,
        credit: u16,
        counter: u32,
        timestamp: u64,
        height: u64,
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        link: U256,
        note: Note,
        key: &SigningKey,
    ) -> Self {
        let mut block = TxBlock {
            opcode,
            credit,
            counter,
            timestamp,
            height,
            account,
            previous,
            representative,
            balance,
            link,
            note,
            signature: U512::ZERO,
        };
        block.signature = sign_hash(&block.hash(), key);
        block
    }

    fn serialize_prefix(&self, w: &mut StreamWriter) {
        w.write_u8(BlockType::Transaction as u8);
        w.write_u8(self.opcode as u8);
        w.write_u16(self.credit);
        w.write_u32(self.counter);
        w.write_u64(self.timestamp);
        w.write_u64(self.height);
        w.write_bytes(self.account.as_bytes());
        w.write_bytes(self.previous.as_bytes());
        w.write_bytes(self.representative.as_bytes());
        w.write_u128(self.balance.0);
        w.write_bytes(self.link.as_bytes());
        w.write_u32(self.note.len() as u32);
        w.write_bytes(self.note.as_raw());
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.serialize_prefix(w);
        w.write_bytes(self.signature.as_bytes());
    }

    pub fn hash(&self) -> BlockHash {
        let mut w = StreamWriter::with_capacity(self.size());
        self.serialize_prefix(&mut w);
        blake2b_256(w.as_slice())
    }

    pub fn size(&self) -> usize {
        1 + 1 + 2 + 4 + 8 + 8 + 32 + 32 + 32 + 16 + 32 + 4 + self.note.len() + 64
    }

    /// Reads the fields after the type byte.
    pub fn deserialize(r: &mut StreamReader) -> Result<Self, BlockError> {
        let opcode =
            BlockOpcode::from_u8(r.read_u8()?).ok_or(BlockError::Opcode)?;
        if !opcode_allowed(BlockType::Transaction, opcode) {
            return Err(BlockError::Opcode);
        }
        let credit = r.read_u16()?;
        let counter = r.read_u32()?;
        let timestamp = r.read_u64()?;
        let height = r.read_u64()?;
        let account = U256(r.read_array::<32>()?);
        let previous = U256(r.read_array::<32>()?);
        let representative = U256(r.read_array::<32>()?);
        let balance = Amount(r.read_u128()?);
        let link = U256(r.read_array::<32>()?);
        let note_length = r.read_u32()? as usize;
        if note_length > Note::MAX_LENGTH {
            return Err(BlockError::NoteLength);
        }
        let note = Note::from_raw(r.read_bytes(note_length)?)?;
        let signature = U512(r.read_array::<64>()?);
        Ok(TxBlock {
            opcode,
            credit,
            counter,
            timestamp,
            height,
            account,
            previous,
            representative,
            balance,
            link,
            note,
            signature,
        })
    }
}

impl RepBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opcode: BlockOpcode,
        credit: u16,
        counter: u32,
        timestamp: u64,
        height: u64,
        account: Account,
        previous: BlockHash,
        balance: Amount,
        link: U256,
        key: &SigningKey,
    ) -> Self {
        let mut block = RepBlock {
            opcode,
            credit,
            counter,
            timestamp,
            height,
            account,
            previous,
            balance,
            link,
            signature: U512::ZERO,
        };
        block.signature = sign_hash(&block.hash(), key);
        block
    }

    fn serialize_prefix(&self, w: &mut StreamWriter) {
        w.write_u8(BlockType::Representative as u8);
        w.write_u8(self.opcode as u8);
        w.write_u16(self.credit);
        w.write_u32(self.counter);
        w.write_u64(self.timestamp);
        w.write_u64(self.height);
        w.write_bytes(self.account.as_bytes());
        w.write_bytes(self.previous.as_bytes());
        w.write_u128(self.balance.0);
        w.write_bytes(self.link.as_bytes());
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.serialize_prefix(w);
        w.write_bytes(self.signature.as_bytes());
    }

    pub fn hash(&self) -> BlockHash {
        let mut w = StreamWriter::with_capacity(self.size());
        self.serialize_prefix(&mut w);
        blake2b_256(w.as_slice())
    }

    pub fn size(&self) -> usize {
        1 + 1 + 2 + 4 + 8 + 8 + 32 + 32 + 16 + 32 + 64
    }

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, BlockError> {
        let opcode =
            BlockOpcode::from_u8(r.read_u8()?).ok_or(BlockError::Opcode)?;
        if !opcode_allowed(BlockType::Representative, opcode) {
            return Err(BlockError::Opcode);
        }
        let credit = r.read_u16()?;
        let counter = r.read_u32()?;
        let timestamp = r.read_u64()?;
        let height = r.read_u64()?;
        let account = U256(r.read_array::<32>()?);
        let previous = U256(r.read_array::<32>()?);
        let balance = Amount(r.read_u128()?);
        let link = U256(r.read_array::<32>()?);
        let signature = U512(r.read_array::<64>()?);
        Ok(RepBlock {
            opcode,
            credit,
            counter,
            timestamp,
            height,
            account,
            previous,
            balance,
            link,
            signature,
        })
    }
}

impl AdBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opcode: BlockOpcode,
        credit: u16,
        counter: u32,
        timestamp: u64,
        height: u64,
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        price: Amount,
        begin_time: u64,
        end_time: u64,
        link: U256,
        key: &SigningKey,
    ) -> Self {
        let mut block = AdBlock {
            opcode,
            credit,
            counter,
            timestamp,
            height,
            account,
            previous,
            representative,
            balance,
            price,
            begin_time,
            end_time,
            link,
            signature: U512::ZERO,
        };
        block.signature = sign_hash(&block.hash(), key);
        block
    }

    fn serialize_prefix(&self, w: &mut StreamWriter) {
        w.write_u8(BlockType::Airdrop as u8);
        w.write_u8(self.opcode as u8);
        w.write_u16(self.credit);
        w.write_u32(self.counter);
        w.write_u64(self.timestamp);
        w.write_u64(self.height);
        w.write_bytes(self.account.as_bytes());
        w.write_bytes(self.previous.as_bytes());
        w.write_bytes(self.representative.as_bytes());
        w.write_u128(self.balance.0);
        w.write_u128(self.price.0);
        w.write_u64(self.begin_time);
        w.write_u64(self.end_time);
        w.write_bytes(self.link.as_bytes());
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        self.serialize_prefix(w);
        w.write_bytes(self.signature.as_bytes());
    }

    pub fn hash(&self) -> BlockHash {
        let mut w = StreamWriter::with_capacity(self.size());
        self.serialize_prefix(&mut w);
        blake2b_256(w.as_slice())
    }

    pub fn size(&self) -> usize {
        1 + 1 + 2 + 4 + 8 + 8 + 32 + 32 + 32 + 16 + 16 + 8 + 8 + 32 + 64
    }

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, BlockError> {
        let opcode =
            BlockOpcode::from_u8(r.read_u8()?).ok_or(BlockError::Opcode)?;
        if !opcode_allowed(BlockType::Airdrop, opcode) {
            return Err(BlockError::Opcode);
        }
        let credit = r.read_u16()?;
        let counter = r.read_u32()?;
        let timestamp = r.read_u64()?;
        let height = r.read_u64()?;
        let account = U256(r.read_array::<32>()?);
        let previous = U256(r.read_array::<32>()?);
        let representative = U256(r.read_array::<32>()?);
        let balance = Amount(r.read_u128()?);
        let price = Amount(r.read_u128()?);
        let begin_time = r.read_u64()?;
        let end_time = r.read_u64()?;
        let link = U256(r.read_array::<32>()?);
        let signature = U512(r.read_array::<64>()?);
        Ok(AdBlock {
            opcode,
            credit,
            counter,
            timestamp,
            height,
            account,
            previous,
            representative,
            balance,
            price,
            begin_time,
            end_time,
            link,
            signature,
        })
    }
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Tx(_) => BlockType::Transaction,
            Block::Rep(_) => BlockType::Representative,
            Block::Ad(_) => BlockType::Airdrop,
        }
    }

    pub fn opcode(&self) -> BlockOpcode {
        match self {
            Block::Tx(b) => b.opcode,
            Block::Rep(b) => b.opcode,
            Block::Ad(b) => b.opcode,
        }
    }

    pub fn credit(&self) -> u16 {
        match self {
            Block::Tx(b) => b.credit,
            Block::Rep(b) => b.credit,
            Block::Ad(b) => b.credit,
        }
    }

    pub fn counter(&self) -> u32 {
        match self {
            Block::Tx(b) => b.counter,
            Block::Rep(b) => b.counter,
            Block::Ad(b) => b.counter,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Block::Tx(b) => b.timestamp,
            Block::Rep(b) => b.timestamp,
            Block::Ad(b) => b.timestamp,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            Block::Tx(b) => b.height,
            Block::Rep(b) => b.height,
            Block::Ad(b) => b.height,
        }
    }

    pub fn account(&self) -> Account {
        match self {
            Block::Tx(b) => b.account,
            Block::Rep(b) => b.account,
            Block::Ad(b) => b.account,
        }
    }

    pub fn previous(&self) -> BlockHash {
        match self {
            Block::Tx(b) => b.previous,
            Block::Rep(b) => b.previous,
            Block::Ad(b) => b.previous,
        }
    }

    /// Whether this variant carries a representative field at all.
    pub fn has_representative(&self) -> bool {
        !matches!(self, Block::Rep(_))
    }

    /// The delegated representative; zero for variants without one.
    pub fn representative(&self) -> Account {
        match self {
            Block::Tx(b) => b.representative,
            Block::Rep(_) => U256::ZERO,
            Block::Ad(b) => b.representative,
        }
    }

    pub fn balance(&self) -> Amount {
        match self {
            Block::Tx(b) => b.balance,
            Block::Rep(b) => b.balance,
            Block::Ad(b) => b.balance,
        }
    }

    pub fn link(&self) -> U256 {
        match self {
            Block::Tx(b) => b.link,
            Block::Rep(b) => b.link,
            Block::Ad(b) => b.link,
        }
    }

    pub fn signature(&self) -> Signature {
        match self {
            Block::Tx(b) => b.signature,
            Block::Rep(b) => b.signature,
            Block::Ad(b) => b.signature,
        }
    }

    pub fn hash(&self) -> BlockHash {
        match self {
            Block::Tx(b) => b.hash(),
            Block::Rep(b) => b.hash(),
            Block::Ad(b) => b.hash(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Block::Tx(b) => b.size(),
            Block::Rep(b) => b.size(),
            Block::Ad(b) => b.size(),
        }
    }

    /// Target chain of a bind block, packed into the top four link bytes.
    pub fn bind_chain(&self) -> Chain {
        let bytes = self.link();
        let raw = u32::from_be_bytes([bytes.0[0], bytes.0[1], bytes.0[2], bytes.0[3]]);
        Chain::from_u32(raw)
    }

    /// True when the signature verifies against the block's account.
    pub fn check_signature(&self) -> bool {
        verify_hash(&self.hash(), &self.account(), &self.signature())
    }

    /// Fork predicate: same type, same account, same height, different hash.
    pub fn fork_with(&self, other: &Block) -> bool {
        self.block_type() == other.block_type()
            && self.account() == other.account()
            && self.height() == other.height()
            && self.hash() != other.hash()
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        match self {
            Block::Tx(b) => b.serialize(w),
            Block::Rep(b) => b.serialize(w),
            Block::Ad(b) => b.serialize(w),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = StreamWriter::with_capacity(self.size());
        self.serialize(&mut w);
        w.into_vec()
    }

    /// Reads one block, dispatching on the leading type byte.
    pub fn deserialize(r: &mut StreamReader) -> Result<Self, BlockError> {
        let type_byte = r.read_u8()?;
        let block_type = BlockType::from_u8(type_byte).ok_or(BlockError::Type)?;
        match block_type {
            BlockType::Transaction => TxBlock::deserialize(r).map(Block::Tx),
            BlockType::Representative => RepBlock::deserialize(r).map(Block::Rep),
            BlockType::Airdrop => AdBlock::deserialize(r).map(Block::Ad),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        let mut r = StreamReader::new(bytes);
        Self::deserialize(&mut r)
    }

    /// Structured text form with typed string values.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".into(), self.block_type().as_str().into());
        map.insert("opcode".into(), self.opcode().as_str().into());
        map.insert("credit".into(), self.credit().to_string().into());
        map.insert("counter".into(), self.counter().to_string().into());
        map.insert("timestamp".into(), self.timestamp().to_string().into());
        map.insert("height".into(), self.height().to_string().into());
        map.insert("account".into(), address::encode(&self.account()).into());
        map.insert("previous".into(), self.previous().to_hex().into());
        if self.has_representative() {
            map.insert(
                "representative".into(),
                address::encode(&self.representative()).into(),
            );
        }
        map.insert("balance".into(), self.balance().to_decimal().into());
        if let Block::Ad(b) = self {
            map.insert("price".into(), b.price.to_decimal().into());
            map.insert("begin_time".into(), b.begin_time.to_string().into());
            map.insert("end_time".into(), b.end_time.to_string().into());
        }
        let link_value = match self.opcode().link_semantics() {
            LinkSemantics::Destination => address::encode(&self.link()).into(),
            _ => self.link().to_hex().into(),
        };
        map.insert("link".into(), link_value);
        if let Block::Tx(b) = self {
            map.insert("note_length".into(), b.note.len().to_string().into());
            if !b.note.is_empty() {
                map.insert("note".into(), b.note.to_json());
            }
        }
        map.insert("signature".into(), self.signature().to_hex().into());
        Value::Object(map)
    }

    /// Decodes the structured text form, enforcing the strict numeric rules
    /// and returning the field-specific error on the first violation.
    pub fn from_json(value: &Value) -> Result<Self, BlockError> {
        let obj = value.as_object().ok_or(BlockError::JsonObject)?;
        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(BlockError::Type)?;
        let block_type = BlockType::from_str(type_str).ok_or(BlockError::Type)?;

        let opcode_str = obj
            .get("opcode")
            .and_then(Value::as_str)
            .ok_or(BlockError::Opcode)?;
        let opcode = BlockOpcode::from_str(opcode_str).ok_or(BlockError::Opcode)?;
        if !opcode_allowed(block_type, opcode) {
            return Err(BlockError::Opcode);
        }

        let credit = util::decode_u16(get_str(obj, "credit", BlockError::JsonCredit)?)
            .map_err(|_| BlockError::JsonCredit)?;
        let counter = util::decode_u32(get_str(obj, "counter", BlockError::JsonCounter)?)
            .map_err(|_| BlockError::JsonCounter)?;
        let timestamp = util::decode_u64(get_str(obj, "timestamp", BlockError::JsonTimestamp)?)
            .map_err(|_| BlockError::JsonTimestamp)?;
        let height = util::decode_u64(get_str(obj, "height", BlockError::JsonHeight)?)
            .map_err(|_| BlockError::JsonHeight)?;
        let account = decode_account(get_str(obj, "account", BlockError::JsonAccount)?)
            .ok_or(BlockError::JsonAccount)?;
        let previous = U256::from_hex(get_str(obj, "previous", BlockError::JsonPrevious)?)
            .map_err(|_| BlockError::JsonPrevious)?;
        let representative = if block_type == BlockType::Representative {
            U256::ZERO
        } else {
            decode_account(get_str(obj, "representative", BlockError::JsonRepresentative)?)
                .ok_or(BlockError::JsonRepresentative)?
        };
        let balance = Amount::from_decimal(get_str(obj, "balance", BlockError::JsonBalance)?)
            .map_err(|_| BlockError::JsonBalance)?;
        let link_str = get_str(obj, "link", BlockError::JsonLink)?;
        let link = match opcode.link_semantics() {
            LinkSemantics::Destination => decode_account(link_str).ok_or(BlockError::JsonLink)?,
            _ => U256::from_hex(link_str)
                .ok()
                .or_else(|| address::decode(link_str).ok())
                .ok_or(BlockError::JsonLink)?,
        };
        let signature = U512::from_hex(get_str(obj, "signature", BlockError::JsonSignature)?)
            .map_err(|_| BlockError::JsonSignature)?;

        match block_type {
            BlockType::Transaction => {
                let note_length =
                    util::decode_u32(get_str(obj, "note_length", BlockError::JsonNoteLength)?)
                        .map_err(|_| BlockError::JsonNoteLength)?;
                if note_length as usize > Note::MAX_LENGTH {
                    return Err(BlockError::NoteLength);
                }
                let note = Note::from_json(
                    obj.get("note").unwrap_or(&Value::Null),
                    note_length,
                )?;
                Ok(Block::Tx(TxBlock {
                    opcode,
                    credit,
                    counter,
                    timestamp,
                    height,
                    account,
                    previous,
                    representative,
                    balance,
                    link,
                    note,
                    signature,
                }))
            }
            BlockType::Representative => Ok(Block::Rep(RepBlock {
                opcode,
                credit,
                counter,
                timestamp,
                height,
                account,
                previous,
                balance,
                link,
                signature,
            })),
            BlockType::Airdrop => {
                let price = Amount::from_decimal(get_str(obj, "price", BlockError::JsonPrice)?)
                    .map_err(|_| BlockError::JsonPrice)?;
                let begin_time =
                    util::decode_u64(get_str(obj, "begin_time", BlockError::JsonBeginTime)?)
                        .map_err(|_| BlockError::JsonBeginTime)?;
                let end_time = util::decode_u64(get_str(obj, "end_time", BlockError::JsonEndTime)?)
                    .map_err(|_| BlockError::JsonEndTime)?;
                Ok(Block::Ad(AdBlock {
                    opcode,
                    credit,
                    counter,
                    timestamp,
                    height,
                    account,
                    previous,
                    representative,
                    balance,
                    price,
                    begin_time,
                    end_time,
                    link,
                    signature,
                }))
            }
        }
    }
}

fn get_str<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    err: BlockError,
) -> Result<&'a str, BlockError> {
    obj.get(key).and_then(Value::as_str).ok_or(err)
}

/// Accounts appear either as checksummed addresses or as raw hex.
fn decode_account(s: &str) -> Option<Account> {
    address::decode(s)
        .ok()
        .or_else(|| U256::from_hex(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn test_key() -> SigningKey {
        let seed = U256::from_hex(
            "34F0A37AAD20F4A260F0A5B3CB3D7FB50673212263E58A380BC10474BB039CE4",
        )
        .unwrap();
        SigningKey::from_bytes(seed.as_bytes())
    }

    fn sample_tx_block(key: &SigningKey) -> TxBlock {
        let account = U256(VerifyingKey::from(key).to_bytes());
        let representative = U256::from_hex(
            "0311B25E0D1E1D7724BBA5BD523954F1DBCFC01CB8671D55ED2D32C7549FB252",
        )
        .unwrap();
        let link = account;
        TxBlock::new(
            BlockOpcode::Send,
            1,
            1,
            1541128318,
            1,
            account,
            U256::ZERO,
            representative,
            Amount(1),
            link,
            Note::text("raicoin").unwrap(),
            key,
        )
    }

    #[test]
    fn canonical_binary_layout() {
        let key = test_key();
        let block = sample_tx_block(&key);
        let account_hex = block.account.to_hex();

        let mut expected = String::new();
        expected += "0101000100000001"; // type + opcode + credit + counter
        expected += "000000005BDBC07E"; // timestamp
        expected += "0000000000000001"; // height
        expected += &account_hex;
        expected += &U256::ZERO.to_hex(); // previous
        expected += "0311B25E0D1E1D7724BBA5BD523954F1DBCFC01CB8671D55ED2D32C7549FB252";
        expected += "00000000000000000000000000000001"; // balance
        expected += &account_hex; // link
        expected += "00000009"; // note_length
        expected += "0101726169636F696E"; // note bytes

        let bytes = Block::Tx(block.clone()).to_bytes();
        let prefix_len = bytes.len() - 64;
        assert_eq!(
            hex::encode_upper(&bytes[..prefix_len]),
            expected,
            "canonical prefix layout"
        );

        // The hash covers exactly the bytes preceding the signature.
        let mut hasher = Blake2bVar::new(32).unwrap();
        hasher.update(&bytes[..prefix_len]);
        let mut digest = [0u8; 32];
        hasher.finalize_variable(&mut digest).unwrap();
        assert_eq!(block.hash(), U256(digest));

        assert!(Block::Tx(block).check_signature());
    }

    #[test]
    fn hash_ignores_signature() {
        let key = test_key();
        let mut block = sample_tx_block(&key);
        let hash = block.hash();
        block.signature = U512([0xAB; 64]);
        assert_eq!(block.hash(), hash);
    }

    #[test]
    fn binary_roundtrip_all_variants() {
        let key = test_key();
        let account = U256(VerifyingKey::from(&key).to_bytes());

        let tx = Block::Tx(sample_tx_block(&key));
        let rep = Block::Rep(RepBlock::new(
            BlockOpcode::Reward,
            1,
            0,
            params::EPOCH_TIMESTAMP + 10,
            0,
            account,
            U256::ZERO,
            Amount(5),
            U256::from_u64(77),
            &key,
        ));
        let ad = Block::Ad(AdBlock::new(
            BlockOpcode::Change,
            2,
            3,
            params::EPOCH_TIMESTAMP + 20,
            4,
            account,
            U256::from_u64(9),
            account,
            Amount(1000),
            Amount(10),
            params::EPOCH_TIMESTAMP,
            params::EPOCH_TIMESTAMP + 1000,
            U256::ZERO,
            &key,
        ));

        for block in [tx, rep, ad] {
            let bytes = block.to_bytes();
            assert_eq!(bytes.len(), block.size());
            let decoded = Block::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, block);
            assert!(decoded.check_signature());
        }
    }

    #[test]
    fn fork_predicate() {
        let key = test_key();
        let a = sample_tx_block(&key);
        let mut b = a.clone();
        assert!(!Block::Tx(a.clone()).fork_with(&Block::Tx(b.clone())));

        b.timestamp += 1;
        assert!(Block::Tx(a.clone()).fork_with(&Block::Tx(b.clone())));

        b.height += 1;
        assert!(!Block::Tx(a).fork_with(&Block::Tx(b)));
    }

    #[test]
    fn equality_includes_signature() {
        let key = test_key();
        let a = sample_tx_block(&key);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.signature = U512([1; 64]);
        assert_ne!(a, b);
    }

    #[test]
    fn json_roundtrip() {
        let key = test_key();
        let block = Block::Tx(sample_tx_block(&key));
        let value = block.to_json();
        assert_eq!(value["type"], "transaction");
        assert_eq!(value["opcode"], "send");
        assert_eq!(value["credit"], "1");
        assert_eq!(value["note_length"], "9");
        assert_eq!(value["note"]["data"], "raicoin");
        let decoded = Block::from_json(&value).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn json_credit_failures() {
        let key = test_key();
        let block = Block::Tx(sample_tx_block(&key));
        for bad in ["01", "0xFFFF", "65536", "", "-1"] {
            let mut value = block.to_json();
            value["credit"] = Value::String(bad.into());
            assert_eq!(
                Block::from_json(&value),
                Err(BlockError::JsonCredit),
                "credit={bad:?}"
            );
        }
        let mut value = block.to_json();
        value["credit"] = Value::String("65535".into());
        assert!(Block::from_json(&value).is_ok());
    }

    #[test]
    fn json_note_length_must_match() {
        let key = test_key();
        let block = Block::Tx(sample_tx_block(&key));
        let mut value = block.to_json();
        value["note_length"] = Value::String("8".into());
        assert_eq!(Block::from_json(&value), Err(BlockError::JsonNoteLength));
    }

    #[test]
    fn json_rejects_disallowed_opcodes() {
        let key = test_key();
        let account = U256(VerifyingKey::from(&key).to_bytes());
        let rep = Block::Rep(RepBlock::new(
            BlockOpcode::Send,
            1,
            1,
            params::EPOCH_TIMESTAMP,
            1,
            account,
            U256::from_u64(3),
            Amount(1),
            account,
            &key,
        ));
        let mut value = rep.to_json();
        value["opcode"] = Value::String("change".into());
        assert_eq!(Block::from_json(&value), Err(BlockError::Opcode));
        value["opcode"] = Value::String("mint".into());
        assert_eq!(Block::from_json(&value), Err(BlockError::Opcode));
    }
}
