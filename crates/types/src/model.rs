//! Persistent record types stored by the ledger and the wallet.

use crate::block::BlockType;
use crate::error::CodecError;
use crate::numbers::{Account, Amount, BlockHash, U256};
use crate::params;
use crate::stream::{StreamReader, StreamWriter};
use crate::INVALID_HEIGHT;

/// Per-account chain state. Created by the first successful block, deleted
/// only when the genesis block is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    /// Block type every block of this chain must carry.
    pub block_type: BlockType,
    pub head: BlockHash,
    pub head_height: u64,
    pub tail: BlockHash,
    pub tail_height: u64,
    /// Highest finalized height; `INVALID_HEIGHT` when nothing is confirmed.
    pub confirmed_height: u64,
    /// Live fork records charged against this account.
    pub forks: u32,
}

impl AccountInfo {
    /// State after the first block of a chain.
    pub fn genesis(block_type: BlockType, hash: BlockHash) -> Self {
        AccountInfo {
            block_type,
            head: hash,
            head_height: 0,
            tail: hash,
            tail_height: 0,
            confirmed_height: INVALID_HEIGHT,
            forks: 0,
        }
    }

    pub fn confirmed(&self) -> Option<u64> {
        if self.confirmed_height == INVALID_HEIGHT {
            None
        } else {
            Some(self.confirmed_height)
        }
    }

    /// An account over its fork allowance only accepts credit purchases.
    pub fn restricted(&self, now: u64, credit: u16) -> bool {
        self.forks > params::max_allowed_forks(now, credit)
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_u8(self.block_type as u8);
        w.write_bytes(self.head.as_bytes());
        w.write_u64(self.head_height);
        w.write_bytes(self.tail.as_bytes());
        w.write_u64(self.tail_height);
        w.write_u64(self.confirmed_height);
        w.write_u32(self.forks);
    }

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, CodecError> {
        let block_type = BlockType::from_u8(r.read_u8()?).ok_or(CodecError::Stream)?;
        Ok(AccountInfo {
            block_type,
            head: U256(r.read_array::<32>()?),
            head_height: r.read_u64()?,
            tail: U256(r.read_array::<32>()?),
            tail_height: r.read_u64()?,
            confirmed_height: r.read_u64()?,
            forks: r.read_u32()?,
        })
    }
}

/// An unclaimed send, keyed by (destination account, send hash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivableInfo {
    pub source: Account,
    pub amount: Amount,
    /// Timestamp of the send block; a matching receive may not be earlier.
    pub timestamp: u64,
}

impl ReceivableInfo {
    pub fn new(source: Account, amount: Amount, timestamp: u64) -> Self {
        Self {
            source,
            amount,
            timestamp,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_bytes(self.source.as_bytes());
        w.write_u128(self.amount.0);
        w.write_u64(self.timestamp);
    }

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, CodecError> {
        Ok(ReceivableInfo {
            source: U256(r.read_array::<32>()?),
            amount: Amount(r.read_u128()?),
            timestamp: r.read_u64()?,
        })
    }
}

/// A pending representative reward, keyed by (representative, source hash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardableInfo {
    /// Delegator whose balance accrued the reward.
    pub beneficiary: Account,
    pub amount: Amount,
    /// Earliest timestamp a reward block may claim this.
    pub valid_timestamp: u64,
}

impl RewardableInfo {
    pub fn new(beneficiary: Account, amount: Amount, valid_timestamp: u64) -> Self {
        Self {
            beneficiary,
            amount,
            valid_timestamp,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_bytes(self.beneficiary.as_bytes());
        w.write_u128(self.amount.0);
        w.write_u64(self.valid_timestamp);
    }

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, CodecError> {
        Ok(RewardableInfo {
            beneficiary: U256(r.read_array::<32>()?),
            amount: Amount(r.read_u128()?),
            valid_timestamp: r.read_u64()?,
        })
    }
}

/// Cross-chain targets a bind block may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Invalid,
    Bitcoin,
    Ethereum,
    BinanceSmartChain,
    Other(u32),
}

impl Chain {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Chain::Invalid,
            1 => Chain::Bitcoin,
            2 => Chain::Ethereum,
            3 => Chain::BinanceSmartChain,
            other => Chain::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Chain::Invalid => 0,
            Chain::Bitcoin => 1,
            Chain::Ethereum => 2,
            Chain::BinanceSmartChain => 3,
            Chain::Other(v) => *v,
        }
    }
}

/// A recorded cross-chain binding, keyed by (account, height).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingEntry {
    pub chain: Chain,
    pub address: U256,
}

impl BindingEntry {
    pub fn new(chain: Chain, address: U256) -> Self {
        Self { chain, address }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_u32(self.chain.as_u32());
        w.write_bytes(self.address.as_bytes());
    }

    pub fn deserialize(r: &mut StreamReader) -> Result<Self, CodecError> {
        Ok(BindingEntry {
            chain: Chain::from_u32(r.read_u32()?),
            address: U256(r.read_array::<32>()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_info_roundtrip() {
        let info = AccountInfo {
            block_type: BlockType::Transaction,
            head: U256::from_u64(10),
            head_height: 7,
            tail: U256::from_u64(3),
            tail_height: 2,
            confirmed_height: 5,
            forks: 1,
        };
        let mut w = StreamWriter::new();
        info.serialize(&mut w);
        let bytes = w.into_vec();
        let decoded = AccountInfo::deserialize(&mut StreamReader::new(&bytes)).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn genesis_invariants() {
        let info = AccountInfo::genesis(BlockType::Transaction, U256::from_u64(1));
        assert_eq!(info.head, info.tail);
        assert_eq!(info.head_height, 0);
        assert_eq!(info.tail_height, 0);
        assert_eq!(info.confirmed(), None);
    }

    #[test]
    fn restriction_tracks_fork_cap() {
        let mut info = AccountInfo::genesis(BlockType::Transaction, U256::ZERO);
        assert!(!info.restricted(params::EPOCH_TIMESTAMP, 1));
        info.forks = params::max_allowed_forks(params::EPOCH_TIMESTAMP, 1) + 1;
        assert!(info.restricted(params::EPOCH_TIMESTAMP, 1));
        assert!(!info.restricted(params::EPOCH_TIMESTAMP, 100));
    }

    #[test]
    fn receivable_rewardable_roundtrip() {
        let r = ReceivableInfo::new(U256::from_u64(1), Amount(22), 99);
        let mut w = StreamWriter::new();
        r.serialize(&mut w);
        let bytes = w.into_vec();
        assert_eq!(
            ReceivableInfo::deserialize(&mut StreamReader::new(&bytes)).unwrap(),
            r
        );

        let rw = RewardableInfo::new(U256::from_u64(2), Amount(17), 123);
        let mut w = StreamWriter::new();
        rw.serialize(&mut w);
        let bytes = w.into_vec();
        assert_eq!(
            RewardableInfo::deserialize(&mut StreamReader::new(&bytes)).unwrap(),
            rw
        );
    }
}
