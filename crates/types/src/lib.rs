#![forbid(unsafe_code)]

//! # Strand Types
//!
//! Foundational crate for the Strand ledger: fixed-width integer types and
//! their codecs, the binary stream format, the block taxonomy with binary and
//! JSON serialization, persistent record types, protocol parameters, and the
//! unified error enums.
//!
//! This crate sits at the bottom of the workspace dependency graph so that
//! every other crate shares one canonical definition of `Block`, `Account`,
//! `Amount` and the error codes.

/// Checksummed base-32 account address codec.
pub mod address;
/// The block sum type and its three variants.
pub mod block;
/// Unified error enums and the stable error-code mapping.
pub mod error;
/// Persistent record types: account, receivable, rewardable, binding, wallet.
pub mod model;
/// Fixed-width integers (128/256/512 bit) and their text codecs.
pub mod numbers;
/// Protocol constants: credit pricing, reward schedule, day arithmetic.
pub mod params;
/// Big-endian binary stream reader/writer.
pub mod stream;
/// Decimal-string helpers shared by the JSON codecs.
pub mod util;

pub use block::{AdBlock, Block, BlockOpcode, BlockType, Note, RepBlock, TxBlock};
pub use error::{
    BlockError, BootstrapError, CodecError, CryptoError, ErrorCode, LedgerError, ProcessError,
    WalletError,
};
pub use model::{AccountInfo, BindingEntry, Chain, ReceivableInfo, RewardableInfo};
pub use numbers::{Account, Amount, BlockHash, Signature, U256, U512};
pub use stream::{StreamReader, StreamWriter};

/// Sentinel height meaning "absent": unconfirmed chains and end-of-stream
/// markers in bootstrap both use it.
pub const INVALID_HEIGHT: u64 = u64::MAX;
