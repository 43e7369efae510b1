//! Error enums for every subsystem plus the stable error-code mapping.
//!
//! There is no exception-style control flow anywhere in the workspace: every
//! fallible operation returns one of these enums, and [`ErrorCode::code`]
//! provides the stable SCREAMING_SNAKE identifier carried by RPC responses
//! and block callbacks.

use crate::numbers::{Account, BlockHash};
use thiserror::Error;

/// Assigns a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// The unique, stable identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Low-level codec failures shared by hex, decimal and stream decoding.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the expected field.
    #[error("Unexpected end of stream")]
    Stream,
    /// A hex string had the wrong length for the target width.
    #[error("Invalid hex length")]
    HexLength,
    /// A hex string contained a non-hex character.
    #[error("Invalid hex digit")]
    HexDigit,
    /// A decimal string violated the strict format rules.
    #[error("Invalid decimal string")]
    DecimalFormat,
    /// A decimal value exceeded the target width.
    #[error("Value out of range")]
    Overflow,
}

impl ErrorCode for CodecError {
    fn code(&self) -> &'static str {
        match self {
            Self::Stream => "STREAM",
            Self::HexLength => "DECODE_HEX_LENGTH",
            Self::HexDigit => "DECODE_HEX",
            Self::DecimalFormat => "DECODE_DECIMAL",
            Self::Overflow => "DECODE_OVERFLOW",
        }
    }
}

/// Block decoding failures, one variant per field so wallets can surface the
/// offending input precisely.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("Unknown block type")]
    Type,
    #[error("Unknown or disallowed opcode")]
    Opcode,
    #[error("Stream decode failed")]
    Stream,
    #[error("Note exceeds the maximum length")]
    NoteLength,
    #[error("Invalid credit field")]
    JsonCredit,
    #[error("Invalid counter field")]
    JsonCounter,
    #[error("Invalid timestamp field")]
    JsonTimestamp,
    #[error("Invalid height field")]
    JsonHeight,
    #[error("Invalid account field")]
    JsonAccount,
    #[error("Invalid previous field")]
    JsonPrevious,
    #[error("Invalid representative field")]
    JsonRepresentative,
    #[error("Invalid balance field")]
    JsonBalance,
    #[error("Invalid link field")]
    JsonLink,
    #[error("Invalid note_length field")]
    JsonNoteLength,
    #[error("Invalid note type field")]
    JsonNoteType,
    #[error("Invalid note encode field")]
    JsonNoteEncode,
    #[error("Invalid note data field")]
    JsonNoteData,
    #[error("Invalid signature field")]
    JsonSignature,
    #[error("Invalid price field")]
    JsonPrice,
    #[error("Invalid begin_time field")]
    JsonBeginTime,
    #[error("Invalid end_time field")]
    JsonEndTime,
    #[error("Invalid chain field")]
    JsonChain,
    #[error("Not a JSON object")]
    JsonObject,
}

impl ErrorCode for BlockError {
    fn code(&self) -> &'static str {
        match self {
            Self::Type => "BLOCK_TYPE",
            Self::Opcode => "BLOCK_OPCODE",
            Self::Stream => "STREAM",
            Self::NoteLength => "NOTE_LENGTH",
            Self::JsonCredit => "JSON_BLOCK_CREDIT",
            Self::JsonCounter => "JSON_BLOCK_COUNTER",
            Self::JsonTimestamp => "JSON_BLOCK_TIMESTAMP",
            Self::JsonHeight => "JSON_BLOCK_HEIGHT",
            Self::JsonAccount => "JSON_BLOCK_ACCOUNT",
            Self::JsonPrevious => "JSON_BLOCK_PREVIOUS",
            Self::JsonRepresentative => "JSON_BLOCK_REPRESENTATIVE",
            Self::JsonBalance => "JSON_BLOCK_BALANCE",
            Self::JsonLink => "JSON_BLOCK_LINK",
            Self::JsonNoteLength => "JSON_BLOCK_NOTE_LENGTH",
            Self::JsonNoteType => "JSON_BLOCK_NOTE_TYPE",
            Self::JsonNoteEncode => "JSON_BLOCK_NOTE_ENCODE",
            Self::JsonNoteData => "JSON_BLOCK_NOTE_DATA",
            Self::JsonSignature => "JSON_BLOCK_SIGNATURE",
            Self::JsonPrice => "JSON_BLOCK_PRICE",
            Self::JsonBeginTime => "JSON_BLOCK_BEGIN_TIME",
            Self::JsonEndTime => "JSON_BLOCK_END_TIME",
            Self::JsonChain => "JSON_BLOCK_CHAIN",
            Self::JsonObject => "JSON_GENERIC",
        }
    }
}

impl From<CodecError> for BlockError {
    fn from(_: CodecError) -> Self {
        BlockError::Stream
    }
}

/// Persistent store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The storage backend reported an error.
    #[error("Store backend error: {0}")]
    Backend(String),
    /// A stored value failed to decode.
    #[error("Stored value decode failed: {0}")]
    Decode(String),
    /// The requested key was not found.
    #[error("Record not found")]
    NotFound,
    /// The database schema version is newer than this binary supports.
    #[error("Unsupported schema version {found}, max {supported}")]
    Version {
        /// Version stamped in the database.
        found: u32,
        /// Highest version this binary can open.
        supported: u32,
    },
    /// The store contradicts a ledger invariant. Never auto-repaired.
    #[error("Ledger inconsistent: {0}")]
    Inconsistent(String),
}

impl ErrorCode for LedgerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "LEDGER_BACKEND",
            Self::Decode(_) => "LEDGER_DECODE",
            Self::NotFound => "LEDGER_NOT_FOUND",
            Self::Version { .. } => "LEDGER_VERSION",
            Self::Inconsistent(_) => "LEDGER_INCONSISTENT",
        }
    }
}

/// Block processor outcomes.
///
/// Most of these are business results rather than faults: gap kinds park the
/// block, `Fork` spawns a fork submission, `Exists` is benign. The dynamic
/// operation driver matches on them to decide pop / continue / wait / abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Unknown block type")]
    TypeUnknown,
    #[error("Bad block signature")]
    Signature,
    #[error("Block timestamp out of bounds")]
    Timestamp,
    #[error("Block already present")]
    Exists,
    #[error("Previous block unknown")]
    GapPrevious,
    #[error("Receive source unknown")]
    GapReceiveSource,
    #[error("Reward source unknown")]
    GapRewardSource,
    #[error("Previous hash mismatch")]
    Previous,
    #[error("Opcode not allowed here")]
    Opcode,
    #[error("Credit rule violated")]
    Credit,
    #[error("Counter rule violated")]
    Counter,
    #[error("Daily transaction quota exceeded")]
    AccountExceedTransactions,
    #[error("Balance rule violated")]
    Balance,
    #[error("No matching receivable")]
    Unreceivable,
    #[error("No matching rewardable")]
    Unrewardable,
    #[error("Height below the pruned tail")]
    Pruned,
    #[error("Conflicting block at this height")]
    Fork,
    #[error("Block type differs from the account chain")]
    TypeMismatch,
    #[error("Representative changed outside a change block")]
    Representative,
    #[error("Link rule violated")]
    Link,
    #[error("Invalid target chain")]
    Chain,
    #[error("Binding quota exceeded")]
    BindingCount,
    #[error("Prepend does not attach to the tail")]
    PrependIgnore,
    #[error("Rollback target not in the ledger")]
    RollbackIgnore,
    #[error("Rollback reached the stored tail")]
    RollbackTail,
    #[error("Rollback target is not the head")]
    RollbackNonHead,
    #[error("Rollback target differs from the stored head")]
    RollbackNotEqualToHead,
    #[error("Rewardable already consumed by the representative")]
    RollbackRewarded,
    #[error("Send already received by the destination")]
    RollbackReceived,
    #[error("Receive source pruned away")]
    RollbackSourcePruned,
    #[error("Block to confirm is missing")]
    ConfirmBlockMiss,
    #[error("Unknown forced operation")]
    UnknownOperation,
    /// A store-level failure inside a processor step; aborts the transaction.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// The store contradicts the chain. Context is logged at the source.
    #[error("Ledger inconsistent at {account}#{height} ({hash})")]
    Inconsistent {
        account: Account,
        height: u64,
        hash: BlockHash,
    },
}

impl ErrorCode for ProcessError {
    fn code(&self) -> &'static str {
        match self {
            Self::TypeUnknown => "BLOCK_PROCESS_TYPE_UNKNOWN",
            Self::Signature => "BLOCK_PROCESS_SIGNATURE",
            Self::Timestamp => "BLOCK_PROCESS_TIMESTAMP",
            Self::Exists => "BLOCK_PROCESS_EXISTS",
            Self::GapPrevious => "BLOCK_PROCESS_GAP_PREVIOUS",
            Self::GapReceiveSource => "BLOCK_PROCESS_GAP_RECEIVE_SOURCE",
            Self::GapRewardSource => "BLOCK_PROCESS_GAP_REWARD_SOURCE",
            Self::Previous => "BLOCK_PROCESS_PREVIOUS",
            Self::Opcode => "BLOCK_PROCESS_OPCODE",
            Self::Credit => "BLOCK_PROCESS_CREDIT",
            Self::Counter => "BLOCK_PROCESS_COUNTER",
            Self::AccountExceedTransactions => "BLOCK_PROCESS_ACCOUNT_EXCEED_TRANSACTIONS",
            Self::Balance => "BLOCK_PROCESS_BALANCE",
            Self::Unreceivable => "BLOCK_PROCESS_UNRECEIVABLE",
            Self::Unrewardable => "BLOCK_PROCESS_UNREWARDABLE",
            Self::Pruned => "BLOCK_PROCESS_PRUNED",
            Self::Fork => "BLOCK_PROCESS_FORK",
            Self::TypeMismatch => "BLOCK_PROCESS_TYPE_MISMATCH",
            Self::Representative => "BLOCK_PROCESS_REPRESENTATIVE",
            Self::Link => "BLOCK_PROCESS_LINK",
            Self::Chain => "BLOCK_PROCESS_CHAIN",
            Self::BindingCount => "BLOCK_PROCESS_BINDING_COUNT",
            Self::PrependIgnore => "BLOCK_PROCESS_PREPEND_IGNORE",
            Self::RollbackIgnore => "BLOCK_PROCESS_ROLLBACK_IGNORE",
            Self::RollbackTail => "BLOCK_PROCESS_ROLLBACK_TAIL",
            Self::RollbackNonHead => "BLOCK_PROCESS_ROLLBACK_NON_HEAD",
            Self::RollbackNotEqualToHead => "BLOCK_PROCESS_ROLLBACK_NOT_EQUAL_TO_HEAD",
            Self::RollbackRewarded => "BLOCK_PROCESS_ROLLBACK_REWARDED",
            Self::RollbackReceived => "BLOCK_PROCESS_ROLLBACK_RECEIVED",
            Self::RollbackSourcePruned => "BLOCK_PROCESS_ROLLBACK_SOURCE_PRUNED",
            Self::ConfirmBlockMiss => "BLOCK_PROCESS_CONFIRM_BLOCK_MISS",
            Self::UnknownOperation => "BLOCK_PROCESS_UNKNOWN_OPERATION",
            Self::Ledger(_) => "BLOCK_PROCESS_LEDGER",
            Self::Inconsistent { .. } => "LEDGER_INCONSISTENT",
        }
    }
}

/// Bootstrap protocol failures. Any of these aborts the connection and moves
/// the client to another peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("Failed to connect to peer")]
    Connect,
    #[error("Failed to send to peer")]
    Send,
    #[error("Failed to receive from peer")]
    Receive,
    #[error("Stream decode failed")]
    Stream,
    #[error("Account entries out of order")]
    Account,
    #[error("Batch exceeded the requested size")]
    Size,
    #[error("Fork frame length out of bounds")]
    ForkLength,
    #[error("Invalid fork block pair")]
    ForkBlock,
    #[error("Unknown bootstrap mode")]
    Mode,
    #[error("Unexpected message type")]
    MessageType,
    #[error("No peer available")]
    Peer,
    #[error("Bootstrap counter was reset")]
    Reset,
    #[error("Attack heuristic triggered")]
    Attack,
    #[error("Connection below the throughput floor")]
    SlowConnection,
}

impl ErrorCode for BootstrapError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connect => "BOOTSTRAP_CONNECT",
            Self::Send => "BOOTSTRAP_SEND",
            Self::Receive => "BOOTSTRAP_RECEIVE",
            Self::Stream => "STREAM",
            Self::Account => "BOOTSTRAP_ACCOUNT",
            Self::Size => "BOOTSTRAP_SIZE",
            Self::ForkLength => "BOOTSTRAP_FORK_LENGTH",
            Self::ForkBlock => "BOOTSTRAP_FORK_BLOCK",
            Self::Mode => "BOOTSTRAP_TYPE",
            Self::MessageType => "BOOTSTRAP_MESSAGE_TYPE",
            Self::Peer => "BOOTSTRAP_PEER",
            Self::Reset => "BOOTSTRAP_RESET",
            Self::Attack => "BOOTSTRAP_ATTACK",
            Self::SlowConnection => "BOOTSTRAP_SLOW_CONNECTION",
        }
    }
}

/// Cryptographic failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    Signature,
    #[error("Invalid key material")]
    Key,
    #[error("Address has the wrong prefix")]
    AddressPrefix,
    #[error("Address has the wrong length")]
    AddressLength,
    #[error("Address contains an invalid character")]
    AddressAlphabet,
    #[error("Address checksum mismatch")]
    AddressChecksum,
    #[error("Key derivation failed")]
    Kdf,
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::Signature => "CRYPTO_SIGNATURE",
            Self::Key => "CRYPTO_KEY",
            Self::AddressPrefix => "ACCOUNT_PREFIX",
            Self::AddressLength => "ACCOUNT_LENGTH",
            Self::AddressAlphabet => "ACCOUNT_CHARACTER",
            Self::AddressChecksum => "ACCOUNT_CHECKSUM",
            Self::Kdf => "CRYPTO_KDF",
        }
    }
}

/// Wallet-facing failures, surfaced to the user per action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet is locked")]
    Locked,
    #[error("Account already exists in the wallet")]
    AccountExists,
    #[error("Account not found in the wallet")]
    AccountGet,
    #[error("Wallet clock is not synchronized")]
    TimeSync,
    #[error("Account is restricted by pending forks")]
    Restricted,
    #[error("Daily transaction quota exhausted")]
    ActionCredit,
    #[error("Insufficient balance for this action")]
    ActionBalance,
    #[error("Credit can not increase past the maximum")]
    MaxCredit,
    #[error("Receivable can not fund the initial credit")]
    ReceivableLessThanCredit,
    #[error("Unsupported block type for this chain")]
    BlockType,
    #[error("Block timestamp ahead of the clock bound")]
    Timestamp,
    #[error("Note exceeds the maximum length")]
    NoteLength,
    #[error("Account info missing from the follower ledger")]
    AccountInfoGet,
    #[error("Receivable missing from the follower ledger")]
    ReceivableInfoGet,
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ErrorCode for WalletError {
    fn code(&self) -> &'static str {
        match self {
            Self::Locked => "WALLET_LOCKED",
            Self::AccountExists => "WALLET_ACCOUNT_EXISTS",
            Self::AccountGet => "WALLET_ACCOUNT_GET",
            Self::TimeSync => "WALLET_TIME_SYNC",
            Self::Restricted => "ACCOUNT_RESTRICTED",
            Self::ActionCredit => "ACCOUNT_ACTION_CREDIT",
            Self::ActionBalance => "ACCOUNT_ACTION_BALANCE",
            Self::MaxCredit => "ACCOUNT_MAX_CREDIT",
            Self::ReceivableLessThanCredit => "WALLET_RECEIVABLE_LESS_THAN_CREDIT",
            Self::BlockType => "BLOCK_TYPE",
            Self::Timestamp => "BLOCK_TIMESTAMP",
            Self::NoteLength => "NOTE_LENGTH",
            Self::AccountInfoGet => "LEDGER_ACCOUNT_INFO_GET",
            Self::ReceivableInfoGet => "LEDGER_RECEIVABLE_INFO_GET",
            Self::Ledger(e) => e.code(),
            Self::Crypto(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BlockError::JsonCredit.code(), "JSON_BLOCK_CREDIT");
        assert_eq!(
            ProcessError::AccountExceedTransactions.code(),
            "BLOCK_PROCESS_ACCOUNT_EXCEED_TRANSACTIONS"
        );
        assert_eq!(
            ProcessError::Inconsistent {
                account: Account::ZERO,
                height: 0,
                hash: BlockHash::ZERO,
            }
            .code(),
            "LEDGER_INCONSISTENT"
        );
        assert_eq!(BootstrapError::SlowConnection.code(), "BOOTSTRAP_SLOW_CONNECTION");
    }
}
