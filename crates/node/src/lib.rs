#![forbid(unsafe_code)]

//! Strand node core.
//!
//! The validating block processor, the per-root election pool, the pull
//! bootstrap protocol, wire message codecs, and the node assembly that ties
//! them to a persistent ledger. Transport plumbing (UDP sockets, RPC, the
//! callback bridge) is injected through the [`message::MessageSender`] and
//! [`node::CallbackSink`] traits.

/// Timer thread for scheduled and recurring actions.
pub mod alarm;
/// Bootstrap client, server, listener and driver.
pub mod bootstrap;
/// Injected time source.
pub mod clock;
/// Node configuration.
pub mod config;
/// Election pool and confirm rate control.
pub mod elections;
/// Gap caches for blocks missing a dependency.
pub mod gap_cache;
/// Wire message codecs and the transport trait.
pub mod message;
/// Node assembly and message handlers.
pub mod node;
/// Observer registry and callback envelopes.
pub mod observers;
/// Known-peer bookkeeping.
pub mod peers;
/// The validating block processor.
pub mod processor;
/// Outstanding block queries.
pub mod queries;
/// Counter registry keyed by error codes.
pub mod stats;
/// Chain pulls and the active-account working set.
pub mod syncer;

pub use bootstrap::{Bootstrap, BootstrapClient, BootstrapListener, NodeStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NodeConfig;
pub use elections::{ConfirmManager, ElectionConfig, Elections};
pub use message::{Message, MessageSender, NullSender};
pub use node::{answer_query, CallbackSink, Node};
pub use processor::{BlockForced, BlockFork, BlockOperation, BlockProcessor, ProcessResult};
pub use stats::Stats;

/// Shared helpers for unit and integration tests, in the spirit of a
/// dedicated test-utility crate: deterministic keys, block builders and a
/// recording processor context.
pub mod test_support {
    use crate::processor::ProcessorContext;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use strand_crypto::KeyPair;
    use strand_ledger::Ledger;
    use strand_types::block::{BlockOpcode, Note, TxBlock};
    use strand_types::params::{self, EPOCH_TIMESTAMP, STR};
    use strand_types::{Account, Amount, Block, BlockHash, LedgerError, U256};

    /// A deterministic keypair for tests that need a stable account.
    pub fn fixed_key(tag: u8) -> KeyPair {
        KeyPair::from_private_key(strand_crypto::RawKey::from_bytes([tag; 32]))
    }

    /// A minimal signed send block, mostly for codec-level tests.
    pub fn sample_block() -> Block {
        let key = KeyPair::generate();
        Block::Tx(TxBlock::new(
            BlockOpcode::Send,
            1,
            1,
            EPOCH_TIMESTAMP + 60,
            1,
            key.public_key,
            U256::from_u64(1),
            U256::from_u64(2),
            Amount(10),
            U256::from_u64(3),
            Note::empty(),
            &key.private_key.signing_key(),
        ))
    }

    /// A self-signed genesis send chain opener: height 0, zero previous.
    /// Genesis accounts start with a large balance by construction.
    pub fn genesis_block(key: &KeyPair, balance: Amount, timestamp: u64) -> Block {
        Block::Tx(TxBlock::new(
            BlockOpcode::Receive,
            1,
            1,
            timestamp,
            0,
            key.public_key,
            U256::ZERO,
            key.public_key,
            balance,
            U256::from_u64(1),
            Note::empty(),
            &key.private_key.signing_key(),
        ))
    }

    /// Builds a successor send block for a chain.
    #[allow(clippy::too_many_arguments)]
    pub fn send_block(
        key: &KeyPair,
        head: &Block,
        counter: u32,
        timestamp: u64,
        destination: Account,
        amount: Amount,
    ) -> Block {
        Block::Tx(TxBlock::new(
            BlockOpcode::Send,
            head.credit(),
            counter,
            timestamp,
            head.height() + 1,
            key.public_key,
            head.hash(),
            head.representative(),
            Amount(head.balance().0 - amount.0),
            destination,
            Note::empty(),
            &key.private_key.signing_key(),
        ))
    }

    /// A receive block opening a fresh account from a send.
    pub fn open_block(
        key: &KeyPair,
        send_hash: BlockHash,
        received: Amount,
        timestamp: u64,
        representative: Account,
    ) -> Block {
        let price = params::credit_price(timestamp);
        Block::Tx(TxBlock::new(
            BlockOpcode::Receive,
            1,
            1,
            timestamp,
            0,
            key.public_key,
            U256::ZERO,
            representative,
            Amount(received.0 - price.0),
            send_hash,
            Note::empty(),
            &key.private_key.signing_key(),
        ))
    }

    /// One STR in base units, re-exported for test arithmetic.
    pub const ONE_STR: u128 = STR;

    /// Seeds a genesis chain directly into the ledger: the block, its
    /// account info and the representative weight, bypassing validation the
    /// way a hard-coded genesis record would.
    pub fn seed_genesis(
        ledger: &Ledger,
        key: &KeyPair,
        balance: Amount,
        timestamp: u64,
    ) -> Result<Block, LedgerError> {
        let block = genesis_block(key, balance, timestamp);
        let txn = ledger.begin_write()?;
        ledger.block_put(&txn, &block.hash(), &block)?;
        ledger.account_info_put(
            &txn,
            &block.account(),
            &strand_types::AccountInfo::genesis(block.block_type(), block.hash()),
        )?;
        ledger.rep_weight_add(&txn, &block.representative(), block.balance())?;
        txn.commit()?;
        Ok(block)
    }

    /// Processor context that records every interaction.
    #[derive(Default)]
    pub struct RecordingContext {
        pub published: Mutex<Vec<BlockHash>>,
        pub fork_broadcasts: Mutex<Vec<(BlockHash, BlockHash)>>,
        pub elections: Mutex<Vec<(Account, u64)>>,
        pub queries: Mutex<Vec<(u64, Account, u64, BlockHash)>>,
        pub source_queries: Mutex<Vec<(u64, BlockHash)>>,
    }

    impl ProcessorContext for RecordingContext {
        fn publish(&self, block: &Arc<Block>) {
            self.published.lock().push(block.hash());
        }

        fn broadcast_fork(&self, first: &Arc<Block>, second: &Arc<Block>) {
            self.fork_broadcasts
                .lock()
                .push((first.hash(), second.hash()));
        }

        fn start_election(&self, first: &Arc<Block>, _second: &Arc<Block>) {
            self.elections
                .lock()
                .push((first.account(), first.height()));
        }

        fn fork_event(&self, _added: bool, _first: &Arc<Block>, _second: &Arc<Block>) {}

        fn query_block(
            &self,
            operation: u64,
            account: Account,
            height: u64,
            hash: BlockHash,
            _for_prepend: bool,
        ) {
            self.queries.lock().push((operation, account, height, hash));
        }

        fn query_source(&self, operation: u64, hash: BlockHash) {
            self.source_queries.lock().push((operation, hash));
        }
    }
}
