//! Follower ledger apply rules.
//!
//! The wallet stores at most one chain per wallet account and never
//! validates balances or votes: the server's confirmations are trusted. The
//! reduced rules are: extend the head on an exact fit, advance the confirmed
//! height for older known blocks, and when a *confirmed* block contradicts
//! the local head, pop heads into the rollback log until it fits.

use std::sync::Arc;
use strand_ledger::{Ledger, Transaction};
use strand_types::{
    AccountInfo, Block, BlockHash, BlockOpcode, LedgerError, ReceivableInfo, INVALID_HEIGHT, U256,
};
use tracing::{debug, warn};

/// What [`apply_block`] did with an incoming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The block extended (or opened) the chain.
    Extended,
    /// Only the confirmed height moved.
    Confirmed,
    /// Nothing to do.
    Ignored,
    /// The local head was popped; the caller should retry the block.
    RolledBack,
}

/// Applies one canonical block pushed by the server.
pub fn apply_block(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Arc<Block>,
    confirmed: bool,
) -> Result<Applied, LedgerError> {
    let info = ledger.account_info_get(txn, &block.account())?;

    let Some(mut info) = info else {
        // First block of the chain.
        if block.height() != 0 {
            return Ok(Applied::Ignored);
        }
        let mut fresh = AccountInfo::genesis(block.block_type(), block.hash());
        if confirmed {
            fresh.confirmed_height = 0;
        }
        ledger.account_info_put(txn, &block.account(), &fresh)?;
        ledger.block_put(txn, &block.hash(), block)?;
        note_receive(ledger, txn, block)?;
        return Ok(Applied::Extended);
    };

    if block.height() > info.head_height + 1 {
        // A gap; the sync path will fetch the middle.
        return Ok(Applied::Ignored);
    }

    if block.height() == info.head_height + 1 {
        if block.previous() != info.head {
            // The server is building on a head we do not have. Only a
            // confirmed contradiction unwinds local state.
            if !confirmed || info.confirmed_height != info.head_height {
                return Ok(Applied::Ignored);
            }
            info.confirmed_height = if info.head_height == 0 {
                INVALID_HEIGHT
            } else {
                info.head_height - 1
            };
            ledger.account_info_put(txn, &block.account(), &info)?;
            return Ok(Applied::Ignored);
        }

        info.head = block.hash();
        info.head_height = block.height();
        if confirmed {
            info.confirmed_height = block.height();
        }
        ledger.account_info_put(txn, &block.account(), &info)?;
        ledger.block_put(txn, &block.hash(), block)?;
        ledger.block_successor_set(txn, &block.previous(), &block.hash())?;
        note_receive(ledger, txn, block)?;
        return Ok(Applied::Extended);
    }

    // An older block. Unconfirmed old news is ignored.
    if !confirmed {
        return Ok(Applied::Ignored);
    }

    if ledger.block_exists(txn, &block.hash())? {
        if info.confirmed_height != INVALID_HEIGHT && info.confirmed_height >= block.height() {
            return Ok(Applied::Ignored);
        }
        info.confirmed_height = block.height();
        ledger.account_info_put(txn, &block.account(), &info)?;
        return Ok(Applied::Confirmed);
    }

    // A confirmed block we do not hold at a height we do: the local chain
    // lost; pop the head and let the caller retry.
    rollback_head(ledger, txn, &block.account())?;
    Ok(Applied::RolledBack)
}

/// Bookkeeping shared by both receive paths: consume the receivable and
/// remember the source so its notification is not re-applied.
fn note_receive(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), LedgerError> {
    if block.opcode() != BlockOpcode::Receive {
        return Ok(());
    }
    ledger.receivable_info_del(txn, &block.account(), &block.link())?;
    if !ledger.source_exists(txn, &block.link())? {
        ledger.source_put(txn, &block.link(), None)?;
    }
    Ok(())
}

/// Pops the local head into the wallet's own rollback log.
pub fn rollback_head(
    ledger: &Ledger,
    txn: &Transaction,
    account: &strand_types::Account,
) -> Result<(), LedgerError> {
    let Some(info) = ledger.account_info_get(txn, account)? else {
        warn!(target: "wallet", account = %account, "rollback with no account info");
        return Err(LedgerError::Inconsistent("missing account info".into()));
    };
    let Some(head) = ledger.block_get(txn, &info.head)? else {
        warn!(target: "wallet", hash = %info.head, "rollback with missing head block");
        return Err(LedgerError::Inconsistent("missing head block".into()));
    };

    ledger.rollback_block_put(txn, &info.head, &head)?;
    ledger.block_del(txn, &info.head)?;
    if head.height() != 0 {
        ledger.block_successor_set(txn, &head.previous(), &U256::ZERO)?;
    }

    if info.head_height == 0 {
        ledger.account_info_del(txn, account)?;
    } else {
        let mut info = info;
        info.head = head.previous();
        info.head_height -= 1;
        if info.confirmed_height != INVALID_HEIGHT && info.confirmed_height > info.head_height {
            info.confirmed_height = info.head_height;
        }
        ledger.account_info_put(txn, account, &info)?;
    }

    if head.opcode() == BlockOpcode::Receive {
        ledger.source_del(txn, &head.link())?;
    }

    debug!(target: "wallet", account = %account, height = head.height(), "head popped");
    Ok(())
}

/// Handles a server rollback notification: pop local heads while the
/// notified block is still part of the local chain.
pub fn apply_rollback_notification(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Block,
) -> Result<bool, LedgerError> {
    let mut popped = false;
    while ledger.block_exists(txn, &block.hash())? {
        rollback_head(ledger, txn, &block.account())?;
        popped = true;
    }
    Ok(popped)
}

/// Records a receivable notification unless its source was already consumed
/// or the notification is from the future.
pub fn apply_receivable_notification(
    ledger: &Ledger,
    txn: &Transaction,
    account: &strand_types::Account,
    hash: &BlockHash,
    info: &ReceivableInfo,
    source: &Block,
    now: u64,
) -> Result<bool, LedgerError> {
    if info.timestamp > now + 30 {
        return Ok(false);
    }
    if *hash != source.hash() {
        warn!(target: "wallet", claimed = %hash, actual = %source.hash(),
              "receivable notification hash mismatch");
        return Ok(false);
    }
    if ledger.source_exists(txn, hash)? {
        return Ok(false);
    }
    if ledger.receivable_info_get(txn, account, hash)?.is_some() {
        return Ok(false);
    }
    ledger.receivable_info_put(txn, account, hash, info)?;
    ledger.source_put(txn, hash, Some(source))?;
    Ok(true)
}
