//! Head removal and its inverse ledger effects.
//!
//! Rolling back is the exact mirror of appending: the block moves to the
//! rollback log, the successor pointer clears, account info steps back one
//! height (or disappears at genesis), representative weights swing back, and
//! consumed receivables/rewardables are restored. Cross-account dependencies
//! surface as distinct outcomes so the dynamic driver can roll back the
//! dependent chain first.

use std::sync::Arc;
use strand_ledger::{Ledger, Transaction};
use strand_types::params::{credit_price, reward_amount, reward_timestamp};
use strand_types::{
    AccountInfo, Amount, Block, BlockOpcode, ProcessError, ReceivableInfo, RewardableInfo,
    INVALID_HEIGHT,
};
use tracing::error;

struct Checked {
    info: AccountInfo,
    previous: Option<Block>,
    delete_rewardable: bool,
}

pub(super) fn rollback_block(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Arc<Block>,
) -> Result<(), ProcessError> {
    let checked = check(ledger, txn, block)?;
    match block.opcode() {
        BlockOpcode::Send => {
            // The send is only reversible while its receivable is unclaimed.
            let Some(_) = ledger.receivable_info_get(txn, &block.link(), &block.hash())? else {
                return Err(ProcessError::RollbackReceived);
            };
            ledger.receivable_info_del(txn, &block.link(), &block.hash())?;
            finish(ledger, txn, block, &checked)
        }
        BlockOpcode::Receive => {
            let Some(source) = ledger.block_get(txn, &block.link())? else {
                return Err(ProcessError::RollbackSourcePruned);
            };
            let amount = reversed_amount(block, checked.previous.as_ref());
            let receivable = ReceivableInfo::new(source.account(), amount, source.timestamp());
            ledger.receivable_info_put(txn, &block.account(), &block.link(), &receivable)?;
            finish(ledger, txn, block, &checked)
        }
        BlockOpcode::Reward => {
            let Some((source, successor_hash)) =
                ledger.block_get_with_successor(txn, &block.link())?
            else {
                return Err(ProcessError::RollbackSourcePruned);
            };
            let Some(successor) = ledger.block_get(txn, &successor_hash)? else {
                error!(target: "processor", hash = %successor_hash,
                       "rollback reward: successor of the source is missing");
                return Err(ProcessError::Inconsistent {
                    account: block.account(),
                    height: block.height(),
                    hash: block.hash(),
                });
            };
            let amount = reversed_amount(block, checked.previous.as_ref());
            let valid_from = reward_timestamp(source.timestamp(), successor.timestamp());
            let rewardable = RewardableInfo::new(source.account(), amount, valid_from);
            ledger.rewardable_info_put(txn, &block.account(), &block.link(), &rewardable)?;
            finish(ledger, txn, block, &checked)
        }
        BlockOpcode::Bind => {
            rollback_binding(ledger, txn, block)?;
            finish(ledger, txn, block, &checked)
        }
        BlockOpcode::Change | BlockOpcode::Credit | BlockOpcode::Destroy => {
            finish(ledger, txn, block, &checked)
        }
    }
}

/// Preconditions shared by every opcode. The block must be the stored head,
/// byte for byte; anything else is either a benign ignore, a routed
/// follow-up or a store inconsistency.
fn check(ledger: &Ledger, txn: &Transaction, block: &Arc<Block>) -> Result<Checked, ProcessError> {
    if !ledger.block_exists(txn, &block.hash())? {
        return Err(ProcessError::RollbackIgnore);
    }

    let Some(info) = ledger.account_info_get(txn, &block.account())? else {
        error!(target: "processor", account = %block.account(),
               "rollback: account info missing for a stored block");
        return Err(inconsistent(block));
    };

    if block.height() < info.tail_height || block.height() > info.head_height {
        error!(target: "processor", account = %block.account(), height = block.height(),
               "rollback: height outside the stored chain");
        return Err(inconsistent(block));
    }

    if info.tail_height == info.head_height && info.tail_height != 0 {
        return Err(ProcessError::RollbackTail);
    }

    if block.height() != info.head_height {
        return Err(ProcessError::RollbackNonHead);
    }
    if block.hash() != info.head {
        error!(target: "processor", hash = %block.hash(),
               "rollback: hash differs from the stored head");
        return Err(inconsistent(block));
    }
    let Some(head) = ledger.block_get(txn, &info.head)? else {
        error!(target: "processor", hash = %info.head,
               "rollback: stored head block missing");
        return Err(inconsistent(block));
    };
    if **block != head {
        return Err(ProcessError::RollbackNotEqualToHead);
    }

    let previous = if block.height() != 0 {
        match ledger.block_get(txn, &block.previous())? {
            Some(previous) => Some(previous),
            None => {
                error!(target: "processor", hash = %block.previous(),
                       "rollback: previous block missing");
                return Err(inconsistent(block));
            }
        }
    } else {
        None
    };

    // If the interval accrued a reward, the matching rewardable must still
    // be unclaimed; otherwise the representative chain unwinds first.
    let mut delete_rewardable = false;
    if block.has_representative() && block.height() != 0 {
        let previous = previous.as_ref().expect("height > 0 has a previous");
        let amount = reward_amount(previous.balance(), previous.timestamp(), block.timestamp());
        if !amount.is_zero() {
            if ledger
                .rewardable_info_get(txn, &previous.representative(), &previous.hash())?
                .is_none()
            {
                return Err(ProcessError::RollbackRewarded);
            }
            delete_rewardable = true;
        }
    }

    Ok(Checked {
        info,
        previous,
        delete_rewardable,
    })
}

fn inconsistent(block: &Block) -> ProcessError {
    ProcessError::Inconsistent {
        account: block.account(),
        height: block.height(),
        hash: block.hash(),
    }
}

/// Amount originally consumed by a receive/reward block: the balance delta,
/// or at genesis the opening balance plus the credit purchase.
fn reversed_amount(block: &Block, previous: Option<&Block>) -> Amount {
    match previous {
        Some(previous) => Amount(block.balance().0 - previous.balance().0),
        None => {
            let price = credit_price(block.timestamp());
            Amount(
                price
                    .0
                    .saturating_mul(block.credit() as u128)
                    .saturating_add(block.balance().0),
            )
        }
    }
}

fn rollback_binding(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    if ledger
        .binding_entry_get(txn, &block.account(), block.height())?
        .is_none()
    {
        error!(target: "processor", hash = %block.hash(),
               "rollback bind: binding entry missing");
        return Err(inconsistent(block));
    }
    let count = ledger.binding_count_get(txn, &block.account())?;
    if count == 0 {
        error!(target: "processor", hash = %block.hash(),
               "rollback bind: binding count is zero");
        return Err(inconsistent(block));
    }
    ledger.binding_entry_del(txn, &block.account(), block.height())?;
    ledger.binding_count_put(txn, &block.account(), count - 1)?;
    Ok(())
}

/// Effects shared by every opcode, in the order the append wrote them.
fn finish(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Arc<Block>,
    checked: &Checked,
) -> Result<(), ProcessError> {
    // Delete the block and clear the successor pointer.
    ledger.block_del(txn, &block.hash())?;
    if block.height() != 0 {
        ledger.block_successor_set(txn, &block.previous(), &strand_types::U256::ZERO)?;
    }

    // Preserve the block for peers still asking about it.
    ledger.rollback_block_put(txn, &block.hash(), block)?;

    // Step the account back one height, or delete it at genesis.
    if block.height() == 0 {
        ledger.account_info_del(txn, &block.account())?;
    } else {
        let mut info = checked.info.clone();
        info.head = block.previous();
        info.head_height = block.height() - 1;
        if info.confirmed_height != INVALID_HEIGHT && info.confirmed_height > info.head_height {
            info.confirmed_height = INVALID_HEIGHT;
        }
        ledger.account_info_put(txn, &block.account(), &info)?;
    }

    if checked.delete_rewardable {
        let previous = checked.previous.as_ref().expect("rewardable implies previous");
        ledger.rewardable_info_del(txn, &previous.representative(), &previous.hash())?;
    }

    if block.has_representative() {
        ledger.rep_weight_sub(txn, &block.representative(), block.balance())?;
        if let Some(previous) = &checked.previous {
            ledger.rep_weight_add(txn, &previous.representative(), previous.balance())?;
        }
    }

    Ok(())
}
