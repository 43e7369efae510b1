//! Append validation and ledger effects, one routine per opcode.
//!
//! Shared checks run first: known type, signature, timestamp window, and
//! hash novelty. Chain extension then validates height/previous/type/
//! timestamp against the stored head, the credit and counter rules, and the
//! per-opcode balance/link arithmetic before writing the block, the
//! successor link, the account info, the representative weights and any
//! receivable/rewardable side effects inside the caller's transaction.

use std::sync::Arc;
use strand_ledger::{Ledger, Transaction};
use strand_types::params::{
    allowed_bindings, credit_price, reward_amount, reward_timestamp, same_day, EPOCH_TIMESTAMP,
    MAX_TIMESTAMP_DIFF, TRANSACTIONS_PER_CREDIT,
};
use strand_types::{
    AccountInfo, Amount, BindingEntry, Block, BlockOpcode, Chain, ProcessError, ReceivableInfo,
    RewardableInfo,
};

pub(super) fn append_block(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Arc<Block>,
    now: u64,
) -> Result<(), ProcessError> {
    check_common(ledger, txn, block, now)?;
    match block.opcode() {
        BlockOpcode::Send => append_send(ledger, txn, block),
        BlockOpcode::Receive => append_receive(ledger, txn, block),
        BlockOpcode::Change => append_change(ledger, txn, block),
        BlockOpcode::Credit => append_credit(ledger, txn, block),
        BlockOpcode::Reward => append_reward(ledger, txn, block),
        BlockOpcode::Destroy => append_destroy(ledger, txn, block),
        BlockOpcode::Bind => append_bind(ledger, txn, block),
    }
}

fn check_common(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Block,
    now: u64,
) -> Result<(), ProcessError> {
    if !block.check_signature() {
        return Err(ProcessError::Signature);
    }
    let timestamp = block.timestamp();
    if timestamp < EPOCH_TIMESTAMP || timestamp > now + MAX_TIMESTAMP_DIFF {
        return Err(ProcessError::Timestamp);
    }
    if ledger.block_exists(txn, &block.hash())? {
        return Err(ProcessError::Exists);
    }
    Ok(())
}

/// Rules for the first block of a new chain.
fn check_first_common(block: &Block) -> Result<(), ProcessError> {
    if block.height() != 0 {
        return Err(ProcessError::GapPrevious);
    }
    if block.credit() == 0 {
        return Err(ProcessError::Credit);
    }
    if !block.previous().is_zero() {
        return Err(ProcessError::Previous);
    }
    Ok(())
}

/// Rules for extending an existing chain.
fn check_successor_common(
    block: &Block,
    head: &Block,
    info: &AccountInfo,
) -> Result<(), ProcessError> {
    let height = block.height();
    if height < info.tail_height {
        return Err(ProcessError::Pruned);
    } else if height <= info.head_height {
        return Err(ProcessError::Fork);
    } else if height > info.head_height + 1 {
        return Err(ProcessError::GapPrevious);
    }
    if block.block_type() != info.block_type {
        return Err(ProcessError::TypeMismatch);
    }
    if block.previous() != info.head {
        return Err(ProcessError::Previous);
    }
    if block.timestamp() < head.timestamp() {
        return Err(ProcessError::Timestamp);
    }
    Ok(())
}

/// Counter must step by one within a UTC day and restart at one across the
/// boundary; either way it may not exceed the daily quota.
fn check_counter_increase(previous: &Block, block: &Block) -> Result<(), ProcessError> {
    if same_day(block.timestamp(), previous.timestamp()) {
        if block.counter() != previous.counter() + 1 {
            return Err(ProcessError::Counter);
        }
        if block.counter() > block.credit() as u32 * TRANSACTIONS_PER_CREDIT {
            return Err(ProcessError::AccountExceedTransactions);
        }
    } else if block.counter() != 1 {
        return Err(ProcessError::Counter);
    }
    Ok(())
}

/// Rewards do not consume quota: the counter stays put within a day and
/// resets to zero across the boundary.
fn check_counter_same(previous: &Block, block: &Block) -> Result<(), ProcessError> {
    if same_day(block.timestamp(), previous.timestamp()) {
        if block.counter() == previous.counter() {
            return Ok(());
        }
    } else if block.counter() == 0 {
        return Ok(());
    }
    Err(ProcessError::Counter)
}

/// Opcodes that carry a representative may not change it; only a change
/// block may differ from its predecessor.
fn check_representative_same(previous: &Block, block: &Block) -> Result<(), ProcessError> {
    if !block.has_representative() {
        return Ok(());
    }
    if previous.representative() == block.representative() {
        return Ok(());
    }
    Err(ProcessError::Representative)
}

/// Looks up the account and its head block; `None` means the account does
/// not exist yet.
fn account_head(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Block,
) -> Result<Option<(AccountInfo, Block)>, ProcessError> {
    let Some(info) = ledger.account_info_get(txn, &block.account())? else {
        return Ok(None);
    };
    let Some(head) = ledger.block_get(txn, &info.head)? else {
        return Err(ProcessError::Inconsistent {
            account: block.account(),
            height: info.head_height,
            hash: info.head,
        });
    };
    Ok(Some((info, head)))
}

/// The shared error when a non-initial opcode arrives for an unknown chain.
fn reject_missing_account(block: &Block) -> ProcessError {
    if block.height() != 0 {
        ProcessError::GapPrevious
    } else {
        ProcessError::Opcode
    }
}

fn put_block_successor(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    ledger.block_put(txn, &block.hash(), block)?;
    ledger.block_successor_set(txn, &block.previous(), &block.hash())?;
    Ok(())
}

fn update_account_info(
    ledger: &Ledger,
    txn: &Transaction,
    block: &Block,
    info: &AccountInfo,
) -> Result<(), ProcessError> {
    let mut info = info.clone();
    info.head = block.hash();
    info.head_height = block.height();
    ledger.account_info_put(txn, &block.account(), &info)?;
    Ok(())
}

/// Moves the delegated weight from the old representative to the new one.
fn update_rep_weights(
    ledger: &Ledger,
    txn: &Transaction,
    previous: &Block,
    block: &Block,
) -> Result<(), ProcessError> {
    if !block.has_representative() {
        return Ok(());
    }
    ledger.rep_weight_sub(txn, &previous.representative(), previous.balance())?;
    ledger.rep_weight_add(txn, &block.representative(), block.balance())?;
    Ok(())
}

/// Accrues the reward the previous block earned for its representative over
/// the interval to this block.
fn put_rewardable(
    ledger: &Ledger,
    txn: &Transaction,
    previous: &Block,
    block: &Block,
) -> Result<(), ProcessError> {
    if !previous.has_representative() {
        return Ok(());
    }
    let amount = reward_amount(previous.balance(), previous.timestamp(), block.timestamp());
    let valid_from = reward_timestamp(previous.timestamp(), block.timestamp());
    if !amount.is_zero() && valid_from != 0 {
        let info = RewardableInfo::new(previous.account(), amount, valid_from);
        ledger.rewardable_info_put(txn, &previous.representative(), &previous.hash(), &info)?;
    }
    Ok(())
}

/// Chain-extension effects shared by every opcode.
fn apply_successor(
    ledger: &Ledger,
    txn: &Transaction,
    head: &Block,
    info: &AccountInfo,
    block: &Block,
) -> Result<(), ProcessError> {
    put_block_successor(ledger, txn, block)?;
    update_account_info(ledger, txn, block, info)?;
    update_rep_weights(ledger, txn, head, block)?;
    put_rewardable(ledger, txn, head, block)?;
    Ok(())
}

fn append_send(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    let Some((info, head)) = account_head(ledger, txn, block)? else {
        return Err(reject_missing_account(block));
    };
    check_successor_common(block, &head, &info)?;
    if block.credit() != head.credit() {
        return Err(ProcessError::Credit);
    }
    check_counter_increase(&head, block)?;
    check_representative_same(&head, block)?;
    if block.balance() >= head.balance() {
        return Err(ProcessError::Balance);
    }

    apply_successor(ledger, txn, &head, &info, block)?;

    let amount = Amount(head.balance().0 - block.balance().0);
    let receivable = ReceivableInfo::new(block.account(), amount, block.timestamp());
    ledger.receivable_info_put(txn, &block.link(), &block.hash(), &receivable)?;
    Ok(())
}

fn append_receive(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    match account_head(ledger, txn, block)? {
        None => {
            check_first_common(block)?;
            if block.counter() != 1 {
                return Err(ProcessError::Counter);
            }
            let Some(source) = ledger.block_get(txn, &block.link())? else {
                return Err(ProcessError::GapReceiveSource);
            };
            if block.timestamp() < source.timestamp() {
                return Err(ProcessError::Timestamp);
            }
            let Some(receivable) =
                ledger.receivable_info_get(txn, &block.account(), &block.link())?
            else {
                return Err(ProcessError::Unreceivable);
            };

            // First block: the receivable funds the initial credit purchase,
            // the rest becomes the opening balance.
            let price = credit_price(block.timestamp());
            let expected = price
                .0
                .checked_mul(block.credit() as u128)
                .and_then(|cost| cost.checked_add(block.balance().0));
            if expected != Some(receivable.amount.0) {
                return Err(ProcessError::Balance);
            }

            ledger.block_put(txn, &block.hash(), block)?;
            ledger.account_info_put(
                txn,
                &block.account(),
                &AccountInfo::genesis(block.block_type(), block.hash()),
            )?;
            if block.has_representative() {
                ledger.rep_weight_add(txn, &block.representative(), block.balance())?;
            }
            ledger.receivable_info_del(txn, &block.account(), &block.link())?;
            Ok(())
        }
        Some((info, head)) => {
            check_successor_common(block, &head, &info)?;
            if block.credit() != head.credit() {
                return Err(ProcessError::Credit);
            }
            check_counter_increase(&head, block)?;
            check_representative_same(&head, block)?;
            let Some(source) = ledger.block_get(txn, &block.link())? else {
                return Err(ProcessError::GapReceiveSource);
            };
            if block.timestamp() < source.timestamp() {
                return Err(ProcessError::Timestamp);
            }
            if block.balance() <= head.balance() {
                return Err(ProcessError::Balance);
            }
            let Some(receivable) =
                ledger.receivable_info_get(txn, &block.account(), &block.link())?
            else {
                return Err(ProcessError::Unreceivable);
            };
            let received = Amount(block.balance().0 - head.balance().0);
            if receivable.amount != received {
                return Err(ProcessError::Balance);
            }

            apply_successor(ledger, txn, &head, &info, block)?;
            ledger.receivable_info_del(txn, &block.account(), &block.link())?;
            Ok(())
        }
    }
}

fn append_change(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    let Some((info, head)) = account_head(ledger, txn, block)? else {
        return Err(reject_missing_account(block));
    };
    check_successor_common(block, &head, &info)?;
    if block.credit() != head.credit() {
        return Err(ProcessError::Credit);
    }
    check_counter_increase(&head, block)?;
    if block.balance() != head.balance() {
        return Err(ProcessError::Balance);
    }
    if !block.link().is_zero() {
        return Err(ProcessError::Link);
    }

    apply_successor(ledger, txn, &head, &info, block)
}

fn append_credit(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    let Some((info, head)) = account_head(ledger, txn, block)? else {
        return Err(reject_missing_account(block));
    };
    check_successor_common(block, &head, &info)?;
    if block.credit() <= head.credit() {
        return Err(ProcessError::Credit);
    }
    check_counter_increase(&head, block)?;
    check_representative_same(&head, block)?;

    // head.balance = new balance + price × purchased credits.
    let price = credit_price(block.timestamp());
    let purchased = (block.credit() - head.credit()) as u128;
    let expected = price
        .0
        .checked_mul(purchased)
        .and_then(|cost| cost.checked_add(block.balance().0));
    if expected != Some(head.balance().0) {
        return Err(ProcessError::Balance);
    }
    if !block.link().is_zero() {
        return Err(ProcessError::Link);
    }

    apply_successor(ledger, txn, &head, &info, block)
}

fn append_reward(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    match account_head(ledger, txn, block)? {
        None => {
            check_first_common(block)?;
            if block.counter() != 0 {
                return Err(ProcessError::Counter);
            }
            let Some(source) = ledger.block_get(txn, &block.link())? else {
                return Err(ProcessError::GapRewardSource);
            };
            if block.timestamp() < source.timestamp() {
                return Err(ProcessError::Timestamp);
            }
            let Some(rewardable) =
                ledger.rewardable_info_get(txn, &block.account(), &block.link())?
            else {
                return Err(ProcessError::Unrewardable);
            };
            if block.timestamp() < rewardable.valid_timestamp {
                return Err(ProcessError::Timestamp);
            }
            let price = credit_price(block.timestamp());
            let expected = price
                .0
                .checked_mul(block.credit() as u128)
                .and_then(|cost| cost.checked_add(block.balance().0));
            if expected != Some(rewardable.amount.0) {
                return Err(ProcessError::Balance);
            }

            ledger.block_put(txn, &block.hash(), block)?;
            ledger.account_info_put(
                txn,
                &block.account(),
                &AccountInfo::genesis(block.block_type(), block.hash()),
            )?;
            ledger.rewardable_info_del(txn, &block.account(), &block.link())?;
            Ok(())
        }
        Some((info, head)) => {
            check_successor_common(block, &head, &info)?;
            if block.credit() != head.credit() {
                return Err(ProcessError::Credit);
            }
            check_counter_same(&head, block)?;
            let Some(source) = ledger.block_get(txn, &block.link())? else {
                return Err(ProcessError::GapRewardSource);
            };
            if block.timestamp() < source.timestamp() {
                return Err(ProcessError::Timestamp);
            }
            if block.balance() <= head.balance() {
                return Err(ProcessError::Balance);
            }
            let Some(rewardable) =
                ledger.rewardable_info_get(txn, &block.account(), &block.link())?
            else {
                return Err(ProcessError::Unrewardable);
            };
            if block.timestamp() < rewardable.valid_timestamp {
                return Err(ProcessError::Timestamp);
            }
            let claimed = Amount(block.balance().0 - head.balance().0);
            if rewardable.amount != claimed {
                return Err(ProcessError::Balance);
            }

            put_block_successor(ledger, txn, block)?;
            update_account_info(ledger, txn, block, &info)?;
            ledger.rewardable_info_del(txn, &block.account(), &block.link())?;
            Ok(())
        }
    }
}

fn append_destroy(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    let Some((info, head)) = account_head(ledger, txn, block)? else {
        return Err(reject_missing_account(block));
    };
    check_successor_common(block, &head, &info)?;
    if block.credit() != head.credit() {
        return Err(ProcessError::Credit);
    }
    check_counter_increase(&head, block)?;
    check_representative_same(&head, block)?;
    if block.balance() >= head.balance() {
        return Err(ProcessError::Balance);
    }

    apply_successor(ledger, txn, &head, &info, block)
}

fn append_bind(ledger: &Ledger, txn: &Transaction, block: &Block) -> Result<(), ProcessError> {
    let Some((info, head)) = account_head(ledger, txn, block)? else {
        return Err(reject_missing_account(block));
    };
    check_successor_common(block, &head, &info)?;
    if block.credit() != head.credit() {
        return Err(ProcessError::Credit);
    }
    check_counter_increase(&head, block)?;
    if block.balance() != head.balance() {
        return Err(ProcessError::Balance);
    }
    if block.bind_chain() == Chain::Invalid {
        return Err(ProcessError::Chain);
    }

    let count = ledger.binding_count_get(txn, &block.account())?;
    if count >= allowed_bindings(head.credit()) {
        return Err(ProcessError::BindingCount);
    }

    let entry = BindingEntry::new(block.bind_chain(), block.link());
    ledger.binding_entry_put(txn, &block.account(), block.height(), &entry)?;
    ledger.binding_count_put(txn, &block.account(), count + 1)?;

    apply_successor(ledger, txn, &head, &info, block)
}
