//! Outgoing block construction.
//!
//! Builders apply the same rules the network's processor will enforce
//! (counter and credit arithmetic, balance deltas, the fork restriction, a
//! bounded timestamp) and then sign with the wallet key. The caller applies
//! the result to the follower ledger and publishes it.

use crate::wallet::Wallet;
use strand_ledger::{Ledger, Transaction};
use strand_types::block::{AdBlock, Note, TxBlock};
use strand_types::params::{
    credit_price, max_allowed_forks, same_day, TRANSACTIONS_PER_CREDIT,
};
use strand_types::{
    Account, AccountInfo, Amount, Block, BlockHash, BlockOpcode, BlockType, U256, WalletError,
};

/// A built, signed, not yet published block.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub block: Block,
}

struct ChainHead {
    info: AccountInfo,
    head: Block,
}

fn chain_head(
    ledger: &Ledger,
    txn: &Transaction,
    account: &Account,
) -> Result<ChainHead, WalletError> {
    let info = ledger
        .account_info_get(txn, account)?
        .ok_or(WalletError::AccountInfoGet)?;
    let head = ledger
        .block_get(txn, &info.head)?
        .ok_or(WalletError::AccountInfoGet)?;
    Ok(ChainHead { info, head })
}

struct SuccessorFrame {
    credit: u16,
    counter: u32,
    timestamp: u64,
    height: u64,
    previous: BlockHash,
}

/// Shared successor arithmetic: timestamp window, fork restriction and the
/// daily counter.
fn successor_frame(
    chain: &ChainHead,
    now: u64,
    min_timestamp: Option<u64>,
) -> Result<SuccessorFrame, WalletError> {
    let credit = chain.head.credit();
    let mut timestamp = now.max(chain.head.timestamp());
    if let Some(min) = min_timestamp {
        timestamp = timestamp.max(min);
    }
    if timestamp > now + 60 {
        return Err(WalletError::Timestamp);
    }
    if chain.info.forks > max_allowed_forks(timestamp, credit) {
        return Err(WalletError::Restricted);
    }
    let counter = if same_day(timestamp, chain.head.timestamp()) {
        chain.head.counter() + 1
    } else {
        1
    };
    if counter > credit as u32 * TRANSACTIONS_PER_CREDIT {
        return Err(WalletError::ActionCredit);
    }
    Ok(SuccessorFrame {
        credit,
        counter,
        timestamp,
        height: chain.head.height() + 1,
        previous: chain.info.head,
    })
}

fn sign_tx_block(
    wallet: &Wallet,
    account: &Account,
    opcode: BlockOpcode,
    frame: &SuccessorFrame,
    representative: Account,
    balance: Amount,
    link: U256,
    note: Note,
) -> Result<Block, WalletError> {
    let key = wallet.private_key(account)?;
    Ok(Block::Tx(TxBlock::new(
        opcode,
        frame.credit,
        frame.counter,
        frame.timestamp,
        frame.height,
        *account,
        frame.previous,
        representative,
        balance,
        link,
        note,
        &key.signing_key(),
    )))
}

/// Builds a send of `amount` to `destination`.
pub fn account_send(
    ledger: &Ledger,
    txn: &Transaction,
    wallet: &Wallet,
    account: &Account,
    destination: &Account,
    amount: Amount,
    note: Note,
    now: u64,
) -> Result<ActionResult, WalletError> {
    if !wallet.valid_password() {
        return Err(WalletError::Locked);
    }
    let chain = chain_head(ledger, txn, account)?;
    let frame = successor_frame(&chain, now, None)?;
    if chain.head.balance() < amount {
        return Err(WalletError::ActionBalance);
    }
    let balance = Amount(chain.head.balance().0 - amount.0);

    let block = match chain.info.block_type {
        BlockType::Transaction => sign_tx_block(
            wallet,
            account,
            BlockOpcode::Send,
            &frame,
            chain.head.representative(),
            balance,
            *destination,
            note,
        )?,
        _ => return Err(WalletError::BlockType),
    };
    Ok(ActionResult { block })
}

/// Builds the receive of a pending send, opening the account when needed.
pub fn account_receive(
    ledger: &Ledger,
    txn: &Transaction,
    wallet: &Wallet,
    account: &Account,
    send_hash: &BlockHash,
    fallback_representative: Account,
    now: u64,
) -> Result<ActionResult, WalletError> {
    if !wallet.valid_password() {
        return Err(WalletError::Locked);
    }
    let receivable = ledger
        .receivable_info_get(txn, account, send_hash)?
        .ok_or(WalletError::ReceivableInfoGet)?;

    match ledger.account_info_get(txn, account)? {
        None => {
            // First block: the receivable must also fund one credit.
            let timestamp = now.max(receivable.timestamp);
            if timestamp > now + 60 {
                return Err(WalletError::Timestamp);
            }
            let price = credit_price(timestamp);
            if receivable.amount < price {
                return Err(WalletError::ReceivableLessThanCredit);
            }
            let balance = Amount(receivable.amount.0 - price.0);
            let key = wallet.private_key(account)?;
            let block = Block::Tx(TxBlock::new(
                BlockOpcode::Receive,
                1,
                1,
                timestamp,
                0,
                *account,
                U256::ZERO,
                fallback_representative,
                balance,
                *send_hash,
                Note::empty(),
                &key.signing_key(),
            ));
            Ok(ActionResult { block })
        }
        Some(_) => {
            let chain = chain_head(ledger, txn, account)?;
            let frame = successor_frame(&chain, now, Some(receivable.timestamp))?;
            let balance = Amount(chain.head.balance().0 + receivable.amount.0);
            let block = match chain.info.block_type {
                BlockType::Transaction => sign_tx_block(
                    wallet,
                    account,
                    BlockOpcode::Receive,
                    &frame,
                    chain.head.representative(),
                    balance,
                    *send_hash,
                    Note::empty(),
                )?,
                _ => return Err(WalletError::BlockType),
            };
            Ok(ActionResult { block })
        }
    }
}

/// Builds a representative change.
pub fn account_change(
    ledger: &Ledger,
    txn: &Transaction,
    wallet: &Wallet,
    account: &Account,
    representative: Option<Account>,
    now: u64,
) -> Result<ActionResult, WalletError> {
    if !wallet.valid_password() {
        return Err(WalletError::Locked);
    }
    let chain = chain_head(ledger, txn, account)?;
    let frame = successor_frame(&chain, now, None)?;
    let representative = representative.unwrap_or_else(|| chain.head.representative());

    let block = match chain.info.block_type {
        BlockType::Transaction => sign_tx_block(
            wallet,
            account,
            BlockOpcode::Change,
            &frame,
            representative,
            chain.head.balance(),
            U256::ZERO,
            Note::empty(),
        )?,
        _ => return Err(WalletError::BlockType),
    };
    Ok(ActionResult { block })
}

/// Builds a credit purchase of `credit_inc` additional credits.
pub fn account_credit(
    ledger: &Ledger,
    txn: &Transaction,
    wallet: &Wallet,
    account: &Account,
    credit_inc: u16,
    now: u64,
) -> Result<ActionResult, WalletError> {
    if !wallet.valid_password() {
        return Err(WalletError::Locked);
    }
    let chain = chain_head(ledger, txn, account)?;

    let credit = chain.head.credit().checked_add(credit_inc);
    let Some(credit) = credit.filter(|c| *c > chain.head.credit()) else {
        return Err(WalletError::MaxCredit);
    };

    // The counter is checked against the raised quota: a purchase may
    // rescue an account that exhausted today's allowance.
    let timestamp = now.max(chain.head.timestamp());
    if timestamp > now + 60 {
        return Err(WalletError::Timestamp);
    }
    let counter = if same_day(timestamp, chain.head.timestamp()) {
        chain.head.counter() + 1
    } else {
        1
    };
    if counter > credit as u32 * TRANSACTIONS_PER_CREDIT {
        return Err(WalletError::ActionCredit);
    }
    let frame = SuccessorFrame {
        credit,
        counter,
        timestamp,
        height: chain.head.height() + 1,
        previous: chain.info.head,
    };

    let cost = Amount(credit_price(frame.timestamp).0.saturating_mul(credit_inc as u128));
    if cost > chain.head.balance() {
        return Err(WalletError::ActionBalance);
    }
    let balance = Amount(chain.head.balance().0 - cost.0);

    let block = match chain.info.block_type {
        BlockType::Transaction => sign_tx_block(
            wallet,
            account,
            BlockOpcode::Credit,
            &frame,
            chain.head.representative(),
            balance,
            U256::ZERO,
            Note::empty(),
        )?,
        _ => return Err(WalletError::BlockType),
    };
    Ok(ActionResult { block })
}

/// Builds a destroy, zeroing the balance of an airdrop chain.
pub fn account_destroy(
    ledger: &Ledger,
    txn: &Transaction,
    wallet: &Wallet,
    account: &Account,
    now: u64,
) -> Result<ActionResult, WalletError> {
    if !wallet.valid_password() {
        return Err(WalletError::Locked);
    }
    let chain = chain_head(ledger, txn, account)?;
    let frame = successor_frame(&chain, now, None)?;

    let block = match chain.info.block_type {
        BlockType::Airdrop => {
            let key = wallet.private_key(account)?;
            let Block::Ad(head) = &chain.head else {
                return Err(WalletError::BlockType);
            };
            Block::Ad(AdBlock::new(
                BlockOpcode::Destroy,
                frame.credit,
                frame.counter,
                frame.timestamp,
                frame.height,
                *account,
                frame.previous,
                chain.head.representative(),
                Amount::ZERO,
                head.price,
                head.begin_time,
                head.end_time,
                U256::ZERO,
                &key.signing_key(),
            ))
        }
        _ => return Err(WalletError::BlockType),
    };
    Ok(ActionResult { block })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_crypto::RawKey;
    use strand_types::params::{DAY_SECONDS, EPOCH_TIMESTAMP};
    use strand_types::ReceivableInfo;

    const T0: u64 = EPOCH_TIMESTAMP + 1000;

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Ledger,
        wallet: Wallet,
        account: Account,
    }

    /// A wallet whose selected account owns a one-block chain.
    fn fixture(balance: u128) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("wallet.redb")).unwrap();
        let wallet = Wallet::create(RawKey::from_bytes([5u8; 32]));
        let account = wallet.selected_account().unwrap();

        let key = wallet.private_key(&account).unwrap();
        let genesis = Block::Tx(TxBlock::new(
            BlockOpcode::Receive,
            1,
            1,
            T0,
            0,
            account,
            U256::ZERO,
            account,
            Amount(balance),
            U256::from_u64(1),
            Note::empty(),
            &key.signing_key(),
        ));
        let txn = ledger.begin_write().unwrap();
        ledger.block_put(&txn, &genesis.hash(), &genesis).unwrap();
        ledger
            .account_info_put(
                &txn,
                &account,
                &strand_types::AccountInfo::genesis(BlockType::Transaction, genesis.hash()),
            )
            .unwrap();
        txn.commit().unwrap();

        Fixture {
            _dir: dir,
            ledger,
            wallet,
            account,
        }
    }

    #[test]
    fn send_decrements_balance_and_signs() {
        let f = fixture(100);
        let txn = f.ledger.begin_read().unwrap();
        let destination = U256::from_u64(9);
        let result = account_send(
            &f.ledger,
            &txn,
            &f.wallet,
            &f.account,
            &destination,
            Amount(30),
            Note::text("rent").unwrap(),
            T0 + 5,
        )
        .unwrap();

        let block = &result.block;
        assert_eq!(block.opcode(), BlockOpcode::Send);
        assert_eq!(block.balance(), Amount(70));
        assert_eq!(block.link(), destination);
        assert_eq!(block.height(), 1);
        assert_eq!(block.counter(), 2, "same-day counter steps");
        assert!(block.check_signature());

        // Over-spending is refused.
        assert!(matches!(
            account_send(
                &f.ledger,
                &txn,
                &f.wallet,
                &f.account,
                &destination,
                Amount(101),
                Note::empty(),
                T0 + 5,
            ),
            Err(WalletError::ActionBalance)
        ));
    }

    #[test]
    fn counter_resets_across_days() {
        let f = fixture(100);
        let txn = f.ledger.begin_read().unwrap();
        let next_day = (T0 / DAY_SECONDS + 1) * DAY_SECONDS + 5;
        let result = account_send(
            &f.ledger,
            &txn,
            &f.wallet,
            &f.account,
            &U256::from_u64(9),
            Amount(1),
            Note::empty(),
            next_day,
        )
        .unwrap();
        assert_eq!(result.block.counter(), 1);
    }

    #[test]
    fn receive_opens_a_new_account() {
        let f = fixture(100);
        // A separate fresh account in the same wallet.
        let new_id = f.wallet.create_account().unwrap();
        let new_account = f.wallet.account(new_id).unwrap();

        let price = credit_price(T0 + 10);
        let send_hash = U256::from_u64(77);
        let txn = f.ledger.begin_write().unwrap();
        f.ledger
            .receivable_info_put(
                &txn,
                &new_account,
                &send_hash,
                &ReceivableInfo::new(f.account, Amount(price.0 + 40), T0 + 10),
            )
            .unwrap();

        let result = account_receive(
            &f.ledger,
            &txn,
            &f.wallet,
            &new_account,
            &send_hash,
            f.account,
            T0 + 10,
        )
        .unwrap();
        let block = &result.block;
        assert_eq!(block.height(), 0);
        assert_eq!(block.credit(), 1);
        assert_eq!(block.counter(), 1);
        assert_eq!(block.balance(), Amount(40));
        assert_eq!(block.representative(), f.account);
        assert!(block.check_signature());

        // Too small to fund a credit.
        let small_hash = U256::from_u64(78);
        f.ledger
            .receivable_info_put(
                &txn,
                &new_account,
                &small_hash,
                &ReceivableInfo::new(f.account, Amount(price.0 - 1), T0 + 10),
            )
            .unwrap();
        assert!(matches!(
            account_receive(
                &f.ledger,
                &txn,
                &f.wallet,
                &new_account,
                &small_hash,
                f.account,
                T0 + 10,
            ),
            Err(WalletError::ReceivableLessThanCredit)
        ));
    }

    #[test]
    fn change_keeps_balance_and_switches_rep() {
        let f = fixture(100);
        let txn = f.ledger.begin_read().unwrap();
        let new_rep = U256::from_u64(55);
        let result = account_change(
            &f.ledger,
            &txn,
            &f.wallet,
            &f.account,
            Some(new_rep),
            T0 + 5,
        )
        .unwrap();
        assert_eq!(result.block.opcode(), BlockOpcode::Change);
        assert_eq!(result.block.balance(), Amount(100));
        assert_eq!(result.block.representative(), new_rep);
        assert!(result.block.link().is_zero());
    }

    #[test]
    fn credit_purchase_prices_correctly() {
        let f = fixture(10 * credit_price(T0).0);
        let txn = f.ledger.begin_read().unwrap();
        let result =
            account_credit(&f.ledger, &txn, &f.wallet, &f.account, 2, T0 + 5).unwrap();
        let block = &result.block;
        assert_eq!(block.opcode(), BlockOpcode::Credit);
        assert_eq!(block.credit(), 3);
        let expected = 10 * credit_price(T0).0 - 2 * credit_price(T0 + 5).0;
        assert_eq!(block.balance(), Amount(expected));
    }

    #[test]
    fn locked_wallet_builds_nothing() {
        let f = fixture(100);
        f.wallet.lock();
        let txn = f.ledger.begin_read().unwrap();
        assert!(matches!(
            account_send(
                &f.ledger,
                &txn,
                &f.wallet,
                &f.account,
                &U256::from_u64(9),
                Amount(1),
                Note::empty(),
                T0,
            ),
            Err(WalletError::Locked)
        ));
    }
}
