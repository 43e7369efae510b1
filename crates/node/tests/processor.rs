//! End-to-end processor scenarios driven through the public queue API.

mod common;

use common::Harness;
use std::sync::Arc;
use strand_node::processor::{BlockForced, BlockFork, BlockOperation, DYNAMIC_BEGIN};
use strand_node::test_support::{fixed_key, open_block, seed_genesis, send_block, ONE_STR};
use strand_types::params::{credit_price, DAY_SECONDS, EPOCH_TIMESTAMP};
use strand_types::{Amount, Block, U256};

const T0: u64 = EPOCH_TIMESTAMP + 100;

/// S1: a send into a fresh account, received with credit = 1.
#[test]
fn receive_into_new_account() {
    let harness = Harness::new(T0);
    let genesis_key = fixed_key(1);
    let receiver_key = fixed_key(2);

    let genesis =
        seed_genesis(&harness.ledger, &genesis_key, Amount(100 * ONE_STR), T0).unwrap();

    // G sends enough to fund one credit plus 1 STR.
    let price = credit_price(T0);
    let send_amount = Amount(price.0 + ONE_STR);
    let send = Arc::new(send_block(
        &genesis_key,
        &genesis,
        2,
        T0,
        receiver_key.public_key,
        send_amount,
    ));
    harness.processor.add(send.clone());
    assert_eq!(harness.wait_for(send.hash(), BlockOperation::Append), "SUCCESS");

    {
        let txn = harness.ledger.begin_read().unwrap();
        let receivable = harness
            .ledger
            .receivable_info_get(&txn, &receiver_key.public_key, &send.hash())
            .unwrap()
            .expect("send leaves a receivable");
        assert_eq!(receivable.amount, send_amount);
        assert_eq!(receivable.source, genesis_key.public_key);
    }

    // X receives at t1 >= t0 with credit = 1.
    let t1 = T0 + 5;
    let open = Arc::new(open_block(
        &receiver_key,
        send.hash(),
        send_amount,
        t1,
        genesis_key.public_key,
    ));
    harness.processor.add(open.clone());
    assert_eq!(harness.wait_for(open.hash(), BlockOperation::Append), "SUCCESS");

    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &receiver_key.public_key)
        .unwrap()
        .expect("account exists after the open");
    assert_eq!(info.head_height, 0);
    assert_eq!(info.tail_height, 0);
    assert!(
        harness
            .ledger
            .receivable_info_get(&txn, &receiver_key.public_key, &send.hash())
            .unwrap()
            .is_none(),
        "receivable consumed"
    );
    // Opening balance: received minus the credit purchase, delegated to G.
    let weight = harness
        .ledger
        .rep_weight_get(&txn, &genesis_key.public_key)
        .unwrap();
    let genesis_balance = 100 * ONE_STR - send_amount.0;
    assert_eq!(weight, Amount(genesis_balance + ONE_STR));
    drop(txn);

    harness.assert_weight_invariant();

    // Confirm the send; account info records the finalized height.
    harness.processor.add_forced(BlockForced::confirm(send.clone()));
    assert_eq!(harness.wait_for(send.hash(), BlockOperation::Confirm), "SUCCESS");
    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &genesis_key.public_key)
        .unwrap()
        .unwrap();
    assert_eq!(info.confirmed(), Some(1));
}

/// S2: the 21st block of a UTC day violates the quota with credit = 1; the
/// same counter succeeds the next day.
#[test]
fn counter_enforcement_across_day_boundary() {
    let harness = Harness::new(T0);
    let key = fixed_key(3);
    let sink = fixed_key(4).public_key;

    let genesis = seed_genesis(&harness.ledger, &key, Amount(1000 * ONE_STR), T0).unwrap();

    // Genesis consumed counter 1; counters 2..=20 fill the day.
    let mut head = genesis;
    for counter in 2..=20u32 {
        let send = Arc::new(send_block(&key, &head, counter, T0, sink, Amount(1)));
        harness.processor.add(send.clone());
        assert_eq!(
            harness.wait_for(send.hash(), BlockOperation::Append),
            "SUCCESS",
            "counter {counter} fits the quota"
        );
        head = (*send).clone();
    }

    // The 21st transaction of the day is over quota.
    let over = Arc::new(send_block(&key, &head, 21, T0, sink, Amount(1)));
    harness.processor.add(over.clone());
    assert_eq!(
        harness.wait_for(over.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_ACCOUNT_EXCEED_TRANSACTIONS"
    );

    // Next UTC day, counter restarts at 1.
    let next_day = (T0 / DAY_SECONDS + 1) * DAY_SECONDS + 10;
    harness.clock.set(next_day);
    let fresh = Arc::new(send_block(&key, &head, 1, next_day, sink, Amount(1)));
    harness.processor.add(fresh.clone());
    assert_eq!(harness.wait_for(fresh.hash(), BlockOperation::Append), "SUCCESS");
}

/// S3 (processor half): a forced append of a competing block rolls the
/// losing head into the rollback log and applies the winner, with weights
/// rebalanced.
#[test]
fn fork_displacement_rolls_back_and_applies() {
    let harness = Harness::new(T0);
    let key = fixed_key(5);
    let dest_a = fixed_key(6).public_key;
    let dest_b = fixed_key(7).public_key;

    let genesis = seed_genesis(&harness.ledger, &key, Amount(50 * ONE_STR), T0).unwrap();

    let b1 = Arc::new(send_block(&key, &genesis, 2, T0, dest_a, Amount(ONE_STR)));
    harness.processor.add(b1.clone());
    assert_eq!(harness.wait_for(b1.hash(), BlockOperation::Append), "SUCCESS");

    // A competing send at the same height, different destination.
    let b2 = Arc::new(send_block(
        &key,
        &genesis,
        2,
        T0 + 1,
        dest_b,
        Amount(2 * ONE_STR),
    ));
    assert!(b1.fork_with(&b2));

    // An election decided for b2: the processor is fed a forced append.
    harness.processor.add_forced(BlockForced::append(b2.clone()));
    harness.wait_for_success(b2.hash(), BlockOperation::Append);

    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &key.public_key)
        .unwrap()
        .unwrap();
    assert_eq!(info.head, b2.hash());
    assert!(
        harness
            .ledger
            .rollback_block_get(&txn, &b1.hash())
            .unwrap()
            .is_some(),
        "loser preserved in the rollback log"
    );
    assert!(!harness.ledger.block_exists(&txn, &b1.hash()).unwrap());
    assert!(
        harness
            .ledger
            .receivable_info_get(&txn, &dest_a, &b1.hash())
            .unwrap()
            .is_none(),
        "loser's receivable restored away"
    );
    assert!(harness
        .ledger
        .receivable_info_get(&txn, &dest_b, &b2.hash())
        .unwrap()
        .is_some());
    drop(txn);

    harness.assert_weight_invariant();
}

/// Invariant 6: apply-then-rollback leaves the ledger identical, exercised
/// by displacing a block and then displacing the displacer back.
#[test]
fn displacement_round_trip_restores_state() {
    let harness = Harness::new(T0);
    let key = fixed_key(8);
    let dest_a = fixed_key(9).public_key;
    let dest_b = fixed_key(10).public_key;

    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();

    let b1 = Arc::new(send_block(&key, &genesis, 2, T0, dest_a, Amount(ONE_STR)));
    harness.processor.add(b1.clone());
    harness.wait_for(b1.hash(), BlockOperation::Append);

    let snapshot = |h: &Harness| {
        let txn = h.ledger.begin_read().unwrap();
        let info = h
            .ledger
            .account_info_get(&txn, &key.public_key)
            .unwrap()
            .unwrap();
        let weight = h.ledger.rep_weight_get(&txn, &key.public_key).unwrap();
        let receivable = h
            .ledger
            .receivable_info_get(&txn, &dest_a, &b1.hash())
            .unwrap();
        (info, weight, receivable)
    };
    let before = snapshot(&harness);

    let b2 = Arc::new(send_block(&key, &genesis, 2, T0 + 1, dest_b, Amount(ONE_STR)));
    harness.processor.add_forced(BlockForced::append(b2.clone()));
    harness.wait_for_success(b2.hash(), BlockOperation::Append);

    // Displace back to b1.
    harness.processor.add_forced(BlockForced::append(b1.clone()));
    harness.wait_for_success(b1.hash(), BlockOperation::Append);

    let after = snapshot(&harness);
    assert_eq!(before.0, after.0, "account info restored");
    assert_eq!(before.1, after.1, "rep weight restored");
    assert_eq!(before.2, after.2, "receivable restored");
    harness.assert_weight_invariant();
}

/// Fork ingestion persists the pair, broadcasts it and starts an election
/// over unconfirmed heights.
#[test]
fn fork_submission_persists_and_elects() {
    let harness = Harness::new(T0);
    let key = fixed_key(11);
    let dest_a = fixed_key(12).public_key;
    let dest_b = fixed_key(13).public_key;

    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();
    let b1 = Arc::new(send_block(&key, &genesis, 2, T0, dest_a, Amount(1)));
    harness.processor.add(b1.clone());
    harness.wait_for(b1.hash(), BlockOperation::Append);

    let b2 = Arc::new(send_block(&key, &genesis, 2, T0 + 1, dest_b, Amount(2)));
    harness.processor.add_fork(BlockFork {
        first: b1.clone(),
        second: b2.clone(),
        from_local: true,
    });

    // Wait until the fork record lands.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let txn = harness.ledger.begin_read().unwrap();
        if harness
            .ledger
            .fork_exists(&txn, &key.public_key, 1)
            .unwrap()
        {
            break;
        }
        drop(txn);
        assert!(std::time::Instant::now() < deadline, "fork record never appeared");
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &key.public_key)
        .unwrap()
        .unwrap();
    assert_eq!(info.forks, 1);
    drop(txn);

    assert_eq!(
        harness.context.fork_broadcasts.lock().first(),
        Some(&(b1.hash(), b2.hash()))
    );
    assert_eq!(
        harness.context.elections.lock().first(),
        Some(&(key.public_key, 1))
    );
}

/// Identical resubmission is reported as EXISTS without touching state.
#[test]
fn duplicate_blocks_are_benign() {
    let harness = Harness::new(T0);
    let key = fixed_key(14);
    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();
    let send = Arc::new(send_block(&key, &genesis, 2, T0, fixed_key(15).public_key, Amount(1)));

    harness.processor.add(send.clone());
    assert_eq!(harness.wait_for(send.hash(), BlockOperation::Append), "SUCCESS");
    harness.processor.add(send.clone());
    assert_eq!(
        harness.wait_for(send.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_EXISTS"
    );
}

/// A block arriving before its predecessor parks in the gap cache and is
/// released when the predecessor commits.
#[test]
fn gap_previous_parks_and_releases() {
    let harness = Harness::new(T0);
    let key = fixed_key(16);
    let sink = fixed_key(17).public_key;

    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();
    let first = Arc::new(send_block(&key, &genesis, 2, T0, sink, Amount(1)));
    let second = Arc::new(send_block(&key, &first, 3, T0, sink, Amount(1)));

    harness.processor.add(second.clone());
    assert_eq!(
        harness.wait_for(second.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_GAP_PREVIOUS"
    );
    assert_eq!(harness.processor.gap_previous.len(), 1);

    harness.processor.add(first.clone());
    assert_eq!(harness.wait_for(first.hash(), BlockOperation::Append), "SUCCESS");
    // The parked successor re-enters the queue and lands too.
    assert_eq!(harness.wait_for(second.hash(), BlockOperation::Append), "SUCCESS");
    assert_eq!(harness.processor.gap_previous.len(), 0);
}

/// Backfill: an append below the stored tail queries the network and the
/// resumed prepend lowers the tail.
#[test]
fn prepend_extends_below_the_tail() {
    let harness = Harness::new(T0);
    let key = fixed_key(18);
    let sink = fixed_key(19).public_key;

    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();
    let b1 = Arc::new(send_block(&key, &genesis, 2, T0, sink, Amount(1)));
    let b2 = Arc::new(send_block(&key, &b1, 3, T0, sink, Amount(1)));

    // Fabricate a pruned chain: only b2 lives in the store, tail = head = 2.
    {
        let txn = harness.ledger.begin_write().unwrap();
        harness.ledger.block_put(&txn, &b2.hash(), &b2).unwrap();
        let mut info = harness
            .ledger
            .account_info_get(&txn, &key.public_key)
            .unwrap()
            .unwrap();
        harness.ledger.block_del(&txn, &info.head).unwrap();
        info.head = b2.hash();
        info.head_height = 2;
        info.tail = b2.hash();
        info.tail_height = 2;
        harness
            .ledger
            .account_info_put(&txn, &key.public_key, &info)
            .unwrap();
        txn.commit().unwrap();
    }

    // Appending b1 reports PRUNED and queries below the tail.
    harness.processor.add_forced(BlockForced::append(b1.clone()));
    assert_eq!(
        harness.wait_for(b1.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_PRUNED"
    );
    let queried = harness.context.queries.lock().last().cloned().unwrap();
    assert_eq!(queried.0, DYNAMIC_BEGIN);
    assert_eq!(queried.3, b1.hash(), "the tail's previous is requested");

    // The network answers; the prepend lowers the tail.
    harness
        .processor
        .add_forced(BlockForced::resume(queried.0, b1.clone()));
    assert_eq!(harness.wait_for(b1.hash(), BlockOperation::Prepend), "SUCCESS");

    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &key.public_key)
        .unwrap()
        .unwrap();
    assert_eq!(info.tail_height, 1);
    assert_eq!(info.tail, b1.hash());
    assert_eq!(info.head_height, 2);
}

/// Confirmations are monotone and idempotent.
#[test]
fn confirm_is_idempotent() {
    let harness = Harness::new(T0);
    let key = fixed_key(20);
    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();
    let send = Arc::new(send_block(&key, &genesis, 2, T0, fixed_key(21).public_key, Amount(1)));
    harness.processor.add(send.clone());
    harness.wait_for(send.hash(), BlockOperation::Append);

    for _ in 0..2 {
        harness.processor.add_forced(BlockForced::confirm(send.clone()));
        assert_eq!(harness.wait_for(send.hash(), BlockOperation::Confirm), "SUCCESS");
        let txn = harness.ledger.begin_read().unwrap();
        let info = harness
            .ledger
            .account_info_get(&txn, &key.public_key)
            .unwrap()
            .unwrap();
        assert_eq!(info.confirmed(), Some(1));
    }

    // Confirming the genesis afterwards does not regress the height.
    let genesis = Arc::new(genesis);
    harness
        .processor
        .add_forced(BlockForced::confirm(genesis.clone()));
    assert_eq!(
        harness.wait_for(genesis.hash(), BlockOperation::Confirm),
        "SUCCESS"
    );
    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &key.public_key)
        .unwrap()
        .unwrap();
    assert_eq!(info.confirmed(), Some(1), "confirmed height never decreases");
}

/// Signature, timestamp and balance violations discard without state.
#[test]
fn invalid_blocks_leave_no_trace() {
    let harness = Harness::new(T0);
    let key = fixed_key(22);
    let genesis = seed_genesis(&harness.ledger, &key, Amount(10 * ONE_STR), T0).unwrap();

    // Tampered signature.
    let mut bad = send_block(&key, &genesis, 2, T0, fixed_key(23).public_key, Amount(1));
    if let Block::Tx(tx) = &mut bad {
        tx.signature = strand_types::U512([7; 64]);
    }
    let bad = Arc::new(bad);
    harness.processor.add(bad.clone());
    assert_eq!(
        harness.wait_for(bad.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_SIGNATURE"
    );

    // Timestamp too far ahead.
    let future = Arc::new(send_block(
        &key,
        &genesis,
        2,
        T0 + 10_000,
        fixed_key(23).public_key,
        Amount(1),
    ));
    harness.processor.add(future.clone());
    assert_eq!(
        harness.wait_for(future.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_TIMESTAMP"
    );

    // Send that increases the balance.
    let inflate = Arc::new(Block::Tx(strand_types::block::TxBlock::new(
        strand_types::BlockOpcode::Send,
        1,
        2,
        T0,
        1,
        key.public_key,
        genesis.hash(),
        genesis.representative(),
        Amount(genesis.balance().0 + 1),
        U256::from_u64(1),
        strand_types::Note::empty(),
        &key.private_key.signing_key(),
    )));
    harness.processor.add(inflate.clone());
    assert_eq!(
        harness.wait_for(inflate.hash(), BlockOperation::Append),
        "BLOCK_PROCESS_BALANCE"
    );

    let txn = harness.ledger.begin_read().unwrap();
    let info = harness
        .ledger
        .account_info_get(&txn, &key.public_key)
        .unwrap()
        .unwrap();
    assert_eq!(info.head_height, 0, "no invalid block advanced the chain");
    harness.assert_weight_invariant();
}
