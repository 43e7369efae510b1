//! Election flow: weighted votes reach quorum and drive the processor.

mod common;

use common::Harness;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strand_node::elections::{ElectionConfig, Elections};
use strand_node::message::{ConfirmMessage, Message, MessageSender};
use strand_node::processor::BlockOperation;
use strand_node::test_support::{fixed_key, seed_genesis, send_block, ONE_STR};
use strand_types::params::EPOCH_TIMESTAMP;
use strand_types::Amount;

const T0: u64 = EPOCH_TIMESTAMP + 100;

#[derive(Default)]
struct RecordingSender {
    broadcasts: Mutex<Vec<&'static str>>,
}

impl MessageSender for RecordingSender {
    fn send(&self, _message: &Message, _to: SocketAddr) {}

    fn broadcast(&self, message: &Message) {
        let kind = match message {
            Message::Publish(_) => "publish",
            Message::Conflict(_) => "conflict",
            Message::Fork(_) => "fork",
            _ => "other",
        };
        self.broadcasts.lock().push(kind);
    }
}

/// S3 (election half): quorum for a competing block displaces the stored
/// chain; a conflicting second vote is gossiped as proof.
#[test]
fn quorum_displaces_and_conflicts_are_reported() {
    let harness = Harness::new(T0);
    let rep_key = fixed_key(51);
    let dest_a = fixed_key(52).public_key;
    let dest_b = fixed_key(53).public_key;

    // The representative is the genesis account itself, carrying all weight.
    let weight = Amount(100_000 * ONE_STR);
    let genesis = seed_genesis(&harness.ledger, &rep_key, weight, T0).unwrap();

    let sender = Arc::new(RecordingSender::default());
    let elections = Elections::new(
        harness.ledger.clone(),
        harness.processor.clone(),
        sender.clone(),
        harness.stats.clone(),
        ElectionConfig {
            workers: 2,
            quorum_percent: 67,
            timeout: Duration::from_secs(300),
            request_interval: Duration::from_millis(10),
        },
    );

    // b1 is the live head; b2 competes at the same height.
    let b1 = Arc::new(send_block(&rep_key, &genesis, 2, T0, dest_a, Amount(ONE_STR)));
    harness.processor.add(b1.clone());
    assert_eq!(harness.wait_for(b1.hash(), BlockOperation::Append), "SUCCESS");
    let b2 = Arc::new(send_block(&rep_key, &genesis, 2, T0 + 1, dest_b, Amount(ONE_STR)));

    elections.start(&b1, &b2);
    assert_eq!(elections.len(), 1);

    // One qualified vote carrying the whole weight decides for b2.
    let timestamp = T0 + 2;
    let vote_hash = ConfirmMessage::vote_hash(timestamp, &b2.hash());
    let signature = rep_key.private_key.sign(&vote_hash);
    elections.process_confirm(rep_key.public_key, timestamp, signature, b2.clone(), weight);

    harness.wait_for_success(b2.hash(), BlockOperation::Append);
    {
        let txn = harness.ledger.begin_read().unwrap();
        let info = harness
            .ledger
            .account_info_get(&txn, &rep_key.public_key)
            .unwrap()
            .unwrap();
        assert_eq!(info.head, b2.hash());
        assert!(harness
            .ledger
            .rollback_block_get(&txn, &b1.hash())
            .unwrap()
            .is_some());
    }
    harness.assert_weight_invariant();

    // Wait for the decided election to be retired.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !elections.is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(elections.is_empty());
    elections.stop();
}

#[test]
fn invalid_vote_signatures_are_rejected() {
    let harness = Harness::new(T0);
    let rep_key = fixed_key(54);
    let weight = Amount(100_000 * ONE_STR);
    let genesis = seed_genesis(&harness.ledger, &rep_key, weight, T0).unwrap();

    let sender = Arc::new(RecordingSender::default());
    let elections = Elections::new(
        harness.ledger.clone(),
        harness.processor.clone(),
        sender,
        harness.stats.clone(),
        ElectionConfig {
            workers: 1,
            quorum_percent: 67,
            timeout: Duration::from_secs(300),
            request_interval: Duration::from_secs(60),
        },
    );

    let b1 = Arc::new(send_block(&rep_key, &genesis, 2, T0, fixed_key(55).public_key, Amount(1)));
    harness.processor.add(b1.clone());
    harness.wait_for(b1.hash(), BlockOperation::Append);
    let b2 = Arc::new(send_block(&rep_key, &genesis, 2, T0 + 1, fixed_key(56).public_key, Amount(2)));

    elections.start(&b1, &b2);

    // A vote with a garbage signature never counts.
    elections.process_confirm(
        rep_key.public_key,
        T0 + 2,
        strand_types::U512([7; 64]),
        b2.clone(),
        weight,
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.stats.get("ELECTION_VOTE_SIGNATURE"), 1);
    {
        let txn = harness.ledger.begin_read().unwrap();
        let info = harness
            .ledger
            .account_info_get(&txn, &rep_key.public_key)
            .unwrap()
            .unwrap();
        assert_eq!(info.head, b1.hash(), "the chain is untouched");
    }
    elections.stop();
}

/// A representative voting for both candidates produces exactly one
/// broadcast conflict proof, and its first vote keeps standing.
#[test]
fn double_votes_become_conflict_proofs() {
    let harness = Harness::new(T0);
    let rep_key = fixed_key(57);
    // Heavy enough to qualify, too light for quorum on its own against the
    // configured fraction of itself: use a second silent rep for ballast.
    let rep_weight = Amount(10_000 * ONE_STR);
    let genesis = seed_genesis(&harness.ledger, &rep_key, rep_weight, T0).unwrap();
    {
        // Ballast weight so one vote cannot reach quorum.
        let txn = harness.ledger.begin_write().unwrap();
        harness
            .ledger
            .rep_weight_add(&txn, &fixed_key(58).public_key, Amount(100_000 * ONE_STR))
            .unwrap();
        txn.commit().unwrap();
    }

    let sender = Arc::new(RecordingSender::default());
    let elections = Elections::new(
        harness.ledger.clone(),
        harness.processor.clone(),
        sender.clone(),
        harness.stats.clone(),
        ElectionConfig {
            workers: 1,
            quorum_percent: 67,
            timeout: Duration::from_secs(300),
            request_interval: Duration::from_secs(60),
        },
    );

    let b1 = Arc::new(send_block(&rep_key, &genesis, 2, T0, fixed_key(59).public_key, Amount(1)));
    harness.processor.add(b1.clone());
    harness.wait_for(b1.hash(), BlockOperation::Append);
    let b2 = Arc::new(send_block(&rep_key, &genesis, 2, T0 + 1, fixed_key(60).public_key, Amount(2)));

    elections.start(&b1, &b2);

    let vote = |block: &Arc<strand_types::Block>, ts: u64| {
        let hash = ConfirmMessage::vote_hash(ts, &block.hash());
        (ts, rep_key.private_key.sign(&hash))
    };

    let (t1, s1) = vote(&b1, T0 + 2);
    elections.process_confirm(rep_key.public_key, t1, s1, b1.clone(), rep_weight);
    let (t2, s2) = vote(&b2, T0 + 3);
    elections.process_confirm(rep_key.public_key, t2, s2, b2.clone(), rep_weight);
    // A third flip-flop does not produce another proof.
    let (t3, s3) = vote(&b2, T0 + 4);
    elections.process_confirm(rep_key.public_key, t3, s3, b2.clone(), rep_weight);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while harness.stats.get("ELECTION_CONFLICT") == 0
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(harness.stats.get("ELECTION_CONFLICT"), 1);
    let broadcasts = sender.broadcasts.lock();
    assert_eq!(
        broadcasts.iter().filter(|k| **k == "conflict").count(),
        1,
        "both signed votes travel in exactly one proof"
    );
    elections.stop();
}
