//! Shared harness for processor integration tests.

use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;
use strand_ledger::Ledger;
use strand_node::clock::ManualClock;
use strand_node::observers::Observers;
use strand_node::processor::{BlockOperation, BlockProcessor};
use strand_node::test_support::RecordingContext;
use strand_node::Stats;
use strand_types::{Amount, BlockHash, U256};

pub struct Harness {
    pub ledger: Arc<Ledger>,
    pub processor: Arc<BlockProcessor>,
    pub context: Arc<RecordingContext>,
    pub observers: Arc<Observers>,
    pub clock: Arc<ManualClock>,
    pub stats: Stats,
    pub events: Mutex<Receiver<(BlockOperation, String, BlockHash)>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(now: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("ledger.redb")).unwrap());
        let context = Arc::new(RecordingContext::default());
        let observers = Arc::new(Observers::new());
        let clock = Arc::new(ManualClock::new(now));
        let stats = Stats::new();

        let (tx, rx) = channel();
        observers.add_block_observer(Box::new(move |result, block| {
            let _ = tx.send((result.operation, result.code().to_string(), block.hash()));
        }));

        let processor = BlockProcessor::new(
            ledger.clone(),
            context.clone(),
            observers.clone(),
            stats.clone(),
            clock.clone(),
        );

        Harness {
            ledger,
            processor,
            context,
            observers,
            clock,
            stats,
            events: Mutex::new(rx),
            _dir: dir,
        }
    }

    /// Blocks until the processor reports `operation` on `hash`, returning
    /// the first matching result code.
    pub fn wait_for(&self, hash: BlockHash, operation: BlockOperation) -> String {
        let events = self.events.lock();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(200)) {
                Ok((op, code, h)) if op == operation && h == hash => return code,
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        panic!("timed out waiting for {operation:?} on {hash}");
    }

    /// Blocks until `operation` on `hash` reports SUCCESS, skipping the
    /// intermediate business results a multi-step operation produces.
    pub fn wait_for_success(&self, hash: BlockHash, operation: BlockOperation) {
        let events = self.events.lock();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(200)) {
                Ok((op, code, h)) if op == operation && h == hash && code == "SUCCESS" => return,
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        panic!("timed out waiting for successful {operation:?} on {hash}");
    }

    /// Invariant: the sum of live head balances equals the sum of
    /// representative weights.
    pub fn assert_weight_invariant(&self) {
        let txn = self.ledger.begin_read().unwrap();
        let mut cursor = U256::ZERO;
        let mut balances: u128 = 0;
        while let Some((account, info)) = self.ledger.next_account_info(&txn, &cursor).unwrap() {
            let head = self.ledger.block_get(&txn, &info.head).unwrap().unwrap();
            if head.has_representative() {
                balances += head.balance().0;
            }
            if account == U256([0xFF; 32]) {
                break;
            }
            cursor = account.successor();
        }
        let total = self.ledger.rep_weight_total(&txn).unwrap();
        assert_eq!(Amount(balances), total, "head balances match rep weight total");
    }
}
