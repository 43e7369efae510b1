//! Per-root elections over competing blocks.
//!
//! An election watches the candidates for one (account, height) and collects
//! signed representative votes, weighted at receipt from the stored weight
//! table. A worker pool evaluates elections: quorum confirms the winner or
//! displaces the losing chain through the processor's forced path; a stale
//! election is abandoned and its fork records wait for the next fork
//! bootstrap.

use crate::message::{ConfirmMessage, ConflictMessage, Message, MessageSender, PublishMessage};
use crate::processor::{BlockForced, BlockProcessor};
use crate::stats::Stats;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_ledger::Ledger;
use strand_types::block::verify_hash;
use strand_types::params::QUALIFIED_REP_WEIGHT;
use strand_types::{Account, Amount, Block, BlockHash, ErrorCode, Signature};
use tracing::{debug, info, warn};

type Root = (Account, u64);

/// Tuning knobs for the election pool.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub workers: usize,
    pub quorum_percent: u32,
    pub timeout: Duration,
    /// Spacing between confirm-request rebroadcasts for one election.
    pub request_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        ElectionConfig {
            workers: 4,
            quorum_percent: 67,
            timeout: Duration::from_secs(300),
            request_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct Vote {
    timestamp: u64,
    signature: Signature,
    hash: BlockHash,
    weight: Amount,
}

struct Election {
    candidates: HashMap<BlockHash, Arc<Block>>,
    votes: HashMap<Account, Vote>,
    /// Representatives whose double-vote has been broadcast already.
    conflicted: HashSet<Account>,
    started: Instant,
    last_request: Option<Instant>,
}

impl Election {
    fn new() -> Self {
        Election {
            candidates: HashMap::new(),
            votes: HashMap::new(),
            conflicted: HashSet::new(),
            started: Instant::now(),
            last_request: None,
        }
    }

    fn tally(&self) -> HashMap<BlockHash, Amount> {
        let mut weights: HashMap<BlockHash, Amount> = HashMap::new();
        for vote in self.votes.values() {
            let entry = weights.entry(vote.hash).or_insert(Amount::ZERO);
            *entry = entry.saturating_add(vote.weight);
        }
        weights
    }
}

struct State {
    elections: HashMap<Root, Election>,
    queue: VecDeque<Root>,
    queued: HashSet<Root>,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
    ledger: Arc<Ledger>,
    processor: Arc<BlockProcessor>,
    sender: Arc<dyn MessageSender>,
    stats: Stats,
    config: ElectionConfig,
}

/// The election pool.
pub struct Elections {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Elections {
    pub fn new(
        ledger: Arc<Ledger>,
        processor: Arc<BlockProcessor>,
        sender: Arc<dyn MessageSender>,
        stats: Stats,
        config: ElectionConfig,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                elections: HashMap::new(),
                queue: VecDeque::new(),
                queued: HashSet::new(),
                stopped: false,
            }),
            condvar: Condvar::new(),
            ledger,
            processor,
            sender,
            stats,
            config: config.clone(),
        });
        let elections = Arc::new(Elections {
            shared: shared.clone(),
            workers: Mutex::new(Vec::new()),
        });
        let mut workers = elections.workers.lock();
        for index in 0..config.workers.max(1) {
            let shared_l = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("election-{index}"))
                .spawn(move || worker(shared_l))
                .expect("spawn election worker");
            workers.push(handle);
        }
        drop(workers);
        elections
    }

    /// Starts (or extends) the election over a fork pair.
    pub fn start(&self, first: &Arc<Block>, second: &Arc<Block>) {
        if !first.fork_with(second) {
            return;
        }
        let root = (first.account(), first.height());
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        let election = state.elections.entry(root).or_insert_with(Election::new);
        election.candidates.insert(first.hash(), first.clone());
        election.candidates.insert(second.hash(), second.clone());
        enqueue(&mut state, root);
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// Feeds one representative vote. The caller has already gated on the
    /// qualification floor; the signature is verified here.
    pub fn process_confirm(
        &self,
        representative: Account,
        timestamp: u64,
        signature: Signature,
        block: Arc<Block>,
        weight: Amount,
    ) {
        let hash = block.hash();
        let vote_hash = ConfirmMessage::vote_hash(timestamp, &hash);
        if !verify_hash(&vote_hash, &representative, &signature) {
            self.shared.stats.add("ELECTION_VOTE_SIGNATURE");
            return;
        }

        let root = (block.account(), block.height());
        let mut conflict: Option<ConflictMessage> = None;
        {
            let mut state = self.shared.state.lock();
            let Some(election) = state.elections.get_mut(&root) else {
                return;
            };
            election.candidates.entry(hash).or_insert_with(|| block.clone());

            match election.votes.get(&representative) {
                Some(existing) if existing.hash != hash => {
                    // Second vote for a different block: cryptographic proof
                    // of misbehavior. Keep the first vote in the tally and
                    // gossip both signed votes once.
                    if election.conflicted.insert(representative) {
                        let first_block = election.candidates.get(&existing.hash).cloned();
                        if let Some(first_block) = first_block {
                            conflict = Some(ConflictMessage::new(
                                representative,
                                existing.timestamp,
                                timestamp,
                                existing.signature,
                                signature,
                                (*first_block).clone(),
                                (*block).clone(),
                            ));
                        }
                    }
                }
                Some(existing) if existing.timestamp >= timestamp => {}
                _ => {
                    election.votes.insert(
                        representative,
                        Vote {
                            timestamp,
                            signature,
                            hash,
                            weight,
                        },
                    );
                }
            }
            enqueue(&mut state, root);
        }
        if let Some(conflict) = conflict {
            self.shared.stats.add("ELECTION_CONFLICT");
            self.shared.sender.broadcast(&Message::Conflict(conflict));
        }
        self.shared.condvar.notify_all();
    }

    /// Records a relayed double-vote proof after verifying both signatures.
    pub fn process_conflict(
        &self,
        representative: Account,
        timestamp_first: u64,
        timestamp_second: u64,
        signature_first: Signature,
        signature_second: Signature,
        block_first: Arc<Block>,
        block_second: Arc<Block>,
        _weight: Amount,
    ) {
        if !block_first.fork_with(&block_second) {
            return;
        }
        let first_hash = ConfirmMessage::vote_hash(timestamp_first, &block_first.hash());
        let second_hash = ConfirmMessage::vote_hash(timestamp_second, &block_second.hash());
        if !verify_hash(&first_hash, &representative, &signature_first)
            || !verify_hash(&second_hash, &representative, &signature_second)
        {
            self.shared.stats.add("ELECTION_VOTE_SIGNATURE");
            return;
        }

        let root = (block_first.account(), block_first.height());
        let mut relay = false;
        {
            let mut state = self.shared.state.lock();
            if let Some(election) = state.elections.get_mut(&root) {
                relay = election.conflicted.insert(representative);
            }
        }
        if relay {
            self.shared.stats.add("ELECTION_CONFLICT");
            self.shared.sender.broadcast(&Message::Conflict(ConflictMessage::new(
                representative,
                timestamp_first,
                timestamp_second,
                signature_first,
                signature_second,
                (*block_first).clone(),
                (*block_second).clone(),
            )));
        }
    }

    /// Re-enqueues every live election; driven by the alarm so stalled
    /// elections are re-evaluated and eventually time out.
    pub fn tick(&self) {
        let mut state = self.shared.state.lock();
        let roots: Vec<Root> = state.elections.keys().copied().collect();
        for root in roots {
            enqueue(&mut state, root);
        }
        drop(state);
        self.shared.condvar.notify_all();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().elections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().elections.is_empty()
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.condvar.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn enqueue(state: &mut State, root: Root) {
    if state.queued.insert(root) {
        state.queue.push_back(root);
    }
}

fn worker(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }
        let Some(root) = state.queue.pop_front() else {
            shared.condvar.wait(&mut state);
            continue;
        };
        state.queued.remove(&root);
        drop(state);
        evaluate(&shared, root);
        state = shared.state.lock();
    }
}

/// One evaluation round: decide, time out, or ask for more votes.
fn evaluate(shared: &Arc<Shared>, root: Root) {
    let Some((tally, candidates, started, want_request)) = ({
        let mut state = shared.state.lock();
        state.elections.get_mut(&root).map(|election| {
            let want_request = election
                .last_request
                .map(|t| t.elapsed() >= shared.config.request_interval)
                .unwrap_or(true);
            if want_request {
                election.last_request = Some(Instant::now());
            }
            (
                election.tally(),
                election.candidates.clone(),
                election.started,
                want_request,
            )
        })
    }) else {
        return;
    };

    let threshold = match quorum_threshold(shared) {
        Some(threshold) => threshold,
        None => return,
    };

    let winner = tally
        .iter()
        .max_by_key(|(_, weight)| *weight)
        .filter(|(_, weight)| **weight >= threshold)
        .map(|(hash, _)| *hash);

    if let Some(winner_hash) = winner {
        let Some(winner) = candidates.get(&winner_hash).cloned() else {
            return;
        };
        finish(shared, root, winner);
        return;
    }

    if started.elapsed() >= shared.config.timeout {
        info!(target: "elections", account = %root.0, height = root.1,
              "election timed out, abandoning");
        shared.stats.add("ELECTION_ABANDONED");
        shared.state.lock().elections.remove(&root);
        return;
    }

    if want_request {
        // Ask the network to vote on every candidate.
        for block in candidates.values() {
            let message =
                PublishMessage::with_confirm(block.account(), (**block).clone());
            shared.sender.broadcast(&Message::Publish(message));
        }
    }
}

/// Weight required to win: the configured fraction of the total delegated
/// weight, never below the qualification floor.
fn quorum_threshold(shared: &Shared) -> Option<Amount> {
    let txn = match shared.ledger.begin_read() {
        Ok(txn) => txn,
        Err(e) => {
            shared.stats.add(e.code());
            return None;
        }
    };
    let total = match shared.ledger.rep_weight_total(&txn) {
        Ok(total) => total,
        Err(e) => {
            shared.stats.add(e.code());
            return None;
        }
    };
    let fraction = Amount(
        total
            .0
            .saturating_mul(shared.config.quorum_percent as u128)
            / 100,
    );
    Some(fraction.max(QUALIFIED_REP_WEIGHT))
}

/// Quorum reached: confirm the stored chain or displace it.
fn finish(shared: &Arc<Shared>, root: Root, winner: Arc<Block>) {
    let stored = {
        let txn = match shared.ledger.begin_read() {
            Ok(txn) => txn,
            Err(e) => {
                shared.stats.add(e.code());
                return;
            }
        };
        shared
            .ledger
            .block_get_by_height(&txn, &root.0, root.1)
            .ok()
            .flatten()
    };

    match stored {
        Some(stored) if stored.hash() == winner.hash() => {
            debug!(target: "elections", account = %root.0, height = root.1,
                   "quorum confirms the stored chain");
            shared
                .processor
                .add_forced(BlockForced::confirm(winner.clone()));
        }
        _ => {
            warn!(target: "elections", account = %root.0, height = root.1,
                  winner = %winner.hash(), "quorum displaces the stored chain");
            shared
                .processor
                .add_forced(BlockForced::append(winner.clone()));
        }
    }

    shared.state.lock().elections.remove(&root);
}

/// Rate control for a representative answering confirm requests: the same
/// block is reconfirmed with the same timestamp; a different block at the
/// same root waits out the minimum interval.
pub struct ConfirmManager {
    slots: Mutex<HashMap<Root, ConfirmSlot>>,
    interval: u64,
    max_age: Duration,
}

struct ConfirmSlot {
    hash: BlockHash,
    timestamp: u64,
    updated: Instant,
}

impl ConfirmManager {
    pub fn new(interval: u64, max_age: Duration) -> Self {
        ConfirmManager {
            slots: Mutex::new(HashMap::new()),
            interval,
            max_age,
        }
    }

    /// The timestamp to sign a confirmation with, or `None` when the
    /// interval has not passed for a competing hash.
    pub fn timestamp_for(&self, account: Account, height: u64, hash: BlockHash, now: u64) -> Option<u64> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&(account, height)) {
            Some(slot) if slot.hash == hash => {
                slot.updated = Instant::now();
                Some(slot.timestamp)
            }
            Some(slot) => {
                let earliest = slot.timestamp + self.interval;
                if now < earliest {
                    return None;
                }
                slot.hash = hash;
                slot.timestamp = earliest.max(now);
                slot.updated = Instant::now();
                Some(slot.timestamp)
            }
            None => {
                slots.insert(
                    (account, height),
                    ConfirmSlot {
                        hash,
                        timestamp: now,
                        updated: Instant::now(),
                    },
                );
                Some(now)
            }
        }
    }

    pub fn age(&self) {
        let cutoff = Instant::now() - self.max_age;
        self.slots.lock().retain(|_, slot| slot.updated >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::U256;

    #[test]
    fn reconfirm_same_hash_keeps_timestamp() {
        let manager = ConfirmManager::new(15, Duration::from_secs(60));
        let account = U256::from_u64(1);
        let hash = U256::from_u64(9);
        let ts = manager.timestamp_for(account, 3, hash, 100).unwrap();
        assert_eq!(ts, 100);
        assert_eq!(manager.timestamp_for(account, 3, hash, 200), Some(100));
    }

    #[test]
    fn competing_hash_waits_out_the_interval() {
        let manager = ConfirmManager::new(15, Duration::from_secs(60));
        let account = U256::from_u64(1);
        let first = U256::from_u64(9);
        let second = U256::from_u64(10);
        assert_eq!(manager.timestamp_for(account, 3, first, 100), Some(100));
        // Too soon for a different hash.
        assert_eq!(manager.timestamp_for(account, 3, second, 101), None);
        // After the interval the new hash confirms with the shifted stamp.
        assert_eq!(manager.timestamp_for(account, 3, second, 200), Some(200));
        // And reconfirms stay put.
        assert_eq!(manager.timestamp_for(account, 3, second, 300), Some(200));
    }

    #[test]
    fn aging_clears_slots() {
        let manager = ConfirmManager::new(15, Duration::from_millis(0));
        let account = U256::from_u64(1);
        manager.timestamp_for(account, 3, U256::from_u64(9), 100);
        std::thread::sleep(Duration::from_millis(5));
        manager.age();
        assert_eq!(manager.len(), 0);
    }
}
