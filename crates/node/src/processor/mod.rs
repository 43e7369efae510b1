//! The validating block processor.
//!
//! A single thread drains three queues in strict precedence: fork
//! submissions, forced operations, then the priority-ordered admit queue.
//! Every step runs inside one ledger transaction; non-business failures
//! abort it so partial state never leaks. Forced operations carry a dynamic
//! operation id owning a LIFO of pending sub-steps; a step that must wait on
//! an external query returns control and resumes when the query's callback
//! enqueues a forced op on the same id.

mod append;
mod rollback;

use crate::clock::Clock;
use crate::gap_cache::GapCache;
use crate::observers::Observers;
use crate::stats::Stats;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use strand_ledger::{Ledger, Transaction};
use strand_types::params::{
    self, MAX_ACCOUNT_CREDIT, TRANSACTIONS_PER_CREDIT,
};
use strand_types::{Account, Block, BlockHash, BlockOpcode, ErrorCode, ProcessError};
use tracing::{debug, error, warn};

/// Operations the processor performs on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOperation {
    Invalid = 0,
    Append = 1,
    Prepend = 2,
    Rollback = 3,
    Drop = 4,
    Confirm = 5,
}

impl BlockOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Rollback => "rollback",
            Self::Drop => "drop",
            Self::Confirm => "confirm",
        }
    }
}

/// First id available for dynamic operations; smaller values are the static
/// operations above.
pub const DYNAMIC_BEGIN: u64 = 16;

/// Outcome delivered to observers for every processed block.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub operation: BlockOperation,
    pub error: Option<ProcessError>,
    /// Confirmed height before a confirm operation ran.
    pub last_confirm_height: u64,
}

impl ProcessResult {
    pub fn success(operation: BlockOperation) -> Self {
        ProcessResult {
            operation,
            error: None,
            last_confirm_height: 0,
        }
    }

    pub fn failure(operation: BlockOperation, error: ProcessError) -> Self {
        ProcessResult {
            operation,
            error: Some(error),
            last_confirm_height: 0,
        }
    }

    /// Stable code string, `SUCCESS` when no error.
    pub fn code(&self) -> &'static str {
        self.error.as_ref().map(|e| e.code()).unwrap_or("SUCCESS")
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A forced operation: an explicit append/confirm from elections or local
/// wallets, or the resumption of a dynamic operation.
#[derive(Clone)]
pub struct BlockForced {
    pub operation: u64,
    pub block: Arc<Block>,
}

impl BlockForced {
    pub fn append(block: Arc<Block>) -> Self {
        BlockForced {
            operation: BlockOperation::Append as u64,
            block,
        }
    }

    pub fn confirm(block: Arc<Block>) -> Self {
        BlockForced {
            operation: BlockOperation::Confirm as u64,
            block,
        }
    }

    pub fn resume(operation: u64, block: Arc<Block>) -> Self {
        BlockForced { operation, block }
    }
}

/// A fork submission: two competing blocks for one (account, height).
#[derive(Clone)]
pub struct BlockFork {
    pub first: Arc<Block>,
    pub second: Arc<Block>,
    pub from_local: bool,
}

/// External collaborators of the processor, injected at construction. The
/// node wires these to gossip, elections and the block query manager; tests
/// use recorders.
pub trait ProcessorContext: Send + Sync {
    /// Gossip a freshly appended block.
    fn publish(&self, block: &Arc<Block>);
    /// Gossip a newly recorded fork pair.
    fn broadcast_fork(&self, first: &Arc<Block>, second: &Arc<Block>);
    /// Start or feed an election over the candidates.
    fn start_election(&self, first: &Arc<Block>, second: &Arc<Block>);
    /// Fork pair added to or removed from the fork table.
    fn fork_event(&self, added: bool, first: &Arc<Block>, second: &Arc<Block>);
    /// Query a block by hash; the answer must resume `operation` via a
    /// forced op. `for_prepend` asks peers for a block below the tail.
    fn query_block(
        &self,
        operation: u64,
        account: Account,
        height: u64,
        hash: BlockHash,
        for_prepend: bool,
    );
    /// Query a source block by hash alone.
    fn query_source(&self, operation: u64, hash: BlockHash);
}

struct QueueState {
    admit: BTreeMap<(u64, u64, BlockHash), Arc<Block>>,
    forced: VecDeque<BlockForced>,
    forks: VecDeque<BlockFork>,
    sequence: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

enum StepControl {
    Pop,
    Continue,
    Wait,
    Break,
}

struct BlockDynamic {
    operation: BlockOperation,
    block: Option<Arc<Block>>,
}

/// Per-thread dynamic operation state; only the run loop touches it.
#[derive(Default)]
struct DynamicState {
    next_operation: u64,
    stacks: HashMap<u64, Vec<BlockDynamic>>,
    accounts: HashMap<u64, HashSet<Account>>,
    roots: HashMap<u64, Account>,
}

/// The block processor; owns its worker thread.
pub struct BlockProcessor {
    ledger: Arc<Ledger>,
    shared: Arc<Shared>,
    context: Arc<dyn ProcessorContext>,
    observers: Arc<Observers>,
    stats: Stats,
    clock: Arc<dyn Clock>,
    /// Blocks parked on a missing previous block.
    pub gap_previous: GapCache,
    /// Receives parked on a missing send source.
    pub gap_receive_source: GapCache,
    /// Rewards parked on a missing reward source.
    pub gap_reward_source: GapCache,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BlockProcessor {
    /// Admit queue capacity; overflow evicts the worst-priority entry.
    pub const MAX_BLOCKS: usize = 256 * 1024;
    /// Fork queue capacity; overflow drops the submission.
    pub const MAX_FORKS: usize = 1024;
    /// Queue fill percentage at which the processor reports busy.
    pub const BUSY_PERCENTAGE: usize = 80;

    pub fn new(
        ledger: Arc<Ledger>,
        context: Arc<dyn ProcessorContext>,
        observers: Arc<Observers>,
        stats: Stats,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                admit: BTreeMap::new(),
                forced: VecDeque::new(),
                forks: VecDeque::new(),
                sequence: 0,
                stopped: false,
            }),
            condvar: Condvar::new(),
        });
        let processor = Arc::new(BlockProcessor {
            ledger,
            shared,
            context,
            observers,
            stats,
            clock,
            gap_previous: GapCache::default(),
            gap_receive_source: GapCache::default(),
            gap_reward_source: GapCache::default(),
            handle: Mutex::new(None),
        });
        let runner = processor.clone();
        let handle = thread::Builder::new()
            .name("processor".into())
            .spawn(move || runner.run())
            .expect("spawn processor thread");
        *processor.handle.lock() = Some(handle);
        processor
    }

    /// Async admit path. Best effort: the worst-priority entry is evicted
    /// and reported as a drop when the queue is full.
    pub fn add(&self, block: Arc<Block>) {
        let priority = self.priority(&block);
        let mut dropped: Option<Arc<Block>> = None;
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.sequence += 1;
            let key = (priority, state.sequence, block.hash());
            state.admit.insert(key, block);
            if state.admit.len() > Self::MAX_BLOCKS {
                if let Some((key, _)) = state.admit.iter().next_back().map(|(k, v)| (*k, v.clone())) {
                    dropped = state.admit.remove(&key);
                }
            }
        }
        if let Some(dropped) = dropped {
            self.observers
                .notify_block(ProcessResult::success(BlockOperation::Drop), dropped);
        }
        self.shared.condvar.notify_all();
    }

    pub fn add_forced(&self, forced: BlockForced) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.forced.push_back(forced);
        drop(state);
        self.shared.condvar.notify_all();
    }

    pub fn add_fork(&self, fork: BlockFork) {
        let mut state = self.shared.state.lock();
        if state.stopped || state.forks.len() >= Self::MAX_FORKS {
            return;
        }
        state.forks.push_back(fork);
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// Backpressure signal for bootstrap and sync.
    pub fn busy(&self) -> bool {
        let state = self.shared.state.lock();
        state.admit.len() * 100 >= Self::MAX_BLOCKS * Self::BUSY_PERCENTAGE
            || state.forks.len() * 100 >= Self::MAX_FORKS * Self::BUSY_PERCENTAGE
    }

    /// Queue depths: (admit, forced, fork).
    pub fn queue_lens(&self) -> (usize, usize, usize) {
        let state = self.shared.state.lock();
        (state.admit.len(), state.forced.len(), state.forks.len())
    }

    /// Ages the gap caches; driven by the alarm.
    pub fn age_gap_caches(&self) {
        self.gap_previous.age();
        self.gap_receive_source.age();
        self.gap_reward_source.age();
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
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Priority key; lower is served first. Stale blocks sort last, rewards
    /// in the middle, everything else by its share of the daily quota.
    fn priority(&self, block: &Block) -> u64 {
        const WORST: u64 = MAX_ACCOUNT_CREDIT as u64 * TRANSACTIONS_PER_CREDIT as u64;
        let now = self.clock.now();
        if now > block.timestamp() + 3600 {
            return WORST;
        }
        if block.opcode() == BlockOpcode::Reward {
            return WORST / 2;
        }
        let credit = block.credit() as u64;
        let counter = block.counter() as u64;
        if counter == 0 || credit == 0 {
            return WORST;
        }
        let total = credit * TRANSACTIONS_PER_CREDIT as u64;
        if counter > total {
            return WORST;
        }
        counter * WORST / total
    }

    fn run(self: &Arc<Self>) {
        let mut dynamic = DynamicState {
            next_operation: DYNAMIC_BEGIN,
            ..DynamicState::default()
        };
        let mut state = self.shared.state.lock();
        loop {
            if state.stopped {
                return;
            }
            if let Some(fork) = state.forks.pop_front() {
                drop(state);
                if !fork.from_local {
                    self.process_block(&fork.first, true);
                    self.process_block(&fork.second, true);
                }
                self.process_block_fork(&fork.first, &fork.second);
                state = self.shared.state.lock();
            } else if let Some(forced) = state.forced.pop_front() {
                drop(state);
                self.process_forced(&mut dynamic, forced);
                state = self.shared.state.lock();
            } else if let Some((key, block)) =
                state.admit.iter().next().map(|(k, v)| (*k, v.clone()))
            {
                state.admit.remove(&key);
                drop(state);
                self.process_block(&block, false);
                state = self.shared.state.lock();
            } else {
                self.shared.condvar.wait(&mut state);
            }
        }
    }

    /// Releases blocks parked on `hash` back into the admit queue.
    fn queue_gap_caches(&self, hash: &BlockHash) {
        if let Some(block) = self.gap_previous.take(hash) {
            self.add(block);
        }
        if let Some(block) = self.gap_receive_source.take(hash) {
            self.add(block);
        }
        if let Some(block) = self.gap_reward_source.take(hash) {
            self.add(block);
        }
    }

    /// Network admit path: one append attempt in one transaction.
    fn process_block(self: &Arc<Self>, block: &Arc<Block>, ignore_fork: bool) {
        let error = match self.ledger.begin_write() {
            Ok(txn) => {
                let outcome = self.append_step(&txn, block);
                match &outcome {
                    Ok(()) => {
                        if let Err(e) = txn.commit() {
                            error!(target: "processor", error = %e, "commit failed");
                        } else {
                            self.queue_gap_caches(&block.hash());
                            self.context.publish(block);
                        }
                        None
                    }
                    Err(ProcessError::GapPrevious) => {
                        let _ = txn.abort();
                        self.gap_previous.insert(block.previous(), block.clone());
                        Some(ProcessError::GapPrevious)
                    }
                    Err(ProcessError::GapReceiveSource) => {
                        let _ = txn.abort();
                        self.gap_receive_source
                            .insert(strand_types::U256(block.link().0), block.clone());
                        Some(ProcessError::GapReceiveSource)
                    }
                    Err(ProcessError::GapRewardSource) => {
                        let _ = txn.abort();
                        self.gap_reward_source
                            .insert(strand_types::U256(block.link().0), block.clone());
                        Some(ProcessError::GapRewardSource)
                    }
                    Err(ProcessError::Fork) => {
                        if ignore_fork {
                            let _ = txn.abort();
                            return;
                        }
                        let stored = self.ledger.block_get_by_height(
                            &txn,
                            &block.account(),
                            block.height(),
                        );
                        let _ = txn.abort();
                        match stored {
                            Ok(Some(stored)) => {
                                self.add_fork(BlockFork {
                                    first: Arc::new(stored),
                                    second: block.clone(),
                                    from_local: true,
                                });
                                Some(ProcessError::Fork)
                            }
                            _ => {
                                error!(target: "processor",
                                       account = %block.account(), height = block.height(),
                                       "fork detected but stored block missing");
                                Some(ProcessError::Inconsistent {
                                    account: block.account(),
                                    height: block.height(),
                                    hash: block.hash(),
                                })
                            }
                        }
                    }
                    Err(e) => {
                        let _ = txn.abort();
                        Some(e.clone())
                    }
                }
            }
            Err(e) => Some(ProcessError::Ledger(e)),
        };

        if let Some(e) = &error {
            self.stats.add(e.code());
        }
        let result = ProcessResult {
            operation: BlockOperation::Append,
            error,
            last_confirm_height: 0,
        };
        self.observers.notify_block(result, block.clone());
    }

    /// Fork ingestion per the fork-cap policy: store up to `max_allowed + 2`
    /// records; at the cap, replace the record at the highest stored height
    /// when the incoming height is lower, otherwise drop.
    fn process_block_fork(self: &Arc<Self>, first: &Arc<Block>, second: &Arc<Block>) {
        if !first.fork_with(second) {
            return;
        }

        let account = first.account();
        let height = first.height();
        let mut broadcast = false;
        let mut election = false;
        let mut removed: Option<(Arc<Block>, Arc<Block>)> = None;

        'work: {
            let txn = match self.ledger.begin_write() {
                Ok(txn) => txn,
                Err(e) => {
                    self.stats.add(e.code());
                    return;
                }
            };

            let info = match self.ledger.account_info_get(&txn, &account) {
                Ok(Some(info)) if height <= info.head_height => info,
                _ => return,
            };

            if info.confirmed().map(|c| c < height).unwrap_or(true) {
                election = true;
            }

            match self.ledger.fork_exists(&txn, &account, height) {
                Ok(true) => break 'work,
                Ok(false) => {}
                Err(e) => {
                    self.stats.add(e.code());
                    return;
                }
            }

            let Ok(Some(head)) = self.ledger.block_get(&txn, &info.head) else {
                self.stats.add("LEDGER_BLOCK_GET");
                return;
            };

            let cap = params::max_allowed_forks(self.clock.now(), head.credit()) + 2;
            if info.forks < cap {
                if self
                    .ledger
                    .fork_put(&txn, &account, height, first, second)
                    .is_err()
                {
                    let _ = txn.abort();
                    return;
                }
                let mut info = info;
                info.forks += 1;
                if self.ledger.account_info_put(&txn, &account, &info).is_err() {
                    let _ = txn.abort();
                    return;
                }
            } else {
                // At the cap: prefer keeping lower (older) forks.
                let mut max_height = height;
                let mut victim: Option<(Block, Block)> = None;
                let records = match self.ledger.forks_of_account(&txn, &account) {
                    Ok(records) => records,
                    Err(e) => {
                        self.stats.add(e.code());
                        let _ = txn.abort();
                        return;
                    }
                };
                for (a, b) in records {
                    if a.height() > max_height {
                        max_height = a.height();
                        victim = Some((a, b));
                    }
                }
                if max_height == height {
                    return;
                }
                let Some((va, vb)) = victim else {
                    warn!(target: "processor", account = %account,
                          "fork cap bookkeeping out of step with the table");
                    let _ = txn.abort();
                    return;
                };
                if self.ledger.fork_del(&txn, &account, max_height).is_err()
                    || self
                        .ledger
                        .fork_put(&txn, &account, height, first, second)
                        .is_err()
                {
                    let _ = txn.abort();
                    return;
                }
                removed = Some((Arc::new(va), Arc::new(vb)));
            }

            if txn.commit().is_err() {
                return;
            }
            broadcast = true;
        }

        if let Some((va, vb)) = removed {
            self.context.fork_event(false, &va, &vb);
        }
        if broadcast {
            self.context.broadcast_fork(first, second);
            self.context.fork_event(true, first, second);
        }
        if election {
            self.context.start_election(first, second);
        }
    }

    fn process_forced(self: &Arc<Self>, dynamic: &mut DynamicState, forced: BlockForced) {
        if forced.operation >= DYNAMIC_BEGIN {
            let Some(stack) = dynamic.stacks.get_mut(&forced.operation) else {
                return;
            };
            dynamic
                .accounts
                .entry(forced.operation)
                .or_default()
                .insert(forced.block.account());
            if let Some(top) = stack.last_mut() {
                top.block = Some(forced.block);
            }
            self.run_dynamic(dynamic, forced.operation);
        } else if forced.operation == BlockOperation::Append as u64
            || forced.operation == BlockOperation::Confirm as u64
        {
            let operation = dynamic.next_operation;
            dynamic.next_operation += 1;
            let op_kind = if forced.operation == BlockOperation::Append as u64 {
                BlockOperation::Append
            } else {
                BlockOperation::Confirm
            };
            dynamic
                .accounts
                .entry(operation)
                .or_default()
                .insert(forced.block.account());
            dynamic.roots.insert(operation, forced.block.account());
            dynamic.stacks.insert(
                operation,
                vec![BlockDynamic {
                    operation: op_kind,
                    block: Some(forced.block),
                }],
            );
            self.run_dynamic(dynamic, operation);
        } else {
            warn!(target: "processor", operation = forced.operation, "unknown forced operation");
        }
    }

    /// Drives one dynamic operation stack until it drains, waits or fails.
    fn run_dynamic(self: &Arc<Self>, dynamic: &mut DynamicState, operation: u64) {
        if !dynamic.stacks.contains_key(&operation) {
            return;
        }

        loop {
            let Some(stack) = dynamic.stacks.get_mut(&operation) else {
                return;
            };
            let Some(top) = stack.last() else {
                break;
            };
            let op_kind = top.operation;
            let Some(block) = top.block.clone() else {
                // A step waiting on a query has no block yet; nothing to do
                // until the callback resumes this operation.
                return;
            };

            let mut last_confirm_height = 0;
            let (outcome, control) = match op_kind {
                BlockOperation::Append => self.dynamic_append(dynamic, operation, &block),
                BlockOperation::Prepend => self.dynamic_prepend(&block),
                BlockOperation::Rollback => self.dynamic_rollback(dynamic, operation, &block),
                BlockOperation::Confirm => {
                    self.dynamic_confirm(dynamic, operation, &block, &mut last_confirm_height)
                }
                _ => (
                    Err(ProcessError::UnknownOperation),
                    StepControl::Break,
                ),
            };

            if let Err(e) = &outcome {
                self.stats.add(e.code());
            }
            let result = ProcessResult {
                operation: op_kind,
                error: outcome.err(),
                last_confirm_height,
            };
            self.observers.notify_block(result, block);

            match control {
                StepControl::Pop => {
                    if let Some(stack) = dynamic.stacks.get_mut(&operation) {
                        stack.pop();
                    }
                }
                StepControl::Continue => {}
                StepControl::Wait => return,
                StepControl::Break => break,
            }
        }

        dynamic.stacks.remove(&operation);
        let accounts = dynamic.accounts.remove(&operation).unwrap_or_default();
        self.update_forks(&accounts);
        dynamic.roots.remove(&operation);
    }

    fn dynamic_append(
        self: &Arc<Self>,
        dynamic: &mut DynamicState,
        operation: u64,
        block: &Arc<Block>,
    ) -> (Result<(), ProcessError>, StepControl) {
        let txn = match self.ledger.begin_write() {
            Ok(txn) => txn,
            Err(e) => return (Err(ProcessError::Ledger(e)), StepControl::Break),
        };
        let outcome = self.append_step(&txn, block);
        match outcome {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    return (Err(ProcessError::Ledger(e)), StepControl::Break);
                }
                self.queue_gap_caches(&block.hash());
                (Ok(()), StepControl::Pop)
            }
            Err(e @ (ProcessError::Previous
            | ProcessError::GapPrevious
            | ProcessError::TypeMismatch)) => {
                let _ = txn.abort();
                if block.height() == 0 {
                    return (Err(e), StepControl::Break);
                }
                self.context.query_block(
                    operation,
                    block.account(),
                    block.height() - 1,
                    block.previous(),
                    false,
                );
                self.push_step(dynamic, operation, BlockOperation::Append);
                (Err(e), StepControl::Wait)
            }
            Err(ProcessError::Pruned) => {
                let queried = self.query_below_tail(&txn, operation, &block.account());
                let _ = txn.abort();
                if !queried {
                    return (Err(ProcessError::Pruned), StepControl::Break);
                }
                self.push_step(dynamic, operation, BlockOperation::Prepend);
                (Err(ProcessError::Pruned), StepControl::Wait)
            }
            Err(e @ (ProcessError::GapReceiveSource | ProcessError::GapRewardSource)) => {
                let _ = txn.abort();
                self.context
                    .query_source(operation, strand_types::U256(block.link().0));
                self.push_step(dynamic, operation, BlockOperation::Append);
                (Err(e), StepControl::Wait)
            }
            Err(ProcessError::Fork) => {
                let stored =
                    self.ledger
                        .block_get_by_height(&txn, &block.account(), block.height());
                let _ = txn.abort();
                match stored {
                    Ok(Some(stored)) => {
                        let stored = Arc::new(stored);
                        dynamic
                            .accounts
                            .entry(operation)
                            .or_default()
                            .insert(stored.account());
                        if let Some(stack) = dynamic.stacks.get_mut(&operation) {
                            stack.push(BlockDynamic {
                                operation: BlockOperation::Rollback,
                                block: Some(stored),
                            });
                        }
                        (Err(ProcessError::Fork), StepControl::Continue)
                    }
                    _ => (
                        Err(ProcessError::Inconsistent {
                            account: block.account(),
                            height: block.height(),
                            hash: block.hash(),
                        }),
                        StepControl::Break,
                    ),
                }
            }
            Err(ProcessError::Exists) => {
                let _ = txn.abort();
                // Someone else appended it first; the goal is met.
                (Err(ProcessError::Exists), StepControl::Pop)
            }
            Err(e) => {
                let _ = txn.abort();
                (Err(e), StepControl::Break)
            }
        }
    }

    fn dynamic_prepend(self: &Arc<Self>, block: &Arc<Block>) -> (Result<(), ProcessError>, StepControl) {
        let txn = match self.ledger.begin_write() {
            Ok(txn) => txn,
            Err(e) => return (Err(ProcessError::Ledger(e)), StepControl::Break),
        };
        match self.prepend_step(&txn, block) {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    return (Err(ProcessError::Ledger(e)), StepControl::Break);
                }
                (Ok(()), StepControl::Pop)
            }
            Err(ProcessError::PrependIgnore) => {
                let _ = txn.abort();
                (Err(ProcessError::PrependIgnore), StepControl::Pop)
            }
            Err(e) => {
                let _ = txn.abort();
                (Err(e), StepControl::Break)
            }
        }
    }

    fn dynamic_rollback(
        self: &Arc<Self>,
        dynamic: &mut DynamicState,
        operation: u64,
        block: &Arc<Block>,
    ) -> (Result<(), ProcessError>, StepControl) {
        let txn = match self.ledger.begin_write() {
            Ok(txn) => txn,
            Err(e) => return (Err(ProcessError::Ledger(e)), StepControl::Break),
        };
        let outcome = rollback::rollback_block(&self.ledger, &txn, block);
        match outcome {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    return (Err(ProcessError::Ledger(e)), StepControl::Break);
                }
                (Ok(()), StepControl::Pop)
            }
            Err(ProcessError::RollbackIgnore) => {
                let _ = txn.abort();
                (Err(ProcessError::RollbackIgnore), StepControl::Pop)
            }
            Err(ProcessError::RollbackTail) => {
                let queried = self.query_below_tail(&txn, operation, &block.account());
                let _ = txn.abort();
                if !queried {
                    return (Err(ProcessError::RollbackTail), StepControl::Break);
                }
                self.push_step(dynamic, operation, BlockOperation::Prepend);
                (Err(ProcessError::RollbackTail), StepControl::Wait)
            }
            Err(ProcessError::RollbackNonHead) => {
                let follow = self.rollback_successor(&txn, block);
                let _ = txn.abort();
                match follow {
                    Some(successor) => {
                        dynamic
                            .accounts
                            .entry(operation)
                            .or_default()
                            .insert(successor.account());
                        if let Some(stack) = dynamic.stacks.get_mut(&operation) {
                            stack.push(BlockDynamic {
                                operation: BlockOperation::Rollback,
                                block: Some(successor),
                            });
                        }
                        (Err(ProcessError::RollbackNonHead), StepControl::Continue)
                    }
                    None => (Err(ProcessError::RollbackNonHead), StepControl::Break),
                }
            }
            Err(ProcessError::RollbackRewarded) => {
                let follow = self.rollback_rewarded_head(&txn, block);
                let _ = txn.abort();
                match follow {
                    Some(head) => {
                        dynamic
                            .accounts
                            .entry(operation)
                            .or_default()
                            .insert(head.account());
                        if let Some(stack) = dynamic.stacks.get_mut(&operation) {
                            stack.push(BlockDynamic {
                                operation: BlockOperation::Rollback,
                                block: Some(head),
                            });
                        }
                        (Err(ProcessError::RollbackRewarded), StepControl::Continue)
                    }
                    None => (Err(ProcessError::RollbackRewarded), StepControl::Break),
                }
            }
            Err(ProcessError::RollbackReceived) => {
                let follow = self.rollback_receiver_head(&txn, block);
                let _ = txn.abort();
                match follow {
                    Some(head) => {
                        dynamic
                            .accounts
                            .entry(operation)
                            .or_default()
                            .insert(head.account());
                        if let Some(stack) = dynamic.stacks.get_mut(&operation) {
                            stack.push(BlockDynamic {
                                operation: BlockOperation::Rollback,
                                block: Some(head),
                            });
                        }
                        (Err(ProcessError::RollbackReceived), StepControl::Continue)
                    }
                    None => (Err(ProcessError::RollbackReceived), StepControl::Break),
                }
            }
            Err(ProcessError::RollbackSourcePruned) => {
                let _ = txn.abort();
                self.context
                    .query_source(operation, strand_types::U256(block.link().0));
                self.push_step(dynamic, operation, BlockOperation::Append);
                (Err(ProcessError::RollbackSourcePruned), StepControl::Wait)
            }
            Err(e) => {
                let _ = txn.abort();
                (Err(e), StepControl::Break)
            }
        }
    }

    fn dynamic_confirm(
        self: &Arc<Self>,
        dynamic: &mut DynamicState,
        operation: u64,
        block: &Arc<Block>,
        last_confirm_height: &mut u64,
    ) -> (Result<(), ProcessError>, StepControl) {
        let txn = match self.ledger.begin_write() {
            Ok(txn) => txn,
            Err(e) => return (Err(ProcessError::Ledger(e)), StepControl::Break),
        };
        match self.confirm_step(&txn, block, last_confirm_height) {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    return (Err(ProcessError::Ledger(e)), StepControl::Break);
                }
                (Ok(()), StepControl::Pop)
            }
            Err(ProcessError::ConfirmBlockMiss) => {
                let _ = txn.abort();
                dynamic
                    .accounts
                    .entry(operation)
                    .or_default()
                    .insert(block.account());
                if let Some(stack) = dynamic.stacks.get_mut(&operation) {
                    stack.push(BlockDynamic {
                        operation: BlockOperation::Append,
                        block: Some(block.clone()),
                    });
                }
                (Err(ProcessError::ConfirmBlockMiss), StepControl::Continue)
            }
            Err(e) => {
                let _ = txn.abort();
                (Err(e), StepControl::Break)
            }
        }
    }

    fn push_step(&self, dynamic: &mut DynamicState, operation: u64, kind: BlockOperation) {
        if let Some(stack) = dynamic.stacks.get_mut(&operation) {
            stack.push(BlockDynamic {
                operation: kind,
                block: None,
            });
        }
    }

    /// Queries the block just below an account's stored tail, for backfill.
    fn query_below_tail(&self, txn: &Transaction, operation: u64, account: &Account) -> bool {
        let Ok(Some(info)) = self.ledger.account_info_get(txn, account) else {
            return false;
        };
        if info.tail_height == 0 {
            return false;
        }
        let Ok(Some(tail)) = self.ledger.block_get(txn, &info.tail) else {
            return false;
        };
        self.context.query_block(
            operation,
            tail.account(),
            tail.height() - 1,
            tail.previous(),
            true,
        );
        true
    }

    fn rollback_successor(&self, txn: &Transaction, block: &Arc<Block>) -> Option<Arc<Block>> {
        let successor = self.ledger.block_successor_get(txn, &block.hash()).ok()??;
        let successor = self.ledger.block_get(txn, &successor).ok()??;
        Some(Arc::new(successor))
    }

    /// Head of the representative chain that already claimed the rewardable
    /// this rollback would delete.
    fn rollback_rewarded_head(&self, txn: &Transaction, block: &Arc<Block>) -> Option<Arc<Block>> {
        let previous = self.ledger.block_get(txn, &block.previous()).ok()??;
        let info = self
            .ledger
            .account_info_get(txn, &previous.representative())
            .ok()??;
        let head = self.ledger.block_get(txn, &info.head).ok()??;
        Some(Arc::new(head))
    }

    /// Head of the account that already received the send this rollback
    /// would retract.
    fn rollback_receiver_head(&self, txn: &Transaction, block: &Arc<Block>) -> Option<Arc<Block>> {
        let destination = strand_types::U256(block.link().0);
        let info = self.ledger.account_info_get(txn, &destination).ok()??;
        let head = self.ledger.block_get(txn, &info.head).ok()??;
        Some(Arc::new(head))
    }

    fn append_step(&self, txn: &Transaction, block: &Arc<Block>) -> Result<(), ProcessError> {
        append::append_block(&self.ledger, txn, block, self.clock.now())
    }

    fn prepend_step(&self, txn: &Transaction, block: &Arc<Block>) -> Result<(), ProcessError> {
        // Extends the chain below the stored tail during backfill.
        if !block.check_signature() {
            return Err(ProcessError::Signature);
        }
        let Some(mut info) = self.ledger.account_info_get(txn, &block.account())? else {
            return Err(ProcessError::PrependIgnore);
        };
        if info.tail_height != block.height() + 1 {
            return Err(ProcessError::PrependIgnore);
        }
        let Some(tail) = self.ledger.block_get(txn, &info.tail)? else {
            return Err(ProcessError::Ledger(strand_types::LedgerError::NotFound));
        };
        if tail.previous() != block.hash() {
            return Err(ProcessError::PrependIgnore);
        }

        self.ledger
            .block_put_with_successor(txn, &block.hash(), block, &info.tail)?;
        info.tail = block.hash();
        info.tail_height = block.height();
        self.ledger.account_info_put(txn, &block.account(), &info)?;
        Ok(())
    }

    fn confirm_step(
        &self,
        txn: &Transaction,
        block: &Arc<Block>,
        last_confirm_height: &mut u64,
    ) -> Result<(), ProcessError> {
        if !self.ledger.block_exists(txn, &block.hash())? {
            return Err(ProcessError::ConfirmBlockMiss);
        }
        let Some(mut info) = self.ledger.account_info_get(txn, &block.account())? else {
            error!(target: "processor", account = %block.account(),
                   "confirm: block present but account info missing");
            return Err(ProcessError::Inconsistent {
                account: block.account(),
                height: block.height(),
                hash: block.hash(),
            });
        };
        *last_confirm_height = info.confirmed_height;
        if info.confirmed().map(|c| block.height() > c).unwrap_or(true) {
            info.confirmed_height = block.height();
            self.ledger.account_info_put(txn, &block.account(), &info)?;
        }
        Ok(())
    }

    /// Reconciles the fork table of every account a dynamic operation
    /// touched: records above the live head are dropped and the counter is
    /// rewritten from the surviving records.
    fn update_forks(self: &Arc<Self>, accounts: &HashSet<Account>) {
        if accounts.is_empty() {
            return;
        }
        let txn = match self.ledger.begin_write() {
            Ok(txn) => txn,
            Err(e) => {
                self.stats.add(e.code());
                return;
            }
        };
        for account in accounts {
            let info = match self.ledger.account_info_get(&txn, account) {
                Ok(Some(info)) => info,
                Ok(None) => {
                    if let Err(e) = self.ledger.fork_del_account(&txn, account) {
                        self.stats.add(e.code());
                    }
                    continue;
                }
                Err(e) => {
                    self.stats.add(e.code());
                    continue;
                }
            };

            let records = match self.ledger.forks_of_account(&txn, account) {
                Ok(records) => records,
                Err(e) => {
                    self.stats.add(e.code());
                    continue;
                }
            };
            let mut live: u32 = 0;
            let mut stale = Vec::new();
            for (first, _) in records {
                if first.height() > info.head_height {
                    stale.push(first.height());
                } else {
                    live += 1;
                }
            }
            for height in stale {
                if let Err(e) = self.ledger.fork_del(&txn, account, height) {
                    self.stats.add(e.code());
                }
            }
            if live != info.forks {
                let mut info = info;
                info.forks = live;
                if let Err(e) = self.ledger.account_info_put(&txn, account, &info) {
                    self.stats.add(e.code());
                }
            }
        }
        if let Err(e) = txn.commit() {
            debug!(target: "processor", error = %e, "fork reconciliation commit failed");
        }
    }
}
