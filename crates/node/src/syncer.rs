//! Per-account chain pulls and the active-account working set.
//!
//! Bootstrap hands the syncer `(account, start height)` work items; each one
//! walks the remote chain through by-previous block queries, feeding every
//! answer into the processor's admit path. Batch accounting lets the
//! bootstrap driver wait for a whole round to drain.

use crate::message::QueryStatus;
use crate::processor::BlockProcessor;
use crate::queries::{BlockQueries, QueryResolution};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_types::{Account, BlockHash};
use tracing::debug;

/// Miss/total counters backing the bootstrap attack heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStat {
    pub total: u64,
    pub miss: u64,
}

#[derive(Clone)]
struct SyncItem {
    account: Account,
    height: u64,
    /// Hash of the local block at `height - 1`; `None` starts from genesis.
    previous: Option<BlockHash>,
    batch: u32,
}

struct SyncState {
    in_flight: HashMap<Account, SyncItem>,
    backlog: VecDeque<SyncItem>,
    batches: HashMap<u32, u64>,
    stat: SyncStat,
}

/// The chain-pull engine.
pub struct Syncer {
    state: Mutex<SyncState>,
    queries: Arc<BlockQueries>,
    processor: Arc<BlockProcessor>,
}

impl Syncer {
    /// Accounts pulled concurrently; the rest wait in the backlog.
    const MAX_IN_FLIGHT: usize = 1024;
    /// Batch id used outside bootstrap rounds.
    pub const DEFAULT_BATCH: u32 = u32::MAX;

    pub fn new(queries: Arc<BlockQueries>, processor: Arc<BlockProcessor>) -> Arc<Self> {
        Arc::new(Syncer {
            state: Mutex::new(SyncState {
                in_flight: HashMap::new(),
                backlog: VecDeque::new(),
                batches: HashMap::new(),
                stat: SyncStat::default(),
            }),
            queries,
            processor,
        })
    }

    /// Queues a pull of `account` starting at `height`. `previous` anchors
    /// the by-previous walk; `None` pulls the chain from genesis.
    pub fn add(
        self: &Arc<Self>,
        account: Account,
        height: u64,
        previous: Option<BlockHash>,
        batch: u32,
    ) {
        let item = SyncItem {
            account,
            height,
            previous,
            batch,
        };
        let start = {
            let mut state = self.state.lock();
            if state.in_flight.contains_key(&account)
                || state.backlog.iter().any(|i| i.account == account)
            {
                return;
            }
            *state.batches.entry(batch).or_insert(0) += 1;
            if state.in_flight.len() < Self::MAX_IN_FLIGHT {
                state.in_flight.insert(account, item.clone());
                true
            } else {
                state.backlog.push_back(item);
                false
            }
        };
        if start {
            self.issue(item);
        }
    }

    /// True when every entry of `batch` has drained.
    pub fn finished(&self, batch: u32) -> bool {
        self.state
            .lock()
            .batches
            .get(&batch)
            .map(|count| *count == 0)
            .unwrap_or(true)
    }

    pub fn stat(&self) -> SyncStat {
        self.state.lock().stat
    }

    pub fn reset_stat(&self) {
        self.state.lock().stat = SyncStat::default();
    }

    pub fn queue_len(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.in_flight.len(), state.backlog.len())
    }

    fn issue(self: &Arc<Self>, item: SyncItem) {
        let syncer = self.clone();
        let account = item.account;
        let height = item.height;
        match item.previous {
            Some(previous) => {
                self.queries.query_by_previous(
                    account,
                    height,
                    previous,
                    Box::new(move |status, block| syncer.on_answer(account, status, block)),
                );
            }
            None => {
                self.queries.query_by_height(
                    account,
                    height,
                    Box::new(move |status, block| syncer.on_answer(account, status, block)),
                );
            }
        }
    }

    fn on_answer(
        self: &Arc<Self>,
        account: Account,
        status: QueryStatus,
        block: Option<Arc<strand_types::Block>>,
    ) -> QueryResolution {
        match (status, block) {
            (QueryStatus::Success, Some(block)) => {
                let next = SyncItem {
                    account,
                    height: block.height() + 1,
                    previous: Some(block.hash()),
                    batch: {
                        let state = self.state.lock();
                        state
                            .in_flight
                            .get(&account)
                            .map(|i| i.batch)
                            .unwrap_or(Self::DEFAULT_BATCH)
                    },
                };
                {
                    let mut state = self.state.lock();
                    state.stat.total += 1;
                    if let Some(item) = state.in_flight.get_mut(&account) {
                        item.height = next.height;
                        item.previous = next.previous;
                    }
                }
                self.processor.add(block);
                self.continue_pull(next);
                QueryResolution::Finish
            }
            (QueryStatus::Miss, _) | (QueryStatus::Timeout, _) => {
                // Miss means the peer has nothing past our cursor: the pull
                // is complete. Timeouts also drain so a dead peer cannot
                // wedge a batch.
                if status == QueryStatus::Timeout {
                    self.state.lock().stat.miss += 1;
                }
                self.complete(account);
                QueryResolution::Finish
            }
            (QueryStatus::Pruned, _) => {
                self.state.lock().stat.miss += 1;
                self.complete(account);
                QueryResolution::Finish
            }
            (QueryStatus::Fork, Some(block)) => {
                // The peer disagrees below our head; admit its block so the
                // fork machinery can take over.
                self.state.lock().stat.miss += 1;
                self.processor.add(block);
                self.complete(account);
                QueryResolution::Finish
            }
            _ => QueryResolution::Retry,
        }
    }

    /// Re-issues the walk for the next height, with backpressure against a
    /// busy processor.
    fn continue_pull(self: &Arc<Self>, item: SyncItem) {
        if self.processor.busy() {
            let mut state = self.state.lock();
            state.in_flight.remove(&item.account);
            state.backlog.push_back(item);
            return;
        }
        self.issue(item);
    }

    fn complete(self: &Arc<Self>, account: Account) {
        let next = {
            let mut state = self.state.lock();
            if let Some(item) = state.in_flight.remove(&account) {
                if let Some(count) = state.batches.get_mut(&item.batch) {
                    *count = count.saturating_sub(1);
                }
            }
            if state.in_flight.len() < Self::MAX_IN_FLIGHT {
                state.backlog.pop_front().map(|item| {
                    state.in_flight.insert(item.account, item.clone());
                    item
                })
            } else {
                None
            }
        };
        if let Some(item) = next {
            self.issue(item);
        }
    }

    /// Drains backlog slots freed by backpressure; driven by the alarm.
    pub fn pump(self: &Arc<Self>) {
        loop {
            if self.processor.busy() {
                return;
            }
            let item = {
                let mut state = self.state.lock();
                if state.in_flight.len() >= Self::MAX_IN_FLIGHT {
                    return;
                }
                match state.backlog.pop_front() {
                    Some(item) => {
                        state.in_flight.insert(item.account, item.clone());
                        item
                    }
                    None => return,
                }
            };
            debug!(target: "syncer", account = %item.account, "backlog item resumed");
            self.issue(item);
        }
    }
}

/// Accounts touched recently, iterated by the LIGHT bootstrap server.
pub struct ActiveAccounts {
    inner: Mutex<BTreeMap<Account, Instant>>,
    age: Duration,
}

impl ActiveAccounts {
    pub const DEFAULT_AGE: Duration = Duration::from_secs(600);

    pub fn new(age: Duration) -> Self {
        ActiveAccounts {
            inner: Mutex::new(BTreeMap::new()),
            age,
        }
    }

    pub fn add(&self, account: Account) {
        self.inner.lock().insert(account, Instant::now());
    }

    /// First active account at or after `start`, in key order.
    pub fn next_at_or_after(&self, start: &Account) -> Option<Account> {
        let inner = self.inner.lock();
        inner.range(*start..).next().map(|(account, _)| *account)
    }

    pub fn age_out(&self) {
        let cutoff = Instant::now() - self.age;
        self.inner.lock().retain(|_, at| *at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ActiveAccounts {
    fn default() -> Self {
        Self::new(Self::DEFAULT_AGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::U256;

    #[test]
    fn active_accounts_ordered_cursor() {
        let active = ActiveAccounts::default();
        active.add(U256::from_u64(5));
        active.add(U256::from_u64(2));
        active.add(U256::from_u64(9));

        assert_eq!(
            active.next_at_or_after(&U256::ZERO),
            Some(U256::from_u64(2))
        );
        assert_eq!(
            active.next_at_or_after(&U256::from_u64(3)),
            Some(U256::from_u64(5))
        );
        assert_eq!(
            active.next_at_or_after(&U256::from_u64(9)),
            Some(U256::from_u64(9))
        );
        assert_eq!(active.next_at_or_after(&U256::from_u64(10)), None);
    }

    #[test]
    fn active_accounts_age_out() {
        let active = ActiveAccounts::new(Duration::from_millis(0));
        active.add(U256::from_u64(1));
        std::thread::sleep(Duration::from_millis(5));
        active.age_out();
        assert!(active.is_empty());
    }
}
