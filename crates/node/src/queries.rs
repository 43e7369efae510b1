//! Outstanding block queries.
//!
//! Components that need a block from the network register a callback under a
//! sequence number; acks route back through [`BlockQueries::process_ack`].
//! A callback decides whether the answer finishes the query or whether it
//! should be retried against another peer.

use crate::message::{Message, MessageSender, QueryBy, QueryMessage, QueryStatus};
use crate::peers::Peers;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_types::{Account, Block, BlockHash};
use tracing::debug;

/// Resolution of one answer. `Finish` removes the query, `Retry` asks
/// another peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResolution {
    Finish,
    Retry,
}

pub type QueryCallback =
    Box<dyn Fn(QueryStatus, Option<Arc<Block>>) -> QueryResolution + Send + Sync>;

struct PendingQuery {
    message: QueryMessage,
    callback: QueryCallback,
    attempts: u32,
    issued: Instant,
}

/// Manager for in-flight block queries.
pub struct BlockQueries {
    sender: Arc<dyn MessageSender>,
    peers: Arc<Peers>,
    pending: Mutex<HashMap<u64, PendingQuery>>,
    sequence: AtomicU64,
}

impl BlockQueries {
    /// Retries before a query gives up with a timeout answer.
    const MAX_ATTEMPTS: u32 = 8;
    /// Age at which an unanswered query is retried.
    const RETRY_AFTER: Duration = Duration::from_secs(5);

    pub fn new(sender: Arc<dyn MessageSender>, peers: Arc<Peers>) -> Self {
        BlockQueries {
            sender,
            peers,
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn query_by_hash(
        &self,
        account: Account,
        height: u64,
        hash: BlockHash,
        callback: QueryCallback,
    ) {
        self.issue(QueryBy::Hash, account, height, hash, callback);
    }

    pub fn query_by_height(
        &self,
        account: Account,
        height: u64,
        callback: QueryCallback,
    ) {
        self.issue(QueryBy::Height, account, height, BlockHash::ZERO, callback);
    }

    /// Asks for the successor of `hash` at `height - 1`.
    pub fn query_by_previous(
        &self,
        account: Account,
        height: u64,
        previous: BlockHash,
        callback: QueryCallback,
    ) {
        self.issue(QueryBy::Previous, account, height, previous, callback);
    }

    fn issue(
        &self,
        by: QueryBy,
        account: Account,
        height: u64,
        hash: BlockHash,
        callback: QueryCallback,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message = QueryMessage::request(sequence, by, account, height, hash);
        {
            let mut pending = self.pending.lock();
            pending.insert(
                sequence,
                PendingQuery {
                    message: message.clone(),
                    callback,
                    attempts: 1,
                    issued: Instant::now(),
                },
            );
        }
        self.send(&message);
    }

    fn send(&self, message: &QueryMessage) {
        match self.peers.random_peer() {
            Some(peer) => self
                .sender
                .send(&Message::Query(message.clone()), peer.endpoint),
            None => debug!(target: "queries", "no peer available for query"),
        }
    }

    /// Routes an ack to its callback. Mismatched or unknown acks are
    /// dropped silently; a peer can always send garbage. The callback runs
    /// outside the pending lock so it may issue follow-up queries.
    pub fn process_ack(&self, ack: &QueryMessage) {
        let entry = self.pending.lock().remove(&ack.sequence);
        let Some(entry) = entry else {
            return;
        };
        let request = &entry.message;
        if request.by != ack.by
            || request.account != ack.account
            || request.height != ack.height
            || request.hash != ack.hash
        {
            self.pending.lock().insert(ack.sequence, entry);
            return;
        }
        match (entry.callback)(ack.status, ack.block.clone().map(Arc::new)) {
            QueryResolution::Finish => {}
            QueryResolution::Retry => self.requeue(ack.sequence, entry),
        }
    }

    /// Re-issues a query against another peer, or reports a timeout once the
    /// attempt budget is spent.
    fn requeue(&self, sequence: u64, mut entry: PendingQuery) {
        if entry.attempts >= Self::MAX_ATTEMPTS {
            (entry.callback)(QueryStatus::Timeout, None);
            return;
        }
        entry.attempts += 1;
        entry.issued = Instant::now();
        let message = entry.message.clone();
        self.pending.lock().insert(sequence, entry);
        self.send(&message);
    }

    fn retry(&self, sequence: u64) {
        let entry = self.pending.lock().remove(&sequence);
        if let Some(entry) = entry {
            self.requeue(sequence, entry);
        }
    }

    /// Re-issues stale queries; driven by the alarm.
    pub fn age(&self) {
        let stale: Vec<u64> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, e)| e.issued.elapsed() >= Self::RETRY_AFTER)
                .map(|(seq, _)| *seq)
                .collect()
        };
        for sequence in stale {
            self.retry(sequence);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NullSender;
    use parking_lot::Mutex as PlMutex;
    use strand_types::U256;

    fn queries() -> BlockQueries {
        BlockQueries::new(Arc::new(NullSender), Arc::new(Peers::default()))
    }

    #[test]
    fn ack_finishes_query() {
        let queries = queries();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let seen_l = seen.clone();
        queries.query_by_hash(
            U256::from_u64(1),
            5,
            U256::from_u64(9),
            Box::new(move |status, _| {
                seen_l.lock().push(status);
                QueryResolution::Finish
            }),
        );
        assert_eq!(queries.len(), 1);

        let request = QueryMessage::request(1, QueryBy::Hash, U256::from_u64(1), 5, U256::from_u64(9));
        let ack = QueryMessage::ack_of(&request, QueryStatus::Miss, None);
        queries.process_ack(&ack);
        assert!(queries.is_empty());
        assert_eq!(*seen.lock(), vec![QueryStatus::Miss]);
    }

    #[test]
    fn mismatched_ack_is_ignored() {
        let queries = queries();
        queries.query_by_hash(
            U256::from_u64(1),
            5,
            U256::from_u64(9),
            Box::new(|_, _| QueryResolution::Finish),
        );
        let request = QueryMessage::request(1, QueryBy::Hash, U256::from_u64(2), 5, U256::from_u64(9));
        let ack = QueryMessage::ack_of(&request, QueryStatus::Success, None);
        queries.process_ack(&ack);
        assert_eq!(queries.len(), 1, "wrong account leaves the query pending");
    }

    #[test]
    fn retries_are_bounded() {
        let queries = queries();
        let timeouts = Arc::new(PlMutex::new(0u32));
        let timeouts_l = timeouts.clone();
        queries.query_by_hash(
            U256::from_u64(1),
            5,
            U256::from_u64(9),
            Box::new(move |status, _| {
                if status == QueryStatus::Timeout {
                    *timeouts_l.lock() += 1;
                }
                QueryResolution::Retry
            }),
        );

        let request = QueryMessage::request(1, QueryBy::Hash, U256::from_u64(1), 5, U256::from_u64(9));
        for _ in 0..BlockQueries::MAX_ATTEMPTS + 2 {
            let ack = QueryMessage::ack_of(&request, QueryStatus::Miss, None);
            queries.process_ack(&ack);
        }
        assert!(queries.is_empty());
        assert_eq!(*timeouts.lock(), 1, "timeout reported exactly once");
    }
}
