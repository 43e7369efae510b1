//! Node assembly: wires the ledger, processor, elections, bootstrap and the
//! message handlers together, and owns the lifecycle.

use crate::alarm::Alarm;
use crate::bootstrap::{Bootstrap, BootstrapListener, NodeStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::elections::{ConfirmManager, ElectionConfig, Elections};
use crate::message::{
    ConfirmMessage, Message, MessageSender, PublishMessage, QueryBy, QueryMessage, QueryStatus,
};
use crate::observers::{callback_envelope, Observers};
use crate::peers::Peers;
use crate::processor::{BlockFork, BlockProcessor, ProcessorContext};
use crate::queries::{BlockQueries, QueryResolution};
use crate::stats::Stats;
use crate::syncer::{ActiveAccounts, Syncer};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_ledger::{Ledger, Transaction};
use strand_types::params::{DAY_SECONDS, QUALIFIED_REP_WEIGHT};
use strand_types::{Account, Block, BlockHash, BlockOpcode, LedgerError, U256};
use tracing::{debug, info};

/// Outbound JSON sink for block callbacks. The HTTP/websocket bridge lives
/// outside the core.
pub trait CallbackSink: Send + Sync {
    fn deliver(&self, envelope: serde_json::Value);
}

/// Glue from the processor to the rest of the node. Holds weak-ish state
/// installed after construction to break the processor/node cycle.
struct NodeProcessorContext {
    sender: Arc<dyn MessageSender>,
    queries: once_cell::sync::OnceCell<Arc<BlockQueries>>,
    processor: once_cell::sync::OnceCell<Arc<BlockProcessor>>,
    elections: once_cell::sync::OnceCell<Arc<Elections>>,
    observers: Arc<Observers>,
}

impl NodeProcessorContext {
    fn resume_callback(
        &self,
        operation: u64,
    ) -> impl Fn(QueryStatus, Option<Arc<Block>>) -> QueryResolution + Send + Sync {
        let processor = self.processor.get().cloned();
        move |status, block| match (status, &block) {
            (QueryStatus::Success, Some(block)) => {
                if let Some(processor) = &processor {
                    processor.add_forced(crate::processor::BlockForced::resume(
                        operation,
                        block.clone(),
                    ));
                }
                QueryResolution::Finish
            }
            (QueryStatus::Timeout, _) => QueryResolution::Finish,
            _ => QueryResolution::Retry,
        }
    }
}

impl ProcessorContext for NodeProcessorContext {
    fn publish(&self, block: &Arc<Block>) {
        let message = PublishMessage::new((**block).clone());
        self.sender.broadcast(&Message::Publish(message));
    }

    fn broadcast_fork(&self, first: &Arc<Block>, second: &Arc<Block>) {
        let message = crate::message::ForkMessage::new((**first).clone(), (**second).clone());
        self.sender.broadcast(&Message::Fork(message));
    }

    fn start_election(&self, first: &Arc<Block>, second: &Arc<Block>) {
        if let Some(elections) = self.elections.get() {
            elections.start(first, second);
        }
    }

    fn fork_event(&self, added: bool, first: &Arc<Block>, second: &Arc<Block>) {
        self.observers.notify_fork(added, first.clone(), second.clone());
    }

    fn query_block(
        &self,
        operation: u64,
        account: Account,
        height: u64,
        hash: BlockHash,
        _for_prepend: bool,
    ) {
        if let Some(queries) = self.queries.get() {
            let callback = self.resume_callback(operation);
            queries.query_by_hash(account, height, hash, Box::new(callback));
        }
    }

    fn query_source(&self, operation: u64, hash: BlockHash) {
        if let Some(queries) = self.queries.get() {
            let callback = self.resume_callback(operation);
            queries.query_by_hash(U256::ZERO, strand_types::INVALID_HEIGHT, hash, Box::new(callback));
        }
    }
}

/// The assembled node.
pub struct Node {
    pub config: NodeConfig,
    pub ledger: Arc<Ledger>,
    pub stats: Stats,
    pub peers: Arc<Peers>,
    pub processor: Arc<BlockProcessor>,
    pub elections: Arc<Elections>,
    pub queries: Arc<BlockQueries>,
    pub syncer: Arc<Syncer>,
    pub active_accounts: Arc<ActiveAccounts>,
    pub observers: Arc<Observers>,
    pub confirm_manager: ConfirmManager,
    listener: BootstrapListener,
    bootstrap: Arc<Bootstrap>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    status: Arc<AtomicU8>,
    alarm: RwLock<Alarm>,
}

impl Node {
    /// Builds the node. Any store failure here is fatal: the run loop is
    /// never entered on a broken ledger.
    pub fn new(
        config: NodeConfig,
        sender: Arc<dyn MessageSender>,
        callback_sink: Option<Arc<dyn CallbackSink>>,
        genesis_account: Option<Account>,
    ) -> Result<Arc<Self>, LedgerError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_clock(config, sender, callback_sink, genesis_account, clock)
    }

    pub fn with_clock(
        config: NodeConfig,
        sender: Arc<dyn MessageSender>,
        callback_sink: Option<Arc<dyn CallbackSink>>,
        genesis_account: Option<Account>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, LedgerError> {
        let ledger = Arc::new(Ledger::open(config.ledger_path())?);
        let stats = Stats::new();
        let peers = Arc::new(Peers::default());
        let observers = Arc::new(Observers::new());
        let active_accounts = Arc::new(ActiveAccounts::default());
        let status = Arc::new(AtomicU8::new(NodeStatus::Starting as u8));

        let context = Arc::new(NodeProcessorContext {
            sender: sender.clone(),
            queries: once_cell::sync::OnceCell::new(),
            processor: once_cell::sync::OnceCell::new(),
            elections: once_cell::sync::OnceCell::new(),
            observers: observers.clone(),
        });

        let processor = BlockProcessor::new(
            ledger.clone(),
            context.clone(),
            observers.clone(),
            stats.clone(),
            clock.clone(),
        );
        let queries = Arc::new(BlockQueries::new(sender.clone(), peers.clone()));
        let elections = Elections::new(
            ledger.clone(),
            processor.clone(),
            sender.clone(),
            stats.clone(),
            ElectionConfig {
                workers: config.election_workers,
                quorum_percent: config.quorum_percent,
                timeout: Duration::from_secs(config.election_timeout_secs),
                request_interval: Duration::from_secs(5),
            },
        );
        let _ = context.queries.set(queries.clone());
        let _ = context.processor.set(processor.clone());
        let _ = context.elections.set(elections.clone());

        let syncer = Syncer::new(queries.clone(), processor.clone());
        let listener = BootstrapListener::new(
            ledger.clone(),
            active_accounts.clone(),
            config.bootstrap_port,
        );
        let bootstrap = Bootstrap::start(
            ledger.clone(),
            peers.clone(),
            syncer.clone(),
            processor.clone(),
            stats.clone(),
            status.clone(),
            genesis_account,
        );

        let confirm_manager = ConfirmManager::new(
            config.reconfirm_interval_secs,
            Duration::from_secs(600),
        );

        let node = Arc::new(Node {
            config,
            ledger,
            stats,
            peers,
            processor,
            elections,
            queries,
            syncer,
            active_accounts,
            observers,
            confirm_manager,
            listener,
            bootstrap,
            sender,
            clock,
            status,
            alarm: RwLock::new(Alarm::new()),
        });

        node.register_observers(callback_sink);
        Ok(node)
    }

    /// Wires the block and fork observers: active-account tracking and the
    /// outbound callback envelopes.
    fn register_observers(self: &Arc<Self>, callback_sink: Option<Arc<dyn CallbackSink>>) {
        let active = self.active_accounts.clone();
        self.observers.add_block_observer(Box::new(move |result, block| {
            if result.is_success() {
                active.add(block.account());
            }
        }));

        if let Some(sink) = callback_sink {
            if self.config.callback_enabled {
                self.observers.add_block_observer(Box::new(move |result, block| {
                    sink.deliver(callback_envelope(result, block, None));
                }));
            }
        }
    }

    /// Starts the listener and the periodic maintenance tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), LedgerError> {
        self.listener
            .start()
            .map_err(|e| LedgerError::Backend(format!("bootstrap listener: {e}")))?;

        let alarm = self.alarm.read();
        let processor = self.processor.clone();
        alarm.recurring(Duration::from_secs(1), move || processor.age_gap_caches());
        let queries = self.queries.clone();
        alarm.recurring(Duration::from_secs(1), move || queries.age());
        let elections = self.elections.clone();
        alarm.recurring(Duration::from_secs(1), move || elections.tick());
        let active = self.active_accounts.clone();
        alarm.recurring(Duration::from_secs(10), move || active.age_out());
        let peers = self.peers.clone();
        alarm.recurring(Duration::from_secs(60), move || peers.age());
        let syncer = self.syncer.clone();
        alarm.recurring(Duration::from_secs(1), move || syncer.pump());

        // Seed preconfigured peers so bootstrap has someone to talk to; the
        // placeholder identities are replaced by real ones on first contact.
        // Re-seeded periodically so aging never strands the node peerless.
        let peers = self.peers.clone();
        let preconfigured = self.config.preconfigured_peers.clone();
        let seed = move || {
            for (index, endpoint) in preconfigured.iter().enumerate() {
                if peers.len() > preconfigured.len() {
                    break;
                }
                peers.insert(
                    U256::from_u64(index as u64 + 1),
                    *endpoint,
                    strand_types::Amount::ZERO,
                );
            }
        };
        seed();
        alarm.recurring(Duration::from_secs(300), seed);

        info!(target: "node", "node started");
        Ok(())
    }

    /// Orderly shutdown: stop producers before consumers.
    pub fn stop(&self) {
        self.bootstrap.stop();
        self.listener.stop();
        self.elections.stop();
        self.processor.stop();
        self.observers.stop();
        self.alarm.write().stop();
        info!(target: "node", "node stopped");
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn busy(&self) -> bool {
        self.processor.busy()
    }

    /// Restarts the bootstrap schedule from the initial FULL burst.
    pub fn bootstrap_restart(&self) {
        self.bootstrap.restart();
    }

    /// Status document for the CLI and RPC surfaces.
    pub fn status_json(&self) -> serde_json::Value {
        let (admit, forced, forks) = self.processor.queue_lens();
        let account_count = self
            .ledger
            .begin_read()
            .and_then(|txn| self.ledger.account_count(&txn))
            .unwrap_or(0);
        serde_json::json!({
            "status": format!("{:?}", self.status()),
            "accounts": account_count.to_string(),
            "peers": self.peers.len().to_string(),
            "elections": self.elections.len().to_string(),
            "bootstrap_count": self.bootstrap.count().to_string(),
            "queue_admit": admit.to_string(),
            "queue_forced": forced.to_string(),
            "queue_fork": forks.to_string(),
        })
    }

    /// Entry point for every parsed wire message.
    pub fn handle_message(self: &Arc<Self>, message: Message, from: SocketAddr) {
        match message {
            Message::Publish(publish) => self.handle_publish(publish, from),
            Message::Confirm(confirm) => self.handle_confirm(confirm),
            Message::Query(query) => self.handle_query(query, from),
            Message::Fork(fork) => {
                self.processor.add_fork(BlockFork {
                    first: Arc::new(fork.first),
                    second: Arc::new(fork.second),
                    from_local: false,
                });
            }
            Message::Conflict(conflict) => {
                let weight = self.rep_weight(&conflict.representative);
                if weight < QUALIFIED_REP_WEIGHT {
                    return;
                }
                self.elections.process_conflict(
                    conflict.representative,
                    conflict.timestamp_first,
                    conflict.timestamp_second,
                    conflict.signature_first,
                    conflict.signature_second,
                    Arc::new(conflict.block_first),
                    Arc::new(conflict.block_second),
                    weight,
                );
            }
            Message::Keeplive(keeplive) => {
                self.peers.contact(&keeplive.account);
            }
            Message::Weight(weight) if !weight.header.has_flag(crate::message::flags::ACK) => {
                let mut response = weight.clone();
                response.header.set_flag(crate::message::flags::ACK);
                response.weight = self.rep_weight(&weight.representative);
                self.sender.send(&Message::Weight(response), from);
            }
            Message::Weight(weight) => {
                self.peers.update_weight(&weight.representative, weight.weight);
            }
            Message::Handshake(_) | Message::Bootstrap(_) | Message::Crosschain(_) => {
                // Handshake/cookie management and the credential subsystems
                // live with the transport.
            }
        }
    }

    /// Publish path: drop stale or restricted traffic, answer confirm
    /// requests for heights we already store, admit the rest.
    fn handle_publish(self: &Arc<Self>, publish: PublishMessage, _from: SocketAddr) {
        let block = Arc::new(publish.block);
        let now = self.clock.now();

        let Ok(txn) = self.ledger.begin_read() else {
            return;
        };

        if publish.need_confirm() {
            if let Ok(Some(stored)) =
                self.ledger
                    .block_get_by_height(&txn, &block.account(), block.height())
            {
                self.send_confirm_to(&publish.account, &stored, now);
                if stored.hash() == block.hash() {
                    return;
                }
            }
        }

        if block.timestamp() + DAY_SECONDS < now {
            debug!(target: "node", hash = %block.hash(), "stale publish dropped");
            return;
        }

        if let Ok(Some(info)) = self.ledger.account_info_get(&txn, &block.account()) {
            if let Ok(Some(head)) = self.ledger.block_get(&txn, &info.head) {
                if info.restricted(now, head.credit()) && block.opcode() != BlockOpcode::Credit {
                    self.stats.add("ACCOUNT_RESTRICTED");
                    return;
                }
            }
        }
        drop(txn);

        self.processor.add(block);
    }

    /// A representative asked us to confirm a stored block: look up our own
    /// identity's vote timestamp and answer. Only meaningful when this node
    /// runs with a qualified identity; without one the request is ignored.
    fn send_confirm_to(&self, _requester: &Account, _stored: &Block, _now: u64) {
        // Voting requires the validator identity held by the credential
        // subsystem, which is out of the core. The confirm manager still
        // rate-limits our own wallet-driven confirm answers.
    }

    fn handle_confirm(&self, confirm: ConfirmMessage) {
        let now = self.clock.now();
        let skew = strand_types::params::MAX_TIMESTAMP_DIFF * 2;
        if confirm.timestamp > now + skew || confirm.timestamp + skew < now {
            self.stats.add("MESSAGE_CONFIRM_TIMESTAMP");
            return;
        }
        let weight = self.rep_weight(&confirm.representative);
        if weight < QUALIFIED_REP_WEIGHT {
            return;
        }
        self.elections.process_confirm(
            confirm.representative,
            confirm.timestamp,
            confirm.signature,
            Arc::new(confirm.block),
            weight,
        );
    }

    fn handle_query(self: &Arc<Self>, query: QueryMessage, from: SocketAddr) {
        if query.is_ack() {
            self.queries.process_ack(&query);
            return;
        }
        let Ok(txn) = self.ledger.begin_read() else {
            return;
        };
        let response = answer_query(&self.ledger, &txn, &query);
        self.sender.send(&Message::Query(response), from);
    }

    fn rep_weight(&self, representative: &Account) -> strand_types::Amount {
        self.ledger
            .begin_read()
            .and_then(|txn| self.ledger.rep_weight_get(&txn, representative))
            .unwrap_or(strand_types::Amount::ZERO)
    }
}

/// Answers a block query from the ledger. By-hash consults the rollback log
/// first so peers can still fetch blocks that lost an election; by-previous
/// reports `Fork` when the successor pointer is missing but a competing
/// block occupies the height.
pub fn answer_query(ledger: &Ledger, txn: &Transaction, query: &QueryMessage) -> QueryMessage {
    let mut account_info = None;
    if !query.account.is_zero() {
        account_info = ledger.account_info_get(txn, &query.account).ok().flatten();
    }
    let height_valid = query.height != strand_types::INVALID_HEIGHT;

    let (status, block) = match query.by {
        QueryBy::Hash => answer_by_hash(ledger, txn, query, account_info.as_ref(), height_valid),
        QueryBy::Height => answer_by_height(ledger, txn, query, account_info.as_ref(), height_valid),
        QueryBy::Previous => {
            answer_by_previous(ledger, txn, query, account_info.as_ref(), height_valid)
        }
    };
    QueryMessage::ack_of(query, status, block)
}

fn answer_by_hash(
        ledger: &Ledger,
        txn: &Transaction,
        query: &QueryMessage,
        info: Option<&strand_types::AccountInfo>,
        height_valid: bool,
    ) -> (QueryStatus, Option<Block>) {
        if let Ok(Some(block)) = ledger.rollback_block_get(txn, &query.hash) {
            return (QueryStatus::Success, Some(block));
        }
        if height_valid {
            if let Some(info) = info {
                if query.height < info.tail_height {
                    return (QueryStatus::Pruned, None);
                }
                if query.height > info.head_height {
                    return (QueryStatus::Miss, None);
                }
            }
        }
        match ledger.block_get(txn, &query.hash) {
            Ok(Some(block)) => (QueryStatus::Success, Some(block)),
            _ => (QueryStatus::Miss, None),
        }
}

fn answer_by_height(
    ledger: &Ledger,
        txn: &Transaction,
        query: &QueryMessage,
        info: Option<&strand_types::AccountInfo>,
        height_valid: bool,
    ) -> (QueryStatus, Option<Block>) {
        if !height_valid {
            return (QueryStatus::Miss, None);
        }
        let Some(info) = info else {
            return (QueryStatus::Miss, None);
        };
        if query.height < info.tail_height {
            return (QueryStatus::Pruned, None);
        }
        if query.height > info.head_height {
            return (QueryStatus::Miss, None);
        }
        match ledger.block_get_by_height(txn, &query.account, query.height) {
            Ok(Some(block)) => (QueryStatus::Success, Some(block)),
            _ => (QueryStatus::Miss, None),
        }
}

fn answer_by_previous(
    ledger: &Ledger,
        txn: &Transaction,
        query: &QueryMessage,
        info: Option<&strand_types::AccountInfo>,
        height_valid: bool,
    ) -> (QueryStatus, Option<Block>) {
        if !height_valid {
            return (QueryStatus::Miss, None);
        }
        let Some(info) = info else {
            return (QueryStatus::Miss, None);
        };
        if query.height < info.tail_height + 1 {
            return (QueryStatus::Pruned, None);
        }
        if query.height > info.head_height + 1 {
            return (QueryStatus::Miss, None);
        }
        match ledger.block_successor_get(txn, &query.hash) {
            Ok(Some(successor)) if !successor.is_zero() => {
                match ledger.block_get(txn, &successor) {
                    Ok(Some(block)) => (QueryStatus::Success, Some(block)),
                    _ => (QueryStatus::Miss, None),
                }
            }
            Ok(Some(_)) => (QueryStatus::Miss, None),
            _ => {
                // The anchor hash is unknown here; if a different block
                // occupies the previous height the peer is on a losing fork.
                match ledger.block_get_by_height(txn, &query.account, query.height - 1) {
                    Ok(Some(block)) => (QueryStatus::Fork, Some(block)),
                    _ => (QueryStatus::Miss, None),
                }
            }
        }
    }
}

// warn is referenced by handlers that only log in degraded paths.
#[allow(unused_imports)]
use warn as _warn_reexport;
