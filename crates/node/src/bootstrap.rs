//! Pull bootstrap over framed TCP.
//!
//! Three modes share one request shape: FULL walks every account head in key
//! order, LIGHT walks the server's active-account working set, FORK streams
//! stored fork pairs. The server answers exactly one batch per request and
//! then waits for the next request; `max_size = 0` is a pause heartbeat. The
//! client validates ordering and sizes, feeds account heads into the syncer
//! and fork pairs into the processor, and abandons a peer on slow or
//! misbehaving streams.

use crate::message::{BootstrapMessage, BootstrapMode};
use crate::processor::{BlockFork, BlockProcessor};
use crate::syncer::{ActiveAccounts, Syncer};
use crate::peers::Peers;
use crate::stats::Stats;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_ledger::{Ledger, Transaction};
use strand_types::{
    Account, Block, BlockHash, BootstrapError, ErrorCode, StreamReader, StreamWriter, U256,
    INVALID_HEIGHT,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// One account head triple on the wire, fixed 72 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapAccountEntry {
    pub account: Account,
    pub head: BlockHash,
    pub height: u64,
}

impl BootstrapAccountEntry {
    pub const SIZE: usize = 32 + 32 + 8;

    /// The end-of-stream sentinel.
    pub fn sentinel() -> Self {
        BootstrapAccountEntry {
            account: U256::ZERO,
            head: U256::ZERO,
            height: INVALID_HEIGHT,
        }
    }

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_bytes(self.account.as_bytes());
        w.write_bytes(self.head.as_bytes());
        w.write_u64(self.height);
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, BootstrapError> {
        let mut r = StreamReader::new(bytes);
        let account = U256(r.read_array::<32>().map_err(|_| BootstrapError::Stream)?);
        let head = U256(r.read_array::<32>().map_err(|_| BootstrapError::Stream)?);
        let height = r.read_u64().map_err(|_| BootstrapError::Stream)?;
        Ok(BootstrapAccountEntry {
            account,
            head,
            height,
        })
    }
}

/// One batch as read by the client.
pub enum BootstrapBatch {
    Accounts(Vec<BootstrapAccountEntry>),
    Forks(Vec<(Block, Block)>),
}

/// Node lifecycle as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Starting = 0,
    Sync = 1,
    Run = 2,
}

impl NodeStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeStatus::Sync,
            2 => NodeStatus::Run,
            _ => NodeStatus::Starting,
        }
    }
}

const MAX_ACCOUNTS_PER_BATCH: u16 = 1000;
const MAX_FORKS_PER_BATCH: u16 = 64;
/// Upper bound on one fork frame, first and second block together.
const MAX_FORK_FRAME: u16 = 8192;
const IO_TIMEOUT: Duration = Duration::from_secs(30);

async fn read_exact_timed(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), BootstrapError> {
    tokio::time::timeout(IO_TIMEOUT, stream.read_exact(buf))
        .await
        .map_err(|_| BootstrapError::Receive)?
        .map_err(|_| BootstrapError::Receive)?;
    Ok(())
}

async fn write_all_timed(stream: &mut TcpStream, buf: &[u8]) -> Result<(), BootstrapError> {
    tokio::time::timeout(IO_TIMEOUT, stream.write_all(buf))
        .await
        .map_err(|_| BootstrapError::Send)?
        .map_err(|_| BootstrapError::Send)?;
    Ok(())
}

/// Client side of one bootstrap connection.
pub struct BootstrapClient {
    stream: TcpStream,
    mode: BootstrapMode,
    next: Account,
    next_height: u64,
    finished: bool,
    total: u64,
    time_span: Duration,
}

impl BootstrapClient {
    pub async fn connect(endpoint: SocketAddr, mode: BootstrapMode) -> Result<Self, BootstrapError> {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| BootstrapError::Connect)?
            .map_err(|_| BootstrapError::Connect)?;
        Ok(BootstrapClient {
            stream,
            mode,
            next: U256::ZERO,
            next_height: 0,
            finished: false,
            total: 0,
            time_span: Duration::ZERO,
        })
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Entries per second over the connection lifetime; `None` during the
    /// warm-up window.
    pub fn throughput(&self) -> Option<u64> {
        let secs = self.time_span.as_secs();
        if secs < 10 {
            return None;
        }
        Some(self.total / secs)
    }

    fn max_size(&self) -> u16 {
        match self.mode {
            BootstrapMode::Full | BootstrapMode::Light => MAX_ACCOUNTS_PER_BATCH,
            BootstrapMode::Fork => MAX_FORKS_PER_BATCH,
        }
    }

    /// Sends the pause heartbeat (`max_size = 0`) and idles briefly so the
    /// busy component can drain.
    pub async fn pause(&mut self) -> Result<(), BootstrapError> {
        let message = BootstrapMessage::new(self.mode, self.next, self.next_height, 0);
        write_all_timed(&mut self.stream, &message.to_bytes()).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    /// Requests and reads exactly one batch.
    pub async fn run(&mut self) -> Result<BootstrapBatch, BootstrapError> {
        let message =
            BootstrapMessage::new(self.mode, self.next, self.next_height, self.max_size());
        write_all_timed(&mut self.stream, &message.to_bytes()).await?;

        let start = Instant::now();
        let batch = match self.mode {
            BootstrapMode::Full | BootstrapMode::Light => self.read_accounts().await?,
            BootstrapMode::Fork => self.read_forks().await?,
        };
        self.time_span += start.elapsed();
        Ok(batch)
    }

    async fn read_accounts(&mut self) -> Result<BootstrapBatch, BootstrapError> {
        let mut entries = Vec::new();
        let mut buf = [0u8; BootstrapAccountEntry::SIZE];
        loop {
            read_exact_timed(&mut self.stream, &mut buf).await?;
            let entry = BootstrapAccountEntry::deserialize(&buf)?;

            if entry.height == INVALID_HEIGHT {
                if entries.is_empty() {
                    self.finished = true;
                }
                break;
            }
            if entry.account < self.next {
                return Err(BootstrapError::Account);
            }
            if entries.len() >= self.max_size() as usize {
                return Err(BootstrapError::Size);
            }
            self.next = entry.account.successor();
            self.total += 1;
            entries.push(entry);
        }
        Ok(BootstrapBatch::Accounts(entries))
    }

    async fn read_forks(&mut self) -> Result<BootstrapBatch, BootstrapError> {
        let mut forks: Vec<(Block, Block)> = Vec::new();
        loop {
            let mut length_buf = [0u8; 2];
            read_exact_timed(&mut self.stream, &mut length_buf).await?;
            let length = u16::from_be_bytes(length_buf);

            if length == 0 {
                if forks.is_empty() {
                    self.finished = true;
                }
                break;
            }
            if length > MAX_FORK_FRAME {
                return Err(BootstrapError::ForkLength);
            }
            if forks.len() >= self.max_size() as usize {
                return Err(BootstrapError::Size);
            }

            let mut frame = vec![0u8; length as usize];
            read_exact_timed(&mut self.stream, &mut frame).await?;
            let mut r = StreamReader::new(&frame);
            let first = Block::deserialize(&mut r).map_err(|_| BootstrapError::Stream)?;
            let second = Block::deserialize(&mut r).map_err(|_| BootstrapError::Stream)?;

            if !first.fork_with(&second) || first.account() < self.next {
                return Err(BootstrapError::ForkBlock);
            }
            if let Some((last, _)) = forks.last() {
                if first.account() == last.account() && first.height() <= last.height() {
                    return Err(BootstrapError::ForkBlock);
                }
            }

            if first.height() < u64::MAX {
                self.next = first.account();
                self.next_height = first.height() + 1;
            } else {
                self.next = first.account().successor();
                self.next_height = 0;
            }
            self.total += 1;
            forks.push((first, second));
        }
        Ok(BootstrapBatch::Forks(forks))
    }
}

/// Serves one accepted bootstrap connection.
pub struct BootstrapServer {
    stream: TcpStream,
    ledger: Arc<Ledger>,
    active_accounts: Arc<ActiveAccounts>,
    mode: Option<BootstrapMode>,
}

impl BootstrapServer {
    pub fn new(
        stream: TcpStream,
        ledger: Arc<Ledger>,
        active_accounts: Arc<ActiveAccounts>,
    ) -> Self {
        BootstrapServer {
            stream,
            ledger,
            active_accounts,
            mode: None,
        }
    }

    /// Request/serve loop until the peer goes away or misbehaves.
    pub async fn run(mut self) {
        loop {
            let mut buf = [0u8; BootstrapMessage::SIZE];
            if read_exact_timed(&mut self.stream, &mut buf).await.is_err() {
                return;
            }
            let message = match BootstrapMessage::deserialize_bytes(&buf) {
                Ok(message) => message,
                Err(e) => {
                    debug!(target: "bootstrap", code = e.code(), "bad request, closing");
                    return;
                }
            };

            // One connection serves one mode for its whole life.
            match self.mode {
                None => self.mode = Some(message.mode),
                Some(mode) if mode != message.mode => return,
                Some(_) => {}
            }

            if message.max_size == 0 {
                continue;
            }

            let result = match message.mode {
                BootstrapMode::Full => self.serve_full(&message).await,
                BootstrapMode::Light => self.serve_light(&message).await,
                BootstrapMode::Fork => self.serve_forks(&message).await,
            };
            if result.is_err() {
                return;
            }
        }
    }

    async fn serve_full(&mut self, message: &BootstrapMessage) -> Result<(), BootstrapError> {
        let mut cursor = message.start;
        let mut payload = StreamWriter::new();
        let mut count = 0u16;
        {
            let txn = self
                .ledger
                .begin_read()
                .map_err(|_| BootstrapError::Receive)?;
            while count < message.max_size.min(MAX_ACCOUNTS_PER_BATCH) {
                match self.ledger.next_account_info(&txn, &cursor) {
                    Ok(Some((account, info))) => {
                        BootstrapAccountEntry {
                            account,
                            head: info.head,
                            height: info.head_height,
                        }
                        .serialize(&mut payload);
                        count += 1;
                        cursor = account.successor();
                        if cursor.is_zero() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
        BootstrapAccountEntry::sentinel().serialize(&mut payload);
        write_all_timed(&mut self.stream, payload.as_slice()).await
    }

    async fn serve_light(&mut self, message: &BootstrapMessage) -> Result<(), BootstrapError> {
        let mut cursor = message.start;
        let mut payload = StreamWriter::new();
        let mut count = 0u16;
        {
            let txn = self
                .ledger
                .begin_read()
                .map_err(|_| BootstrapError::Receive)?;
            while count < message.max_size.min(MAX_ACCOUNTS_PER_BATCH) {
                let Some(account) = self.active_accounts.next_at_or_after(&cursor) else {
                    break;
                };
                cursor = account.successor();
                // Working-set entries may have aged past their ledger rows.
                let Ok(Some(info)) = self.ledger.account_info_get(&txn, &account) else {
                    if cursor.is_zero() {
                        break;
                    }
                    continue;
                };
                BootstrapAccountEntry {
                    account,
                    head: info.head,
                    height: info.head_height,
                }
                .serialize(&mut payload);
                count += 1;
                if cursor.is_zero() {
                    break;
                }
            }
        }
        BootstrapAccountEntry::sentinel().serialize(&mut payload);
        write_all_timed(&mut self.stream, payload.as_slice()).await
    }

    async fn serve_forks(&mut self, message: &BootstrapMessage) -> Result<(), BootstrapError> {
        let mut cursor_account = message.start;
        let mut cursor_height = message.height;
        let mut payload = StreamWriter::new();
        let mut count = 0u16;
        {
            let txn = self
                .ledger
                .begin_read()
                .map_err(|_| BootstrapError::Receive)?;
            while count < message.max_size.min(MAX_FORKS_PER_BATCH) {
                match self.ledger.next_fork(&txn, &cursor_account, cursor_height) {
                    Ok(Some((first, second))) => {
                        let frame_len = first.size() + second.size();
                        payload.write_u16(frame_len as u16);
                        first.serialize(&mut payload);
                        second.serialize(&mut payload);
                        count += 1;

                        if first.height() == INVALID_HEIGHT {
                            cursor_account = first.account().successor();
                            cursor_height = 0;
                        } else {
                            cursor_account = first.account();
                            cursor_height = first.height() + 1;
                        }
                    }
                    _ => break,
                }
            }
        }
        payload.write_u16(0);
        write_all_timed(&mut self.stream, payload.as_slice()).await
    }
}

/// Accepts bootstrap connections: one per remote IP, capped.
pub struct BootstrapListener {
    ledger: Arc<Ledger>,
    active_accounts: Arc<ActiveAccounts>,
    port: u16,
    runtime: parking_lot::Mutex<Option<tokio::runtime::Runtime>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl BootstrapListener {
    pub const MAX_CONNECTIONS: usize = 16;

    pub fn new(ledger: Arc<Ledger>, active_accounts: Arc<ActiveAccounts>, port: u16) -> Self {
        BootstrapListener {
            ledger,
            active_accounts,
            port,
            runtime: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Binds and starts accepting. Failing to bind is fatal; the node must
    /// not come up half-listening.
    pub fn start(&self) -> Result<(), BootstrapError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("bootstrap-server")
            .build()
            .map_err(|_| BootstrapError::Connect)?;

        let listener = runtime
            .block_on(async { TcpListener::bind(("0.0.0.0", self.port)).await })
            .map_err(|_| BootstrapError::Connect)?;
        *self.local_addr.lock() = listener.local_addr().ok();

        let ledger = self.ledger.clone();
        let active_accounts = self.active_accounts.clone();
        runtime.spawn(async move {
            let connections = Arc::new(tokio::sync::Mutex::new(
                std::collections::HashSet::<std::net::IpAddr>::new(),
            ));
            loop {
                let Ok((stream, remote)) = listener.accept().await else {
                    return;
                };
                let ip = remote.ip();
                {
                    let mut held = connections.lock().await;
                    if held.len() >= BootstrapListener::MAX_CONNECTIONS || !held.insert(ip) {
                        continue;
                    }
                }
                let ledger = ledger.clone();
                let active_accounts = active_accounts.clone();
                let connections = connections.clone();
                tokio::spawn(async move {
                    BootstrapServer::new(stream, ledger, active_accounts)
                        .run()
                        .await;
                    connections.lock().await.remove(&ip);
                });
            }
        });

        *self.runtime.lock() = Some(runtime);
        info!(target: "bootstrap", port = self.port, "bootstrap listener up");
        Ok(())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn stop(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

/// The bootstrap driver: an initial burst of FULL rounds, then LIGHT with
/// periodic FULL, and FORK after every completed FULL cycle.
pub struct Bootstrap {
    shared: Arc<DriverShared>,
    handle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

struct DriverShared {
    ledger: Arc<Ledger>,
    peers: Arc<Peers>,
    syncer: Arc<Syncer>,
    processor: Arc<BlockProcessor>,
    stats: Stats,
    status: Arc<AtomicU8>,
    genesis_account: Option<Account>,
    stopped: AtomicBool,
    count: AtomicU32,
    waiting: AtomicBool,
}

impl Bootstrap {
    /// FULL rounds run back to back before the node reports RUN.
    pub const INITIAL_FULL_BOOTSTRAPS: u32 = 3;
    /// Every n-th later round is FULL instead of LIGHT.
    pub const FULL_BOOTSTRAP_INTERVAL: u32 = 8;
    /// Spacing between rounds after the initial burst.
    pub const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(300);

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        ledger: Arc<Ledger>,
        peers: Arc<Peers>,
        syncer: Arc<Syncer>,
        processor: Arc<BlockProcessor>,
        stats: Stats,
        status: Arc<AtomicU8>,
        genesis_account: Option<Account>,
    ) -> Arc<Self> {
        let shared = Arc::new(DriverShared {
            ledger,
            peers,
            syncer,
            processor,
            stats,
            status,
            genesis_account,
            stopped: AtomicBool::new(false),
            count: AtomicU32::new(0),
            waiting: AtomicBool::new(false),
        });
        let bootstrap = Arc::new(Bootstrap {
            shared: shared.clone(),
            handle: parking_lot::Mutex::new(None),
        });
        let handle = thread::Builder::new()
            .name("bootstrap".into())
            .spawn(move || drive(shared))
            .expect("spawn bootstrap driver");
        *bootstrap.handle.lock() = Some(handle);
        bootstrap
    }

    pub fn count(&self) -> u32 {
        self.shared.count.load(Ordering::SeqCst)
    }

    pub fn waiting_syncer(&self) -> bool {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    /// Resets the round counter so the next rounds run FULL again.
    pub fn restart(&self) {
        self.shared.count.store(0, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn drive(shared: Arc<DriverShared>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(target: "bootstrap", error = %e, "driver runtime failed to build");
            return;
        }
    };

    let mut last_round = Instant::now() - Bootstrap::BOOTSTRAP_INTERVAL;
    while !shared.stopped.load(Ordering::SeqCst) {
        let count = shared.count.load(Ordering::SeqCst);
        if count >= Bootstrap::INITIAL_FULL_BOOTSTRAPS
            && last_round.elapsed() < Bootstrap::BOOTSTRAP_INTERVAL
        {
            thread::sleep(Duration::from_secs(5));
            continue;
        }

        let full_round = count < Bootstrap::INITIAL_FULL_BOOTSTRAPS
            || count % Bootstrap::FULL_BOOTSTRAP_INTERVAL == 0;
        let result = if full_round {
            runtime.block_on(run_accounts(&shared, BootstrapMode::Full, count))
        } else {
            runtime.block_on(run_accounts(&shared, BootstrapMode::Light, count))
        };

        let fork_round = count == Bootstrap::INITIAL_FULL_BOOTSTRAPS
            || (count > 0 && count % Bootstrap::FULL_BOOTSTRAP_INTERVAL == 0);
        let result = result.and_then(|()| {
            if fork_round {
                runtime.block_on(run_forks(&shared, count))
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                last_round = Instant::now();
                let count = shared.count.fetch_add(1, Ordering::SeqCst) + 1;
                if count <= Bootstrap::INITIAL_FULL_BOOTSTRAPS {
                    wait_for_syncer(&shared);
                    if count == Bootstrap::INITIAL_FULL_BOOTSTRAPS {
                        shared.status.store(NodeStatus::Run as u8, Ordering::SeqCst);
                        info!(target: "bootstrap", "initial bootstrap complete");
                    }
                }
            }
            Err(e) => {
                shared.stats.add(e.code());
                thread::sleep(Duration::from_secs(5));
            }
        }
    }
}

fn under_attack(shared: &DriverShared) -> bool {
    let stat = shared.syncer.stat();
    stat.total >= 10240 && stat.miss > stat.total / 2
}

async fn run_accounts(
    shared: &Arc<DriverShared>,
    mode: BootstrapMode,
    batch: u32,
) -> Result<(), BootstrapError> {
    let peer = shared.peers.random_peer().ok_or(BootstrapError::Peer)?;
    if mode == BootstrapMode::Full && batch < Bootstrap::INITIAL_FULL_BOOTSTRAPS {
        shared.status.store(NodeStatus::Sync as u8, Ordering::SeqCst);
    }
    seed_genesis(shared, batch);
    shared.syncer.reset_stat();

    let mut client = BootstrapClient::connect(peer.endpoint, mode).await?;
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.count.load(Ordering::SeqCst) != batch {
            return Err(BootstrapError::Reset);
        }
        if under_attack(shared) {
            return Err(BootstrapError::Attack);
        }
        if let Some(rate) = client.throughput() {
            if rate < 1000 {
                return Err(BootstrapError::SlowConnection);
            }
        }
        if shared.processor.busy() {
            client.pause().await?;
            continue;
        }

        let BootstrapBatch::Accounts(entries) = client.run().await? else {
            return Err(BootstrapError::Mode);
        };

        {
            let txn = shared
                .ledger
                .begin_read()
                .map_err(|_| BootstrapError::Receive)?;
            for entry in &entries {
                start_sync(&shared.ledger, &shared.syncer, &shared.stats, &txn, entry, batch);
            }
        }

        if client.finished() {
            return Ok(());
        }
    }
}

async fn run_forks(shared: &Arc<DriverShared>, batch: u32) -> Result<(), BootstrapError> {
    let peer = shared.peers.random_peer().ok_or(BootstrapError::Peer)?;
    let mut client = BootstrapClient::connect(peer.endpoint, BootstrapMode::Fork).await?;
    let mut miss: u64 = 0;

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.count.load(Ordering::SeqCst) != batch {
            return Err(BootstrapError::Reset);
        }
        if client.total() >= 1000 && miss * 100 / client.total() >= 50 {
            return Err(BootstrapError::Attack);
        }
        if let Some(rate) = client.throughput() {
            if rate < 100 {
                return Err(BootstrapError::SlowConnection);
            }
        }
        if shared.processor.busy() {
            client.pause().await?;
            continue;
        }

        let BootstrapBatch::Forks(forks) = client.run().await? else {
            return Err(BootstrapError::Mode);
        };

        {
            let txn = shared
                .ledger
                .begin_read()
                .map_err(|_| BootstrapError::Receive)?;
            for (first, second) in forks {
                let known = shared
                    .ledger
                    .account_info_get(&txn, &first.account())
                    .ok()
                    .flatten()
                    .is_some();
                if !known {
                    miss += 1;
                }
                shared.processor.add_fork(BlockFork {
                    first: Arc::new(first),
                    second: Arc::new(second),
                    from_local: false,
                });
            }
        }

        if client.finished() {
            return Ok(());
        }
    }
}

/// The genesis chain is always pulled first so a fresh node can anchor
/// receives against it.
fn seed_genesis(shared: &Arc<DriverShared>, batch: u32) {
    let Some(genesis) = shared.genesis_account else {
        return;
    };
    let Ok(txn) = shared.ledger.begin_read() else {
        return;
    };
    match shared.ledger.account_info_get(&txn, &genesis) {
        Ok(Some(info)) => {
            shared
                .syncer
                .add(genesis, info.head_height + 1, Some(info.head), batch);
        }
        _ => shared.syncer.add(genesis, 0, None, batch),
    }
}

/// Decides how to act on one received head triple, mirroring the ledger
/// state against the server's claim.
pub fn start_sync(
    ledger: &Ledger,
    syncer: &Arc<Syncer>,
    stats: &Stats,
    txn: &Transaction,
    entry: &BootstrapAccountEntry,
    batch: u32,
) {
    let Ok(info) = ledger.account_info_get(txn, &entry.account) else {
        return;
    };
    let Some(info) = info else {
        syncer.add(entry.account, 0, None, batch);
        return;
    };

    if entry.height == info.head_height && entry.head == info.head {
        return;
    }
    if entry.height < info.tail_height {
        return;
    }
    if entry.height < info.head_height {
        // The server is behind; only act when its head is unknown to us,
        // which means a fork below our head.
        match ledger.block_exists(txn, &entry.head) {
            Ok(true) => return,
            Ok(false) => {}
            Err(_) => return,
        }
        let Ok(Some(block)) = ledger.block_get_by_height(txn, &entry.account, entry.height) else {
            stats.add("LEDGER_BLOCK_GET");
            return;
        };
        syncer.add(entry.account, entry.height + 1, Some(block.hash()), batch);
    } else {
        syncer.add(entry.account, info.head_height + 1, Some(info.head), batch);
    }
}

/// Blocks the driver until every batch issued so far has drained.
fn wait_for_syncer(shared: &Arc<DriverShared>) {
    shared.waiting.store(true, Ordering::SeqCst);
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let count = shared.count.load(Ordering::SeqCst);
        let finished = (0..count).all(|batch| shared.syncer.finished(batch));
        if finished {
            break;
        }
        thread::sleep(Duration::from_secs(1));
    }
    shared.waiting.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_entry_layout() {
        let entry = BootstrapAccountEntry {
            account: U256::from_u64(1),
            head: U256::from_u64(2),
            height: 3,
        };
        let mut w = StreamWriter::new();
        entry.serialize(&mut w);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), BootstrapAccountEntry::SIZE);
        assert_eq!(BootstrapAccountEntry::deserialize(&bytes).unwrap(), entry);

        let sentinel = BootstrapAccountEntry::sentinel();
        assert_eq!(sentinel.height, INVALID_HEIGHT);
    }
}
