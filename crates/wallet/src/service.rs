//! The wallet service: persistent wallet store, the action thread and the
//! server-notification entry points.
//!
//! Server pushes (block appended, block confirmed, block rolled back,
//! receivable pending) are queued as urgent actions and applied to the
//! follower ledger on the wallet's own thread; user actions queue behind
//! them. Outgoing blocks apply locally unconfirmed, then publish through the
//! injected [`ServerLink`].

use crate::actions;
use crate::follower::{self, Applied};
use crate::wallet::{Wallet, WalletAccountInfo, WalletInfo};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use strand_crypto::RawKey;
use strand_ledger::Ledger;
use strand_types::block::Note;
use strand_types::{
    Account, Amount, Block, BlockHash, LedgerError, ReceivableInfo, WalletError,
};
use tracing::{debug, warn};

/// Transport to the wallet server: publishes blocks and raw JSON requests.
/// The websocket plumbing lives outside the core.
pub trait ServerLink: Send + Sync {
    fn publish(&self, block: &Block);
    fn send(&self, request: serde_json::Value);
}

/// No-op link for tests and offline use.
pub struct NullLink;

impl ServerLink for NullLink {
    fn publish(&self, _block: &Block) {}
    fn send(&self, _request: serde_json::Value) {}
}

/// Priority classes on the action queue; lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WalletAction {
    Urgent = 0,
    Normal = 1,
}

type Action = Box<dyn FnOnce(&Wallets) + Send>;

struct Queue {
    actions: BTreeMap<(WalletAction, u64), Action>,
    sequence: u64,
    stopped: bool,
}

/// The wallet collection and its worker.
pub struct Wallets {
    pub ledger: Arc<Ledger>,
    link: Arc<dyn ServerLink>,
    wallets: Mutex<Vec<(u32, Arc<Wallet>)>>,
    selected_wallet_id: Mutex<u32>,
    /// Server-synchronized clock offset; actions refuse to run without it.
    time_offset: Mutex<Option<i64>>,
    queue: Arc<Mutex<Queue>>,
    condvar: Arc<Condvar>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Wallets {
    /// Opens the wallet store, loading every stored wallet (locked) or
    /// creating a fresh one when the store is empty.
    pub fn open(ledger: Arc<Ledger>, link: Arc<dyn ServerLink>) -> Result<Arc<Self>, WalletError> {
        let mut wallets = Vec::new();
        {
            let txn = ledger.begin_read().map_err(WalletError::Ledger)?;
            for (wallet_id, bytes) in ledger.wallet_infos(&txn).map_err(WalletError::Ledger)? {
                let info = WalletInfo::deserialize(&bytes)
                    .map_err(|_| WalletError::Ledger(LedgerError::Decode("wallet info".into())))?;
                let mut accounts = Vec::new();
                for (account_id, bytes) in ledger
                    .wallet_account_infos(&txn, wallet_id)
                    .map_err(WalletError::Ledger)?
                {
                    let account = WalletAccountInfo::deserialize(&bytes).map_err(|_| {
                        WalletError::Ledger(LedgerError::Decode("wallet account".into()))
                    })?;
                    accounts.push((account_id, account));
                }
                wallets.push((wallet_id, Arc::new(Wallet::from_stored(info, accounts))));
            }
        }

        let service = Arc::new(Wallets {
            ledger,
            link,
            wallets: Mutex::new(wallets),
            selected_wallet_id: Mutex::new(0),
            time_offset: Mutex::new(None),
            queue: Arc::new(Mutex::new(Queue {
                actions: BTreeMap::new(),
                sequence: 0,
                stopped: false,
            })),
            condvar: Arc::new(Condvar::new()),
            handle: Mutex::new(None),
        });

        if service.wallets.lock().is_empty() {
            service.create_wallet(None)?;
        }
        {
            let txn = service.ledger.begin_read().map_err(WalletError::Ledger)?;
            let selected = service
                .ledger
                .selected_wallet_get(&txn)
                .map_err(WalletError::Ledger)?;
            let first = service.wallets.lock().first().map(|(id, _)| *id);
            *service.selected_wallet_id.lock() = selected.or(first).unwrap_or(1);
        }

        let runner = service.clone();
        let handle = thread::Builder::new()
            .name("wallet-actions".into())
            .spawn(move || runner.run())
            .expect("spawn wallet action thread");
        *service.handle.lock() = Some(handle);

        Ok(service)
    }

    fn run(self: &Arc<Self>) {
        loop {
            let action = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.stopped {
                        return;
                    }
                    if let Some(key) = queue.actions.keys().next().copied() {
                        break queue.actions.remove(&key).expect("keyed entry");
                    }
                    self.condvar.wait(&mut queue);
                }
            };
            action(self);
        }
    }

    /// Queues an action on the wallet thread.
    pub fn queue_action<F: FnOnce(&Wallets) + Send + 'static>(
        &self,
        priority: WalletAction,
        action: F,
    ) {
        {
            let mut queue = self.queue.lock();
            if queue.stopped {
                return;
            }
            queue.sequence += 1;
            let sequence = queue.sequence;
            queue.actions.insert((priority, sequence), Box::new(action));
        }
        self.condvar.notify_all();
    }

    pub fn stop(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.stopped {
                return;
            }
            queue.stopped = true;
        }
        self.condvar.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    // ---- wallet management ----

    /// Creates (and persists) a wallet, optionally from a known seed.
    pub fn create_wallet(&self, seed: Option<RawKey>) -> Result<u32, WalletError> {
        let wallet = Arc::new(match seed {
            Some(seed) => Wallet::create(seed),
            None => Wallet::random(),
        });
        let wallet_id = {
            let mut wallets = self.wallets.lock();
            let wallet_id = wallets.iter().map(|(id, _)| *id).max().unwrap_or(0) + 1;
            wallets.push((wallet_id, wallet.clone()));
            wallet_id
        };
        self.store_wallet(wallet_id, &wallet)?;
        Ok(wallet_id)
    }

    /// Persists a wallet's info and every account record.
    pub fn store_wallet(&self, wallet_id: u32, wallet: &Wallet) -> Result<(), WalletError> {
        let txn = self.ledger.begin_write().map_err(WalletError::Ledger)?;
        self.ledger
            .wallet_info_put(&txn, wallet_id, &wallet.info().to_bytes())
            .map_err(WalletError::Ledger)?;
        for (account_id, record) in wallet.account_records() {
            self.ledger
                .wallet_account_info_put(&txn, wallet_id, account_id, &record.to_bytes())
                .map_err(WalletError::Ledger)?;
        }
        txn.commit().map_err(WalletError::Ledger)?;
        Ok(())
    }

    pub fn wallet(&self, wallet_id: u32) -> Option<Arc<Wallet>> {
        self.wallets
            .lock()
            .iter()
            .find(|(id, _)| *id == wallet_id)
            .map(|(_, wallet)| wallet.clone())
    }

    pub fn wallet_ids(&self) -> Vec<u32> {
        self.wallets.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn selected_wallet(&self) -> Option<Arc<Wallet>> {
        self.wallet(*self.selected_wallet_id.lock())
    }

    pub fn select_wallet(&self, wallet_id: u32) -> Result<(), WalletError> {
        if self.wallet(wallet_id).is_none() {
            return Err(WalletError::AccountGet);
        }
        *self.selected_wallet_id.lock() = wallet_id;
        let txn = self.ledger.begin_write().map_err(WalletError::Ledger)?;
        self.ledger
            .selected_wallet_put(&txn, wallet_id)
            .map_err(WalletError::Ledger)?;
        txn.commit().map_err(WalletError::Ledger)?;
        Ok(())
    }

    pub fn is_my_account(&self, account: &Account) -> bool {
        self.wallets
            .lock()
            .iter()
            .any(|(_, wallet)| wallet.is_my_account(account))
    }

    fn wallet_of_account(&self, account: &Account) -> Option<Arc<Wallet>> {
        self.wallets
            .lock()
            .iter()
            .find(|(_, wallet)| wallet.is_my_account(account))
            .map(|(_, wallet)| wallet.clone())
    }

    // ---- time ----

    /// Records the server clock offset.
    pub fn sync_time(&self, server_now: u64, local_now: u64) {
        *self.time_offset.lock() = Some(server_now as i64 - local_now as i64);
    }

    /// The server-adjusted timestamp; actions refuse to build without it.
    pub fn current_timestamp(&self, local_now: u64) -> Result<u64, WalletError> {
        let offset = self.time_offset.lock().ok_or(WalletError::TimeSync)?;
        Ok((local_now as i64 + offset).max(0) as u64)
    }

    // ---- user actions ----

    /// Builds, applies and publishes a send.
    pub fn account_send(
        &self,
        account: &Account,
        destination: &Account,
        amount: Amount,
        note: Note,
        local_now: u64,
    ) -> Result<Block, WalletError> {
        let now = self.current_timestamp(local_now)?;
        let wallet = self
            .wallet_of_account(account)
            .ok_or(WalletError::AccountGet)?;
        let result = {
            let txn = self.ledger.begin_read().map_err(WalletError::Ledger)?;
            actions::account_send(
                &self.ledger,
                &txn,
                &wallet,
                account,
                destination,
                amount,
                note,
                now,
            )?
        };
        self.commit_outgoing(result.block)
    }

    /// Builds, applies and publishes a receive of `send_hash`.
    pub fn account_receive(
        &self,
        account: &Account,
        send_hash: &BlockHash,
        fallback_representative: Account,
        local_now: u64,
    ) -> Result<Block, WalletError> {
        let now = self.current_timestamp(local_now)?;
        let wallet = self
            .wallet_of_account(account)
            .ok_or(WalletError::AccountGet)?;
        let result = {
            let txn = self.ledger.begin_read().map_err(WalletError::Ledger)?;
            actions::account_receive(
                &self.ledger,
                &txn,
                &wallet,
                account,
                send_hash,
                fallback_representative,
                now,
            )?
        };
        self.commit_outgoing(result.block)
    }

    /// Builds, applies and publishes a representative change.
    pub fn account_change(
        &self,
        account: &Account,
        representative: Option<Account>,
        local_now: u64,
    ) -> Result<Block, WalletError> {
        let now = self.current_timestamp(local_now)?;
        let wallet = self
            .wallet_of_account(account)
            .ok_or(WalletError::AccountGet)?;
        let result = {
            let txn = self.ledger.begin_read().map_err(WalletError::Ledger)?;
            actions::account_change(&self.ledger, &txn, &wallet, account, representative, now)?
        };
        self.commit_outgoing(result.block)
    }

    /// Builds, applies and publishes a credit purchase.
    pub fn account_credit(
        &self,
        account: &Account,
        credit_inc: u16,
        local_now: u64,
    ) -> Result<Block, WalletError> {
        let now = self.current_timestamp(local_now)?;
        let wallet = self
            .wallet_of_account(account)
            .ok_or(WalletError::AccountGet)?;
        let result = {
            let txn = self.ledger.begin_read().map_err(WalletError::Ledger)?;
            actions::account_credit(&self.ledger, &txn, &wallet, account, credit_inc, now)?
        };
        self.commit_outgoing(result.block)
    }

    /// Applies an outgoing block locally (unconfirmed) and publishes it.
    fn commit_outgoing(&self, block: Block) -> Result<Block, WalletError> {
        let block_arc = Arc::new(block.clone());
        let txn = self.ledger.begin_write().map_err(WalletError::Ledger)?;
        follower::apply_block(&self.ledger, &txn, &block_arc, false)
            .map_err(WalletError::Ledger)?;
        txn.commit().map_err(WalletError::Ledger)?;
        self.link.publish(&block);
        Ok(block)
    }

    // ---- server notifications ----

    /// A canonical block arrived (appended or confirmed on the server).
    pub fn on_block(self: &Arc<Self>, block: Arc<Block>, confirmed: bool) {
        let service = self.clone();
        self.queue_action(WalletAction::Urgent, move |_| {
            service.process_block(block, confirmed);
        });
    }

    fn process_block(&self, block: Arc<Block>, confirmed: bool) {
        if !self.is_my_account(&block.account()) {
            return;
        }
        let mut attempts = 0;
        loop {
            let Ok(txn) = self.ledger.begin_write() else {
                return;
            };
            let applied = match follower::apply_block(&self.ledger, &txn, &block, confirmed) {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(target: "wallet", error = %e, "follower apply failed");
                    let _ = txn.abort();
                    return;
                }
            };
            if txn.commit().is_err() {
                return;
            }
            match applied {
                Applied::RolledBack if attempts < 64 => {
                    attempts += 1;
                    continue;
                }
                _ => break,
            }
        }
        debug!(target: "wallet", hash = %block.hash(), confirmed, "server block applied");
    }

    /// The server rolled a block back.
    pub fn on_block_rollback(self: &Arc<Self>, block: Arc<Block>) {
        let service = self.clone();
        self.queue_action(WalletAction::Urgent, move |_| {
            if !service.is_my_account(&block.account()) {
                return;
            }
            let Ok(txn) = service.ledger.begin_write() else {
                return;
            };
            match follower::apply_rollback_notification(&service.ledger, &txn, &block) {
                Ok(_) => {
                    let _ = txn.commit();
                }
                Err(e) => {
                    warn!(target: "wallet", error = %e, "rollback notification failed");
                    let _ = txn.abort();
                }
            }
        });
    }

    /// The server reports a pending receivable for one of our accounts.
    pub fn on_receivable(
        self: &Arc<Self>,
        account: Account,
        hash: BlockHash,
        info: ReceivableInfo,
        source: Arc<Block>,
        local_now: u64,
    ) {
        let service = self.clone();
        self.queue_action(WalletAction::Urgent, move |_| {
            if !service.is_my_account(&account) {
                return;
            }
            let Ok(now) = service.current_timestamp(local_now) else {
                return;
            };
            let Ok(txn) = service.ledger.begin_write() else {
                return;
            };
            match follower::apply_receivable_notification(
                &service.ledger,
                &txn,
                &account,
                &hash,
                &info,
                &source,
                now,
            ) {
                Ok(_) => {
                    let _ = txn.commit();
                }
                Err(e) => {
                    warn!(target: "wallet", error = %e, "receivable notification failed");
                    let _ = txn.abort();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::params::EPOCH_TIMESTAMP;
    use strand_types::U256;

    fn service() -> (tempfile::TempDir, Arc<Wallets>) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("wallet.redb")).unwrap());
        let service = Wallets::open(ledger, Arc::new(NullLink)).unwrap();
        (dir, service)
    }

    #[test]
    fn open_creates_and_persists_a_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.redb");
        let first_account;
        {
            let ledger = Arc::new(Ledger::open(&path).unwrap());
            let service = Wallets::open(ledger, Arc::new(NullLink)).unwrap();
            let wallet = service.selected_wallet().unwrap();
            first_account = wallet.selected_account().unwrap();
            service.stop();
        }
        // Reopen: the same wallet comes back, locked, with the same account.
        let ledger = Arc::new(Ledger::open(&path).unwrap());
        let service = Wallets::open(ledger, Arc::new(NullLink)).unwrap();
        let wallet = service.selected_wallet().unwrap();
        assert!(!wallet.valid_password());
        assert!(wallet.attempt_password("").unwrap());
        assert_eq!(wallet.selected_account(), Some(first_account));
        service.stop();
    }

    #[test]
    fn actions_require_time_sync() {
        let (_dir, service) = service();
        let wallet = service.selected_wallet().unwrap();
        let account = wallet.selected_account().unwrap();
        let result = service.account_send(
            &account,
            &U256::from_u64(1),
            Amount(1),
            Note::empty(),
            EPOCH_TIMESTAMP,
        );
        assert!(matches!(result, Err(WalletError::TimeSync)));
        service.stop();
    }

    #[test]
    fn urgent_actions_run_first() {
        let (_dir, service) = service();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Stall the worker so both actions queue before either runs.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let gate_l = gate.clone();
        service.queue_action(WalletAction::Normal, move |_| {
            let (lock, cv) = &*gate_l;
            let mut open = lock.lock();
            while !*open {
                cv.wait(&mut open);
            }
        });

        let order_a = order.clone();
        service.queue_action(WalletAction::Normal, move |_| order_a.lock().push("normal"));
        let order_b = order.clone();
        service.queue_action(WalletAction::Urgent, move |_| order_b.lock().push("urgent"));

        {
            let (lock, cv) = &*gate;
            *lock.lock() = true;
            cv.notify_all();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while order.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(*order.lock(), vec!["urgent", "normal"]);
        service.stop();
    }
}
