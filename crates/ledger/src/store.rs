//! Table definitions and the typed ledger façade.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use strand_types::{
    Account, AccountInfo, Amount, BindingEntry, Block, BlockHash, LedgerError, ReceivableInfo,
    RewardableInfo, StreamReader, StreamWriter, U256,
};
use tracing::error;

/// Current schema version stamped into new databases.
pub const SCHEMA_VERSION: u32 = 1;

// Fixed 32-byte keys.
const BLOCKS: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("blocks");
const ACCOUNTS: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("accounts");
const ROLLBACKS: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("rollbacks");
const REP_WEIGHTS: TableDefinition<&[u8; 32], &[u8; 16]> = TableDefinition::new("rep_weights");
const BINDING_COUNTS: TableDefinition<&[u8; 32], u64> = TableDefinition::new("binding_counts");
const SOURCES: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("sources");

// Composite keys, prefix-encoded: account(32) ‖ height(8 BE) or similar.
const BLOCK_INDEX: TableDefinition<&[u8], &[u8; 32]> = TableDefinition::new("block_index");
const RECEIVABLES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("receivables");
const REWARDABLES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rewardables");
const FORKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("forks");
const BINDINGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bindings");
const WALLETS: TableDefinition<u32, &[u8]> = TableDefinition::new("wallets");
const WALLET_ACCOUNTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("wallet_accounts");

// Single-byte keys.
const META: TableDefinition<u8, &[u8]> = TableDefinition::new("meta");

const META_VERSION: u8 = 0;
const META_REP_WEIGHT_TOTAL: u8 = 1;
const META_SELECTED_WALLET: u8 = 2;

fn backend<E: std::fmt::Display>(e: E) -> LedgerError {
    LedgerError::Backend(e.to_string())
}

fn key_account_hash(account: &Account, hash: &BlockHash) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(account.as_bytes());
    key[32..].copy_from_slice(hash.as_bytes());
    key
}

fn key_account_height(account: &Account, height: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(account.as_bytes());
    key[32..].copy_from_slice(&height.to_be_bytes());
    key
}

fn key_wallet_account(wallet_id: u32, account_id: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&wallet_id.to_be_bytes());
    key[4..].copy_from_slice(&account_id.to_be_bytes());
    key
}

fn decode_block(bytes: &[u8]) -> Result<Block, LedgerError> {
    Block::from_bytes(bytes).map_err(|e| LedgerError::Decode(e.to_string()))
}

/// A read or read-write unit of work over the store.
///
/// Processor steps run entirely inside one of these: any failure that is not
/// a business outcome aborts it, so partial state never leaks. Dropping a
/// write transaction without [`Transaction::commit`] discards it.
pub enum Transaction<'db> {
    Read(redb::ReadTransaction<'db>),
    Write(redb::WriteTransaction<'db>),
}

impl<'db> Transaction<'db> {
    pub fn is_write(&self) -> bool {
        matches!(self, Transaction::Write(_))
    }

    /// Commits a write transaction; a read transaction just ends.
    pub fn commit(self) -> Result<(), LedgerError> {
        match self {
            Transaction::Read(_) => Ok(()),
            Transaction::Write(txn) => txn.commit().map_err(backend),
        }
    }

    /// Discards every write made in this transaction.
    pub fn abort(self) -> Result<(), LedgerError> {
        match self {
            Transaction::Read(_) => Ok(()),
            Transaction::Write(txn) => txn.abort().map_err(backend),
        }
    }
}

macro_rules! with_table {
    ($txn:expr, $def:expr, $table:ident, $body:expr) => {
        match $txn {
            Transaction::Read(t) => {
                let $table = t.open_table($def).map_err(backend)?;
                $body
            }
            Transaction::Write(t) => {
                let $table = t.open_table($def).map_err(backend)?;
                $body
            }
        }
    };
}

macro_rules! with_write_table {
    ($txn:expr, $def:expr, $table:ident, $body:expr) => {
        match $txn {
            Transaction::Read(_) => Err(LedgerError::Backend(
                "write on a read transaction".into(),
            )),
            Transaction::Write(t) => {
                let mut $table = t.open_table($def).map_err(backend)?;
                $body
            }
        }
    };
}

/// The persistent ledger. All access goes through a [`Transaction`].
pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Opens or creates the database, creating every table and checking the
    /// schema version. A version from the future is fatal.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let db = Database::create(path).map_err(backend)?;
        {
            let txn = db.begin_write().map_err(backend)?;
            {
                txn.open_table(BLOCKS).map_err(backend)?;
                txn.open_table(ACCOUNTS).map_err(backend)?;
                txn.open_table(ROLLBACKS).map_err(backend)?;
                txn.open_table(REP_WEIGHTS).map_err(backend)?;
                txn.open_table(BINDING_COUNTS).map_err(backend)?;
                txn.open_table(SOURCES).map_err(backend)?;
                txn.open_table(BLOCK_INDEX).map_err(backend)?;
                txn.open_table(RECEIVABLES).map_err(backend)?;
                txn.open_table(REWARDABLES).map_err(backend)?;
                txn.open_table(FORKS).map_err(backend)?;
                txn.open_table(BINDINGS).map_err(backend)?;
                txn.open_table(WALLETS).map_err(backend)?;
                txn.open_table(WALLET_ACCOUNTS).map_err(backend)?;
                let mut meta = txn.open_table(META).map_err(backend)?;
                let found = match meta.get(META_VERSION).map_err(backend)? {
                    Some(guard) => Some(u32::from_be_bytes(
                        guard
                            .value()
                            .try_into()
                            .map_err(|_| LedgerError::Decode("version".into()))?,
                    )),
                    None => None,
                };
                match found {
                    Some(found) => {
                        if found > SCHEMA_VERSION {
                            return Err(LedgerError::Version {
                                found,
                                supported: SCHEMA_VERSION,
                            });
                        }
                    }
                    None => {
                        meta.insert(META_VERSION, SCHEMA_VERSION.to_be_bytes().as_slice())
                            .map_err(backend)?;
                    }
                };
            }
            txn.commit().map_err(backend)?;
        }
        Ok(Ledger { db })
    }

    pub fn begin_read(&self) -> Result<Transaction<'_>, LedgerError> {
        Ok(Transaction::Read(self.db.begin_read().map_err(backend)?))
    }

    pub fn begin_write(&self) -> Result<Transaction<'_>, LedgerError> {
        Ok(Transaction::Write(self.db.begin_write().map_err(backend)?))
    }

    pub fn begin(&self, write: bool) -> Result<Transaction<'_>, LedgerError> {
        if write {
            self.begin_write()
        } else {
            self.begin_read()
        }
    }

    // ---- blocks ----

    /// Stores a block with no successor yet.
    pub fn block_put(&self, txn: &Transaction, hash: &BlockHash, block: &Block) -> Result<(), LedgerError> {
        self.block_put_with_successor(txn, hash, block, &U256::ZERO)
    }

    /// Stores a block and its successor pointer in one write.
    pub fn block_put_with_successor(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
        block: &Block,
        successor: &BlockHash,
    ) -> Result<(), LedgerError> {
        let mut value = Vec::with_capacity(32 + block.size());
        value.extend_from_slice(successor.as_bytes());
        let mut w = StreamWriter::with_capacity(block.size());
        block.serialize(&mut w);
        value.extend_from_slice(w.as_slice());
        with_write_table!(txn, BLOCKS, table, {
            table.insert(hash.as_bytes(), value.as_slice()).map_err(backend)?;
            Ok(())
        })?;
        with_write_table!(txn, BLOCK_INDEX, table, {
            table
                .insert(
                    key_account_height(&block.account(), block.height()).as_slice(),
                    hash.as_bytes(),
                )
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn block_get(&self, txn: &Transaction, hash: &BlockHash) -> Result<Option<Block>, LedgerError> {
        Ok(self.block_get_with_successor(txn, hash)?.map(|(b, _)| b))
    }

    pub fn block_get_with_successor(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
    ) -> Result<Option<(Block, BlockHash)>, LedgerError> {
        with_table!(txn, BLOCKS, table, {
            let Some(guard) = table.get(hash.as_bytes()).map_err(backend)? else {
                return Ok(None);
            };
            let value = guard.value();
            if value.len() < 32 {
                return Err(LedgerError::Decode("block record too short".into()));
            }
            let mut successor = [0u8; 32];
            successor.copy_from_slice(&value[..32]);
            let block = decode_block(&value[32..])?;
            Ok(Some((block, U256(successor))))
        })
    }

    pub fn block_get_by_height(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
    ) -> Result<Option<Block>, LedgerError> {
        let hash = with_table!(txn, BLOCK_INDEX, table, {
            let x = Ok::<_, LedgerError>(
                table
                    .get(key_account_height(account, height).as_slice())
                    .map_err(backend)?
                    .map(|g| U256(*g.value())),
            );
            x
        })?;
        match hash {
            Some(hash) => self.block_get(txn, &hash),
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, txn: &Transaction, hash: &BlockHash) -> Result<bool, LedgerError> {
        with_table!(txn, BLOCKS, table, {
            let x = Ok(table.get(hash.as_bytes()).map_err(backend)?.is_some());
            x
        })
    }

    pub fn block_del(&self, txn: &Transaction, hash: &BlockHash) -> Result<(), LedgerError> {
        let indexed = self.block_get(txn, hash)?;
        with_write_table!(txn, BLOCKS, table, {
            table.remove(hash.as_bytes()).map_err(backend)?;
            Ok(())
        })?;
        if let Some(block) = indexed {
            with_write_table!(txn, BLOCK_INDEX, table, {
                table
                    .remove(key_account_height(&block.account(), block.height()).as_slice())
                    .map_err(backend)?;
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn block_successor_get(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
    ) -> Result<Option<BlockHash>, LedgerError> {
        Ok(self
            .block_get_with_successor(txn, hash)?
            .map(|(_, successor)| successor))
    }

    pub fn block_successor_set(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
        successor: &BlockHash,
    ) -> Result<(), LedgerError> {
        let Some((block, _)) = self.block_get_with_successor(txn, hash)? else {
            return Err(LedgerError::NotFound);
        };
        self.block_put_with_successor(txn, hash, &block, successor)
    }

    // ---- account info ----

    pub fn account_info_get(
        &self,
        txn: &Transaction,
        account: &Account,
    ) -> Result<Option<AccountInfo>, LedgerError> {
        with_table!(txn, ACCOUNTS, table, {
            let Some(guard) = table.get(account.as_bytes()).map_err(backend)? else {
                return Ok(None);
            };
            AccountInfo::deserialize(&mut StreamReader::new(guard.value()))
                .map(Some)
                .map_err(|e| LedgerError::Decode(e.to_string()))
        })
    }

    pub fn account_info_put(
        &self,
        txn: &Transaction,
        account: &Account,
        info: &AccountInfo,
    ) -> Result<(), LedgerError> {
        let mut w = StreamWriter::new();
        info.serialize(&mut w);
        with_write_table!(txn, ACCOUNTS, table, {
            table
                .insert(account.as_bytes(), w.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn account_info_del(&self, txn: &Transaction, account: &Account) -> Result<(), LedgerError> {
        with_write_table!(txn, ACCOUNTS, table, {
            table.remove(account.as_bytes()).map_err(backend)?;
            Ok(())
        })
    }

    /// First account at or after `start`, in key order. Powers the FULL
    /// bootstrap server cursor.
    pub fn next_account_info(
        &self,
        txn: &Transaction,
        start: &Account,
    ) -> Result<Option<(Account, AccountInfo)>, LedgerError> {
        with_table!(txn, ACCOUNTS, table, {
            let mut range = table.range::<&[u8; 32]>(start.as_bytes()..).map_err(backend)?;
            let x = match range.next() {
                Some(entry) => {
                    let (key, value) = entry.map_err(backend)?;
                    let account = U256(*key.value());
                    let info = AccountInfo::deserialize(&mut StreamReader::new(value.value()))
                        .map_err(|e| LedgerError::Decode(e.to_string()))?;
                    Ok(Some((account, info)))
                }
                None => Ok(None),
            };
            x
        })
    }

    pub fn account_count(&self, txn: &Transaction) -> Result<u64, LedgerError> {
        with_table!(txn, ACCOUNTS, table, { table.len().map_err(backend) })
    }

    // ---- receivables ----

    pub fn receivable_info_get(
        &self,
        txn: &Transaction,
        account: &Account,
        hash: &BlockHash,
    ) -> Result<Option<ReceivableInfo>, LedgerError> {
        with_table!(txn, RECEIVABLES, table, {
            let Some(guard) = table
                .get(key_account_hash(account, hash).as_slice())
                .map_err(backend)?
            else {
                return Ok(None);
            };
            ReceivableInfo::deserialize(&mut StreamReader::new(guard.value()))
                .map(Some)
                .map_err(|e| LedgerError::Decode(e.to_string()))
        })
    }

    pub fn receivable_info_put(
        &self,
        txn: &Transaction,
        account: &Account,
        hash: &BlockHash,
        info: &ReceivableInfo,
    ) -> Result<(), LedgerError> {
        let mut w = StreamWriter::new();
        info.serialize(&mut w);
        with_write_table!(txn, RECEIVABLES, table, {
            table
                .insert(key_account_hash(account, hash).as_slice(), w.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn receivable_info_del(
        &self,
        txn: &Transaction,
        account: &Account,
        hash: &BlockHash,
    ) -> Result<(), LedgerError> {
        with_write_table!(txn, RECEIVABLES, table, {
            table
                .remove(key_account_hash(account, hash).as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    /// All receivables of one account, in send-hash order.
    pub fn receivables_of_account(
        &self,
        txn: &Transaction,
        account: &Account,
    ) -> Result<Vec<(BlockHash, ReceivableInfo)>, LedgerError> {
        let lo = key_account_hash(account, &U256::ZERO);
        let hi = key_account_hash(account, &U256([0xFF; 32]));
        with_table!(txn, RECEIVABLES, table, {
            let mut out = Vec::new();
            for entry in table.range(lo.as_slice()..=hi.as_slice()).map_err(backend)? {
                let (key, value) = entry.map_err(backend)?;
                let key = key.value();
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&key[32..]);
                let info = ReceivableInfo::deserialize(&mut StreamReader::new(value.value()))
                    .map_err(|e| LedgerError::Decode(e.to_string()))?;
                out.push((U256(hash), info));
            }
            Ok(out)
        })
    }

    // ---- rewardables ----

    pub fn rewardable_info_get(
        &self,
        txn: &Transaction,
        representative: &Account,
        hash: &BlockHash,
    ) -> Result<Option<RewardableInfo>, LedgerError> {
        with_table!(txn, REWARDABLES, table, {
            let Some(guard) = table
                .get(key_account_hash(representative, hash).as_slice())
                .map_err(backend)?
            else {
                return Ok(None);
            };
            RewardableInfo::deserialize(&mut StreamReader::new(guard.value()))
                .map(Some)
                .map_err(|e| LedgerError::Decode(e.to_string()))
        })
    }

    pub fn rewardable_info_put(
        &self,
        txn: &Transaction,
        representative: &Account,
        hash: &BlockHash,
        info: &RewardableInfo,
    ) -> Result<(), LedgerError> {
        let mut w = StreamWriter::new();
        info.serialize(&mut w);
        with_write_table!(txn, REWARDABLES, table, {
            table
                .insert(
                    key_account_hash(representative, hash).as_slice(),
                    w.as_slice(),
                )
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn rewardable_info_del(
        &self,
        txn: &Transaction,
        representative: &Account,
        hash: &BlockHash,
    ) -> Result<(), LedgerError> {
        with_write_table!(txn, REWARDABLES, table, {
            table
                .remove(key_account_hash(representative, hash).as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    // ---- forks ----

    pub fn fork_get(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
    ) -> Result<Option<(Block, Block)>, LedgerError> {
        with_table!(txn, FORKS, table, {
            let Some(guard) = table
                .get(key_account_height(account, height).as_slice())
                .map_err(backend)?
            else {
                return Ok(None);
            };
            decode_fork_pair(guard.value()).map(Some)
        })
    }

    pub fn fork_exists(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
    ) -> Result<bool, LedgerError> {
        Ok(self.fork_get(txn, account, height)?.is_some())
    }

    pub fn fork_put(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
        first: &Block,
        second: &Block,
    ) -> Result<(), LedgerError> {
        let mut w = StreamWriter::with_capacity(first.size() + second.size());
        first.serialize(&mut w);
        second.serialize(&mut w);
        with_write_table!(txn, FORKS, table, {
            table
                .insert(key_account_height(account, height).as_slice(), w.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn fork_del(&self, txn: &Transaction, account: &Account, height: u64) -> Result<(), LedgerError> {
        with_write_table!(txn, FORKS, table, {
            table
                .remove(key_account_height(account, height).as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn fork_del_account(&self, txn: &Transaction, account: &Account) -> Result<(), LedgerError> {
        let heights: Vec<u64> = self
            .forks_of_account(txn, account)?
            .into_iter()
            .map(|(first, _)| first.height())
            .collect();
        for height in heights {
            self.fork_del(txn, account, height)?;
        }
        Ok(())
    }

    /// Fork records of one account in height order.
    pub fn forks_of_account(
        &self,
        txn: &Transaction,
        account: &Account,
    ) -> Result<Vec<(Block, Block)>, LedgerError> {
        let lo = key_account_height(account, 0);
        let hi = key_account_height(account, u64::MAX);
        with_table!(txn, FORKS, table, {
            let mut out = Vec::new();
            for entry in table.range(lo.as_slice()..=hi.as_slice()).map_err(backend)? {
                let (_, value) = entry.map_err(backend)?;
                out.push(decode_fork_pair(value.value())?);
            }
            Ok(out)
        })
    }

    /// First fork record at or after `(account, height)` in key order,
    /// continuing into later accounts. Powers the FORK bootstrap server.
    pub fn next_fork(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
    ) -> Result<Option<(Block, Block)>, LedgerError> {
        let lo = key_account_height(account, height);
        with_table!(txn, FORKS, table, {
            let mut range = table.range(lo.as_slice()..).map_err(backend)?;
            let x = match range.next() {
                Some(entry) => {
                    let (_, value) = entry.map_err(backend)?;
                    decode_fork_pair(value.value()).map(Some)
                }
                None => Ok(None),
            };
            x
        })
    }

    // ---- rollback log ----

    pub fn rollback_block_put(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
        block: &Block,
    ) -> Result<(), LedgerError> {
        let mut w = StreamWriter::with_capacity(block.size());
        block.serialize(&mut w);
        with_write_table!(txn, ROLLBACKS, table, {
            table.insert(hash.as_bytes(), w.as_slice()).map_err(backend)?;
            Ok(())
        })
    }

    pub fn rollback_block_get(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
    ) -> Result<Option<Block>, LedgerError> {
        with_table!(txn, ROLLBACKS, table, {
            let x = match table.get(hash.as_bytes()).map_err(backend)? {
                Some(guard) => decode_block(guard.value()).map(Some),
                None => Ok(None),
            };
            x
        })
    }

    // ---- representative weights ----

    pub fn rep_weight_get(&self, txn: &Transaction, rep: &Account) -> Result<Amount, LedgerError> {
        with_table!(txn, REP_WEIGHTS, table, {
            let x = Ok(table
                .get(rep.as_bytes())
                .map_err(backend)?
                .map(|g| Amount::from_be_bytes(*g.value()))
                .unwrap_or(Amount::ZERO));
            x
        })
    }

    pub fn rep_weight_total(&self, txn: &Transaction) -> Result<Amount, LedgerError> {
        with_table!(txn, META, table, {
            let x = Ok(table
                .get(META_REP_WEIGHT_TOTAL)
                .map_err(backend)?
                .and_then(|g| g.value().try_into().ok().map(Amount::from_be_bytes))
                .unwrap_or(Amount::ZERO));
            x
        })
    }

    pub fn rep_weight_add(
        &self,
        txn: &Transaction,
        rep: &Account,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if rep.is_zero() || amount.is_zero() {
            return Ok(());
        }
        let weight = self.rep_weight_get(txn, rep)?.saturating_add(amount);
        with_write_table!(txn, REP_WEIGHTS, table, {
            table
                .insert(rep.as_bytes(), &weight.to_be_bytes())
                .map_err(backend)?;
            Ok(())
        })?;
        let total = self.rep_weight_total(txn)?.saturating_add(amount);
        self.rep_weight_total_put(txn, total)
    }

    pub fn rep_weight_sub(
        &self,
        txn: &Transaction,
        rep: &Account,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if rep.is_zero() || amount.is_zero() {
            return Ok(());
        }
        let current = self.rep_weight_get(txn, rep)?;
        if current < amount {
            error!(target: "ledger", rep = %rep, have = %current, sub = %amount,
                   "representative weight underflow");
        }
        let weight = current.saturating_sub(amount);
        with_write_table!(txn, REP_WEIGHTS, table, {
            if weight.is_zero() {
                table.remove(rep.as_bytes()).map_err(backend)?;
            } else {
                table
                    .insert(rep.as_bytes(), &weight.to_be_bytes())
                    .map_err(backend)?;
            }
            Ok(())
        })?;
        let total = self.rep_weight_total(txn)?.saturating_sub(amount);
        self.rep_weight_total_put(txn, total)
    }

    fn rep_weight_total_put(&self, txn: &Transaction, total: Amount) -> Result<(), LedgerError> {
        with_write_table!(txn, META, table, {
            table
                .insert(META_REP_WEIGHT_TOTAL, total.to_be_bytes().as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    // ---- bindings ----

    pub fn binding_entry_get(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
    ) -> Result<Option<BindingEntry>, LedgerError> {
        with_table!(txn, BINDINGS, table, {
            let Some(guard) = table
                .get(key_account_height(account, height).as_slice())
                .map_err(backend)?
            else {
                return Ok(None);
            };
            BindingEntry::deserialize(&mut StreamReader::new(guard.value()))
                .map(Some)
                .map_err(|e| LedgerError::Decode(e.to_string()))
        })
    }

    pub fn binding_entry_put(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
        entry: &BindingEntry,
    ) -> Result<(), LedgerError> {
        let mut w = StreamWriter::new();
        entry.serialize(&mut w);
        with_write_table!(txn, BINDINGS, table, {
            table
                .insert(key_account_height(account, height).as_slice(), w.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn binding_entry_del(
        &self,
        txn: &Transaction,
        account: &Account,
        height: u64,
    ) -> Result<(), LedgerError> {
        with_write_table!(txn, BINDINGS, table, {
            table
                .remove(key_account_height(account, height).as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn binding_count_get(&self, txn: &Transaction, account: &Account) -> Result<u64, LedgerError> {
        with_table!(txn, BINDING_COUNTS, table, {
            let x = Ok(table
                .get(account.as_bytes())
                .map_err(backend)?
                .map(|g| g.value())
                .unwrap_or(0));
            x
        })
    }

    pub fn binding_count_put(
        &self,
        txn: &Transaction,
        account: &Account,
        count: u64,
    ) -> Result<(), LedgerError> {
        with_write_table!(txn, BINDING_COUNTS, table, {
            if count == 0 {
                table.remove(account.as_bytes()).map_err(backend)?;
            } else {
                table.insert(account.as_bytes(), count).map_err(backend)?;
            }
            Ok(())
        })
    }

    // ---- wallet-side source set ----

    pub fn source_exists(&self, txn: &Transaction, hash: &BlockHash) -> Result<bool, LedgerError> {
        with_table!(txn, SOURCES, table, {
            let x = Ok(table.get(hash.as_bytes()).map_err(backend)?.is_some());
            x
        })
    }

    pub fn source_put(
        &self,
        txn: &Transaction,
        hash: &BlockHash,
        block: Option<&Block>,
    ) -> Result<(), LedgerError> {
        let bytes = match block {
            Some(block) => {
                let mut w = StreamWriter::with_capacity(block.size());
                block.serialize(&mut w);
                w.into_vec()
            }
            None => Vec::new(),
        };
        with_write_table!(txn, SOURCES, table, {
            table
                .insert(hash.as_bytes(), bytes.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn source_get(&self, txn: &Transaction, hash: &BlockHash) -> Result<Option<Block>, LedgerError> {
        with_table!(txn, SOURCES, table, {
            let x = match table.get(hash.as_bytes()).map_err(backend)? {
                Some(guard) if !guard.value().is_empty() => decode_block(guard.value()).map(Some),
                _ => Ok(None),
            };
            x
        })
    }

    pub fn source_del(&self, txn: &Transaction, hash: &BlockHash) -> Result<(), LedgerError> {
        with_write_table!(txn, SOURCES, table, {
            table.remove(hash.as_bytes()).map_err(backend)?;
            Ok(())
        })
    }

    // ---- wallet store (opaque values, typed in strand-wallet) ----

    pub fn wallet_info_put(&self, txn: &Transaction, wallet_id: u32, bytes: &[u8]) -> Result<(), LedgerError> {
        with_write_table!(txn, WALLETS, table, {
            table.insert(wallet_id, bytes).map_err(backend)?;
            Ok(())
        })
    }

    pub fn wallet_infos(&self, txn: &Transaction) -> Result<Vec<(u32, Vec<u8>)>, LedgerError> {
        with_table!(txn, WALLETS, table, {
            let mut out = Vec::new();
            for entry in table.iter().map_err(backend)? {
                let (key, value) = entry.map_err(backend)?;
                out.push((key.value(), value.value().to_vec()));
            }
            Ok(out)
        })
    }

    pub fn wallet_account_info_put(
        &self,
        txn: &Transaction,
        wallet_id: u32,
        account_id: u32,
        bytes: &[u8],
    ) -> Result<(), LedgerError> {
        with_write_table!(txn, WALLET_ACCOUNTS, table, {
            table
                .insert(key_wallet_account(wallet_id, account_id).as_slice(), bytes)
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn wallet_account_infos(
        &self,
        txn: &Transaction,
        wallet_id: u32,
    ) -> Result<Vec<(u32, Vec<u8>)>, LedgerError> {
        let lo = key_wallet_account(wallet_id, 0);
        let hi = key_wallet_account(wallet_id, u32::MAX);
        with_table!(txn, WALLET_ACCOUNTS, table, {
            let mut out = Vec::new();
            for entry in table.range(lo.as_slice()..=hi.as_slice()).map_err(backend)? {
                let (key, value) = entry.map_err(backend)?;
                let key = key.value();
                let account_id = u32::from_be_bytes(
                    key[4..8]
                        .try_into()
                        .map_err(|_| LedgerError::Decode("wallet account key".into()))?,
                );
                out.push((account_id, value.value().to_vec()));
            }
            Ok(out)
        })
    }

    pub fn selected_wallet_get(&self, txn: &Transaction) -> Result<Option<u32>, LedgerError> {
        with_table!(txn, META, table, {
            let x = Ok(table
                .get(META_SELECTED_WALLET)
                .map_err(backend)?
                .and_then(|g| g.value().try_into().ok().map(u32::from_be_bytes)));
            x
        })
    }

    pub fn selected_wallet_put(&self, txn: &Transaction, wallet_id: u32) -> Result<(), LedgerError> {
        with_write_table!(txn, META, table, {
            table
                .insert(META_SELECTED_WALLET, wallet_id.to_be_bytes().as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    pub fn version(&self, txn: &Transaction) -> Result<u32, LedgerError> {
        with_table!(txn, META, table, {
            let x = Ok(table
                .get(META_VERSION)
                .map_err(backend)?
                .and_then(|g| g.value().try_into().ok().map(u32::from_be_bytes))
                .unwrap_or(0));
            x
        })
    }
}

fn decode_fork_pair(bytes: &[u8]) -> Result<(Block, Block), LedgerError> {
    let mut r = StreamReader::new(bytes);
    let first = Block::deserialize(&mut r).map_err(|e| LedgerError::Decode(e.to_string()))?;
    let second = Block::deserialize(&mut r).map_err(|e| LedgerError::Decode(e.to_string()))?;
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_crypto::KeyPair;
    use strand_types::block::{BlockOpcode, Note, TxBlock};
    use strand_types::params;

    fn temp_ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.redb")).unwrap();
        (dir, ledger)
    }

    fn make_block(key: &KeyPair, height: u64, previous: BlockHash) -> Block {
        Block::Tx(TxBlock::new(
            BlockOpcode::Send,
            1,
            height as u32,
            params::EPOCH_TIMESTAMP + height,
            height,
            key.public_key,
            previous,
            U256::from_u64(7),
            Amount(100 - height as u128),
            U256::from_u64(9),
            Note::empty(),
            &key.private_key.signing_key(),
        ))
    }

    #[test]
    fn block_put_get_del() {
        let (_dir, ledger) = temp_ledger();
        let key = KeyPair::generate();
        let block = make_block(&key, 0, U256::ZERO);
        let hash = block.hash();

        let txn = ledger.begin_write().unwrap();
        ledger.block_put(&txn, &hash, &block).unwrap();
        assert!(ledger.block_exists(&txn, &hash).unwrap());
        assert_eq!(ledger.block_get(&txn, &hash).unwrap().unwrap(), block);
        assert_eq!(
            ledger
                .block_get_by_height(&txn, &key.public_key, 0)
                .unwrap()
                .unwrap(),
            block
        );
        txn.commit().unwrap();

        let txn = ledger.begin_read().unwrap();
        assert!(ledger.block_exists(&txn, &hash).unwrap());
        drop(txn);

        let txn = ledger.begin_write().unwrap();
        ledger.block_del(&txn, &hash).unwrap();
        assert!(!ledger.block_exists(&txn, &hash).unwrap());
        assert!(ledger
            .block_get_by_height(&txn, &key.public_key, 0)
            .unwrap()
            .is_none());
        txn.commit().unwrap();
    }

    #[test]
    fn abort_discards_writes() {
        let (_dir, ledger) = temp_ledger();
        let key = KeyPair::generate();
        let block = make_block(&key, 0, U256::ZERO);
        let hash = block.hash();

        let txn = ledger.begin_write().unwrap();
        ledger.block_put(&txn, &hash, &block).unwrap();
        assert!(ledger.block_exists(&txn, &hash).unwrap(), "read your writes");
        txn.abort().unwrap();

        let txn = ledger.begin_read().unwrap();
        assert!(!ledger.block_exists(&txn, &hash).unwrap());
    }

    #[test]
    fn successor_links() {
        let (_dir, ledger) = temp_ledger();
        let key = KeyPair::generate();
        let genesis = make_block(&key, 0, U256::ZERO);
        let child = make_block(&key, 1, genesis.hash());

        let txn = ledger.begin_write().unwrap();
        ledger.block_put(&txn, &genesis.hash(), &genesis).unwrap();
        ledger.block_put(&txn, &child.hash(), &child).unwrap();
        ledger
            .block_successor_set(&txn, &genesis.hash(), &child.hash())
            .unwrap();
        assert_eq!(
            ledger
                .block_successor_get(&txn, &genesis.hash())
                .unwrap()
                .unwrap(),
            child.hash()
        );
        txn.commit().unwrap();
    }

    #[test]
    fn account_iteration_is_key_ordered() {
        let (_dir, ledger) = temp_ledger();
        let txn = ledger.begin_write().unwrap();
        let a1 = U256::from_u64(10);
        let a2 = U256::from_u64(20);
        let info = AccountInfo::genesis(strand_types::BlockType::Transaction, U256::from_u64(1));
        ledger.account_info_put(&txn, &a2, &info).unwrap();
        ledger.account_info_put(&txn, &a1, &info).unwrap();

        let (first, _) = ledger.next_account_info(&txn, &U256::ZERO).unwrap().unwrap();
        assert_eq!(first, a1);
        let (next, _) = ledger.next_account_info(&txn, &a1.successor()).unwrap().unwrap();
        assert_eq!(next, a2);
        assert!(ledger
            .next_account_info(&txn, &a2.successor())
            .unwrap()
            .is_none());
        assert_eq!(ledger.account_count(&txn).unwrap(), 2);
        txn.commit().unwrap();
    }

    #[test]
    fn rep_weights_maintain_total() {
        let (_dir, ledger) = temp_ledger();
        let rep1 = U256::from_u64(1);
        let rep2 = U256::from_u64(2);

        let txn = ledger.begin_write().unwrap();
        ledger.rep_weight_add(&txn, &rep1, Amount(100)).unwrap();
        ledger.rep_weight_add(&txn, &rep2, Amount(50)).unwrap();
        ledger.rep_weight_sub(&txn, &rep1, Amount(30)).unwrap();
        assert_eq!(ledger.rep_weight_get(&txn, &rep1).unwrap(), Amount(70));
        assert_eq!(ledger.rep_weight_get(&txn, &rep2).unwrap(), Amount(50));
        assert_eq!(ledger.rep_weight_total(&txn).unwrap(), Amount(120));
        txn.commit().unwrap();
    }

    #[test]
    fn fork_records_and_cursor() {
        let (_dir, ledger) = temp_ledger();
        let key = KeyPair::generate();
        let account = key.public_key;
        let b1 = make_block(&key, 3, U256::from_u64(1));
        let mut b2 = b1.clone();
        if let Block::Tx(tx) = &mut b2 {
            tx.timestamp += 1;
        }

        let txn = ledger.begin_write().unwrap();
        ledger.fork_put(&txn, &account, 3, &b1, &b2).unwrap();
        assert!(ledger.fork_exists(&txn, &account, 3).unwrap());
        let (first, second) = ledger.fork_get(&txn, &account, 3).unwrap().unwrap();
        assert!(first.fork_with(&second));

        let (first, _) = ledger.next_fork(&txn, &U256::ZERO, 0).unwrap().unwrap();
        assert_eq!(first.height(), 3);
        assert!(ledger.next_fork(&txn, &account, 4).unwrap().is_none());

        ledger.fork_del_account(&txn, &account).unwrap();
        assert!(!ledger.fork_exists(&txn, &account, 3).unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn schema_version_is_stamped() {
        let (_dir, ledger) = temp_ledger();
        let txn = ledger.begin_read().unwrap();
        assert_eq!(ledger.version(&txn).unwrap(), SCHEMA_VERSION);
    }
}
