#![forbid(unsafe_code)]

//! Persistent ledger store.
//!
//! One redb database file per node holds every table: blocks with their
//! successor links, per-account chain state, receivables, rewardables, fork
//! records, the rollback log, representative weights, cross-chain bindings
//! and the wallet store. Readers run on MVCC snapshots; the single writer
//! observes its own writes and aborts atomically.

mod store;

pub use store::{Ledger, Transaction, SCHEMA_VERSION};
