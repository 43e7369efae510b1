#![forbid(unsafe_code)]

//! Strand light wallet.
//!
//! A follower ledger holding only the wallet's own account chains, driven by
//! canonical blocks and receivable notifications pushed from a server, plus
//! locally signed outgoing blocks. The wallet never elects; it trusts
//! confirmations delivered by the server.

/// Outgoing block construction.
pub mod actions;
/// Follower ledger apply rules.
pub mod follower;
/// Action queue and server-notification entry points.
pub mod service;
/// Encrypted key storage.
pub mod wallet;

pub use actions::ActionResult;
pub use service::{ServerLink, WalletAction, Wallets};
pub use wallet::{Wallet, WalletAccountInfo, WalletInfo};
