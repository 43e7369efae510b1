#![forbid(unsafe_code)]

//! Key management for Strand wallets and nodes.
//!
//! Builds on `strand-types` for the scalar types and block signing helpers;
//! adds key pairs, deterministic derivation from wallet seeds, and the
//! at-rest encryption used by the wallet store.

/// Deterministic key derivation from a 256-bit seed.
pub mod derive;
/// Ed25519 key pairs.
pub mod keys;
/// AES-256-CTR secret encryption with an Argon2id password KDF.
pub mod secret;

pub use derive::{derive_private_key, ADHOC_INDEX};
pub use keys::{KeyPair, RawKey};
pub use secret::{decrypt_secret, derive_kdf_key, encrypt_secret};
