//! Ed25519 key pairs over the Strand scalar types.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use strand_types::block::{sign_hash, verify_hash};
use strand_types::{Account, BlockHash, CryptoError, Signature, U256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 256-bit private scalar, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RawKey {
    bytes: [u8; 32],
}

impl RawKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Fresh random key from the OS generator.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The public key this private scalar signs for.
    pub fn public_key(&self) -> Account {
        let signing = SigningKey::from_bytes(&self.bytes);
        U256(VerifyingKey::from(&signing).to_bytes())
    }

    /// Signs a block hash.
    pub fn sign(&self, hash: &BlockHash) -> Signature {
        let signing = SigningKey::from_bytes(&self.bytes);
        sign_hash(hash, &signing)
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.bytes)
    }
}

/// A private key with its derived public half.
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: RawKey,
    pub public_key: Account,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private_key = RawKey::random();
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }

    pub fn from_private_key(private_key: RawKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }

    /// Verifies a signature made by this pair.
    pub fn verify(&self, hash: &BlockHash, signature: &Signature) -> Result<(), CryptoError> {
        if verify_hash(hash, &self.public_key, signature) {
            Ok(())
        } else {
            Err(CryptoError::Signature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::generate();
        let hash = U256::from_u64(42);
        let signature = pair.private_key.sign(&hash);
        assert!(pair.verify(&hash, &signature).is_ok());

        let other = U256::from_u64(43);
        assert!(pair.verify(&other, &signature).is_err());

        let stranger = KeyPair::generate();
        assert!(!verify_hash(&hash, &stranger.public_key, &signature));
    }

    #[test]
    fn distinct_keys() {
        assert_ne!(KeyPair::generate().public_key, KeyPair::generate().public_key);
    }
}
