//! At-rest encryption for wallet secrets.
//!
//! Seeds and private keys are encrypted with AES-256-CTR under a key derived
//! from the user password via Argon2id and the wallet salt. The 16-byte IV is
//! taken from the first half of the salt, so each wallet encrypts under a
//! distinct stream even with an identical password.

use crate::keys::RawKey;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use argon2::{Argon2, Params, Version};
use strand_types::{CryptoError, U256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Argon2id parameters: 64 MiB, 2 passes, lane per core class.
fn kdf() -> Argon2<'static> {
    let params = Params::new(64 * 1024, 2, 1, Some(32)).expect("static parameters are valid");
    Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params)
}

/// Derives the wallet encryption key from a password and the wallet salt.
pub fn derive_kdf_key(password: &str, salt: &U256) -> Result<RawKey, CryptoError> {
    let mut out = [0u8; 32];
    kdf()
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut out)
        .map_err(|_| CryptoError::Kdf)?;
    Ok(RawKey::from_bytes(out))
}

fn apply_ctr(data: &mut [u8; 32], key: &RawKey, salt: &U256) {
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&salt.as_bytes()[..16]);
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), &iv.into());
    cipher.apply_keystream(data);
}

/// Encrypts a 256-bit secret.
pub fn encrypt_secret(plain: &RawKey, key: &RawKey, salt: &U256) -> U256 {
    let mut data = *plain.as_bytes();
    apply_ctr(&mut data, key, salt);
    U256(data)
}

/// Decrypts a 256-bit secret.
pub fn decrypt_secret(cipher: &U256, key: &RawKey, salt: &U256) -> RawKey {
    let mut data = cipher.0;
    apply_ctr(&mut data, key, salt);
    RawKey::from_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let secret = RawKey::from_bytes([0xAB; 32]);
        let key = RawKey::from_bytes([0x11; 32]);
        let salt = U256::from_u64(999);

        let encrypted = encrypt_secret(&secret, &key, &salt);
        assert_ne!(encrypted.0, *secret.as_bytes());
        let decrypted = decrypt_secret(&encrypted, &key, &salt);
        assert_eq!(decrypted.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn wrong_key_garbles() {
        let secret = RawKey::from_bytes([0xAB; 32]);
        let key = RawKey::from_bytes([0x11; 32]);
        let salt = U256::from_u64(999);
        let encrypted = encrypt_secret(&secret, &key, &salt);

        let wrong = decrypt_secret(&encrypted, &RawKey::from_bytes([0x12; 32]), &salt);
        assert_ne!(wrong.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn salt_changes_the_stream() {
        let secret = RawKey::from_bytes([0xAB; 32]);
        let key = RawKey::from_bytes([0x11; 32]);
        let a = encrypt_secret(&secret, &key, &U256([1u8; 32]));
        let b = encrypt_secret(&secret, &key, &U256([2u8; 32]));
        assert_ne!(a, b);
    }

    // KDF derivation is deliberately slow; keep one smoke test.
    #[test]
    #[ignore = "memory-hard KDF, run explicitly"]
    fn kdf_is_deterministic() {
        let salt = U256::from_u64(5);
        let a = derive_kdf_key("correct horse", &salt).unwrap();
        let b = derive_kdf_key("correct horse", &salt).unwrap();
        let c = derive_kdf_key("battery staple", &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }
}
