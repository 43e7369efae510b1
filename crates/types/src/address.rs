//! Checksummed base-32 account addresses.
//!
//! Layout: the `strand_` prefix, 52 characters encoding 4 zero bits plus the
//! 256-bit public key, then 8 characters encoding the 40-bit Blake2b checksum
//! of the key, appended byte-reversed. Decoding rejects a wrong prefix,
//! length, alphabet character or checksum.

use crate::error::CryptoError;
use crate::numbers::{Account, U256};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

const PREFIX: &str = "strand_";
const ALPHABET: &[u8; 32] = b"13456789abcdefghijkmnopqrstuwxyz";
const KEY_CHARS: usize = 52;
const CHECK_CHARS: usize = 8;

fn decode_char(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
}

fn checksum(key: &[u8; 32]) -> [u8; 5] {
    let mut hasher = Blake2bVar::new(5).expect("5-byte output is valid");
    hasher.update(key);
    let mut out = [0u8; 5];
    hasher
        .finalize_variable(&mut out)
        .expect("output length matches");
    out
}

/// Encodes an account as its textual address.
pub fn encode(account: &Account) -> String {
    let mut result = String::with_capacity(PREFIX.len() + KEY_CHARS + CHECK_CHARS);
    result.push_str(PREFIX);

    // 4 zero bits + 256 key bits = 260 bits = 52 characters.
    let mut acc: u32 = 0;
    let mut bits: u32 = 4;
    for byte in account.0.iter() {
        acc = (acc << 8) | *byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            result.push(ALPHABET[((acc >> bits) & 0x1F) as usize] as char);
        }
    }
    debug_assert_eq!(bits, 0);

    // 40 checksum bits, byte-reversed, 8 characters.
    let check = checksum(&account.0);
    let mut acc: u64 = 0;
    for byte in check.iter().rev() {
        acc = (acc << 8) | *byte as u64;
    }
    for i in (0..CHECK_CHARS).rev() {
        result.push(ALPHABET[((acc >> (i * 5)) & 0x1F) as usize] as char);
    }

    result
}

/// Decodes a textual address back to the account key.
pub fn decode(s: &str) -> Result<Account, CryptoError> {
    let body = s.strip_prefix(PREFIX).ok_or(CryptoError::AddressPrefix)?;
    if body.len() != KEY_CHARS + CHECK_CHARS {
        return Err(CryptoError::AddressLength);
    }
    let bytes = body.as_bytes();

    // The leading 4 bits are padding and must be zero, so the first
    // character can only carry one data bit.
    let first = decode_char(bytes[0]).ok_or(CryptoError::AddressAlphabet)?;
    if first > 1 {
        return Err(CryptoError::AddressAlphabet);
    }

    let mut key = [0u8; 32];
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = 0;
    for &c in &bytes[..KEY_CHARS] {
        let v = decode_char(c).ok_or(CryptoError::AddressAlphabet)?;
        acc = (acc << 5) | v as u32;
        bits += 5;
        if bits >= 8 && out < 32 {
            bits -= 8;
            key[out] = ((acc >> bits) & 0xFF) as u8;
            out += 1;
        }
    }
    debug_assert_eq!(out, 32);

    let mut acc: u64 = 0;
    for &c in &bytes[KEY_CHARS..] {
        let v = decode_char(c).ok_or(CryptoError::AddressAlphabet)?;
        acc = (acc << 5) | v as u64;
    }
    let mut check = [0u8; 5];
    for (i, b) in check.iter_mut().enumerate() {
        *b = ((acc >> ((4 - i) * 8)) & 0xFF) as u8;
    }
    check.reverse();
    if check != checksum(&key) {
        return Err(CryptoError::AddressChecksum);
    }

    Ok(U256(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numbers::U256;

    #[test]
    fn roundtrip() {
        let account = U256::from_hex(
            "B0311EA55708D6A53C75CDBF88300259C6D018522FE3D4D0A242E431F9E8B6D0",
        )
        .unwrap();
        let addr = encode(&account);
        assert!(addr.starts_with("strand_"));
        assert_eq!(addr.len(), 7 + 52 + 8);
        assert_eq!(decode(&addr).unwrap(), account);

        assert_eq!(decode(&encode(&U256::ZERO)).unwrap(), U256::ZERO);
        assert_eq!(decode(&encode(&U256([0xFF; 32]))).unwrap(), U256([0xFF; 32]));
        assert_eq!(decode(&encode(&U256::from_u64(1))).unwrap(), U256::from_u64(1));
    }

    #[test]
    fn rejects_malformed() {
        let account = U256::from_u64(7);
        let addr = encode(&account);

        let wrong_prefix = addr.replacen("strand_", "brand_", 1);
        assert_eq!(decode(&wrong_prefix), Err(CryptoError::AddressPrefix));

        let truncated = &addr[..addr.len() - 1];
        assert_eq!(decode(truncated), Err(CryptoError::AddressLength));

        let mut bad_alphabet = addr.clone();
        bad_alphabet.replace_range(10..11, "0");
        assert_eq!(decode(&bad_alphabet), Err(CryptoError::AddressAlphabet));

        // Corrupt one checksum character.
        let last = addr.chars().last().unwrap();
        let other = if last == '1' { '3' } else { '1' };
        let mut bad_check = addr.clone();
        bad_check.replace_range(addr.len() - 1.., &other.to_string());
        assert_eq!(decode(&bad_check), Err(CryptoError::AddressChecksum));
    }
}
