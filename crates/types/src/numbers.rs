//! Fixed-width big integers and the scalar newtypes built on them.
//!
//! All byte representations are big-endian; hex is fixed-width uppercase on
//! encode and case-insensitive on decode. Decimal codecs follow the strict
//! rules shared with the JSON block format (see [`crate::util`]).

use crate::error::CodecError;
use crate::util;
use std::fmt;

/// A 256-bit unsigned integer stored as 32 big-endian bytes.
///
/// Ordering is numeric: big-endian byte order makes lexicographic and numeric
/// comparison coincide, which the ledger key layout relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct U256(pub [u8; 32]);

/// A 512-bit value stored as 64 big-endian bytes. Used for signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct U512(pub [u8; 64]);

impl U256 {
    /// The zero value.
    pub const ZERO: Self = U256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&v.to_be_bytes());
        U256(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The next value, wrapping at the top of the range. Bootstrap cursors
    /// step through account space with this.
    pub fn successor(&self) -> Self {
        let mut bytes = self.0;
        for b in bytes.iter_mut().rev() {
            let (v, carry) = b.overflowing_add(1);
            *b = v;
            if !carry {
                break;
            }
        }
        U256(bytes)
    }

    /// Fixed-width uppercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        if s.len() != 64 {
            return Err(CodecError::HexLength);
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| CodecError::HexDigit)?;
        Ok(U256(bytes))
    }

    pub fn to_decimal(&self) -> String {
        decimal_from_limbs(&self.0)
    }

    pub fn from_decimal(s: &str) -> Result<Self, CodecError> {
        util::check_decimal(s)?;
        let mut bytes = [0u8; 32];
        for c in s.bytes() {
            limbs_mul10_add(&mut bytes, c - b'0')?;
        }
        Ok(U256(bytes))
    }
}

impl U512 {
    pub const ZERO: Self = U512([0u8; 64]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        if s.len() != 128 {
            return Err(CodecError::HexLength);
        }
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| CodecError::HexDigit)?;
        Ok(U512(bytes))
    }

    pub fn to_decimal(&self) -> String {
        decimal_from_limbs(&self.0)
    }
}

impl Default for U512 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for U512 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Display for U512 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Repeated division by 10 over big-endian byte limbs.
fn decimal_from_limbs(limbs: &[u8]) -> String {
    let mut work = limbs.to_vec();
    let mut digits = Vec::new();
    loop {
        let mut remainder: u32 = 0;
        let mut all_zero = true;
        for b in work.iter_mut() {
            let acc = remainder * 256 + *b as u32;
            *b = (acc / 10) as u8;
            remainder = acc % 10;
            if *b != 0 {
                all_zero = false;
            }
        }
        digits.push(b'0' + remainder as u8);
        if all_zero {
            break;
        }
    }
    digits.reverse();
    String::from_utf8(digits).expect("digits are ascii")
}

/// `limbs = limbs * 10 + digit`, failing on overflow of the fixed width.
fn limbs_mul10_add(limbs: &mut [u8], digit: u8) -> Result<(), CodecError> {
    let mut carry: u32 = digit as u32;
    for b in limbs.iter_mut().rev() {
        let acc = *b as u32 * 10 + carry;
        *b = (acc & 0xFF) as u8;
        carry = acc >> 8;
    }
    if carry != 0 {
        return Err(CodecError::Overflow);
    }
    Ok(())
}

/// A 256-bit public key identifying an account, a receive destination or a
/// representative.
pub type Account = U256;

/// Blake2b-256 digest of a block's canonical prefix.
pub type BlockHash = U256;

/// Ed25519 signature over a [`BlockHash`].
pub type Signature = U512;

/// A 128-bit balance in the smallest unit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Self = Amount(0);
    pub const MAX: Self = Amount(u128::MAX);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_decimal(&self) -> String {
        self.0.to_string()
    }

    pub fn from_decimal(s: &str) -> Result<Self, CodecError> {
        util::check_decimal(s)?;
        s.parse::<u128>().map(Amount).map_err(|_| CodecError::Overflow)
    }

    pub fn to_be_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Amount(u128::from_be_bytes(bytes))
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_hex_roundtrip() {
        let hex = "B0311EA55708D6A53C75CDBF88300259C6D018522FE3D4D0A242E431F9E8B6D0";
        let v = U256::from_hex(hex).unwrap();
        assert_eq!(v.to_hex(), hex);
        assert!(U256::from_hex(&hex.to_lowercase()).is_ok());
        assert_eq!(U256::from_hex("00"), Err(CodecError::HexLength));
        assert_eq!(
            U256::from_hex(&"G".repeat(64)),
            Err(CodecError::HexDigit)
        );
    }

    #[test]
    fn u256_ordering_is_numeric() {
        let one = U256::from_u64(1);
        let two = U256::from_u64(2);
        let big = U256::from_hex(
            "0100000000000000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        assert!(one < two);
        assert!(two < big);
        assert_eq!(one.successor(), two);
        assert_eq!(
            U256([0xFF; 32]).successor(),
            U256::ZERO,
            "increment wraps at the top of the range"
        );
    }

    #[test]
    fn u256_decimal_roundtrip() {
        assert_eq!(U256::ZERO.to_decimal(), "0");
        assert_eq!(U256::from_u64(1234567890).to_decimal(), "1234567890");
        let v = U256::from_decimal("340282366920938463463374607431768211456").unwrap();
        assert_eq!(v.to_decimal(), "340282366920938463463374607431768211456");
        let max = U256([0xFF; 32]);
        assert_eq!(U256::from_decimal(&max.to_decimal()).unwrap(), max);
        let over = max.to_decimal() + "0";
        assert_eq!(U256::from_decimal(&over), Err(CodecError::Overflow));
    }

    #[test]
    fn amount_decimal_rules() {
        assert_eq!(Amount::from_decimal("0").unwrap(), Amount::ZERO);
        assert_eq!(Amount::from_decimal("1"), Ok(Amount(1)));
        assert_eq!(
            Amount::from_decimal(&u128::MAX.to_string()),
            Ok(Amount::MAX)
        );
        assert_eq!(Amount::from_decimal(""), Err(CodecError::DecimalFormat));
        assert_eq!(Amount::from_decimal("01"), Err(CodecError::DecimalFormat));
        assert_eq!(Amount::from_decimal("-1"), Err(CodecError::DecimalFormat));
        assert_eq!(Amount::from_decimal("0x10"), Err(CodecError::DecimalFormat));
        assert_eq!(
            Amount::from_decimal("340282366920938463463374607431768211456"),
            Err(CodecError::Overflow)
        );
    }
}
