//! Encrypted key storage.
//!
//! A wallet is a salt, an encrypted master key, an encrypted seed and a
//! check value. The password never persists: it derives (via the KDF) the
//! key that unwraps the master key, and the check value, the encryption of
//! zero under the master key, validates password attempts. Accounts derive
//! from the seed by index; imported ad-hoc keys carry the sentinel index.

use parking_lot::Mutex;
use strand_crypto::{
    decrypt_secret, derive_kdf_key, derive_private_key, encrypt_secret, KeyPair, RawKey,
    ADHOC_INDEX,
};
use strand_types::{
    Account, BlockHash, CodecError, Signature, StreamReader, StreamWriter, U256, WalletError,
};

/// Persistent wallet record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletInfo {
    pub version: u32,
    pub index: u32,
    pub selected_account_id: u32,
    pub salt: U256,
    pub key: U256,
    pub seed: U256,
    pub check: U256,
}

impl WalletInfo {
    pub const VERSION_1: u32 = 1;

    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_u32(self.version);
        w.write_u32(self.index);
        w.write_u32(self.selected_account_id);
        w.write_bytes(self.salt.as_bytes());
        w.write_bytes(self.key.as_bytes());
        w.write_bytes(self.seed.as_bytes());
        w.write_bytes(self.check.as_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = StreamWriter::new();
        self.serialize(&mut w);
        w.into_vec()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = StreamReader::new(bytes);
        Ok(WalletInfo {
            version: r.read_u32()?,
            index: r.read_u32()?,
            selected_account_id: r.read_u32()?,
            salt: U256(r.read_array::<32>()?),
            key: U256(r.read_array::<32>()?),
            seed: U256(r.read_array::<32>()?),
            check: U256(r.read_array::<32>()?),
        })
    }
}

/// Persistent per-account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAccountInfo {
    pub index: u32,
    pub private_key: U256,
    pub public_key: Account,
}

impl WalletAccountInfo {
    pub fn serialize(&self, w: &mut StreamWriter) {
        w.write_u32(self.index);
        w.write_bytes(self.private_key.as_bytes());
        w.write_bytes(self.public_key.as_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = StreamWriter::new();
        self.serialize(&mut w);
        w.into_vec()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = StreamReader::new(bytes);
        Ok(WalletAccountInfo {
            index: r.read_u32()?,
            private_key: U256(r.read_array::<32>()?),
            public_key: U256(r.read_array::<32>()?),
        })
    }
}

struct Inner {
    version: u32,
    index: u32,
    selected_account_id: u32,
    salt: U256,
    key: U256,
    seed: U256,
    check: U256,
    /// KDF output of the last password attempt; zero while locked.
    password_key: RawKey,
    accounts: Vec<(u32, WalletAccountInfo)>,
}

impl Inner {
    fn master_key(&self) -> RawKey {
        decrypt_secret(&self.key, &self.password_key, &self.salt)
    }

    fn valid_password(&self) -> bool {
        let master = self.master_key();
        encrypt_secret(&RawKey::from_bytes([0u8; 32]), &master, &self.salt) == self.check
    }

    fn next_account_id(&self) -> u32 {
        self.accounts
            .iter()
            .map(|(id, _)| *id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(1)
    }

    fn create_account(&mut self) -> u32 {
        let seed = decrypt_secret(&self.seed, &self.master_key(), &self.salt);
        let private_key = derive_private_key(&seed, self.index);
        let info = WalletAccountInfo {
            index: self.index,
            private_key: encrypt_secret(&private_key, &self.master_key(), &self.salt),
            public_key: private_key.public_key(),
        };
        self.index += 1;
        let account_id = self.next_account_id();
        self.accounts.push((account_id, info));
        account_id
    }
}

/// One wallet: a seed, its derived accounts and any imported keys.
pub struct Wallet {
    inner: Mutex<Inner>,
}

impl Wallet {
    /// Creates a wallet around a seed with an empty password.
    pub fn create(seed: RawKey) -> Self {
        let salt = U256(*RawKey::random().as_bytes());
        let master = RawKey::random();
        // The empty password derives a zero key directly: a fresh wallet is
        // usable until a password is set.
        let password_key = RawKey::from_bytes([0u8; 32]);
        let key = encrypt_secret(&master, &password_key, &salt);
        let seed_encrypted = encrypt_secret(&seed, &master, &salt);
        let check = encrypt_secret(&RawKey::from_bytes([0u8; 32]), &master, &salt);

        let mut inner = Inner {
            version: WalletInfo::VERSION_1,
            index: 0,
            selected_account_id: 0,
            salt,
            key,
            seed: seed_encrypted,
            check,
            password_key,
            accounts: Vec::new(),
        };
        inner.selected_account_id = inner.create_account();
        Wallet {
            inner: Mutex::new(inner),
        }
    }

    pub fn random() -> Self {
        Self::create(RawKey::random())
    }

    /// Restores a wallet from its stored records. Starts locked.
    pub fn from_stored(info: WalletInfo, accounts: Vec<(u32, WalletAccountInfo)>) -> Self {
        Wallet {
            inner: Mutex::new(Inner {
                version: info.version,
                index: info.index,
                selected_account_id: info.selected_account_id,
                salt: info.salt,
                key: info.key,
                seed: info.seed,
                check: info.check,
                password_key: RawKey::from_bytes([1u8; 32]),
                accounts,
            }),
        }
    }

    pub fn info(&self) -> WalletInfo {
        let inner = self.inner.lock();
        WalletInfo {
            version: inner.version,
            index: inner.index,
            selected_account_id: inner.selected_account_id,
            salt: inner.salt,
            key: inner.key,
            seed: inner.seed,
            check: inner.check,
        }
    }

    pub fn account_records(&self) -> Vec<(u32, WalletAccountInfo)> {
        self.inner.lock().accounts.clone()
    }

    /// Tries a password; leaves the wallet unlocked on success.
    pub fn attempt_password(&self, password: &str) -> Result<bool, WalletError> {
        let mut inner = self.inner.lock();
        let kdf = if password.is_empty() {
            RawKey::from_bytes([0u8; 32])
        } else {
            derive_kdf_key(password, &inner.salt)?
        };
        inner.password_key = kdf;
        Ok(inner.valid_password())
    }

    pub fn valid_password(&self) -> bool {
        self.inner.lock().valid_password()
    }

    /// Re-encrypts the master key under a new password.
    pub fn change_password(&self, password: &str) -> Result<(), WalletError> {
        let mut inner = self.inner.lock();
        if !inner.valid_password() {
            return Err(WalletError::Locked);
        }
        let master = inner.master_key();
        let kdf = if password.is_empty() {
            RawKey::from_bytes([0u8; 32])
        } else {
            derive_kdf_key(password, &inner.salt)?
        };
        inner.key = encrypt_secret(&master, &kdf, &inner.salt);
        inner.password_key = kdf;
        Ok(())
    }

    /// Forgets the password-derived key.
    pub fn lock(&self) {
        self.inner.lock().password_key = RawKey::from_bytes([0xFFu8; 32]);
    }

    pub fn create_account(&self) -> Result<u32, WalletError> {
        let mut inner = self.inner.lock();
        if !inner.valid_password() {
            return Err(WalletError::Locked);
        }
        Ok(inner.create_account())
    }

    /// Imports an ad-hoc key pair under the sentinel index.
    pub fn import_account(&self, pair: &KeyPair) -> Result<u32, WalletError> {
        let mut inner = self.inner.lock();
        if !inner.valid_password() {
            return Err(WalletError::Locked);
        }
        if inner
            .accounts
            .iter()
            .any(|(_, info)| info.public_key == pair.public_key)
        {
            return Err(WalletError::AccountExists);
        }
        let master = inner.master_key();
        let info = WalletAccountInfo {
            index: ADHOC_INDEX,
            private_key: encrypt_secret(&pair.private_key, &master, &inner.salt),
            public_key: pair.public_key,
        };
        let account_id = inner.next_account_id();
        inner.accounts.push((account_id, info));
        Ok(account_id)
    }

    pub fn accounts(&self) -> Vec<(u32, Account, bool)> {
        self.inner
            .lock()
            .accounts
            .iter()
            .map(|(id, info)| (*id, info.public_key, info.index == ADHOC_INDEX))
            .collect()
    }

    pub fn is_my_account(&self, account: &Account) -> bool {
        self.inner
            .lock()
            .accounts
            .iter()
            .any(|(_, info)| info.public_key == *account)
    }

    pub fn account(&self, account_id: u32) -> Option<Account> {
        self.inner
            .lock()
            .accounts
            .iter()
            .find(|(id, _)| *id == account_id)
            .map(|(_, info)| info.public_key)
    }

    pub fn select_account(&self, account_id: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.accounts.iter().any(|(id, _)| *id == account_id) {
            inner.selected_account_id = account_id;
            true
        } else {
            false
        }
    }

    pub fn selected_account(&self) -> Option<Account> {
        let inner = self.inner.lock();
        inner
            .accounts
            .iter()
            .find(|(id, _)| *id == inner.selected_account_id)
            .map(|(_, info)| info.public_key)
    }

    pub fn private_key(&self, account: &Account) -> Result<RawKey, WalletError> {
        let inner = self.inner.lock();
        if !inner.valid_password() {
            return Err(WalletError::Locked);
        }
        let info = inner
            .accounts
            .iter()
            .find(|(_, info)| info.public_key == *account)
            .map(|(_, info)| info)
            .ok_or(WalletError::AccountGet)?;
        Ok(decrypt_secret(
            &info.private_key,
            &inner.master_key(),
            &inner.salt,
        ))
    }

    pub fn seed(&self) -> Result<RawKey, WalletError> {
        let inner = self.inner.lock();
        if !inner.valid_password() {
            return Err(WalletError::Locked);
        }
        Ok(decrypt_secret(&inner.seed, &inner.master_key(), &inner.salt))
    }

    /// Signs a block hash with the account's key.
    pub fn sign(&self, account: &Account, hash: &BlockHash) -> Result<Signature, WalletError> {
        let key = self.private_key(account)?;
        Ok(key.sign(hash))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().accounts.is_empty()
    }
}
