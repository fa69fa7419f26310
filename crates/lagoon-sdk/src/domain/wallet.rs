use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::keys::KeyDeriver;
use crate::network::Network;

const HARDENED_KEY_START: u32 = 0x8000_0000;

/// Holds the plaintext mnemonic while the wallet is unlocked.
pub trait MnemonicStore: Send + Sync {
    fn set(&self, mnemonic: String);
    fn get(&self) -> Option<String>;
    fn unset(&self);
    fn is_set(&self) -> bool;
}

/// Encrypts and decrypts the mnemonic with the wallet password.
pub trait MnemonicCipher: Send + Sync {
    fn encrypt(&self, mnemonic: &[u8], password: &str) -> Result<Vec<u8>>;
    fn decrypt(&self, encrypted: &[u8], password: &str) -> Result<Vec<u8>>;
}

/// Derivation chain of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChain {
    External = 0,
    Internal = 1,
}

/// Everything needed to watch, receive on and spend from a derived address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub account: String,
    pub address: String,
    /// Private blinding key, empty for unconfidential addresses.
    pub blinding_key: Vec<u8>,
    /// Path relative to the wallet root, e.g. `0'/1/3`.
    pub derivation_path: String,
    /// Hex encoded output script.
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub index: u32,
    pub xpub: String,
    pub derivation_path: String,
    pub next_external_index: u32,
    pub next_internal_index: u32,
    /// Hex script -> path relative to the wallet root.
    pub derivation_path_by_script: HashMap<String, String>,
    pub birthday_block: u64,
}

/// HD wallet whose mnemonic is kept encrypted with the user password.
///
/// The wallet is locked whenever the injected [`MnemonicStore`] holds no
/// plaintext mnemonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub encrypted_mnemonic: Vec<u8>,
    pub password_hash: Vec<u8>,
    pub birthday_block_height: u64,
    pub root_path: String,
    pub network: Network,
    pub accounts: BTreeMap<String, Account>,
    pub next_account_index: u32,
}

fn password_hash(password: &str) -> Vec<u8> {
    Sha256::digest(password.as_bytes()).to_vec()
}

impl Wallet {
    pub fn new(
        mnemonic: &str,
        password: &str,
        network: Network,
        birthday_block_height: u64,
        cipher: &dyn MnemonicCipher,
    ) -> Result<Self> {
        if mnemonic.trim().is_empty() {
            return Err(Error::MissingMnemonic);
        }
        if password.is_empty() {
            return Err(Error::MissingPassword);
        }
        let encrypted_mnemonic = cipher.encrypt(mnemonic.trim().as_bytes(), password)?;

        Ok(Self {
            encrypted_mnemonic,
            password_hash: password_hash(password),
            birthday_block_height,
            root_path: network.root_path(),
            network,
            accounts: BTreeMap::new(),
            next_account_index: 0,
        })
    }

    pub fn is_initialized(&self) -> bool {
        !self.encrypted_mnemonic.is_empty()
    }

    pub fn is_locked(&self, store: &dyn MnemonicStore) -> bool {
        !self.is_initialized() || !store.is_set()
    }

    pub fn is_valid_password(&self, password: &str) -> bool {
        self.password_hash == password_hash(password)
    }

    pub fn mnemonic(&self, store: &dyn MnemonicStore) -> Result<String> {
        if self.is_locked(store) {
            return Err(Error::WalletLocked);
        }
        store.get().ok_or(Error::WalletLocked)
    }

    pub fn lock(&self, password: &str, store: &dyn MnemonicStore) -> Result<()> {
        if self.is_locked(store) {
            return Ok(());
        }
        if !self.is_valid_password(password) {
            return Err(Error::InvalidPassword);
        }
        store.unset();
        Ok(())
    }

    pub fn unlock(
        &self,
        password: &str,
        store: &dyn MnemonicStore,
        cipher: &dyn MnemonicCipher,
    ) -> Result<()> {
        if !self.is_locked(store) {
            return Ok(());
        }
        if !self.is_valid_password(password) {
            return Err(Error::InvalidPassword);
        }
        let plaintext = cipher.decrypt(&self.encrypted_mnemonic, password)?;
        let mnemonic = String::from_utf8(plaintext).map_err(|e| Error::Cipher(e.to_string()))?;
        store.set(mnemonic);
        Ok(())
    }

    /// Re-encrypts the mnemonic with a new password. The wallet must be locked.
    pub fn change_password(
        &mut self,
        current_password: &str,
        new_password: &str,
        store: &dyn MnemonicStore,
        cipher: &dyn MnemonicCipher,
    ) -> Result<()> {
        if !self.is_locked(store) {
            return Err(Error::WalletUnlocked);
        }
        if new_password.is_empty() {
            return Err(Error::MissingPassword);
        }
        if !self.is_valid_password(current_password) {
            return Err(Error::InvalidPassword);
        }
        let mnemonic = cipher.decrypt(&self.encrypted_mnemonic, current_password)?;
        self.encrypted_mnemonic = cipher.encrypt(&mnemonic, new_password)?;
        self.password_hash = password_hash(new_password);
        Ok(())
    }

    // ── Accounts ─────────────────────────────────────────────────────────

    pub fn account(&self, name: &str) -> Result<&Account> {
        self.accounts.get(name).ok_or(Error::AccountNotFound)
    }

    pub fn create_account(
        &mut self,
        name: &str,
        birthday_block: u64,
        mnemonic: &str,
        deriver: &dyn KeyDeriver,
    ) -> Result<Account> {
        if name.is_empty() {
            return Err(Error::Validation("missing account name".to_string()));
        }
        if self.accounts.contains_key(name) {
            return Err(Error::AccountAlreadyExists(name.to_string()));
        }
        if self.next_account_index >= HARDENED_KEY_START {
            return Err(Error::MaxAccountNumberReached);
        }

        let index = self.next_account_index;
        let xpub = deriver.account_xpub(mnemonic, index)?;
        let account = Account {
            name: name.to_string(),
            index,
            xpub,
            derivation_path: format!("{}/{}'", self.root_path, index),
            next_external_index: 0,
            next_internal_index: 0,
            derivation_path_by_script: HashMap::new(),
            birthday_block: birthday_block.max(self.birthday_block_height),
        };
        self.accounts.insert(name.to_string(), account.clone());
        self.next_account_index += 1;
        Ok(account)
    }

    pub fn delete_account(&mut self, name: &str) -> Result<()> {
        self.accounts
            .remove(name)
            .map(|_| ())
            .ok_or(Error::AccountNotFound)
    }

    pub fn derive_next_address(
        &mut self,
        name: &str,
        chain: AddressChain,
        mnemonic: &str,
        deriver: &dyn KeyDeriver,
    ) -> Result<AddressInfo> {
        let account = self.accounts.get_mut(name).ok_or(Error::AccountNotFound)?;
        let address_index = match chain {
            AddressChain::External => account.next_external_index,
            AddressChain::Internal => account.next_internal_index,
        };
        let info = derive_address_info(account, chain, address_index, mnemonic, deriver)?;

        account
            .derivation_path_by_script
            .insert(info.script.clone(), info.derivation_path.clone());
        match chain {
            AddressChain::External => account.next_external_index += 1,
            AddressChain::Internal => account.next_internal_index += 1,
        }
        Ok(info)
    }

    /// Re-derives every address handed out so far for the account.
    pub fn all_derived_addresses(
        &self,
        name: &str,
        include_internal: bool,
        mnemonic: &str,
        deriver: &dyn KeyDeriver,
    ) -> Result<Vec<AddressInfo>> {
        let account = self.account(name)?;
        let mut info = Vec::new();
        for i in 0..account.next_external_index {
            info.push(derive_address_info(
                account,
                AddressChain::External,
                i,
                mnemonic,
                deriver,
            )?);
        }
        if include_internal {
            for i in 0..account.next_internal_index {
                info.push(derive_address_info(
                    account,
                    AddressChain::Internal,
                    i,
                    mnemonic,
                    deriver,
                )?);
            }
        }
        Ok(info)
    }
}

fn derive_address_info(
    account: &Account,
    chain: AddressChain,
    address_index: u32,
    mnemonic: &str,
    deriver: &dyn KeyDeriver,
) -> Result<AddressInfo> {
    let derived = deriver.derive_address(mnemonic, account.index, chain as u32, address_index)?;
    Ok(AddressInfo {
        account: account.name.clone(),
        address: derived.address,
        blinding_key: derived.blinding_key,
        derivation_path: format!("{}'/{}/{}", account.index, chain as u32, address_index),
        script: hex::encode(derived.script),
    })
}
