use std::collections::HashMap;
use std::fmt;

use lwk_wollet::elements::hashes::{Hash as _, hash160};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a coin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtxoKey {
    pub txid: String,
    pub vout: u32,
}

impl UtxoKey {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }

    /// Fixed-length storage key: hex(hash160(txid || vout_le)).
    pub fn hash(&self) -> String {
        let mut buf = hex::decode(&self.txid).unwrap_or_else(|_| self.txid.as_bytes().to_vec());
        buf.extend_from_slice(&self.vout.to_le_bytes());
        hex::encode(hash160::Hash::hash(&buf).to_byte_array())
    }
}

impl fmt::Display for UtxoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: {}}}", self.txid, self.vout)
    }
}

/// Display helper for a list of keys, used in log lines.
pub struct UtxoKeys<'a>(pub &'a [UtxoKey]);

impl fmt::Display for UtxoKeys<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.0.iter().map(|k| k.to_string()).collect();
        write!(f, "{}", keys.join(", "))
    }
}

/// Where a confirmation or a spend happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoStatus {
    pub txid: String,
    pub block_height: u64,
    pub block_time: i64,
    pub block_hash: String,
}

impl UtxoStatus {
    pub fn new(
        txid: impl Into<String>,
        block_height: u64,
        block_time: i64,
        block_hash: impl Into<String>,
    ) -> Self {
        Self {
            txid: txid.into(),
            block_height,
            block_time,
            block_hash: block_hash.into(),
        }
    }
}

/// A coin owned by one of the wallet accounts.
///
/// The coin state machine is `unlocked <-> locked -> spent`, spent being
/// terminal. Confirmation is orthogonal and happens at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub key: UtxoKey,
    pub value: u64,
    /// Asset id, hex.
    pub asset: String,
    pub value_commitment: Vec<u8>,
    pub asset_commitment: Vec<u8>,
    pub value_blinder: Vec<u8>,
    pub asset_blinder: Vec<u8>,
    pub script: Vec<u8>,
    pub nonce: Vec<u8>,
    pub range_proof: Vec<u8>,
    pub surjection_proof: Vec<u8>,
    pub account_name: String,
    pub lock_timestamp: i64,
    pub lock_expiry_timestamp: i64,
    pub spent_status: Option<UtxoStatus>,
    pub confirmed_status: Option<UtxoStatus>,
}

impl Default for UtxoKey {
    fn default() -> Self {
        Self::new(String::new(), 0)
    }
}

impl Utxo {
    pub fn key(&self) -> UtxoKey {
        self.key.clone()
    }

    pub fn is_confidential(&self) -> bool {
        !self.value_commitment.is_empty() && !self.asset_commitment.is_empty()
    }

    pub fn is_revealed(&self) -> bool {
        !self.value_blinder.is_empty() && !self.asset_blinder.is_empty()
    }

    pub fn is_spent(&self) -> bool {
        self.spent_status.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_status.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_timestamp > 0
    }

    /// Confirmed, unlocked, unspent and, if confidential, revealed.
    pub fn is_spendable(&self) -> bool {
        self.is_confirmed()
            && !self.is_locked()
            && !self.is_spent()
            && (!self.is_confidential() || self.is_revealed())
    }

    /// Whether the lock has outlived its expiry at `now` (epoch seconds).
    pub fn can_unlock(&self, now: i64) -> bool {
        self.is_locked() && !self.is_spent() && self.lock_expiry_timestamp <= now
    }

    /// Marks the coin as spent and clears any lock.
    pub fn spend(&mut self, status: UtxoStatus) {
        self.spent_status = Some(status);
        self.lock_timestamp = 0;
        self.lock_expiry_timestamp = 0;
    }

    pub fn confirm(&mut self, status: UtxoStatus) -> Result<()> {
        if status.block_hash.is_empty() {
            return Err(Error::Validation(
                "missing block info for utxo confirmation".to_string(),
            ));
        }
        if self.is_confirmed() {
            return Ok(());
        }
        self.confirmed_status = Some(status);
        Ok(())
    }

    /// Locks the coin unless it's already locked or spent. Returns whether the
    /// coin transitioned.
    pub fn lock(&mut self, timestamp: i64, expiry_timestamp: i64) -> bool {
        if self.is_locked() || self.is_spent() {
            return false;
        }
        self.lock_timestamp = timestamp;
        self.lock_expiry_timestamp = expiry_timestamp;
        true
    }

    /// Unlocks the coin if locked and not spent. Returns whether the coin
    /// transitioned.
    pub fn unlock(&mut self) -> bool {
        if !self.is_locked() || self.is_spent() {
            return false;
        }
        self.lock_timestamp = 0;
        self.lock_expiry_timestamp = 0;
        true
    }

    pub fn info(&self) -> UtxoInfo {
        UtxoInfo {
            key: self.key(),
            value: self.value,
            asset: self.asset.clone(),
            script: self.script.clone(),
            value_blinder: self.value_blinder.clone(),
            asset_blinder: self.asset_blinder.clone(),
            account_name: self.account_name.clone(),
            spent_status: self.spent_status.clone(),
            confirmed_status: self.confirmed_status.clone(),
        }
    }
}

/// Projection of a [`Utxo`] carried by events. Never includes commitments or
/// proofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInfo {
    pub key: UtxoKey,
    pub value: u64,
    pub asset: String,
    pub script: Vec<u8>,
    pub value_blinder: Vec<u8>,
    pub asset_blinder: Vec<u8>,
    pub account_name: String,
    pub spent_status: Option<UtxoStatus>,
    pub confirmed_status: Option<UtxoStatus>,
}

/// Per-asset balance of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub locked: u64,
}

impl Balance {
    pub fn total(&self) -> u64 {
        self.confirmed + self.unconfirmed + self.locked
    }
}

/// Balance by asset over the non-spent coins of `utxos`.
pub fn balance_by_asset<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> HashMap<String, Balance> {
    let mut balance: HashMap<String, Balance> = HashMap::new();
    for u in utxos {
        if u.is_spent() {
            continue;
        }
        let b = balance.entry(u.asset.clone()).or_default();
        if u.is_locked() {
            b.locked += u.value;
        } else if u.is_confirmed() {
            b.confirmed += u.value;
        } else {
            b.unconfirmed += u.value;
        }
    }
    balance
}

pub fn keys_of(utxos: &[Utxo]) -> Vec<UtxoKey> {
    utxos.iter().map(Utxo::key).collect()
}

pub fn info_keys(utxos: &[UtxoInfo]) -> Vec<UtxoKey> {
    utxos.iter().map(|u| u.key.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed_status() -> UtxoStatus {
        UtxoStatus::new("ff".repeat(32), 10, 1_700_000_000, "aa".repeat(32))
    }

    fn utxo(value: u64) -> Utxo {
        Utxo {
            key: UtxoKey::new("00".repeat(32), 0),
            value,
            asset: "11".repeat(32),
            account_name: "main".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn key_hash_is_hash160_hex() {
        let k = UtxoKey::new("0000000000000000000000000000000000000000000000000000000000000000", 1);
        let h = k.hash();
        assert_eq!(h.len(), 40);
        assert_ne!(h, UtxoKey::new(k.txid.clone(), 2).hash());
        assert_eq!(h, k.clone().hash());
        assert_ne!(
            UtxoKey::new(k.txid.clone(), 257).hash(),
            h,
            "every byte of vout is part of the key"
        );
    }

    #[test]
    fn key_display() {
        let k = UtxoKey::new("ab", 3);
        assert_eq!(k.to_string(), "{ab: 3}");
        let keys = vec![k.clone(), UtxoKey::new("cd", 0)];
        assert_eq!(UtxoKeys(&keys).to_string(), "{ab: 3}, {cd: 0}");
    }

    #[test]
    fn confidential_and_revealed() {
        let mut u = utxo(10);
        assert!(!u.is_confidential());
        u.value_commitment = vec![8; 33];
        assert!(!u.is_confidential());
        u.asset_commitment = vec![10; 33];
        assert!(u.is_confidential());
        assert!(!u.is_revealed());
        u.value_blinder = vec![1; 32];
        u.asset_blinder = vec![2; 32];
        assert!(u.is_revealed());
    }

    #[test]
    fn lock_is_idempotent() {
        let mut u = utxo(10);
        assert!(u.lock(100, 200));
        assert!(!u.lock(150, 250));
        assert_eq!(u.lock_timestamp, 100);
        assert_eq!(u.lock_expiry_timestamp, 200);
        assert!(u.unlock());
        assert!(!u.unlock());
        assert!(!u.is_locked());
    }

    #[test]
    fn spend_is_terminal() {
        let mut u = utxo(10);
        u.lock(100, 200);
        u.spend(confirmed_status());
        assert!(u.is_spent());
        assert!(!u.is_locked());
        assert!(!u.lock(300, 400));
        assert!(!u.unlock());
        assert!(!u.is_spendable());
    }

    #[test]
    fn confirm_requires_block_info() {
        let mut u = utxo(10);
        assert!(u.confirm(UtxoStatus::default()).is_err());
        assert!(!u.is_confirmed());
        u.confirm(confirmed_status()).unwrap();
        assert!(u.is_confirmed());
        assert!(u.is_spendable());
    }

    #[test]
    fn unrevealed_confidential_is_not_spendable() {
        let mut u = utxo(10);
        u.confirm(confirmed_status()).unwrap();
        u.value_commitment = vec![8; 33];
        u.asset_commitment = vec![10; 33];
        assert!(!u.is_spendable());
    }

    #[test]
    fn can_unlock_after_expiry() {
        let mut u = utxo(10);
        assert!(!u.can_unlock(1000));
        u.lock(100, 200);
        assert!(!u.can_unlock(199));
        assert!(u.can_unlock(200));
    }

    #[test]
    fn balance_skips_spent_and_splits_states() {
        let mut confirmed = utxo(5);
        confirmed.key.vout = 0;
        confirmed.confirm(confirmed_status()).unwrap();
        let mut unconfirmed = utxo(7);
        unconfirmed.key.vout = 1;
        let mut locked = utxo(11);
        locked.key.vout = 2;
        locked.confirm(confirmed_status()).unwrap();
        locked.lock(1, 2);
        let mut spent = utxo(13);
        spent.key.vout = 3;
        spent.spend(confirmed_status());

        let all = vec![confirmed, unconfirmed, locked, spent];
        let balance = balance_by_asset(&all);
        let b = balance.get(&"11".repeat(32)).unwrap();
        assert_eq!(b.confirmed, 5);
        assert_eq!(b.unconfirmed, 7);
        assert_eq!(b.locked, 11);
        assert_eq!(b.total(), 23);
    }

    #[test]
    fn info_carries_no_commitments() {
        let mut u = utxo(10);
        u.value_commitment = vec![8; 33];
        u.asset_commitment = vec![10; 33];
        let info = u.info();
        assert_eq!(info.key, u.key);
        assert_eq!(info.value, 10);
        assert_eq!(info.account_name, "main");
    }
}
