//! Test doubles for the wallet collaborators.
//!
//! They let the services run end to end without a network, a real signer or
//! real cryptography. Fake "transactions" are JSON documents listing inputs
//! and outputs, hex encoded once finalized.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::chain::ChainObserver;
use crate::domain::{
    AddressInfo, MnemonicCipher, Transaction, Utxo, UtxoInfo, UtxoKey, UtxoStatus,
};
use crate::error::{Error, Result};
use crate::inmemory::{
    InMemoryTransactionRepository, InMemoryUtxoRepository, InMemoryWalletRepository,
};
use crate::keys::{DerivedAddress, KeyDeriver};
use crate::pset::{PsetBackend, TxInput, TxOutput};
use crate::repository::RepoManager;

pub const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// A repo manager over fresh in-memory repositories.
pub fn in_memory_repo_manager() -> Arc<RepoManager> {
    RepoManager::new(
        Arc::new(InMemoryUtxoRepository::new()),
        Arc::new(InMemoryTransactionRepository::new()),
        Arc::new(InMemoryWalletRepository::new()),
    )
}

/// A confirmed, unconfidential coin of `account`.
pub fn confirmed_coin(account: &str, txid_byte: u8, vout: u32, value: u64, asset: &str) -> Utxo {
    Utxo {
        key: UtxoKey::new(hex::encode([txid_byte; 32]), vout),
        value,
        asset: asset.to_string(),
        script: {
            let mut script = vec![0x00, 0x14];
            script.extend_from_slice(&[txid_byte; 20]);
            script
        },
        account_name: account.to_string(),
        confirmed_status: Some(UtxoStatus::new("", 1, 1, "00".repeat(32))),
        ..Default::default()
    }
}

// ── Cipher and key derivation ───────────────────────────────────────

/// Reversible, password-bound, not secure.
pub struct XorCipher;

fn xor_key(password: &str) -> Vec<u8> {
    Sha256::digest(password.as_bytes()).to_vec()
}

impl MnemonicCipher for XorCipher {
    fn encrypt(&self, mnemonic: &[u8], password: &str) -> Result<Vec<u8>> {
        let key = xor_key(password);
        let mut out = key.clone();
        out.extend(mnemonic.iter().enumerate().map(|(i, b)| b ^ key[i % key.len()]));
        Ok(out)
    }

    fn decrypt(&self, encrypted: &[u8], password: &str) -> Result<Vec<u8>> {
        let key = xor_key(password);
        if encrypted.len() < key.len() || encrypted[..key.len()] != key[..] {
            return Err(Error::InvalidPassword);
        }
        Ok(encrypted[key.len()..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect())
    }
}

/// Deterministic deriver: script = 0x0014 || account || chain || index || 0^8.
pub struct FakeDeriver;

impl KeyDeriver for FakeDeriver {
    fn account_xpub(&self, _mnemonic: &str, account_index: u32) -> Result<String> {
        Ok(format!("xpub-{account_index}"))
    }

    fn derive_address(
        &self,
        _mnemonic: &str,
        account_index: u32,
        chain: u32,
        index: u32,
    ) -> Result<DerivedAddress> {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&account_index.to_be_bytes());
        script.extend_from_slice(&chain.to_be_bytes());
        script.extend_from_slice(&index.to_be_bytes());
        script.extend_from_slice(&[0u8; 8]);
        Ok(DerivedAddress {
            address: format!("addr-{account_index}-{chain}-{index}"),
            script,
            blinding_key: vec![0x11; 32],
            blinding_pubkey: vec![0x02; 33],
        })
    }
}

// ── Chain ───────────────────────────────────────────────────────────

type AccountReceivers = (
    Option<UnboundedReceiver<Vec<Utxo>>>,
    Option<UnboundedReceiver<Transaction>>,
);
type AccountSenders = (UnboundedSender<Vec<Utxo>>, UnboundedSender<Transaction>);

/// In-memory chain: a fixed tip, a set of known outputs, and report channels
/// fed by the test.
#[derive(Default)]
pub struct FakeChainObserver {
    tip: Mutex<(String, u64)>,
    outputs: Mutex<HashMap<UtxoKey, Utxo>>,
    transactions: Mutex<HashMap<String, Transaction>>,
    broadcasted: Mutex<Vec<String>>,
    watched: Mutex<HashMap<String, Vec<AddressInfo>>>,
    receivers: Mutex<HashMap<String, AccountReceivers>>,
    senders: Mutex<HashMap<String, AccountSenders>>,
}

impl FakeChainObserver {
    pub fn new(height: u64) -> Self {
        let observer = Self::default();
        if let Ok(mut tip) = observer.tip.lock() {
            *tip = ("ff".repeat(32), height);
        }
        observer
    }

    pub fn add_output(&self, utxo: Utxo) {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.insert(utxo.key(), utxo);
        }
    }

    pub fn add_transaction(&self, tx: Transaction) {
        if let Ok(mut txs) = self.transactions.lock() {
            txs.insert(tx.txid.clone(), tx);
        }
    }

    pub fn broadcasted(&self) -> Vec<String> {
        self.broadcasted.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn is_watching(&self, account: &str) -> bool {
        self.watched
            .lock()
            .map(|w| w.contains_key(account))
            .unwrap_or(false)
    }

    pub fn watched_addresses(&self, account: &str) -> Vec<AddressInfo> {
        self.watched
            .lock()
            .ok()
            .and_then(|w| w.get(account).cloned())
            .unwrap_or_default()
    }

    /// Pushes a coin report to the account listener. False if the account
    /// isn't watched.
    pub fn report_utxos(&self, account: &str, utxos: Vec<Utxo>) -> bool {
        self.senders
            .lock()
            .ok()
            .and_then(|s| s.get(account).map(|(tx, _)| tx.send(utxos).is_ok()))
            .unwrap_or(false)
    }

    pub fn report_transaction(&self, account: &str, tx: Transaction) -> bool {
        self.senders
            .lock()
            .ok()
            .and_then(|s| s.get(account).map(|(_, sender)| sender.send(tx).is_ok()))
            .unwrap_or(false)
    }
}

impl ChainObserver for FakeChainObserver {
    fn get_latest_block(&self) -> Result<(String, u64)> {
        self.tip
            .lock()
            .map(|t| t.clone())
            .map_err(|_| Error::Electrum("poisoned".into()))
    }

    fn get_utxos(&self, keys: &[UtxoKey]) -> Result<Vec<Utxo>> {
        let outputs = self
            .outputs
            .lock()
            .map_err(|_| Error::Electrum("poisoned".into()))?;
        keys.iter()
            .map(|k| {
                outputs
                    .get(k)
                    .cloned()
                    .ok_or_else(|| Error::Query(format!("utxo {k} not found")))
            })
            .collect()
    }

    fn get_transactions(&self, txids: &[String]) -> Result<Vec<Transaction>> {
        let txs = self
            .transactions
            .lock()
            .map_err(|_| Error::Electrum("poisoned".into()))?;
        Ok(txids.iter().filter_map(|t| txs.get(t).cloned()).collect())
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<String> {
        if let Ok(mut b) = self.broadcasted.lock() {
            b.push(tx_hex.to_string());
        }
        FakePsetBackend.transaction_id(tx_hex)
    }

    fn watch_for_account(
        &self,
        account: &str,
        _birthday: u64,
        addresses: Vec<AddressInfo>,
    ) -> Result<()> {
        let mut senders = self
            .senders
            .lock()
            .map_err(|_| Error::Electrum("poisoned".into()))?;
        if !senders.contains_key(account) {
            let (utxo_tx, utxo_rx) = mpsc::unbounded_channel();
            let (tx_tx, tx_rx) = mpsc::unbounded_channel();
            senders.insert(account.to_string(), (utxo_tx, tx_tx));
            if let Ok(mut receivers) = self.receivers.lock() {
                receivers.insert(account.to_string(), (Some(utxo_rx), Some(tx_rx)));
            }
        }
        // Keyed by script, like the electrum watcher.
        if let Ok(mut watched) = self.watched.lock() {
            let entries = watched.entry(account.to_string()).or_default();
            for address in addresses {
                match entries.iter_mut().find(|a| a.script == address.script) {
                    Some(existing) if !address.blinding_key.is_empty() => *existing = address,
                    Some(_) => {}
                    None => entries.push(address),
                }
            }
        }
        Ok(())
    }

    fn watch_for_utxos(&self, account: &str, utxos: Vec<UtxoInfo>) -> Result<()> {
        let addresses = utxos
            .into_iter()
            .map(|u| AddressInfo {
                account: account.to_string(),
                script: hex::encode(u.script),
                ..Default::default()
            })
            .collect();
        self.watch_for_account(account, 0, addresses)
    }

    fn stop_watch_for_account(&self, account: &str) {
        if let Ok(mut watched) = self.watched.lock() {
            watched.remove(account);
        }
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(account);
        }
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.remove(account);
        }
    }

    fn utxo_channel(&self, account: &str) -> Option<UnboundedReceiver<Vec<Utxo>>> {
        self.receivers.lock().ok()?.get_mut(account)?.0.take()
    }

    fn tx_channel(&self, account: &str) -> Option<UnboundedReceiver<Transaction>> {
        self.receivers.lock().ok()?.get_mut(account)?.1.take()
    }

    fn close(&self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }
    }
}

// ── Partial transactions ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeTxOut {
    pub asset: String,
    pub amount: u64,
    pub script: String,
    pub confidential: bool,
}

/// The document standing in for both PSETs and transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeTx {
    pub inputs: Vec<UtxoKey>,
    pub outputs: Vec<FakeTxOut>,
    pub blinded_inputs: Vec<usize>,
    pub signed: bool,
}

impl FakeTx {
    pub fn from_pset(pset: &str) -> Result<Self> {
        serde_json::from_str(pset).map_err(|e| Error::Pset(e.to_string()))
    }

    pub fn from_hex(tx_hex: &str) -> Result<Self> {
        let bytes = hex::decode(tx_hex).map_err(|e| Error::Validation(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Validation(e.to_string()))
    }

    pub fn to_pset(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Pset(e.to_string()))
    }

    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(self.to_pset()?))
    }

    fn add(&mut self, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<()> {
        self.inputs.extend(inputs.iter().map(TxInput::key));
        for output in outputs {
            output.validate()?;
            self.outputs.push(FakeTxOut {
                asset: output.asset.clone(),
                amount: output.amount,
                script: hex::encode(&output.script),
                confidential: output.is_confidential(),
            });
        }
        Ok(())
    }

    /// Total output amount per asset, fee output included.
    pub fn output_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for out in &self.outputs {
            *totals.entry(out.asset.clone()).or_default() += out.amount;
        }
        totals
    }

    /// The output without a script.
    pub fn fee(&self) -> Option<&FakeTxOut> {
        self.outputs.iter().find(|o| o.script.is_empty())
    }
}

/// Builds, blinds and signs [`FakeTx`] documents.
pub struct FakePsetBackend;

impl PsetBackend for FakePsetBackend {
    fn create_pset(&self, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<String> {
        let mut tx = FakeTx::default();
        tx.add(inputs, outputs)?;
        tx.to_pset()
    }

    fn update_pset(&self, pset: &str, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<String> {
        let mut tx = FakeTx::from_pset(pset)?;
        tx.add(inputs, outputs)?;
        tx.to_pset()
    }

    fn blind_pset_with_owned_inputs(
        &self,
        pset: &str,
        owned_inputs: &BTreeMap<usize, TxInput>,
        _last_blinder: bool,
    ) -> Result<String> {
        if owned_inputs.is_empty() {
            return Err(Error::Blinding("no owned inputs".into()));
        }
        let mut tx = FakeTx::from_pset(pset)?;
        tx.blinded_inputs = owned_inputs.keys().copied().collect();
        tx.to_pset()
    }

    fn sign_pset(
        &self,
        pset: &str,
        _mnemonic: &str,
        _derivation_paths: &HashMap<String, String>,
    ) -> Result<String> {
        let mut tx = FakeTx::from_pset(pset)?;
        tx.signed = true;
        tx.to_pset()
    }

    fn sign_transaction(
        &self,
        tx_hex: &str,
        _owned_inputs: &BTreeMap<usize, TxInput>,
        _mnemonic: &str,
        _derivation_paths: &HashMap<String, String>,
    ) -> Result<String> {
        let mut tx = FakeTx::from_hex(tx_hex)?;
        tx.signed = true;
        tx.to_hex()
    }

    fn finalize_and_extract(&self, pset: &str) -> Result<String> {
        let tx = FakeTx::from_pset(pset)?;
        if !tx.signed {
            return Err(Error::Finalize("pset is not signed".into()));
        }
        tx.to_hex()
    }

    fn pset_inputs(&self, pset: &str) -> Result<Vec<UtxoKey>> {
        Ok(FakeTx::from_pset(pset)?.inputs)
    }

    fn transaction_inputs(&self, tx_hex: &str) -> Result<Vec<UtxoKey>> {
        Ok(FakeTx::from_hex(tx_hex)?.inputs)
    }

    fn transaction_id(&self, tx_hex: &str) -> Result<String> {
        Ok(hex::encode(Sha256::digest(tx_hex.as_bytes())))
    }
}
