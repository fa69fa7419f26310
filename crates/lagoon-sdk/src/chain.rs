use std::collections::HashMap;
use std::sync::Mutex;

use lwk_wollet::elements::encode::{deserialize, serialize};
use lwk_wollet::elements::{Transaction as ElementsTransaction, Txid};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::chain_watcher::{
    AccountChannels, ChainWatcherConfig, ChainWatcherHandle, WatchCmd, spawn_chain_watcher,
};
use crate::domain::{AddressInfo, Transaction, Utxo, UtxoInfo, UtxoKey};
use crate::error::{Error, Result};

/// Source of chain data and sink for broadcasts.
///
/// Accounts being watched get two report channels: batches of coins (new,
/// confirmed or spent, one kind per batch) and transactions touching them.
pub trait ChainObserver: Send + Sync {
    /// Hash and height of the chain tip.
    fn get_latest_block(&self) -> Result<(String, u64)>;

    /// Outputs referenced by `keys`, wallet-owned or not. Values of
    /// confidential outputs are not revealed.
    fn get_utxos(&self, keys: &[UtxoKey]) -> Result<Vec<Utxo>>;

    fn get_transactions(&self, txids: &[String]) -> Result<Vec<Transaction>>;

    /// Broadcast a raw transaction and return its txid.
    fn broadcast_transaction(&self, tx_hex: &str) -> Result<String>;

    /// Start (or extend) watching the addresses of `account`.
    fn watch_for_account(
        &self,
        account: &str,
        birthday: u64,
        addresses: Vec<AddressInfo>,
    ) -> Result<()>;

    /// Watch the scripts of already known coins so their spends are reported.
    fn watch_for_utxos(&self, account: &str, utxos: Vec<UtxoInfo>) -> Result<()>;

    fn stop_watch_for_account(&self, account: &str);

    /// Coin reports for `account`. Handed out once per watch.
    fn utxo_channel(&self, account: &str) -> Option<UnboundedReceiver<Vec<Utxo>>>;

    /// Transaction reports for `account`. Handed out once per watch.
    fn tx_channel(&self, account: &str) -> Option<UnboundedReceiver<Transaction>>;

    fn close(&self);
}

// ── Electrum ────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingReceivers {
    utxos: Option<UnboundedReceiver<Vec<Utxo>>>,
    transactions: Option<UnboundedReceiver<Transaction>>,
}

/// Electrum-based chain observer for Liquid.
///
/// Lookups and broadcasts open a short-lived connection per call. Account
/// watching is delegated to the chain watcher thread.
pub struct ElectrumObserver {
    electrum_url: String,
    watcher: ChainWatcherHandle,
    receivers: Mutex<HashMap<String, PendingReceivers>>,
}

impl ElectrumObserver {
    pub fn new(config: ChainWatcherConfig) -> Result<Self> {
        let electrum_url = config.electrum_url.clone();
        let watcher = spawn_chain_watcher(config)?;
        Ok(Self {
            electrum_url,
            watcher,
            receivers: Mutex::new(HashMap::new()),
        })
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    fn raw_client(&self) -> Result<electrum_client::Client> {
        electrum_client::Client::new(&self.electrum_url).map_err(|e| Error::Electrum(e.to_string()))
    }

    fn lwk_client(&self) -> Result<lwk_wollet::ElectrumClient> {
        let url: lwk_wollet::ElectrumUrl = self
            .electrum_url
            .parse()
            .map_err(|e| Error::Electrum(format!("{:?}", e)))?;
        lwk_wollet::ElectrumClient::new(&url).map_err(|e| Error::Electrum(e.to_string()))
    }

    fn fetch_transactions(&self, txids: &[String]) -> Result<Vec<ElementsTransaction>> {
        use lwk_wollet::blocking::BlockchainBackend;

        let ids = txids
            .iter()
            .map(|t| {
                t.parse::<Txid>()
                    .map_err(|e| Error::Validation(format!("invalid txid {t}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let client = self.lwk_client()?;
        client
            .get_transactions(&ids)
            .map_err(|e| Error::Electrum(e.to_string()))
    }
}

impl ChainObserver for ElectrumObserver {
    fn get_latest_block(&self) -> Result<(String, u64)> {
        use electrum_client::ElectrumApi;
        use lwk_wollet::elements::BlockHeader;

        let client = self.raw_client()?;
        let tip = client
            .block_headers_subscribe_raw()
            .map_err(|e| Error::Electrum(e.to_string()))?;
        let header: BlockHeader = deserialize(&tip.header)
            .map_err(|e| Error::Electrum(format!("bad header: {e}")))?;
        Ok((header.block_hash().to_string(), tip.height as u64))
    }

    fn get_utxos(&self, keys: &[UtxoKey]) -> Result<Vec<Utxo>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut txids: Vec<String> = keys.iter().map(|k| k.txid.clone()).collect();
        txids.sort();
        txids.dedup();
        let txs: HashMap<String, ElementsTransaction> = self
            .fetch_transactions(&txids)?
            .into_iter()
            .map(|tx| (tx.txid().to_string(), tx))
            .collect();

        let mut utxos = Vec::with_capacity(keys.len());
        for key in keys {
            let out = txs
                .get(&key.txid)
                .and_then(|tx| tx.output.get(key.vout as usize))
                .ok_or_else(|| Error::Query(format!("utxo {key} not found")))?;
            let mut utxo = Utxo {
                key: key.clone(),
                script: out.script_pubkey.to_bytes(),
                ..Default::default()
            };
            match (out.value.explicit(), out.asset.explicit()) {
                (Some(value), Some(asset)) => {
                    utxo.value = value;
                    utxo.asset = asset.to_string();
                }
                _ => {
                    utxo.value_commitment = serialize(&out.value);
                    utxo.asset_commitment = serialize(&out.asset);
                    utxo.nonce = serialize(&out.nonce);
                }
            }
            utxos.push(utxo);
        }
        Ok(utxos)
    }

    fn get_transactions(&self, txids: &[String]) -> Result<Vec<Transaction>> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .fetch_transactions(txids)?
            .into_iter()
            .map(|tx| Transaction {
                txid: tx.txid().to_string(),
                tx_hex: hex::encode(serialize(&tx)),
                ..Default::default()
            })
            .collect())
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<String> {
        use lwk_wollet::blocking::BlockchainBackend;

        let bytes = hex::decode(tx_hex).map_err(|e| Error::Validation(format!("tx hex: {e}")))?;
        let tx: ElementsTransaction =
            deserialize(&bytes).map_err(|e| Error::Validation(format!("transaction: {e}")))?;
        let client = self.lwk_client()?;
        let txid = client
            .broadcast(&tx)
            .map_err(|e| Error::Broadcast(e.to_string()))?;
        Ok(txid.to_string())
    }

    fn watch_for_account(
        &self,
        account: &str,
        birthday: u64,
        addresses: Vec<AddressInfo>,
    ) -> Result<()> {
        let mut receivers = self
            .receivers
            .lock()
            .map_err(|_| Error::Electrum("observer state poisoned".into()))?;

        let channels = if receivers.contains_key(account) {
            None
        } else {
            let (utxo_tx, utxo_rx) = tokio::sync::mpsc::unbounded_channel();
            let (tx_tx, tx_rx) = tokio::sync::mpsc::unbounded_channel();
            receivers.insert(
                account.to_string(),
                PendingReceivers {
                    utxos: Some(utxo_rx),
                    transactions: Some(tx_rx),
                },
            );
            Some(AccountChannels {
                utxos: utxo_tx,
                transactions: tx_tx,
            })
        };

        self.watcher.send(WatchCmd::WatchAccount {
            account: account.to_string(),
            birthday,
            addresses,
            channels,
        });
        Ok(())
    }

    fn watch_for_utxos(&self, account: &str, utxos: Vec<UtxoInfo>) -> Result<()> {
        // Spends show up in the history of the coin script, which is one of
        // the account addresses. Watching the script is all it takes.
        let addresses = utxos
            .into_iter()
            .filter(|u| !u.script.is_empty())
            .map(|u| AddressInfo {
                account: account.to_string(),
                script: hex::encode(&u.script),
                ..Default::default()
            })
            .collect();
        self.watch_for_account(account, 0, addresses)
    }

    fn stop_watch_for_account(&self, account: &str) {
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.remove(account);
        }
        self.watcher.send(WatchCmd::StopAccount {
            account: account.to_string(),
        });
    }

    fn utxo_channel(&self, account: &str) -> Option<UnboundedReceiver<Vec<Utxo>>> {
        self.receivers
            .lock()
            .ok()?
            .get_mut(account)
            .and_then(|r| r.utxos.take())
    }

    fn tx_channel(&self, account: &str) -> Option<UnboundedReceiver<Transaction>> {
        self.receivers
            .lock()
            .ok()?
            .get_mut(account)
            .and_then(|r| r.transactions.take())
    }

    fn close(&self) {
        self.watcher.shutdown();
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.clear();
        }
    }
}
