//! `ChainWatcher`: polling Electrum relay for watched accounts.
//!
//! Every poll fetches the history of each watched script and diffs it with
//! the previous one. New transactions and transactions that just confirmed
//! are turned into utxo batches (added, confirmed, spent) and transaction
//! reports, pushed to the per-account channels handed out by
//! [`ElectrumObserver`](crate::chain::ElectrumObserver).
//!
//! The watcher runs on a **dedicated OS thread** because
//! `electrum_client::Client` is `!Send`.  Communication with the
//! async services uses `tokio::sync::mpsc` channels.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use electrum_client::{ElectrumApi, Param};
use lwk_wollet::elements::confidential::{Asset, Nonce, Value as ConfValue};
use lwk_wollet::elements::encode::{deserialize, serialize};
use lwk_wollet::elements::secp256k1_zkp::{self, SecretKey};
use lwk_wollet::elements::{BlockHeader, Transaction as ElementsTransaction, TxOut};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::domain::{AddressInfo, Transaction, Utxo, UtxoKey, UtxoStatus};
use crate::error::{Error, Result};

// ── Public types ────────────────────────────────────────────────────

/// Commands sent from the observer to the watcher thread.
#[derive(Debug)]
pub enum WatchCmd {
    WatchAccount {
        account: String,
        birthday: u64,
        addresses: Vec<AddressInfo>,
        channels: Option<AccountChannels>,
    },
    StopAccount {
        account: String,
    },
    Shutdown,
}

/// Sending halves of the per-account report channels.
#[derive(Debug)]
pub struct AccountChannels {
    pub utxos: UnboundedSender<Vec<Utxo>>,
    pub transactions: UnboundedSender<Transaction>,
}

/// Configuration for the chain watcher.
#[derive(Debug, Clone)]
pub struct ChainWatcherConfig {
    pub electrum_url: String,
    /// Poll interval for script histories (default: 5s).
    pub poll_interval: Duration,
    /// Maximum reconnection backoff (default: 60s).
    pub max_backoff: Duration,
}

impl ChainWatcherConfig {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            poll_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Handle for sending commands to a running watcher thread.
#[derive(Clone)]
pub struct ChainWatcherHandle {
    cmd_tx: UnboundedSender<WatchCmd>,
}

impl ChainWatcherHandle {
    pub fn send(&self, cmd: WatchCmd) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Shut down the watcher thread.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(WatchCmd::Shutdown);
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Electrum script hash = SHA256(scriptPubKey) with reversed byte order.
pub(crate) fn script_hash(script: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hash = Sha256::digest(script).to_vec();
    hash.reverse();
    hex::encode(hash)
}

pub(crate) fn fetch_transaction(
    client: &electrum_client::Client,
    txid: &str,
) -> Result<ElementsTransaction> {
    let resp = client
        .raw_call(
            "blockchain.transaction.get",
            [Param::String(txid.to_string())],
        )
        .map_err(|e| Error::Electrum(e.to_string()))?;
    let tx_hex = resp
        .as_str()
        .ok_or_else(|| Error::Electrum("expected tx hex".into()))?;
    let bytes = hex::decode(tx_hex).map_err(|e| Error::Electrum(e.to_string()))?;
    deserialize(&bytes).map_err(|e| Error::Electrum(format!("bad transaction: {e}")))
}

/// (hash, time) of the block at `height`.
pub(crate) fn fetch_block(client: &electrum_client::Client, height: u64) -> Result<(String, i64)> {
    let resp = client
        .raw_call("blockchain.block.header", [Param::Usize(height as usize)])
        .map_err(|e| Error::Electrum(e.to_string()))?;
    let header_hex = resp
        .as_str()
        .ok_or_else(|| Error::Electrum("expected header hex".into()))?;
    let bytes = hex::decode(header_hex).map_err(|e| Error::Electrum(e.to_string()))?;
    let header: BlockHeader =
        deserialize(&bytes).map_err(|e| Error::Electrum(format!("bad header: {e}")))?;
    Ok((header.block_hash().to_string(), header.time as i64))
}

/// Txid -> height of every transaction touching the script. Heights <= 0
/// mean mempool.
pub(crate) fn fetch_history(
    client: &electrum_client::Client,
    script_hash: &str,
) -> Result<HashMap<String, i64>> {
    let resp = client
        .raw_call(
            "blockchain.scripthash.get_history",
            [Param::String(script_hash.to_string())],
        )
        .map_err(|e| Error::Electrum(e.to_string()))?;
    let entries = resp
        .as_array()
        .ok_or_else(|| Error::Electrum("expected array response".into()))?;

    let mut history = HashMap::new();
    for entry in entries {
        let txid = entry["tx_hash"]
            .as_str()
            .ok_or_else(|| Error::Electrum("missing tx_hash".into()))?;
        let height = entry["height"]
            .as_i64()
            .ok_or_else(|| Error::Electrum("missing height".into()))?;
        history.insert(txid.to_string(), height);
    }
    Ok(history)
}

/// Coin for `txout`, with commitments kept and values revealed through
/// `blinding_key` when confidential.
pub(crate) fn utxo_from_txout(
    key: UtxoKey,
    txout: &TxOut,
    account: &str,
    blinding_key: &[u8],
) -> Result<Utxo> {
    let mut utxo = Utxo {
        key,
        script: txout.script_pubkey.to_bytes(),
        account_name: account.to_string(),
        ..Default::default()
    };

    match (txout.value, txout.asset) {
        (ConfValue::Explicit(value), Asset::Explicit(asset)) => {
            utxo.value = value;
            utxo.asset = asset.to_string();
        }
        _ => {
            utxo.value_commitment = serialize(&txout.value);
            utxo.asset_commitment = serialize(&txout.asset);
            if !matches!(txout.nonce, Nonce::Null) {
                utxo.nonce = serialize(&txout.nonce);
            }
            let sk = SecretKey::from_slice(blinding_key)
                .map_err(|e| Error::Blinding(format!("blinding key: {e}")))?;
            let secp = secp256k1_zkp::Secp256k1::new();
            let secrets = txout
                .unblind(&secp, sk)
                .map_err(|e| Error::Blinding(format!("unblind: {e:?}")))?;
            utxo.value = secrets.value;
            utxo.asset = secrets.asset.to_string();
            utxo.asset_blinder = secrets.asset_bf.into_inner().as_ref().to_vec();
            utxo.value_blinder = secrets.value_bf.into_inner().as_ref().to_vec();
        }
    }
    Ok(utxo)
}

// ── Internals ───────────────────────────────────────────────────────

struct AccountWatch {
    birthday: u64,
    /// Script hash -> address.
    addresses: HashMap<String, AddressInfo>,
    /// Script hash -> (txid -> height) as of the last poll.
    history: HashMap<String, HashMap<String, i64>>,
    channels: AccountChannels,
}

/// Per-poll changes of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxChange {
    Added,
    Confirmed,
}

/// Try to connect to the Electrum server with exponential backoff.
///
/// Returns `None` if a `Shutdown` command arrives while waiting to connect.
fn connect_with_backoff(
    url: &str,
    max_backoff: Duration,
    cmd_rx: &mut UnboundedReceiver<WatchCmd>,
    accounts: &mut HashMap<String, AccountWatch>,
) -> Option<electrum_client::Client> {
    let mut backoff = Duration::from_secs(1);
    loop {
        match electrum_client::Client::new(url) {
            Ok(client) => return Some(client),
            Err(e) => {
                log::warn!("chain_watcher: connect failed ({e}), retrying in {backoff:?}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);

                // Keep applying commands while disconnected, exit on Shutdown
                while let Ok(cmd) = cmd_rx.try_recv() {
                    if !apply_command(cmd, accounts) {
                        log::info!("chain_watcher: shutdown during reconnect");
                        return None;
                    }
                }
            }
        }
    }
}

/// Returns false on shutdown.
fn apply_command(cmd: WatchCmd, accounts: &mut HashMap<String, AccountWatch>) -> bool {
    match cmd {
        WatchCmd::WatchAccount {
            account,
            birthday,
            addresses,
            channels,
        } => {
            if !accounts.contains_key(&account) {
                let Some(channels) = channels else {
                    log::warn!("chain_watcher: no channels for new account {account}");
                    return true;
                };
                accounts.insert(
                    account.clone(),
                    AccountWatch {
                        birthday,
                        addresses: HashMap::new(),
                        history: HashMap::new(),
                        channels,
                    },
                );
            }
            if let Some(watch) = accounts.get_mut(&account) {
                for addr in addresses {
                    let Ok(script) = hex::decode(&addr.script) else {
                        log::warn!("chain_watcher: invalid script {}", addr.script);
                        continue;
                    };
                    let entry = watch.addresses.entry(script_hash(&script));
                    match entry {
                        std::collections::hash_map::Entry::Occupied(mut e) => {
                            // Keep the blinding key of an already watched address.
                            if !addr.blinding_key.is_empty() {
                                e.insert(addr);
                            }
                        }
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(addr);
                        }
                    }
                }
                log::debug!(
                    "chain_watcher: watching {} address(es) for account {account}",
                    watch.addresses.len()
                );
            }
            true
        }
        WatchCmd::StopAccount { account } => {
            accounts.remove(&account);
            log::debug!("chain_watcher: stopped watching account {account}");
            true
        }
        WatchCmd::Shutdown => false,
    }
}

/// Collects the txs whose history entry appeared or got confirmed since the
/// last poll, skipping confirmed ones older than the account birthday.
fn diff_history(
    previous: Option<&HashMap<String, i64>>,
    current: &HashMap<String, i64>,
    birthday: u64,
) -> Vec<(String, i64, TxChange)> {
    let mut changes = Vec::new();
    for (txid, height) in current {
        if *height > 0 && (*height as u64) < birthday {
            continue;
        }
        match previous.and_then(|p| p.get(txid)) {
            None => changes.push((txid.clone(), *height, TxChange::Added)),
            Some(prev) if *prev <= 0 && *height > 0 => {
                changes.push((txid.clone(), *height, TxChange::Confirmed))
            }
            _ => {}
        }
    }
    changes.sort_by_key(|(_, height, _)| if *height <= 0 { i64::MAX } else { *height });
    changes
}

/// Emits the reports for one changed transaction of `account`.
fn report_transaction(
    client: &electrum_client::Client,
    account: &str,
    watch: &AccountWatch,
    txid: &str,
    height: i64,
    change: TxChange,
) -> Result<()> {
    let tx = fetch_transaction(client, txid)?;
    let (block_hash, block_time) = if height > 0 {
        fetch_block(client, height as u64)?
    } else {
        (String::new(), 0)
    };
    let block_height = height.max(0) as u64;
    let status = UtxoStatus::new(txid, block_height, block_time, block_hash.clone());

    // Inputs spending our coins. The prevout is fetched to check ownership.
    let mut spent = Vec::new();
    for input in &tx.input {
        let key = UtxoKey::new(
            input.previous_output.txid.to_string(),
            input.previous_output.vout,
        );
        let owned = match fetch_transaction(client, &key.txid) {
            Ok(prev) => prev
                .output
                .get(key.vout as usize)
                .map(|out| {
                    watch
                        .addresses
                        .contains_key(&script_hash(out.script_pubkey.as_bytes()))
                })
                .unwrap_or(false),
            Err(_) => continue,
        };
        if owned {
            spent.push(Utxo {
                key,
                account_name: account.to_string(),
                spent_status: Some(status.clone()),
                ..Default::default()
            });
        }
    }

    // Outputs paying to our addresses.
    let mut received = Vec::new();
    for (vout, out) in tx.output.iter().enumerate() {
        if out.script_pubkey.is_empty() {
            continue;
        }
        let Some(addr) = watch
            .addresses
            .get(&script_hash(out.script_pubkey.as_bytes()))
        else {
            continue;
        };
        let key = UtxoKey::new(txid, vout as u32);
        match change {
            TxChange::Added => match utxo_from_txout(key, out, account, &addr.blinding_key) {
                Ok(mut utxo) => {
                    if height > 0 {
                        utxo.confirmed_status = Some(status.clone());
                    }
                    received.push(utxo);
                }
                Err(e) => log::warn!("chain_watcher: failed to unblind output {txid}:{vout}: {e}"),
            },
            TxChange::Confirmed => received.push(Utxo {
                key,
                account_name: account.to_string(),
                confirmed_status: Some(status.clone()),
                ..Default::default()
            }),
        }
    }

    let mut accounts = BTreeSet::new();
    accounts.insert(account.to_string());
    let _ = watch.channels.transactions.send(Transaction {
        txid: txid.to_string(),
        tx_hex: hex::encode(serialize(&tx)),
        block_hash,
        block_height,
        block_time,
        accounts,
    });
    if !received.is_empty() {
        let _ = watch.channels.utxos.send(received);
    }
    if !spent.is_empty() {
        let _ = watch.channels.utxos.send(spent);
    }
    Ok(())
}

fn poll_accounts(client: &electrum_client::Client, accounts: &mut HashMap<String, AccountWatch>) {
    for (account, watch) in accounts.iter_mut() {
        let script_hashes: Vec<String> = watch.addresses.keys().cloned().collect();
        for hash in script_hashes {
            let current = match fetch_history(client, &hash) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("chain_watcher: failed to get history for script hash {hash}: {e}");
                    continue;
                }
            };
            let changes = diff_history(watch.history.get(&hash), &current, watch.birthday);

            let mut failed = false;
            for (txid, height, change) in changes {
                if let Err(e) = report_transaction(client, account, watch, &txid, height, change) {
                    log::warn!("chain_watcher: failed to process tx {txid}: {e}");
                    failed = true;
                }
            }
            // Retry the whole script on the next poll if anything went wrong.
            if !failed {
                watch.history.insert(hash, current);
            }
        }
    }
}

// ── Spawn ───────────────────────────────────────────────────────────

/// Spawn the chain watcher on a dedicated OS thread.
pub fn spawn_chain_watcher(config: ChainWatcherConfig) -> Result<ChainWatcherHandle> {
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("chain-watcher".into())
        .spawn(move || {
            watcher_thread_main(config, cmd_rx);
        })
        .map_err(|e| Error::Electrum(format!("failed to spawn chain-watcher thread: {e}")))?;

    Ok(ChainWatcherHandle { cmd_tx })
}

/// Main loop of the watcher thread.
fn watcher_thread_main(config: ChainWatcherConfig, mut cmd_rx: UnboundedReceiver<WatchCmd>) {
    let mut accounts: HashMap<String, AccountWatch> = HashMap::new();
    let mut client = match connect_with_backoff(
        &config.electrum_url,
        config.max_backoff,
        &mut cmd_rx,
        &mut accounts,
    ) {
        Some(c) => c,
        None => return,
    };

    log::info!("chain_watcher: connected to {}", config.electrum_url);

    loop {
        // 1. Drain all pending commands (non-blocking)
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => {
                    if !apply_command(cmd, &mut accounts) {
                        log::info!("chain_watcher: shutting down");
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::info!("chain_watcher: command channel closed, shutting down");
                    return;
                }
            }
        }

        // 2. Ping to detect a dropped connection
        let alive = client
            .raw_call("server.ping", Vec::<Param>::new())
            .is_ok();

        if !alive {
            log::warn!("chain_watcher: connection lost, reconnecting...");
            client = match connect_with_backoff(
                &config.electrum_url,
                config.max_backoff,
                &mut cmd_rx,
                &mut accounts,
            ) {
                Some(c) => c,
                None => return,
            };
            log::info!("chain_watcher: reconnected");
            continue;
        }

        // 3. Diff script histories and report changes
        poll_accounts(&client, &mut accounts);

        // 4. Sleep before next poll
        std::thread::sleep(config.poll_interval);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
