use std::collections::{BTreeMap, BTreeSet, HashMap};

use lagoon_sdk::{Account, Network, Transaction, Utxo, UtxoKey, UtxoStatus, Wallet};

use crate::error::StoreError;
use crate::models::{
    AccountRow, AccountScriptRow, TransactionAccountRow, TransactionRow, UtxoRow,
    UtxoStateChanges, WalletRow,
};

pub const WALLET_ROW_ID: i32 = 1;

fn status_from_columns(
    txid: Option<String>,
    block_hash: Option<String>,
    block_height: Option<i64>,
    block_time: Option<i64>,
) -> Option<UtxoStatus> {
    Some(UtxoStatus {
        txid: txid?,
        block_hash: block_hash.unwrap_or_default(),
        block_height: block_height.unwrap_or_default() as u64,
        block_time: block_time.unwrap_or_default(),
    })
}

// --- UtxoRow <-> Utxo ---

impl From<UtxoRow> for Utxo {
    fn from(row: UtxoRow) -> Self {
        Utxo {
            key: UtxoKey::new(row.txid, row.vout as u32),
            value: row.value as u64,
            asset: row.asset,
            value_commitment: row.value_commitment,
            asset_commitment: row.asset_commitment,
            value_blinder: row.value_blinder,
            asset_blinder: row.asset_blinder,
            script: row.script,
            nonce: row.nonce,
            range_proof: row.range_proof,
            surjection_proof: row.surjection_proof,
            account_name: row.account_name,
            lock_timestamp: row.lock_timestamp,
            lock_expiry_timestamp: row.lock_expiry_timestamp,
            spent_status: status_from_columns(
                row.spent_txid,
                row.spent_block_hash,
                row.spent_block_height,
                row.spent_block_time,
            ),
            confirmed_status: status_from_columns(
                row.confirmed_txid,
                row.confirmed_block_hash,
                row.confirmed_block_height,
                row.confirmed_block_time,
            ),
        }
    }
}

impl From<&Utxo> for UtxoRow {
    fn from(u: &Utxo) -> Self {
        let state = UtxoStateChanges::from(u);
        UtxoRow {
            txid: u.key.txid.clone(),
            vout: u.key.vout as i32,
            account_name: u.account_name.clone(),
            value: u.value as i64,
            asset: u.asset.clone(),
            value_commitment: u.value_commitment.clone(),
            asset_commitment: u.asset_commitment.clone(),
            value_blinder: u.value_blinder.clone(),
            asset_blinder: u.asset_blinder.clone(),
            script: u.script.clone(),
            nonce: u.nonce.clone(),
            range_proof: u.range_proof.clone(),
            surjection_proof: u.surjection_proof.clone(),
            lock_timestamp: state.lock_timestamp,
            lock_expiry_timestamp: state.lock_expiry_timestamp,
            spent_txid: state.spent_txid,
            spent_block_hash: state.spent_block_hash,
            spent_block_height: state.spent_block_height,
            spent_block_time: state.spent_block_time,
            confirmed_txid: state.confirmed_txid,
            confirmed_block_hash: state.confirmed_block_hash,
            confirmed_block_height: state.confirmed_block_height,
            confirmed_block_time: state.confirmed_block_time,
        }
    }
}

impl From<&Utxo> for UtxoStateChanges {
    fn from(u: &Utxo) -> Self {
        let spent = u.spent_status.as_ref();
        let confirmed = u.confirmed_status.as_ref();
        UtxoStateChanges {
            lock_timestamp: u.lock_timestamp,
            lock_expiry_timestamp: u.lock_expiry_timestamp,
            spent_txid: spent.map(|s| s.txid.clone()),
            spent_block_hash: spent.map(|s| s.block_hash.clone()),
            spent_block_height: spent.map(|s| s.block_height as i64),
            spent_block_time: spent.map(|s| s.block_time),
            confirmed_txid: confirmed.map(|s| s.txid.clone()),
            confirmed_block_hash: confirmed.map(|s| s.block_hash.clone()),
            confirmed_block_height: confirmed.map(|s| s.block_height as i64),
            confirmed_block_time: confirmed.map(|s| s.block_time),
        }
    }
}

// --- TransactionRow <-> Transaction ---

pub fn transaction_from_rows(row: TransactionRow, accounts: Vec<String>) -> Transaction {
    Transaction {
        txid: row.txid,
        tx_hex: row.tx_hex,
        block_hash: row.block_hash,
        block_height: row.block_height as u64,
        block_time: row.block_time,
        accounts: accounts.into_iter().collect::<BTreeSet<_>>(),
    }
}

impl From<&Transaction> for TransactionRow {
    fn from(tx: &Transaction) -> Self {
        TransactionRow {
            txid: tx.txid.clone(),
            tx_hex: tx.tx_hex.clone(),
            block_hash: tx.block_hash.clone(),
            block_height: tx.block_height as i64,
            block_time: tx.block_time,
        }
    }
}

pub fn transaction_account_rows(tx: &Transaction) -> Vec<TransactionAccountRow> {
    tx.accounts
        .iter()
        .map(|account| TransactionAccountRow {
            txid: tx.txid.clone(),
            account_name: account.clone(),
        })
        .collect()
}

// --- Wallet rows <-> Wallet ---

pub fn wallet_from_rows(
    row: WalletRow,
    accounts: Vec<AccountRow>,
    scripts: Vec<AccountScriptRow>,
) -> std::result::Result<Wallet, StoreError> {
    let network: Network = row
        .network
        .parse()
        .map_err(|e: String| StoreError::InvalidData(e))?;

    let mut paths: HashMap<String, HashMap<String, String>> = HashMap::new();
    for script in scripts {
        paths
            .entry(script.account_name)
            .or_default()
            .insert(script.script, script.derivation_path);
    }

    let accounts: BTreeMap<String, Account> = accounts
        .into_iter()
        .map(|a| {
            let account = Account {
                derivation_path_by_script: paths.remove(&a.name).unwrap_or_default(),
                name: a.name.clone(),
                index: a.account_index as u32,
                xpub: a.xpub,
                derivation_path: a.derivation_path,
                next_external_index: a.next_external_index as u32,
                next_internal_index: a.next_internal_index as u32,
                birthday_block: a.birthday_block as u64,
            };
            (a.name, account)
        })
        .collect();

    Ok(Wallet {
        encrypted_mnemonic: row.encrypted_mnemonic,
        password_hash: row.password_hash,
        birthday_block_height: row.birthday_block_height as u64,
        root_path: row.root_path,
        network,
        accounts,
        next_account_index: row.next_account_index as u32,
    })
}

pub fn wallet_row(wallet: &Wallet) -> WalletRow {
    WalletRow {
        id: WALLET_ROW_ID,
        encrypted_mnemonic: wallet.encrypted_mnemonic.clone(),
        password_hash: wallet.password_hash.clone(),
        birthday_block_height: wallet.birthday_block_height as i64,
        root_path: wallet.root_path.clone(),
        network: wallet.network.as_str().to_string(),
        next_account_index: wallet.next_account_index as i64,
    }
}

pub fn account_rows(wallet: &Wallet) -> (Vec<AccountRow>, Vec<AccountScriptRow>) {
    let mut accounts = Vec::new();
    let mut scripts = Vec::new();
    for account in wallet.accounts.values() {
        accounts.push(AccountRow {
            name: account.name.clone(),
            account_index: account.index as i64,
            xpub: account.xpub.clone(),
            derivation_path: account.derivation_path.clone(),
            next_external_index: account.next_external_index as i64,
            next_internal_index: account.next_internal_index as i64,
            birthday_block: account.birthday_block as i64,
        });
        scripts.extend(
            account
                .derivation_path_by_script
                .iter()
                .map(|(script, path)| AccountScriptRow {
                    account_name: account.name.clone(),
                    script: script.clone(),
                    derivation_path: path.clone(),
                }),
        );
    }
    (accounts, scripts)
}
