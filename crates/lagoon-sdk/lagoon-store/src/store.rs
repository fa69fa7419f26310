use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use diesel::prelude::*;
use diesel::sqlite::{Sqlite, SqliteConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use lagoon_sdk::domain::balance_by_asset;
use lagoon_sdk::repository::{publish_utxo_event, transaction_transition};
use lagoon_sdk::{
    Balance, EventBus, Transaction, TransactionEvent, TransactionEventType, TransactionRepository,
    Utxo, UtxoEvent, UtxoEventType, UtxoKey, UtxoRepository, UtxoStatus, Wallet, WalletEvent,
    WalletRepository,
};

use crate::conversions::{
    WALLET_ROW_ID, account_rows, transaction_account_rows, transaction_from_rows, wallet_from_rows,
    wallet_row,
};
use crate::error::StoreError;
use crate::models::{
    AccountRow, AccountScriptRow, TransactionRow, UtxoRow, UtxoStateChanges, WalletRow,
};
use crate::schema::{account_scripts, accounts, transaction_accounts, transactions, utxos, wallet};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type UtxoQuery = utxos::BoxedQuery<'static, Sqlite>;

// --- LagoonStore ---

/// SQLite persistence for the wallet, its coins and its transactions.
///
/// One store backs all three repositories. Every repository call runs in a
/// single SQL transaction on the shared connection, and the resulting events
/// are published only once that transaction has committed.
pub struct LagoonStore {
    conn: Mutex<SqliteConnection>,
    utxo_events: EventBus<UtxoEvent>,
    tx_events: EventBus<TransactionEvent>,
    wallet_events: EventBus<WalletEvent>,
}

impl LagoonStore {
    /// Open (or create) a store at the given file path. Runs migrations automatically.
    pub fn open(path: &str) -> crate::Result<Self> {
        let conn = SqliteConnection::establish(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store for tests.
    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = SqliteConnection::establish(":memory:")?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: SqliteConnection) -> crate::Result<Self> {
        diesel::sql_query("PRAGMA foreign_keys = ON").execute(&mut conn)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(LagoonStore {
            conn: Mutex::new(conn),
            utxo_events: EventBus::new(),
            tx_events: EventBus::new(),
            wallet_events: EventBus::new(),
        })
    }

    fn conn(&self) -> crate::Result<MutexGuard<'_, SqliteConnection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` in one SQL transaction.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut SqliteConnection) -> crate::Result<T>,
    ) -> crate::Result<T> {
        let mut conn = self.conn()?;
        conn.transaction(f)
    }

    // ==================== UTXO internals ====================

    fn load_utxos(
        &self,
        filter: impl FnOnce(UtxoQuery) -> UtxoQuery,
    ) -> crate::Result<Vec<Utxo>> {
        let query = filter(utxos::table.into_boxed());
        let rows: Vec<UtxoRow> = query
            .select(UtxoRow::as_select())
            .load(&mut *self.conn()?)?;
        Ok(rows.into_iter().map(Utxo::from).collect())
    }

    /// Applies `transition` to every stored key in one transaction and
    /// publishes one event for the coins that actually changed.
    fn update_utxos(
        &self,
        keys: &[UtxoKey],
        event_type: UtxoEventType,
        transition: impl Fn(&mut Utxo) -> bool,
    ) -> crate::Result<usize> {
        let changed = self.transact(|conn| {
            let mut changed = Vec::new();
            for key in keys {
                let Some(mut utxo) = find_utxo(conn, key)? else {
                    continue;
                };
                if !transition(&mut utxo) {
                    continue;
                }
                diesel::update(utxos::table.find((&key.txid, key.vout as i32)))
                    .set(&UtxoStateChanges::from(&utxo))
                    .execute(conn)?;
                changed.push(utxo);
            }
            Ok(changed)
        })?;
        publish_utxo_event(&self.utxo_events, event_type, &changed);
        Ok(changed.len())
    }

    // ==================== Transaction internals ====================

    fn publish_tx(&self, event_type: TransactionEventType, transaction: Transaction) {
        self.tx_events.publish(TransactionEvent {
            event_type,
            transaction,
        });
    }
}

fn find_utxo(conn: &mut SqliteConnection, key: &UtxoKey) -> crate::Result<Option<Utxo>> {
    let row: Option<UtxoRow> = utxos::table
        .find((&key.txid, key.vout as i32))
        .select(UtxoRow::as_select())
        .first(conn)
        .optional()?;
    Ok(row.map(Utxo::from))
}

fn find_transaction(conn: &mut SqliteConnection, txid: &str) -> crate::Result<Transaction> {
    let row: TransactionRow = transactions::table
        .find(txid)
        .select(TransactionRow::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| lagoon_sdk::Error::TransactionNotFound(txid.to_string()))?;
    let accounts: Vec<String> = transaction_accounts::table
        .filter(transaction_accounts::txid.eq(txid))
        .select(transaction_accounts::account_name)
        .order(transaction_accounts::account_name)
        .load(conn)?;
    Ok(transaction_from_rows(row, accounts))
}

fn write_transaction(conn: &mut SqliteConnection, tx: &Transaction) -> crate::Result<()> {
    diesel::update(transactions::table.find(&tx.txid))
        .set(&TransactionRow::from(tx))
        .execute(conn)?;
    diesel::insert_or_ignore_into(transaction_accounts::table)
        .values(&transaction_account_rows(tx))
        .execute(conn)?;
    Ok(())
}

fn find_wallet(conn: &mut SqliteConnection) -> crate::Result<Wallet> {
    let row: WalletRow = wallet::table
        .find(WALLET_ROW_ID)
        .select(WalletRow::as_select())
        .first(conn)
        .optional()?
        .ok_or(lagoon_sdk::Error::WalletNotInitialized)?;
    let account_rows: Vec<AccountRow> = accounts::table
        .select(AccountRow::as_select())
        .load(conn)?;
    let script_rows: Vec<AccountScriptRow> = account_scripts::table
        .select(AccountScriptRow::as_select())
        .load(conn)?;
    wallet_from_rows(row, account_rows, script_rows)
}

/// Replaces the stored accounts with the wallet's.
fn write_accounts(conn: &mut SqliteConnection, wallet: &Wallet) -> crate::Result<()> {
    let (account_rows, script_rows) = account_rows(wallet);
    diesel::delete(account_scripts::table).execute(conn)?;
    diesel::delete(accounts::table).execute(conn)?;
    diesel::insert_into(accounts::table)
        .values(&account_rows)
        .execute(conn)?;
    diesel::insert_into(account_scripts::table)
        .values(&script_rows)
        .execute(conn)?;
    Ok(())
}

// ==================== UtxoRepository ====================

impl UtxoRepository for LagoonStore {
    fn add_utxos(&self, new_utxos: Vec<Utxo>) -> lagoon_sdk::Result<usize> {
        let added = self.transact(|conn| {
            let mut added = Vec::new();
            for utxo in new_utxos {
                let inserted = diesel::insert_or_ignore_into(utxos::table)
                    .values(&UtxoRow::from(&utxo))
                    .execute(conn)?;
                if inserted > 0 {
                    added.push(utxo);
                }
            }
            Ok(added)
        })?;
        publish_utxo_event(&self.utxo_events, UtxoEventType::Added, &added);
        Ok(added.len())
    }

    fn get_all_utxos(&self) -> lagoon_sdk::Result<Vec<Utxo>> {
        Ok(self.load_utxos(|q| q)?)
    }

    fn get_spendable_utxos(&self) -> lagoon_sdk::Result<Vec<Utxo>> {
        Ok(self.load_utxos(spendable)?)
    }

    fn get_all_utxos_for_account(&self, account: &str) -> lagoon_sdk::Result<Vec<Utxo>> {
        let account = account.to_string();
        Ok(self.load_utxos(|q| q.filter(utxos::account_name.eq(account)))?)
    }

    fn get_spendable_utxos_for_account(&self, account: &str) -> lagoon_sdk::Result<Vec<Utxo>> {
        let account = account.to_string();
        Ok(self.load_utxos(|q| spendable(q).filter(utxos::account_name.eq(account)))?)
    }

    fn get_locked_utxos_for_account(&self, account: &str) -> lagoon_sdk::Result<Vec<Utxo>> {
        let account = account.to_string();
        Ok(self.load_utxos(|q| {
            q.filter(utxos::account_name.eq(account))
                .filter(utxos::lock_timestamp.gt(0))
        })?)
    }

    fn get_utxos_by_key(&self, keys: &[UtxoKey]) -> lagoon_sdk::Result<Vec<Utxo>> {
        let mut conn = self.conn()?;
        let mut found = Vec::new();
        for key in keys {
            if let Some(utxo) = find_utxo(&mut conn, key)? {
                found.push(utxo);
            }
        }
        Ok(found)
    }

    fn get_balance_for_account(&self, account: &str) -> lagoon_sdk::Result<HashMap<String, Balance>> {
        let utxos = self.get_all_utxos_for_account(account)?;
        Ok(balance_by_asset(&utxos))
    }

    fn lock_utxos(
        &self,
        keys: &[UtxoKey],
        timestamp: i64,
        expiry_timestamp: i64,
    ) -> lagoon_sdk::Result<usize> {
        Ok(self.update_utxos(keys, UtxoEventType::Locked, |u| {
            u.lock(timestamp, expiry_timestamp)
        })?)
    }

    fn unlock_utxos(&self, keys: &[UtxoKey]) -> lagoon_sdk::Result<usize> {
        Ok(self.update_utxos(keys, UtxoEventType::Unlocked, Utxo::unlock)?)
    }

    fn spend_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> lagoon_sdk::Result<usize> {
        Ok(self.update_utxos(keys, UtxoEventType::Spent, |u| {
            if u.is_spent() {
                return false;
            }
            u.spend(status.clone());
            true
        })?)
    }

    fn confirm_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> lagoon_sdk::Result<usize> {
        Ok(self.update_utxos(keys, UtxoEventType::Confirmed, |u| {
            !u.is_confirmed() && u.confirm(status.clone()).is_ok()
        })?)
    }

    fn delete_utxos_for_account(&self, account: &str) -> lagoon_sdk::Result<()> {
        diesel::delete(utxos::table.filter(utxos::account_name.eq(account)))
            .execute(&mut *self.conn()?)
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn events(&self) -> &EventBus<UtxoEvent> {
        &self.utxo_events
    }
}

/// Confirmed, unlocked and unspent.
fn spendable(q: UtxoQuery) -> UtxoQuery {
    q.filter(utxos::confirmed_txid.is_not_null())
        .filter(utxos::lock_timestamp.eq(0))
        .filter(utxos::spent_txid.is_null())
}

// ==================== TransactionRepository ====================

impl TransactionRepository for LagoonStore {
    fn add_transaction(&self, tx: Transaction) -> lagoon_sdk::Result<bool> {
        let inserted = self.transact(|conn| {
            let inserted = diesel::insert_or_ignore_into(transactions::table)
                .values(&TransactionRow::from(&tx))
                .execute(conn)?;
            if inserted == 0 {
                return Ok(false);
            }
            diesel::insert_into(transaction_accounts::table)
                .values(&transaction_account_rows(&tx))
                .execute(conn)?;
            Ok(true)
        })?;
        if inserted {
            self.publish_tx(TransactionEventType::Added, tx);
        }
        Ok(inserted)
    }

    fn confirm_transaction(
        &self,
        txid: &str,
        block_hash: &str,
        block_height: u64,
        block_time: i64,
    ) -> lagoon_sdk::Result<bool> {
        let confirmed = self.transact(|conn| {
            let mut tx = find_transaction(conn, txid)?;
            if tx.is_confirmed() {
                return Ok(None);
            }
            tx.confirm(block_hash, block_height, block_time);
            write_transaction(conn, &tx)?;
            Ok(Some(tx))
        })?;
        match confirmed {
            Some(tx) => {
                self.publish_tx(TransactionEventType::Confirmed, tx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_transaction(&self, txid: &str) -> lagoon_sdk::Result<Transaction> {
        Ok(find_transaction(&mut *self.conn()?, txid)?)
    }

    fn update_transaction(
        &self,
        txid: &str,
        update: &mut dyn FnMut(&mut Transaction) -> lagoon_sdk::Result<()>,
    ) -> lagoon_sdk::Result<()> {
        let (before, after) = self.transact(|conn| {
            let before = find_transaction(conn, txid)?;
            let mut after = before.clone();
            update(&mut after)?;
            write_transaction(conn, &after)?;
            Ok((before, after))
        })?;
        if let Some(event_type) = transaction_transition(&before, &after) {
            self.publish_tx(event_type, after);
        }
        Ok(())
    }

    fn events(&self) -> &EventBus<TransactionEvent> {
        &self.tx_events
    }
}

// ==================== WalletRepository ====================

impl WalletRepository for LagoonStore {
    fn create_wallet(&self, new_wallet: Wallet) -> lagoon_sdk::Result<()> {
        Ok(self.transact(|conn| {
            let inserted = diesel::insert_or_ignore_into(wallet::table)
                .values(&wallet_row(&new_wallet))
                .execute(conn)?;
            if inserted == 0 {
                return Err(lagoon_sdk::Error::WalletAlreadyInitialized.into());
            }
            write_accounts(conn, &new_wallet)
        })?)
    }

    fn get_wallet(&self) -> lagoon_sdk::Result<Wallet> {
        Ok(find_wallet(&mut *self.conn()?)?)
    }

    fn update_wallet(
        &self,
        update: &mut dyn FnMut(&mut Wallet) -> lagoon_sdk::Result<()>,
    ) -> lagoon_sdk::Result<()> {
        Ok(self.transact(|conn| {
            let mut current = find_wallet(conn)?;
            update(&mut current)?;
            diesel::update(wallet::table.find(WALLET_ROW_ID))
                .set(&wallet_row(&current))
                .execute(conn)?;
            write_accounts(conn, &current)
        })?)
    }

    fn events(&self) -> &EventBus<WalletEvent> {
        &self.wallet_events
    }
}
