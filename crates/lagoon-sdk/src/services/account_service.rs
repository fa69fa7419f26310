//! Accounts, their addresses and coins.
//!
//! Besides the account operations, the service keeps the chain observer in
//! sync with the wallet (which accounts and addresses to watch) and applies
//! the observer's reports to the stores.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use super::{derive_addresses, runtime_handle, unlocked_wallet};
use crate::chain::ChainObserver;
use crate::config::ServiceConfig;
use crate::domain::{
    Account, AddressChain, AddressInfo, Balance, MnemonicStore, Transaction, Utxo, UtxoInfo,
    UtxoKey, UtxoKeys, Wallet,
};
use crate::error::{Error, Result};
use crate::events::{UtxoEventType, WalletEvent, WalletEventType};
use crate::keys::KeyDeriver;
use crate::repository::{RepoManager, TransactionRepository, UtxoRepository};

pub struct AccountService {
    repo_manager: Arc<RepoManager>,
    chain: Arc<dyn ChainObserver>,
    deriver: Arc<dyn KeyDeriver>,
    mnemonic_store: Arc<dyn MnemonicStore>,
    config: ServiceConfig,
    runtime: tokio::runtime::Handle,
}

impl AccountService {
    /// Builds the service and registers its wallet and utxo event handlers.
    /// Must be called from within a tokio runtime.
    pub fn new(
        repo_manager: Arc<RepoManager>,
        chain: Arc<dyn ChainObserver>,
        deriver: Arc<dyn KeyDeriver>,
        mnemonic_store: Arc<dyn MnemonicStore>,
        config: ServiceConfig,
    ) -> Result<Arc<Self>> {
        let runtime = runtime_handle()?;
        let service = Arc::new(Self {
            repo_manager,
            chain,
            deriver,
            mnemonic_store,
            config,
            runtime,
        });
        service.register_handlers();
        Ok(service)
    }

    fn wallet(&self) -> Result<(Wallet, String)> {
        unlocked_wallet(
            self.repo_manager.wallet_repository().as_ref(),
            self.mnemonic_store.as_ref(),
        )
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Creates an account born at the current chain tip.
    pub fn create_account(&self, name: &str) -> Result<Account> {
        let (_, mnemonic) = self.wallet()?;
        let (_, birthday) = self.chain.get_latest_block()?;

        let mut created = None;
        self.repo_manager
            .wallet_repository()
            .update_wallet(&mut |wallet: &mut Wallet| {
                created = Some(wallet.create_account(
                    name,
                    birthday,
                    &mnemonic,
                    self.deriver.as_ref(),
                )?);
                Ok(())
            })?;
        let account = created.ok_or(Error::AccountNotFound)?;

        log::info!("account service: created account {name}");
        self.repo_manager
            .wallet_repository()
            .events()
            .publish(WalletEvent {
                birthday: account.birthday_block,
                ..WalletEvent::for_account(WalletEventType::WalletAccountCreated, name)
            });
        Ok(account)
    }

    pub fn derive_addresses(&self, account: &str, num: u32) -> Result<Vec<AddressInfo>> {
        self.derive(account, AddressChain::External, num)
    }

    pub fn derive_change_addresses(&self, account: &str, num: u32) -> Result<Vec<AddressInfo>> {
        self.derive(account, AddressChain::Internal, num)
    }

    fn derive(&self, account: &str, chain: AddressChain, num: u32) -> Result<Vec<AddressInfo>> {
        let (_, mnemonic) = self.wallet()?;
        derive_addresses(
            self.repo_manager.wallet_repository().as_ref(),
            account,
            chain,
            num,
            &mnemonic,
            self.deriver.as_ref(),
        )
    }

    /// Receiving addresses handed out so far.
    pub fn list_addresses(&self, account: &str) -> Result<Vec<AddressInfo>> {
        let (wallet, mnemonic) = self.wallet()?;
        wallet.all_derived_addresses(account, false, &mnemonic, self.deriver.as_ref())
    }

    pub fn get_balance(&self, account: &str) -> Result<HashMap<String, Balance>> {
        self.repo_manager.wallet_repository().get_wallet()?.account(account)?;
        self.repo_manager
            .utxo_repository()
            .get_balance_for_account(account)
    }

    /// Spendable and locked coins of the account.
    pub fn list_utxos(&self, account: &str) -> Result<(Vec<Utxo>, Vec<Utxo>)> {
        self.repo_manager.wallet_repository().get_wallet()?.account(account)?;
        let utxo_repo = self.repo_manager.utxo_repository();
        Ok((
            utxo_repo.get_spendable_utxos_for_account(account)?,
            utxo_repo.get_locked_utxos_for_account(account)?,
        ))
    }

    /// Deletes an empty account and forgets its coins.
    pub fn delete_account(&self, name: &str) -> Result<()> {
        self.wallet()?;
        let balance = self.get_balance(name)?;
        if balance.values().any(|b| b.total() > 0) {
            return Err(Error::NonZeroBalance(name.to_string()));
        }

        let wallet_repo = self.repo_manager.wallet_repository();
        wallet_repo.update_wallet(&mut |wallet: &mut Wallet| wallet.delete_account(name))?;
        wallet_repo.events().publish(WalletEvent::for_account(
            WalletEventType::WalletAccountDeleted,
            name,
        ));
        log::info!("account service: deleted account {name}");

        if let Err(e) = self
            .repo_manager
            .utxo_repository()
            .delete_utxos_for_account(name)
        {
            log::warn!("account service: failed to delete utxos for account {name}: {e}");
        }
        Ok(())
    }

    // ── Event handlers ──────────────────────────────────────────────

    fn register_handlers(self: &Arc<Self>) {
        let manager = &self.repo_manager;

        let weak = Arc::downgrade(self);
        manager.register_handler_for_wallet_event(WalletEventType::WalletAccountCreated, move |ev| {
            if let Some(service) = weak.upgrade() {
                service.watch_account(&ev.account_name, ev.birthday, Vec::new());
            }
        });

        let weak = Arc::downgrade(self);
        manager.register_handler_for_wallet_event(
            WalletEventType::WalletAccountAddressesDerived,
            move |ev| {
                if let Some(service) = weak.upgrade() {
                    service.watch_account(&ev.account_name, ev.birthday, ev.account_addresses);
                }
            },
        );

        let weak = Arc::downgrade(self);
        manager.register_handler_for_wallet_event(WalletEventType::WalletAccountDeleted, move |ev| {
            if let Some(service) = weak.upgrade() {
                service.chain.stop_watch_for_account(&ev.account_name);
                log::debug!("account service: stopped watching account {}", ev.account_name);
            }
        });

        let weak = Arc::downgrade(self);
        manager.register_handler_for_wallet_event(WalletEventType::WalletUnlocked, move |_| {
            if let Some(service) = weak.upgrade() {
                service.watch_all_accounts();
            }
        });

        let weak = Arc::downgrade(self);
        manager.register_handler_for_utxo_event(UtxoEventType::Added, move |ev| {
            if let Some(service) = weak.upgrade() {
                service.watch_utxos(ev.utxos);
            }
        });
    }

    fn watch_account(self: &Arc<Self>, account: &str, birthday: u64, addresses: Vec<AddressInfo>) {
        let count = addresses.len();
        if let Err(e) = self.chain.watch_for_account(account, birthday, addresses) {
            log::warn!("account service: failed to watch account {account}: {e}");
            return;
        }
        if count > 0 {
            log::debug!("account service: watching {count} new address(es) for account {account}");
        }
        self.listen_to_account(account);
    }

    fn watch_all_accounts(self: &Arc<Self>) {
        let (wallet, mnemonic) = match self.wallet() {
            Ok(w) => w,
            Err(e) => {
                log::warn!("account service: cannot restore account watchers: {e}");
                return;
            }
        };
        for account in wallet.accounts.values() {
            match wallet.all_derived_addresses(&account.name, true, &mnemonic, self.deriver.as_ref())
            {
                Ok(addresses) => self.watch_account(&account.name, account.birthday_block, addresses),
                Err(e) => log::warn!(
                    "account service: failed to derive addresses of account {}: {e}",
                    account.name
                ),
            }
            match self
                .repo_manager
                .utxo_repository()
                .get_all_utxos_for_account(&account.name)
            {
                Ok(utxos) => {
                    let unspent: Vec<UtxoInfo> = utxos
                        .iter()
                        .filter(|u| !u.is_spent())
                        .map(Utxo::info)
                        .collect();
                    self.watch_utxos(unspent);
                }
                Err(e) => log::warn!("account service: failed to get utxos: {e}"),
            }
        }
    }

    fn watch_utxos(&self, utxos: Vec<UtxoInfo>) {
        let mut by_account: BTreeMap<String, Vec<UtxoInfo>> = BTreeMap::new();
        for utxo in utxos {
            by_account
                .entry(utxo.account_name.clone())
                .or_default()
                .push(utxo);
        }
        for (account, utxos) in by_account {
            if let Err(e) = self.chain.watch_for_utxos(&account, utxos) {
                log::warn!("account service: failed to watch utxos of account {account}: {e}");
            }
        }
    }

    /// Starts the report listeners of `account`, if not running yet.
    fn listen_to_account(self: &Arc<Self>, account: &str) {
        if let Some(rx) = self.chain.utxo_channel(account) {
            self.runtime
                .spawn(listen_to_utxos(self.repo_manager.utxo_repository(), rx));
        }
        if let Some(rx) = self.chain.tx_channel(account) {
            self.runtime.spawn(listen_to_transactions(
                self.repo_manager.transaction_repository(),
                rx,
                self.config.tx_queue_delay,
            ));
        }
    }
}

// ── Report listeners ────────────────────────────────────────────────

async fn listen_to_utxos(repo: Arc<dyn UtxoRepository>, mut rx: UnboundedReceiver<Vec<Utxo>>) {
    while let Some(batch) = rx.recv().await {
        let repo = repo.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || apply_utxo_report(repo.as_ref(), batch)).await {
            log::warn!("account service: utxo report task failed: {e}");
        }
    }
}

/// A report carries one kind of transition for all its coins: spent,
/// confirmed, or new. A confirmation of unknown coins adds them.
pub(crate) fn apply_utxo_report(repo: &dyn UtxoRepository, batch: Vec<Utxo>) {
    let Some(first) = batch.first() else {
        return;
    };
    let keys: Vec<UtxoKey> = batch.iter().map(Utxo::key).collect();

    if let Some(status) = first.spent_status.clone() {
        match repo.spend_utxos(&keys, status) {
            Ok(count) if count > 0 => {
                log::info!("account service: spent {count} utxo(s) ({})", UtxoKeys(&keys))
            }
            Ok(_) => {}
            Err(e) => log::warn!("account service: failed to spend utxos: {e}"),
        }
        return;
    }

    if let Some(status) = first.confirmed_status.clone() {
        match repo.confirm_utxos(&keys, status) {
            Ok(count) if count > 0 => {
                log::info!("account service: confirmed {count} utxo(s) ({})", UtxoKeys(&keys));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("account service: failed to confirm utxos: {e}");
                return;
            }
        }
    }

    // Shells of confirmed coins carry no value: never add them.
    let batch: Vec<Utxo> = batch
        .into_iter()
        .filter(|u| !u.script.is_empty())
        .collect();
    if batch.is_empty() {
        return;
    }
    match repo.add_utxos(batch) {
        Ok(count) if count > 0 => log::info!("account service: added {count} utxo(s)"),
        Ok(_) => {}
        Err(e) => log::warn!("account service: failed to add utxos: {e}"),
    }
}

async fn listen_to_transactions(
    repo: Arc<dyn TransactionRepository>,
    mut rx: UnboundedReceiver<Transaction>,
    delay: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut queue = vec![first];
        let flush_at = tokio::time::sleep(delay);
        tokio::pin!(flush_at);
        loop {
            tokio::select! {
                _ = &mut flush_at => break,
                next = rx.recv() => match next {
                    Some(tx) => queue.push(tx),
                    None => break,
                },
            }
        }

        let repo = repo.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || flush_transactions(repo.as_ref(), queue)).await
        {
            log::warn!("account service: transaction report task failed: {e}");
        }
    }
}

/// Merges the queued reports by txid and applies them: unknown transactions
/// are added, known ones get confirmed and/or gain accounts.
pub(crate) fn flush_transactions(repo: &dyn TransactionRepository, queue: Vec<Transaction>) {
    let mut merged: BTreeMap<String, Transaction> = BTreeMap::new();
    for tx in queue {
        match merged.get_mut(&tx.txid) {
            Some(existing) => {
                if !existing.is_confirmed() && tx.is_confirmed() {
                    existing.confirm(&tx.block_hash, tx.block_height, tx.block_time);
                }
                existing.accounts.extend(tx.accounts);
            }
            None => {
                merged.insert(tx.txid.clone(), tx);
            }
        }
    }

    for (txid, tx) in merged {
        let result = match repo.get_transaction(&txid) {
            Err(Error::TransactionNotFound(_)) => repo.add_transaction(tx).map(|_| ()),
            Err(e) => Err(e),
            Ok(_) => {
                let accounts: BTreeSet<String> = tx.accounts.clone();
                repo.update_transaction(&txid, &mut |stored: &mut Transaction| {
                    if !stored.is_confirmed() && tx.is_confirmed() {
                        stored.confirm(&tx.block_hash, tx.block_height, tx.block_time);
                    }
                    for account in &accounts {
                        stored.add_account(account);
                    }
                    Ok(())
                })
            }
        };
        if let Err(e) = result {
            log::warn!("account service: failed to store transaction {txid}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UtxoStatus;
    use crate::inmemory::{InMemoryTransactionRepository, InMemoryUtxoRepository};

    fn coin(vout: u32) -> Utxo {
        Utxo {
            key: UtxoKey::new("ab".repeat(32), vout),
            value: 1000,
            asset: "cc".repeat(32),
            script: vec![0x00, 0x14],
            account_name: "main".to_string(),
            ..Default::default()
        }
    }

    fn shell(vout: u32) -> Utxo {
        Utxo {
            key: UtxoKey::new("ab".repeat(32), vout),
            account_name: "main".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn utxo_reports_add_confirm_and_spend() {
        let repo = InMemoryUtxoRepository::new();
        apply_utxo_report(&repo, vec![coin(0), coin(1)]);
        assert_eq!(repo.get_all_utxos().unwrap().len(), 2);

        let confirmed = UtxoStatus::new("", 10, 1000, "hash");
        let mut confirmations = vec![shell(0), shell(1)];
        for c in &mut confirmations {
            c.confirmed_status = Some(confirmed.clone());
        }
        apply_utxo_report(&repo, confirmations.clone());
        assert_eq!(repo.get_spendable_utxos().unwrap().len(), 2);

        // Confirming again neither fails nor adds shells.
        apply_utxo_report(&repo, confirmations);
        assert_eq!(repo.get_all_utxos().unwrap().len(), 2);

        let mut spends = vec![shell(0)];
        spends[0].spent_status = Some(UtxoStatus::new("cd".repeat(32), 11, 1100, "hash2"));
        apply_utxo_report(&repo, spends);
        let spent = repo
            .get_utxos_by_key(&[UtxoKey::new("ab".repeat(32), 0)])
            .unwrap();
        assert!(spent[0].is_spent());
    }

    #[test]
    fn confirmed_new_coins_are_added_confirmed() {
        let repo = InMemoryUtxoRepository::new();
        let mut c = coin(3);
        c.confirmed_status = Some(UtxoStatus::new("", 5, 500, "hash"));
        apply_utxo_report(&repo, vec![c]);
        assert_eq!(repo.get_spendable_utxos_for_account("main").unwrap().len(), 1);
    }

    #[test]
    fn transaction_queue_merges_and_confirms() {
        let repo = InMemoryTransactionRepository::new();
        let mut a = Transaction {
            txid: "t1".to_string(),
            tx_hex: "00".to_string(),
            ..Default::default()
        };
        a.add_account("main");
        let mut b = a.clone();
        b.accounts.clear();
        b.add_account("savings");
        flush_transactions(&repo, vec![a.clone(), b]);

        let stored = repo.get_transaction("t1").unwrap();
        assert!(!stored.is_confirmed());
        assert_eq!(stored.accounts_list(), vec!["main", "savings"]);

        let mut confirmed = a;
        confirmed.confirm("hash", 7, 700);
        flush_transactions(&repo, vec![confirmed]);
        let stored = repo.get_transaction("t1").unwrap();
        assert!(stored.is_confirmed());
        assert_eq!(stored.block_height, 7);
        assert_eq!(stored.accounts.len(), 2);
    }
}
