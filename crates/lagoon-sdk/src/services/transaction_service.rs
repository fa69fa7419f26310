//! Coin locking and transaction building.
//!
//! Every coin handed out by a selection is locked for
//! [`ServiceConfig::utxo_expiry`]. Each batch of locked coins gets an
//! unlocker task, one per lock timestamp, releasing the coins that are still
//! unspent once the lock expires. Unlockers are not persisted: at startup
//! they are rebuilt from the locked coins found in the store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lwk_wollet::elements::secp256k1_zkp::{self, PublicKey, SecretKey};

use super::{derive_addresses, now_secs, runtime_handle, unlocked_wallet};
use crate::chain::ChainObserver;
use crate::coin_selector::CoinSelector;
use crate::config::ServiceConfig;
use crate::domain::{
    AddressChain, AddressInfo, MnemonicStore, Transaction, Utxo, UtxoKey, UtxoKeys, Wallet,
};
use crate::error::{Error, Result};
use crate::events::UtxoEventType;
use crate::fees::{DUMMY_FEE_AMOUNT, estimate_fees, round_up};
use crate::keys::KeyDeriver;
use crate::pset::{PsetBackend, TxInput, TxOutput};
use crate::repository::{RepoManager, UtxoRepository};

/// Selections retried when a concurrent caller locks the chosen coins first.
const MAX_LOCK_ATTEMPTS: usize = 3;

pub struct TransactionService {
    repo_manager: Arc<RepoManager>,
    chain: Arc<dyn ChainObserver>,
    pset: Arc<dyn PsetBackend>,
    deriver: Arc<dyn KeyDeriver>,
    mnemonic_store: Arc<dyn MnemonicStore>,
    selector: Arc<dyn CoinSelector>,
    config: ServiceConfig,
    runtime: tokio::runtime::Handle,
}

fn keys_of(utxos: &[Utxo]) -> Vec<UtxoKey> {
    utxos.iter().map(Utxo::key).collect()
}

impl TransactionService {
    /// Builds the service, registers the unlock scheduler on `Locked` events
    /// and recovers the locks found in the store. Must be called from within
    /// a tokio runtime.
    pub fn new(
        repo_manager: Arc<RepoManager>,
        chain: Arc<dyn ChainObserver>,
        pset: Arc<dyn PsetBackend>,
        deriver: Arc<dyn KeyDeriver>,
        mnemonic_store: Arc<dyn MnemonicStore>,
        selector: Arc<dyn CoinSelector>,
        config: ServiceConfig,
    ) -> Result<Arc<Self>> {
        let runtime = runtime_handle()?;
        let service = Arc::new(Self {
            repo_manager,
            chain,
            pset,
            deriver,
            mnemonic_store,
            selector,
            config,
            runtime,
        });

        let weak = Arc::downgrade(&service);
        service
            .repo_manager
            .register_handler_for_utxo_event(UtxoEventType::Locked, move |event| {
                if let Some(service) = weak.upgrade() {
                    let keys: Vec<UtxoKey> = event.utxos.iter().map(|u| u.key.clone()).collect();
                    service.spawn_utxo_unlockers(&keys);
                }
            });

        service.recover_locked_utxos();
        Ok(service)
    }

    fn utxo_repo(&self) -> Arc<dyn UtxoRepository> {
        self.repo_manager.utxo_repository()
    }

    fn unlocked_wallet(&self) -> Result<(Wallet, String)> {
        unlocked_wallet(
            self.repo_manager.wallet_repository().as_ref(),
            self.mnemonic_store.as_ref(),
        )
    }

    fn fee_rate(&self, millisats_per_byte: u64) -> u64 {
        if millisats_per_byte == 0 {
            self.config.min_millisats_per_byte
        } else {
            millisats_per_byte
        }
    }

    /// Locks all of `keys` now, until now + expiry, and returns the expiry
    /// timestamp. Returns `None`, with nothing left locked by this call, if
    /// any of them was already locked.
    fn try_lock(&self, keys: &[UtxoKey], account: &str) -> Result<Option<i64>> {
        let now = now_secs();
        let expiry = now + self.config.utxo_expiry.as_secs() as i64;
        let utxo_repo = self.utxo_repo();

        let mut locked: Vec<UtxoKey> = Vec::with_capacity(keys.len());
        for key in keys {
            match utxo_repo.lock_utxos(std::slice::from_ref(key), now, expiry) {
                Ok(1) => locked.push(key.clone()),
                Ok(_) => {
                    log::info!(
                        "transaction service: utxo {key} of account {account} already locked, \
                         releasing {}",
                        UtxoKeys(&locked)
                    );
                    self.release(&locked);
                    return Ok(None);
                }
                Err(e) => {
                    self.release(&locked);
                    return Err(e);
                }
            }
        }
        if !locked.is_empty() {
            log::info!(
                "transaction service: locked {} utxo(s) for account {account} ({})",
                locked.len(),
                UtxoKeys(&locked)
            );
        }
        Ok(Some(expiry))
    }

    /// Unlocks coins this service just locked. On failure the unlocker
    /// releases them at expiry.
    fn release(&self, keys: &[UtxoKey]) {
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.utxo_repo().unlock_utxos(keys) {
            log::warn!(
                "transaction service: failed to release utxo(s) {}: {e}",
                UtxoKeys(keys)
            );
        }
    }

    // ── Lock expiry ─────────────────────────────────────────────────

    /// Unlocks the expired locks of every account and schedules unlockers
    /// for the others.
    fn recover_locked_utxos(&self) {
        let Ok(wallet) = self.repo_manager.wallet_repository().get_wallet() else {
            return;
        };
        let utxo_repo = self.utxo_repo();
        let now = now_secs();

        for account in wallet.accounts.keys() {
            let locked = match utxo_repo.get_locked_utxos_for_account(account) {
                Ok(locked) => locked,
                Err(e) => {
                    log::warn!(
                        "transaction service: failed to get locked utxos for account {account}: {e}"
                    );
                    continue;
                }
            };
            if locked.is_empty() {
                continue;
            }

            let (expired, pending): (Vec<Utxo>, Vec<Utxo>) =
                locked.into_iter().partition(|u| u.can_unlock(now));
            let mut to_schedule = keys_of(&pending);

            if !expired.is_empty() {
                let keys = keys_of(&expired);
                match utxo_repo.unlock_utxos(&keys) {
                    Ok(count) if count > 0 => log::info!(
                        "transaction service: unlocked {count} utxo(s) for account {account} ({})",
                        UtxoKeys(&keys)
                    ),
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("transaction service: failed to unlock expired utxos: {e}");
                        to_schedule.extend(keys);
                    }
                }
            }

            if !to_schedule.is_empty() {
                self.spawn_utxo_unlockers(&to_schedule);
            }
        }
    }

    /// Groups the coins by lock timestamp and spawns one unlocker per group.
    fn spawn_utxo_unlockers(&self, keys: &[UtxoKey]) {
        let utxos = match self.utxo_repo().get_utxos_by_key(keys) {
            Ok(utxos) => utxos,
            Err(e) => {
                log::warn!("unlocker: failed to get utxos: {e}");
                return;
            }
        };

        let mut by_timestamp: BTreeMap<i64, Vec<UtxoKey>> = BTreeMap::new();
        for utxo in utxos.iter().filter(|u| u.is_locked()) {
            by_timestamp
                .entry(utxo.lock_timestamp)
                .or_default()
                .push(utxo.key());
        }

        let expiry = self.config.utxo_expiry.as_secs() as i64;
        for (timestamp, keys) in by_timestamp {
            let remaining = (timestamp + expiry - now_secs()).max(0) as u64;
            let unlock_in = Duration::from_secs(remaining);
            log::debug!(
                "unlocker: spawned for utxo(s) {}, unlocking in ~{}s",
                UtxoKeys(&keys),
                unlock_in.as_secs()
            );
            self.runtime.spawn(run_unlocker(
                self.utxo_repo(),
                keys,
                timestamp,
                unlock_in,
                self.config.unlock_retry,
            ));
        }
    }

    // ── External construction ───────────────────────────────────────

    /// Selects and locks coins of `account` funding `amount` of `asset`.
    /// Returns the coins, the change and the lock expiry timestamp.
    pub fn select_utxos(
        &self,
        account: &str,
        asset: &str,
        amount: u64,
    ) -> Result<(Vec<Utxo>, u64, i64)> {
        validate_asset(asset)?;
        if amount == 0 {
            return Err(Error::Validation("target amount must be greater than 0".to_string()));
        }
        let (wallet, _) = self.unlocked_wallet()?;
        wallet.account(account)?;

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let utxos = self.utxo_repo().get_spendable_utxos_for_account(account)?;
            let (selected, change) = self.selector.select_utxos(&utxos, amount, asset)?;
            if let Some(expiry) = self.try_lock(&keys_of(&selected), account)? {
                return Ok((selected, change, expiry));
            }
        }
        Err(Error::LockConflict)
    }

    /// Fee for spending `inputs` into `outputs`. Inputs only need their
    /// outpoint: wallet coins are read from the store, others from the chain.
    pub fn estimate_fees(
        &self,
        inputs: &[TxInput],
        outputs: &[TxOutput],
        millisats_per_byte: u64,
    ) -> Result<u64> {
        for output in outputs {
            output.validate()?;
        }
        let keys: Vec<UtxoKey> = inputs.iter().map(TxInput::key).collect();
        let owned: HashMap<UtxoKey, Utxo> = self
            .utxo_repo()
            .get_utxos_by_key(&keys)?
            .into_iter()
            .map(|u| (u.key(), u))
            .collect();

        let external: Vec<UtxoKey> = inputs
            .iter()
            .filter(|i| i.script.is_empty() && !owned.contains_key(&i.key()))
            .map(TxInput::key)
            .collect();
        let fetched: HashMap<UtxoKey, Utxo> = self
            .chain
            .get_utxos(&external)?
            .into_iter()
            .map(|u| (u.key(), u))
            .collect();

        let resolved: Vec<TxInput> = inputs
            .iter()
            .map(|input| {
                let key = input.key();
                let mut resolved = match owned.get(&key).or_else(|| fetched.get(&key)) {
                    Some(utxo) => TxInput::from(utxo),
                    None => input.clone(),
                };
                resolved.script_sig_size = input.script_sig_size;
                resolved.witness_size = input.witness_size;
                resolved
            })
            .collect();

        Ok(estimate_fees(&resolved, outputs, self.fee_rate(millisats_per_byte)))
    }

    /// Wallet coins among `keys` must all be locked. Other keys are looked
    /// up on chain.
    fn resolve_inputs(&self, keys: &[UtxoKey]) -> Result<Vec<TxInput>> {
        let owned: HashMap<UtxoKey, Utxo> = self
            .utxo_repo()
            .get_utxos_by_key(keys)?
            .into_iter()
            .map(|u| (u.key(), u))
            .collect();
        if owned.is_empty() {
            return Err(Error::Validation("no utxos found with given keys".to_string()));
        }
        if owned.values().any(|u| !u.is_locked()) {
            return Err(Error::ForbiddenUnlockedInputs);
        }

        let external: Vec<UtxoKey> = keys
            .iter()
            .filter(|k| !owned.contains_key(k))
            .cloned()
            .collect();
        let fetched: HashMap<UtxoKey, Utxo> = self
            .chain
            .get_utxos(&external)?
            .into_iter()
            .map(|u| (u.key(), u))
            .collect();

        keys.iter()
            .map(|k| {
                owned
                    .get(k)
                    .or_else(|| fetched.get(k))
                    .map(TxInput::from)
                    .ok_or_else(|| Error::Query(format!("utxo {k} not found")))
            })
            .collect()
    }

    pub fn create_pset(&self, inputs: &[UtxoKey], outputs: &[TxOutput]) -> Result<String> {
        self.unlocked_wallet()?;
        let inputs = self.resolve_inputs(inputs)?;
        self.pset.create_pset(&inputs, outputs)
    }

    pub fn update_pset(
        &self,
        pset: &str,
        inputs: &[UtxoKey],
        outputs: &[TxOutput],
    ) -> Result<String> {
        self.unlocked_wallet()?;
        let inputs = if inputs.is_empty() {
            Vec::new()
        } else {
            self.resolve_inputs(inputs)?
        };
        self.pset.update_pset(pset, &inputs, outputs)
    }

    /// Wallet coins spent by the given inputs, by input index. They must be
    /// locked.
    fn owned_inputs(&self, spent: &[UtxoKey]) -> Result<BTreeMap<usize, TxInput>> {
        let owned: HashMap<UtxoKey, Utxo> = self
            .utxo_repo()
            .get_utxos_by_key(spent)?
            .into_iter()
            .map(|u| (u.key(), u))
            .collect();
        if owned.values().any(|u| !u.is_locked()) {
            return Err(Error::ForbiddenUnlockedInputs);
        }
        Ok(spent
            .iter()
            .enumerate()
            .filter_map(|(i, k)| owned.get(k).map(|u| (i, TxInput::from(u))))
            .collect())
    }

    /// Blinds the PSET with the secrets of the wallet inputs plus
    /// `extra_unblinded_inputs`.
    pub fn blind_pset(
        &self,
        pset: &str,
        extra_unblinded_inputs: &[TxInput],
        last_blinder: bool,
    ) -> Result<String> {
        self.unlocked_wallet()?;
        let spent = self.pset.pset_inputs(pset)?;
        let mut owned = self.owned_inputs(&spent)?;
        for extra in extra_unblinded_inputs {
            let key = extra.key();
            if let Some(index) = spent.iter().position(|k| *k == key) {
                owned.entry(index).or_insert_with(|| extra.clone());
            }
        }
        self.pset.blind_pset_with_owned_inputs(pset, &owned, last_blinder)
    }

    pub fn sign_pset(&self, pset: &str) -> Result<String> {
        let (wallet, mnemonic) = self.unlocked_wallet()?;
        let spent = self.pset.pset_inputs(pset)?;
        self.owned_inputs(&spent)?;
        self.pset
            .sign_pset(pset, &mnemonic, &derivation_paths(&wallet))
    }

    pub fn sign_transaction(&self, tx_hex: &str) -> Result<String> {
        let (wallet, mnemonic) = self.unlocked_wallet()?;
        let spent = self.pset.transaction_inputs(tx_hex)?;
        let owned = self.owned_inputs(&spent)?;
        self.pset
            .sign_transaction(tx_hex, &owned, &mnemonic, &derivation_paths(&wallet))
    }

    /// Broadcasts a transaction. Wallet coins it spends must be locked.
    pub fn broadcast_transaction(&self, tx_hex: &str) -> Result<String> {
        let spent = self.pset.transaction_inputs(tx_hex)?;
        let owned = self.utxo_repo().get_utxos_by_key(&spent)?;
        if owned.iter().any(|u| !u.is_locked() && !u.is_spent()) {
            return Err(Error::UnlockedUtxosInBroadcast);
        }
        let txid = self.chain.broadcast_transaction(tx_hex)?;
        log::info!("transaction service: broadcasted transaction {txid}");
        Ok(txid)
    }

    pub fn get_transaction_info(&self, txid: &str) -> Result<Transaction> {
        match self.repo_manager.transaction_repository().get_transaction(txid) {
            Ok(tx) => Ok(tx),
            Err(Error::TransactionNotFound(_)) => self
                .chain
                .get_transactions(&[txid.to_string()])?
                .into_iter()
                .next()
                .ok_or_else(|| Error::TransactionNotFound(txid.to_string())),
            Err(e) => Err(e),
        }
    }

    // ── Transfer ────────────────────────────────────────────────────

    /// Funds, blinds, signs and finalizes a transaction paying `outputs`
    /// from `account`. Every coin spent is locked. Returns the raw tx hex.
    pub fn transfer(
        &self,
        account_name: &str,
        outputs: &[TxOutput],
        millisats_per_byte: u64,
    ) -> Result<String> {
        if outputs.is_empty() {
            return Err(Error::Validation("missing outputs".to_string()));
        }
        for output in outputs {
            output.validate()?;
            if output.amount == 0 {
                return Err(Error::Validation("output amount must be greater than 0".to_string()));
            }
            if output.script.is_empty() {
                return Err(Error::Validation("output is missing script".to_string()));
            }
        }
        let rate = self.fee_rate(millisats_per_byte);

        let (wallet, mnemonic) = self.unlocked_wallet()?;
        wallet.account(account_name)?;

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let (tx_hex, spent) = self.build_transfer(account_name, outputs, rate, &mnemonic)?;
            if self.try_lock(&spent, account_name)?.is_some() {
                return Ok(tx_hex);
            }
        }
        Err(Error::LockConflict)
    }

    /// Selects, funds, blinds and signs a transfer. Returns the transaction
    /// and the coins it spends, not yet locked.
    fn build_transfer(
        &self,
        account_name: &str,
        outputs: &[TxOutput],
        rate: u64,
        mnemonic: &str,
    ) -> Result<(String, Vec<UtxoKey>)> {
        let native = self.config.network.policy_asset();
        let utxo_repo = self.utxo_repo();

        let balance = utxo_repo.get_balance_for_account(account_name)?;
        if balance.is_empty() {
            return Err(Error::Validation(format!("account {account_name} has 0 balance")));
        }
        let utxos = utxo_repo.get_spendable_utxos_for_account(account_name)?;
        if utxos.is_empty() {
            return Err(Error::Validation(format!(
                "no utxos found for account {account_name}"
            )));
        }

        let mut targets: BTreeMap<&str, u64> = BTreeMap::new();
        for output in outputs {
            *targets.entry(output.asset.as_str()).or_default() += output.amount;
        }

        let mut selected: Vec<Utxo> = Vec::new();
        let mut change_by_asset: BTreeMap<String, u64> = BTreeMap::new();
        for (asset, amount) in targets {
            let (coins, change) = self.selector.select_utxos(&utxos, amount, asset)?;
            selected.extend(coins);
            if change > 0 {
                change_by_asset.insert(asset.to_string(), change);
            }
        }
        let mut inputs: Vec<TxInput> = selected.iter().map(TxInput::from).collect();

        let mut change_outputs: Vec<TxOutput> = Vec::new();
        if !change_by_asset.is_empty() {
            let addresses = self.derive_change(account_name, change_by_asset.len(), mnemonic)?;
            for ((asset, amount), address) in change_by_asset.iter().zip(addresses) {
                change_outputs.push(change_output(asset, *amount, &address)?);
            }
        }

        let all_outputs =
            |change: &[TxOutput]| -> Vec<TxOutput> { outputs.iter().chain(change).cloned().collect() };

        let mut fee = estimate_fees(&inputs, &all_outputs(&change_outputs), rate);
        let native_change = change_by_asset.get(&native).copied().unwrap_or(0);
        let native_index = change_outputs.iter().position(|o| o.asset == native);

        if fee < native_change {
            if let Some(i) = native_index {
                change_outputs[i].amount -= fee;
            }
        } else if fee == native_change {
            if let Some(i) = native_index {
                change_outputs.remove(i);
            }
        } else {
            let target = if fee > DUMMY_FEE_AMOUNT {
                round_up(fee)
            } else {
                DUMMY_FEE_AMOUNT
            };
            let taken: HashSet<UtxoKey> = selected.iter().map(Utxo::key).collect();
            let remaining: Vec<Utxo> = utxos
                .iter()
                .filter(|u| !taken.contains(&u.key()))
                .cloned()
                .collect();
            let (extra, extra_change) = self.selector.select_utxos(&remaining, target, &native)?;
            inputs.extend(extra.iter().map(TxInput::from));
            selected.extend(extra);

            let native_index = match native_index {
                Some(i) => {
                    change_outputs[i].amount += extra_change;
                    Some(i)
                }
                None if extra_change > 0 => {
                    let address = self.derive_change(account_name, 1, mnemonic)?;
                    let address = address
                        .first()
                        .ok_or_else(|| Error::Derivation("no change address derived".to_string()))?;
                    change_outputs.push(change_output(&native, extra_change, address)?);
                    Some(change_outputs.len() - 1)
                }
                None => None,
            };

            match native_index {
                Some(i) => {
                    fee = estimate_fees(&inputs, &all_outputs(&change_outputs), rate);
                    let amount = change_outputs[i].amount as i128 + target as i128 - fee as i128;
                    if amount < 0 {
                        return Err(Error::TargetAmountNotReached);
                    }
                    if amount == 0 {
                        change_outputs.remove(i);
                    } else {
                        change_outputs[i].amount = amount as u64;
                    }
                }
                // Nothing to return: the whole second round goes to fees.
                None => fee = target,
            }
        }

        let mut final_outputs = all_outputs(&change_outputs);
        final_outputs.push(TxOutput {
            asset: native.clone(),
            amount: fee,
            ..Default::default()
        });

        let owned: BTreeMap<usize, TxInput> = inputs.iter().cloned().enumerate().collect();
        let pset = self.pset.create_pset(&inputs, &final_outputs)?;
        let blinded = self.pset.blind_pset_with_owned_inputs(&pset, &owned, true)?;
        let wallet = self.repo_manager.wallet_repository().get_wallet()?;
        let signed = self
            .pset
            .sign_pset(&blinded, mnemonic, &derivation_paths(&wallet))?;
        let tx_hex = self.pset.finalize_and_extract(&signed)?;

        Ok((tx_hex, keys_of(&selected)))
    }

    fn derive_change(&self, account: &str, num: usize, mnemonic: &str) -> Result<Vec<AddressInfo>> {
        derive_addresses(
            self.repo_manager.wallet_repository().as_ref(),
            account,
            AddressChain::Internal,
            num as u32,
            mnemonic,
            self.deriver.as_ref(),
        )
    }
}

/// Sleeps until the lock expires, then unlocks the coins still held by the
/// lock taken at `lock_timestamp`. A failed unlock is retried every `retry`
/// until it succeeds or the coins get spent.
async fn run_unlocker(
    repo: Arc<dyn UtxoRepository>,
    keys: Vec<UtxoKey>,
    lock_timestamp: i64,
    unlock_in: Duration,
    retry: Duration,
) {
    let mut wait = unlock_in;
    loop {
        tokio::time::sleep(wait).await;

        let repo = repo.clone();
        let keys = keys.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
            let utxos = repo.get_utxos_by_key(&keys)?;
            let (spent, unspent): (Vec<&Utxo>, Vec<&Utxo>) =
                utxos.iter().partition(|u| u.is_spent());
            if !spent.is_empty() {
                let spent: Vec<UtxoKey> = spent.iter().map(|u| u.key()).collect();
                log::info!(
                    "unlocker: utxo(s) {} have been spent, skipping unlocking",
                    UtxoKeys(&spent)
                );
            }
            let to_unlock: Vec<UtxoKey> = unspent
                .iter()
                .filter(|u| u.is_locked() && u.lock_timestamp == lock_timestamp)
                .map(|u| u.key())
                .collect();
            if to_unlock.is_empty() {
                return Ok(());
            }
            let count = repo.unlock_utxos(&to_unlock)?;
            if count > 0 {
                log::info!("unlocker: unlocked {count} utxo(s) {}", UtxoKeys(&to_unlock));
            }
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => log::warn!("unlocker: failed to unlock utxos, retrying: {e}"),
            Err(e) => log::warn!("unlocker: task failed, retrying: {e}"),
        }
        wait = retry;
    }
}

fn validate_asset(asset: &str) -> Result<()> {
    match hex::decode(asset) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(Error::Validation(
            "invalid asset length: must be exactly 32 bytes".to_string(),
        )),
    }
}

/// Hex script -> path relative to the root, over every account.
fn derivation_paths(wallet: &Wallet) -> HashMap<String, String> {
    wallet
        .accounts
        .values()
        .flat_map(|a| a.derivation_path_by_script.clone())
        .collect()
}

fn change_output(asset: &str, amount: u64, address: &AddressInfo) -> Result<TxOutput> {
    let script =
        hex::decode(&address.script).map_err(|e| Error::Derivation(format!("script: {e}")))?;
    let blinding_key = if address.blinding_key.is_empty() {
        Vec::new()
    } else {
        let secp = secp256k1_zkp::Secp256k1::new();
        let sk = SecretKey::from_slice(&address.blinding_key)
            .map_err(|e| Error::Derivation(format!("blinding key: {e}")))?;
        PublicKey::from_secret_key(&secp, &sk).serialize().to_vec()
    };
    Ok(TxOutput {
        asset: asset.to_string(),
        amount,
        script,
        blinding_key,
        blinder_index: 0,
    })
}
