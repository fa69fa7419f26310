#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lagoon_sdk::events::UtxoEvent;
use lagoon_sdk::inmemory::{
    InMemoryMnemonicStore, InMemoryTransactionRepository, InMemoryUtxoRepository,
    InMemoryWalletRepository,
};
use lagoon_sdk::testing::{
    FakeChainObserver, FakeDeriver, FakePsetBackend, MNEMONIC, XorCipher, in_memory_repo_manager,
};
use lagoon_sdk::{
    AccountService, Balance, Error, EventBus, Network, RepoManager, Result, ServiceConfig,
    SmallestSubsetSelector, TransactionService, Utxo, UtxoKey, UtxoRepository, UtxoStatus,
    WalletService,
};
use tokio::task::JoinHandle;

pub const PASSWORD: &str = "password";
pub const ACCOUNT: &str = "main";

pub struct Harness {
    pub manager: Arc<RepoManager>,
    pub chain: Arc<FakeChainObserver>,
    pub wallet: WalletService,
    pub accounts: Arc<AccountService>,
    pub txs: Arc<TransactionService>,
    pub tasks: Vec<JoinHandle<()>>,
}

pub fn config() -> ServiceConfig {
    ServiceConfig {
        tx_queue_delay: Duration::from_millis(50),
        ..ServiceConfig::new(Network::LiquidRegtest)
    }
}

pub fn native() -> String {
    Network::LiquidRegtest.policy_asset()
}

/// Services over `manager`, with the dispatchers running.
pub fn services(manager: Arc<RepoManager>, config: ServiceConfig) -> Harness {
    let chain = Arc::new(FakeChainObserver::new(100));
    let mnemonic_store = Arc::new(InMemoryMnemonicStore::new());
    let wallet = WalletService::new(
        manager.clone(),
        chain.clone(),
        mnemonic_store.clone(),
        Arc::new(XorCipher),
        Network::LiquidRegtest,
    );
    let accounts = AccountService::new(
        manager.clone(),
        chain.clone(),
        Arc::new(FakeDeriver),
        mnemonic_store.clone(),
        config.clone(),
    )
    .unwrap();
    let txs = TransactionService::new(
        manager.clone(),
        chain.clone(),
        Arc::new(FakePsetBackend),
        Arc::new(FakeDeriver),
        mnemonic_store,
        Arc::new(SmallestSubsetSelector::new()),
        config,
    )
    .unwrap();
    let tasks = manager.start();
    Harness {
        manager,
        chain,
        wallet,
        accounts,
        txs,
        tasks,
    }
}

/// An unlocked wallet with one account over in-memory repositories.
pub fn unlocked_wallet(config: ServiceConfig) -> Harness {
    let h = services(in_memory_repo_manager(), config);
    h.wallet.create_wallet(MNEMONIC, PASSWORD).unwrap();
    h.wallet.unlock(PASSWORD).unwrap();
    h.accounts.create_account(ACCOUNT).unwrap();
    h
}

/// Polls `check` every 20ms for up to 5s.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn p2wpkh(byte: u8) -> Vec<u8> {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[byte; 20]);
    script
}

// ---------------------------------------------------------------------------
// Misbehaving utxo store
// ---------------------------------------------------------------------------

/// In-memory utxo store with two injectable faults: coins locked by someone
/// else right after the next spendable read, and a number of failing
/// unlocks.
pub struct FlakyUtxoRepository {
    inner: InMemoryUtxoRepository,
    lock_after_read: Mutex<Vec<UtxoKey>>,
    failing_unlocks: AtomicUsize,
}

impl FlakyUtxoRepository {
    pub fn new() -> Self {
        Self {
            inner: InMemoryUtxoRepository::new(),
            lock_after_read: Mutex::new(Vec::new()),
            failing_unlocks: AtomicUsize::new(0),
        }
    }

    /// The next spendable read locks `keys` once it has returned them.
    pub fn lock_after_next_read(&self, keys: Vec<UtxoKey>) {
        *self.lock_after_read.lock().unwrap() = keys;
    }

    pub fn fail_next_unlocks(&self, n: usize) {
        self.failing_unlocks.store(n, Ordering::SeqCst);
    }

    pub fn failing_unlocks_left(&self) -> usize {
        self.failing_unlocks.load(Ordering::SeqCst)
    }
}

impl UtxoRepository for FlakyUtxoRepository {
    fn add_utxos(&self, utxos: Vec<Utxo>) -> Result<usize> {
        self.inner.add_utxos(utxos)
    }
    fn get_all_utxos(&self) -> Result<Vec<Utxo>> {
        self.inner.get_all_utxos()
    }
    fn get_spendable_utxos(&self) -> Result<Vec<Utxo>> {
        self.inner.get_spendable_utxos()
    }
    fn get_all_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>> {
        self.inner.get_all_utxos_for_account(account)
    }
    fn get_spendable_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>> {
        let utxos = self.inner.get_spendable_utxos_for_account(account)?;
        let keys = std::mem::take(&mut *self.lock_after_read.lock().unwrap());
        if !keys.is_empty() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs() as i64;
            self.inner.lock_utxos(&keys, now, now + 3_600)?;
        }
        Ok(utxos)
    }
    fn get_locked_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>> {
        self.inner.get_locked_utxos_for_account(account)
    }
    fn get_utxos_by_key(&self, keys: &[UtxoKey]) -> Result<Vec<Utxo>> {
        self.inner.get_utxos_by_key(keys)
    }
    fn get_balance_for_account(&self, account: &str) -> Result<HashMap<String, Balance>> {
        self.inner.get_balance_for_account(account)
    }
    fn lock_utxos(&self, keys: &[UtxoKey], timestamp: i64, expiry_timestamp: i64) -> Result<usize> {
        self.inner.lock_utxos(keys, timestamp, expiry_timestamp)
    }
    fn unlock_utxos(&self, keys: &[UtxoKey]) -> Result<usize> {
        let failing = self
            .failing_unlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Store("unlock failed".to_string()));
        }
        self.inner.unlock_utxos(keys)
    }
    fn spend_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> Result<usize> {
        self.inner.spend_utxos(keys, status)
    }
    fn confirm_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> Result<usize> {
        self.inner.confirm_utxos(keys, status)
    }
    fn delete_utxos_for_account(&self, account: &str) -> Result<()> {
        self.inner.delete_utxos_for_account(account)
    }
    fn events(&self) -> &EventBus<UtxoEvent> {
        self.inner.events()
    }
}

/// Unlocked wallet with one account whose coins live in `utxos`.
pub fn unlocked_wallet_over(utxos: Arc<FlakyUtxoRepository>, config: ServiceConfig) -> Harness {
    let manager = RepoManager::new(
        utxos,
        Arc::new(InMemoryTransactionRepository::new()),
        Arc::new(InMemoryWalletRepository::new()),
    );
    let h = services(manager, config);
    h.wallet.create_wallet(MNEMONIC, PASSWORD).unwrap();
    h.wallet.unlock(PASSWORD).unwrap();
    h.accounts.create_account(ACCOUNT).unwrap();
    h
}
