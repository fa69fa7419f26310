//! Store contracts and the manager that routes their events to handlers.
//!
//! The traits are implemented both by the in-memory stores in
//! [`crate::inmemory`] and by the SQLite store in `lagoon-store`. Every method
//! is one conceptually-atomic operation: per-key transitions are
//! check-and-set, and the matching event is published once the change is
//! committed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;

use crate::domain::{Balance, Transaction, Utxo, UtxoKey, UtxoStatus, Wallet};
use crate::error::Result;
use crate::events::{
    EventBus, TransactionEvent, TransactionEventType, UtxoEvent, UtxoEventType, WalletEvent,
    WalletEventType,
};

pub trait UtxoRepository: Send + Sync {
    /// Inserts the coins whose key is unknown. Returns how many were added.
    fn add_utxos(&self, utxos: Vec<Utxo>) -> Result<usize>;
    fn get_all_utxos(&self) -> Result<Vec<Utxo>>;
    /// Confirmed, unlocked and unspent coins of every account.
    fn get_spendable_utxos(&self) -> Result<Vec<Utxo>>;
    fn get_all_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>>;
    fn get_spendable_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>>;
    fn get_locked_utxos_for_account(&self, account: &str) -> Result<Vec<Utxo>>;
    /// Unknown keys are skipped.
    fn get_utxos_by_key(&self, keys: &[UtxoKey]) -> Result<Vec<Utxo>>;
    fn get_balance_for_account(&self, account: &str) -> Result<HashMap<String, Balance>>;
    fn lock_utxos(&self, keys: &[UtxoKey], timestamp: i64, expiry_timestamp: i64)
    -> Result<usize>;
    fn unlock_utxos(&self, keys: &[UtxoKey]) -> Result<usize>;
    fn spend_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> Result<usize>;
    fn confirm_utxos(&self, keys: &[UtxoKey], status: UtxoStatus) -> Result<usize>;
    fn delete_utxos_for_account(&self, account: &str) -> Result<()>;
    fn events(&self) -> &EventBus<UtxoEvent>;
}

pub trait TransactionRepository: Send + Sync {
    /// Returns false if the transaction was already known.
    fn add_transaction(&self, tx: Transaction) -> Result<bool>;
    /// Returns false if the transaction was already confirmed.
    fn confirm_transaction(
        &self,
        txid: &str,
        block_hash: &str,
        block_height: u64,
        block_time: i64,
    ) -> Result<bool>;
    fn get_transaction(&self, txid: &str) -> Result<Transaction>;
    fn update_transaction(
        &self,
        txid: &str,
        update: &mut dyn FnMut(&mut Transaction) -> Result<()>,
    ) -> Result<()>;
    fn events(&self) -> &EventBus<TransactionEvent>;
}

/// Storage for the single wallet of the daemon. Wallet events are published
/// on its bus by the wallet service.
pub trait WalletRepository: Send + Sync {
    fn create_wallet(&self, wallet: Wallet) -> Result<()>;
    fn get_wallet(&self) -> Result<Wallet>;
    fn update_wallet(&self, update: &mut dyn FnMut(&mut Wallet) -> Result<()>) -> Result<()>;
    fn events(&self) -> &EventBus<WalletEvent>;
}

/// Publishes a utxo event unless the batch is empty.
pub fn publish_utxo_event(bus: &EventBus<UtxoEvent>, event_type: UtxoEventType, utxos: &[Utxo]) {
    if utxos.is_empty() {
        return;
    }
    bus.publish(UtxoEvent {
        event_type,
        utxos: utxos.iter().map(Utxo::info).collect(),
    });
}

/// Event type describing the confirmation change between `before` and `after`.
pub fn transaction_transition(before: &Transaction, after: &Transaction) -> Option<TransactionEventType> {
    match (before.is_confirmed(), after.is_confirmed()) {
        (false, true) => Some(TransactionEventType::Confirmed),
        (true, false) => Some(TransactionEventType::Unconfirmed),
        _ => None,
    }
}

// ── Manager ─────────────────────────────────────────────────────────

pub type UtxoEventHandler = Arc<dyn Fn(UtxoEvent) + Send + Sync>;
pub type TransactionEventHandler = Arc<dyn Fn(TransactionEvent) + Send + Sync>;
pub type WalletEventHandler = Arc<dyn Fn(WalletEvent) + Send + Sync>;

type Registry<K, H> = RwLock<HashMap<K, Vec<H>>>;

/// Holds the three repositories and dispatches their internal event streams
/// to the registered handlers.
///
/// One dispatcher task drains each stream; every handler invocation runs on
/// its own blocking-pool task so a slow handler holds up neither the
/// dispatcher nor the other handlers.
pub struct RepoManager {
    utxo_repo: Arc<dyn UtxoRepository>,
    tx_repo: Arc<dyn TransactionRepository>,
    wallet_repo: Arc<dyn WalletRepository>,
    utxo_handlers: Registry<UtxoEventType, UtxoEventHandler>,
    tx_handlers: Registry<TransactionEventType, TransactionEventHandler>,
    wallet_handlers: Registry<WalletEventType, WalletEventHandler>,
}

impl RepoManager {
    pub fn new(
        utxo_repo: Arc<dyn UtxoRepository>,
        tx_repo: Arc<dyn TransactionRepository>,
        wallet_repo: Arc<dyn WalletRepository>,
    ) -> Arc<Self> {
        Arc::new(Self {
            utxo_repo,
            tx_repo,
            wallet_repo,
            utxo_handlers: RwLock::new(HashMap::new()),
            tx_handlers: RwLock::new(HashMap::new()),
            wallet_handlers: RwLock::new(HashMap::new()),
        })
    }

    pub fn utxo_repository(&self) -> Arc<dyn UtxoRepository> {
        self.utxo_repo.clone()
    }

    pub fn transaction_repository(&self) -> Arc<dyn TransactionRepository> {
        self.tx_repo.clone()
    }

    pub fn wallet_repository(&self) -> Arc<dyn WalletRepository> {
        self.wallet_repo.clone()
    }

    pub fn register_handler_for_utxo_event<F>(&self, event_type: UtxoEventType, handler: F)
    where
        F: Fn(UtxoEvent) + Send + Sync + 'static,
    {
        register(&self.utxo_handlers, event_type, Arc::new(handler));
    }

    pub fn register_handler_for_tx_event<F>(&self, event_type: TransactionEventType, handler: F)
    where
        F: Fn(TransactionEvent) + Send + Sync + 'static,
    {
        register(&self.tx_handlers, event_type, Arc::new(handler));
    }

    pub fn register_handler_for_wallet_event<F>(&self, event_type: WalletEventType, handler: F)
    where
        F: Fn(WalletEvent) + Send + Sync + 'static,
    {
        register(&self.wallet_handlers, event_type, Arc::new(handler));
    }

    /// Spawns the dispatchers. Must be called from within a tokio runtime,
    /// and only once: the internal streams can be taken a single time.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Some(mut rx) = self.utxo_repo.events().take_internal() {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    for handler in handlers_for(&manager.utxo_handlers, &event.event_type) {
                        let event = event.clone();
                        tokio::task::spawn_blocking(move || handler(event));
                    }
                }
                log::debug!("repo manager: utxo event stream closed");
            }));
        }

        if let Some(mut rx) = self.tx_repo.events().take_internal() {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    for handler in handlers_for(&manager.tx_handlers, &event.event_type) {
                        let event = event.clone();
                        tokio::task::spawn_blocking(move || handler(event));
                    }
                }
                log::debug!("repo manager: transaction event stream closed");
            }));
        }

        if let Some(mut rx) = self.wallet_repo.events().take_internal() {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    for handler in handlers_for(&manager.wallet_handlers, &event.event_type) {
                        let event = event.clone();
                        tokio::task::spawn_blocking(move || handler(event));
                    }
                }
                log::debug!("repo manager: wallet event stream closed");
            }));
        }

        tasks
    }

    /// Closes the internal streams so the dispatchers terminate.
    pub fn close(&self) {
        self.utxo_repo.events().close();
        self.tx_repo.events().close();
        self.wallet_repo.events().close();
    }
}

fn register<K: std::hash::Hash + Eq, H>(registry: &Registry<K, H>, key: K, handler: H) {
    if let Ok(mut handlers) = registry.write() {
        handlers.entry(key).or_default().push(handler);
    }
}

fn handlers_for<K: std::hash::Hash + Eq, H: Clone>(registry: &Registry<K, H>, key: &K) -> Vec<H> {
    registry
        .read()
        .ok()
        .and_then(|handlers| handlers.get(key).cloned())
        .unwrap_or_default()
}
