use std::fs;
use std::sync::Arc;

use lagoon_sdk::inmemory::{
    InMemoryMnemonicStore, InMemoryTransactionRepository, InMemoryUtxoRepository,
    InMemoryWalletRepository,
};
use lagoon_sdk::{
    AccountService, ChainObserver, ElectrumObserver, LwkKeyDeriver, LwkPsetBackend,
    NotificationService, RepoManager, SmallestSubsetSelector, TransactionService, WalletService,
};
use lagoon_store::LagoonStore;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cipher::AesGcmCipher;
use crate::config::{DaemonConfig, DbType};
use crate::error::DaemonError;

/// The wired services of a running daemon.
pub struct Daemon {
    pub config: DaemonConfig,
    pub wallet: WalletService,
    pub accounts: Arc<AccountService>,
    pub transactions: Arc<TransactionService>,
    pub notifications: NotificationService,
    repo_manager: Arc<RepoManager>,
    chain: Arc<dyn ChainObserver>,
    dispatchers: Vec<JoinHandle<()>>,
    loggers: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Opens the stores, connects the chain observer, builds the services
    /// and starts the event dispatchers. Must be called from within a
    /// multi-threaded tokio runtime.
    pub fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        let repo_manager = open_repositories(&config)?;
        let network = config.network;

        let chain: Arc<dyn ChainObserver> = Arc::new(ElectrumObserver::new(config.watcher_config())?);
        let mnemonic_store = Arc::new(InMemoryMnemonicStore::new());
        let deriver = Arc::new(LwkKeyDeriver::new(network));

        let wallet = WalletService::new(
            repo_manager.clone(),
            chain.clone(),
            mnemonic_store.clone(),
            Arc::new(AesGcmCipher),
            network,
        );
        let accounts = AccountService::new(
            repo_manager.clone(),
            chain.clone(),
            deriver.clone(),
            mnemonic_store.clone(),
            config.service_config(),
        )?;
        let transactions = TransactionService::new(
            repo_manager.clone(),
            chain.clone(),
            Arc::new(LwkPsetBackend::new(network)),
            deriver,
            mnemonic_store,
            Arc::new(SmallestSubsetSelector::new()),
            config.service_config(),
        )?;
        let notifications = NotificationService::new(repo_manager.clone());

        let dispatchers = repo_manager.start();
        let loggers = spawn_notification_loggers(&notifications);

        let status = wallet.status();
        log::info!(
            "lagoond: started on {} (db: {:?}, electrum: {}, wallet initialized: {})",
            network,
            config.db_type,
            config.electrum_url(),
            status.initialized
        );

        Ok(Self {
            config,
            wallet,
            accounts,
            transactions,
            notifications,
            repo_manager,
            chain,
            dispatchers,
            loggers,
        })
    }

    /// Stops the chain observer, drains the dispatchers and stops logging
    /// notifications.
    pub async fn shutdown(self) {
        log::info!("lagoond: shutting down");
        self.chain.close();
        self.repo_manager.close();
        for task in self.dispatchers {
            let _ = task.await;
        }
        for task in self.loggers {
            task.abort();
        }
        log::info!("lagoond: stopped");
    }
}

fn open_repositories(config: &DaemonConfig) -> Result<Arc<RepoManager>, DaemonError> {
    match config.db_type {
        DbType::Inmemory => Ok(RepoManager::new(
            Arc::new(InMemoryUtxoRepository::new()),
            Arc::new(InMemoryTransactionRepository::new()),
            Arc::new(InMemoryWalletRepository::new()),
        )),
        DbType::Sqlite => {
            fs::create_dir_all(config.network_dir())?;
            let path = config.db_path();
            let store = Arc::new(LagoonStore::open(&path.to_string_lossy())?);
            log::info!("lagoond: opened database {}", path.display());
            Ok(RepoManager::new(store.clone(), store.clone(), store))
        }
    }
}

fn spawn_notification_loggers(notifications: &NotificationService) -> Vec<JoinHandle<()>> {
    let mut utxo_rx = notifications.utxo_notifications();
    let mut tx_rx = notifications.tx_notifications();

    let utxos = tokio::spawn(async move {
        loop {
            match utxo_rx.recv().await {
                Ok(event) => {
                    for utxo in &event.utxos {
                        log::info!(
                            "lagoond: utxo {:?} {} account={} value={}",
                            event.event_type,
                            utxo.key,
                            utxo.account_name,
                            utxo.value
                        );
                    }
                }
                Err(RecvError::Lagged(n)) => log::warn!("lagoond: missed {n} utxo notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let transactions = tokio::spawn(async move {
        loop {
            match tx_rx.recv().await {
                Ok(event) => log::info!(
                    "lagoond: tx {:?} {} accounts={:?}",
                    event.event_type,
                    event.transaction.txid,
                    event.transaction.accounts
                ),
                Err(RecvError::Lagged(n)) => log::warn!("lagoond: missed {n} tx notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    vec![utxos, transactions]
}
