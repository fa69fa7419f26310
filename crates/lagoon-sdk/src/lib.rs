pub mod chain;
pub mod chain_watcher;
pub mod coin_selector;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod fees;
pub mod inmemory;
pub mod keys;
pub mod network;
pub mod pset;
pub mod repository;
pub mod services;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Core types
pub use chain::{ChainObserver, ElectrumObserver};
pub use chain_watcher::ChainWatcherConfig;
pub use coin_selector::{CoinSelector, SmallestSubsetSelector};
pub use config::ServiceConfig;
pub use domain::{
    Account, AddressChain, AddressInfo, Balance, MnemonicCipher, MnemonicStore, Transaction,
    Utxo, UtxoInfo, UtxoKey, UtxoStatus, Wallet,
};
pub use error::{Error, Result};
pub use events::{
    EventBus, TransactionEvent, TransactionEventType, UtxoEvent, UtxoEventType, WalletEvent,
    WalletEventType,
};
pub use keys::{DerivedAddress, KeyDeriver, LwkKeyDeriver};
pub use network::Network;
pub use pset::{LwkPsetBackend, PsetBackend, TxInput, TxOutput};
pub use repository::{RepoManager, TransactionRepository, UtxoRepository, WalletRepository};
pub use services::{
    AccountService, NotificationService, TransactionService, WalletService, WalletStatus,
};

// Re-export LWK for app-layer use
pub use lwk_wollet;
