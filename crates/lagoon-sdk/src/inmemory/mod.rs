//! In-memory implementations of the store contracts, used by tests and by the
//! daemon's `inmemory` database type.

mod mnemonic;
mod transaction;
mod utxo;
mod wallet;

pub use mnemonic::InMemoryMnemonicStore;
pub use transaction::InMemoryTransactionRepository;
pub use utxo::InMemoryUtxoRepository;
pub use wallet::InMemoryWalletRepository;
