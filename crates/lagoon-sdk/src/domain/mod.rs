pub mod transaction;
pub mod utxo;
pub mod wallet;

pub use transaction::Transaction;
pub use utxo::{Balance, Utxo, UtxoInfo, UtxoKey, UtxoKeys, UtxoStatus, balance_by_asset};
pub use wallet::{Account, AddressChain, AddressInfo, MnemonicCipher, MnemonicStore, Wallet};
