pub mod transaction;
pub mod utxo;
pub mod wallet;

pub use transaction::{TransactionAccountRow, TransactionRow};
pub use utxo::{UtxoRow, UtxoStateChanges};
pub use wallet::{AccountRow, AccountScriptRow, WalletRow};
