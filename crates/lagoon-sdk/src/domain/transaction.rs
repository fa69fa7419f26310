use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A wallet-related transaction, as reported by the chain observer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub tx_hex: String,
    pub block_hash: String,
    pub block_height: u64,
    pub block_time: i64,
    /// Accounts involved in the transaction, either as sender or receiver.
    pub accounts: BTreeSet<String>,
}

impl Transaction {
    pub fn is_confirmed(&self) -> bool {
        !self.block_hash.is_empty()
    }

    pub fn confirm(&mut self, block_hash: &str, block_height: u64, block_time: i64) {
        if self.is_confirmed() {
            return;
        }
        self.block_hash = block_hash.to_string();
        self.block_height = block_height;
        self.block_time = block_time;
    }

    pub fn add_account(&mut self, account: &str) {
        self.accounts.insert(account.to_string());
    }

    pub fn has_accounts(&self, accounts: &BTreeSet<String>) -> bool {
        accounts.is_subset(&self.accounts)
    }

    pub fn accounts_list(&self) -> Vec<String> {
        self.accounts.iter().cloned().collect()
    }
}
