use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};

use crate::domain::Transaction;
use crate::error::{Error, Result};
use crate::events::{EventBus, TransactionEvent, TransactionEventType};
use crate::repository::{TransactionRepository, transaction_transition};

#[derive(Default)]
pub struct InMemoryTransactionRepository {
    transactions: RwLock<HashMap<String, Transaction>>,
    events: EventBus<TransactionEvent>,
}

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Transaction>>> {
        self.transactions
            .write()
            .map_err(|_| Error::Store("transaction map poisoned".to_string()))
    }

    fn publish(&self, event_type: TransactionEventType, transaction: Transaction) {
        self.events.publish(TransactionEvent {
            event_type,
            transaction,
        });
    }
}

impl TransactionRepository for InMemoryTransactionRepository {
    fn add_transaction(&self, tx: Transaction) -> Result<bool> {
        {
            let mut txs = self.write()?;
            if txs.contains_key(&tx.txid) {
                return Ok(false);
            }
            txs.insert(tx.txid.clone(), tx.clone());
        }
        self.publish(TransactionEventType::Added, tx);
        Ok(true)
    }

    fn confirm_transaction(
        &self,
        txid: &str,
        block_hash: &str,
        block_height: u64,
        block_time: i64,
    ) -> Result<bool> {
        let confirmed = {
            let mut txs = self.write()?;
            let tx = txs
                .get_mut(txid)
                .ok_or_else(|| Error::TransactionNotFound(txid.to_string()))?;
            if tx.is_confirmed() {
                return Ok(false);
            }
            tx.confirm(block_hash, block_height, block_time);
            tx.clone()
        };
        self.publish(TransactionEventType::Confirmed, confirmed);
        Ok(true)
    }

    fn get_transaction(&self, txid: &str) -> Result<Transaction> {
        self.transactions
            .read()
            .map_err(|_| Error::Store("transaction map poisoned".to_string()))?
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::TransactionNotFound(txid.to_string()))
    }

    fn update_transaction(
        &self,
        txid: &str,
        update: &mut dyn FnMut(&mut Transaction) -> Result<()>,
    ) -> Result<()> {
        let (before, after) = {
            let mut txs = self.write()?;
            let tx = txs
                .get_mut(txid)
                .ok_or_else(|| Error::TransactionNotFound(txid.to_string()))?;
            let mut updated = tx.clone();
            update(&mut updated)?;
            let before = std::mem::replace(tx, updated.clone());
            (before, updated)
        };
        if let Some(event_type) = transaction_transition(&before, &after) {
            self.publish(event_type, after);
        }
        Ok(())
    }

    fn events(&self) -> &EventBus<TransactionEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(txid: &str) -> Transaction {
        let mut tx = Transaction {
            txid: txid.to_string(),
            tx_hex: "00".to_string(),
            ..Default::default()
        };
        tx.add_account("main");
        tx
    }

    #[test]
    fn add_confirm_get() {
        let repo = InMemoryTransactionRepository::new();
        let mut rx = repo.events().take_internal().unwrap();

        assert!(repo.add_transaction(tx("t1")).unwrap());
        assert!(!repo.add_transaction(tx("t1")).unwrap());
        assert!(repo.confirm_transaction("t1", "h", 3, 4).unwrap());
        assert!(!repo.confirm_transaction("t1", "h2", 5, 6).unwrap());
        assert_eq!(repo.get_transaction("t1").unwrap().block_hash, "h");
        assert!(matches!(
            repo.get_transaction("nope"),
            Err(Error::TransactionNotFound(_))
        ));

        assert_eq!(rx.try_recv().unwrap().event_type, TransactionEventType::Added);
        assert_eq!(
            rx.try_recv().unwrap().event_type,
            TransactionEventType::Confirmed
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_update_leaves_transaction_untouched() {
        let repo = InMemoryTransactionRepository::new();
        repo.add_transaction(tx("t1")).unwrap();
        let res = repo.update_transaction("t1", &mut |tx| {
            tx.add_account("other");
            Err(Error::Validation("boom".to_string()))
        });
        assert!(res.is_err());
        assert_eq!(repo.get_transaction("t1").unwrap().accounts.len(), 1);

        repo.update_transaction("t1", &mut |tx| {
            tx.add_account("other");
            Ok(())
        })
        .unwrap();
        assert_eq!(repo.get_transaction("t1").unwrap().accounts.len(), 2);
    }
}
